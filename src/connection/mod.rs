//! Voice connection orchestrator
//!
//! Owns the signalling subscription, the peer session map, the admission
//! machinery and the media pipelines. All state mutation happens on the
//! orchestrator's event tasks; sessions and pacers communicate with it only
//! through channels.

pub mod admission;

use crate::clock::{after, FrameClock};
use crate::config::{VoiceConfig, VoiceIdentity};
use crate::media::decoder::{self, DecoderEvent, DecoderHandle, DecoderJob, FrameRing, MediaInput, OutputFormat};
use crate::media::effects::AudioEffect;
use crate::media::pacer::{BufferStatus, Pacer, PacerEvent, PacerSpec};
use crate::media::{MediaKind, MediaSource, AUDIO_FRAME_BYTES, AUDIO_RING_FRAMES, VIDEO_RING_FRAMES};
use crate::peer::{PeerFactory, PeerSession, SessionContext, SessionEvent};
use crate::signaling::events::{
    DescriptionBody, ForceReconnectPayload, HeartbeatPayload, InboundCandidatePayload,
    InboundDescriptionPayload, JoinPayload, SessionDescription, VideoShareKind, VideoStatePayload,
};
use crate::signaling::{BusEvent, InboundSignal, OutboundSignal, SignalingBus};
use crate::{Error, Result};
use admission::{
    batch_sizes, participant_delay, single_join_delay, tier_for, AdmissionQueue,
    MASS_JOIN_BATCH_INTERVAL, MASS_JOIN_COOLDOWN,
};
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Heartbeat interval while joined
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Time a dial holds one of the tier's concurrency slots
const NEGOTIATION_SLOT: Duration = Duration::from_secs(3);

/// Fallback before audio starts when no peer connects
const AUDIO_START_FALLBACK: Duration = Duration::from_secs(3);

/// Fallback before video starts when no frame decodes
const VIDEO_FRAME_WAIT: Duration = Duration::from_millis(2500);

/// Poll interval while waiting for the first decoded video frame
const VIDEO_FRAME_POLL: Duration = Duration::from_millis(50);

/// Lead time of a shared start barrier
const START_BARRIER_LEAD: Duration = Duration::from_millis(120);

/// Spacing between re-queued peers after a transport reconnect
const RECONNECT_REQUEUE_SPACING: Duration = Duration::from_millis(1500);

/// Options for audio playback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayOptions {
    /// Respawn the decoder when the input ends
    pub looping: bool,
    /// Effect applied via the decoder filter chain
    pub effect: AudioEffect,
}

/// Options for video playback
#[derive(Debug, Clone, PartialEq)]
pub struct VideoOptions {
    /// Respawn the decoder when the input ends
    pub looping: bool,
    /// Camera vs screen share, selecting the announce event
    pub kind: VideoShareKind,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            looping: false,
            kind: VideoShareKind::Screen,
        }
    }
}

/// User-visible notifications
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// A peer session reached `connected`
    PeerConnected { peer_id: String },
    /// A peer left or its session ended
    PeerLeft { peer_id: String },
    /// Playback drained after a clean decoder exit
    PlaybackFinished { kind: MediaKind },
    /// Terminal playback failure
    PlaybackError { kind: MediaKind, message: String },
    /// The pacer detected an emission gap
    Stutter { kind: MediaKind, gap: Duration },
}

struct Pipeline {
    pacer: Arc<Pacer>,
    decoder: Arc<DecoderHandle>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct MediaState {
    audio_source: Option<MediaSource>,
    video_source: Option<MediaSource>,
    video_kind: Option<VideoShareKind>,
    audio: Option<Pipeline>,
    video: Option<Pipeline>,
}

struct Inner {
    identity: VoiceIdentity,
    config: VoiceConfig,
    bus: Arc<dyn SignalingBus>,
    factory: Arc<dyn PeerFactory>,
    clock: Arc<dyn FrameClock>,
    cancel: std::sync::Mutex<CancellationToken>,
    joined: AtomicBool,
    peers: RwLock<HashMap<String, Arc<PeerSession>>>,
    priority: RwLock<HashSet<String>>,
    admission: AsyncMutex<AdmissionQueue>,
    active_negotiations: AtomicUsize,
    pumping: AtomicBool,
    mass_join_until: std::sync::Mutex<Option<Instant>>,
    media: AsyncMutex<MediaState>,
    session_ctx: RwLock<Option<SessionContext>>,
    voice_events_tx: mpsc::UnboundedSender<VoiceEvent>,
    voice_events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<VoiceEvent>>>,
    peer_connected: Notify,
    last_video_announce: std::sync::Mutex<Option<String>>,
}

/// A bot's connection to one voice channel
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct VoiceConnection {
    inner: Arc<Inner>,
}

impl VoiceConnection {
    /// Create a connection bound to a channel identity
    ///
    /// Nothing is sent until [`join`](Self::join).
    pub fn new(
        identity: VoiceIdentity,
        config: VoiceConfig,
        bus: Arc<dyn SignalingBus>,
        factory: Arc<dyn PeerFactory>,
        clock: Arc<dyn FrameClock>,
    ) -> Result<Self> {
        config.validate()?;

        let (voice_events_tx, voice_events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                config,
                bus,
                factory,
                clock,
                cancel: std::sync::Mutex::new(CancellationToken::new()),
                joined: AtomicBool::new(false),
                peers: RwLock::new(HashMap::new()),
                priority: RwLock::new(HashSet::new()),
                admission: AsyncMutex::new(AdmissionQueue::new()),
                active_negotiations: AtomicUsize::new(0),
                pumping: AtomicBool::new(false),
                mass_join_until: std::sync::Mutex::new(None),
                media: AsyncMutex::new(MediaState::default()),
                session_ctx: RwLock::new(None),
                voice_events_tx,
                voice_events_rx: std::sync::Mutex::new(Some(voice_events_rx)),
                peer_connected: Notify::new(),
                last_video_announce: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Take the user-visible event stream; `None` after the first call
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<VoiceEvent>> {
        self.inner.voice_events_rx.lock().unwrap().take()
    }

    /// Channel this connection is bound to
    pub fn channel_id(&self) -> &str {
        &self.inner.identity.channel_id
    }

    /// Server hosting the channel
    pub fn server_id(&self) -> &str {
        &self.inner.identity.server_id
    }

    /// True while joined to the channel
    pub fn connected(&self) -> bool {
        self.inner.joined.load(Ordering::Acquire)
    }

    /// Number of peer sessions (any state)
    pub async fn peer_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Number of sessions that announced `connected`
    pub async fn connected_peer_count(&self) -> usize {
        let peers = self.inner.peers.read().await;
        peers.values().filter(|s| s.is_connected()).count()
    }

    /// Outbound dials currently holding a concurrency slot
    pub fn negotiations_in_flight(&self) -> usize {
        self.inner.active_negotiations.load(Ordering::Acquire)
    }

    /// Audio pacer telemetry, when audio is playing
    pub async fn audio_status(&self) -> Option<BufferStatus> {
        let media = self.inner.media.lock().await;
        media.audio.as_ref().map(|p| p.pacer.buffer_status())
    }

    /// Video pacer telemetry, when video is playing
    pub async fn video_status(&self) -> Option<BufferStatus> {
        let media = self.inner.media.lock().await;
        media.video.as_ref().map(|p| p.pacer.buffer_status())
    }

    /// Priority peers bypass the connected-peer cap
    pub async fn set_peer_priority(&self, peer_id: &str, is_priority: bool) {
        let mut priority = self.inner.priority.write().await;
        if is_priority {
            priority.insert(peer_id.to_string());
        } else {
            priority.remove(peer_id);
        }
    }

    /// Register listeners, announce the join and start the heartbeat
    pub async fn join(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.joined.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyActive("already joined".to_string()));
        }

        info!(
            channel = %inner.identity.channel_id,
            peer = %inner.identity.peer_id,
            "Joining voice channel"
        );

        let cancel = CancellationToken::new();
        *inner.cancel.lock().unwrap() = cancel.clone();

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        *inner.session_ctx.write().await = Some(SessionContext {
            local_id: inner.identity.peer_id.clone(),
            channel_id: inner.identity.channel_id.clone(),
            bus: Arc::clone(&inner.bus),
            clock: Arc::clone(&inner.clock),
            factory: Arc::clone(&inner.factory),
            session_events: session_tx,
        });

        let bus_rx = inner.bus.subscribe();
        let task = Arc::clone(inner);
        let task_cancel = cancel.clone();
        tokio::spawn(async move { task.event_loop(bus_rx, task_cancel).await });

        let task = Arc::clone(inner);
        let task_cancel = cancel.clone();
        tokio::spawn(async move { task.session_loop(session_rx, task_cancel).await });

        inner
            .bus
            .send(OutboundSignal::Join(JoinPayload {
                channel_id: inner.identity.channel_id.clone(),
                server_id: inner.identity.server_id.clone(),
                peer_id: inner.identity.peer_id.clone(),
            }))
            .await?;

        let task = Arc::clone(inner);
        tokio::spawn(async move { task.heartbeat_loop(cancel).await });

        Ok(())
    }

    /// Stop media, destroy every session, clear admission state and
    /// announce the leave
    ///
    /// After this returns the instance holds no timers, no subprocesses and
    /// no listeners. Idempotent.
    pub async fn leave(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.joined.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        info!(channel = %inner.identity.channel_id, "Leaving voice channel");
        inner.cancel.lock().unwrap().cancel();

        inner.stop_audio_pipeline().await;
        inner.stop_video_pipeline(true).await;

        let sessions: Vec<Arc<PeerSession>> = {
            let mut peers = inner.peers.write().await;
            peers.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close().await;
        }

        inner.admission.lock().await.clear();
        inner.active_negotiations.store(0, Ordering::Release);
        inner.pumping.store(false, Ordering::Release);
        *inner.mass_join_until.lock().unwrap() = None;
        *inner.last_video_announce.lock().unwrap() = None;
        *inner.session_ctx.write().await = None;

        {
            let mut media = inner.media.lock().await;
            media.audio_source = None;
        }

        inner
            .bus
            .send(OutboundSignal::Leave {
                channel_id: inner.identity.channel_id.clone(),
            })
            .await?;

        Ok(())
    }

    /// Decode a local container file to PCM and stream it to every peer
    ///
    /// Resolves as soon as the decoder is primed; completion arrives as a
    /// [`VoiceEvent::PlaybackFinished`].
    pub async fn play_file(&self, path: impl Into<PathBuf>, options: PlayOptions) -> Result<()> {
        self.inner
            .play_audio(MediaInput::File(path.into()), options)
            .await
    }

    /// Decode an HTTP(S) stream to PCM and stream it to every peer
    pub async fn play_url(&self, url: &str, options: PlayOptions) -> Result<()> {
        self.inner
            .play_audio(MediaInput::Http(url.to_string()), options)
            .await
    }

    /// Decode a file or URL to raw video and stream it to every peer
    pub async fn play_video(&self, location: &str, options: VideoOptions) -> Result<()> {
        let input = if location.starts_with("http://") || location.starts_with("https://") {
            MediaInput::Http(location.to_string())
        } else {
            MediaInput::File(PathBuf::from(location))
        };
        self.inner.start_video(input, options).await
    }

    /// Stop audio playback; idempotent
    pub async fn stop_audio(&self) {
        self.inner.stop_audio_pipeline().await;
    }

    /// Stop video playback and retract the video track; idempotent
    pub async fn stop_video(&self) {
        self.inner.stop_video_pipeline(true).await;
    }

    /// Adjust audio playback volume
    pub async fn set_volume(&self, volume: f32) {
        let media = self.inner.media.lock().await;
        if let Some(audio) = &media.audio {
            audio.pacer.set_volume(volume);
        }
    }
}

impl Inner {
    fn root_cancel(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    /// Free one negotiation slot; counters reset elsewhere never underflow
    fn release_slot(&self) {
        let _ = self
            .active_negotiations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
    }

    fn voice_event(&self, event: VoiceEvent) {
        let _ = self.voice_events_tx.send(event);
    }

    fn mass_join_active(&self) -> bool {
        self.mass_join_until
            .lock()
            .unwrap()
            .map(|until| self.clock.now() < until)
            .unwrap_or(false)
    }

    async fn current_load(&self) -> usize {
        self.peers.read().await.len() + self.admission.lock().await.len()
    }

    // ===== signalling event dispatch =====

    async fn event_loop(
        self: Arc<Self>,
        mut bus_rx: mpsc::UnboundedReceiver<BusEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = bus_rx.recv() => match event {
                    None => return,
                    Some(BusEvent::Reconnected) => self.handle_transport_reconnect().await,
                    Some(BusEvent::Signal(signal)) => {
                        if let Some(channel) = signal.channel_id() {
                            if channel != self.identity.channel_id {
                                continue;
                            }
                        }
                        self.handle_signal(signal).await;
                    }
                },
            }
        }
    }

    async fn handle_signal(self: &Arc<Self>, signal: InboundSignal) {
        match signal {
            InboundSignal::Participants(p) => self.handle_participants(p.participants).await,
            InboundSignal::UserJoined(u) => self.schedule_single_join(u.id).await,
            InboundSignal::UserLeft(u) => self.handle_user_left(&u.id).await,
            InboundSignal::Offer(p) => {
                if let Err(e) = self.handle_inbound_offer(p).await {
                    if !e.is_silent() {
                        warn!("Inbound offer failed: {e}");
                    }
                }
            }
            InboundSignal::Answer(p) => self.handle_inbound_answer(p).await,
            InboundSignal::IceCandidate(p) => {
                if let Err(e) = self.handle_inbound_candidate(p).await {
                    if !e.is_silent() {
                        warn!("Inbound candidate failed: {e}");
                    }
                }
            }
            InboundSignal::ForceReconnect(p) => self.handle_force_reconnect(p).await,
            InboundSignal::ResyncRequest(p) => self.handle_resync_request(&p.from).await,
        }
    }

    async fn handle_participants(self: &Arc<Self>, participants: Vec<String>) {
        let list: Vec<String> = participants
            .into_iter()
            .filter(|p| p != &self.identity.peer_id)
            .collect();
        if list.is_empty() {
            return;
        }

        let load = self.current_load().await + list.len();
        let tier = tier_for(load);
        info!(count = list.len(), tier_max = tier.max_peers, "Participant list received");

        if list.len() <= tier.max_peers {
            for (index, peer_id) in list.into_iter().enumerate() {
                self.schedule_admission(peer_id, participant_delay(index, tier));
            }
            return;
        }

        // Oversized list: release in batches and flag the mass join.
        let sizes = batch_sizes(list.len(), tier);
        let batch_count = sizes.len();
        let largest = sizes.first().copied().unwrap_or(0);
        let span = MASS_JOIN_BATCH_INTERVAL * (batch_count.saturating_sub(1)) as u32
            + tier.stagger_base
            + tier.stagger_per_peer * largest.saturating_sub(1) as u32;
        *self.mass_join_until.lock().unwrap() = Some(self.clock.now() + span + MASS_JOIN_COOLDOWN);
        info!(batches = batch_count, "Mass join in progress");

        let mut iter = list.into_iter();
        for (batch_index, size) in sizes.into_iter().enumerate() {
            let offset = MASS_JOIN_BATCH_INTERVAL * batch_index as u32;
            for (index, peer_id) in iter.by_ref().take(size).enumerate() {
                self.schedule_admission(peer_id, offset + participant_delay(index, tier));
            }
        }
    }

    async fn schedule_single_join(self: &Arc<Self>, peer_id: String) {
        if peer_id == self.identity.peer_id {
            return;
        }
        let tier = tier_for(self.current_load().await + 1);
        let peer_count = self.peers.read().await.len();
        let delay = single_join_delay(peer_count, tier);
        debug!(peer = %peer_id, ?delay, "Scheduling admission for joiner");
        self.schedule_admission(peer_id, delay);
    }

    fn schedule_admission(self: &Arc<Self>, peer_id: String, delay: Duration) {
        let inner = Arc::clone(self);
        let cancel = self.root_cancel();
        tokio::spawn(async move {
            if !after(inner.clock.as_ref(), delay, &cancel).await {
                return;
            }
            inner.request_admission(&peer_id).await;
        });
    }

    async fn handle_user_left(self: &Arc<Self>, peer_id: &str) {
        self.admission.lock().await.remove(peer_id);
        let session = self.peers.write().await.remove(peer_id);
        if let Some(session) = session {
            info!(peer = %peer_id, "Peer left the channel");
            session.close().await;
            self.voice_event(VoiceEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            });
        }
    }

    async fn handle_inbound_offer(self: &Arc<Self>, payload: InboundDescriptionPayload) -> Result<()> {
        let description = description_of(payload.description);
        let session = self.get_or_create_session(&payload.from).await?;
        session.handle_offer(description).await
    }

    async fn handle_inbound_answer(self: &Arc<Self>, payload: InboundDescriptionPayload) {
        let description = description_of(payload.description);
        let session = self.peers.read().await.get(&payload.from).cloned();
        match session {
            Some(session) => {
                if let Err(e) = session.handle_answer(description).await {
                    warn!(peer = %payload.from, "Answer handling failed: {e}");
                }
            }
            None => debug!(peer = %payload.from, "Answer for unknown peer dropped"),
        }
    }

    async fn handle_inbound_candidate(
        self: &Arc<Self>,
        payload: InboundCandidatePayload,
    ) -> Result<()> {
        let session = self.get_or_create_session(&payload.from).await?;
        session.handle_candidate(payload.candidate).await
    }

    async fn handle_force_reconnect(self: &Arc<Self>, payload: ForceReconnectPayload) {
        let target = payload.target_peer.as_str();
        let reason = payload.reason.as_deref().unwrap_or("unspecified");

        if target == "*" || target == "all" {
            // A broadcast reconnect is for everyone else; reacting to it
            // here would amplify the storm that likely caused it.
            debug!(reason, "Ignoring broadcast force-reconnect");
            return;
        }

        if target == self.identity.peer_id {
            info!(reason, "Force-reconnect: rebuilding every session");
            let ids: Vec<String> = {
                let mut peers = self.peers.write().await;
                let ids = peers.keys().cloned().collect();
                for (_, session) in peers.drain() {
                    session.close().await;
                }
                ids
            };
            let mut admission = self.admission.lock().await;
            for id in ids {
                admission.enqueue(&id);
            }
            drop(admission);
            self.pump();
            return;
        }

        info!(peer = %target, reason, "Force-reconnect for one peer");
        let session = self.peers.write().await.remove(target);
        if let Some(session) = session {
            session.close().await;
        }
        self.admission.lock().await.enqueue(target);
        self.pump();
    }

    async fn handle_resync_request(self: &Arc<Self>, from: &str) {
        debug!(peer = %from, "Resync requested");
        self.resync_video_to_audio().await;
        let session = self.peers.read().await.get(from).cloned();
        if let Some(session) = session {
            session.restart_ice().await;
        }
    }

    async fn handle_transport_reconnect(self: &Arc<Self>) {
        if !self.joined.load(Ordering::Acquire) {
            return;
        }
        info!("Signalling transport reconnected, restoring channel state");

        let known: Vec<String> = {
            let mut peers = self.peers.write().await;
            let ids: Vec<String> = peers.keys().cloned().collect();
            for (_, session) in peers.drain() {
                session.close().await;
            }
            ids
        };
        self.admission.lock().await.clear();
        self.active_negotiations.store(0, Ordering::Release);

        let _ = self
            .bus
            .send(OutboundSignal::Join(JoinPayload {
                channel_id: self.identity.channel_id.clone(),
                server_id: self.identity.server_id.clone(),
                peer_id: self.identity.peer_id.clone(),
            }))
            .await;
        let _ = self
            .bus
            .send(OutboundSignal::Heartbeat(HeartbeatPayload {
                channel_id: self.identity.channel_id.clone(),
            }))
            .await;

        for (index, peer_id) in known.into_iter().enumerate() {
            self.schedule_admission(peer_id, RECONNECT_REQUEUE_SPACING * index as u32);
        }

        let video_kind = {
            let media = self.media.lock().await;
            media.video.as_ref().and(media.video_kind)
        };
        if let Some(kind) = video_kind {
            // The announce key is cleared so transport churn re-emits it.
            *self.last_video_announce.lock().unwrap() = None;
            self.announce_video_state(kind, true).await;
        }
    }

    // ===== admission =====

    async fn request_admission(self: &Arc<Self>, peer_id: &str) {
        if peer_id == self.identity.peer_id {
            return;
        }

        let is_priority = self.priority.read().await.contains(peer_id);
        {
            let peers = self.peers.read().await;
            if peers.len() >= self.config.max_connected_peers && !is_priority {
                debug!(peer = %peer_id, "Admission rejected: at capacity");
                return;
            }
            if let Some(session) = peers.get(peer_id) {
                if session.is_busy().await {
                    debug!(peer = %peer_id, "Admission skipped: session active");
                    return;
                }
            }
        }

        let tier = tier_for(self.current_load().await + 1);
        let mut admission = self.admission.lock().await;
        let now = self.clock.now();
        if !admission.cooldown_elapsed(peer_id, now, tier.cooldown) {
            debug!(peer = %peer_id, "Admission dropped: cooldown");
            return;
        }
        if !admission.enqueue(peer_id) {
            return;
        }
        drop(admission);
        self.pump();
    }

    /// Single-flight queue pump bounded by the tier's concurrency budget
    fn pump(self: &Arc<Self>) {
        if self.pumping.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                inner.run_pump().await;
                inner.pumping.store(false, Ordering::Release);

                // An enqueue that raced the shutdown of this pump would
                // otherwise strand its peer until the next trigger.
                let queued = !inner.admission.lock().await.is_empty();
                if !queued {
                    break;
                }
                let tier = tier_for(inner.current_load().await);
                if inner.active_negotiations.load(Ordering::Acquire) >= tier.concurrent {
                    break;
                }
                if inner.pumping.swap(true, Ordering::AcqRel) {
                    break;
                }
            }
        });
    }

    async fn run_pump(self: &Arc<Self>) {
        let cancel = self.root_cancel();
        loop {
            if cancel.is_cancelled() || !self.joined.load(Ordering::Acquire) {
                return;
            }

            let tier = tier_for(self.current_load().await);
            if self.active_negotiations.load(Ordering::Acquire) >= tier.concurrent {
                return;
            }

            let next = {
                let mut admission = self.admission.lock().await;
                admission.pop()
            };
            let Some(peer_id) = next else { return };

            // Gates may have changed while the peer sat in the queue.
            let is_priority = self.priority.read().await.contains(&peer_id);
            {
                let peers = self.peers.read().await;
                if peers.len() >= self.config.max_connected_peers && !is_priority {
                    debug!(peer = %peer_id, "Dial dropped: at capacity");
                    continue;
                }
                if let Some(session) = peers.get(&peer_id) {
                    if session.is_busy().await {
                        continue;
                    }
                }
            }

            self.active_negotiations.fetch_add(1, Ordering::AcqRel);
            self.admission
                .lock()
                .await
                .record_attempt(&peer_id, self.clock.now());

            match self.create_session(&peer_id).await {
                Ok(_) => debug!(peer = %peer_id, "Dialing"),
                Err(e) => warn!(peer = %peer_id, "Dial failed: {e}"),
            }

            // The slot frees after a fixed window whether or not the
            // negotiation completed; completion itself is observed via the
            // session's connected announce.
            let slot = Arc::clone(self);
            let slot_cancel = cancel.clone();
            tokio::spawn(async move {
                if !after(slot.clock.as_ref(), NEGOTIATION_SLOT, &slot_cancel).await {
                    return;
                }
                slot.release_slot();
                slot.pump();
            });

            if !after(self.clock.as_ref(), tier.stagger_per_peer, &cancel).await {
                return;
            }
        }
    }

    async fn get_or_create_session(self: &Arc<Self>, peer_id: &str) -> Result<Arc<PeerSession>> {
        if let Some(session) = self.peers.read().await.get(peer_id).cloned() {
            return Ok(session);
        }

        let is_priority = self.priority.read().await.contains(peer_id);
        if self.peers.read().await.len() >= self.config.max_connected_peers && !is_priority {
            return Err(Error::CapacityExceeded(peer_id.to_string()));
        }

        self.create_session(peer_id).await
    }

    async fn create_session(self: &Arc<Self>, peer_id: &str) -> Result<Arc<PeerSession>> {
        let ctx = self
            .session_ctx
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::TransportDisconnected("not joined".to_string()))?;

        let old = self.peers.write().await.remove(peer_id);
        if let Some(old) = old {
            old.close().await;
        }

        let cancel = self.root_cancel();
        let session = PeerSession::connect(&ctx, peer_id, &cancel).await?;

        // The shared audio track rides on every session; adding it raises
        // negotiation_needed and with it the initial offer.
        let audio = self.ensure_audio_source().await?;
        session.attach_audio(audio.track()).await?;

        self.peers
            .write()
            .await
            .insert(peer_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    // ===== session lifecycle =====

    async fn session_loop(
        self: Arc<Self>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = session_rx.recv() => match event {
                    None => return,
                    Some(SessionEvent::Connected { peer_id }) => {
                        self.voice_event(VoiceEvent::PeerConnected { peer_id: peer_id.clone() });
                        self.peer_connected.notify_waiters();
                        self.on_peer_connected(&peer_id).await;
                    }
                    Some(SessionEvent::Ended { peer_id, state }) => {
                        debug!(peer = %peer_id, state = state.label(), "Session ended");
                        let session = self.peers.write().await.remove(&peer_id);
                        if let Some(session) = session {
                            session.close().await;
                            self.voice_event(VoiceEvent::PeerLeft { peer_id });
                        }
                    }
                },
            }
        }
    }

    async fn on_peer_connected(self: &Arc<Self>, peer_id: &str) {
        let video_source = {
            let media = self.media.lock().await;
            media.video_source.clone()
        };
        let Some(video_source) = video_source else {
            return;
        };

        let session = self.peers.read().await.get(peer_id).cloned();
        if let Some(session) = session {
            if !session.has_video().await {
                if let Err(e) = session.attach_video(video_source.track()).await {
                    warn!(peer = %peer_id, "Video attach failed: {e}");
                }
            }
        }

        // Align the late joiner's first frames, unless a crowd is still
        // pouring in.
        if !self.mass_join_active() {
            self.resync_video_to_audio().await;
        }
    }

    // ===== media =====

    async fn ensure_audio_source(self: &Arc<Self>) -> Result<MediaSource> {
        let mut media = self.media.lock().await;
        if let Some(source) = &media.audio_source {
            return Ok(source.clone());
        }
        let track = self
            .factory
            .create_track(MediaKind::Audio, "voicemesh-audio")?;
        let source = MediaSource::new(track);
        media.audio_source = Some(source.clone());
        Ok(source)
    }

    async fn play_audio(self: &Arc<Self>, input: MediaInput, options: PlayOptions) -> Result<()> {
        if !self.joined.load(Ordering::Acquire) {
            return Err(Error::TransportDisconnected("not joined".to_string()));
        }
        if let MediaInput::File(path) = &input {
            if !path.exists() {
                return Err(Error::DecoderFileMissing(path.display().to_string()));
            }
        }

        self.stop_audio_pipeline().await;
        let source = self.ensure_audio_source().await?;

        let spec = if input.is_http() || options.looping {
            PacerSpec::audio_stream()
        } else {
            PacerSpec::audio_file()
        };
        let job = DecoderJob {
            input,
            output: OutputFormat::Pcm,
            looping: options.looping,
            filter: options.effect.filter_chain(),
        };

        let pipe_cancel = self.root_cancel().child_token();
        let ring = Arc::new(FrameRing::new(AUDIO_FRAME_BYTES, AUDIO_RING_FRAMES));
        let (decoder, decoder_events) = decoder::start(
            self.config.decoder.clone(),
            job,
            Arc::clone(&ring),
            Arc::clone(&self.clock),
            &pipe_cancel,
        );
        let (pacer, pacer_events) = Pacer::new(
            spec,
            ring,
            source.sink(),
            Arc::clone(&self.clock),
            &pipe_cancel,
        );
        pacer.prime();

        {
            let mut media = self.media.lock().await;
            media.audio = Some(Pipeline {
                pacer: Arc::clone(&pacer),
                decoder: Arc::new(decoder),
                cancel: pipe_cancel.clone(),
            });
        }

        self.spawn_media_forwarders(MediaKind::Audio, decoder_events, pacer_events, &pipe_cancel);

        // Release on first connected peer, or after the fallback window in
        // an empty channel.
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            // notify_waiters stores no permit: interest must be registered
            // before the connected check, or a peer connecting in between
            // is missed.
            let notified = inner.peer_connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let already_connected = {
                let peers = inner.peers.read().await;
                peers.values().any(|s| s.is_connected())
            };
            if !already_connected {
                tokio::select! {
                    _ = pipe_cancel.cancelled() => return,
                    _ = &mut notified => {}
                    _ = inner.clock.sleep(AUDIO_START_FALLBACK) => {
                        debug!("Audio start fallback elapsed");
                    }
                }
            }
            inner.release_audio_start().await;
        });

        Ok(())
    }

    async fn release_audio_start(self: &Arc<Self>) {
        let video_active = {
            let media = self.media.lock().await;
            media.video.is_some()
        };
        if video_active {
            self.resync_video_to_audio().await;
            return;
        }
        let media = self.media.lock().await;
        if let Some(audio) = &media.audio {
            audio.pacer.unpause(None);
        }
    }

    /// Create a fresh video source for a starting playback
    ///
    /// Sessions that already carry a video sender get the new track via
    /// `replace_track`, so back-to-back playbacks never double-wire a peer.
    async fn create_video_source(self: &Arc<Self>) -> Result<MediaSource> {
        let track = self.factory.create_track(
            MediaKind::Video,
            &format!("voicemesh-video-{}", uuid::Uuid::new_v4()),
        )?;
        let source = MediaSource::new(track);
        {
            let mut media = self.media.lock().await;
            media.video_source = Some(source.clone());
        }

        // Wire the track to everyone already connected; later joiners get
        // it on their connected announce.
        let sessions: Vec<Arc<PeerSession>> = {
            let peers = self.peers.read().await;
            peers.values().filter(|s| s.is_connected()).cloned().collect()
        };
        for session in sessions {
            if let Err(e) = session.attach_video(source.track()).await {
                warn!(peer = %session.remote_id(), "Video attach failed: {e}");
            }
        }

        Ok(source)
    }

    async fn start_video(self: &Arc<Self>, input: MediaInput, options: VideoOptions) -> Result<()> {
        if !self.joined.load(Ordering::Acquire) {
            return Err(Error::TransportDisconnected("not joined".to_string()));
        }

        // Waiting for clean shutdown here keeps a dying decoder's close
        // event from bleeding into the new playback.
        self.stop_video_pipeline(false).await;

        let canvas = self.config.video;
        let fps = decoder::probe_fps(&self.config.decoder, &input)
            .await
            .unwrap_or(canvas.default_fps as f64);

        let source = self.create_video_source().await?;
        let job = DecoderJob {
            input,
            output: OutputFormat::RawVideo {
                width: canvas.width,
                height: canvas.height,
                fps,
            },
            looping: options.looping,
            filter: None,
        };

        let pipe_cancel = self.root_cancel().child_token();
        let ring = Arc::new(FrameRing::new(
            crate::media::video_frame_bytes(canvas.width, canvas.height),
            VIDEO_RING_FRAMES,
        ));
        let (decoder_handle, decoder_events) = decoder::start(
            self.config.decoder.clone(),
            job,
            Arc::clone(&ring),
            Arc::clone(&self.clock),
            &pipe_cancel,
        );
        let (pacer, pacer_events) = Pacer::new(
            PacerSpec::video(fps),
            Arc::clone(&ring),
            source.sink(),
            Arc::clone(&self.clock),
            &pipe_cancel,
        );
        pacer.prime();

        {
            let mut media = self.media.lock().await;
            media.video = Some(Pipeline {
                pacer: Arc::clone(&pacer),
                decoder: Arc::new(decoder_handle),
                cancel: pipe_cancel.clone(),
            });
            media.video_kind = Some(options.kind);
        }

        self.spawn_media_forwarders(MediaKind::Video, decoder_events, pacer_events, &pipe_cancel);
        self.announce_video_state(options.kind, true).await;

        // Both pacers release once at least one video frame decoded, or
        // after the fallback.
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let deadline = inner.clock.now() + VIDEO_FRAME_WAIT;
            while ring.is_empty() && inner.clock.now() < deadline {
                if !after(inner.clock.as_ref(), VIDEO_FRAME_POLL, &pipe_cancel).await {
                    return;
                }
            }
            inner.resync_video_to_audio().await;
        });

        Ok(())
    }

    /// Pause both pacers, realign the video frame counter to the audio
    /// position and release them on a shared barrier
    async fn resync_video_to_audio(self: &Arc<Self>) {
        let media = self.media.lock().await;
        let barrier = self.clock.now() + START_BARRIER_LEAD;
        match (&media.audio, &media.video) {
            (Some(audio), Some(video)) => {
                let position = audio.pacer.position();
                audio.pacer.pause();
                video.pacer.pause();
                video.pacer.resync(Some(position));
                audio.pacer.unpause(Some(barrier));
                video.pacer.unpause(Some(barrier));
                debug!(?position, "Pacers realigned on a shared barrier");
            }
            (None, Some(video)) => {
                video.pacer.unpause(Some(barrier));
            }
            (Some(audio), None) => {
                audio.pacer.unpause(Some(barrier));
            }
            (None, None) => {}
        }
    }

    async fn stop_audio_pipeline(&self) {
        let pipeline = {
            let mut media = self.media.lock().await;
            media.audio.take()
        };
        if let Some(pipeline) = pipeline {
            pipeline.pacer.stop();
            pipeline.decoder.stop().await;
            pipeline.cancel.cancel();
        }
    }

    async fn stop_video_pipeline(self: &Arc<Self>, drop_source: bool) {
        let (pipeline, source, kind) = {
            let mut media = self.media.lock().await;
            let pipeline = media.video.take();
            let kind = media.video_kind;
            let source = if drop_source {
                media.video_kind = None;
                media.video_source.take()
            } else {
                None
            };
            (pipeline, source, kind)
        };

        if let Some(pipeline) = pipeline {
            pipeline.pacer.stop();
            pipeline.decoder.stop().await;
            pipeline.cancel.cancel();
        }

        if drop_source {
            if let Some(source) = source {
                let sessions: Vec<Arc<PeerSession>> = {
                    let peers = self.peers.read().await;
                    peers.values().cloned().collect()
                };
                for session in sessions {
                    if let Err(e) = session.detach_video().await {
                        debug!(peer = %session.remote_id(), "Video detach: {e}");
                    }
                }
                drop(source);
                if let Some(kind) = kind {
                    self.announce_video_state(kind, false).await;
                }
            }
        }
    }

    fn spawn_media_forwarders(
        self: &Arc<Self>,
        kind: MediaKind,
        mut decoder_events: mpsc::UnboundedReceiver<DecoderEvent>,
        mut pacer_events: mpsc::UnboundedReceiver<PacerEvent>,
        cancel: &CancellationToken,
    ) {
        let inner = Arc::clone(self);
        let decoder_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = decoder_cancel.cancelled() => return,
                    event = decoder_events.recv() => match event {
                        None => return,
                        Some(DecoderEvent::Warning(line)) => {
                            warn!(kind = kind.label(), "Decoder: {line}");
                        }
                        Some(DecoderEvent::Finished) => {
                            debug!(kind = kind.label(), "Decoder finished, draining");
                        }
                        Some(DecoderEvent::Failed(e)) => {
                            inner.voice_event(VoiceEvent::PlaybackError {
                                kind,
                                message: e.to_string(),
                            });
                            match kind {
                                MediaKind::Audio => inner.stop_audio_pipeline().await,
                                MediaKind::Video => inner.stop_video_pipeline(true).await,
                            }
                            return;
                        }
                    },
                }
            }
        });

        let inner = Arc::clone(self);
        let pacer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pacer_cancel.cancelled() => return,
                    event = pacer_events.recv() => match event {
                        None => return,
                        Some(PacerEvent::Stutter { gap }) => {
                            inner.voice_event(VoiceEvent::Stutter { kind, gap });
                        }
                        Some(PacerEvent::Finished) => {
                            inner.voice_event(VoiceEvent::PlaybackFinished { kind });
                            match kind {
                                MediaKind::Audio => inner.stop_audio_pipeline().await,
                                MediaKind::Video => inner.stop_video_pipeline(true).await,
                            }
                            return;
                        }
                    },
                }
            }
        });
    }

    async fn announce_video_state(self: &Arc<Self>, kind: VideoShareKind, enabled: bool) {
        let key = format!("{}:{:?}:{enabled}", self.identity.channel_id, kind);
        {
            let mut last = self.last_video_announce.lock().unwrap();
            if last.as_deref() == Some(key.as_str()) {
                return;
            }
            *last = Some(key);
        }
        let signal = OutboundSignal::VideoState {
            kind,
            payload: VideoStatePayload {
                channel_id: self.identity.channel_id.clone(),
                user_id: self.identity.peer_id.clone(),
                enabled,
            },
        };
        if let Err(e) = self.bus.send(signal).await {
            warn!("Video state announce failed: {e}");
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if !after(self.clock.as_ref(), HEARTBEAT_INTERVAL, &cancel).await {
                return;
            }
            let signal = OutboundSignal::Heartbeat(HeartbeatPayload {
                channel_id: self.identity.channel_id.clone(),
            });
            if let Err(e) = self.bus.send(signal).await {
                debug!("Heartbeat not sent: {e}");
            }
        }
    }
}

fn description_of(body: DescriptionBody) -> SessionDescription {
    match body {
        DescriptionBody::Offer(d) | DescriptionBody::Answer(d) => d,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::peer::mock::MockFactory;
    use crate::signaling::events::{ParticipantsPayload, UserPayload};
    use crate::signaling::MemoryBus;

    struct Fixture {
        connection: VoiceConnection,
        bus: Arc<MemoryBus>,
        factory: Arc<MockFactory>,
    }

    fn fixture(local_id: &str) -> Fixture {
        fixture_with_config(local_id, VoiceConfig::default())
    }

    fn fixture_with_config(local_id: &str, config: VoiceConfig) -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let factory = Arc::new(MockFactory::default());
        let connection = VoiceConnection::new(
            VoiceIdentity {
                peer_id: local_id.to_string(),
                server_id: "server-1".to_string(),
                channel_id: "chan-1".to_string(),
            },
            config,
            Arc::clone(&bus) as Arc<dyn SignalingBus>,
            Arc::clone(&factory) as Arc<dyn PeerFactory>,
            Arc::new(TokioClock),
        )
        .unwrap();
        Fixture {
            connection,
            bus,
            factory,
        }
    }

    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    fn participants(ids: &[&str]) -> BusEvent {
        BusEvent::Signal(InboundSignal::Participants(ParticipantsPayload {
            channel_id: "chan-1".to_string(),
            participants: ids.iter().map(|s| s.to_string()).collect(),
        }))
    }

    fn user_joined(id: &str) -> BusEvent {
        BusEvent::Signal(InboundSignal::UserJoined(UserPayload { id: id.to_string() }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_announces_and_heartbeats() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();
        assert!(fx.connection.connected());
        assert_eq!(fx.bus.sent_count("voice:join"), 1);

        for _ in 0..11 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert!(fx.bus.sent_count("voice:heartbeat") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_join_rejected() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();
        assert!(matches!(
            fx.connection.join().await,
            Err(Error::AlreadyActive(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_participants_cause_no_offers() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&[]));
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(fx.bus.sent_count("voice:offer"), 0);
        assert_eq!(fx.connection.peer_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_participant_is_dialed_after_stagger() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["user-2"]));
        settle().await;
        // Not dialed immediately: the stagger must elapse first.
        assert_eq!(fx.connection.peer_count().await, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fx.connection.peer_count().await, 1);
        assert!(fx.bus.sent_count("voice:offer") >= 1);
        assert!(fx.factory.peer("user-2").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_id_in_participants_is_ignored() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["bot-1"]));
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fx.connection.peer_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_channel_events_dropped() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(BusEvent::Signal(InboundSignal::Participants(
            ParticipantsPayload {
                channel_id: "other-channel".to_string(),
                participants: vec!["user-2".to_string()],
            },
        )));
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fx.connection.peer_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_participants_stay_small_tier() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        let ids: Vec<String> = (0..10).map(|i| format!("user-{i:02}")).collect();
        let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        fx.bus.deliver(participants(&refs));

        // Last small-tier offer lands within base + 9*per_peer + jitter.
        tokio::time::advance(Duration::from_millis(2400)).await;
        settle().await;
        // Give the pump time to work through the queue (2 concurrent, 3 s
        // slots).
        for _ in 0..40 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(fx.connection.peer_count().await, 10);
        assert!(!fx.inner_mass_join_active());
    }

    impl Fixture {
        fn inner_mass_join_active(&self) -> bool {
            self.connection.inner.mass_join_active()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_budget_never_exceeded() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        let ids: Vec<String> = (0..30).map(|i| format!("user-{i:02}")).collect();
        let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        fx.bus.deliver(participants(&refs));

        // 30 peers selects the large tier: one dial in flight at a time.
        for _ in 0..500 {
            tokio::time::advance(Duration::from_millis(250)).await;
            settle().await;
            assert!(fx.connection.negotiations_in_flight() <= 1);
        }
        assert_eq!(fx.connection.peer_count().await, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mass_join_flag_and_batches() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        let ids: Vec<String> = (0..60).map(|i| format!("user-{i:02}")).collect();
        let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        fx.bus.deliver(participants(&refs));
        settle().await;

        assert!(fx.inner_mass_join_active());

        // Work through every batch.
        for _ in 0..240 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(fx.connection.peer_count().await, 60);
        assert!(!fx.inner_mass_join_active());

        // Every peer was dialed exactly once.
        assert_eq!(fx.factory.created_count(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_cap_with_priority_bypass() {
        let mut config = VoiceConfig::default();
        config.max_connected_peers = 2;
        let fx = fixture_with_config("bot-1", config);
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["user-1", "user-2", "user-3"]));
        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(fx.connection.peer_count().await, 2);

        // A priority peer bypasses the cap.
        fx.connection.set_peer_priority("vip-9", true).await;
        fx.bus.deliver(user_joined("vip-9"));
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(fx.connection.peer_count().await, 3);
        assert!(fx.factory.peer("vip-9").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_left_destroys_session() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["user-2"]));
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fx.connection.peer_count().await, 1);

        fx.bus.deliver(BusEvent::Signal(InboundSignal::UserLeft(UserPayload {
            id: "user-2".to_string(),
        })));
        settle().await;
        assert_eq!(fx.connection.peer_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_self_rebuilds_all() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["user-2", "user-3"]));
        for _ in 0..15 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(fx.connection.peer_count().await, 2);
        let created_before = fx.factory.created_count();

        fx.bus.deliver(BusEvent::Signal(InboundSignal::ForceReconnect(
            ForceReconnectPayload {
                channel_id: "chan-1".to_string(),
                reason: Some("server rebalance".to_string()),
                target_peer: "bot-1".to_string(),
            },
        )));
        for _ in 0..15 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }

        assert_eq!(fx.connection.peer_count().await, 2);
        assert_eq!(fx.factory.created_count(), created_before + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_broadcast_is_noop() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["user-2"]));
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        let created_before = fx.factory.created_count();

        for target in ["*", "all"] {
            fx.bus.deliver(BusEvent::Signal(InboundSignal::ForceReconnect(
                ForceReconnectPayload {
                    channel_id: "chan-1".to_string(),
                    reason: None,
                    target_peer: target.to_string(),
                },
            )));
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fx.factory.created_count(), created_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_named_peer() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["user-2", "user-3"]));
        for _ in 0..15 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        let created_before = fx.factory.created_count();

        fx.bus.deliver(BusEvent::Signal(InboundSignal::ForceReconnect(
            ForceReconnectPayload {
                channel_id: "chan-1".to_string(),
                reason: None,
                target_peer: "user-3".to_string(),
            },
        )));
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(fx.factory.created_count(), created_before + 1);
        assert_eq!(fx.connection.peer_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_reconnect_restores_channel() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["user-2", "user-3"]));
        for _ in 0..15 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(fx.connection.peer_count().await, 2);
        let joins_before = fx.bus.sent_count("voice:join");

        fx.bus.deliver(BusEvent::Reconnected);
        for _ in 0..15 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }

        assert_eq!(fx.bus.sent_count("voice:join"), joins_before + 1);
        assert_eq!(fx.connection.peer_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_returns_to_initial_state() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(participants(&["user-2", "user-3"]));
        for _ in 0..15 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert!(fx.connection.peer_count().await > 0);

        fx.connection.leave().await.unwrap();
        assert!(!fx.connection.connected());
        assert_eq!(fx.connection.peer_count().await, 0);
        assert_eq!(fx.connection.negotiations_in_flight(), 0);
        assert_eq!(fx.bus.sent_count("voice:leave"), 1);

        // No further heartbeats after leaving.
        let heartbeats = fx.bus.sent_count("voice:heartbeat");
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(fx.bus.sent_count("voice:heartbeat"), heartbeats);

        // Leave is idempotent.
        fx.connection.leave().await.unwrap();
        assert_eq!(fx.bus.sent_count("voice:leave"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_offer_creates_session_and_answers() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(BusEvent::Signal(InboundSignal::Offer(
            InboundDescriptionPayload {
                from: "user-9".to_string(),
                description: DescriptionBody::Offer(SessionDescription::offer("their-sdp")),
                channel_id: "chan-1".to_string(),
            },
        )));
        settle().await;

        assert_eq!(fx.connection.peer_count().await, 1);
        assert_eq!(fx.bus.sent_count("voice:answer"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidate_before_offer_is_buffered_then_applied() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.bus.deliver(BusEvent::Signal(InboundSignal::IceCandidate(
            InboundCandidatePayload {
                from: "user-9".to_string(),
                candidate: crate::signaling::events::IceCandidateInit {
                    candidate: "early-candidate".to_string(),
                    ..Default::default()
                },
                channel_id: "chan-1".to_string(),
            },
        )));
        settle().await;

        let mock = fx.factory.peer("user-9").unwrap();
        assert!(mock.candidates().is_empty());

        fx.bus.deliver(BusEvent::Signal(InboundSignal::Offer(
            InboundDescriptionPayload {
                from: "user-9".to_string(),
                description: DescriptionBody::Offer(SessionDescription::offer("their-sdp")),
                channel_id: "chan-1".to_string(),
            },
        )));
        settle().await;

        assert_eq!(mock.candidates(), vec!["early-candidate"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_announce_deduplicated() {
        let fx = fixture("bot-1");
        fx.connection.join().await.unwrap();

        fx.connection
            .inner
            .announce_video_state(VideoShareKind::Screen, true)
            .await;
        fx.connection
            .inner
            .announce_video_state(VideoShareKind::Screen, true)
            .await;
        assert_eq!(fx.bus.sent_count("voice:screen-share"), 1);

        fx.connection
            .inner
            .announce_video_state(VideoShareKind::Screen, false)
            .await;
        assert_eq!(fx.bus.sent_count("voice:screen-share"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_requires_join() {
        let fx = fixture("bot-1");
        let result = fx
            .connection
            .play_file("/tmp/clip.wav", PlayOptions::default())
            .await;
        assert!(matches!(result, Err(Error::TransportDisconnected(_))));
    }
}
