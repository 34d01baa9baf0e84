//! Per-remote-peer negotiation session
//!
//! Implements perfect negotiation over the abstract peer capability: one
//! outstanding offer at a time, deterministic polite/impolite roles,
//! rollback on glare, ordered candidate buffering, deferred renegotiation,
//! ICE restart and a poll fallback for stacks that never report
//! `connected`.

use super::api::{
    ConnectionState, IceConnectionState, MediaTrack, PeerApi, PeerEvent, PeerFactory,
    SignalingState, TrackBinding,
};
use crate::clock::FrameClock;
use crate::signaling::events::{
    CandidatePayload, DescriptionBody, DescriptionPayload, IceCandidateInit,
    PeerStateReportPayload, SessionDescription,
};
use crate::signaling::{OutboundSignal, SignalingBus};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between connected-poll probes
const CONNECTED_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Maximum connected-poll probes before the announce is forced
const CONNECTED_POLL_ATTEMPTS: u32 = 40;

/// Milliseconds since the Unix epoch, for state reports
fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle notifications a session sends to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session reached `connected` (announced at most once per session)
    Connected { peer_id: String },
    /// The underlying connection failed or closed; the session should be
    /// destroyed
    Ended {
        peer_id: String,
        state: ConnectionState,
    },
}

/// Shared wiring every session is built from
#[derive(Clone)]
pub struct SessionContext {
    /// Local peer id (determines the polite role)
    pub local_id: String,
    /// Channel all signals are scoped to
    pub channel_id: String,
    /// Outbound signal sender
    pub bus: Arc<dyn SignalingBus>,
    /// Clock for the connected poll
    pub clock: Arc<dyn FrameClock>,
    /// Peer connection factory
    pub factory: Arc<dyn PeerFactory>,
    /// Where lifecycle notifications go
    pub session_events: mpsc::UnboundedSender<SessionEvent>,
}

struct NegotiationState {
    making_offer: bool,
    ignore_offer: bool,
    remote_desc_set: bool,
    pending_candidates: Vec<IceCandidateInit>,
    pending_renegotiate: bool,
    pending_ice_restart: bool,
}

/// Negotiation session toward one remote peer
pub struct PeerSession {
    remote_id: String,
    channel_id: String,
    polite: bool,
    peer: Arc<dyn PeerApi>,
    bus: Arc<dyn SignalingBus>,
    clock: Arc<dyn FrameClock>,
    cancel: CancellationToken,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    negotiation: Mutex<NegotiationState>,
    connected_announced: AtomicBool,
    poll_active: AtomicBool,
    audio_binding: Mutex<Option<TrackBinding>>,
    video_binding: Mutex<Option<TrackBinding>>,
}

impl PeerSession {
    /// Build the underlying connection and start the session's event task
    ///
    /// The polite role is deterministic: the endpoint with the
    /// lexicographically smaller id yields on collisions. Both sides compute
    /// the same answer.
    pub async fn connect(
        ctx: &SessionContext,
        remote_id: &str,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = ctx.factory.create_peer(remote_id, events_tx).await?;

        let polite = ctx.local_id.as_str() < remote_id;
        debug!(
            remote = remote_id,
            polite, "Creating negotiation session"
        );

        let session = Arc::new(Self {
            remote_id: remote_id.to_string(),
            channel_id: ctx.channel_id.clone(),
            polite,
            peer,
            bus: Arc::clone(&ctx.bus),
            clock: Arc::clone(&ctx.clock),
            cancel: parent.child_token(),
            session_events: ctx.session_events.clone(),
            negotiation: Mutex::new(NegotiationState {
                making_offer: false,
                ignore_offer: false,
                remote_desc_set: false,
                pending_candidates: Vec::new(),
                pending_renegotiate: false,
                pending_ice_restart: false,
            }),
            connected_announced: AtomicBool::new(false),
            poll_active: AtomicBool::new(false),
            audio_binding: Mutex::new(None),
            video_binding: Mutex::new(None),
        });

        let task_session = Arc::clone(&session);
        tokio::spawn(async move { task_session.run(events_rx).await });

        Ok(session)
    }

    /// Remote peer id
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Whether this side yields on offer collisions
    pub fn polite(&self) -> bool {
        self.polite
    }

    /// Current aggregate connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.peer.connection_state()
    }

    /// True once the connected announce fired
    pub fn is_connected(&self) -> bool {
        self.connected_announced.load(Ordering::Acquire)
    }

    /// True while connected, connecting or mid-offer; used by admission
    /// de-duplication
    pub async fn is_busy(&self) -> bool {
        if matches!(
            self.peer.connection_state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return true;
        }
        self.negotiation.lock().await.making_offer
    }

    /// Whether a video track is currently bound
    pub async fn has_video(&self) -> bool {
        self.video_binding.lock().await.is_some()
    }

    /// Add the shared audio track; triggers the initial negotiation
    pub async fn attach_audio(&self, track: &MediaTrack) -> Result<()> {
        let binding = self.peer.add_track(track.clone()).await?;
        *self.audio_binding.lock().await = Some(binding);
        Ok(())
    }

    /// Add or swap the shared video track
    ///
    /// An existing sender is reused via `replace_track` so a peer is never
    /// wired to two video tracks at once.
    pub async fn attach_video(&self, track: &MediaTrack) -> Result<()> {
        let mut guard = self.video_binding.lock().await;
        let binding = match guard.as_ref() {
            Some(existing) => self.peer.replace_track(existing, track.clone()).await?,
            None => self.peer.add_track(track.clone()).await?,
        };
        *guard = Some(binding);
        Ok(())
    }

    /// Remove the video track, if bound
    pub async fn detach_video(&self) -> Result<()> {
        let binding = self.video_binding.lock().await.take();
        if let Some(binding) = binding {
            self.peer.remove_track(&binding).await?;
        }
        Ok(())
    }

    /// Request an ICE restart through the negotiation pathway
    pub async fn restart_ice(self: &Arc<Self>) {
        {
            let mut st = self.negotiation.lock().await;
            st.pending_ice_restart = true;
        }
        self.negotiate().await;
    }

    /// Tear the session down; the peer connection is closed and the event
    /// task stops
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.peer.close().await {
            debug!(remote = %self.remote_id, "Close reported: {e}");
        }
    }

    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => match event {
                    None => return,
                    Some(event) => self.handle_event(event).await,
                },
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded => self.negotiate().await,
            PeerEvent::IceCandidate(candidate) => {
                let signal = OutboundSignal::IceCandidate(CandidatePayload {
                    to: self.remote_id.clone(),
                    candidate,
                    channel_id: self.channel_id.clone(),
                });
                if let Err(e) = self.bus.send(signal).await {
                    warn!(remote = %self.remote_id, "Failed to send candidate: {e}");
                }
            }
            PeerEvent::SignalingState(state) => {
                if state == SignalingState::Stable {
                    self.flush_pending_renegotiation().await;
                }
            }
            PeerEvent::ConnectionState(state) => self.handle_connection_state(state).await,
            PeerEvent::IceConnectionState(state) => {
                if state == IceConnectionState::Failed {
                    info!(remote = %self.remote_id, "ICE failed, restarting");
                    self.restart_ice().await;
                }
            }
        }
    }

    /// Attempt a negotiation, deferring when one is already in flight or
    /// the signalling state is not stable
    async fn negotiate(self: &Arc<Self>) {
        let ice_restart;
        {
            let mut st = self.negotiation.lock().await;
            if st.making_offer {
                st.pending_renegotiate = true;
                return;
            }
            if self.peer.signaling_state() != SignalingState::Stable {
                st.pending_renegotiate = true;
                return;
            }
            st.making_offer = true;
            ice_restart = std::mem::take(&mut st.pending_ice_restart);
        }

        let result = self.send_offer(ice_restart).await;

        let mut st = self.negotiation.lock().await;
        st.making_offer = false;
        if let Err(e) = result {
            warn!(remote = %self.remote_id, "Negotiation attempt failed: {e}");
            st.pending_renegotiate = true;
            if ice_restart {
                st.pending_ice_restart = true;
            }
        }
    }

    async fn send_offer(&self, ice_restart: bool) -> Result<()> {
        let offer = self.peer.create_offer(ice_restart).await?;
        // A remote offer may have landed while ours was being created.
        if self.peer.signaling_state() != SignalingState::Stable {
            return Err(Error::NegotiationFailed(
                "signalling state changed while creating offer".to_string(),
            ));
        }
        self.peer.set_local_description(offer.clone()).await?;

        self.bus
            .send(OutboundSignal::Offer(DescriptionPayload {
                to: self.remote_id.clone(),
                description: DescriptionBody::Offer(offer),
                channel_id: self.channel_id.clone(),
            }))
            .await
    }

    /// Apply an inbound offer with glare resolution
    pub async fn handle_offer(self: &Arc<Self>, offer: SessionDescription) -> Result<()> {
        {
            let mut st = self.negotiation.lock().await;
            let collision =
                st.making_offer || self.peer.signaling_state() != SignalingState::Stable;
            st.ignore_offer = collision && !self.polite;
            if st.ignore_offer {
                debug!(remote = %self.remote_id, "Glare: holding our offer, dropping theirs");
                return Ok(());
            }

            if collision {
                if self.peer.signaling_state() == SignalingState::HaveLocalOffer {
                    self.peer.rollback_local_description().await?;
                }
                st.making_offer = false;
            }

            self.peer.set_remote_description(offer).await?;
            st.remote_desc_set = true;
            let pending = std::mem::take(&mut st.pending_candidates);
            self.apply_candidates(pending).await;
        }

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        self.bus
            .send(OutboundSignal::Answer(DescriptionPayload {
                to: self.remote_id.clone(),
                description: DescriptionBody::Answer(answer),
                channel_id: self.channel_id.clone(),
            }))
            .await?;

        self.begin_connected_poll();
        self.flush_pending_renegotiation().await;
        Ok(())
    }

    /// Apply an inbound answer to our outstanding offer
    pub async fn handle_answer(self: &Arc<Self>, answer: SessionDescription) -> Result<()> {
        if self.peer.signaling_state() == SignalingState::Stable {
            debug!(remote = %self.remote_id, "Discarding answer while stable");
            return Ok(());
        }

        self.peer.set_remote_description(answer).await?;
        {
            let mut st = self.negotiation.lock().await;
            st.remote_desc_set = true;
            st.ignore_offer = false;
            let pending = std::mem::take(&mut st.pending_candidates);
            self.apply_candidates(pending).await;
        }

        self.begin_connected_poll();
        self.flush_pending_renegotiation().await;
        Ok(())
    }

    /// Apply or buffer an inbound candidate
    pub async fn handle_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        let mut st = self.negotiation.lock().await;
        if st.ignore_offer {
            return Ok(());
        }
        if !st.remote_desc_set {
            st.pending_candidates.push(candidate);
            return Ok(());
        }
        self.peer.add_ice_candidate(candidate).await
    }

    async fn apply_candidates(&self, candidates: Vec<IceCandidateInit>) {
        for candidate in candidates {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!(remote = %self.remote_id, "Buffered candidate rejected: {e}");
            }
        }
    }

    async fn flush_pending_renegotiation(self: &Arc<Self>) {
        let due = {
            let mut st = self.negotiation.lock().await;
            if st.pending_renegotiate && self.peer.signaling_state() == SignalingState::Stable {
                st.pending_renegotiate = false;
                true
            } else {
                false
            }
        };
        if due {
            self.negotiate().await;
        }
    }

    /// Poll for `connected` after a remote description lands
    ///
    /// Some stacks never fire the connected transition; after the poll
    /// window the announce is forced and media blocks harmlessly if nothing
    /// actually flows.
    fn begin_connected_poll(self: &Arc<Self>) {
        if self.poll_active.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            for _ in 0..CONNECTED_POLL_ATTEMPTS {
                if session.cancel.is_cancelled() {
                    return;
                }
                if session.peer.connection_state() == ConnectionState::Connected {
                    session.announce_connected();
                    return;
                }
                if !crate::clock::after(
                    session.clock.as_ref(),
                    CONNECTED_POLL_INTERVAL,
                    &session.cancel,
                )
                .await
                {
                    return;
                }
            }
            debug!(remote = %session.remote_id, "Connected poll timed out, forcing announce");
            session.announce_connected();
        });
    }

    fn announce_connected(&self) {
        if self.connected_announced.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(remote = %self.remote_id, "Peer connected");
        let _ = self.session_events.send(SessionEvent::Connected {
            peer_id: self.remote_id.clone(),
        });
    }

    async fn handle_connection_state(self: &Arc<Self>, state: ConnectionState) {
        self.report_state(state.label()).await;
        match state {
            ConnectionState::Connected => self.announce_connected(),
            ConnectionState::Failed | ConnectionState::Closed => {
                let _ = self.session_events.send(SessionEvent::Ended {
                    peer_id: self.remote_id.clone(),
                    state,
                });
            }
            _ => {}
        }
    }

    async fn report_state(&self, state: &str) {
        let signal = OutboundSignal::PeerStateReport(PeerStateReportPayload {
            channel_id: self.channel_id.clone(),
            target_peer_id: self.remote_id.clone(),
            state: state.to_string(),
            timestamp: epoch_millis(),
        });
        if let Err(e) = self.bus.send(signal).await {
            debug!(remote = %self.remote_id, "State report not sent: {e}");
        }
    }
}
