//! Scripted peer capability for tests
//!
//! Mimics a well-behaved peer connection: track changes raise
//! `negotiation_needed`, descriptions move the signalling state, and a
//! completed offer/answer exchange optionally reports `connected`. Every
//! call is recorded so tests can assert on exact operation order.

use super::api::{
    ConnectionState, MediaTrack, PeerApi, PeerEvent, PeerFactory, SignalingState, TrackBinding,
};
use crate::media::MediaKind;
use crate::signaling::events::{IceCandidateInit, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One recorded operation on a [`MockPeer`]
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    Rollback,
    SetRemote(SdpKind),
    AddCandidate(String),
    AddTrack(MediaKind, String),
    RemoveTrack(String),
    ReplaceTrack { old: String, new: String },
    Close,
}

struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
}

/// Scripted peer connection
pub struct MockPeer {
    remote_id: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<MockState>,
    calls: Mutex<Vec<MockCall>>,
    offer_counter: AtomicU64,
    /// Report `connected` once an offer/answer exchange completes
    auto_connect: bool,
}

impl MockPeer {
    fn new(remote_id: &str, events: mpsc::UnboundedSender<PeerEvent>, auto_connect: bool) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            events,
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
            }),
            calls: Mutex::new(Vec::new()),
            offer_counter: AtomicU64::new(0),
            auto_connect,
        }
    }

    /// Remote peer this connection points at
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Everything called on this peer, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Candidates applied, in order
    pub fn candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Count of calls matching a predicate
    pub fn call_count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    /// Push an arbitrary event into the session
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    /// Force the aggregate connection state, optionally emitting the event
    pub fn set_connection_state(&self, state: ConnectionState, emit: bool) {
        self.state.lock().unwrap().connection = state;
        if emit {
            self.emit(PeerEvent::ConnectionState(state));
        }
    }

    /// Force the signalling state, optionally emitting the event
    pub fn force_signaling(&self, state: SignalingState, emit: bool) {
        self.state.lock().unwrap().signaling = state;
        if emit {
            self.emit(PeerEvent::SignalingState(state));
        }
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn set_signaling(&self, signaling: SignalingState) {
        self.state.lock().unwrap().signaling = signaling;
        self.emit(PeerEvent::SignalingState(signaling));
    }

    fn maybe_connect(&self) {
        if self.auto_connect {
            let already = {
                let state = self.state.lock().unwrap();
                state.connection == ConnectionState::Connected
            };
            if !already {
                self.set_connection_state(ConnectionState::Connected, true);
            }
        }
    }
}

#[async_trait]
impl PeerApi for MockPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.record(MockCall::CreateOffer { ice_restart });
        let n = self.offer_counter.fetch_add(1, Ordering::AcqRel);
        let marker = if ice_restart { "restart" } else { "offer" };
        Ok(SessionDescription::offer(format!(
            "{marker}-{}-{n}",
            self.remote_id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(MockCall::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "answer-{}",
            self.remote_id
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(MockCall::SetLocal(description.kind));
        match description.kind {
            SdpKind::Offer => self.set_signaling(SignalingState::HaveLocalOffer),
            SdpKind::Answer => {
                self.set_signaling(SignalingState::Stable);
                self.maybe_connect();
            }
        }
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<()> {
        self.record(MockCall::Rollback);
        self.set_signaling(SignalingState::Stable);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(MockCall::SetRemote(description.kind));
        match description.kind {
            SdpKind::Offer => self.set_signaling(SignalingState::HaveRemoteOffer),
            SdpKind::Answer => {
                self.set_signaling(SignalingState::Stable);
                self.maybe_connect();
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.record(MockCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: MediaTrack) -> Result<TrackBinding> {
        self.record(MockCall::AddTrack(track.kind(), track.id().to_string()));
        self.emit(PeerEvent::NegotiationNeeded);
        Ok(TrackBinding::detached(track.kind(), track.id()))
    }

    async fn remove_track(&self, binding: &TrackBinding) -> Result<()> {
        self.record(MockCall::RemoveTrack(binding.track_id().to_string()));
        self.emit(PeerEvent::NegotiationNeeded);
        Ok(())
    }

    async fn replace_track(
        &self,
        binding: &TrackBinding,
        track: MediaTrack,
    ) -> Result<TrackBinding> {
        self.record(MockCall::ReplaceTrack {
            old: binding.track_id().to_string(),
            new: track.id().to_string(),
        });
        Ok(TrackBinding::detached(track.kind(), track.id()))
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    async fn close(&self) -> Result<()> {
        self.record(MockCall::Close);
        self.state.lock().unwrap().connection = ConnectionState::Closed;
        Ok(())
    }
}

/// Factory producing [`MockPeer`]s and detached tracks
pub struct MockFactory {
    peers: Mutex<HashMap<String, Arc<MockPeer>>>,
    created: AtomicU64,
    auto_connect: bool,
    fail_creation: AtomicBool,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MockFactory {
    /// Create a factory; with `auto_connect`, peers report `connected` as
    /// soon as an offer/answer exchange completes
    pub fn new(auto_connect: bool) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            auto_connect,
            fail_creation: AtomicBool::new(false),
        }
    }

    /// The latest peer created toward a remote id
    pub fn peer(&self, remote_id: &str) -> Option<Arc<MockPeer>> {
        self.peers.lock().unwrap().get(remote_id).cloned()
    }

    /// Total peers created
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }

    /// All remote ids a peer was created toward
    pub fn created_ids(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Make the next `create_peer` fail
    pub fn fail_next_creation(&self) {
        self.fail_creation.store(true, Ordering::Release);
    }
}

#[async_trait]
impl PeerFactory for MockFactory {
    async fn create_peer(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerApi>> {
        if self.fail_creation.swap(false, Ordering::AcqRel) {
            return Err(Error::PeerConnectionBuild("scripted failure".to_string()));
        }
        let peer = Arc::new(MockPeer::new(remote_id, events, self.auto_connect));
        self.peers
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), Arc::clone(&peer));
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(peer as Arc<dyn PeerApi>)
    }

    fn create_track(&self, kind: MediaKind, label: &str) -> Result<MediaTrack> {
        Ok(MediaTrack::detached(kind, label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_answer_marks_connected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = MockFactory::default();
        let peer = factory.create_peer("peer-1", tx).await.unwrap();

        let offer = peer.create_offer(false).await.unwrap();
        peer.set_local_description(offer).await.unwrap();
        assert_eq!(peer.signaling_state(), SignalingState::HaveLocalOffer);

        peer.set_remote_description(SessionDescription::answer("a"))
            .await
            .unwrap();
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
        assert_eq!(peer.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_add_track_emits_negotiation_needed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = MockFactory::default();
        let peer = factory.create_peer("peer-1", tx).await.unwrap();

        peer.add_track(MediaTrack::detached(MediaKind::Audio, "audio-0"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), PeerEvent::NegotiationNeeded);
    }

    #[tokio::test]
    async fn test_call_recording() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = MockFactory::default();
        let peer = factory.create_peer("peer-1", tx).await.unwrap();

        peer.add_ice_candidate(IceCandidateInit {
            candidate: "cand-1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let mock = factory.peer("peer-1").unwrap();
        assert_eq!(mock.candidates(), vec!["cand-1".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_creation_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = MockFactory::default();
        factory.fail_next_creation();
        assert!(factory.create_peer("peer-1", tx).await.is_err());
    }
}
