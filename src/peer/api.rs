//! The narrow peer-connection capability the core consumes
//!
//! Anything that can offer/answer, apply descriptions and candidates,
//! carry local tracks and surface its state changes can back a
//! [`PeerSession`](super::session::PeerSession). The production adapter
//! lives in [`super::webrtc`]; a scripted one in [`super::mock`].

use crate::media::MediaKind;
use crate::signaling::events::{IceCandidateInit, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Signalling state of the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No offer/answer exchange in progress
    Stable,
    /// A local offer has been applied
    HaveLocalOffer,
    /// A remote offer has been applied
    HaveRemoteOffer,
    /// The connection is closed
    Closed,
}

/// Aggregate connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Wire label used in peer-state reports
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

/// ICE transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Events observed on a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Track topology changed; a (re)negotiation is required
    NegotiationNeeded,
    /// A local ICE candidate surfaced
    IceCandidate(IceCandidateInit),
    /// Aggregate connection state changed
    ConnectionState(ConnectionState),
    /// Signalling state changed
    SignalingState(SignalingState),
    /// ICE transport state changed
    IceConnectionState(IceConnectionState),
}

/// A local media track shared across every peer connection
///
/// Webrtc-backed in production; detached (sink-less) under test.
#[derive(Clone)]
pub struct MediaTrack {
    kind: MediaKind,
    id: String,
    sample_track: Option<Arc<TrackLocalStaticSample>>,
}

impl MediaTrack {
    /// A track backed by a local WebRTC sample track
    pub fn webrtc(kind: MediaKind, id: impl Into<String>, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            id: id.into(),
            sample_track: Some(track),
        }
    }

    /// A track with no media backing; frames written to it are discarded
    pub fn detached(kind: MediaKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            sample_track: None,
        }
    }

    /// Stream kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The backing sample track, when webrtc-backed
    pub fn sample_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.sample_track.clone()
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("backed", &self.sample_track.is_some())
            .finish()
    }
}

/// Handle over a track added to one peer connection, retained so the track
/// can later be replaced or removed
#[derive(Clone)]
pub struct TrackBinding {
    kind: MediaKind,
    track_id: String,
    sender: Option<Arc<RTCRtpSender>>,
}

impl TrackBinding {
    /// Binding retained by the webrtc adapter
    pub fn webrtc(kind: MediaKind, track_id: impl Into<String>, sender: Arc<RTCRtpSender>) -> Self {
        Self {
            kind,
            track_id: track_id.into(),
            sender: Some(sender),
        }
    }

    /// Binding with no RTP sender behind it
    pub fn detached(kind: MediaKind, track_id: impl Into<String>) -> Self {
        Self {
            kind,
            track_id: track_id.into(),
            sender: None,
        }
    }

    /// Stream kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Id of the currently bound track
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// The retained RTP sender, when webrtc-backed
    pub fn sender(&self) -> Option<Arc<RTCRtpSender>> {
        self.sender.clone()
    }
}

impl std::fmt::Debug for TrackBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackBinding")
            .field("kind", &self.kind)
            .field("track_id", &self.track_id)
            .finish()
    }
}

/// The peer-connection capability
///
/// Events are pushed into the channel handed to the factory at build time;
/// calls and state reads are made through this trait.
#[async_trait]
pub trait PeerApi: Send + Sync {
    /// Create an offer, optionally restarting ICE
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Roll the local description back to stable
    async fn rollback_local_description(&self) -> Result<()>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    /// Add a local track; returns a binding for later replace/remove
    async fn add_track(&self, track: MediaTrack) -> Result<TrackBinding>;

    /// Remove a previously added track
    async fn remove_track(&self, binding: &TrackBinding) -> Result<()>;

    /// Swap the track behind an existing binding without renegotiating
    /// from scratch
    async fn replace_track(&self, binding: &TrackBinding, track: MediaTrack) -> Result<TrackBinding>;

    /// Current signalling state
    fn signaling_state(&self) -> SignalingState;

    /// Current aggregate connection state
    fn connection_state(&self) -> ConnectionState;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Builds peer connections and local tracks
///
/// The orchestrator only ever goes through this seam, so the WebRTC stack
/// can be swapped wholesale.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Build a connection toward a remote peer; events flow into `events`
    async fn create_peer(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerApi>>;

    /// Build a local track of the given kind
    fn create_track(&self, kind: MediaKind, label: &str) -> Result<MediaTrack>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Connected.label(), "connected");
        assert_eq!(ConnectionState::Failed.label(), "failed");
    }

    #[test]
    fn test_detached_track() {
        let track = MediaTrack::detached(MediaKind::Video, "video-0");
        assert_eq!(track.kind(), MediaKind::Video);
        assert_eq!(track.id(), "video-0");
        assert!(track.sample_track().is_none());
    }

    #[test]
    fn test_detached_binding() {
        let binding = TrackBinding::detached(MediaKind::Audio, "audio-0");
        assert_eq!(binding.kind(), MediaKind::Audio);
        assert!(binding.sender().is_none());
    }
}
