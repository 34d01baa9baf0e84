//! Peer connection capability, adapters and per-peer negotiation sessions

pub mod api;
pub mod mock;
pub mod session;
pub mod webrtc;

pub use api::{
    ConnectionState, IceConnectionState, MediaTrack, PeerApi, PeerEvent, PeerFactory,
    SignalingState, TrackBinding,
};
pub use session::{PeerSession, SessionContext, SessionEvent};
pub use webrtc::{WebRtcFactory, WebRtcPeer};
