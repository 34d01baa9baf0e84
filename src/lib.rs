//! Multi-peer voice/media connection core for chat bots
//!
//! This crate lets a bot join a voice channel announced over a chat
//! gateway and maintain a full mesh of real-time peer connections, with
//! decoded audio (and optionally video) streamed to every participant.
//!
//! Three tightly coupled concerns live here:
//!
//! - **Perfect-negotiation signalling**: a glare-free offer/answer state
//!   machine per remote peer, with rollback, ordered candidate buffering
//!   and ICE restart.
//! - **Tiered connection orchestration**: admission control, cooldowns and
//!   staggered dispatch that keep one endpoint stable while up to 100
//!   peers arrive as a burst or a trickle.
//! - **Real-time media pacing**: bounded-buffer pipelines decoding files
//!   or HTTP streams to raw PCM/YUV, paced against wall clock with
//!   catch-up, drift protection and coordinated A/V start barriers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  chat gateway (opaque `voice:*` message bus)             │
//! │  ↕ SignalingBus                                          │
//! │  VoiceConnection                                         │
//! │  ├─ AdmissionQueue (tiers, cooldowns, stagger)           │
//! │  ├─ PeerSession per remote peer (perfect negotiation)    │
//! │  │   └─ PeerApi (webrtc adapter or scripted mock)        │
//! │  └─ media pipelines                                      │
//! │      decoder subprocess → FrameRing → Pacer → MediaSink  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voicemesh::{
//!     MemoryBus, PlayOptions, TokioClock, VoiceConfig, VoiceConnection, VoiceIdentity,
//!     WebRtcFactory,
//! };
//!
//! # async fn example() -> voicemesh::Result<()> {
//! let config = VoiceConfig::default();
//! let bus = Arc::new(MemoryBus::new());
//! let factory = Arc::new(WebRtcFactory::new(config.resolved_ice_servers()));
//!
//! let connection = VoiceConnection::new(
//!     VoiceIdentity {
//!         peer_id: "bot-1".into(),
//!         server_id: "server-1".into(),
//!         channel_id: "general-voice".into(),
//!     },
//!     config,
//!     bus,
//!     factory,
//!     Arc::new(TokioClock),
//! )?;
//!
//! connection.join().await?;
//! connection.play_file("clip.wav", PlayOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod peer;
pub mod signaling;

pub use clock::{FrameClock, TokioClock};
pub use config::{DecoderConfig, IceServerConfig, VideoCanvas, VoiceConfig, VoiceIdentity};
pub use connection::{PlayOptions, VideoOptions, VoiceConnection, VoiceEvent};
pub use error::{Error, Result};
pub use media::effects::{AudioEffect, EffectPreset, EffectSettings};
pub use media::{MediaKind, MediaSink, MediaSource};
pub use peer::{ConnectionState, MediaTrack, PeerApi, PeerFactory, PeerSession, WebRtcFactory};
pub use signaling::events::{InboundSignal, OutboundSignal, VideoShareKind};
pub use signaling::{BusEvent, MemoryBus, SignalingBus};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
