//! Production peer adapter over the webrtc crate

use super::api::{
    ConnectionState, IceConnectionState, MediaTrack, PeerApi, PeerEvent, PeerFactory,
    SignalingState, TrackBinding,
};
use crate::config::IceServerConfig;
use crate::media::MediaKind;
use crate::signaling::events::{IceCandidateInit, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveRemoteOffer
        }
        _ => SignalingState::Closed,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    result.map_err(|e| Error::NegotiationFailed(format!("Failed to parse description: {e}")))
}

fn from_candidate(candidate: &RTCIceCandidate) -> Result<IceCandidateInit> {
    let init = candidate
        .to_json()
        .map_err(|e| Error::NegotiationFailed(format!("Failed to serialize candidate: {e}")))?;
    Ok(IceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    })
}

/// Peer connection backed by the webrtc crate
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    /// Build a peer connection with default codecs and interceptors,
    /// wiring every observable state change into `events`
    pub async fn connect(
        remote_id: &str,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>> {
        info!("Creating peer connection toward {remote_id}");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnectionBuild(format!("Failed to register codecs: {e}")))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| {
                Error::PeerConnectionBuild(format!("Failed to register interceptors: {e}"))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionBuild(format!("Failed to create peer connection: {e}"))
        })?);

        let tx = events.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            let _ = tx.send(PeerEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                if let Ok(init) = from_candidate(&candidate) {
                    let _ = tx.send(PeerEvent::IceCandidate(init));
                }
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        peer_connection.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let _ = tx.send(PeerEvent::SignalingState(map_signaling_state(state)));
            Box::pin(async {})
        }));

        let tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                if let Some(state) = map_connection_state(state) {
                    let _ = tx.send(PeerEvent::ConnectionState(state));
                }
                Box::pin(async {})
            },
        ));

        let tx = events;
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                if let Some(state) = map_ice_state(state) {
                    let _ = tx.send(PeerEvent::IceConnectionState(state));
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(Self { peer_connection }))
    }

    fn require_sample_track(track: &MediaTrack) -> Result<Arc<TrackLocalStaticSample>> {
        track.sample_track().ok_or_else(|| {
            Error::MediaTrackError(format!("Track {} has no media backing", track.id()))
        })
    }
}

#[async_trait]
impl PeerApi for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = if ice_restart {
            Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            })
        } else {
            None
        };
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to create offer: {e}")))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to create answer: {e}")))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(&description)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| {
                Error::NegotiationFailed(format!("Failed to set local description: {e}"))
            })
    }

    async fn rollback_local_description(&self) -> Result<()> {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Rollback failed: {e}")))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(&description)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| {
                Error::NegotiationFailed(format!("Failed to set remote description: {e}"))
            })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to add candidate: {e}")))
    }

    async fn add_track(&self, track: MediaTrack) -> Result<TrackBinding> {
        let sample_track = Self::require_sample_track(&track)?;
        let sender = self
            .peer_connection
            .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {e}")))?;
        debug!(kind = track.kind().label(), id = track.id(), "Track added");
        Ok(TrackBinding::webrtc(track.kind(), track.id(), sender))
    }

    async fn remove_track(&self, binding: &TrackBinding) -> Result<()> {
        let sender = binding.sender().ok_or_else(|| {
            Error::MediaTrackError("Binding has no sender to remove".to_string())
        })?;
        self.peer_connection
            .remove_track(&sender)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to remove track: {e}")))
    }

    async fn replace_track(
        &self,
        binding: &TrackBinding,
        track: MediaTrack,
    ) -> Result<TrackBinding> {
        let sender = binding.sender().ok_or_else(|| {
            Error::MediaTrackError("Binding has no sender to replace".to_string())
        })?;
        let sample_track = Self::require_sample_track(&track)?;
        sender
            .replace_track(Some(sample_track as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {e}")))?;
        Ok(TrackBinding::webrtc(track.kind(), track.id(), sender))
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.peer_connection.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.peer_connection.connection_state())
            .unwrap_or(ConnectionState::New)
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionBuild(format!("Failed to close connection: {e}")))
    }
}

/// Factory building webrtc-backed peers and sample tracks
pub struct WebRtcFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcFactory {
    /// Create a factory using the given ICE server list
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn create_peer(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerApi>> {
        let peer = WebRtcPeer::connect(remote_id, &self.ice_servers, events).await?;
        Ok(peer as Arc<dyn PeerApi>)
    }

    fn create_track(&self, kind: MediaKind, label: &str) -> Result<MediaTrack> {
        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: crate::media::SAMPLE_RATE,
                channels: crate::media::CHANNELS,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            label.to_string(),
            stream_id,
        ));
        Ok(MediaTrack::webrtc(kind, label, track))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::connect("peer-test", &[IceServerConfig::stun(
            "stun:stun.l.google.com:19302",
        )], tx)
        .await
        .unwrap();

        assert_eq!(peer.signaling_state(), SignalingState::Stable);
        let offer = peer.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(!offer.sdp.is_empty());
    }

    #[tokio::test]
    async fn test_add_track_emits_negotiation_needed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = WebRtcFactory::new(vec![]);
        let peer = factory.create_peer("peer-test", tx).await.unwrap();

        let track = factory.create_track(MediaKind::Audio, "audio-0").unwrap();
        let binding = peer.add_track(track).await.unwrap();
        assert_eq!(binding.kind(), MediaKind::Audio);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, PeerEvent::NegotiationNeeded);
    }

    #[tokio::test]
    async fn test_offer_includes_added_audio() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = WebRtcFactory::new(vec![]);
        let peer = factory.create_peer("peer-test", tx).await.unwrap();

        let track = factory.create_track(MediaKind::Audio, "audio-0").unwrap();
        peer.add_track(track).await.unwrap();

        let offer = peer.create_offer(false).await.unwrap();
        assert!(offer.sdp.contains("audio"));
    }

    #[tokio::test]
    async fn test_detached_track_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = WebRtcFactory::new(vec![]);
        let peer = factory.create_peer("peer-test", tx).await.unwrap();

        let track = MediaTrack::detached(MediaKind::Audio, "audio-0");
        assert!(peer.add_track(track).await.is_err());
    }

    #[tokio::test]
    async fn test_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = WebRtcFactory::new(vec![]);
        let peer = factory.create_peer("peer-test", tx).await.unwrap();
        peer.close().await.unwrap();
    }
}
