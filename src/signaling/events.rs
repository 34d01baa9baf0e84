//! Wire payloads for every `voice:*` signalling event

use serde::{Deserialize, Serialize};

/// SDP description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// An SDP offer
    Offer,
    /// An SDP answer
    Answer,
}

/// A session description exchanged over signalling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,

    /// Raw SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate in init form, as carried over signalling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    /// The candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description the candidate belongs to
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Camera vs screen share, selecting which announce event is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoShareKind {
    /// Screen capture
    Screen,
    /// Camera feed
    Camera,
}

/// `voice:join` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub channel_id: String,
    pub server_id: String,
    pub peer_id: String,
}

/// `voice:heartbeat` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub channel_id: String,
}

/// `voice:offer` / `voice:answer` payload (outbound)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionPayload {
    pub to: String,
    #[serde(flatten)]
    pub description: DescriptionBody,
    pub channel_id: String,
}

/// The offer/answer body; the wire key matches the description kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DescriptionBody {
    /// Carried under the `offer` key
    Offer(SessionDescription),
    /// Carried under the `answer` key
    Answer(SessionDescription),
}

/// `voice:ice-candidate` payload (outbound)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub to: String,
    pub candidate: IceCandidateInit,
    pub channel_id: String,
}

/// `voice:peer-state-report` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStateReportPayload {
    pub channel_id: String,
    pub target_peer_id: String,
    pub state: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// `voice:screen-share` / `voice:video` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatePayload {
    pub channel_id: String,
    pub user_id: String,
    pub enabled: bool,
}

/// Signals emitted by the endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    Join(JoinPayload),
    Leave { channel_id: String },
    Heartbeat(HeartbeatPayload),
    Offer(DescriptionPayload),
    Answer(DescriptionPayload),
    IceCandidate(CandidatePayload),
    PeerStateReport(PeerStateReportPayload),
    VideoState {
        kind: VideoShareKind,
        payload: VideoStatePayload,
    },
}

impl OutboundSignal {
    /// Event name on the signalling bus
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundSignal::Join(_) => "voice:join",
            OutboundSignal::Leave { .. } => "voice:leave",
            OutboundSignal::Heartbeat(_) => "voice:heartbeat",
            OutboundSignal::Offer(_) => "voice:offer",
            OutboundSignal::Answer(_) => "voice:answer",
            OutboundSignal::IceCandidate(_) => "voice:ice-candidate",
            OutboundSignal::PeerStateReport(_) => "voice:peer-state-report",
            OutboundSignal::VideoState { kind, .. } => match kind {
                VideoShareKind::Screen => "voice:screen-share",
                VideoShareKind::Camera => "voice:video",
            },
        }
    }

    /// Serialize the payload for the bus
    pub fn payload_json(&self) -> crate::Result<serde_json::Value> {
        let value = match self {
            OutboundSignal::Join(p) => serde_json::to_value(p),
            OutboundSignal::Leave { channel_id } => serde_json::to_value(channel_id),
            OutboundSignal::Heartbeat(p) => serde_json::to_value(p),
            OutboundSignal::Offer(p) | OutboundSignal::Answer(p) => serde_json::to_value(p),
            OutboundSignal::IceCandidate(p) => serde_json::to_value(p),
            OutboundSignal::PeerStateReport(p) => serde_json::to_value(p),
            OutboundSignal::VideoState { payload, .. } => serde_json::to_value(payload),
        };
        value.map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize signal payload: {e}"))
        })
    }
}

/// `voice:participants` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsPayload {
    pub channel_id: String,
    pub participants: Vec<String>,
}

/// `voice:user-joined` / `voice:user-left` payload
///
/// Gateway revisions disagree on the key name; both are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(alias = "userId")]
    pub id: String,
}

/// `voice:offer` / `voice:answer` payload (inbound)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundDescriptionPayload {
    pub from: String,
    #[serde(flatten)]
    pub description: DescriptionBody,
    pub channel_id: String,
}

/// `voice:ice-candidate` payload (inbound)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundCandidatePayload {
    pub from: String,
    pub candidate: IceCandidateInit,
    pub channel_id: String,
}

/// `voice:force-reconnect` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceReconnectPayload {
    pub channel_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub target_peer: String,
}

/// `voice:resync-request` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequestPayload {
    pub from: String,
    pub channel_id: String,
}

/// Signals the core subscribes to
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    Participants(ParticipantsPayload),
    UserJoined(UserPayload),
    UserLeft(UserPayload),
    Offer(InboundDescriptionPayload),
    Answer(InboundDescriptionPayload),
    IceCandidate(InboundCandidatePayload),
    ForceReconnect(ForceReconnectPayload),
    ResyncRequest(ResyncRequestPayload),
}

impl InboundSignal {
    /// Parse a raw bus event; `Ok(None)` when the event name is not one
    /// this core subscribes to
    pub fn parse(event: &str, payload: serde_json::Value) -> crate::Result<Option<Self>> {
        fn de<T: serde::de::DeserializeOwned>(
            event: &str,
            payload: serde_json::Value,
        ) -> crate::Result<T> {
            serde_json::from_value(payload).map_err(|e| {
                crate::Error::SerializationError(format!("Malformed {event} payload: {e}"))
            })
        }

        let signal = match event {
            "voice:participants" => InboundSignal::Participants(de(event, payload)?),
            "voice:user-joined" => InboundSignal::UserJoined(de(event, payload)?),
            "voice:user-left" => InboundSignal::UserLeft(de(event, payload)?),
            "voice:offer" => InboundSignal::Offer(de(event, payload)?),
            "voice:answer" => InboundSignal::Answer(de(event, payload)?),
            "voice:ice-candidate" => InboundSignal::IceCandidate(de(event, payload)?),
            "voice:force-reconnect" => InboundSignal::ForceReconnect(de(event, payload)?),
            "voice:resync-request" => InboundSignal::ResyncRequest(de(event, payload)?),
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }

    /// Channel the signal is scoped to, when the payload carries one
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            InboundSignal::Participants(p) => Some(&p.channel_id),
            InboundSignal::UserJoined(_) | InboundSignal::UserLeft(_) => None,
            InboundSignal::Offer(p) | InboundSignal::Answer(p) => Some(&p.channel_id),
            InboundSignal::IceCandidate(p) => Some(&p.channel_id),
            InboundSignal::ForceReconnect(p) => Some(&p.channel_id),
            InboundSignal::ResyncRequest(p) => Some(&p.channel_id),
        }
    }
}
