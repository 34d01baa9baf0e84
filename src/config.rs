//! Configuration types for the voice connection core

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Built-in public STUN servers, always present ahead of any user entries
pub const BUILTIN_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Environment variable carrying the TURN server URL
pub const ENV_TURN_URL: &str = "TURN_URL";
/// Environment variable carrying the TURN username
pub const ENV_TURN_USER: &str = "TURN_USER";
/// Environment variable carrying the TURN credential
pub const ENV_TURN_PASS: &str = "TURN_PASS";

/// Identity of the local endpoint inside one voice channel
///
/// Immutable for the lifetime of a `VoiceConnection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceIdentity {
    /// Local peer ID on the signalling bus
    pub peer_id: String,

    /// Server (guild) hosting the channel
    pub server_id: String,

    /// Voice channel being joined
    pub channel_id: String,
}

/// A single STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (stun:, turn: or turns: scheme)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// A credential-less STUN entry
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Build TURN entries from explicit parts
///
/// When the URL uses the plain `turn:` scheme a `turns:` twin is derived so
/// TLS relaying is available without extra configuration.
pub fn turn_servers_from_parts(url: &str, username: &str, credential: &str) -> Vec<IceServerConfig> {
    let mut urls = vec![url.to_string()];
    if let Some(rest) = url.strip_prefix("turn:") {
        urls.push(format!("turns:{rest}"));
    }
    vec![IceServerConfig {
        urls,
        username: Some(username.to_string()),
        credential: Some(credential.to_string()),
    }]
}

/// Read TURN configuration from the environment (`TURN_URL`, `TURN_USER`,
/// `TURN_PASS`); empty when unset
pub fn turn_servers_from_env() -> Vec<IceServerConfig> {
    match (
        std::env::var(ENV_TURN_URL),
        std::env::var(ENV_TURN_USER),
        std::env::var(ENV_TURN_PASS),
    ) {
        (Ok(url), Ok(user), Ok(pass)) if !url.is_empty() => {
            turn_servers_from_parts(&url, &user, &pass)
        }
        _ => Vec::new(),
    }
}

/// External decoder subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Decoder binary (default: `ffmpeg`)
    pub decoder_bin: String,

    /// Probe binary used for FPS autodetection (default: `ffprobe`)
    pub probe_bin: String,

    /// User-Agent presented to HTTP inputs
    pub user_agent: String,

    /// Read timeout applied to HTTP inputs
    #[serde(with = "duration_millis")]
    pub http_read_timeout: Duration,

    /// Base back-off between empty-output retries (grows linearly with the
    /// attempt number)
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            decoder_bin: "ffmpeg".to_string(),
            probe_bin: "ffprobe".to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0"
                .to_string(),
            http_read_timeout: Duration::from_secs(15),
            retry_backoff: Duration::from_millis(1200),
        }
    }
}

/// Output canvas for decoded video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCanvas {
    /// Canvas width in pixels
    pub width: u32,
    /// Canvas height in pixels
    pub height: u32,
    /// Frame rate used when autodetection yields nothing usable
    pub default_fps: u32,
}

impl Default for VideoCanvas {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            default_fps: 30,
        }
    }
}

/// Main configuration for a `VoiceConnection`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Additional ICE servers appended after the built-in list and any
    /// environment-derived TURN entries
    pub ice_servers: Vec<IceServerConfig>,

    /// Gate verbose per-frame logging
    pub debug: bool,

    /// Hard cap on simultaneously connected peers (priority peers bypass it)
    pub max_connected_peers: usize,

    /// Decoder subprocess settings
    pub decoder: DecoderConfig,

    /// Video output canvas
    pub video: VideoCanvas,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            debug: false,
            max_connected_peers: 100,
            decoder: DecoderConfig::default(),
            video: VideoCanvas::default(),
        }
    }
}

impl VoiceConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `max_connected_peers` is zero
    /// - the video canvas has a zero dimension or odd (non-YUV420-friendly) size
    /// - `default_fps` is outside (1, 240)
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.max_connected_peers == 0 {
            return Err(Error::InvalidConfig(
                "max_connected_peers must be at least 1".to_string(),
            ));
        }

        let canvas = &self.video;
        if canvas.width == 0 || canvas.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "video canvas must be non-empty, got {}x{}",
                canvas.width, canvas.height
            )));
        }
        if canvas.width % 2 != 0 || canvas.height % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "video canvas dimensions must be even for yuv420p, got {}x{}",
                canvas.width, canvas.height
            )));
        }
        if canvas.default_fps <= 1 || canvas.default_fps >= 240 {
            return Err(Error::InvalidConfig(format!(
                "default_fps must be within (1, 240), got {}",
                canvas.default_fps
            )));
        }

        Ok(())
    }

    /// Full ICE server list: built-in STUN, then environment TURN, then the
    /// configured extras
    pub fn resolved_ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers: Vec<IceServerConfig> = BUILTIN_STUN_SERVERS
            .iter()
            .map(|url| IceServerConfig::stun(url))
            .collect();
        servers.extend(turn_servers_from_env());
        servers.extend(self.ice_servers.iter().cloned());
        servers
    }

    /// Append extra ICE servers (builder style)
    pub fn with_ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Enable verbose logging (builder style)
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
