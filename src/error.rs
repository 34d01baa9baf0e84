//! Error types for the voice connection core

/// Result type alias using the voicemesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in voice connection operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The signalling bus is unavailable
    #[error("Signalling transport disconnected: {0}")]
    TransportDisconnected(String),

    /// The WebRTC stack refused to construct a connection
    #[error("Failed to build peer connection: {0}")]
    PeerConnectionBuild(String),

    /// An offer/answer/candidate operation failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Peer not found in the session map
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The decoder exited without producing any frames
    #[error("Decoder produced no output: {0}")]
    DecoderExitedEmpty(String),

    /// The decoder subprocess could not be spawned
    #[error("Decoder failed to spawn: {0}")]
    DecoderSpawnFailed(String),

    /// The decoder input file does not exist
    #[error("Input file missing: {0}")]
    DecoderFileMissing(String),

    /// Admission rejected: the mesh is at capacity
    #[error("Peer capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Duplicate admission or duplicate in-flight operation
    #[error("Already active: {0}")]
    AlreadyActive(String),

    /// Media track operation failed
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportDisconnected(_)
                | Error::DecoderExitedEmpty(_)
                | Error::DecoderSpawnFailed(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is swallowed by the orchestrator (log only,
    /// never surfaced to the caller)
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::CapacityExceeded(_) | Error::AlreadyActive(_))
    }

    /// Check if this error terminates a playback
    pub fn is_playback_fatal(&self) -> bool {
        matches!(
            self,
            Error::DecoderExitedEmpty(_)
                | Error::DecoderSpawnFailed(_)
                | Error::DecoderFileMissing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::TransportDisconnected("test".to_string()).is_retryable());
        assert!(Error::DecoderExitedEmpty("test".to_string()).is_retryable());
        assert!(!Error::DecoderFileMissing("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_silent() {
        assert!(Error::CapacityExceeded("full".to_string()).is_silent());
        assert!(Error::AlreadyActive("dup".to_string()).is_silent());
        assert!(!Error::NegotiationFailed("x".to_string()).is_silent());
    }

    #[test]
    fn test_error_is_playback_fatal() {
        assert!(Error::DecoderFileMissing("a.wav".to_string()).is_playback_fatal());
        assert!(!Error::CapacityExceeded("full".to_string()).is_playback_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
    }
}
