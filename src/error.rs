use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Tool dispatch error: {0}")]
    Dispatch(String),

    #[error("Session is closed")]
    ClosedSession,

    #[error("Session is not ready yet")]
    NotReady,

    #[error("A live session is already active")]
    AlreadyActive,

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Invalid connection state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Location error: {0}")]
    Location(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    #[cfg(feature = "audio-resampling")]
    #[error("Audio resampling error: {0}")]
    AudioResampling(String),
}

impl LiveError {
    /// Microphone or output device problems, raised before any network activity.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            LiveError::PermissionDenied(_) | LiveError::DeviceUnavailable(_)
        )
    }

    /// Errors that only mean a callback raced with teardown.
    pub fn is_benign(&self) -> bool {
        matches!(self, LiveError::ClosedSession)
    }
}

impl From<base64::DecodeError> for LiveError {
    fn from(err: base64::DecodeError) -> Self {
        LiveError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_base64_error_maps_to_decode() {
        let err: LiveError = base64::engine::general_purpose::STANDARD
            .decode("***")
            .unwrap_err()
            .into();
        assert!(matches!(err, LiveError::Decode(_)));
        assert!(!err.is_benign());
    }

    #[test]
    fn test_error_classification() {
        assert!(LiveError::PermissionDenied("denied".into()).is_device_error());
        assert!(LiveError::DeviceUnavailable("none".into()).is_device_error());
        assert!(!LiveError::Connection("refused".into()).is_device_error());
        assert!(LiveError::ClosedSession.is_benign());
    }
}
