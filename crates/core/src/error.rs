/// Result alias that carries the custom [`ReactorError`] type.
pub type Result<T> = std::result::Result<T, ReactorError>;

/// Common error type for the core crate.
///
/// Only source acquisition can fail. The per-frame analysis path never
/// returns an error: with no source attached it simply decays.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The supplied bytes could not be decoded into audio. No source is left
    /// attached when this is returned.
    #[error("failed to decode audio: {0}")]
    Decode(String),
    /// Access to the capture device was refused.
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),
    /// No usable capture device, or the device failed while opening.
    #[error("audio device unavailable: {0}")]
    Device(String),
    /// A configuration file could not be interpreted.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl ReactorError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns true for the errors that come out of opening a capture device.
    pub fn is_capture_error(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::Device(_))
    }
}

impl From<&str> for ReactorError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ReactorError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_capture_errors() {
        assert!(ReactorError::PermissionDenied("denied".into()).is_capture_error());
        assert!(ReactorError::Device("gone".into()).is_capture_error());
        assert!(!ReactorError::Decode("bad header".into()).is_capture_error());
    }

    #[test]
    fn formats_decode_errors() {
        let err = ReactorError::Decode("unsupported codec".into());
        assert_eq!(err.to_string(), "failed to decode audio: unsupported codec");
    }
}
