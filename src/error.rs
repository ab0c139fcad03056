//! Error types for the voice interface

use thiserror::Error;

/// Result type alias for voice interface operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice interface
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone unavailable or access denied
    #[error("device error: {0}")]
    Device(String),

    /// Decode, downmix or resample failure
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Backend reported a transcription failure
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Backend reported a speech synthesis failure
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Response audio could not be fetched, decoded or played
    #[error("playback error: {0}")]
    Playback(String),

    /// Missing or invalid configuration (e.g. no webhook URL)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Message suitable for showing to the user
    ///
    /// Backend-supplied details pass through verbatim; everything else maps
    /// to a generic message for its kind.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Transcription(detail)
            | Self::Synthesis(detail)
            | Self::Configuration(detail) => detail.clone(),
            Self::Device(_) => {
                "Could not access the microphone. Check permissions and try again.".to_string()
            }
            Self::Encoding(_) => "Could not convert the recorded audio.".to_string(),
            Self::Playback(_) => "Could not play the response audio.".to_string(),
            Self::Http(_) => "Could not reach the voice server.".to_string(),
            Self::Io(_) | Self::Serialization(_) | Self::Toml(_) => {
                "An unexpected error occurred.".to_string()
            }
        }
    }

    /// Whether a user retry can reasonably succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Device(_) | Self::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_detail_passes_through() {
        let err = Error::Transcription("Audio file is too short".to_string());
        assert_eq!(err.user_message(), "Audio file is too short");
    }

    #[test]
    fn test_device_error_is_retryable() {
        let err = Error::Device("permission denied".to_string());
        assert!(err.is_retryable());
        assert!(!err.user_message().contains("permission denied"));
        assert!(!Error::Configuration("x".to_string()).is_retryable());
    }
}
