//! Error types for talkback

use thiserror::Error;

/// Result type alias for talkback operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, bad value)
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure talking to the STT or TTS service
    #[error("connection error: {0}")]
    Connection(String),

    /// Empty text passed to speech synthesis
    #[error("no text to synthesize")]
    EmptyText,

    /// Inbound service event could not be parsed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// LLM service returned an error
    #[error("LLM error: {0}")]
    Llm(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether this error came from the network transport
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::WebSocket(_) | Self::Http(_))
    }
}
