use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The device granted no camera/microphone permission. Fatal for the session.
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// The relay refused or failed to store an envelope
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Malformed or unexpected remote description/candidate
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already joined: {0}")]
    AlreadyJoined(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Errors the user has to see. Everything else is contained at the
    /// peer-session boundary and only degrades one remote's video.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MediaAccessDenied(_)
                | Self::Directory(_)
                | Self::AlreadyJoined(_)
                | Self::InvalidInput(_)
                | Self::Configuration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
