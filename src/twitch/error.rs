use thiserror::Error;

use super::rate_limit::ThrottleReason;

#[derive(Error, Debug)]
pub enum TwitchError {
    #[error("Message not sent: {0}")]
    Throttled(ThrottleReason),
    #[error("Twitch API request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("JSON deserialization failed: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Twitch IRC authentication error: {0}")]
    TwitchAuth(String),
    #[error("IRC message parsing error: {0}")]
    ParseError(String),
    #[error("Not connected to Twitch chat")]
    NotConnected,
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),
    #[error("IRC connection closed: {0}")]
    ConnectionClosed(String),
}

impl TwitchError {
    /// Throttle rejections are the only failures the user can simply retry.
    pub fn is_throttled(&self) -> bool {
        matches!(self, TwitchError::Throttled(_))
    }
}

pub type Result<T, E = TwitchError> = std::result::Result<T, E>;
