use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionRole {
    Read,
    Write,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Read => f.write_str("read"),
            ConnectionRole::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TwitchConnectionStatus {
    Initializing,
    Connecting {
        attempt: u32,
    },
    Authenticating {
        attempt: u32,
    },
    Connected,
    Reconnecting {
        reason: String,
        failed_attempt: u32,
        retry_in: Duration,
    },
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedTwitchMessage {
    pub channel: String,
    pub sender_login: String,
    pub sender_display_name: String,
    pub sender_user_id: Option<String>,
    pub text: String,
    pub is_action: bool,
    pub badges: Option<String>,
    pub is_moderator: bool,
    pub is_subscriber: bool,
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_irc_tags: Option<HashMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a follow check. `Failed` is kept apart from `NotFollowing` so
/// callers can tell a broken request from a negative answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FollowResult {
    Following,
    NotFollowing,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TwitchUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
}
