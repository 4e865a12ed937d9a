use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

use super::rate_limit::RateTier;
use super::types::ParsedTwitchMessage;

const MESSAGE_LIMIT: usize = 1000;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelKind {
    Regular,
    Whispers,
    Mentions,
    /// Placeholder returned by lookups that found nothing.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub enum ChannelMessage {
    Chat(ParsedTwitchMessage),
    System {
        text: String,
        timestamp: DateTime<Utc>,
    },
}

impl ChannelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        ChannelMessage::System {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            ChannelMessage::Chat(msg) => &msg.text,
            ChannelMessage::System { text, .. } => text,
        }
    }
}

/// Our own standing in a channel, from its most recent USERSTATE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserState {
    pub is_moderator: bool,
    pub is_vip: bool,
    pub is_broadcaster: bool,
}

#[derive(Debug)]
pub struct TwitchChannel {
    name: String,
    kind: ChannelKind,
    room_id: RwLock<Option<String>>,
    user_state: RwLock<UserState>,
    messages: RwLock<VecDeque<ChannelMessage>>,
    events: broadcast::Sender<ChannelMessage>,
}

impl TwitchChannel {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            name: name.into(),
            kind,
            room_id: RwLock::new(None),
            user_state: RwLock::new(UserState::default()),
            messages: RwLock::new(VecDeque::new()),
            events,
        }
    }

    pub fn empty() -> Self {
        Self::new("", ChannelKind::Empty)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_empty_channel(&self) -> bool {
        self.kind == ChannelKind::Empty
    }

    /// Only regular channels accept outgoing chat.
    pub fn can_send(&self) -> bool {
        self.kind == ChannelKind::Regular
    }

    pub fn room_id(&self) -> Option<String> {
        self.room_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_room_id(&self, room_id: impl Into<String>) {
        *self.room_id.write().unwrap_or_else(PoisonError::into_inner) = Some(room_id.into());
    }

    pub fn user_state(&self) -> UserState {
        self.user_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_user_state(&self, state: UserState) {
        *self.user_state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn has_high_rate_limit(&self) -> bool {
        let state = self.user_state();
        state.is_moderator || state.is_vip || state.is_broadcaster
    }

    pub fn rate_tier(&self) -> RateTier {
        if self.has_high_rate_limit() {
            RateTier::Moderator
        } else {
            RateTier::Regular
        }
    }

    pub fn add_message(&self, message: ChannelMessage) {
        {
            let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
            if messages.len() >= MESSAGE_LIMIT {
                messages.pop_front();
            }
            messages.push_back(message.clone());
        }
        // No receivers is fine, nobody is watching this channel.
        let _ = self.events.send(message);
    }

    pub fn add_system_message(&self, text: impl Into<String>) {
        self.add_message(ChannelMessage::system(text));
    }

    pub fn messages(&self) -> Vec<ChannelMessage> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.events.subscribe()
    }
}
