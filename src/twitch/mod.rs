pub mod account;
pub mod api;
pub mod channel;
pub mod connection;
pub mod error;
pub mod irc_parser;
pub mod rate_limit;
pub mod server;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use account::{AccountEvent, TwitchAccount, TwitchAccountEmoteData};
pub use api::{AutomodAction, HelixClient, TwitchApi};
pub use channel::{ChannelKind, ChannelMessage, TwitchChannel};
pub use error::TwitchError;
pub use rate_limit::{RateLimitConfig, RateTier, SendGate, ThrottleReason, TierLimits};
pub use server::{ServerHandle, ServerSettings, TwitchServer};
pub use types::{FollowResult, ParsedTwitchMessage, TwitchConnectionStatus, TwitchUser};
