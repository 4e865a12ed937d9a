pub mod config;
pub mod emotes;
pub mod error;
pub mod twitch;
