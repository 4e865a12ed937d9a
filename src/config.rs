use crate::error::{ConfigError, Result as AppResult};
use crate::twitch::account::DEFAULT_USERSTATE_RELOAD_INTERVAL;
use crate::twitch::api::DEFAULT_HELIX_URL;
use crate::twitch::rate_limit::{RateLimitConfig, TierLimits};
use crate::twitch::server::ServerSettings;
use crate::emotes::bttv::DEFAULT_BTTV_URL;
use crate::emotes::ffz::DEFAULT_FFZ_URL;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

const MAX_TIER_MESSAGES: usize = 10_000;
const MAX_TIER_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Account credentials. A missing username or token means anonymous.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub oauth_token: Option<String>,
    pub client_id: Option<String>,
}

impl AccountConfig {
    pub fn is_anonymous(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        !(filled(&self.username) && filled(&self.oauth_token))
    }
}

#[derive(Debug, Deserialize)]
pub struct IrcConfig {
    pub host: String,
    pub port: u16,
    pub single_connection: bool,
    #[serde(deserialize_with = "deserialize_channel_list")]
    pub channels: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TierConfig {
    pub max_messages: usize,
    pub window_secs: u64,
    pub min_interval_ms: u64,
}

impl TierConfig {
    fn to_limits(&self, tier: &str) -> AppResult<TierLimits> {
        if self.max_messages == 0 || self.window_secs == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "rate_limits.{} needs a non-zero max_messages and window_secs",
                tier
            ))
            .into());
        }
        if self.max_messages > MAX_TIER_MESSAGES
            || self.window_secs > MAX_TIER_WINDOW_SECS
            || self.min_interval_ms > self.window_secs * 1000
        {
            return Err(ConfigError::InvalidValue(format!(
                "rate_limits.{} allows at most {} messages per {} s window, with min_interval_ms inside the window",
                tier, MAX_TIER_MESSAGES, MAX_TIER_WINDOW_SECS
            ))
            .into());
        }
        Ok(TierLimits {
            max_messages: self.max_messages,
            window: Duration::from_secs(self.window_secs),
            min_interval: Duration::from_millis(self.min_interval_ms),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimitsConfig {
    pub regular: TierConfig,
    pub moderator: TierConfig,
    pub warning_cooldown_secs: u64,
}

impl RateLimitsConfig {
    pub fn to_config(&self) -> AppResult<RateLimitConfig> {
        Ok(RateLimitConfig {
            regular: self.regular.to_limits("regular")?,
            moderator: self.moderator.to_limits("moderator")?,
            warning_cooldown: Duration::from_secs(self.warning_cooldown_secs),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub helix_url: String,
    pub bttv_url: String,
    pub ffz_url: String,
}

#[derive(Debug, Deserialize)]
pub struct EmotesConfig {
    pub userstate_reload_interval_secs: u64,
}

impl EmotesConfig {
    pub fn userstate_reload_interval(&self) -> Duration {
        Duration::from_secs(self.userstate_reload_interval_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub account: AccountConfig,
    pub irc: IrcConfig,
    pub rate_limits: RateLimitsConfig,
    pub api: ApiConfig,
    pub emotes: EmotesConfig,
}

impl AppSettings {
    pub fn server_settings(&self) -> AppResult<ServerSettings> {
        Ok(ServerSettings {
            irc_host: self.irc.host.clone(),
            irc_port: self.irc.port,
            single_connection: self.irc.single_connection,
            rate_limits: self.rate_limits.to_config()?,
            bttv_url: self.api.bttv_url.clone(),
            ffz_url: self.api.ffz_url.clone(),
        })
    }
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
    let defaults = RateLimitConfig::default();
    builder
        .set_default("irc.host", "irc.chat.twitch.tv")?
        .set_default("irc.port", 6667i64)?
        .set_default("irc.single_connection", false)?
        .set_default("irc.channels", Vec::<String>::new())?
        .set_default("rate_limits.regular.max_messages", defaults.regular.max_messages as i64)?
        .set_default("rate_limits.regular.window_secs", defaults.regular.window.as_secs() as i64)?
        .set_default(
            "rate_limits.regular.min_interval_ms",
            defaults.regular.min_interval.as_millis() as i64,
        )?
        .set_default("rate_limits.moderator.max_messages", defaults.moderator.max_messages as i64)?
        .set_default(
            "rate_limits.moderator.window_secs",
            defaults.moderator.window.as_secs() as i64,
        )?
        .set_default(
            "rate_limits.moderator.min_interval_ms",
            defaults.moderator.min_interval.as_millis() as i64,
        )?
        .set_default(
            "rate_limits.warning_cooldown_secs",
            defaults.warning_cooldown.as_secs() as i64,
        )?
        .set_default("api.helix_url", DEFAULT_HELIX_URL)?
        .set_default("api.bttv_url", DEFAULT_BTTV_URL)?
        .set_default("api.ffz_url", DEFAULT_FFZ_URL)?
        .set_default(
            "emotes.userstate_reload_interval_secs",
            DEFAULT_USERSTATE_RELOAD_INTERVAL.as_secs() as i64,
        )
}

fn build_settings(builder: ConfigBuilder<DefaultState>) -> AppResult<AppSettings> {
    let settings = with_defaults(builder)
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;
    settings.rate_limits.to_config()?;
    Ok(settings)
}

/// Reads `CHATLINE__*` environment variables and an optional `chatline.toml`.
pub fn load_settings() -> AppResult<AppSettings> {
    let builder = Config::builder()
        .add_source(
            Environment::with_prefix("CHATLINE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("irc.channels")
                .try_parsing(true),
        )
        .add_source(File::with_name("chatline").required(false));
    build_settings(builder)
}

fn deserialize_channel_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let clean = |s: &str| s.trim().trim_start_matches('#').to_lowercase();
    let mut channels: Vec<String> = match Value::deserialize(deserializer)? {
        Value::String(s) => s.split(',').map(clean).collect(),
        Value::Array(arr) => arr
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(clean(&s)),
                _ => Err(D::Error::custom("Array must contain only strings")),
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(D::Error::custom("Expected string or array of strings")),
    };
    channels.retain(|c| !c.is_empty());
    channels.dedup();
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> AppResult<AppSettings> {
        build_settings(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn test_defaults_without_any_source() {
        let settings = from_toml("").unwrap();
        assert!(settings.account.is_anonymous());
        assert_eq!(settings.irc.host, "irc.chat.twitch.tv");
        assert_eq!(settings.irc.port, 6667);
        assert!(settings.irc.channels.is_empty());
        assert_eq!(
            settings.rate_limits.to_config().unwrap(),
            RateLimitConfig::default()
        );
        assert_eq!(settings.emotes.userstate_reload_interval(), Duration::from_secs(60));
        assert_eq!(settings.api.helix_url, DEFAULT_HELIX_URL);
    }

    #[test]
    fn test_file_overrides_and_channel_cleanup() {
        let settings = from_toml(
            r##"
            [account]
            username = "pajlada"
            oauth_token = "oauth:abc"

            [irc]
            single_connection = true
            channels = ["#Forsen", "pajlada", ""]

            [rate_limits.regular]
            max_messages = 5
            min_interval_ms = 0
            "##,
        )
        .unwrap();

        assert!(!settings.account.is_anonymous());
        assert_eq!(settings.irc.channels, vec!["forsen", "pajlada"]);

        let server = settings.server_settings().unwrap();
        assert!(server.single_connection);
        assert_eq!(server.rate_limits.regular.max_messages, 5);
        assert_eq!(server.rate_limits.regular.window, Duration::from_secs(30));
        assert_eq!(server.rate_limits.regular.min_interval, Duration::ZERO);
        assert_eq!(server.rate_limits.moderator.max_messages, 100);
    }

    #[test]
    fn test_comma_separated_channels() {
        let settings = from_toml(
            r#"
            [irc]
            channels = "a, #B"
            "#,
        )
        .unwrap();
        assert_eq!(settings.irc.channels, vec!["a", "b"]);
    }

    #[test]
    fn test_zero_capacity_tier_rejected() {
        let err = from_toml(
            r#"
            [rate_limits.moderator]
            max_messages = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::AppError::Config(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_oversized_tier_rejected() {
        for toml in [
            "[rate_limits.moderator]\nmax_messages = 9223372036854775807",
            "[rate_limits.regular]\nwindow_secs = 100000000",
            "[rate_limits.regular]\nmin_interval_ms = 31000",
        ] {
            let err = from_toml(toml).unwrap_err();
            assert!(
                matches!(err, crate::error::AppError::Config(ConfigError::InvalidValue(_))),
                "{}",
                toml
            );
        }
        assert!(from_toml("[rate_limits.moderator]\nmax_messages = 10000").is_ok());
    }
}
