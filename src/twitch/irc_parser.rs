use super::error::TwitchError;
use super::types::ParsedTwitchMessage;
use chrono::Utc;
use std::collections::HashMap;

pub const TWITCH_CAPABILITIES: &str =
    "CAP REQ :twitch.tv/membership twitch.tv/tags twitch.tv/commands";

pub const CMD_CAP: &str = "CAP";
pub const CMD_JOIN: &str = "JOIN";
pub const CMD_PART: &str = "PART";
pub const CMD_NICK: &str = "NICK";
pub const CMD_PASS: &str = "PASS";
pub const CMD_PING: &str = "PING";
pub const CMD_PONG: &str = "PONG";
pub const CMD_PRIVMSG: &str = "PRIVMSG";
pub const CMD_NOTICE: &str = "NOTICE";
pub const CMD_RECONNECT: &str = "RECONNECT";
pub const CMD_USERNOTICE: &str = "USERNOTICE";
pub const CMD_USERSTATE: &str = "USERSTATE";
pub const CMD_GLOBALUSERSTATE: &str = "GLOBALUSERSTATE";
pub const CMD_ROOMSTATE: &str = "ROOMSTATE";
pub const CMD_WHISPER: &str = "WHISPER";
pub const CMD_CLEARCHAT: &str = "CLEARCHAT";

pub const RPL_WELCOME: &str = "001";
pub const IRC_ACK: &str = "ACK";
pub const IRC_NAK: &str = "NAK";

pub const AUTH_ERROR_LOGIN_FAILED: &str = "Login authentication failed";
pub const AUTH_ERROR_IMPROPERLY_FORMATTED: &str = "Improperly formatted auth";

const ACTION_PREFIX: &str = "\u{1}ACTION ";

#[derive(Debug, Default)]
pub struct IrcMessage<'a> {
    raw: &'a str,
    tags: Option<&'a str>,
    prefix: Option<&'a str>,
    command: Option<&'a str>,
    params: Vec<&'a str>,
}

impl<'a> IrcMessage<'a> {
    pub fn raw(&self) -> &'a str {
        self.raw
    }

    pub fn command(&self) -> Option<&'a str> {
        self.command
    }

    pub fn prefix(&self) -> Option<&'a str> {
        self.prefix
    }

    pub fn params(&self) -> &[&'a str] {
        &self.params
    }

    pub fn parse(line: &'a str) -> Result<Self, TwitchError> {
        let mut message = IrcMessage {
            raw: line,
            ..Default::default()
        };
        let mut remainder = line.trim_end_matches(['\r', '\n']);

        if remainder.starts_with('@') {
            let space_idx = remainder
                .find(' ')
                .ok_or_else(|| TwitchError::ParseError(format!("tags without command: {}", line)))?;
            message.tags = Some(&remainder[1..space_idx]);
            remainder = &remainder[space_idx + 1..];
        }
        if remainder.starts_with(':') {
            let space_idx = remainder.find(' ').ok_or_else(|| {
                TwitchError::ParseError(format!("prefix without command: {}", line))
            })?;
            message.prefix = Some(&remainder[1..space_idx]);
            remainder = &remainder[space_idx + 1..];
        }

        let (middle, trailing) = if let Some(trail_marker_idx) = remainder.find(" :") {
            (
                &remainder[..trail_marker_idx],
                Some(&remainder[trail_marker_idx + 2..]),
            )
        } else if let Some(stripped) = remainder.strip_prefix(':') {
            ("", Some(stripped))
        } else {
            (remainder, None)
        };

        let mut parts = middle.split(' ').filter(|s| !s.is_empty());
        message.command = parts.next();
        message.params.extend(parts);
        if let Some(trailing_param) = trailing {
            message.params.push(trailing_param);
        }

        if message.command.is_none() {
            return Err(TwitchError::ParseError(format!("missing command: {}", line)));
        }
        Ok(message)
    }

    pub fn get_tag_value(&self, key_to_find: &str) -> Option<&'a str> {
        self.tags.and_then(|tags_str| {
            tags_str.split(';').find_map(|component| {
                let mut parts = component.splitn(2, '=');
                let key = parts.next()?;
                if key == key_to_find {
                    parts.next().or(Some(""))
                } else {
                    None
                }
            })
        })
    }

    /// Tag value with IRCv3 escapes resolved.
    pub fn tag(&self, key: &str) -> Option<String> {
        self.get_tag_value(key).map(unescape_tag_value)
    }

    pub fn tags_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(tags_str) = self.tags {
            for component in tags_str.split(';') {
                let mut parts = component.splitn(2, '=');
                if let Some(key) = parts.next().filter(|k| !k.is_empty()) {
                    map.insert(
                        key.to_string(),
                        unescape_tag_value(parts.next().unwrap_or("")),
                    );
                }
            }
        }
        map
    }

    pub fn get_display_name(&self) -> Option<&'a str> {
        self.get_tag_value("display-name").filter(|s| !s.is_empty())
    }

    pub fn get_prefix_username(&self) -> Option<&'a str> {
        self.prefix.and_then(|p| p.split('!').next())
    }

    /// Channel name of the first parameter, without the leading `#`.
    pub fn channel(&self) -> Option<&'a str> {
        self.params
            .first()
            .and_then(|p| p.strip_prefix('#'))
            .filter(|c| !c.is_empty())
    }

    /// Trailing text of commands that carry one (PRIVMSG, NOTICE, WHISPER, ...).
    pub fn trailing(&self) -> Option<&'a str> {
        if self.params.len() > 1 {
            self.params.last().copied()
        } else {
            None
        }
    }

    pub fn badges(&self) -> Vec<(&'a str, &'a str)> {
        self.get_tag_value("badges")
            .map(|badges| {
                badges
                    .split(',')
                    .filter_map(|badge| {
                        let mut parts = badge.splitn(2, '/');
                        let name = parts.next().filter(|n| !n.is_empty())?;
                        Some((name, parts.next().unwrap_or("")))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_badge(&self, name: &str) -> bool {
        self.badges().iter().any(|(badge, _)| *badge == name)
    }

    /// Emote set keys of a USERSTATE or GLOBALUSERSTATE line.
    pub fn emote_sets(&self) -> Vec<String> {
        self.get_tag_value("emote-sets")
            .map(|sets| {
                sets.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Converts a PRIVMSG or WHISPER into a chat message. For WHISPER the
    /// channel is the sender's login.
    pub fn to_parsed_twitch_message(&self) -> Option<ParsedTwitchMessage> {
        let command = self.command?;
        let channel = match command {
            CMD_PRIVMSG => self.channel()?.to_lowercase(),
            CMD_WHISPER => self.get_prefix_username()?.to_lowercase(),
            _ => return None,
        };

        let mut text = self.trailing()?;
        let mut is_action = false;
        if let Some(action) = text.strip_prefix(ACTION_PREFIX) {
            text = action.strip_suffix('\u{1}').unwrap_or(action);
            is_action = true;
        }
        let text = trim_invisible_suffix(text.trim()).to_string();

        let sender_login = self
            .get_prefix_username()
            .unwrap_or("unknown_user")
            .to_string();
        let sender_display_name = self
            .get_display_name()
            .map(str::to_string)
            .unwrap_or_else(|| sender_login.clone());
        let badges = self.get_tag_value("badges").map(str::to_string);
        let is_moderator = self.get_tag_value("mod") == Some("1") || self.has_badge("moderator");
        let is_subscriber =
            self.get_tag_value("subscriber") == Some("1") || self.has_badge("subscriber");
        let raw_tags_map = self.tags_map();

        Some(ParsedTwitchMessage {
            channel,
            sender_login,
            sender_display_name,
            sender_user_id: self.get_tag_value("user-id").map(str::to_string),
            text,
            is_action,
            badges,
            is_moderator,
            is_subscriber,
            message_id: self.get_tag_value("id").map(str::to_string),
            raw_irc_tags: if raw_tags_map.is_empty() {
                None
            } else {
                Some(raw_tags_map)
            },
            timestamp: Utc::now(),
        })
    }
}

/// Strips trailing characters some clients append to dodge duplicate-message
/// filters (zero width spaces, tag characters, variation selectors).
fn trim_invisible_suffix(text: &str) -> &str {
    text.trim_end_matches(|c: char| {
        let code = c as u32;
        c.is_control()
            || c.is_whitespace()
            || (0xE0000..=0xE007F).contains(&code)
            || matches!(code, 0x200B | 0x200C | 0x200D | 0xFE0F | 0x034F)
    })
}

pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVMSG: &str = "@badge-info=;badges=moderator/1,subscriber/12;color=#FF0000;display-name=Forsen;emotes=;id=abc-123;mod=1;room-id=22484632;subscriber=1;user-id=22484632 :forsen!forsen@forsen.tmi.twitch.tv PRIVMSG #pajlada :hello chat\u{200B}\r\n";

    #[test]
    fn test_parse_privmsg_into_chat_message() {
        let msg = IrcMessage::parse(PRIVMSG).unwrap();
        assert_eq!(msg.command(), Some(CMD_PRIVMSG));
        assert_eq!(msg.channel(), Some("pajlada"));

        let parsed = msg.to_parsed_twitch_message().unwrap();
        assert_eq!(parsed.channel, "pajlada");
        assert_eq!(parsed.sender_login, "forsen");
        assert_eq!(parsed.sender_display_name, "Forsen");
        assert_eq!(parsed.sender_user_id.as_deref(), Some("22484632"));
        assert_eq!(parsed.text, "hello chat");
        assert!(parsed.is_moderator);
        assert!(parsed.is_subscriber);
        assert!(!parsed.is_action);
        assert_eq!(parsed.message_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_parse_action_message() {
        let line = ":a!a@a.tmi.twitch.tv PRIVMSG #chan :\u{1}ACTION waves\u{1}";
        let parsed = IrcMessage::parse(line)
            .unwrap()
            .to_parsed_twitch_message()
            .unwrap();
        assert!(parsed.is_action);
        assert_eq!(parsed.text, "waves");
        assert_eq!(parsed.sender_display_name, "a");
    }

    #[test]
    fn test_parse_whisper_uses_sender_as_channel() {
        let line = "@display-name=Someone;user-id=42 :someone!someone@someone.tmi.twitch.tv WHISPER me :psst";
        let parsed = IrcMessage::parse(line)
            .unwrap()
            .to_parsed_twitch_message()
            .unwrap();
        assert_eq!(parsed.channel, "someone");
        assert_eq!(parsed.text, "psst");
    }

    #[test]
    fn test_parse_ping_and_welcome() {
        let ping = IrcMessage::parse("PING :tmi.twitch.tv").unwrap();
        assert_eq!(ping.command(), Some(CMD_PING));
        assert_eq!(ping.params(), &["tmi.twitch.tv"]);

        let welcome = IrcMessage::parse(":tmi.twitch.tv 001 justinfan123 :Welcome, GLHF!").unwrap();
        assert_eq!(welcome.command(), Some(RPL_WELCOME));
        assert_eq!(welcome.trailing(), Some("Welcome, GLHF!"));
    }

    #[test]
    fn test_parse_rejects_lines_without_command() {
        assert!(IrcMessage::parse("").is_err());
        assert!(IrcMessage::parse("@a=b").is_err());
        assert!(IrcMessage::parse(":prefix.only").is_err());
    }

    #[test]
    fn test_userstate_emote_sets_and_badges() {
        let line = "@badges=vip/1;emote-sets=0,33,300374282;mod=0 :tmi.twitch.tv USERSTATE #chan";
        let msg = IrcMessage::parse(line).unwrap();
        assert_eq!(msg.emote_sets(), vec!["0", "33", "300374282"]);
        assert!(msg.has_badge("vip"));
        assert!(!msg.has_badge("moderator"));
        assert_eq!(msg.channel(), Some("chan"));
    }

    #[test]
    fn test_unescape_tag_value() {
        assert_eq!(
            unescape_tag_value(r"5\sgifted\ssubs\:\sthanks\\"),
            r"5 gifted subs; thanks\"
        );
        let msg = IrcMessage::parse(
            r"@msg-id=sub;system-msg=ronni\shas\ssubscribed! :tmi.twitch.tv USERNOTICE #dallas",
        )
        .unwrap();
        assert_eq!(msg.tag("system-msg").as_deref(), Some("ronni has subscribed!"));
        assert_eq!(msg.tags_map().get("msg-id").map(String::as_str), Some("sub"));
    }
}
