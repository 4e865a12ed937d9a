use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::account::TwitchAccount;
use super::channel::{ChannelKind, ChannelMessage, TwitchChannel, UserState};
use super::connection::{IrcConnection, IrcEvent, IrcLogin};
use super::error::{Result as TwitchResult, TwitchError};
use super::irc_parser::{
    AUTH_ERROR_IMPROPERLY_FORMATTED, AUTH_ERROR_LOGIN_FAILED, CMD_CAP, CMD_CLEARCHAT,
    CMD_GLOBALUSERSTATE, CMD_JOIN, CMD_NOTICE, CMD_PART, CMD_PING, CMD_PONG, CMD_PRIVMSG,
    CMD_RECONNECT, CMD_ROOMSTATE, CMD_USERNOTICE, CMD_USERSTATE, CMD_WHISPER, IRC_ACK, IRC_NAK,
    IrcMessage, RPL_WELCOME,
};
use super::rate_limit::{Admission, RateLimitConfig, SendGate};
use super::types::{ConnectionRole, TwitchConnectionStatus};
use crate::emotes::bttv::DEFAULT_BTTV_URL;
use crate::emotes::ffz::DEFAULT_FFZ_URL;
use crate::emotes::{BttvEmotes, FfzEmotes};

pub const WHISPERS_CHANNEL_NAME: &str = "/whispers";
pub const MENTIONS_CHANNEL_NAME: &str = "/mentions";

const EVENT_BUFFER: usize = 512;
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub irc_host: String,
    pub irc_port: u16,
    pub single_connection: bool,
    pub rate_limits: RateLimitConfig,
    pub bttv_url: String,
    pub ffz_url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            irc_host: "irc.chat.twitch.tv".to_string(),
            irc_port: 6667,
            single_connection: false,
            rate_limits: RateLimitConfig::default(),
            bttv_url: DEFAULT_BTTV_URL.to_string(),
            ffz_url: DEFAULT_FFZ_URL.to_string(),
        }
    }
}

/// What the connection loop should do after a line was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineOutcome {
    Continue,
    Welcomed,
    Reconnect(String),
}

#[derive(Debug, Default)]
struct ConnectionSlot {
    writer: Option<mpsc::Sender<String>>,
    ready: bool,
}

/// Twitch flavoured IRC server: channel registry, special channels,
/// outgoing rate limiting and dispatch of incoming chat lines.
pub struct TwitchServer {
    settings: ServerSettings,
    account: RwLock<Arc<TwitchAccount>>,
    account_generation: watch::Sender<u64>,
    channels: RwLock<HashMap<String, Arc<TwitchChannel>>>,
    whispers_channel: Arc<TwitchChannel>,
    mentions_channel: Arc<TwitchChannel>,
    empty_channel: Arc<TwitchChannel>,
    last_user_that_whispered_me: RwLock<Option<String>>,
    send_gate: Mutex<SendGate>,
    read_slot: Mutex<ConnectionSlot>,
    write_slot: Mutex<ConnectionSlot>,
    read_status: watch::Sender<TwitchConnectionStatus>,
    write_status: watch::Sender<TwitchConnectionStatus>,
    bttv: BttvEmotes,
    ffz: FfzEmotes,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Case-insensitive whole-word search, used for mention highlights.
fn mentions_name(text: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word.eq_ignore_ascii_case(name))
}

impl TwitchServer {
    pub fn new(settings: ServerSettings, account: Arc<TwitchAccount>) -> Arc<Self> {
        let (account_generation, _) = watch::channel(0);
        let (read_status, _) = watch::channel(TwitchConnectionStatus::Initializing);
        let (write_status, _) = watch::channel(TwitchConnectionStatus::Initializing);
        Arc::new(Self {
            send_gate: Mutex::new(SendGate::new(settings.rate_limits)),
            bttv: BttvEmotes::new(settings.bttv_url.clone()),
            ffz: FfzEmotes::new(settings.ffz_url.clone()),
            settings,
            account: RwLock::new(account),
            account_generation,
            channels: RwLock::new(HashMap::new()),
            whispers_channel: Arc::new(TwitchChannel::new(
                WHISPERS_CHANNEL_NAME,
                ChannelKind::Whispers,
            )),
            mentions_channel: Arc::new(TwitchChannel::new(
                MENTIONS_CHANNEL_NAME,
                ChannelKind::Mentions,
            )),
            empty_channel: Arc::new(TwitchChannel::empty()),
            last_user_that_whispered_me: RwLock::new(None),
            read_slot: Mutex::new(ConnectionSlot::default()),
            write_slot: Mutex::new(ConnectionSlot::default()),
            read_status,
            write_status,
        })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn account(&self) -> Arc<TwitchAccount> {
        Arc::clone(&self.account.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Switches the active account. Running connections re-register with the
    /// new credentials and the send windows start over.
    pub fn set_account(&self, account: Arc<TwitchAccount>) {
        tracing::info!(account = %account, "Switching Twitch account");
        *self.account.write().unwrap_or_else(PoisonError::into_inner) = account;
        *lock(&self.send_gate) = SendGate::new(self.settings.rate_limits);
        self.account_generation.send_modify(|generation| *generation += 1);
    }

    pub fn has_separate_write_connection(&self) -> bool {
        !self.settings.single_connection
    }

    pub fn bttv_emotes(&self) -> &BttvEmotes {
        &self.bttv
    }

    pub fn ffz_emotes(&self) -> &FfzEmotes {
        &self.ffz
    }

    /// Loads the global BTTV and FFZ emotes. A failing provider does not
    /// keep the other one from loading.
    pub async fn load_global_emotes(&self) {
        let (bttv, ffz) = tokio::join!(self.bttv.load_global(), self.ffz.load_global());
        if let Err(e) = bttv {
            tracing::warn!(error = %e, "Failed to load BTTV global emotes");
        }
        if let Err(e) = ffz {
            tracing::warn!(error = %e, "Failed to load FFZ global emotes");
        }
    }

    pub fn status(&self, role: ConnectionRole) -> watch::Receiver<TwitchConnectionStatus> {
        match role {
            ConnectionRole::Read => self.read_status.subscribe(),
            ConnectionRole::Write => self.write_status.subscribe(),
        }
    }

    fn set_status(&self, role: ConnectionRole, status: TwitchConnectionStatus) {
        let sender = match role {
            ConnectionRole::Read => &self.read_status,
            ConnectionRole::Write => &self.write_status,
        };
        tracing::debug!(connection.role = %role, status = ?status, "Connection status changed");
        sender.send_replace(status);
    }

    pub fn whispers_channel(&self) -> Arc<TwitchChannel> {
        Arc::clone(&self.whispers_channel)
    }

    pub fn mentions_channel(&self) -> Arc<TwitchChannel> {
        Arc::clone(&self.mentions_channel)
    }

    pub fn last_user_that_whispered_me(&self) -> Option<String> {
        self.last_user_that_whispered_me
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clean_channel_name(dirty_channel_name: &str) -> String {
        dirty_channel_name
            .trim()
            .trim_start_matches('#')
            .to_lowercase()
    }

    fn custom_channel(&self, name: &str) -> Option<Arc<TwitchChannel>> {
        match name {
            WHISPERS_CHANNEL_NAME => Some(self.whispers_channel()),
            MENTIONS_CHANNEL_NAME => Some(self.mentions_channel()),
            _ => None,
        }
    }

    /// Returns the channel, creating and joining it when it is new.
    pub fn get_or_add_channel(&self, dirty_channel_name: &str) -> Arc<TwitchChannel> {
        if let Some(custom) = self.custom_channel(dirty_channel_name.trim()) {
            return custom;
        }
        let name = Self::clean_channel_name(dirty_channel_name);
        if name.is_empty() {
            return Arc::clone(&self.empty_channel);
        }

        let channel = {
            let mut channels = self
                .channels
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = channels.get(&name) {
                return Arc::clone(existing);
            }
            let channel = Arc::new(TwitchChannel::new(name.clone(), ChannelKind::Regular));
            channels.insert(name.clone(), Arc::clone(&channel));
            channel
        };

        tracing::info!(channel.name = %name, "Added channel");
        self.send_on(ConnectionRole::Read, format!("{} #{}", CMD_JOIN, name));
        channel
    }

    pub fn get_channel(&self, dirty_channel_name: &str) -> Option<Arc<TwitchChannel>> {
        if let Some(custom) = self.custom_channel(dirty_channel_name.trim()) {
            return Some(custom);
        }
        let name = Self::clean_channel_name(dirty_channel_name);
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
    }

    pub fn get_channel_or_empty(&self, dirty_channel_name: &str) -> Arc<TwitchChannel> {
        self.get_channel(dirty_channel_name)
            .unwrap_or_else(|| Arc::clone(&self.empty_channel))
    }

    pub fn get_channel_or_empty_by_id(&self, channel_id: &str) -> Arc<TwitchChannel> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|c| c.room_id().as_deref() == Some(channel_id))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.empty_channel))
    }

    /// Leaves and forgets a channel. Returns false if it was not joined.
    pub fn part_channel(&self, dirty_channel_name: &str) -> bool {
        let name = Self::clean_channel_name(dirty_channel_name);
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name)
            .is_some();
        if removed {
            tracing::info!(channel.name = %name, "Parted channel");
            self.send_on(ConnectionRole::Read, format!("{} #{}", CMD_PART, name));
        }
        removed
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn for_each_channel_and_special_channels(&self, mut func: impl FnMut(&Arc<TwitchChannel>)) {
        let channels: Vec<Arc<TwitchChannel>> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for channel in &channels {
            func(channel);
        }
        func(&self.whispers_channel);
        func(&self.mentions_channel);
    }

    fn slot(&self, role: ConnectionRole) -> &Mutex<ConnectionSlot> {
        match role {
            ConnectionRole::Write if self.has_separate_write_connection() => &self.write_slot,
            _ => &self.read_slot,
        }
    }

    pub(crate) fn attach_writer(&self, role: ConnectionRole, writer: mpsc::Sender<String>) {
        *lock(self.slot(role)) = ConnectionSlot {
            writer: Some(writer),
            ready: false,
        };
    }

    fn detach_writer(&self, role: ConnectionRole) {
        *lock(self.slot(role)) = ConnectionSlot::default();
    }

    fn mark_ready(&self, role: ConnectionRole) {
        lock(self.slot(role)).ready = true;
    }

    fn ready_writer(&self, role: ConnectionRole) -> Option<mpsc::Sender<String>> {
        let slot = lock(self.slot(role));
        if slot.ready { slot.writer.clone() } else { None }
    }

    /// Queues a line on a registered connection without waiting.
    fn send_on(&self, role: ConnectionRole, line: String) -> bool {
        match self.ready_writer(role) {
            Some(writer) => match writer.try_send(line) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(connection.role = %role, error = %e, "Dropped outgoing IRC line");
                    false
                }
            },
            None => false,
        }
    }

    /// Sends a chat message if the rate limit for our standing in the
    /// channel allows it. Never blocks; rejected messages are not retried.
    pub fn try_send(&self, dirty_channel_name: &str, message: &str) -> TwitchResult<()> {
        let account = self.account();
        if account.is_anon() {
            return Err(TwitchError::InvalidCredential(
                "anonymous users cannot send messages".to_string(),
            ));
        }

        let message = message.replace(['\r', '\n'], " ");
        let message = message.trim();
        if message.is_empty() {
            return Err(TwitchError::RequestFailed("empty message".to_string()));
        }

        let channel = self
            .get_channel(dirty_channel_name)
            .filter(|c| c.can_send())
            .ok_or_else(|| TwitchError::ChannelNotFound(dirty_channel_name.to_string()))?;
        let writer = self
            .ready_writer(ConnectionRole::Write)
            .ok_or(TwitchError::NotConnected)?;

        // Reserve queue space first so a full or closed queue costs no quota.
        let permit = writer.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => {
                TwitchError::RequestFailed("outgoing queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(()) => TwitchError::NotConnected,
        })?;

        let admission = lock(&self.send_gate).check(channel.rate_tier(), Instant::now());
        if let Admission::Rejected { reason, warn } = admission {
            tracing::debug!(channel.name = %channel.name(), reason = ?reason, "Outgoing message throttled");
            if warn {
                channel.add_system_message(reason.user_message());
            }
            return Err(TwitchError::Throttled(reason));
        }

        permit.send(format!("{} #{} :{}", CMD_PRIVMSG, channel.name(), message));
        Ok(())
    }

    fn irc_login(&self) -> IrcLogin {
        let account = self.account();
        if account.is_anon() {
            IrcLogin::anonymous()
        } else {
            IrcLogin::authenticated(account.username(), &account.oauth_token())
        }
    }

    fn join_all_channels(&self) {
        for name in self.channel_names() {
            self.send_on(ConnectionRole::Read, format!("{} #{}", CMD_JOIN, name));
        }
    }

    fn reload_userstate_emotes(&self, emote_sets: Vec<String>) {
        let account = self.account();
        if account.is_anon() || emote_sets.is_empty() {
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = account.load_userstate_emotes(&emote_sets).await {
                tracing::warn!(account = %account, error = %e, "Failed to load USERSTATE emotes");
            }
        });
    }

    /// Handles one line received on the given connection.
    pub(crate) fn handle_line(&self, role: ConnectionRole, line: &str) -> LineOutcome {
        let message = match IrcMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection.role = %role, error = %e, "Ignoring unparsable line");
                return LineOutcome::Continue;
            }
        };
        let from_read = role == ConnectionRole::Read || !self.has_separate_write_connection();

        match message.command() {
            Some(CMD_PING) => {
                let payload = message.params().first().copied().unwrap_or("tmi.twitch.tv");
                self.send_raw_unchecked(role, format!("{} :{}", CMD_PONG, payload));
            }
            Some(RPL_WELCOME) => {
                tracing::info!(connection.role = %role, "IRC welcome received");
                self.mark_ready(role);
                if from_read {
                    self.join_all_channels();
                }
                return LineOutcome::Welcomed;
            }
            Some(CMD_RECONNECT) => {
                return LineOutcome::Reconnect("Twitch requested reconnect".to_string());
            }
            Some(CMD_CAP) => match message.params().get(1).copied() {
                Some(IRC_NAK) => tracing::warn!(
                    capabilities = ?message.params().get(2),
                    "IRC capability request was NAKed"
                ),
                Some(IRC_ACK) => tracing::debug!(
                    capabilities = ?message.params().get(2),
                    "IRC capability acknowledged"
                ),
                _ => {}
            },
            Some(CMD_NOTICE) => return self.handle_notice(&message),
            Some(CMD_USERSTATE) => self.handle_user_state(&message),
            Some(CMD_GLOBALUSERSTATE) => {
                if let Some(color) = message.get_tag_value("color").filter(|c| !c.is_empty()) {
                    self.account().set_color(color);
                }
                self.reload_userstate_emotes(message.emote_sets());
            }
            Some(CMD_PRIVMSG) if from_read => self.handle_privmsg(&message),
            Some(CMD_WHISPER) if from_read => self.handle_whisper(&message),
            Some(CMD_USERNOTICE) if from_read => self.handle_user_notice(&message),
            Some(CMD_ROOMSTATE) if from_read => {
                if let (Some(channel), Some(room_id)) =
                    (message.channel(), message.get_tag_value("room-id"))
                    && let Some(channel) = self.get_channel(channel)
                {
                    channel.set_room_id(room_id);
                }
            }
            Some(CMD_CLEARCHAT) if from_read => {
                if let Some(channel) = message.channel().and_then(|c| self.get_channel(c)) {
                    let text = match message.trailing() {
                        Some(user) => format!("{} has been timed out.", user),
                        None => "Chat has been cleared by a moderator.".to_string(),
                    };
                    channel.add_system_message(text);
                }
            }
            _ => {}
        }
        LineOutcome::Continue
    }

    /// PONGs go out even before registration completes.
    fn send_raw_unchecked(&self, role: ConnectionRole, line: String) {
        let writer = lock(self.slot(role)).writer.clone();
        if let Some(writer) = writer
            && let Err(e) = writer.try_send(line)
        {
            tracing::warn!(connection.role = %role, error = %e, "Failed to queue PONG");
        }
    }

    fn handle_privmsg(&self, message: &IrcMessage<'_>) {
        let Some(parsed) = message.to_parsed_twitch_message() else {
            return;
        };
        let Some(channel) = self.get_channel(&parsed.channel) else {
            tracing::trace!(channel.name = %parsed.channel, "PRIVMSG for unknown channel");
            return;
        };
        let account = self.account();
        if let Some(sender_id) = &parsed.sender_user_id
            && account.is_blocked(sender_id)
        {
            tracing::trace!(channel.name = %parsed.channel, sender = %parsed.sender_login, "Dropped message from blocked user");
            return;
        }

        let is_own_message = parsed.sender_login.eq_ignore_ascii_case(account.username());
        let is_mention =
            !account.is_anon() && !is_own_message && mentions_name(&parsed.text, account.username());

        let message = ChannelMessage::Chat(parsed);
        if is_mention {
            self.mentions_channel.add_message(message.clone());
        }
        channel.add_message(message);
    }

    fn handle_whisper(&self, message: &IrcMessage<'_>) {
        let Some(parsed) = message.to_parsed_twitch_message() else {
            return;
        };
        if let Some(sender_id) = &parsed.sender_user_id
            && self.account().is_blocked(sender_id)
        {
            return;
        }
        *self
            .last_user_that_whispered_me
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(parsed.sender_login.clone());
        self.whispers_channel.add_message(ChannelMessage::Chat(parsed));
    }

    fn handle_user_notice(&self, message: &IrcMessage<'_>) {
        let Some(channel) = message.channel().and_then(|c| self.get_channel(c)) else {
            return;
        };
        let system_text = message
            .tag("system-msg")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| message.tag("msg-id").unwrap_or_default());
        let text = match message.trailing() {
            Some(user_text) if !user_text.is_empty() => format!("{} - {}", system_text, user_text),
            _ => system_text,
        };
        if !text.is_empty() {
            channel.add_system_message(text);
        }
    }

    fn handle_user_state(&self, message: &IrcMessage<'_>) {
        if let Some(channel) = message.channel().and_then(|c| self.get_channel(c)) {
            channel.set_user_state(UserState {
                is_moderator: message.get_tag_value("mod") == Some("1")
                    || message.has_badge("moderator"),
                is_vip: message.has_badge("vip"),
                is_broadcaster: message.has_badge("broadcaster"),
            });
        }
        self.reload_userstate_emotes(message.emote_sets());
    }

    fn handle_notice(&self, message: &IrcMessage<'_>) -> LineOutcome {
        let text = message.trailing().unwrap_or_default();
        if text.contains(AUTH_ERROR_LOGIN_FAILED) || text.contains(AUTH_ERROR_IMPROPERLY_FORMATTED)
        {
            tracing::error!(notice = %text, "IRC authentication failed");
            return LineOutcome::Reconnect(TwitchError::TwitchAuth(text.to_string()).to_string());
        }
        match message.channel().and_then(|c| self.get_channel(c)) {
            Some(channel) => channel.add_system_message(text),
            None => {
                tracing::info!(notice = %text, "Received Twitch NOTICE");
                self.for_each_channel_and_special_channels(|c| c.add_system_message(text));
            }
        }
        LineOutcome::Continue
    }

    /// Starts the read connection, and the write connection unless a single
    /// connection is configured.
    pub fn connect(self: &Arc<Self>) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(run_connection_loop(
            Arc::clone(self),
            ConnectionRole::Read,
            shutdown_rx.clone(),
        ))];
        if self.has_separate_write_connection() {
            tasks.push(tokio::spawn(run_connection_loop(
                Arc::clone(self),
                ConnectionRole::Write,
                shutdown_rx,
            )));
        }
        ServerHandle { shutdown_tx, tasks }
    }

    fn irc_address(&self) -> String {
        format!("{}:{}", self.settings.irc_host, self.settings.irc_port)
    }
}

pub struct ServerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "IRC connection task panicked");
            }
        }
    }
}

async fn sleep_unless_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_rx.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_connection_loop(
    server: Arc<TwitchServer>,
    role: ConnectionRole,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!(connection.role = %role, "IRC connection loop started");
    let mut account_rx = server.account_generation.subscribe();
    let mut attempt = 0u32;
    let mut backoff = RECONNECT_BASE_DELAY;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        attempt = attempt.saturating_add(1);
        server.set_status(role, TwitchConnectionStatus::Connecting { attempt });
        account_rx.mark_unchanged();

        let login = server.irc_login();
        let addr = server.irc_address();
        let connect = IrcConnection::connect(&addr, &login, EVENT_BUFFER);
        let connection = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            result = connect => result,
        };
        let mut connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(connection.role = %role, attempt, error = %e, "Failed to establish IRC connection");
                server.set_status(
                    role,
                    TwitchConnectionStatus::Reconnecting {
                        reason: e.to_string(),
                        failed_attempt: attempt,
                        retry_in: backoff,
                    },
                );
                if !sleep_unless_shutdown(backoff, &mut shutdown_rx).await {
                    break;
                }
                backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
                continue;
            }
        };

        server.set_status(role, TwitchConnectionStatus::Authenticating { attempt });
        server.attach_writer(role, connection.writer());

        let (reason, retry_now) = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break ("Shutdown".to_string(), false),
                _ = account_rx.changed() => break ("Account changed".to_string(), true),
                event = connection.events.recv() => match event {
                    Some(IrcEvent::Line(line)) => match server.handle_line(role, &line) {
                        LineOutcome::Continue => {}
                        LineOutcome::Welcomed => {
                            tracing::info!(connection.role = %role, connection.id = %connection.id(), "IRC connection ready");
                            attempt = 0;
                            backoff = RECONNECT_BASE_DELAY;
                            server.set_status(role, TwitchConnectionStatus::Connected);
                        }
                        LineOutcome::Reconnect(reason) => break (reason, false),
                    },
                    Some(IrcEvent::Closed(reason)) => break (reason, false),
                    None => break ("IRC event stream ended unexpectedly".to_string(), false),
                },
            }
        };

        server.detach_writer(role);
        drop(connection);
        tracing::warn!(connection.role = %role, reason = %reason, "IRC connection closed");
        server.set_status(role, TwitchConnectionStatus::Disconnected { reason: reason.clone() });

        if *shutdown_rx.borrow() {
            break;
        }
        if retry_now {
            continue;
        }
        server.set_status(
            role,
            TwitchConnectionStatus::Reconnecting {
                reason,
                failed_attempt: attempt,
                retry_in: backoff,
            },
        );
        if !sleep_unless_shutdown(backoff, &mut shutdown_rx).await {
            break;
        }
        backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
    }

    server.detach_writer(role);
    server.set_status(
        role,
        TwitchConnectionStatus::Disconnected {
            reason: "Shutdown".to_string(),
        },
    );
    tracing::info!(connection.role = %role, "IRC connection loop stopped");
}
