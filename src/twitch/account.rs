use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::api::{AutomodAction, Credentials, HelixEmote, TwitchApi};
use super::error::{Result as TwitchResult, TwitchError};
use super::types::{FollowResult, TwitchUser};
use crate::emotes::{Emote, EmoteMap};

pub const ANONYMOUS_USERNAME: &str = "justinfan64537";
pub const GLOBAL_EMOTE_SET_KEY: &str = "0";
pub const DEFAULT_USERSTATE_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TwitchEmote {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmoteSet {
    pub key: String,
    pub channel_name: String,
    pub channel_id: String,
    pub text: String,
    pub set_type: String,
    pub tier: u32,
    pub emotes: Vec<TwitchEmote>,
}

/// Owner metadata of an emote set, cached by set key once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteSetInfo {
    pub channel_name: String,
    pub channel_id: String,
    pub display_name: String,
    pub set_type: String,
    pub tier: u32,
}

impl EmoteSetInfo {
    fn global() -> Self {
        Self {
            channel_name: "twitch".to_string(),
            channel_id: String::new(),
            display_name: "Twitch".to_string(),
            set_type: "globals".to_string(),
            tier: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TwitchAccountEmoteData {
    pub emote_sets: Vec<Arc<EmoteSet>>,
    pub all_emote_names: Vec<String>,
    pub emotes: EmoteMap,
}

impl TwitchAccountEmoteData {
    pub fn from_sets(emote_sets: Vec<Arc<EmoteSet>>) -> Self {
        let mut all_emote_names = Vec::new();
        let mut emotes = EmoteMap::new();
        for set in &emote_sets {
            for emote in &set.emotes {
                if !emotes.contains_key(&emote.name) {
                    all_emote_names.push(emote.name.clone());
                    emotes.insert(emote.name.clone(), Emote::twitch(&emote.id, &emote.name));
                }
            }
        }
        Self {
            emote_sets,
            all_emote_names,
            emotes,
        }
    }

    pub fn has_set(&self, key: &str) -> bool {
        self.emote_sets.iter().any(|set| set.key == key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
    pub user_ids: BTreeSet<String>,
    pub users: BTreeSet<TwitchUser>,
}

impl BlockList {
    pub fn from_users(users: impl IntoIterator<Item = TwitchUser>) -> Self {
        let users: BTreeSet<TwitchUser> = users.into_iter().collect();
        let user_ids = users.iter().map(|u| u.id.clone()).collect();
        Self { user_ids, users }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEvent {
    BlocksUpdated,
    EmotesUpdated,
}

/// One Twitch user, authenticated or anonymous.
///
/// Cached state lives behind `RwLock<Arc<_>>`. Every update builds a new
/// value and swaps it in whole, so `access_*` snapshots are always
/// internally consistent.
pub struct TwitchAccount {
    username: String,
    user_id: String,
    anonymous_name: bool,
    oauth_token: RwLock<String>,
    oauth_client: RwLock<String>,
    color: RwLock<Option<String>>,
    blocks: RwLock<Arc<BlockList>>,
    emotes: RwLock<Arc<TwitchAccountEmoteData>>,
    static_emote_sets: Mutex<HashMap<String, EmoteSetInfo>>,
    userstate_emotes_loaded_at: Mutex<Option<Instant>>,
    userstate_reload_interval: Duration,
    api: Arc<dyn TwitchApi>,
    events: broadcast::Sender<AccountEvent>,
}

impl fmt::Debug for TwitchAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitchAccount")
            .field("username", &self.username)
            .field("user_id", &self.user_id)
            .field("is_anon", &self.is_anon())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TwitchAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn replace_if_changed(lock: &RwLock<String>, value: &str) -> bool {
    let mut current = lock.write().unwrap_or_else(PoisonError::into_inner);
    if *current == value {
        return false;
    }
    *current = value.to_string();
    true
}

fn parse_tier(tier: Option<&str>) -> u32 {
    tier.and_then(|t| t.parse::<u32>().ok())
        .map(|t| t / 1000)
        .unwrap_or(0)
}

impl TwitchAccount {
    pub fn new(
        username: impl Into<String>,
        oauth_token: impl Into<String>,
        oauth_client: impl Into<String>,
        user_id: impl Into<String>,
        api: Arc<dyn TwitchApi>,
    ) -> Self {
        let username = username.into();
        let anonymous_name = username.is_empty() || username == ANONYMOUS_USERNAME;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            username,
            user_id: user_id.into(),
            anonymous_name,
            oauth_token: RwLock::new(oauth_token.into()),
            oauth_client: RwLock::new(oauth_client.into()),
            color: RwLock::new(None),
            blocks: RwLock::new(Arc::new(BlockList::default())),
            emotes: RwLock::new(Arc::new(TwitchAccountEmoteData::default())),
            static_emote_sets: Mutex::new(HashMap::new()),
            userstate_emotes_loaded_at: Mutex::new(None),
            userstate_reload_interval: DEFAULT_USERSTATE_RELOAD_INTERVAL,
            api,
            events,
        }
    }

    pub fn anonymous(api: Arc<dyn TwitchApi>) -> Self {
        Self::new(ANONYMOUS_USERNAME, "", "", "", api)
    }

    pub fn with_userstate_reload_interval(mut self, interval: Duration) -> Self {
        self.userstate_reload_interval = interval;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Anonymous when the username is empty or the justinfan login, or when
    /// there is no token to log in with.
    pub fn is_anon(&self) -> bool {
        if self.anonymous_name {
            return true;
        }
        let token = self.oauth_token();
        token.strip_prefix("oauth:").unwrap_or(&token).trim().is_empty()
    }

    pub fn oauth_token(&self) -> String {
        read(&self.oauth_token)
    }

    pub fn oauth_client(&self) -> String {
        read(&self.oauth_client)
    }

    /// Returns true if the stored token changed.
    pub fn set_oauth_token(&self, token: &str) -> bool {
        replace_if_changed(&self.oauth_token, token)
    }

    /// Returns true if the stored client id changed.
    pub fn set_oauth_client(&self, client_id: &str) -> bool {
        replace_if_changed(&self.oauth_client, client_id)
    }

    pub fn color(&self) -> Option<String> {
        read(&self.color)
    }

    pub fn set_color(&self, color: impl Into<String>) {
        *self.color.write().unwrap_or_else(PoisonError::into_inner) = Some(color.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.events.subscribe()
    }

    /// Credentials for privileged requests. Refused for anonymous accounts
    /// and accounts without a usable token, before anything touches the
    /// network.
    pub fn credentials(&self) -> TwitchResult<Credentials> {
        if self.is_anon() {
            return Err(TwitchError::InvalidCredential(
                "anonymous account".to_string(),
            ));
        }
        let oauth_token = self.oauth_token();
        let oauth_token = oauth_token.strip_prefix("oauth:").unwrap_or(&oauth_token);
        if oauth_token.is_empty() || oauth_token.contains(char::is_whitespace) {
            return Err(TwitchError::InvalidCredential(format!(
                "malformed OAuth token for {}",
                self.username
            )));
        }
        let client_id = self.oauth_client();
        if client_id.is_empty() {
            return Err(TwitchError::InvalidCredential(format!(
                "missing client id for {}",
                self.username
            )));
        }
        Ok(Credentials {
            client_id,
            oauth_token: oauth_token.to_string(),
        })
    }

    fn notify(&self, event: AccountEvent) {
        let _ = self.events.send(event);
    }

    pub fn access_blocked_user_ids(&self) -> BTreeSet<String> {
        self.blocks_snapshot().user_ids.clone()
    }

    pub fn access_blocks(&self) -> BTreeSet<TwitchUser> {
        self.blocks_snapshot().users.clone()
    }

    pub fn blocks_snapshot(&self) -> Arc<BlockList> {
        read(&self.blocks)
    }

    pub fn is_blocked(&self, user_id: &str) -> bool {
        self.blocks_snapshot().user_ids.contains(user_id)
    }

    fn update_blocks(&self, update: impl FnOnce(&mut BlockList)) {
        {
            let mut guard = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = BlockList::clone(&guard);
            update(&mut next);
            *guard = Arc::new(next);
        }
        self.notify(AccountEvent::BlocksUpdated);
    }

    pub async fn load_blocks(&self) -> TwitchResult<()> {
        let creds = self.credentials()?;
        let users = self
            .api
            .get_blocked_users(&creds, &self.user_id)
            .await
            .inspect_err(|e| {
                tracing::warn!(account = %self.username, error = %e, "Failed to load blocked users")
            })?;
        let count = users.len();
        *self.blocks.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(BlockList::from_users(users));
        self.notify(AccountEvent::BlocksUpdated);
        tracing::info!(account = %self.username, count, "Loaded blocked users");
        Ok(())
    }

    pub async fn block_user(&self, user_id: &str) -> TwitchResult<()> {
        let creds = self.credentials()?;
        if user_id.is_empty() {
            return Err(TwitchError::RequestFailed("empty user id".to_string()));
        }
        self.api.block_user(&creds, user_id).await.inspect_err(|e| {
            tracing::warn!(account = %self.username, target_user = user_id, error = %e, "Block failed")
        })?;
        self.update_blocks(|blocks| {
            blocks.user_ids.insert(user_id.to_string());
            if !blocks.users.iter().any(|u| u.id == user_id) {
                blocks.users.insert(TwitchUser {
                    id: user_id.to_string(),
                    ..Default::default()
                });
            }
        });
        tracing::info!(account = %self.username, target_user = user_id, "Blocked user");
        Ok(())
    }

    pub async fn unblock_user(&self, user_id: &str) -> TwitchResult<()> {
        let creds = self.credentials()?;
        if user_id.is_empty() {
            return Err(TwitchError::RequestFailed("empty user id".to_string()));
        }
        self.api.unblock_user(&creds, user_id).await.inspect_err(|e| {
            tracing::warn!(account = %self.username, target_user = user_id, error = %e, "Unblock failed")
        })?;
        self.update_blocks(|blocks| {
            blocks.user_ids.remove(user_id);
            blocks.users.retain(|u| u.id != user_id);
        });
        tracing::info!(account = %self.username, target_user = user_id, "Unblocked user");
        Ok(())
    }

    pub async fn check_follow(&self, target_user_id: &str) -> FollowResult {
        let creds = match self.credentials() {
            Ok(creds) => creds,
            Err(e) => {
                tracing::debug!(account = %self.username, error = %e, "Follow check refused");
                return FollowResult::Failed;
            }
        };
        match self
            .api
            .check_follow(&creds, &self.user_id, target_user_id)
            .await
        {
            Ok(true) => FollowResult::Following,
            Ok(false) => FollowResult::NotFollowing,
            Err(e) => {
                tracing::warn!(
                    account = %self.username,
                    target_user = target_user_id,
                    error = %e,
                    "Follow check failed"
                );
                FollowResult::Failed
            }
        }
    }

    pub async fn automod_allow(&self, msg_id: &str) -> TwitchResult<()> {
        self.automod(msg_id, AutomodAction::Allow).await
    }

    pub async fn automod_deny(&self, msg_id: &str) -> TwitchResult<()> {
        self.automod(msg_id, AutomodAction::Deny).await
    }

    async fn automod(&self, msg_id: &str, action: AutomodAction) -> TwitchResult<()> {
        let creds = self.credentials()?;
        self.api
            .automod_message(&creds, &self.user_id, msg_id, action)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    account = %self.username,
                    msg_id,
                    action = action.as_str(),
                    error = %e,
                    "AutoMod action failed"
                )
            })
    }

    pub fn access_emotes(&self) -> Arc<TwitchAccountEmoteData> {
        read(&self.emotes)
    }

    /// Reloads every emote set the account can use and replaces the bundle.
    pub async fn load_emotes(&self) -> TwitchResult<()> {
        let creds = self.credentials()?;
        tracing::debug!(account = %self.username, "Loading Twitch emotes");
        let helix_emotes = self.api.get_user_emotes(&creds, &self.user_id).await?;
        let sets = self.build_emote_sets(&creds, helix_emotes).await;
        let set_count = sets.len();

        *self.emotes.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(TwitchAccountEmoteData::from_sets(sets));
        self.notify(AccountEvent::EmotesUpdated);
        tracing::info!(account = %self.username, sets = set_count, "Loaded Twitch emotes");
        Ok(())
    }

    /// Adds the sets announced by a USERSTATE that are not loaded yet.
    ///
    /// Returns `Ok(false)` without fetching when the previous fetch ran less
    /// than the reload interval ago.
    pub async fn load_userstate_emotes(&self, emote_set_keys: &[String]) -> TwitchResult<bool> {
        let creds = self.credentials()?;
        {
            let mut loaded_at = self
                .userstate_emotes_loaded_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = *loaded_at
                && at.elapsed() < self.userstate_reload_interval
            {
                tracing::trace!(account = %self.username, "Skipping USERSTATE emote reload");
                return Ok(false);
            }
            *loaded_at = Some(Instant::now());
        }

        let current = self.access_emotes();
        let mut seen = HashSet::new();
        let missing: Vec<String> = emote_set_keys
            .iter()
            .filter(|key| !current.has_set(key) && seen.insert(key.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(true);
        }

        tracing::debug!(account = %self.username, sets = ?missing, "Loading USERSTATE emote sets");
        let helix_emotes = self.api.get_emote_sets(&creds, &missing).await?;
        let new_sets = self.build_emote_sets(&creds, helix_emotes).await;

        {
            let mut guard = self.emotes.write().unwrap_or_else(PoisonError::into_inner);
            let mut sets = guard.emote_sets.clone();
            for set in new_sets {
                if !guard.has_set(&set.key) {
                    sets.push(set);
                }
            }
            *guard = Arc::new(TwitchAccountEmoteData::from_sets(sets));
        }
        self.notify(AccountEvent::EmotesUpdated);
        Ok(true)
    }

    /// Groups emotes by set, in first-seen order, and attaches owner info.
    async fn build_emote_sets(
        &self,
        creds: &Credentials,
        helix_emotes: Vec<HelixEmote>,
    ) -> Vec<Arc<EmoteSet>> {
        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, (Vec<TwitchEmote>, HelixEmote)> = HashMap::new();
        for emote in helix_emotes {
            let twitch_emote = TwitchEmote {
                id: emote.id.clone(),
                name: emote.name.clone(),
            };
            match grouped.get_mut(&emote.emote_set_id) {
                Some((emotes, _)) => emotes.push(twitch_emote),
                None => {
                    order.push(emote.emote_set_id.clone());
                    grouped.insert(emote.emote_set_id.clone(), (vec![twitch_emote], emote));
                }
            }
        }

        let infos = self.resolve_emote_sets(creds, &order, &grouped).await;

        order
            .into_iter()
            .filter_map(|key| {
                let (emotes, _) = grouped.remove(&key)?;
                let info = infos.get(&key).cloned().unwrap_or_else(|| EmoteSetInfo {
                    channel_name: String::new(),
                    channel_id: String::new(),
                    display_name: "Unknown".to_string(),
                    set_type: String::new(),
                    tier: 0,
                });
                Some(Arc::new(EmoteSet {
                    key,
                    channel_name: info.channel_name,
                    channel_id: info.channel_id,
                    text: info.display_name,
                    set_type: info.set_type,
                    tier: info.tier,
                    emotes,
                }))
            })
            .collect()
    }

    async fn resolve_emote_sets(
        &self,
        creds: &Credentials,
        keys: &[String],
        grouped: &HashMap<String, (Vec<TwitchEmote>, HelixEmote)>,
    ) -> HashMap<String, EmoteSetInfo> {
        let mut resolved = HashMap::new();
        let mut unresolved: Vec<(&String, &HelixEmote)> = Vec::new();
        {
            let cache = self
                .static_emote_sets
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for key in keys {
                if key == GLOBAL_EMOTE_SET_KEY {
                    resolved.insert(key.clone(), EmoteSetInfo::global());
                } else if let Some(info) = cache.get(key) {
                    resolved.insert(key.clone(), info.clone());
                } else if let Some((_, sample)) = grouped.get(key) {
                    unresolved.push((key, sample));
                }
            }
        }
        if unresolved.is_empty() {
            return resolved;
        }

        let mut owner_ids: Vec<String> = unresolved
            .iter()
            .map(|(_, sample)| sample.owner_id.clone())
            .filter(|id| !id.is_empty() && id != "0" && id != "twitch")
            .collect();
        owner_ids.sort();
        owner_ids.dedup();

        let owners: HashMap<String, TwitchUser> = if owner_ids.is_empty() {
            HashMap::new()
        } else {
            match self.api.get_users(creds, &owner_ids).await {
                Ok(users) => users.into_iter().map(|u| (u.id.clone(), u)).collect(),
                Err(e) => {
                    tracing::warn!(account = %self.username, error = %e, "Failed to resolve emote set owners");
                    HashMap::new()
                }
            }
        };

        let mut cache = self
            .static_emote_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (key, sample) in unresolved {
            let owner = owners.get(&sample.owner_id);
            let info = match owner {
                Some(owner) => EmoteSetInfo {
                    channel_name: owner.login.clone(),
                    channel_id: owner.id.clone(),
                    display_name: owner.display_name.clone(),
                    set_type: sample.emote_type.clone(),
                    tier: parse_tier(sample.tier.as_deref()),
                },
                None if sample.owner_id.is_empty()
                    || sample.owner_id == "0"
                    || sample.owner_id == "twitch" =>
                {
                    EmoteSetInfo {
                        set_type: sample.emote_type.clone(),
                        ..EmoteSetInfo::global()
                    }
                }
                // Lookup failed, keep it uncached so the next load retries.
                None => {
                    resolved.insert(
                        key.clone(),
                        EmoteSetInfo {
                            channel_name: String::new(),
                            channel_id: sample.owner_id.clone(),
                            display_name: "Unknown".to_string(),
                            set_type: sample.emote_type.clone(),
                            tier: parse_tier(sample.tier.as_deref()),
                        },
                    );
                    continue;
                }
            };
            cache.insert(key.clone(), info.clone());
            resolved.insert(key.clone(), info);
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::testing::{FakeApi, emote, user};
    use std::sync::atomic::Ordering;

    fn account_with(api: Arc<FakeApi>) -> TwitchAccount {
        TwitchAccount::new("pajlada", "oauth:abc123", "client-id", "11148817", api)
    }

    #[test]
    fn test_setters_report_changes() {
        let account = account_with(Arc::new(FakeApi::default()));
        assert!(!account.set_oauth_token("oauth:abc123"));
        assert!(account.set_oauth_token("def456"));
        assert_eq!(account.oauth_token(), "def456");
        assert!(account.set_oauth_client("other"));
        assert!(!account.set_oauth_client("other"));
        assert_eq!(account.to_string(), "pajlada");
    }

    #[test]
    fn test_credentials_strip_prefix_and_reject_anon() {
        let account = account_with(Arc::new(FakeApi::default()));
        assert_eq!(account.credentials().unwrap().oauth_token, "abc123");

        let anon = TwitchAccount::anonymous(Arc::new(FakeApi::default()));
        assert!(anon.is_anon());
        assert!(matches!(
            anon.credentials(),
            Err(TwitchError::InvalidCredential(_))
        ));

        let broken = TwitchAccount::new("x", "oauth:", "cid", "1", Arc::new(FakeApi::default()));
        assert!(broken.is_anon());
        assert!(matches!(
            broken.credentials(),
            Err(TwitchError::InvalidCredential(_))
        ));

        let spaced = TwitchAccount::new("x", "oauth:a b", "cid", "1", Arc::new(FakeApi::default()));
        assert!(!spaced.is_anon());
        assert!(spaced.credentials().is_err());
    }

    #[test]
    fn test_missing_token_means_anonymous() {
        let account = TwitchAccount::new("someone", "", "cid", "1", Arc::new(FakeApi::default()));
        assert!(account.is_anon());

        assert!(account.set_oauth_token("oauth:abc"));
        assert!(!account.is_anon());
        assert!(account.set_oauth_token("  "));
        assert!(account.is_anon());
    }

    #[tokio::test]
    async fn test_anonymous_account_never_calls_api() {
        let api = Arc::new(FakeApi::default());
        let anon = TwitchAccount::anonymous(api.clone());

        assert!(matches!(
            anon.block_user("1").await,
            Err(TwitchError::InvalidCredential(_))
        ));
        assert!(anon.unblock_user("1").await.is_err());
        assert_eq!(anon.check_follow("1").await, FollowResult::Failed);
        assert!(anon.automod_allow("msg").await.is_err());
        assert!(anon.load_emotes().await.is_err());
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_block_then_unblock_updates_cache() {
        let api = Arc::new(FakeApi::default());
        let account = account_with(api.clone());
        let mut events = account.subscribe();

        account.block_user("42").await.unwrap();
        assert!(account.access_blocked_user_ids().contains("42"));
        assert!(account.access_blocks().iter().any(|u| u.id == "42"));
        assert_eq!(events.recv().await.unwrap(), AccountEvent::BlocksUpdated);

        account.unblock_user("42").await.unwrap();
        assert!(!account.access_blocked_user_ids().contains("42"));
        assert!(account.access_blocks().is_empty());
    }

    #[tokio::test]
    async fn test_failed_block_leaves_cache_untouched() {
        let api = Arc::new(FakeApi::failing());
        let account = account_with(api.clone());

        let result = account.block_user("42").await;
        assert!(matches!(result, Err(TwitchError::RequestFailed(_))));
        assert!(account.access_blocked_user_ids().is_empty());
        assert_eq!(api.block_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_unblock_keeps_user_blocked() {
        let api = Arc::new(FakeApi::default());
        let account = account_with(api.clone());
        account.block_user("42").await.unwrap();
        let mut events = account.subscribe();

        api.fail.store(true, Ordering::SeqCst);
        let result = account.unblock_user("42").await;
        assert!(matches!(result, Err(TwitchError::RequestFailed(_))));
        assert!(account.is_blocked("42"));
        assert_eq!(account.access_blocks().len(), 1);
        assert_eq!(api.unblock_calls.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_block_completes_only_after_request() {
        let (api, gate) = FakeApi::gated();
        let account = Arc::new(account_with(Arc::new(api)));

        let task = tokio::spawn({
            let account = Arc::clone(&account);
            async move { account.block_user("7").await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());
        assert!(!account.is_blocked("7"));

        gate.add_permits(1);
        task.await.unwrap().unwrap();
        assert!(account.is_blocked("7"));
    }

    #[tokio::test]
    async fn test_concurrent_blocks_complete_independently() {
        let api = Arc::new(FakeApi::default());
        let account = account_with(api.clone());

        let (first, second) = tokio::join!(account.block_user("42"), account.block_user("42"));
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(api.block_calls.load(Ordering::SeqCst), 2);
        assert_eq!(account.access_blocked_user_ids().len(), 1);
        assert_eq!(account.access_blocks().len(), 1);
    }

    #[tokio::test]
    async fn test_load_blocks_replaces_list() {
        let api = Arc::new(FakeApi::default());
        *api.blocked.lock().unwrap() = vec![user("1", "a"), user("2", "b")];
        let account = account_with(api.clone());
        account.block_user("99").await.unwrap();

        account.load_blocks().await.unwrap();
        let ids = account.access_blocked_user_ids();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_check_follow_is_tri_state() {
        let api = Arc::new(FakeApi::default());
        let account = account_with(api.clone());

        assert_eq!(account.check_follow("1").await, FollowResult::NotFollowing);
        api.following.store(true, Ordering::SeqCst);
        assert_eq!(account.check_follow("1").await, FollowResult::Following);
        api.fail.store(true, Ordering::SeqCst);
        assert_eq!(account.check_follow("1").await, FollowResult::Failed);
    }

    #[tokio::test]
    async fn test_automod_sends_action() {
        let api = Arc::new(FakeApi::default());
        let account = account_with(api.clone());

        account.automod_allow("m1").await.unwrap();
        account.automod_deny("m2").await.unwrap();
        let calls = api.automod_calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("m1".to_string(), AutomodAction::Allow),
                ("m2".to_string(), AutomodAction::Deny)
            ]
        );
    }

    #[tokio::test]
    async fn test_load_emotes_groups_sets_and_resolves_owners() {
        let api = Arc::new(FakeApi::default());
        *api.user_emotes.lock().unwrap() = vec![
            emote("25", "Kappa", "0", "0"),
            emote("301", "forsenE", "19194", "22484632"),
            emote("302", "forsenW", "19194", "22484632"),
            emote("88", "PogChamp", "0", "0"),
        ];
        *api.users.lock().unwrap() = vec![user("22484632", "forsen")];
        let account = account_with(api.clone());
        let mut events = account.subscribe();

        account.load_emotes().await.unwrap();
        assert_eq!(events.try_recv().unwrap(), AccountEvent::EmotesUpdated);
        let data = account.access_emotes();
        assert_eq!(data.emote_sets.len(), 2);
        assert_eq!(data.emote_sets[0].key, "0");
        assert_eq!(data.emote_sets[0].text, "Twitch");
        assert_eq!(data.emote_sets[0].emotes.len(), 2);
        assert_eq!(data.emote_sets[1].channel_name, "forsen");
        assert_eq!(data.emote_sets[1].text, "FORSEN");
        assert_eq!(data.emote_sets[1].tier, 1);
        assert_eq!(
            data.all_emote_names,
            vec!["Kappa", "PogChamp", "forsenE", "forsenW"]
        );
        assert!(data.emotes.contains_key("forsenW"));

        // Resolved owners are cached across reloads.
        account.load_emotes().await.unwrap();
        assert_eq!(api.user_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_userstate_emotes_are_throttled() {
        let api = Arc::new(FakeApi::default());
        *api.set_emotes.lock().unwrap() = vec![emote("1", "a", "100", "5"), emote("2", "b", "200", "5")];
        let account = account_with(api.clone());
        let mut events = account.subscribe();
        let keys = vec!["100".to_string(), "200".to_string()];

        assert!(account.load_userstate_emotes(&keys).await.unwrap());
        assert_eq!(events.try_recv().unwrap(), AccountEvent::EmotesUpdated);
        assert!(!account.load_userstate_emotes(&keys).await.unwrap());
        assert_eq!(api.emote_set_calls.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());

        let data = account.access_emotes();
        assert!(data.has_set("100"));
        assert!(data.has_set("200"));
    }

    #[tokio::test]
    async fn test_userstate_emotes_only_fetch_missing_sets() {
        let api = Arc::new(FakeApi::default());
        *api.user_emotes.lock().unwrap() = vec![emote("1", "a", "100", "5")];
        *api.set_emotes.lock().unwrap() = vec![emote("2", "b", "200", "5")];
        let account = account_with(api.clone()).with_userstate_reload_interval(Duration::ZERO);
        account.load_emotes().await.unwrap();

        let keys = vec!["100".to_string()];
        assert!(account.load_userstate_emotes(&keys).await.unwrap());
        assert_eq!(api.emote_set_calls.load(Ordering::SeqCst), 0);

        let keys = vec!["100".to_string(), "200".to_string(), "200".to_string()];
        assert!(account.load_userstate_emotes(&keys).await.unwrap());
        assert_eq!(api.emote_set_calls.load(Ordering::SeqCst), 1);
        let data = account.access_emotes();
        assert_eq!(data.emote_sets.len(), 2);
        assert_eq!(data.all_emote_names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failed_userstate_fetch_still_starts_interval() {
        let api = Arc::new(FakeApi::failing());
        *api.set_emotes.lock().unwrap() = vec![emote("1", "a", "100", "5")];
        let account = account_with(api.clone());
        let mut events = account.subscribe();
        let keys = vec!["100".to_string()];

        assert!(account.load_userstate_emotes(&keys).await.is_err());
        api.fail.store(false, Ordering::SeqCst);
        assert!(!account.load_userstate_emotes(&keys).await.unwrap());

        assert_eq!(api.emote_set_calls.load(Ordering::SeqCst), 1);
        assert!(!account.access_emotes().has_set("100"));
        assert!(events.try_recv().is_err());
    }
}
