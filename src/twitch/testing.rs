//! Recording `TwitchApi` fake shared by the account and server tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use super::api::{AutomodAction, Credentials, HelixEmote, TwitchApi};
use super::error::{Result as TwitchResult, TwitchError};
use super::types::TwitchUser;

#[derive(Default)]
pub struct FakeApi {
    pub fail: AtomicBool,
    pub following: AtomicBool,
    pub blocked: Mutex<Vec<TwitchUser>>,
    pub user_emotes: Mutex<Vec<HelixEmote>>,
    pub set_emotes: Mutex<Vec<HelixEmote>>,
    pub users: Mutex<Vec<TwitchUser>>,
    pub automod_calls: Mutex<Vec<(String, AutomodAction)>>,
    pub block_calls: AtomicUsize,
    pub unblock_calls: AtomicUsize,
    pub follow_calls: AtomicUsize,
    pub emote_set_calls: AtomicUsize,
    pub user_emote_calls: AtomicUsize,
    pub user_lookups: AtomicUsize,
    /// When set, block requests wait for a permit before completing.
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeApi {
    pub fn failing() -> Self {
        let api = Self::default();
        api.fail.store(true, Ordering::SeqCst);
        api
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let api = Self {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        (api, gate)
    }

    pub fn total_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
            + self.unblock_calls.load(Ordering::SeqCst)
            + self.follow_calls.load(Ordering::SeqCst)
            + self.emote_set_calls.load(Ordering::SeqCst)
            + self.user_emote_calls.load(Ordering::SeqCst)
            + self.user_lookups.load(Ordering::SeqCst)
            + self.automod_calls.lock().unwrap().len()
    }

    fn check(&self) -> TwitchResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(TwitchError::RequestFailed("fake failure".to_string()))
        } else {
            Ok(())
        }
    }

    async fn wait_gate(&self) {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
    }
}

pub fn emote(id: &str, name: &str, set: &str, owner: &str) -> HelixEmote {
    HelixEmote {
        id: id.to_string(),
        name: name.to_string(),
        emote_set_id: set.to_string(),
        emote_type: "subscriptions".to_string(),
        owner_id: owner.to_string(),
        tier: Some("1000".to_string()),
    }
}

pub fn user(id: &str, login: &str) -> TwitchUser {
    TwitchUser {
        id: id.to_string(),
        login: login.to_string(),
        display_name: login.to_uppercase(),
    }
}

#[async_trait]
impl TwitchApi for FakeApi {
    async fn get_blocked_users(
        &self,
        _creds: &Credentials,
        _user_id: &str,
    ) -> TwitchResult<Vec<TwitchUser>> {
        tokio::task::yield_now().await;
        self.check()?;
        Ok(self.blocked.lock().unwrap().clone())
    }

    async fn block_user(&self, _creds: &Credentials, _target_user_id: &str) -> TwitchResult<()> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_gate().await;
        tokio::task::yield_now().await;
        self.check()
    }

    async fn unblock_user(&self, _creds: &Credentials, _target_user_id: &str) -> TwitchResult<()> {
        self.unblock_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.check()
    }

    async fn check_follow(
        &self,
        _creds: &Credentials,
        _user_id: &str,
        _target_user_id: &str,
    ) -> TwitchResult<bool> {
        self.follow_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.check()?;
        Ok(self.following.load(Ordering::SeqCst))
    }

    async fn automod_message(
        &self,
        _creds: &Credentials,
        _user_id: &str,
        msg_id: &str,
        action: AutomodAction,
    ) -> TwitchResult<()> {
        self.automod_calls
            .lock()
            .unwrap()
            .push((msg_id.to_string(), action));
        self.check()
    }

    async fn get_user_emotes(
        &self,
        _creds: &Credentials,
        _user_id: &str,
    ) -> TwitchResult<Vec<HelixEmote>> {
        self.user_emote_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.check()?;
        Ok(self.user_emotes.lock().unwrap().clone())
    }

    async fn get_emote_sets(
        &self,
        _creds: &Credentials,
        set_ids: &[String],
    ) -> TwitchResult<Vec<HelixEmote>> {
        self.emote_set_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.check()?;
        Ok(self
            .set_emotes
            .lock()
            .unwrap()
            .iter()
            .filter(|e| set_ids.contains(&e.emote_set_id))
            .cloned()
            .collect())
    }

    async fn get_users(
        &self,
        _creds: &Credentials,
        ids: &[String],
    ) -> TwitchResult<Vec<TwitchUser>> {
        self.user_lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|u| ids.contains(&u.id))
            .cloned()
            .collect())
    }
}
