use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::error::{Result as TwitchResult, TwitchError};
use super::types::TwitchUser;

pub const DEFAULT_HELIX_URL: &str = "https://api.twitch.tv/helix";

const PAGE_SIZE: &str = "100";
const EMOTE_SETS_PER_REQUEST: usize = 25;
const USERS_PER_REQUEST: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub oauth_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomodAction {
    Allow,
    Deny,
}

impl AutomodAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomodAction::Allow => "ALLOW",
            AutomodAction::Deny => "DENY",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HelixEmote {
    pub id: String,
    pub name: String,
    pub emote_set_id: String,
    #[serde(default)]
    pub emote_type: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
    login: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct HelixBlockedUser {
    user_id: String,
    user_login: String,
    display_name: String,
}

/// Network operations the account layer depends on.
#[async_trait]
pub trait TwitchApi: Send + Sync {
    async fn get_blocked_users(
        &self,
        creds: &Credentials,
        user_id: &str,
    ) -> TwitchResult<Vec<TwitchUser>>;

    async fn block_user(&self, creds: &Credentials, target_user_id: &str) -> TwitchResult<()>;

    async fn unblock_user(&self, creds: &Credentials, target_user_id: &str) -> TwitchResult<()>;

    /// Whether `user_id` follows `target_user_id`.
    async fn check_follow(
        &self,
        creds: &Credentials,
        user_id: &str,
        target_user_id: &str,
    ) -> TwitchResult<bool>;

    async fn automod_message(
        &self,
        creds: &Credentials,
        user_id: &str,
        msg_id: &str,
        action: AutomodAction,
    ) -> TwitchResult<()>;

    async fn get_user_emotes(
        &self,
        creds: &Credentials,
        user_id: &str,
    ) -> TwitchResult<Vec<HelixEmote>>;

    async fn get_emote_sets(
        &self,
        creds: &Credentials,
        set_ids: &[String],
    ) -> TwitchResult<Vec<HelixEmote>>;

    async fn get_users(&self, creds: &Credentials, ids: &[String])
    -> TwitchResult<Vec<TwitchUser>>;
}

#[derive(Clone, Debug)]
pub struct HelixClient {
    client: reqwest::Client,
    base_url: String,
}

impl HelixClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: Method, path: &str, creds: &Credentials) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path))
            .header("Client-Id", &creds.client_id)
            .header(AUTHORIZATION, format!("Bearer {}", creds.oauth_token))
    }

    async fn send_checked(builder: RequestBuilder, what: &str) -> TwitchResult<Response> {
        let response = builder.send().await.map_err(TwitchError::Reqwest)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error body".to_string());
        tracing::warn!(
            request = what,
            status = %status,
            body = %error_body,
            "Helix request failed"
        );
        Err(TwitchError::RequestFailed(format!(
            "{} failed (HTTP {}): {}",
            what, status, error_body
        )))
    }

    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        creds: &Credentials,
        query: &[(&str, String)],
        what: &str,
    ) -> TwitchResult<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut builder = self.request(Method::GET, path, creds).query(query);
            if let Some(after) = &cursor {
                builder = builder.query(&[("after", after)]);
            }
            let page: HelixPage<T> = Self::send_checked(builder, what).await?.json().await?;
            let page_was_empty = page.data.is_empty();
            items.extend(page.data);

            cursor = page
                .pagination
                .and_then(|p| p.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() || page_was_empty {
                return Ok(items);
            }
        }
    }
}

impl Default for HelixClient {
    fn default() -> Self {
        Self::new(DEFAULT_HELIX_URL)
    }
}

#[async_trait]
impl TwitchApi for HelixClient {
    async fn get_blocked_users(
        &self,
        creds: &Credentials,
        user_id: &str,
    ) -> TwitchResult<Vec<TwitchUser>> {
        let blocked: Vec<HelixBlockedUser> = self
            .get_all_pages(
                "users/blocks",
                creds,
                &[
                    ("broadcaster_id", user_id.to_string()),
                    ("first", PAGE_SIZE.to_string()),
                ],
                "get blocked users",
            )
            .await?;
        Ok(blocked
            .into_iter()
            .map(|b| TwitchUser {
                id: b.user_id,
                login: b.user_login,
                display_name: b.display_name,
            })
            .collect())
    }

    async fn block_user(&self, creds: &Credentials, target_user_id: &str) -> TwitchResult<()> {
        let builder = self
            .request(Method::PUT, "users/blocks", creds)
            .query(&[("target_user_id", target_user_id)]);
        Self::send_checked(builder, "block user").await?;
        Ok(())
    }

    async fn unblock_user(&self, creds: &Credentials, target_user_id: &str) -> TwitchResult<()> {
        let builder = self
            .request(Method::DELETE, "users/blocks", creds)
            .query(&[("target_user_id", target_user_id)]);
        Self::send_checked(builder, "unblock user").await?;
        Ok(())
    }

    async fn check_follow(
        &self,
        creds: &Credentials,
        user_id: &str,
        target_user_id: &str,
    ) -> TwitchResult<bool> {
        let builder = self
            .request(Method::GET, "channels/followed", creds)
            .query(&[("user_id", user_id), ("broadcaster_id", target_user_id)]);
        let page: HelixPage<serde_json::Value> =
            Self::send_checked(builder, "check follow").await?.json().await?;
        Ok(!page.data.is_empty())
    }

    async fn automod_message(
        &self,
        creds: &Credentials,
        user_id: &str,
        msg_id: &str,
        action: AutomodAction,
    ) -> TwitchResult<()> {
        let builder = self
            .request(Method::POST, "moderation/automod/message", creds)
            .json(&json!({
                "user_id": user_id,
                "msg_id": msg_id,
                "action": action.as_str(),
            }));
        Self::send_checked(builder, "automod message").await?;
        Ok(())
    }

    async fn get_user_emotes(
        &self,
        creds: &Credentials,
        user_id: &str,
    ) -> TwitchResult<Vec<HelixEmote>> {
        self.get_all_pages(
            "chat/emotes/user",
            creds,
            &[("user_id", user_id.to_string())],
            "get user emotes",
        )
        .await
    }

    async fn get_emote_sets(
        &self,
        creds: &Credentials,
        set_ids: &[String],
    ) -> TwitchResult<Vec<HelixEmote>> {
        let mut emotes = Vec::new();
        for chunk in set_ids.chunks(EMOTE_SETS_PER_REQUEST) {
            let query: Vec<(&str, String)> =
                chunk.iter().map(|id| ("emote_set_id", id.clone())).collect();
            let page: Vec<HelixEmote> = self
                .get_all_pages("chat/emotes/set", creds, &query, "get emote sets")
                .await?;
            emotes.extend(page);
        }
        Ok(emotes)
    }

    async fn get_users(
        &self,
        creds: &Credentials,
        ids: &[String],
    ) -> TwitchResult<Vec<TwitchUser>> {
        let mut users = Vec::new();
        for chunk in ids.chunks(USERS_PER_REQUEST) {
            let query: Vec<(&str, String)> = chunk.iter().map(|id| ("id", id.clone())).collect();
            let page: Vec<HelixUser> = self
                .get_all_pages("users", creds, &query, "get users")
                .await?;
            users.extend(page.into_iter().map(|u| TwitchUser {
                id: u.id,
                login: u.login,
                display_name: u.display_name,
            }));
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_emotes_page_deserializes() {
        let body = r#"{
            "data": [
                {"id": "25", "name": "Kappa", "emote_type": "globals", "emote_set_id": "0",
                 "owner_id": "0", "format": ["static"], "scale": ["1.0"], "theme_mode": ["light"]},
                {"id": "301", "name": "forsenE", "emote_type": "subscriptions",
                 "emote_set_id": "19194", "owner_id": "22484632", "tier": "1000"}
            ],
            "template": "https://static-cdn.jtvnw.net/emoticons/v2/{{id}}/{{format}}/{{theme_mode}}/{{scale}}",
            "pagination": {"cursor": "abc"}
        }"#;
        let page: HelixPage<HelixEmote> = serde_json::from_str(body).unwrap();
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[1].tier.as_deref(), Some("1000"));
        assert_eq!(page.pagination.and_then(|p| p.cursor).as_deref(), Some("abc"));
    }

    #[test]
    fn test_blocked_users_page_without_pagination() {
        let body = r#"{"data": [{"user_id": "1", "user_login": "a", "display_name": "A"}]}"#;
        let page: HelixPage<HelixBlockedUser> = serde_json::from_str(body).unwrap();
        assert_eq!(page.data[0].user_login, "a");
        assert!(page.pagination.is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = HelixClient::new("http://localhost:8080/helix/");
        assert_eq!(client.base_url, "http://localhost:8080/helix");
        assert_eq!(AutomodAction::Deny.as_str(), "DENY");
    }
}
