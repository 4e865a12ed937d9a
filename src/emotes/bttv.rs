use serde::Deserialize;
use std::sync::Arc;

use super::{Emote, EmoteCache, EmoteMap, EmoteSource, into_emote_map};
use crate::twitch::error::{Result as TwitchResult, TwitchError};

pub const DEFAULT_BTTV_URL: &str = "https://api.betterttv.net/3";

#[derive(Debug, Deserialize)]
struct BttvEmote {
    id: String,
    code: String,
}

pub fn parse_bttv_global(body: &str) -> TwitchResult<Vec<Emote>> {
    let emotes: Vec<BttvEmote> = serde_json::from_str(body)?;
    Ok(emotes
        .into_iter()
        .map(|e| Emote {
            url: format!("https://cdn.betterttv.net/emote/{}/1x", e.id),
            id: e.id,
            name: e.code,
            source: EmoteSource::Bttv,
        })
        .collect())
}

#[derive(Debug)]
pub struct BttvEmotes {
    client: reqwest::Client,
    base_url: String,
    global: EmoteCache,
}

impl BttvEmotes {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            global: EmoteCache::default(),
        }
    }

    pub fn global(&self) -> Arc<EmoteMap> {
        self.global.get()
    }

    pub async fn load_global(&self) -> TwitchResult<usize> {
        let url = format!("{}/cached/emotes/global", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TwitchError::RequestFailed(format!(
                "BTTV global emotes (HTTP {})",
                response.status()
            )));
        }
        let emotes = parse_bttv_global(&response.text().await?)?;
        let count = emotes.len();
        self.global.replace(into_emote_map(emotes));
        tracing::info!(count, "Loaded BTTV global emotes");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bttv_global() {
        let body = r#"[
            {"id": "54fa925e01e468494b85b54d", "code": "OhMyGoodness", "imageType": "png", "animated": false},
            {"id": "54fa8f1401e468494b85b537", "code": ":tf:", "imageType": "png"}
        ]"#;
        let emotes = parse_bttv_global(body).unwrap();
        assert_eq!(emotes.len(), 2);
        assert_eq!(emotes[1].name, ":tf:");
        assert_eq!(
            emotes[0].url,
            "https://cdn.betterttv.net/emote/54fa925e01e468494b85b54d/1x"
        );
    }

    #[test]
    fn test_global_starts_empty() {
        let provider = BttvEmotes::new(DEFAULT_BTTV_URL);
        assert!(provider.global().is_empty());
        provider.global.replace(into_emote_map(parse_bttv_global(r#"[{"id":"1","code":"a"}]"#).unwrap()));
        assert!(provider.global().contains_key("a"));
    }

    #[test]
    fn test_parse_bttv_rejects_bad_json() {
        assert!(matches!(
            parse_bttv_global("{}"),
            Err(TwitchError::SerdeJson(_))
        ));
    }
}
