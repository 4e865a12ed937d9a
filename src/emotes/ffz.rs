use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Emote, EmoteCache, EmoteMap, EmoteSource, into_emote_map};
use crate::twitch::error::{Result as TwitchResult, TwitchError};

pub const DEFAULT_FFZ_URL: &str = "https://api.frankerfacez.com/v1";

#[derive(Debug, Deserialize)]
struct FfzGlobalResponse {
    #[serde(default)]
    default_sets: Vec<u64>,
    sets: HashMap<String, FfzSet>,
}

#[derive(Debug, Deserialize)]
struct FfzSet {
    emoticons: Vec<FfzEmote>,
}

#[derive(Debug, Deserialize)]
struct FfzEmote {
    id: u64,
    name: String,
    #[serde(default)]
    urls: HashMap<String, String>,
}

/// Only emotes of the default sets are global; the response also carries
/// sets that are limited to specific users.
pub fn parse_ffz_global(body: &str) -> TwitchResult<Vec<Emote>> {
    let response: FfzGlobalResponse = serde_json::from_str(body)?;
    let mut emotes = Vec::new();
    for set_id in &response.default_sets {
        let Some(set) = response.sets.get(&set_id.to_string()) else {
            continue;
        };
        for emote in &set.emoticons {
            let url = emote
                .urls
                .get("1")
                .map(|u| match u.strip_prefix("//") {
                    Some(rest) => format!("https://{}", rest),
                    None => u.clone(),
                })
                .unwrap_or_else(|| format!("https://cdn.frankerfacez.com/emote/{}/1", emote.id));
            emotes.push(Emote {
                id: emote.id.to_string(),
                name: emote.name.clone(),
                url,
                source: EmoteSource::Ffz,
            });
        }
    }
    Ok(emotes)
}

#[derive(Debug)]
pub struct FfzEmotes {
    client: reqwest::Client,
    base_url: String,
    global: EmoteCache,
}

impl FfzEmotes {
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
        let url = format!("{}/set/global", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TwitchError::RequestFailed(format!(
                "FFZ global emotes (HTTP {})",
                response.status()
            )));
        }
        let emotes = parse_ffz_global(&response.text().await?)?;
        let count = emotes.len();
        self.global.replace(into_emote_map(emotes));
        tracing::info!(count, "Loaded FFZ global emotes");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ffz_global_only_default_sets() {
        let body = r#"{
            "default_sets": [3],
            "sets": {
                "3": {"id": 3, "emoticons": [
                    {"id": 25927, "name": "CatBag", "urls": {"1": "//cdn.frankerfacez.com/emote/25927/1"}},
                    {"id": 28136, "name": "LilZ", "urls": {}}
                ]},
                "4330": {"id": 4330, "emoticons": [
                    {"id": 1, "name": "UserOnly", "urls": {}}
                ]}
            },
            "users": {"4330": ["someone"]}
        }"#;
        let emotes = parse_ffz_global(body).unwrap();
        let names: Vec<_> = emotes.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["CatBag", "LilZ"]);
        assert_eq!(emotes[0].url, "https://cdn.frankerfacez.com/emote/25927/1");
        assert_eq!(emotes[1].url, "https://cdn.frankerfacez.com/emote/28136/1");
        assert_eq!(emotes[0].source, EmoteSource::Ffz);
    }
}
