pub mod bttv;
pub mod ffz;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub use bttv::BttvEmotes;
pub use ffz::FfzEmotes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EmoteSource {
    Twitch,
    Bttv,
    Ffz,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Emote {
    pub id: String,
    pub name: String,
    pub url: String,
    pub source: EmoteSource,
}

impl Emote {
    pub fn twitch(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            url: format!(
                "https://static-cdn.jtvnw.net/emoticons/v2/{}/default/dark/1.0",
                id
            ),
            id,
            name: name.into(),
            source: EmoteSource::Twitch,
        }
    }
}

/// Emotes keyed by the name typed in chat.
pub type EmoteMap = HashMap<String, Emote>;

/// Snapshot holder for a provider's global emotes. Loads replace the whole
/// map, so readers only ever see a complete set.
#[derive(Debug, Default)]
pub(crate) struct EmoteCache {
    emotes: RwLock<Arc<EmoteMap>>,
}

impl EmoteCache {
    pub(crate) fn get(&self) -> Arc<EmoteMap> {
        Arc::clone(&self.emotes.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn replace(&self, emotes: EmoteMap) {
        *self.emotes.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(emotes);
    }
}

pub(crate) fn into_emote_map(emotes: impl IntoIterator<Item = Emote>) -> EmoteMap {
    emotes.into_iter().map(|e| (e.name.clone(), e)).collect()
}
