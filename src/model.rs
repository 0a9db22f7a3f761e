//! Canonical data model: collectables, shelf links, manual entries, and the
//! raw extracted items handed over by the vision collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The user-facing shelf domain. Drives adapter capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShelfType {
    Books,
    Movies,
    Games,
    Music,
    Comics,
    BoardGames,
    Other,
}

impl ShelfType {
    pub fn media_type(self) -> MediaType {
        match self {
            ShelfType::Books => MediaType::Book,
            ShelfType::Movies => MediaType::Movie,
            ShelfType::Games => MediaType::Game,
            ShelfType::Music => MediaType::Music,
            ShelfType::Comics => MediaType::Comic,
            ShelfType::BoardGames => MediaType::BoardGame,
            ShelfType::Other => MediaType::Other,
        }
    }
}

impl FromStr for ShelfType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "books" | "book" => Ok(ShelfType::Books),
            "movies" | "movie" | "film" | "films" => Ok(ShelfType::Movies),
            "games" | "game" | "videogames" => Ok(ShelfType::Games),
            "music" | "records" | "vinyl" => Ok(ShelfType::Music),
            "comics" | "comic" | "manga" => Ok(ShelfType::Comics),
            "boardgames" | "board_games" | "tabletop" => Ok(ShelfType::BoardGames),
            "other" => Ok(ShelfType::Other),
            other => Err(anyhow::anyhow!("unknown shelf type: {other}")),
        }
    }
}

impl fmt::Display for ShelfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShelfType::Books => "books",
            ShelfType::Movies => "movies",
            ShelfType::Games => "games",
            ShelfType::Music => "music",
            ShelfType::Comics => "comics",
            ShelfType::BoardGames => "board_games",
            ShelfType::Other => "other",
        };
        f.write_str(s)
    }
}

/// Media domain of a single catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Book,
    Movie,
    Game,
    Music,
    Comic,
    BoardGame,
    Other,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Book => "book",
            MediaType::Movie => "movie",
            MediaType::Game => "game",
            MediaType::Music => "music",
            MediaType::Comic => "comic",
            MediaType::BoardGame => "board_game",
            MediaType::Other => "other",
        }
    }
}

/// One raw item from the vision-extraction collaborator. Only the title is
/// guaranteed; everything else is best-effort OCR output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedItem {
    pub title: String,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    /// Free-text position hint from the photo (e.g. "shelf 2, third from left").
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Identifier kind -> values, e.g. `isbn13 -> ["9780441013593"]`.
    #[serde(default)]
    pub identifiers: BTreeMap<String, Vec<String>>,
}

impl ExtractedItem {
    pub fn identifier_values(&self, kind: &str) -> &[String] {
        self.identifiers
            .get(kind)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// One image attached to a collectable, in up to three sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_small: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_large: Option<String>,
    pub provider: String,
}

impl ImageRef {
    /// Best-available URL, large first. Dedup key for merged image lists.
    pub fn best_url(&self) -> Option<&str> {
        self.url_large
            .as_deref()
            .or(self.url_medium.as_deref())
            .or(self.url_small.as_deref())
    }
}

/// Per-provider provenance for a collectable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub provider: String,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A learned OCR-tolerant identity hash pointing at this collectable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuzzyFingerprint {
    pub value: String,
    pub source: String,
    pub raw_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_creator: Option<String>,
    pub media_type: MediaType,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// Canonical catalog entity. At most one exists per real-world item; fields
/// are only added or merged, never destructively overwritten (see merge).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collectable {
    pub id: Uuid,
    pub kind: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_creator: Option<String>,
    #[serde(default)]
    pub creators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub genre: Vec<String>,
    /// Provider name -> { identifier kind -> ordered values }. Kept as a JSON
    /// document so provider-specific nesting merges recursively.
    #[serde(default)]
    pub identifiers: Map<String, Value>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub physical: Map<String, Value>,
    #[serde(default)]
    pub editions: Vec<Value>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub extras: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lightweight_fingerprint: Option<String>,
    #[serde(default)]
    pub fuzzy_fingerprints: Vec<FuzzyFingerprint>,
}

impl Collectable {
    pub fn new(media_type: MediaType, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: "collectable".to_string(),
            media_type,
            title: title.into(),
            subtitle: None,
            description: None,
            primary_creator: None,
            creators: Vec::new(),
            year: None,
            tags: Vec::new(),
            genre: Vec::new(),
            identifiers: Map::new(),
            images: Vec::new(),
            physical: Map::new(),
            editions: Vec::new(),
            sources: Vec::new(),
            extras: Map::new(),
            fingerprint: None,
            lightweight_fingerprint: None,
            fuzzy_fingerprints: Vec::new(),
        }
    }

    /// Flattened identifier values of a given kind across all providers.
    pub fn identifier_values(&self, kind: &str) -> Vec<String> {
        let mut out = Vec::new();
        for provider in self.identifiers.values() {
            if let Some(values) = provider.get(kind).and_then(|v| v.as_array()) {
                for v in values {
                    if let Some(s) = v.as_str() {
                        out.push(s.to_string());
                    }
                }
            }
        }
        out
    }

    /// Insert an identifier value under provider/kind, preserving order and
    /// skipping duplicates.
    pub fn add_identifier(&mut self, provider: &str, kind: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        let entry = self
            .identifiers
            .entry(provider.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(obj) = entry.as_object_mut() else {
            return;
        };
        let list = obj
            .entry(kind.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(arr) = list.as_array_mut() {
            if !arr.iter().any(|v| v.as_str() == Some(value.as_str())) {
                arr.push(Value::String(value));
            }
        }
    }

    pub fn has_fuzzy_fingerprint(&self, value: &str) -> bool {
        self.fuzzy_fingerprints.iter().any(|f| f.value == value)
    }
}

/// Fallback record for items nothing could resolve. Always needs review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualEntry {
    pub id: Uuid,
    pub media_type: MediaType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default)]
    pub raw: Map<String, Value>,
    pub needs_review: bool,
    pub created_at: DateTime<Utc>,
}

impl ManualEntry {
    pub fn from_item(item: &ExtractedItem, media_type: MediaType) -> Self {
        let raw = serde_json::to_value(item)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            media_type,
            title: item.title.clone(),
            creator: item.creator.clone(),
            raw,
            needs_review: true,
            created_at: Utc::now(),
        }
    }
}

/// What a shelf row points at: exactly one of a canonical record or a manual
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkTarget {
    Collectable(Uuid),
    Manual(Uuid),
}

/// Per-user shelf metadata carried on the join row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelfItemMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
}

impl ShelfItemMeta {
    /// Fill-only merge: incoming values land where nothing is set yet.
    pub fn absorb(&mut self, incoming: &ShelfItemMeta) {
        if self.position.is_none() {
            self.position = incoming.position.clone();
        }
        if self.format.is_none() {
            self.format = incoming.format.clone();
        }
        if self.notes.is_none() {
            self.notes = incoming.notes.clone();
        }
        if self.rating.is_none() {
            self.rating = incoming.rating;
        }
    }
}

/// Join entity between a user's shelf and a resolved (or manual) item.
/// Unique per (user, shelf, target); re-linking is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCollection {
    pub id: Uuid,
    pub user_id: String,
    pub shelf_id: String,
    pub target: LinkTarget,
    #[serde(default)]
    pub meta: ShelfItemMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_insert_dedupes_and_preserves_order() {
        let mut c = Collectable::new(MediaType::Book, "Dune");
        c.add_identifier("openlibrary", "isbn13", "9780441013593");
        c.add_identifier("openlibrary", "isbn13", "9780441013593");
        c.add_identifier("openlibrary", "isbn13", "9780340960196");
        assert_eq!(
            c.identifier_values("isbn13"),
            vec!["9780441013593", "9780340960196"]
        );
    }

    #[test]
    fn image_best_url_prefers_large() {
        let img = ImageRef {
            kind: "cover".into(),
            url_small: Some("s".into()),
            url_medium: Some("m".into()),
            url_large: Some("l".into()),
            provider: "tmdb".into(),
        };
        assert_eq!(img.best_url(), Some("l"));
        let img2 = ImageRef {
            url_large: None,
            ..img.clone()
        };
        assert_eq!(img2.best_url(), Some("m"));
    }

    #[test]
    fn canonical_shape_uses_camel_case_and_type_key() {
        let mut c = Collectable::new(MediaType::Game, "Outer Wilds");
        c.lightweight_fingerprint = Some("abc".into());
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "game");
        assert_eq!(v["lightweightFingerprint"], "abc");
        assert!(v.get("media_type").is_none());
    }

    #[test]
    fn shelf_type_parses_aliases() {
        assert_eq!("Films".parse::<ShelfType>().unwrap(), ShelfType::Movies);
        assert_eq!("board_games".parse::<ShelfType>().unwrap(), ShelfType::BoardGames);
        assert!("gadgets".parse::<ShelfType>().is_err());
    }
}
