//! Canonical store seam. The pipeline only ever talks to `CatalogStore`;
//! production uses the SQLite implementation, tests use the in-memory one.

pub mod memory;
pub mod sqlite;

use crate::model::{
    Collectable, FuzzyFingerprint, LinkTarget, ManualEntry, MediaType, ShelfItemMeta,
    UserCollection,
};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Identifier kinds that count as a provider's own strong ID.
const STRONG_ID_KINDS: &[&str] = &["id", "gameId", "movieId", "editionId", "workId", "work"];
/// Identifier kinds that are physical barcodes shared across providers.
const BARCODE_KINDS: &[&str] = &["isbn13", "isbn10", "upc", "ean"];

/// Dedup keys for a candidate record, in priority order:
/// provider strong ID > ISBN/UPC > strong fingerprint > lightweight.
#[derive(Debug, Clone, Default)]
pub struct DedupKeys {
    /// `provider:kind:value` triples, flattened for indexed lookup.
    pub provider_ids: Vec<String>,
    pub barcodes: Vec<String>,
    pub fingerprint: Option<String>,
    pub lightweight_fingerprint: Option<String>,
}

impl DedupKeys {
    pub fn from_collectable(c: &Collectable) -> Self {
        let mut keys = Self {
            fingerprint: c.fingerprint.clone(),
            lightweight_fingerprint: c.lightweight_fingerprint.clone(),
            ..Default::default()
        };
        for (provider, kinds) in &c.identifiers {
            let Some(obj) = kinds.as_object() else {
                continue;
            };
            for (kind, values) in obj {
                let Some(arr) = values.as_array() else {
                    continue;
                };
                for v in arr.iter().filter_map(|v| v.as_str()) {
                    if BARCODE_KINDS.contains(&kind.as_str()) {
                        keys.barcodes.push(v.to_string());
                    } else if STRONG_ID_KINDS.contains(&kind.as_str()) {
                        keys.provider_ids.push(format!("{provider}:{kind}:{v}"));
                    }
                }
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.provider_ids.is_empty()
            && self.barcodes.is_empty()
            && self.fingerprint.is_none()
            && self.lightweight_fingerprint.is_none()
    }
}

/// Result of the atomic merge-upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub collectable: Collectable,
    pub created: bool,
}

/// Result of an idempotent shelf link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Created(Uuid),
    AlreadyLinked(Uuid),
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Dedup-priority OR-lookup. Returns the highest-priority hit, if any.
    async fn find_match(&self, keys: &DedupKeys) -> Result<Option<Collectable>>;

    /// Atomic find-merge-write-or-insert. The strong fingerprint is only set
    /// on insert; on update the candidate is merged into the existing row.
    async fn upsert_collectable(&self, candidate: Collectable) -> Result<UpsertOutcome>;

    async fn get_collectable(&self, id: Uuid) -> Result<Option<Collectable>>;

    /// All records carrying the given fuzzy fingerprint value.
    async fn find_by_fuzzy_fingerprint(&self, value: &str) -> Result<Vec<Collectable>>;

    async fn find_by_lightweight_fingerprint(&self, value: &str) -> Result<Option<Collectable>>;

    /// Case-insensitive exact title match, optionally filtered by creator
    /// (normalized comparison).
    async fn find_by_title(
        &self,
        media_type: MediaType,
        title: &str,
        creator: Option<&str>,
    ) -> Result<Option<Collectable>>;

    /// Self-healing index backfill; no-op when the record already has one.
    async fn set_lightweight_fingerprint_if_missing(&self, id: Uuid, value: &str) -> Result<()>;

    /// Append a learned fuzzy fingerprint. Returns false when the value was
    /// already present (duplicate guard).
    async fn append_fuzzy_fingerprint(&self, id: Uuid, entry: FuzzyFingerprint) -> Result<bool>;

    async fn insert_manual_entry(&self, entry: ManualEntry) -> Result<Uuid>;

    /// Idempotent link of a shelf to a target; merges per-user metadata when
    /// the link already exists.
    async fn link_user_collection(
        &self,
        user_id: &str,
        shelf_id: &str,
        target: LinkTarget,
        meta: ShelfItemMeta,
    ) -> Result<LinkOutcome>;

    async fn list_shelf(&self, user_id: &str, shelf_id: &str) -> Result<Vec<UserCollection>>;

    /// Remove one shelf row. Returns true when something was deleted.
    async fn unlink_user_collection(
        &self,
        user_id: &str,
        shelf_id: &str,
        target: LinkTarget,
    ) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaType;

    #[test]
    fn dedup_keys_split_barcodes_from_provider_ids() {
        let mut c = Collectable::new(MediaType::Book, "Dune");
        c.add_identifier("openlibrary", "isbn13", "9780441013593");
        c.add_identifier("openlibrary", "work", "OL893415W");
        c.add_identifier("igdb", "gameId", "123");
        c.fingerprint = Some("fp".into());

        let keys = DedupKeys::from_collectable(&c);
        assert_eq!(keys.barcodes, vec!["9780441013593"]);
        assert!(keys
            .provider_ids
            .contains(&"openlibrary:work:OL893415W".to_string()));
        assert!(keys.provider_ids.contains(&"igdb:gameId:123".to_string()));
        assert_eq!(keys.fingerprint.as_deref(), Some("fp"));
    }
}
