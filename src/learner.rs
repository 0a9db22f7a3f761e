//! Fuzzy-fingerprint learner: after a high-confidence AI resolution, the raw
//! OCR string is hashed and attached to the canonical record, so the next
//! photo of the same misread spine resolves in the matcher with no external
//! call.

use crate::fingerprint::{fuzzy_fingerprint, normalize_creator};
use crate::model::{Collectable, ExtractedItem, FuzzyFingerprint, MediaType};
use crate::store::CatalogStore;
use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

const LEARN_SOURCE: &str = "ai_second_pass";

pub struct FuzzyLearner<'a> {
    store: &'a dyn CatalogStore,
    threshold: f64,
}

impl<'a> FuzzyLearner<'a> {
    pub fn new(store: &'a dyn CatalogStore, threshold: f64) -> Self {
        Self { store, threshold }
    }

    /// Learn the OCR string when confidence clears the threshold AND the
    /// item's creator agrees with the canonical record. Returns true when a
    /// new fingerprint was recorded.
    pub async fn learn(
        &self,
        canonical: &Collectable,
        item: &ExtractedItem,
        media_type: MediaType,
        confidence: f64,
    ) -> Result<bool> {
        if confidence < self.threshold {
            debug!(
                title = %item.title,
                confidence,
                threshold = self.threshold,
                "confidence below learn threshold"
            );
            return Ok(false);
        }
        let (Some(item_creator), Some(canonical_creator)) =
            (item.creator.as_deref(), canonical.primary_creator.as_deref())
        else {
            return Ok(false);
        };
        if normalize_creator(item_creator) != normalize_creator(canonical_creator) {
            debug!(title = %item.title, "creator mismatch, not learning fuzzy fingerprint");
            return Ok(false);
        }
        let Some(value) = fuzzy_fingerprint(&item.title, item_creator, Some(media_type)) else {
            return Ok(false);
        };
        if canonical.has_fuzzy_fingerprint(&value) {
            return Ok(false);
        }

        let entry = FuzzyFingerprint {
            value,
            source: LEARN_SOURCE.into(),
            raw_title: item.title.clone(),
            raw_creator: Some(item_creator.to_string()),
            media_type,
            confidence,
            created_at: Utc::now(),
        };
        let appended = self
            .store
            .append_fuzzy_fingerprint(canonical.id, entry)
            .await?;
        if appended {
            info!(
                id = %canonical.id,
                raw_title = %item.title,
                "learned fuzzy fingerprint from ai resolution"
            );
        }
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn canonical_book(title: &str, creator: &str) -> Collectable {
        let mut c = Collectable::new(MediaType::Book, title);
        c.primary_creator = Some(creator.into());
        c
    }

    fn ocr_item(title: &str, creator: &str) -> ExtractedItem {
        ExtractedItem {
            title: title.into(),
            creator: Some(creator.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn low_confidence_does_not_learn() {
        let store = MemoryStore::new();
        let canonical = canonical_book("Dune", "Frank Herbert");
        let id = canonical.id;
        store.upsert_collectable(canonical.clone()).await.unwrap();

        let learner = FuzzyLearner::new(&store, 0.7);
        let learned = learner
            .learn(&canonical, &ocr_item("Dvne", "Frank Herbert"), MediaType::Book, 0.5)
            .await
            .unwrap();
        assert!(!learned);
        let stored = store.get_collectable(id).await.unwrap().unwrap();
        assert!(stored.fuzzy_fingerprints.is_empty());
    }

    #[tokio::test]
    async fn high_confidence_with_matching_creator_learns_once() {
        let store = MemoryStore::new();
        let canonical = canonical_book("Dune", "Frank Herbert");
        let id = canonical.id;
        store.upsert_collectable(canonical.clone()).await.unwrap();

        let learner = FuzzyLearner::new(&store, 0.7);
        let item = ocr_item("Dvne", "frank herbert");
        assert!(learner.learn(&canonical, &item, MediaType::Book, 0.85).await.unwrap());

        let stored = store.get_collectable(id).await.unwrap().unwrap();
        assert_eq!(stored.fuzzy_fingerprints.len(), 1);
        assert_eq!(stored.fuzzy_fingerprints[0].raw_title, "Dvne");

        // re-learning the same value is a no-op
        let again = learner.learn(&stored, &item, MediaType::Book, 0.9).await.unwrap();
        assert!(!again);
        let stored = store.get_collectable(id).await.unwrap().unwrap();
        assert_eq!(stored.fuzzy_fingerprints.len(), 1);
    }

    #[tokio::test]
    async fn creator_mismatch_blocks_learning() {
        let store = MemoryStore::new();
        let canonical = canonical_book("Dune", "Frank Herbert");
        store.upsert_collectable(canonical.clone()).await.unwrap();

        let learner = FuzzyLearner::new(&store, 0.7);
        let learned = learner
            .learn(&canonical, &ocr_item("Dvne", "Brian Herbert"), MediaType::Book, 0.95)
            .await
            .unwrap();
        assert!(!learned);
    }
}
