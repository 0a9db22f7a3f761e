//! Fingerprint matcher: the fast path that resolves extracted items against
//! the canonical store before any external call.
//!
//! Priority per item: fuzzy fingerprint + creator match, then exact
//! lightweight fingerprint, then case-insensitive exact title. A fuzzy hit
//! alone is never enough — generic titles collide, so the creator must agree.

use crate::fingerprint::{
    fuzzy_fingerprint, lightweight_fingerprint, normalize_creator, FingerprintParts,
};
use crate::model::{Collectable, ExtractedItem, MediaType};
use crate::store::CatalogStore;
use crate::util::pool::bounded_map;
use anyhow::Result;
use tracing::{debug, warn};

/// Which tier resolved the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPath {
    Fuzzy,
    Lightweight,
    Title,
}

impl MatchPath {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchPath::Fuzzy => "fuzzy",
            MatchPath::Lightweight => "lightweight",
            MatchPath::Title => "title",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchedItem {
    pub index: usize,
    pub item: ExtractedItem,
    pub collectable: Collectable,
    pub path: MatchPath,
}

/// Split result: resolved items plus the remainder for the provider pass,
/// both carrying their original batch index.
#[derive(Debug, Default)]
pub struct MatchReport {
    pub matched: Vec<MatchedItem>,
    pub remaining: Vec<(usize, ExtractedItem)>,
}

pub struct FingerprintMatcher<'a> {
    store: &'a dyn CatalogStore,
    media_type: MediaType,
}

impl<'a> FingerprintMatcher<'a> {
    pub fn new(store: &'a dyn CatalogStore, media_type: MediaType) -> Self {
        Self { store, media_type }
    }

    pub async fn match_items(
        &self,
        items: &[ExtractedItem],
        concurrency: usize,
    ) -> Result<MatchReport> {
        let results = bounded_map(items.len(), concurrency, |i| {
            let item = &items[i];
            async move {
                match self.match_one(item).await {
                    Ok(hit) => hit,
                    Err(err) => {
                        // A store error on one item must not sink the batch.
                        warn!(title = %item.title, error = %err, "fingerprint match failed");
                        None
                    }
                }
            }
        })
        .await;

        let mut report = MatchReport::default();
        for (i, (hit, item)) in results.into_iter().zip(items.iter()).enumerate() {
            match hit {
                Some((collectable, path)) => report.matched.push(MatchedItem {
                    index: i,
                    item: item.clone(),
                    collectable,
                    path,
                }),
                None => report.remaining.push((i, item.clone())),
            }
        }
        Ok(report)
    }

    async fn match_one(&self, item: &ExtractedItem) -> Result<Option<(Collectable, MatchPath)>> {
        let parts = FingerprintParts::from_item(item, self.media_type);
        let lightweight = lightweight_fingerprint(&parts);

        // Tier 1: fuzzy fingerprint, gated on creator agreement.
        if let Some(creator) = item.creator.as_deref() {
            if let Some(fuzzy) = fuzzy_fingerprint(&item.title, creator, Some(self.media_type)) {
                let want_creator = normalize_creator(creator);
                let candidates = self.store.find_by_fuzzy_fingerprint(&fuzzy).await?;
                let hit = candidates.into_iter().find(|c| {
                    c.media_type == self.media_type
                        && c.primary_creator
                            .as_deref()
                            .map(|pc| normalize_creator(pc) == want_creator)
                            .unwrap_or(false)
                });
                if let Some(c) = hit {
                    debug!(title = %item.title, path = "fuzzy", id = %c.id, "matched");
                    self.backfill_lightweight(&c, &lightweight).await?;
                    return Ok(Some((c, MatchPath::Fuzzy)));
                }
            }
        }

        // Tier 2: exact lightweight fingerprint.
        if let Some(c) = self
            .store
            .find_by_lightweight_fingerprint(&lightweight)
            .await?
        {
            debug!(title = %item.title, path = "lightweight", id = %c.id, "matched");
            return Ok(Some((c, MatchPath::Lightweight)));
        }

        // Tier 3: case-insensitive exact title, creator-filtered when known.
        let hit = self
            .store
            .find_by_title(self.media_type, &item.title, item.creator.as_deref())
            .await?;
        if let Some(c) = hit {
            debug!(title = %item.title, path = "title", id = %c.id, "matched");
            self.backfill_lightweight(&c, &lightweight).await?;
            return Ok(Some((c, MatchPath::Title)));
        }

        debug!(title = %item.title, "no fingerprint match, passing to providers");
        Ok(None)
    }

    /// Self-healing index: records matched by another tier learn their
    /// lightweight fingerprint so the next photo takes the faster path.
    async fn backfill_lightweight(&self, c: &Collectable, lightweight: &str) -> Result<()> {
        if c.lightweight_fingerprint.is_none() {
            self.store
                .set_lightweight_fingerprint_if_missing(c.id, lightweight)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FuzzyFingerprint;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn item(title: &str, creator: Option<&str>, year: Option<i32>) -> ExtractedItem {
        ExtractedItem {
            title: title.to_string(),
            creator: creator.map(Into::into),
            year,
            ..Default::default()
        }
    }

    fn stored_book(
        title: &str,
        creator: Option<&str>,
        lightweight: Option<String>,
        fuzzy: Option<String>,
    ) -> Collectable {
        let mut c = Collectable::new(MediaType::Book, title);
        c.primary_creator = creator.map(Into::into);
        c.lightweight_fingerprint = lightweight;
        if let Some(value) = fuzzy {
            c.fuzzy_fingerprints.push(FuzzyFingerprint {
                value,
                source: "ai_second_pass".into(),
                raw_title: title.into(),
                raw_creator: creator.map(Into::into),
                media_type: MediaType::Book,
                confidence: 0.9,
                created_at: Utc::now(),
            });
        }
        c.fingerprint = Some(format!("fp:{title}"));
        c
    }

    #[tokio::test]
    async fn fuzzy_with_creator_match_wins_over_lightweight() {
        let store = MemoryStore::new();
        let ocr = item("Dvne", Some("Frank Herbert"), None);
        let fuzzy = fuzzy_fingerprint("Dvne", "Frank Herbert", Some(MediaType::Book)).unwrap();
        let lw = lightweight_fingerprint(&FingerprintParts::from_item(&ocr, MediaType::Book));

        // record A carries the learned fuzzy hash, record B the lightweight one
        let a = stored_book("Dune", Some("Frank Herbert"), None, Some(fuzzy));
        let b = stored_book("Dvne", Some("Somebody Else"), Some(lw), None);
        let a_id = a.id;
        store.upsert_collectable(a).await.unwrap();
        store.upsert_collectable(b).await.unwrap();

        let matcher = FingerprintMatcher::new(&store, MediaType::Book);
        let report = matcher.match_items(&[ocr], 2).await.unwrap();
        assert_eq!(report.matched.len(), 1);
        assert_eq!(report.matched[0].path, MatchPath::Fuzzy);
        assert_eq!(report.matched[0].collectable.id, a_id);
    }

    #[tokio::test]
    async fn fuzzy_without_creator_agreement_falls_through_to_lightweight() {
        let store = MemoryStore::new();
        let ocr = item("Dvne", Some("Frank Herbert"), None);
        let fuzzy = fuzzy_fingerprint("Dvne", "Frank Herbert", Some(MediaType::Book)).unwrap();
        let lw = lightweight_fingerprint(&FingerprintParts::from_item(&ocr, MediaType::Book));

        // fuzzy value present but stored under a different creator
        let a = stored_book("Dune", Some("Brian Herbert"), None, Some(fuzzy));
        let b = stored_book("Dvne", Some("Frank Herbert"), Some(lw), None);
        let b_id = b.id;
        store.upsert_collectable(a).await.unwrap();
        store.upsert_collectable(b).await.unwrap();

        let matcher = FingerprintMatcher::new(&store, MediaType::Book);
        let report = matcher.match_items(&[ocr], 2).await.unwrap();
        assert_eq!(report.matched[0].path, MatchPath::Lightweight);
        assert_eq!(report.matched[0].collectable.id, b_id);
    }

    #[tokio::test]
    async fn title_match_backfills_missing_lightweight_fingerprint() {
        let store = MemoryStore::new();
        let stored = stored_book("The Dispossessed", Some("Ursula K. Le Guin"), None, None);
        let id = stored.id;
        store.upsert_collectable(stored).await.unwrap();

        let ocr = item("the dispossessed", Some("Ursula K. Le Guin"), None);
        let matcher = FingerprintMatcher::new(&store, MediaType::Book);
        let report = matcher.match_items(&[ocr.clone()], 1).await.unwrap();
        assert_eq!(report.matched[0].path, MatchPath::Title);

        let healed = store.get_collectable(id).await.unwrap().unwrap();
        let expected = lightweight_fingerprint(&FingerprintParts::from_item(&ocr, MediaType::Book));
        assert_eq!(healed.lightweight_fingerprint.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn unmatched_items_are_returned_as_remaining_in_order() {
        let store = MemoryStore::new();
        let matcher = FingerprintMatcher::new(&store, MediaType::Book);
        let items = vec![
            item("Unknown One", None, None),
            item("Unknown Two", Some("Nobody"), None),
        ];
        let report = matcher.match_items(&items, 4).await.unwrap();
        assert!(report.matched.is_empty());
        let indices: Vec<usize> = report.remaining.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1]);
    }
}
