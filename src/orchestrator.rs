//! Pipeline orchestrator. One invocation resolves the full batch of items
//! extracted from a single photo: fingerprint match, provider first pass,
//! gated AI second pass, then upsert + shelf link (or a manual entry when
//! nothing resolved). A failure on one item never aborts the batch.

use crate::config::PipelineConfig;
use crate::enrich::AiEnricher;
use crate::fingerprint::{lightweight_fingerprint, FingerprintParts};
use crate::learner::FuzzyLearner;
use crate::matcher::FingerprintMatcher;
use crate::model::{
    Collectable, ExtractedItem, LinkTarget, ManualEntry, MediaType, ShelfItemMeta, ShelfType,
};
use crate::providers::{AiHit, Enrichment, LookupStatus, ProviderAdapter};
use crate::store::{CatalogStore, LinkOutcome};
use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier provenance for values the vision pass read off the item itself.
const EXTRACTED_SOURCE: &str = "extracted";

/// One photo's worth of work.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub user_id: String,
    pub shelf_id: String,
    pub shelf_type: ShelfType,
    pub items: Vec<ExtractedItem>,
}

/// Terminal outcome per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Resolved to a canonical record and newly joined to the shelf.
    Linked,
    /// Resolved to a record that was already on the shelf; metadata refreshed.
    Existing,
    /// No stage resolved it; stored as a manual entry flagged for review.
    ManualAdded,
}

impl ItemOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemOutcome::Linked => "linked",
            ItemOutcome::Existing => "existing",
            ItemOutcome::ManualAdded => "manual_added",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub index: usize,
    pub title: String,
    pub outcome: ItemOutcome,
    pub collectable_id: Option<Uuid>,
    pub manual_id: Option<Uuid>,
    /// Which stage resolved the item: a match path, a provider name, or the
    /// AI pass. None for manual entries.
    pub resolved_by: Option<&'static str>,
}

#[derive(Debug, Default)]
pub struct ResolveSummary {
    pub results: Vec<ItemResult>,
}

impl ResolveSummary {
    pub fn count(&self, outcome: ItemOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    fn push(&mut self, result: ItemResult) {
        self.results.push(result);
    }

    fn sort(&mut self) {
        self.results.sort_by_key(|r| r.index);
    }
}

pub struct Orchestrator<'a> {
    store: &'a dyn CatalogStore,
    adapters: Vec<Box<dyn ProviderAdapter>>,
    enricher: Option<AiEnricher>,
    cfg: PipelineConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a dyn CatalogStore, cfg: PipelineConfig) -> Self {
        Self {
            store,
            adapters: Vec::new(),
            enricher: None,
            cfg,
        }
    }

    /// Wire up every adapter whose credentials are present. Missing
    /// credentials are logged once and that provider sits the run out.
    pub fn from_env(store: &'a dyn CatalogStore, cfg: PipelineConfig) -> Self {
        let mut orchestrator = Self::new(store, cfg.clone());
        match crate::providers::openlibrary::OpenLibraryAdapter::from_env(&cfg) {
            Ok(adapter) => orchestrator.adapters.push(Box::new(adapter)),
            Err(err) => warn!(error = %err, "openlibrary adapter unavailable"),
        }
        match crate::providers::tmdb::TmdbAdapter::from_env(&cfg) {
            Ok(adapter) => orchestrator.adapters.push(Box::new(adapter)),
            Err(err) => warn!(error = %err, "tmdb adapter unavailable"),
        }
        match crate::providers::igdb::IgdbAdapter::from_env(&cfg) {
            Ok(adapter) => orchestrator.adapters.push(Box::new(adapter)),
            Err(err) => warn!(error = %err, "igdb adapter unavailable"),
        }
        if cfg.ai.enabled {
            match AiEnricher::new(cfg.ai.clone()) {
                Ok(enricher) => orchestrator.enricher = Some(enricher),
                Err(err) => warn!(error = %err, "ai second pass unavailable"),
            }
        }
        orchestrator
    }

    pub fn with_adapter(mut self, adapter: Box<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_enricher(mut self, enricher: AiEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub async fn run(&self, request: &ResolveRequest) -> Result<ResolveSummary> {
        let media_type = request.shelf_type.media_type();
        let mut summary = ResolveSummary::default();
        info!(
            user = %request.user_id,
            shelf = %request.shelf_id,
            shelf_type = %request.shelf_type,
            items = request.items.len(),
            "resolving batch"
        );

        // Stage 1: fingerprint fast path.
        let matcher = FingerprintMatcher::new(self.store, media_type);
        let report = matcher
            .match_items(&request.items, self.cfg.concurrency)
            .await?;
        info!(
            matched = report.matched.len(),
            remaining = report.remaining.len(),
            "fingerprint pass complete"
        );
        for matched in report.matched {
            let result = self
                .apply_resolved(
                    request,
                    matched.index,
                    &matched.item,
                    matched.collectable,
                    matched.path.as_str(),
                )
                .await;
            summary.push(result);
        }

        // Stage 2: provider first pass.
        let adapter = self
            .adapters
            .iter()
            .find(|a| a.supports_shelf_type(request.shelf_type));
        let mut unresolved: Vec<(usize, ExtractedItem)> = Vec::new();
        match adapter {
            Some(adapter) if !report.remaining.is_empty() => {
                let items: Vec<ExtractedItem> =
                    report.remaining.iter().map(|(_, item)| item.clone()).collect();
                let outcomes = adapter
                    .lookup_first_pass(&items, self.cfg.concurrency)
                    .await;
                for ((index, item), outcome) in report.remaining.into_iter().zip(outcomes) {
                    match (outcome.status, outcome.enrichment) {
                        (LookupStatus::Resolved, Some(enrichment)) => {
                            let result = self
                                .apply_enrichment(request, index, &item, adapter.as_ref(), &enrichment)
                                .await;
                            match result {
                                Some(result) => summary.push(result),
                                None => unresolved.push((index, item)),
                            }
                        }
                        _ => unresolved.push((index, item)),
                    }
                }
            }
            _ => {
                if adapter.is_none() && !report.remaining.is_empty() {
                    warn!(
                        shelf_type = %request.shelf_type,
                        "no provider adapter for shelf type, skipping catalog lookup"
                    );
                }
                unresolved = report.remaining;
            }
        }

        // Stage 3: gated AI second pass. Corrected metadata goes back to the
        // provider first (bounded re-lookup); the model's own structured
        // answer is the fallback when the catalog still misses.
        let run_second_pass = adapter
            .map(|a| a.should_run_second_pass(request.shelf_type, unresolved.len()))
            .unwrap_or(false);
        if run_second_pass {
            if let Some(enricher) = &self.enricher {
                let hits = enricher.enrich(&unresolved, media_type).await;
                info!(enriched = hits.len(), sent = unresolved.len(), "ai pass complete");
                if !hits.is_empty() {
                    let corrected: Vec<ExtractedItem> = hits
                        .iter()
                        .map(|(index, hit)| {
                            let original =
                                unresolved.iter().find(|(i, _)| i == index).map(|(_, it)| it);
                            corrected_item(original, &hit.collectable)
                        })
                        .collect();
                    let relookups = match adapter {
                        Some(adapter) => {
                            adapter
                                .lookup_first_pass(&corrected, self.cfg.concurrency)
                                .await
                        }
                        None => Vec::new(),
                    };
                    for (slot, (index, hit)) in hits.into_iter().enumerate() {
                        let Some(pos) = unresolved.iter().position(|(i, _)| *i == index) else {
                            continue;
                        };
                        let (_, item) = unresolved.remove(pos);
                        let mut result = None;
                        if let (Some(adapter), Some(outcome)) = (adapter, relookups.get(slot)) {
                            if let Some(enrichment) = &outcome.enrichment {
                                debug!(
                                    title = %item.title,
                                    corrected = %corrected[slot].title,
                                    "ai-corrected item resolved by provider re-lookup"
                                );
                                result = self
                                    .apply_ai_relookup(
                                        request,
                                        index,
                                        &item,
                                        &corrected[slot],
                                        adapter.as_ref(),
                                        enrichment,
                                        hit.confidence,
                                    )
                                    .await;
                            }
                        }
                        let result = match result {
                            Some(result) => result,
                            None => self.apply_ai_hit(request, index, &item, hit).await,
                        };
                        summary.push(result);
                    }
                }
            }
        }

        // Stage 4: whatever is left becomes a manual entry for review.
        for (index, item) in unresolved {
            summary.push(self.add_manual(request, index, &item, media_type).await);
        }

        summary.sort();
        info!(
            linked = summary.count(ItemOutcome::Linked),
            existing = summary.count(ItemOutcome::Existing),
            manual = summary.count(ItemOutcome::ManualAdded),
            "batch complete"
        );
        Ok(summary)
    }

    /// Upsert the canonical record and link it. Any persistence failure
    /// degrades this one item to a manual entry.
    async fn apply_resolved(
        &self,
        request: &ResolveRequest,
        index: usize,
        item: &ExtractedItem,
        candidate: Collectable,
        resolved_by: &'static str,
    ) -> ItemResult {
        match self.upsert_and_link(request, item, candidate).await {
            Ok((id, outcome)) => ItemResult {
                index,
                title: item.title.clone(),
                outcome,
                collectable_id: Some(id),
                manual_id: None,
                resolved_by: Some(resolved_by),
            },
            Err(err) => {
                warn!(title = %item.title, error = %err, "apply failed, degrading to manual entry");
                self.add_manual(request, index, item, request.shelf_type.media_type())
                    .await
            }
        }
    }

    async fn apply_enrichment(
        &self,
        request: &ResolveRequest,
        index: usize,
        item: &ExtractedItem,
        adapter: &dyn ProviderAdapter,
        enrichment: &Enrichment,
    ) -> Option<ItemResult> {
        let parts = FingerprintParts::from_item(item, request.shelf_type.media_type());
        let lightweight = lightweight_fingerprint(&parts);
        let candidate = adapter.build_collectable(enrichment, item, Some(&lightweight))?;
        Some(
            self.apply_resolved(request, index, item, candidate, adapter.name())
                .await,
        )
    }

    async fn apply_ai_hit(
        &self,
        request: &ResolveRequest,
        index: usize,
        item: &ExtractedItem,
        hit: AiHit,
    ) -> ItemResult {
        let media_type = request.shelf_type.media_type();
        let confidence = hit.confidence;
        match self.upsert_and_link(request, item, hit.collectable).await {
            Ok((id, outcome)) => {
                // learn the OCR string against the record that actually won the
                // merge, which may predate this resolution
                if let Ok(Some(canonical)) = self.store.get_collectable(id).await {
                    let learner = FuzzyLearner::new(self.store, self.cfg.ai.learn_threshold);
                    if let Err(err) = learner.learn(&canonical, item, media_type, confidence).await
                    {
                        warn!(title = %item.title, error = %err, "fuzzy learn failed");
                    }
                }
                ItemResult {
                    index,
                    title: item.title.clone(),
                    outcome,
                    collectable_id: Some(id),
                    manual_id: None,
                    resolved_by: Some("ai_second_pass"),
                }
            }
            Err(err) => {
                warn!(title = %item.title, error = %err, "ai apply failed, degrading to manual entry");
                self.add_manual(request, index, item, media_type).await
            }
        }
    }

    /// Provider resolution of an AI-corrected item. The learner still sees the
    /// ORIGINAL item so the noisy OCR string is what gets hashed. None means
    /// the enrichment could not be mapped and the caller falls back to the
    /// model's own answer.
    #[allow(clippy::too_many_arguments)]
    async fn apply_ai_relookup(
        &self,
        request: &ResolveRequest,
        index: usize,
        item: &ExtractedItem,
        corrected: &ExtractedItem,
        adapter: &dyn ProviderAdapter,
        enrichment: &Enrichment,
        confidence: f64,
    ) -> Option<ItemResult> {
        let media_type = request.shelf_type.media_type();
        let parts = FingerprintParts::from_item(corrected, media_type);
        let lightweight = lightweight_fingerprint(&parts);
        let candidate = adapter.build_collectable(enrichment, corrected, Some(&lightweight))?;
        match self.upsert_and_link(request, item, candidate).await {
            Ok((id, outcome)) => {
                if let Ok(Some(canonical)) = self.store.get_collectable(id).await {
                    let learner = FuzzyLearner::new(self.store, self.cfg.ai.learn_threshold);
                    if let Err(err) = learner.learn(&canonical, item, media_type, confidence).await
                    {
                        warn!(title = %item.title, error = %err, "fuzzy learn failed");
                    }
                }
                Some(ItemResult {
                    index,
                    title: item.title.clone(),
                    outcome,
                    collectable_id: Some(id),
                    manual_id: None,
                    resolved_by: Some(adapter.name()),
                })
            }
            Err(err) => {
                warn!(title = %item.title, error = %err, "re-lookup apply failed, degrading to manual entry");
                Some(self.add_manual(request, index, item, media_type).await)
            }
        }
    }

    async fn upsert_and_link(
        &self,
        request: &ResolveRequest,
        item: &ExtractedItem,
        mut candidate: Collectable,
    ) -> Result<(Uuid, ItemOutcome)> {
        // Evidence the vision pass read off the physical copy (ISBNs, catalog
        // numbers) accretes onto the canonical record on every resolution.
        for (kind, values) in &item.identifiers {
            for value in values {
                candidate.add_identifier(EXTRACTED_SOURCE, kind, value);
            }
        }
        let upserted = self.store.upsert_collectable(candidate).await?;
        let id = upserted.collectable.id;
        debug!(id = %id, created = upserted.created, "collectable upserted");
        let link = self
            .store
            .link_user_collection(
                &request.user_id,
                &request.shelf_id,
                LinkTarget::Collectable(id),
                shelf_meta(item),
            )
            .await?;
        let outcome = match link {
            LinkOutcome::Created(_) => ItemOutcome::Linked,
            LinkOutcome::AlreadyLinked(_) => ItemOutcome::Existing,
        };
        Ok((id, outcome))
    }

    async fn add_manual(
        &self,
        request: &ResolveRequest,
        index: usize,
        item: &ExtractedItem,
        media_type: MediaType,
    ) -> ItemResult {
        let entry = ManualEntry::from_item(item, media_type);
        let manual_id = match self.store.insert_manual_entry(entry).await {
            Ok(id) => {
                let link = self
                    .store
                    .link_user_collection(
                        &request.user_id,
                        &request.shelf_id,
                        LinkTarget::Manual(id),
                        shelf_meta(item),
                    )
                    .await;
                if let Err(err) = link {
                    warn!(title = %item.title, error = %err, "manual entry link failed");
                }
                Some(id)
            }
            Err(err) => {
                warn!(title = %item.title, error = %err, "manual entry insert failed");
                None
            }
        };
        ItemResult {
            index,
            title: item.title.clone(),
            outcome: ItemOutcome::ManualAdded,
            collectable_id: None,
            manual_id,
            resolved_by: None,
        }
    }
}

/// The AI-corrected reading of an item, keeping the original's photo context
/// (position, format) but taking the model's title/creator/year and folding
/// in any identifiers it surfaced.
fn corrected_item(original: Option<&ExtractedItem>, c: &Collectable) -> ExtractedItem {
    let mut item = original.cloned().unwrap_or_default();
    item.title = c.title.clone();
    if c.primary_creator.is_some() {
        item.creator = c.primary_creator.clone();
    }
    if c.year.is_some() {
        item.year = c.year;
    }
    for provider in c.identifiers.values() {
        let Some(obj) = provider.as_object() else {
            continue;
        };
        for (kind, values) in obj {
            let Some(arr) = values.as_array() else {
                continue;
            };
            let entry = item.identifiers.entry(kind.clone()).or_default();
            for v in arr.iter().filter_map(|v| v.as_str()) {
                if !entry.iter().any(|e| e == v) {
                    entry.push(v.to_string());
                }
            }
        }
    }
    item
}

fn shelf_meta(item: &ExtractedItem) -> ShelfItemMeta {
    ShelfItemMeta {
        position: item.position.clone(),
        format: item.format.clone(),
        notes: None,
        rating: None,
    }
}
