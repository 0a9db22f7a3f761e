//! AI second pass: still-unresolved items go to a language model in one
//! batched request for OCR correction and metadata research. Responses are
//! keyed by an explicit input id so the mapping back survives dropped or
//! reordered entries, and parsing is defensive because models sometimes wrap
//! JSON in prose.

use crate::config::AiConfig;
use crate::fingerprint::{
    lightweight_fingerprint, normalize, normalize_creator, strong_fingerprint, FingerprintParts,
};
use crate::model::{Collectable, ExtractedItem, MediaType, SourceRef};
use crate::providers::AiHit;
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use indexmap::IndexMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const AI_SOURCE: &str = "ai_second_pass";

/// Batch plan: one representative per duplicate key, capped; overflow and
/// duplicate indices recorded so answers fan back out.
#[derive(Debug, Default)]
pub struct BatchPlan {
    /// input id -> (representative item, all original indices sharing it)
    pub entries: IndexMap<String, (ExtractedItem, Vec<usize>)>,
    /// indices that did not fit the cap; they stay unresolved
    pub overflow: Vec<usize>,
}

/// Deduplicate by normalized title+creator and cap the batch. Later
/// duplicates of an in-batch item still receive its answer.
pub fn plan_batch(unresolved: &[(usize, ExtractedItem)], cap: usize) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let mut keys: BTreeMap<String, String> = BTreeMap::new();
    for (index, item) in unresolved {
        let key = format!(
            "{}|{}",
            normalize(&item.title),
            item.creator.as_deref().map(normalize_creator).unwrap_or_default()
        );
        if let Some(input_id) = keys.get(&key) {
            if let Some((_, indices)) = plan.entries.get_mut(input_id) {
                indices.push(*index);
                continue;
            }
        }
        if plan.entries.len() >= cap {
            plan.overflow.push(*index);
            continue;
        }
        let input_id = format!("item-{index}");
        keys.insert(key, input_id.clone());
        plan.entries.insert(input_id, (item.clone(), vec![*index]));
    }
    plan
}

#[derive(Debug, Deserialize)]
struct AiResponse {
    #[serde(default)]
    items: Vec<AiItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiItem {
    #[serde(rename = "inputId")]
    pub input_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub identifiers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Best-effort recovery when the model wraps its JSON in prose or fencing:
/// take the slice from the first `{` to the last `}`.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_items(content: &str) -> Option<Vec<AiItem>> {
    if let Ok(response) = serde_json::from_str::<AiResponse>(content) {
        return Some(response.items);
    }
    let block = extract_json_block(content)?;
    match serde_json::from_str::<AiResponse>(block) {
        Ok(response) => {
            debug!("ai payload recovered via free-text json extraction");
            Some(response.items)
        }
        Err(err) => {
            warn!(error = %err, "ai payload failed schema parse and fallback extraction");
            None
        }
    }
}

/// Normalize one model answer into the canonical shape. The confidence rides
/// in the source provenance for the learner and for display.
pub fn collectable_from_ai(
    item: &ExtractedItem,
    ai: &AiItem,
    media_type: MediaType,
) -> Option<Collectable> {
    let title = ai
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| item.title.clone());
    if ai.confidence <= 0.0 {
        return None;
    }
    let mut c = Collectable::new(media_type, title);
    c.primary_creator = ai.creator.clone().or_else(|| item.creator.clone());
    c.year = ai.year.or(item.year);
    c.description = ai.description.clone();
    if let Some(publisher) = &ai.publisher {
        c.extras
            .insert("publisher".into(), serde_json::json!(publisher));
    }
    for (kind, values) in &ai.identifiers {
        for value in values {
            c.add_identifier(AI_SOURCE, kind, value);
        }
    }
    c.sources.push(SourceRef {
        provider: AI_SOURCE.into(),
        source_id: ai.input_id.clone(),
        url: None,
        fetched_at: Utc::now(),
        score: None,
        confidence: Some(ai.confidence),
    });

    let creator = c.primary_creator.clone();
    let parts = FingerprintParts {
        title: Some(&c.title),
        creator: creator.as_deref(),
        year: c.year,
        media_type: Some(media_type),
        ..Default::default()
    };
    c.fingerprint = Some(strong_fingerprint(&parts));
    c.lightweight_fingerprint = Some(lightweight_fingerprint(&parts));
    // The raw OCR string is NOT hashed here. Fuzzy fingerprints go through
    // the learner, which enforces the confidence threshold and the
    // creator-match guard after the upsert settles on a canonical record.
    Some(c)
}

fn response_schema() -> Value {
    json!({
        "name": "enriched_items",
        "strict": true,
        "schema": {
            "type": "object",
            "additionalProperties": false,
            "required": ["items"],
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["inputId", "title", "confidence"],
                        "properties": {
                            "inputId": { "type": "string" },
                            "title": { "type": "string" },
                            "creator": { "type": ["string", "null"] },
                            "publisher": { "type": ["string", "null"] },
                            "year": { "type": ["integer", "null"] },
                            "description": { "type": ["string", "null"] },
                            "identifiers": {
                                "type": "object",
                                "additionalProperties": {
                                    "type": "array",
                                    "items": { "type": "string" }
                                }
                            },
                            "confidence": { "type": "number" }
                        }
                    }
                }
            }
        }
    })
}

pub struct AiEnricher {
    cfg: AiConfig,
    http: Client,
}

impl AiEnricher {
    pub fn new(cfg: AiConfig) -> Result<Self> {
        if cfg.api_key.is_none() {
            return Err(anyhow!("ai second pass enabled but no api key configured"));
        }
        let http = Client::builder()
            .build()
            .context("failed to construct AI HTTP client")?;
        Ok(Self { cfg, http })
    }

    /// Enrich a batch of unresolved items. Returns `(original index, hit)`
    /// pairs; anything absent stays unresolved. Never errors the batch — a
    /// failed request just enriches nothing.
    pub async fn enrich(
        &self,
        unresolved: &[(usize, ExtractedItem)],
        media_type: MediaType,
    ) -> Vec<(usize, AiHit)> {
        if unresolved.is_empty() {
            return Vec::new();
        }
        let plan = plan_batch(unresolved, self.cfg.batch_cap);
        if !plan.overflow.is_empty() {
            info!(
                overflow = plan.overflow.len(),
                cap = self.cfg.batch_cap,
                "ai batch cap exceeded, overflow items stay unresolved"
            );
        }
        let items = match self.request(&plan, media_type).await {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "ai enrichment request failed, batch stays unresolved");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for ai in items {
            let Some((item, indices)) = plan.entries.get(&ai.input_id) else {
                warn!(input_id = %ai.input_id, "ai answer references unknown input id");
                continue;
            };
            let Some(collectable) = collectable_from_ai(item, &ai, media_type) else {
                debug!(input_id = %ai.input_id, "ai could not confirm item");
                continue;
            };
            for &index in indices {
                out.push((
                    index,
                    AiHit {
                        collectable: collectable.clone(),
                        confidence: ai.confidence,
                    },
                ));
            }
        }
        out
    }

    async fn request(&self, plan: &BatchPlan, media_type: MediaType) -> Result<Vec<AiItem>> {
        let batch: Vec<Value> = plan
            .entries
            .iter()
            .map(|(input_id, (item, _))| {
                json!({
                    "inputId": input_id,
                    "title": item.title,
                    "creator": item.creator,
                    "publisher": item.publisher,
                    "year": item.year,
                    "notes": item.position,
                    "identifiers": item.identifiers,
                })
            })
            .collect();
        let api_key = self
            .cfg
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("ai api key missing"))?;

        let body = json!({
            "model": self.cfg.model,
            "messages": [
                {
                    "role": "system",
                    "content": format!(
                        "You identify physical {} items from noisy OCR text. For each input, \
                         correct the title, fill in creator, publisher, year and known \
                         identifiers, and report a confidence between 0 and 1. If you cannot \
                         confidently identify an item, omit it from the response.",
                        media_type.as_str()
                    )
                },
                {
                    "role": "user",
                    "content": serde_json::to_string(&json!({ "items": batch }))?
                }
            ],
            "response_format": { "type": "json_schema", "json_schema": response_schema() }
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.cfg.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("ai enrichment request")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("ai request failed (status={status}): {text}"));
        }
        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();
        parse_items(content).ok_or_else(|| anyhow!("ai response did not contain parseable items"))
    }
}
