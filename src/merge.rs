//! Merge-on-write semantics for canonical records. Everything here is pure:
//! the store applies these functions inside its atomic upsert so concurrent
//! resolutions of the same real-world item converge instead of clobbering.

use crate::model::{Collectable, ImageRef, SourceRef};
use serde_json::Value;
use std::collections::HashSet;

/// Recursive deep merge for identifier documents: nested objects merge
/// recursively, arrays union (deduplicated, first occurrence order), and
/// scalars are overwritten by the incoming value.
pub fn deep_merge(existing: &mut Value, incoming: &Value) {
    match (existing, incoming) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(k) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        dst.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (Value::Array(dst), Value::Array(src)) => {
            for v in src {
                if !dst.contains(v) {
                    dst.push(v.clone());
                }
            }
        }
        (dst, src) => {
            *dst = src.clone();
        }
    }
}

/// Concatenate then dedupe by best-available URL (large > medium > small),
/// preserving the first occurrence. Images without any URL are dropped.
pub fn merge_images(existing: &mut Vec<ImageRef>, incoming: &[ImageRef]) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<ImageRef> = Vec::with_capacity(existing.len() + incoming.len());
    for img in existing.iter().chain(incoming.iter()) {
        let Some(url) = img.best_url() else {
            continue;
        };
        if seen.insert(url.to_string()) {
            out.push(img.clone());
        }
    }
    *existing = out;
}

/// Dedupe by `(provider, source_id)`, keeping the most recent entry per key.
/// Order follows the first occurrence of each key.
pub fn merge_sources(existing: &mut Vec<SourceRef>, incoming: &[SourceRef]) {
    let mut out: Vec<SourceRef> = Vec::with_capacity(existing.len() + incoming.len());
    for src in existing.iter().chain(incoming.iter()) {
        match out
            .iter_mut()
            .find(|s| s.provider == src.provider && s.source_id == src.source_id)
        {
            Some(slot) => {
                if src.fetched_at >= slot.fetched_at {
                    *slot = src.clone();
                }
            }
            None => out.push(src.clone()),
        }
    }
    *existing = out;
}

fn union_strings(existing: &mut Vec<String>, incoming: &[String]) {
    for v in incoming {
        if !v.is_empty() && !existing.iter().any(|e| e.eq_ignore_ascii_case(v)) {
            existing.push(v.clone());
        }
    }
}

fn fill_string(slot: &mut Option<String>, incoming: &Option<String>) {
    if slot.as_deref().map(str::is_empty).unwrap_or(true) {
        if let Some(v) = incoming {
            if !v.is_empty() {
                *slot = Some(v.clone());
            }
        }
    }
}

/// Merge an incoming canonical-shaped candidate into an existing record.
///
/// Fields are added or merged, never destructively overwritten:
/// - scalars fill empty slots only (description prefers the longer text);
/// - `identifiers` deep-merge; images/sources dedupe by key;
/// - `fingerprint` is set-on-insert and never touched here;
/// - `lightweight_fingerprint` is adopted only when missing.
pub fn merge_collectable(existing: &mut Collectable, incoming: &Collectable) {
    fill_string(&mut existing.subtitle, &incoming.subtitle);
    fill_string(&mut existing.primary_creator, &incoming.primary_creator);
    if existing.year.is_none() {
        existing.year = incoming.year;
    }
    // Longer descriptions tend to be the richer provider's; keep the best one.
    let existing_len = existing.description.as_deref().map(str::len).unwrap_or(0);
    let incoming_len = incoming.description.as_deref().map(str::len).unwrap_or(0);
    if incoming_len > existing_len {
        existing.description = incoming.description.clone();
    }

    union_strings(&mut existing.creators, &incoming.creators);
    union_strings(&mut existing.tags, &incoming.tags);
    union_strings(&mut existing.genre, &incoming.genre);

    let mut identifiers = Value::Object(std::mem::take(&mut existing.identifiers));
    deep_merge(&mut identifiers, &Value::Object(incoming.identifiers.clone()));
    if let Value::Object(map) = identifiers {
        existing.identifiers = map;
    }

    merge_images(&mut existing.images, &incoming.images);
    merge_sources(&mut existing.sources, &incoming.sources);

    let mut physical = Value::Object(std::mem::take(&mut existing.physical));
    deep_merge(&mut physical, &Value::Object(incoming.physical.clone()));
    if let Value::Object(map) = physical {
        existing.physical = map;
    }
    let mut extras = Value::Object(std::mem::take(&mut existing.extras));
    deep_merge(&mut extras, &Value::Object(incoming.extras.clone()));
    if let Value::Object(map) = extras {
        existing.extras = map;
    }
    for edition in &incoming.editions {
        if !existing.editions.contains(edition) {
            existing.editions.push(edition.clone());
        }
    }

    if existing.lightweight_fingerprint.is_none() {
        existing.lightweight_fingerprint = incoming.lightweight_fingerprint.clone();
    }
    for fp in &incoming.fuzzy_fingerprints {
        if !existing.has_fuzzy_fingerprint(&fp.value) {
            existing.fuzzy_fingerprints.push(fp.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaType;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn image(kind: &str, large: Option<&str>, medium: Option<&str>) -> ImageRef {
        ImageRef {
            kind: kind.into(),
            url_small: None,
            url_medium: medium.map(Into::into),
            url_large: large.map(Into::into),
            provider: "test".into(),
        }
    }

    fn source(provider: &str, id: &str, ts: i64) -> SourceRef {
        SourceRef {
            provider: provider.into(),
            source_id: id.into(),
            url: None,
            fetched_at: Utc.timestamp_opt(ts, 0).unwrap(),
            score: None,
            confidence: None,
        }
    }

    #[test]
    fn deep_merge_unions_arrays_without_loss() {
        let mut existing = json!({"openlibrary": {"isbn13": ["111", "222"]}});
        let incoming = json!({"openlibrary": {"isbn13": ["111"], "work": ["OL1W"]}});
        deep_merge(&mut existing, &incoming);
        assert_eq!(
            existing,
            json!({"openlibrary": {"isbn13": ["111", "222"], "work": ["OL1W"]}})
        );
    }

    #[test]
    fn deep_merge_overwrites_scalars_and_recurses() {
        let mut existing = json!({"igdb": {"gameId": "1", "nested": {"a": 1}}});
        let incoming = json!({"igdb": {"gameId": "2", "nested": {"b": 2}}});
        deep_merge(&mut existing, &incoming);
        assert_eq!(
            existing,
            json!({"igdb": {"gameId": "2", "nested": {"a": 1, "b": 2}}})
        );
    }

    #[test]
    fn images_dedupe_by_best_url_first_wins() {
        let mut existing = vec![image("cover", Some("L1"), Some("M1"))];
        let incoming = vec![
            image("poster", Some("L1"), None), // same best url, dropped
            image("cover", None, Some("M2")),
        ];
        merge_images(&mut existing, &incoming);
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[0].kind, "cover");
        assert_eq!(existing[1].best_url(), Some("M2"));
    }

    #[test]
    fn sources_keep_most_recent_per_key() {
        let mut existing = vec![source("tmdb", "42", 100), source("igdb", "7", 50)];
        let incoming = vec![source("tmdb", "42", 200)];
        merge_sources(&mut existing, &incoming);
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[0].fetched_at.timestamp(), 200);
    }

    #[test]
    fn collectable_merge_is_add_only() {
        let mut a = Collectable::new(MediaType::Book, "Dune");
        a.fingerprint = Some("strong-a".into());
        a.description = Some("Short.".into());
        a.add_identifier("openlibrary", "isbn13", "111");
        a.add_identifier("openlibrary", "isbn13", "222");

        let mut b = Collectable::new(MediaType::Book, "Dune");
        b.fingerprint = Some("strong-b".into());
        b.description = Some("A much longer synopsis of the novel.".into());
        b.lightweight_fingerprint = Some("lw".into());
        b.add_identifier("openlibrary", "isbn13", "111");

        merge_collectable(&mut a, &b);
        assert_eq!(a.identifier_values("isbn13"), vec!["111", "222"]);
        // fingerprint is set-on-insert; merge never touches it
        assert_eq!(a.fingerprint.as_deref(), Some("strong-a"));
        assert_eq!(a.lightweight_fingerprint.as_deref(), Some("lw"));
        assert!(a.description.unwrap().starts_with("A much longer"));
    }
}
