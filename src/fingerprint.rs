//! Fingerprint engine: deterministic identity hashes at three strengths.
//!
//! All three variants digest a pipe-joined normalized string with SHA-256.
//! They are derived values, never authoritative: the same semantic inputs
//! must always produce byte-identical hashes, so multi-valued inputs are
//! deduplicated and sorted before joining and omitted components are simply
//! absent rather than zero-filled.

use crate::model::{ExtractedItem, MediaType};
use sha2::{Digest, Sha256};

/// Semantic inputs for the strong and lightweight fingerprints.
#[derive(Debug, Clone, Default)]
pub struct FingerprintParts<'a> {
    pub title: Option<&'a str>,
    pub creator: Option<&'a str>,
    pub year: Option<i32>,
    pub media_type: Option<MediaType>,
    pub platforms: &'a [String],
    pub formats: &'a [String],
    /// An already-authoritative provider key (e.g. `igdb:123`). When present
    /// the strong hash is computed over this key alone.
    pub unique_key: Option<&'a str>,
}

impl<'a> FingerprintParts<'a> {
    pub fn from_item(item: &'a ExtractedItem, media_type: MediaType) -> Self {
        Self {
            title: Some(item.title.as_str()),
            creator: item.creator.as_deref(),
            year: item.year,
            media_type: Some(media_type),
            platforms: &item.platforms,
            formats: &[],
            unique_key: None,
        }
    }
}

/// Trim, lowercase, and fold internal whitespace runs to single spaces.
pub fn normalize(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fuzzy normalization: additionally strips diacritics and collapses
/// non-alphanumerics to single spaces. Tolerant of OCR noise.
pub fn normalize_fuzzy(raw: &str) -> String {
    let folded: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(fold_diacritic)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized creator used for case-insensitive creator comparison.
pub fn normalize_creator(raw: &str) -> String {
    normalize_fuzzy(raw)
}

// Latin diacritic folding for the common cases OCR trips over. Anything not
// listed passes through unchanged; the hash does not need full Unicode
// normalization, only stability.
fn fold_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => 'i',
        'ł' => 'l',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
        'ŕ' | 'ř' => 'r',
        'ś' | 'š' | 'ş' => 's',
        'ť' | 'ţ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        'æ' => 'a',
        'œ' => 'o',
        'ß' => 's',
        _ => c,
    }
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let out = hasher.finalize();
    out.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Flatten, normalize, dedupe, and sort a multi-valued component so input
/// order never affects the hash. Empty after normalization -> None.
fn multi_component(values: &[String]) -> Option<String> {
    let mut parts: Vec<String> = values
        .iter()
        .map(|v| normalize(v))
        .filter(|v| !v.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    parts.sort();
    parts.dedup();
    Some(parts.join(","))
}

fn scalar_component(value: Option<&str>) -> Option<String> {
    value.map(normalize).filter(|v| !v.is_empty())
}

/// Strong fingerprint: `title|creator|year|mediaType|platform|format`, or the
/// normalized `unique_key` alone when a provider ID is already authoritative.
pub fn strong_fingerprint(parts: &FingerprintParts<'_>) -> String {
    if let Some(key) = scalar_component(parts.unique_key) {
        return digest(&key);
    }
    let mut components: Vec<String> = Vec::new();
    if let Some(t) = scalar_component(parts.title) {
        components.push(t);
    }
    if let Some(c) = scalar_component(parts.creator) {
        components.push(c);
    }
    if let Some(y) = parts.year {
        components.push(y.to_string());
    }
    if let Some(m) = parts.media_type {
        components.push(m.as_str().to_string());
    }
    if let Some(p) = multi_component(parts.platforms) {
        components.push(p);
    }
    if let Some(f) = multi_component(parts.formats) {
        components.push(f);
    }
    digest(&components.join("|"))
}

/// Lightweight fingerprint: the strong hash without the year component. A
/// coarser dedup key usable before full metadata is known.
pub fn lightweight_fingerprint(parts: &FingerprintParts<'_>) -> String {
    let without_year = FingerprintParts {
        year: None,
        ..parts.clone()
    };
    strong_fingerprint(&without_year)
}

/// Fuzzy-OCR fingerprint over diacritic-stripped `title|creator[|mediaType]`.
/// Returns None when either title or creator is empty: a fuzzy hash without a
/// creator would collide on generic titles.
pub fn fuzzy_fingerprint(
    title: &str,
    creator: &str,
    media_type: Option<MediaType>,
) -> Option<String> {
    let title = normalize_fuzzy(title);
    let creator = normalize_fuzzy(creator);
    if title.is_empty() || creator.is_empty() {
        return None;
    }
    let mut joined = format!("{title}|{creator}");
    if let Some(m) = media_type {
        joined.push('|');
        joined.push_str(m.as_str());
    }
    Some(digest(&joined))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_is_deterministic_across_multi_value_order() {
        let a = FingerprintParts {
            title: Some("Outer Wilds"),
            creator: Some("Mobius Digital"),
            year: Some(2019),
            media_type: Some(MediaType::Game),
            platforms: &["PS4".to_string(), "Switch".to_string()],
            ..Default::default()
        };
        let b = FingerprintParts {
            platforms: &["Switch".to_string(), "ps4".to_string()],
            ..a.clone()
        };
        assert_eq!(strong_fingerprint(&a), strong_fingerprint(&b));
    }

    #[test]
    fn whitespace_and_case_do_not_matter() {
        let a = FingerprintParts {
            title: Some("  The   Left Hand of Darkness "),
            creator: Some("Ursula K. Le Guin"),
            ..Default::default()
        };
        let b = FingerprintParts {
            title: Some("the left hand of darkness"),
            creator: Some("URSULA K. LE GUIN"),
            ..Default::default()
        };
        assert_eq!(strong_fingerprint(&a), strong_fingerprint(&b));
    }

    #[test]
    fn lightweight_ignores_year_only() {
        let with_year = FingerprintParts {
            title: Some("Dune"),
            creator: Some("Frank Herbert"),
            year: Some(1965),
            media_type: Some(MediaType::Book),
            ..Default::default()
        };
        let without_year = FingerprintParts {
            year: None,
            ..with_year.clone()
        };
        assert_ne!(
            strong_fingerprint(&with_year),
            strong_fingerprint(&without_year)
        );
        assert_eq!(
            lightweight_fingerprint(&with_year),
            lightweight_fingerprint(&without_year)
        );
        assert_eq!(
            lightweight_fingerprint(&with_year),
            strong_fingerprint(&without_year)
        );
    }

    #[test]
    fn unique_key_overrides_all_components() {
        let a = FingerprintParts {
            title: Some("whatever"),
            unique_key: Some("igdb:123"),
            ..Default::default()
        };
        let b = FingerprintParts {
            title: Some("something else entirely"),
            year: Some(2001),
            unique_key: Some("IGDB:123"),
            ..Default::default()
        };
        assert_eq!(strong_fingerprint(&a), strong_fingerprint(&b));
    }

    #[test]
    fn fuzzy_strips_diacritics_and_punctuation() {
        let a = fuzzy_fingerprint("Amélie: The Film!", "Jean-Pierre Jeunet", None).unwrap();
        let b = fuzzy_fingerprint("amelie the film", "jean pierre jeunet", None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fuzzy_requires_title_and_creator() {
        assert!(fuzzy_fingerprint("Dune", "", None).is_none());
        assert!(fuzzy_fingerprint("   ", "Frank Herbert", None).is_none());
        assert!(fuzzy_fingerprint("Dune", "Frank Herbert", Some(MediaType::Book)).is_some());
    }

    #[test]
    fn media_type_changes_fuzzy_hash() {
        let plain = fuzzy_fingerprint("Dune", "Frank Herbert", None).unwrap();
        let typed = fuzzy_fingerprint("Dune", "Frank Herbert", Some(MediaType::Book)).unwrap();
        assert_ne!(plain, typed);
    }
}
