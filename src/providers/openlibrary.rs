//! OpenLibrary adapter for the book domain. ISBN candidates are tried first
//! (each independently retried), then a title+author full-text search scored
//! by a weighted heuristic.

use super::{
    Enrichment, FetchError, ProviderAdapter, ProviderEntity, ProviderHit, RetryPolicy, retry_fetch,
};
use crate::config::PipelineConfig;
use crate::fingerprint::{normalize, strong_fingerprint, FingerprintParts};
use crate::model::{Collectable, ExtractedItem, ImageRef, MediaType, ShelfType, SourceRef};
use crate::util::env::env_opt;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

const OPENLIBRARY_BASE: &str = "https://openlibrary.org";
const COVER_BASE: &str = "https://covers.openlibrary.org/b/id";
const PROVIDER_NAME: &str = "openlibrary";
const SEARCH_LIMIT: usize = 10;
const SUPPORTED: &[ShelfType] = &[ShelfType::Books, ShelfType::Comics];

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(1[5-9]\d{2}|20\d{2})\b").expect("static regex"))
}

/// One search doc (or a normalized ISBN edition) from OpenLibrary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookEntity {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub author_name: Vec<String>,
    #[serde(default)]
    pub first_publish_year: Option<i32>,
    #[serde(default)]
    pub edition_count: Option<i64>,
    #[serde(default)]
    pub has_fulltext: Option<bool>,
    #[serde(default)]
    pub isbn: Vec<String>,
    #[serde(default)]
    pub cover_i: Option<i64>,
    #[serde(default)]
    pub publisher: Vec<String>,
    #[serde(default)]
    pub subject: Vec<String>,
    #[serde(default)]
    pub number_of_pages_median: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    docs: Vec<BookEntity>,
}

/// Raw `/isbn/{isbn}.json` edition payload; normalized into `BookEntity`.
#[derive(Debug, Deserialize)]
struct IsbnEdition {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    publish_date: Option<String>,
    #[serde(default)]
    publishers: Vec<String>,
    #[serde(default)]
    covers: Vec<i64>,
    #[serde(default)]
    isbn_13: Vec<String>,
    #[serde(default)]
    isbn_10: Vec<String>,
    #[serde(default)]
    number_of_pages: Option<i64>,
}

impl IsbnEdition {
    fn into_entity(self) -> BookEntity {
        let year = self
            .publish_date
            .as_deref()
            .and_then(|d| year_re().find(d))
            .and_then(|m| m.as_str().parse::<i32>().ok());
        let mut isbn: Vec<String> = self.isbn_13;
        isbn.extend(self.isbn_10);
        BookEntity {
            key: self.key,
            title: self.title,
            subtitle: self.subtitle,
            first_publish_year: year,
            isbn,
            cover_i: self.covers.into_iter().find(|&c| c > 0),
            publisher: self.publishers,
            number_of_pages_median: self.number_of_pages,
            ..Default::default()
        }
    }
}

/// Weighted best-match score for a search doc against the extracted item.
pub fn score_doc(doc: &BookEntity, title: &str, author: Option<&str>) -> f64 {
    let mut score = 0.0;
    let want_title = normalize(title);
    if let Some(doc_title) = doc.title.as_deref() {
        let got = normalize(doc_title);
        if got == want_title {
            score += 50.0;
        } else if got.contains(&want_title) || want_title.contains(&got) {
            score += 25.0;
        }
    }
    if let Some(author) = author {
        let want = normalize(author);
        if doc.author_name.iter().any(|a| normalize(a) == want) {
            score += 30.0;
        }
    }
    // widely-published works are likelier to be the one on the shelf
    score += (doc.edition_count.unwrap_or(0).min(50) as f64) * 0.5;
    if doc.has_fulltext.unwrap_or(false) {
        score += 10.0;
    }
    if !doc.isbn.is_empty() {
        score += 5.0;
    }
    score
}

/// ISBN candidates in lookup order: isbn13 first, then isbn10, then the
/// unqualified kind some extractors emit.
pub fn isbn_candidates(item: &ExtractedItem) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for kind in ["isbn13", "isbn10", "isbn"] {
        for v in item.identifier_values(kind) {
            let digits: String = v.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            if (digits.len() == 13 || digits.len() == 10) && !out.contains(&digits) {
                out.push(digits);
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct OpenLibraryConfig {
    pub base_url: String,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub second_pass: bool,
}

impl OpenLibraryConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Self {
        Self {
            base_url: env_opt("OPENLIBRARY_BASE_URL")
                .unwrap_or_else(|| OPENLIBRARY_BASE.to_string()),
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff_ms: cfg.backoff_ms,
            },
            timeout: Duration::from_millis(cfg.request_timeout_ms),
            second_pass: cfg.ai.enabled,
        }
    }
}

pub struct OpenLibraryAdapter {
    cfg: OpenLibraryConfig,
    http: Client,
}

impl OpenLibraryAdapter {
    pub fn new(cfg: OpenLibraryConfig) -> Result<Self> {
        let user_agent = env_opt("SHELFSCAN_USER_AGENT")
            .unwrap_or_else(|| "shelfscan-resolver/0.1".to_string());
        let http = Client::builder()
            .user_agent(user_agent)
            .build()
            .context("failed to construct OpenLibrary HTTP client")?;
        Ok(Self { cfg, http })
    }

    pub fn from_env(cfg: &PipelineConfig) -> Result<Self> {
        Self::new(OpenLibraryConfig::from_pipeline(cfg))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self
            .http
            .get(url)
            .timeout(self.cfg.timeout)
            .send()
            .await
            .map_err(FetchError::from)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status, body));
        }
        let text = response.text().await.map_err(FetchError::from)?;
        serde_json::from_str(&text).map_err(FetchError::Payload)
    }

    /// `/isbn/{isbn}.json` — the short-circuit path. 404 means "try the next
    /// candidate", not failure.
    async fn fetch_isbn(&self, isbn: &str) -> Result<Option<BookEntity>, FetchError> {
        let url = format!("{}/isbn/{}.json", self.cfg.base_url, isbn);
        let url = url.as_str();
        let edition = retry_fetch(self.cfg.retry, |_| async move {
            self.get_json::<IsbnEdition>(url).await
        })
        .await?;
        Ok(edition.map(|e| {
            let mut entity = e.into_entity();
            if !entity.isbn.iter().any(|i| i == isbn) {
                entity.isbn.push(isbn.to_string());
            }
            entity
        }))
    }

    async fn search(
        &self,
        title: &str,
        author: Option<&str>,
    ) -> Result<Option<Vec<BookEntity>>, FetchError> {
        let mut url = format!(
            "{}/search.json?title={}&limit={}",
            self.cfg.base_url,
            urlencoding::encode(title),
            SEARCH_LIMIT
        );
        if let Some(author) = author {
            url.push_str(&format!("&author={}", urlencoding::encode(author)));
        }
        let url = url.as_str();
        let response = retry_fetch(self.cfg.retry, |_| async move {
            self.get_json::<SearchResponse>(url).await
        })
        .await?;
        Ok(response.map(|r| r.docs))
    }
}

#[async_trait]
impl ProviderAdapter for OpenLibraryAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn supported_shelves(&self) -> &'static [ShelfType] {
        SUPPORTED
    }

    fn second_pass_enabled(&self) -> bool {
        self.cfg.second_pass
    }

    async fn safe_lookup(&self, item: &ExtractedItem) -> Option<Enrichment> {
        // ISBN short-circuit before any title search.
        for isbn in isbn_candidates(item) {
            match self.fetch_isbn(&isbn).await {
                Ok(Some(entity)) => {
                    debug!(title = %item.title, isbn = %isbn, "resolved via isbn lookup");
                    return Some(Enrichment::Provider(ProviderHit {
                        provider: PROVIDER_NAME,
                        score: 100.0,
                        entity: ProviderEntity::Book(entity),
                        query: Some(format!("isbn:{isbn}")),
                    }));
                }
                Ok(None) => {
                    debug!(isbn = %isbn, "isbn not known to openlibrary");
                }
                Err(err) => {
                    warn!(isbn = %isbn, error = %err, "isbn lookup failed, trying next candidate");
                }
            }
        }

        let author = item.creator.as_deref();
        let docs = match self.search(&item.title, author).await {
            Ok(Some(docs)) => docs,
            Ok(None) => return None,
            Err(err) => {
                warn!(title = %item.title, error = %err, "openlibrary search failed");
                return None;
            }
        };
        let best = docs
            .into_iter()
            .map(|doc| {
                let score = score_doc(&doc, &item.title, author);
                (score, doc)
            })
            .filter(|(score, _)| *score >= 25.0)
            .max_by(|a, b| a.0.total_cmp(&b.0))?;
        debug!(title = %item.title, score = best.0, "resolved via openlibrary search");
        Some(Enrichment::Provider(ProviderHit {
            provider: PROVIDER_NAME,
            score: best.0,
            entity: ProviderEntity::Book(best.1),
            query: Some(item.title.clone()),
        }))
    }

    fn build_collectable(
        &self,
        enrichment: &Enrichment,
        item: &ExtractedItem,
        lightweight_fingerprint: Option<&str>,
    ) -> Option<Collectable> {
        let Enrichment::Provider(hit) = enrichment else {
            return None;
        };
        let ProviderEntity::Book(entity) = &hit.entity else {
            return None;
        };

        let title = entity
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| item.title.clone());
        let mut c = Collectable::new(MediaType::Book, title);
        c.subtitle = entity.subtitle.clone();
        c.primary_creator = entity
            .author_name
            .first()
            .cloned()
            .or_else(|| item.creator.clone());
        c.creators = entity.author_name.clone();
        c.year = entity.first_publish_year.or(item.year);
        c.genre = entity.subject.iter().take(8).cloned().collect();

        let source_id = entity
            .key
            .clone()
            .or_else(|| entity.isbn.first().cloned())
            .unwrap_or_default();
        if let Some(key) = &entity.key {
            let kind = if key.contains("/works/") { "work" } else { "editionId" };
            c.add_identifier(PROVIDER_NAME, kind, key.trim_start_matches("/works/").trim_start_matches("/books/"));
        }
        for isbn in &entity.isbn {
            let kind = if isbn.len() == 13 { "isbn13" } else { "isbn10" };
            c.add_identifier(PROVIDER_NAME, kind, isbn);
        }
        if let Some(cover) = entity.cover_i {
            c.images.push(ImageRef {
                kind: "cover".into(),
                url_small: Some(format!("{COVER_BASE}/{cover}-S.jpg")),
                url_medium: Some(format!("{COVER_BASE}/{cover}-M.jpg")),
                url_large: Some(format!("{COVER_BASE}/{cover}-L.jpg")),
                provider: PROVIDER_NAME.into(),
            });
        }
        if let Some(pages) = entity.number_of_pages_median {
            c.physical
                .insert("pages".into(), serde_json::json!(pages));
        }
        if let Some(publisher) = entity.publisher.first() {
            c.extras
                .insert("publisher".into(), serde_json::json!(publisher));
        }
        c.sources.push(SourceRef {
            provider: PROVIDER_NAME.into(),
            source_id: source_id.clone(),
            url: entity
                .key
                .as_ref()
                .map(|k| format!("{}{}", OPENLIBRARY_BASE, k)),
            fetched_at: Utc::now(),
            score: Some(hit.score),
            confidence: None,
        });

        c.lightweight_fingerprint = lightweight_fingerprint.map(Into::into);
        let creator = c.primary_creator.clone();
        c.fingerprint = Some(strong_fingerprint(&FingerprintParts {
            title: Some(&c.title),
            creator: creator.as_deref(),
            year: c.year,
            media_type: Some(MediaType::Book),
            ..Default::default()
        }));
        Some(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// Local HTTP stub with fixed routes; every request path is recorded so
    /// tests can assert which endpoints were hit, in order.
    async fn spawn_stub(routes: Vec<(String, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let paths = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                let paths = Arc::clone(&paths);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut tmp = [0u8; 1024];
                    loop {
                        let Ok(n) = socket.read(&mut tmp).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&tmp[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf).into_owned();
                    let path = request
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or_default()
                        .to_string();
                    paths.lock().await.push(path.clone());
                    let response = match routes.iter().find(|(p, _)| *p == path) {
                        Some((_, body)) => format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                            body.len()
                        ),
                        None => "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                            .to_string(),
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn isbn_lookup_short_circuits_the_title_search() {
        let edition = serde_json::json!({
            "key": "/books/OL123M",
            "title": "Dune",
            "publish_date": "1965",
            "publishers": ["Chilton"],
            "covers": [42],
            "isbn_13": ["9780441013593"]
        })
        .to_string();
        let (base_url, seen) =
            spawn_stub(vec![("/isbn/9780441013593.json".to_string(), edition)]).await;

        let adapter = OpenLibraryAdapter::new(OpenLibraryConfig {
            base_url,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(5),
            second_pass: false,
        })
        .unwrap();

        let mut identifiers = BTreeMap::new();
        identifiers.insert("isbn13".to_string(), vec!["978-0-441-01359-3".to_string()]);
        // a garbled spine reading that a title search would never match
        let item = ExtractedItem {
            title: "Dvne Chronlcles".into(),
            identifiers,
            ..Default::default()
        };

        let enrichment = adapter.safe_lookup(&item).await.unwrap();
        let Enrichment::Provider(hit) = enrichment else {
            panic!("expected a provider hit");
        };
        assert_eq!(hit.query.as_deref(), Some("isbn:9780441013593"));
        assert_eq!(hit.score, 100.0);
        let ProviderEntity::Book(entity) = hit.entity else {
            panic!("expected a book entity");
        };
        assert_eq!(entity.title.as_deref(), Some("Dune"));
        assert_eq!(entity.first_publish_year, Some(1965));

        // exactly one request, and it was the isbn endpoint
        let seen = seen.lock().await;
        assert_eq!(seen.as_slice(), ["/isbn/9780441013593.json"]);
    }

    fn doc(title: &str, authors: &[&str], editions: i64) -> BookEntity {
        BookEntity {
            title: Some(title.into()),
            author_name: authors.iter().map(|s| s.to_string()).collect(),
            edition_count: Some(editions),
            ..Default::default()
        }
    }

    #[test]
    fn exact_title_and_author_beats_popular_substring() {
        let exact = doc("Dune", &["Frank Herbert"], 5);
        let popular = doc("Dune Messiah", &["Frank Herbert"], 50);
        let s_exact = score_doc(&exact, "Dune", Some("Frank Herbert"));
        let s_popular = score_doc(&popular, "Dune", Some("Frank Herbert"));
        assert!(s_exact > s_popular, "{s_exact} vs {s_popular}");
    }

    #[test]
    fn isbn_candidates_prefer_isbn13_and_strip_separators() {
        let mut identifiers = BTreeMap::new();
        identifiers.insert("isbn10".to_string(), vec!["0-441-01359-7".to_string()]);
        identifiers.insert(
            "isbn13".to_string(),
            vec!["978-0-441-01359-3".to_string(), "9780441013593".to_string()],
        );
        let item = ExtractedItem {
            title: "Dune".into(),
            identifiers,
            ..Default::default()
        };
        assert_eq!(
            isbn_candidates(&item),
            vec!["9780441013593", "0441013597"]
        );
    }

    #[test]
    fn edition_year_parsed_from_free_text_date() {
        let edition = IsbnEdition {
            key: Some("/books/OL123M".into()),
            title: Some("Dune".into()),
            subtitle: None,
            publish_date: Some("August 2, 1965".into()),
            publishers: vec!["Chilton".into()],
            covers: vec![42],
            isbn_13: vec!["9780441013593".into()],
            isbn_10: vec![],
            number_of_pages: Some(412),
        };
        let entity = edition.into_entity();
        assert_eq!(entity.first_publish_year, Some(1965));
        assert_eq!(entity.cover_i, Some(42));
    }

    #[test]
    fn build_collectable_attaches_fingerprints_and_identifiers() {
        let adapter = OpenLibraryAdapter::new(OpenLibraryConfig {
            base_url: OPENLIBRARY_BASE.into(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(5),
            second_pass: false,
        })
        .unwrap();

        let mut entity = doc("Dune", &["Frank Herbert"], 30);
        entity.key = Some("/works/OL893415W".into());
        entity.isbn = vec!["9780441013593".into()];
        entity.first_publish_year = Some(1965);
        entity.cover_i = Some(7);

        let item = ExtractedItem {
            title: "Dune".into(),
            ..Default::default()
        };
        let hit = Enrichment::Provider(ProviderHit {
            provider: PROVIDER_NAME,
            score: 85.0,
            entity: ProviderEntity::Book(entity),
            query: None,
        });
        let c = adapter.build_collectable(&hit, &item, Some("lw-fp")).unwrap();
        assert_eq!(c.media_type, MediaType::Book);
        assert_eq!(c.identifier_values("isbn13"), vec!["9780441013593"]);
        assert_eq!(c.identifier_values("work"), vec!["OL893415W"]);
        assert_eq!(c.lightweight_fingerprint.as_deref(), Some("lw-fp"));
        assert!(c.fingerprint.is_some());
        assert_eq!(c.images.len(), 1);
        assert_eq!(c.sources[0].provider, PROVIDER_NAME);
    }

    #[test]
    fn ai_enrichment_is_not_this_adapters_to_build() {
        let adapter = OpenLibraryAdapter::new(OpenLibraryConfig {
            base_url: OPENLIBRARY_BASE.into(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(5),
            second_pass: false,
        })
        .unwrap();
        let item = ExtractedItem {
            title: "Dune".into(),
            ..Default::default()
        };
        let ai = Enrichment::Ai(super::super::AiHit {
            collectable: Collectable::new(MediaType::Book, "Dune"),
            confidence: 0.9,
        });
        assert!(adapter.build_collectable(&ai, &item, None).is_none());
    }
}
