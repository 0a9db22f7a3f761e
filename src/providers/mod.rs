//! Provider adapters: one per media domain, all behind the same contract.
//! Failures never escape an adapter — a lookup either produces an enrichment
//! envelope or degrades to `Unresolved`.

pub mod igdb;
pub mod openlibrary;
pub mod tmdb;

use crate::model::{Collectable, ExtractedItem, ShelfType};
use crate::util::pool::bounded_map;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;

/// Error classes for external catalog calls, driving the retry policy.
#[derive(Debug)]
pub enum FetchError {
    /// HTTP 429; retried with exponential backoff.
    RateLimited,
    /// Request timeout or abort; retried with linear backoff.
    Timeout,
    /// HTTP 404; permanent, short-circuits to no result.
    NotFound,
    /// HTTP 401; token-based providers refresh once, others give up.
    Unauthorized,
    /// Any other non-success status.
    Status(StatusCode, String),
    /// Connection-level failure; retried like a timeout.
    Transport(reqwest::Error),
    /// Upstream payload did not parse.
    Payload(serde_json::Error),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::RateLimited => write!(f, "rate limited (429)"),
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::NotFound => write!(f, "not found (404)"),
            FetchError::Unauthorized => write!(f, "unauthorized (401)"),
            FetchError::Status(code, body) => write!(f, "http {code}: {body}"),
            FetchError::Transport(err) => write!(f, "transport error: {err}"),
            FetchError::Payload(err) => write!(f, "malformed payload: {err}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err)
        }
    }
}

impl FetchError {
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
            StatusCode::NOT_FOUND => FetchError::NotFound,
            StatusCode::UNAUTHORIZED => FetchError::Unauthorized,
            _ => FetchError::Status(status, body),
        }
    }
}

/// Retry budget plus backoff shape. 429 doubles the base per attempt;
/// timeouts and transport failures grow linearly.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt + 1`, or None when the error
    /// class is not retryable.
    pub fn backoff(&self, error: &FetchError, attempt: u32) -> Option<Duration> {
        let ms = match error {
            FetchError::RateLimited => self.backoff_ms.saturating_mul(1u64 << attempt.min(8)),
            FetchError::Timeout | FetchError::Transport(_) => {
                self.backoff_ms.saturating_mul(attempt as u64 + 1)
            }
            _ => return None,
        };
        Some(Duration::from_millis(ms))
    }
}

/// Drive `call` under the retry policy. 404 maps to `Ok(None)`; retryable
/// errors are re-attempted with backoff until the budget runs out; anything
/// else surfaces immediately.
pub async fn retry_fetch<T, F, Fut>(policy: RetryPolicy, mut call: F) -> Result<Option<T>, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        match call(attempt).await {
            Ok(v) => return Ok(Some(v)),
            Err(FetchError::NotFound) => return Ok(None),
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let Some(wait) = policy.backoff(&err, attempt) else {
                    return Err(err);
                };
                let jitter = rand::thread_rng().gen_range(0..=50u64);
                tokio::time::sleep(wait + Duration::from_millis(jitter)).await;
                attempt += 1;
            }
        }
    }
}

/// Enrichment envelope: who resolved the item and with what. A tagged union
/// so downstream code pattern-matches instead of probing shapes.
#[derive(Debug, Clone)]
pub enum Enrichment {
    Provider(ProviderHit),
    Ai(AiHit),
}

#[derive(Debug, Clone)]
pub struct ProviderHit {
    pub provider: &'static str,
    pub score: f64,
    pub entity: ProviderEntity,
    /// The search query that produced the hit, for observability.
    pub query: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ProviderEntity {
    Book(openlibrary::BookEntity),
    Movie(tmdb::MovieEntity),
    Game(igdb::GameEntity),
}

/// A second-pass answer the language model produced and we validated.
#[derive(Debug, Clone)]
pub struct AiHit {
    pub collectable: Collectable,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Resolved,
    Unresolved,
}

/// Per-item first-pass result, positionally aligned with the input batch.
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub status: LookupStatus,
    pub enrichment: Option<Enrichment>,
}

impl LookupOutcome {
    pub fn resolved(enrichment: Enrichment) -> Self {
        Self {
            status: LookupStatus::Resolved,
            enrichment: Some(enrichment),
        }
    }

    pub fn unresolved() -> Self {
        Self {
            status: LookupStatus::Unresolved,
            enrichment: None,
        }
    }
}

/// Uniform adapter contract. One implementation per external catalog.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Shelf domains this adapter can resolve (capability lookup table).
    fn supported_shelves(&self) -> &'static [ShelfType];

    /// Whether the AI second pass is switched on for this adapter.
    fn second_pass_enabled(&self) -> bool;

    /// Single-item lookup under the provider's retry policy. Never errors;
    /// exhausted retries and hard failures degrade to None.
    async fn safe_lookup(&self, item: &ExtractedItem) -> Option<Enrichment>;

    /// Map a provider enrichment into the canonical shape, attaching a
    /// freshly computed strong fingerprint when the entity lacks one.
    fn build_collectable(
        &self,
        enrichment: &Enrichment,
        item: &ExtractedItem,
        lightweight_fingerprint: Option<&str>,
    ) -> Option<Collectable>;

    fn supports_shelf_type(&self, shelf: ShelfType) -> bool {
        self.supported_shelves().contains(&shelf)
    }

    /// Gate for the AI fallback: feature flag AND work to do AND domain fit.
    fn should_run_second_pass(&self, shelf: ShelfType, unresolved_count: usize) -> bool {
        self.second_pass_enabled() && unresolved_count > 0 && self.supports_shelf_type(shelf)
    }

    /// Bounded-concurrency batch lookup; output order matches input order.
    async fn lookup_first_pass(
        &self,
        items: &[ExtractedItem],
        concurrency: usize,
    ) -> Vec<LookupOutcome> {
        bounded_map(items.len(), concurrency, |i| {
            let item = &items[i];
            async move {
                match self.safe_lookup(item).await {
                    Some(enrichment) => LookupOutcome::resolved(enrichment),
                    None => LookupOutcome::unresolved(),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_twice_with_increasing_backoff() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_ms: 500,
        };
        let started = Instant::now();
        let out = retry_fetch(policy, |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FetchError::RateLimited)
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // exponential: 500ms then 1000ms, plus up to 50ms jitter each
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1700), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_back_off_linearly_until_budget_exhausted() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_ms: 100,
        };
        let started = Instant::now();
        let out: Result<Option<u32>, _> = retry_fetch(policy, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Timeout) }
        })
        .await;

        assert!(out.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // linear: 100ms then 200ms
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn not_found_short_circuits_without_retry() {
        let attempts = AtomicU32::new(0);
        let out: Option<u32> = retry_fetch(RetryPolicy::default(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::NotFound) }
        })
        .await
        .unwrap();
        assert_eq!(out, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried_here() {
        let attempts = AtomicU32::new(0);
        let out: Result<Option<u32>, _> = retry_fetch(RetryPolicy::default(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Unauthorized) }
        })
        .await;
        assert!(matches!(out, Err(FetchError::Unauthorized)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
