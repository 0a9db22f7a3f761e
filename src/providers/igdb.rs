//! IGDB adapter for the game domain. Authenticates via Twitch OAuth2 client
//! credentials with a cached token; a 401 clears the cache and forces exactly
//! one refresh before the request is retried.

use super::{
    Enrichment, FetchError, ProviderAdapter, ProviderEntity, ProviderHit, RetryPolicy, retry_fetch,
};
use crate::config::PipelineConfig;
use crate::fingerprint::{normalize, normalize_creator, strong_fingerprint, FingerprintParts};
use crate::model::{Collectable, ExtractedItem, ImageRef, MediaType, ShelfType, SourceRef};
use crate::util::env::env_opt;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use strsim::jaro_winkler;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const IGDB_GAMES_ENDPOINT: &str = "https://api.igdb.com/v4/games";
const IGDB_IMAGE_BASE: &str = "https://images.igdb.com/igdb/image/upload";
const PROVIDER_NAME: &str = "igdb";
const SUPPORTED: &[ShelfType] = &[ShelfType::Games];
const SEARCH_LIMIT: usize = 10;
const MIN_SEARCH_SCORE: f64 = 35.0;
// main game, remake, remaster, expanded game, port
const CATEGORY_FILTER: &str = "(0,8,9,10,11)";
const GAME_FIELDS: &str = "fields id,name,summary,first_release_date,category,total_rating,\
total_rating_count,url,cover.image_id,platforms.id,platforms.name,genres.name,\
involved_companies.company.name,involved_companies.developer,involved_companies.publisher;";

/// Platform names the extractor commonly emits, mapped to IGDB platform ids.
const PLATFORM_IDS: &[(&str, i64)] = &[
    ("playstation 5", 167),
    ("ps5", 167),
    ("playstation 4", 48),
    ("ps4", 48),
    ("playstation 3", 9),
    ("ps3", 9),
    ("playstation 2", 8),
    ("ps2", 8),
    ("playstation", 7),
    ("ps1", 7),
    ("xbox series x", 169),
    ("xbox series", 169),
    ("xbox one", 49),
    ("xbox 360", 12),
    ("xbox", 11),
    ("nintendo switch", 130),
    ("switch", 130),
    ("wii u", 41),
    ("wii", 5),
    ("gamecube", 21),
    ("nintendo 64", 4),
    ("n64", 4),
    ("super nintendo", 19),
    ("snes", 19),
    ("nes", 18),
    ("nintendo 3ds", 37),
    ("3ds", 37),
    ("nintendo ds", 20),
    ("game boy advance", 24),
    ("gba", 24),
    ("game boy", 33),
    ("pc", 6),
    ("windows", 6),
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GameEntity {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub first_release_date: Option<i64>,
    #[serde(default)]
    pub category: Option<i64>,
    #[serde(default)]
    pub total_rating: Option<f64>,
    #[serde(default)]
    pub total_rating_count: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub cover: Option<IgdbCover>,
    #[serde(default)]
    pub platforms: Vec<IgdbPlatform>,
    #[serde(default)]
    pub genres: Vec<IgdbGenre>,
    #[serde(default)]
    pub involved_companies: Vec<InvolvedCompany>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IgdbCover {
    #[serde(default)]
    pub image_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IgdbPlatform {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IgdbGenre {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvolvedCompany {
    #[serde(default)]
    pub company: Option<CompanyRef>,
    #[serde(default)]
    pub developer: bool,
    #[serde(default)]
    pub publisher: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanyRef {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwitchTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct IgdbToken {
    access_token: String,
    expires_at: Instant,
}

impl GameEntity {
    pub fn release_year(&self) -> Option<i32> {
        self.first_release_date
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|dt| dt.format("%Y").to_string())
            .and_then(|y| y.parse().ok())
    }

    pub fn developers(&self) -> Vec<String> {
        self.involved_companies
            .iter()
            .filter(|c| c.developer)
            .filter_map(|c| c.company.as_ref().and_then(|co| co.name.clone()))
            .collect()
    }

    pub fn publishers(&self) -> Vec<String> {
        self.involved_companies
            .iter()
            .filter(|c| c.publisher)
            .filter_map(|c| c.company.as_ref().and_then(|co| co.name.clone()))
            .collect()
    }
}

/// IGDB search bodies are Apicalypse text; quotes and semicolons in the
/// OCR'd title would break out of the string literal.
pub fn sanitize_query(title: &str) -> String {
    title
        .chars()
        .filter(|c| !matches!(c, '"' | ';' | '\\'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// IGDB platform ids for the item's platform strings, unknown names skipped.
pub fn platform_ids(platforms: &[String]) -> Vec<i64> {
    let mut out = Vec::new();
    for p in platforms {
        let norm = normalize(p);
        if let Some((_, id)) = PLATFORM_IDS.iter().find(|(name, _)| *name == norm) {
            if !out.contains(id) {
                out.push(*id);
            }
        }
    }
    out
}

/// Combined similarity score: title closeness dominates, company, platform
/// and year agreement discriminate between re-releases.
pub fn score_game(candidate: &GameEntity, item: &ExtractedItem) -> f64 {
    let mut score = 0.0;
    if let Some(name) = candidate.name.as_deref() {
        score += jaro_winkler(&normalize(&item.title), &normalize(name)) * 50.0;
    }

    if let Some(creator) = item.creator.as_deref() {
        let want = normalize_creator(creator);
        let companies: Vec<String> = candidate
            .developers()
            .into_iter()
            .chain(candidate.publishers())
            .map(|c| normalize_creator(&c))
            .collect();
        if companies.iter().any(|c| *c == want) {
            score += 25.0;
        } else if companies
            .iter()
            .any(|c| c.contains(&want) || want.contains(c.as_str()))
        {
            score += 12.0;
        }
    }

    if !item.platforms.is_empty() {
        let wanted = platform_ids(&item.platforms);
        let hit = candidate
            .platforms
            .iter()
            .filter_map(|p| p.id)
            .any(|id| wanted.contains(&id));
        if hit {
            score += 10.0;
        }
    }

    if let (Some(want), Some(got)) = (item.year, candidate.release_year()) {
        match (want - got).abs() {
            0 => score += 15.0,
            1 => score += 7.0,
            _ => {}
        }
    }
    score
}

#[derive(Debug, Clone)]
pub struct IgdbConfig {
    pub client_id: String,
    pub client_secret: String,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub second_pass: bool,
}

impl IgdbConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Result<Self> {
        let client_id = env_opt("TWITCH_CLIENT_ID")
            .ok_or_else(|| anyhow!("TWITCH_CLIENT_ID is not set, game lookups unavailable"))?;
        let client_secret = env_opt("TWITCH_CLIENT_SECRET")
            .ok_or_else(|| anyhow!("TWITCH_CLIENT_SECRET is not set, game lookups unavailable"))?;
        Ok(Self {
            client_id,
            client_secret,
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff_ms: cfg.backoff_ms,
            },
            timeout: Duration::from_millis(cfg.request_timeout_ms),
            second_pass: cfg.ai.enabled,
        })
    }
}

pub struct IgdbAdapter {
    cfg: IgdbConfig,
    http: Client,
    token: Mutex<Option<IgdbToken>>,
}

impl IgdbAdapter {
    pub fn new(cfg: IgdbConfig) -> Result<Self> {
        let user_agent = env_opt("SHELFSCAN_USER_AGENT")
            .unwrap_or_else(|| "shelfscan-resolver/0.1".to_string());
        let http = Client::builder()
            .user_agent(user_agent)
            .build()
            .context("failed to construct IGDB HTTP client")?;
        Ok(Self {
            cfg,
            http,
            token: Mutex::new(None),
        })
    }

    pub fn from_env(cfg: &PipelineConfig) -> Result<Self> {
        Self::new(IgdbConfig::from_pipeline(cfg)?)
    }

    async fn ensure_token(&self) -> Result<String, FetchError> {
        {
            let guard = self.token.lock().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at > Instant::now() + Duration::from_secs(30) {
                    return Ok(token.access_token.clone());
                }
            }
        }
        let token = self.request_new_token().await?;
        let mut guard = self.token.lock().await;
        *guard = Some(token.clone());
        Ok(token.access_token)
    }

    async fn request_new_token(&self) -> Result<IgdbToken, FetchError> {
        let response = self
            .http
            .post(TWITCH_TOKEN_URL)
            .query(&[
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
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
        let token: TwitchTokenResponse =
            serde_json::from_str(&text).map_err(FetchError::Payload)?;
        let ttl = token.expires_in.saturating_sub(30).max(30);
        Ok(IgdbToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        })
    }

    async fn post_games(&self, body: &str, token: &str) -> Result<Vec<GameEntity>, FetchError> {
        let response = self
            .http
            .post(IGDB_GAMES_ENDPOINT)
            .header("Client-ID", &self.cfg.client_id)
            .header("Content-Type", "text/plain")
            .header("Authorization", format!("Bearer {token}"))
            .body(body.to_string())
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

    /// One logical query. A 401 invalidates the cached token and forces a
    /// single refreshed retry; a second 401 surfaces.
    async fn query_once(&self, body: &str) -> Result<Vec<GameEntity>, FetchError> {
        let token = self.ensure_token().await?;
        match self.post_games(body, &token).await {
            Err(FetchError::Unauthorized) => {
                debug!("igdb token rejected, forcing one refresh");
                {
                    let mut guard = self.token.lock().await;
                    *guard = None;
                }
                let token = self.ensure_token().await?;
                self.post_games(body, &token).await
            }
            other => other,
        }
    }

    async fn search(
        &self,
        title: &str,
        platforms: &[i64],
    ) -> Result<Option<Vec<GameEntity>>, FetchError> {
        let mut body = format!(
            "search \"{}\"; {} where category = {CATEGORY_FILTER}",
            sanitize_query(title),
            GAME_FIELDS
        );
        if !platforms.is_empty() {
            let ids: Vec<String> = platforms.iter().map(|id| id.to_string()).collect();
            body.push_str(&format!(" & platforms = ({})", ids.join(",")));
        }
        body.push_str(&format!("; limit {SEARCH_LIMIT};"));
        let body = body.as_str();
        retry_fetch(self.cfg.retry, |_| async move { self.query_once(body).await }).await
    }
}

#[async_trait]
impl ProviderAdapter for IgdbAdapter {
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
        let platforms = platform_ids(&item.platforms);
        let mut candidates = match self.search(&item.title, &platforms).await {
            Ok(Some(games)) => games,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(title = %item.title, error = %err, "igdb search failed");
                return None;
            }
        };

        // OCR'd platform text is unreliable; drop the filter before giving up.
        if candidates.is_empty() && !platforms.is_empty() {
            debug!(title = %item.title, "no platform-filtered hits, retrying unfiltered");
            candidates = match self.search(&item.title, &[]).await {
                Ok(Some(games)) => games,
                Ok(None) => Vec::new(),
                Err(err) => {
                    warn!(title = %item.title, error = %err, "igdb unfiltered search failed");
                    return None;
                }
            };
        }

        let (score, best) = candidates
            .into_iter()
            .map(|g| (score_game(&g, item), g))
            .filter(|(score, _)| *score >= MIN_SEARCH_SCORE)
            .max_by(|a, b| a.0.total_cmp(&b.0))?;
        debug!(title = %item.title, score, id = best.id, "resolved via igdb search");
        Some(Enrichment::Provider(ProviderHit {
            provider: PROVIDER_NAME,
            score,
            entity: ProviderEntity::Game(best),
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
        let ProviderEntity::Game(entity) = &hit.entity else {
            return None;
        };

        let title = entity
            .name
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| item.title.clone());
        let mut c = Collectable::new(MediaType::Game, title);
        c.description = entity.summary.clone();
        c.year = entity.release_year().or(item.year);
        c.genre = entity
            .genres
            .iter()
            .filter_map(|g| g.name.clone())
            .collect();

        let developers = entity.developers();
        c.primary_creator = developers.first().cloned().or_else(|| item.creator.clone());
        c.creators = developers;
        let publishers = entity.publishers();
        if let Some(publisher) = publishers.first() {
            c.extras
                .insert("publisher".into(), serde_json::json!(publisher));
        }
        let platform_names: Vec<String> = entity
            .platforms
            .iter()
            .filter_map(|p| p.name.clone())
            .collect();
        if !platform_names.is_empty() {
            c.extras
                .insert("platforms".into(), serde_json::json!(platform_names));
        }
        if let Some(rating) = entity.total_rating {
            c.extras.insert(
                "rating".into(),
                serde_json::json!({
                    "score": rating,
                    "count": entity.total_rating_count.unwrap_or(0),
                }),
            );
        }

        c.add_identifier(PROVIDER_NAME, "gameId", &entity.id.to_string());
        if let Some(image_id) = entity.cover.as_ref().and_then(|c| c.image_id.as_deref()) {
            c.images.push(ImageRef {
                kind: "cover".into(),
                url_small: Some(format!("{IGDB_IMAGE_BASE}/t_cover_small/{image_id}.jpg")),
                url_medium: Some(format!("{IGDB_IMAGE_BASE}/t_cover_big/{image_id}.jpg")),
                url_large: Some(format!("{IGDB_IMAGE_BASE}/t_original/{image_id}.jpg")),
                provider: PROVIDER_NAME.into(),
            });
        }
        c.sources.push(SourceRef {
            provider: PROVIDER_NAME.into(),
            source_id: entity.id.to_string(),
            url: entity.url.clone(),
            fetched_at: Utc::now(),
            score: Some(hit.score),
            confidence: None,
        });

        c.lightweight_fingerprint = lightweight_fingerprint.map(Into::into);
        let unique_key = format!("igdb:{}", entity.id);
        c.fingerprint = Some(strong_fingerprint(&FingerprintParts {
            unique_key: Some(&unique_key),
            ..Default::default()
        }));
        Some(c)
    }
}
