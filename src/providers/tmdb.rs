//! TMDB adapter for the movie domain. A known TMDB id short-circuits straight
//! to the details endpoint; otherwise a title search (with optional year
//! hint) is scored and the winner's full details are fetched in a second
//! call.

use super::{
    Enrichment, FetchError, ProviderAdapter, ProviderEntity, ProviderHit, RetryPolicy, retry_fetch,
};
use crate::config::PipelineConfig;
use crate::fingerprint::{normalize, strong_fingerprint, FingerprintParts};
use crate::model::{Collectable, ExtractedItem, ImageRef, MediaType, ShelfType, SourceRef};
use crate::util::env::env_opt;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const TMDB_BASE: &str = "https://api.themoviedb.org/3";
const IMAGE_BASE: &str = "https://image.tmdb.org/t/p";
const PROVIDER_NAME: &str = "tmdb";
const SUPPORTED: &[ShelfType] = &[ShelfType::Movies];
const MIN_SEARCH_SCORE: f64 = 20.0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MovieEntity {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub original_title: Option<String>,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub popularity: Option<f64>,
    #[serde(default)]
    pub vote_count: Option<i64>,
    #[serde(default)]
    pub vote_average: Option<f64>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub backdrop_path: Option<String>,
    #[serde(default)]
    pub runtime: Option<i64>,
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub genres: Vec<Named>,
    #[serde(default)]
    pub credits: Option<Credits>,
    #[serde(default)]
    pub keywords: Option<Keywords>,
    #[serde(default)]
    pub release_dates: Option<ReleaseDates>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Named {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credits {
    #[serde(default)]
    pub cast: Vec<CastMember>,
    #[serde(default)]
    pub crew: Vec<CrewMember>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CastMember {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub character: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrewMember {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub job: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Keywords {
    #[serde(default)]
    pub keywords: Vec<Named>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseDates {
    #[serde(default)]
    pub results: Vec<RegionReleases>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegionReleases {
    #[serde(default)]
    pub iso_3166_1: String,
    #[serde(default)]
    pub release_dates: Vec<ReleaseEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseEntry {
    #[serde(default)]
    pub certification: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<MovieEntity>,
}

impl MovieEntity {
    pub fn release_year(&self) -> Option<i32> {
        self.release_date
            .as_deref()
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse().ok())
    }

    fn directors(&self) -> Vec<String> {
        self.credits
            .as_ref()
            .map(|c| {
                c.crew
                    .iter()
                    .filter(|m| m.job.as_deref() == Some("Director"))
                    .map(|m| m.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// US certification if rated there, else the first rated region.
    fn certification(&self) -> Option<String> {
        let regions = &self.release_dates.as_ref()?.results;
        let pick = |r: &RegionReleases| {
            r.release_dates
                .iter()
                .map(|e| e.certification.clone())
                .find(|c| !c.is_empty())
        };
        regions
            .iter()
            .find(|r| r.iso_3166_1 == "US")
            .and_then(pick)
            .or_else(|| regions.iter().find_map(pick))
    }
}

/// Best-match score for a search candidate against the extracted item.
pub fn score_movie(candidate: &MovieEntity, title: &str, year_hint: Option<i32>) -> f64 {
    let mut score = 0.0;
    let want = normalize(title);
    let titles = [candidate.title.as_deref(), candidate.original_title.as_deref()];
    let best_title = titles
        .iter()
        .flatten()
        .map(|t| {
            let got = normalize(t);
            if got == want {
                50.0
            } else if got.contains(&want) || want.contains(&got) {
                25.0
            } else {
                0.0
            }
        })
        .fold(0.0f64, f64::max);
    score += best_title;

    if let (Some(hint), Some(got)) = (year_hint, candidate.release_year()) {
        score += match (hint - got).abs() {
            0 => 20.0,
            1 => 10.0,
            2 => 5.0,
            d => -(d as f64 * 2.0),
        };
    }

    score += candidate.popularity.unwrap_or(0.0).min(100.0) * 0.1;
    score += (candidate.vote_count.unwrap_or(0).min(1000) as f64) * 0.01;
    if candidate.poster_path.is_some() {
        score += 5.0;
    }
    score
}

/// Known TMDB ids on the item, tried before any search.
pub fn tmdb_id_candidates(item: &ExtractedItem) -> Vec<i64> {
    let mut out = Vec::new();
    for kind in ["tmdb", "movieId"] {
        for v in item.identifier_values(kind) {
            if let Ok(id) = v.parse::<i64>() {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct TmdbConfig {
    pub api_key: String,
    pub base_url: String,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub second_pass: bool,
}

impl TmdbConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Result<Self> {
        let api_key = env_opt("TMDB_API_KEY")
            .ok_or_else(|| anyhow!("TMDB_API_KEY is not set, movie lookups unavailable"))?;
        Ok(Self {
            api_key,
            base_url: env_opt("TMDB_BASE_URL").unwrap_or_else(|| TMDB_BASE.to_string()),
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff_ms: cfg.backoff_ms,
            },
            timeout: Duration::from_millis(cfg.request_timeout_ms),
            second_pass: cfg.ai.enabled,
        })
    }
}

pub struct TmdbAdapter {
    cfg: TmdbConfig,
    http: Client,
}

impl TmdbAdapter {
    pub fn new(cfg: TmdbConfig) -> Result<Self> {
        let http = Client::builder()
            .build()
            .context("failed to construct TMDB HTTP client")?;
        Ok(Self { cfg, http })
    }

    pub fn from_env(cfg: &PipelineConfig) -> Result<Self> {
        Self::new(TmdbConfig::from_pipeline(cfg)?)
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

    async fn search(
        &self,
        title: &str,
        year: Option<i32>,
    ) -> Result<Option<Vec<MovieEntity>>, FetchError> {
        let mut url = format!(
            "{}/search/movie?api_key={}&query={}",
            self.cfg.base_url,
            self.cfg.api_key,
            urlencoding::encode(title)
        );
        if let Some(year) = year {
            url.push_str(&format!("&year={year}"));
        }
        let url = url.as_str();
        let response = retry_fetch(self.cfg.retry, |_| async move {
            self.get_json::<SearchResponse>(url).await
        })
        .await?;
        Ok(response.map(|r| r.results))
    }

    async fn fetch_details(&self, id: i64) -> Result<Option<MovieEntity>, FetchError> {
        let url = format!(
            "{}/movie/{}?api_key={}&append_to_response=credits,release_dates,keywords",
            self.cfg.base_url, id, self.cfg.api_key
        );
        let url = url.as_str();
        retry_fetch(self.cfg.retry, |_| async move {
            self.get_json::<MovieEntity>(url).await
        })
        .await
    }
}

#[async_trait]
impl ProviderAdapter for TmdbAdapter {
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
        // Known-id short-circuit.
        for id in tmdb_id_candidates(item) {
            match self.fetch_details(id).await {
                Ok(Some(entity)) => {
                    debug!(title = %item.title, id, "resolved via tmdb id");
                    return Some(Enrichment::Provider(ProviderHit {
                        provider: PROVIDER_NAME,
                        score: 100.0,
                        entity: ProviderEntity::Movie(entity),
                        query: Some(format!("id:{id}")),
                    }));
                }
                Ok(None) => debug!(id, "tmdb id not found"),
                Err(err) => warn!(id, error = %err, "tmdb detail fetch failed"),
            }
        }

        let candidates = match self.search(&item.title, item.year).await {
            Ok(Some(results)) => results,
            Ok(None) => return None,
            Err(err) => {
                warn!(title = %item.title, error = %err, "tmdb search failed");
                return None;
            }
        };
        let (score, best) = candidates
            .into_iter()
            .map(|c| (score_movie(&c, &item.title, item.year), c))
            .filter(|(score, _)| *score >= MIN_SEARCH_SCORE)
            .max_by(|a, b| a.0.total_cmp(&b.0))?;

        // Winner gets a second call for credits and release data; if that
        // fails we keep the search-level entity rather than losing the hit.
        let entity = match self.fetch_details(best.id).await {
            Ok(Some(full)) => full,
            Ok(None) => best,
            Err(err) => {
                warn!(id = best.id, error = %err, "tmdb detail fetch failed, keeping search doc");
                best
            }
        };
        debug!(title = %item.title, score, id = entity.id, "resolved via tmdb search");
        Some(Enrichment::Provider(ProviderHit {
            provider: PROVIDER_NAME,
            score,
            entity: ProviderEntity::Movie(entity),
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
        let ProviderEntity::Movie(entity) = &hit.entity else {
            return None;
        };

        let title = entity
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| item.title.clone());
        let mut c = Collectable::new(MediaType::Movie, title);
        c.description = entity.overview.clone();
        c.year = entity.release_year().or(item.year);
        c.genre = entity.genres.iter().map(|g| g.name.clone()).collect();

        let directors = entity.directors();
        c.primary_creator = directors.first().cloned().or_else(|| item.creator.clone());
        c.creators = directors;
        if let Some(credits) = &entity.credits {
            let cast: Vec<String> = credits
                .cast
                .iter()
                .take(10)
                .map(|m| m.name.clone())
                .collect();
            if !cast.is_empty() {
                c.extras.insert("cast".into(), serde_json::json!(cast));
            }
        }
        if let Some(keywords) = &entity.keywords {
            c.tags = keywords.keywords.iter().take(12).map(|k| k.name.clone()).collect();
        }
        if let Some(cert) = entity.certification() {
            c.extras.insert("certification".into(), serde_json::json!(cert));
        }
        if let Some(runtime) = entity.runtime {
            c.extras.insert("runtimeMinutes".into(), serde_json::json!(runtime));
        }

        c.add_identifier(PROVIDER_NAME, "movieId", &entity.id.to_string());
        if let Some(imdb) = &entity.imdb_id {
            c.add_identifier("imdb", "id", imdb);
        }
        if let Some(poster) = &entity.poster_path {
            c.images.push(ImageRef {
                kind: "poster".into(),
                url_small: Some(format!("{IMAGE_BASE}/w185{poster}")),
                url_medium: Some(format!("{IMAGE_BASE}/w500{poster}")),
                url_large: Some(format!("{IMAGE_BASE}/original{poster}")),
                provider: PROVIDER_NAME.into(),
            });
        }
        if let Some(backdrop) = &entity.backdrop_path {
            c.images.push(ImageRef {
                kind: "backdrop".into(),
                url_small: None,
                url_medium: Some(format!("{IMAGE_BASE}/w780{backdrop}")),
                url_large: Some(format!("{IMAGE_BASE}/original{backdrop}")),
                provider: PROVIDER_NAME.into(),
            });
        }
        c.sources.push(SourceRef {
            provider: PROVIDER_NAME.into(),
            source_id: entity.id.to_string(),
            url: Some(format!("https://www.themoviedb.org/movie/{}", entity.id)),
            fetched_at: Utc::now(),
            score: Some(hit.score),
            confidence: None,
        });

        c.lightweight_fingerprint = lightweight_fingerprint.map(Into::into);
        let unique_key = format!("tmdb:{}", entity.id);
        c.fingerprint = Some(strong_fingerprint(&FingerprintParts {
            unique_key: Some(&unique_key),
            ..Default::default()
        }));
        Some(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn candidate(title: &str, year: Option<&str>, popularity: f64, votes: i64) -> MovieEntity {
        MovieEntity {
            id: 1,
            title: Some(title.into()),
            release_date: year.map(|y| format!("{y}-06-01")),
            popularity: Some(popularity),
            vote_count: Some(votes),
            poster_path: Some("/x.jpg".into()),
            ..Default::default()
        }
    }

    #[test]
    fn exact_title_and_year_beats_popular_remake() {
        let original = candidate("Dune", Some("1984"), 20.0, 800);
        let remake = candidate("Dune", Some("2021"), 95.0, 1000);
        let s_original = score_movie(&original, "Dune", Some(1984));
        let s_remake = score_movie(&remake, "Dune", Some(1984));
        assert!(s_original > s_remake, "{s_original} vs {s_remake}");
    }

    #[test]
    fn large_year_distance_is_penalized() {
        let wrong = candidate("Dune", Some("2021"), 0.0, 0);
        let base = score_movie(&candidate("Dune", None, 0.0, 0), "Dune", Some(1984));
        let penalized = score_movie(&wrong, "Dune", Some(1984));
        assert!(penalized < base, "{penalized} vs {base}");
    }

    #[test]
    fn release_year_parses_from_date() {
        assert_eq!(candidate("X", Some("1999"), 0.0, 0).release_year(), Some(1999));
        assert_eq!(candidate("X", None, 0.0, 0).release_year(), None);
    }

    #[test]
    fn id_candidates_parse_and_dedup() {
        let mut identifiers = BTreeMap::new();
        identifiers.insert("tmdb".to_string(), vec!["603".to_string(), "bogus".to_string()]);
        identifiers.insert("movieId".to_string(), vec!["603".to_string(), "604".to_string()]);
        let item = ExtractedItem {
            title: "The Matrix".into(),
            identifiers,
            ..Default::default()
        };
        assert_eq!(tmdb_id_candidates(&item), vec![603, 604]);
    }

    #[test]
    fn build_collectable_maps_credits_and_certification() {
        let adapter = TmdbAdapter::new(TmdbConfig {
            api_key: "k".into(),
            base_url: TMDB_BASE.into(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(5),
            second_pass: false,
        })
        .unwrap();

        let mut entity = candidate("Dune", Some("1984"), 20.0, 800);
        entity.id = 841;
        entity.imdb_id = Some("tt0087182".into());
        entity.credits = Some(Credits {
            cast: vec![CastMember {
                name: "Kyle MacLachlan".into(),
                character: Some("Paul Atreides".into()),
            }],
            crew: vec![CrewMember {
                name: "David Lynch".into(),
                job: Some("Director".into()),
            }],
        });
        entity.release_dates = Some(ReleaseDates {
            results: vec![RegionReleases {
                iso_3166_1: "US".into(),
                release_dates: vec![ReleaseEntry {
                    certification: "PG-13".into(),
                }],
            }],
        });

        let item = ExtractedItem {
            title: "Dune".into(),
            ..Default::default()
        };
        let hit = Enrichment::Provider(ProviderHit {
            provider: PROVIDER_NAME,
            score: 90.0,
            entity: ProviderEntity::Movie(entity),
            query: None,
        });
        let c = adapter.build_collectable(&hit, &item, Some("lw")).unwrap();
        assert_eq!(c.primary_creator.as_deref(), Some("David Lynch"));
        assert_eq!(c.identifier_values("movieId"), vec!["841"]);
        assert_eq!(c.identifier_values("id"), vec!["tt0087182"]);
        assert_eq!(
            c.extras.get("certification"),
            Some(&serde_json::json!("PG-13"))
        );
        assert_eq!(c.lightweight_fingerprint.as_deref(), Some("lw"));
        assert!(c.fingerprint.is_some());
    }
}
