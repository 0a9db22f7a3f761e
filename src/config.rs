//! Pipeline configuration, sourced from the environment with clamped parsing.

use crate::util::env::{env_flag, env_opt, env_parse};

/// Knobs shared by all provider adapters and the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded worker pool width for first-pass lookups and re-lookups.
    pub concurrency: usize,
    /// Retry budget per external call (429 / timeout classes).
    pub max_retries: u32,
    /// Base backoff unit; 429 doubles it per attempt, timeouts grow linearly.
    pub backoff_ms: u64,
    /// Hard per-request timeout. A timed-out call is a retryable failure.
    pub request_timeout_ms: u64,
    pub ai: AiConfig,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    /// Feature flag gating the whole second pass.
    pub enabled: bool,
    /// Unresolved items beyond this cap pass through untouched.
    pub batch_cap: usize,
    /// OpenAI-compatible chat-completions base URL.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Minimum confidence for the fuzzy-fingerprint learner to persist.
    pub learn_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            backoff_ms: 500,
            request_timeout_ms: 10_000,
            ai: AiConfig::default(),
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_cap: 12,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            learn_threshold: 0.7,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.concurrency = env_parse("SHELFSCAN_CONCURRENCY", cfg.concurrency).clamp(1, 16);
        cfg.max_retries = env_parse("SHELFSCAN_MAX_RETRIES", cfg.max_retries).min(10);
        cfg.backoff_ms = env_parse("SHELFSCAN_BACKOFF_MS", cfg.backoff_ms).max(1);
        cfg.request_timeout_ms =
            env_parse("SHELFSCAN_TIMEOUT_MS", cfg.request_timeout_ms).clamp(500, 120_000);
        cfg.ai = AiConfig::from_env();
        cfg
    }
}

impl AiConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.enabled = env_flag("SHELFSCAN_AI_ENABLED", cfg.enabled);
        cfg.batch_cap = env_parse("SHELFSCAN_AI_BATCH_CAP", cfg.batch_cap).clamp(1, 50);
        if let Some(v) = env_opt("SHELFSCAN_AI_BASE_URL") {
            cfg.base_url = v.trim_end_matches('/').to_string();
        }
        cfg.api_key = env_opt("SHELFSCAN_AI_API_KEY").or_else(|| env_opt("OPENAI_API_KEY"));
        if let Some(v) = env_opt("SHELFSCAN_AI_MODEL") {
            cfg.model = v;
        }
        let threshold: f64 = env_parse("SHELFSCAN_LEARN_THRESHOLD", cfg.learn_threshold);
        cfg.learn_threshold = threshold.clamp(0.0, 1.0);
        cfg
    }
}
