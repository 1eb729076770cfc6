use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::EnrichError;

pub const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const SERPER_SEARCH_URL: &str = "https://google.serper.dev/search";

/// Runtime settings, loaded from the environment.
///
/// Only the two API keys are required; everything else has a default.
/// Endpoint URLs are overridable so tests can point at a local stub.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub serper_api_key: String,
    pub openai_org_id: String,
    pub openai_model: String,
    pub openai_url: String,
    pub serper_search_url: String,

    pub serp_max_rps: usize,
    pub serp_concurrency: usize,
    pub openai_concurrency: usize,
    pub http_connect_timeout: Duration,
    pub http_read_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: f64,

    pub max_candidates_per_company: usize,
    pub search_results_per_call: usize,
    pub enable_dns_check: bool,
    pub dns_timeout: Duration,
}

impl Config {
    /// Build a configuration with default tuning for the given API keys.
    pub fn new(openai_api_key: impl Into<String>, serper_api_key: impl Into<String>) -> Self {
        Self {
            openai_api_key: openai_api_key.into(),
            serper_api_key: serper_api_key.into(),
            openai_org_id: String::new(),
            openai_model: "gpt-4o-mini".to_owned(),
            openai_url: OPENAI_URL.to_owned(),
            serper_search_url: SERPER_SEARCH_URL.to_owned(),
            serp_max_rps: 50,
            serp_concurrency: 100,
            openai_concurrency: 24,
            http_connect_timeout: Duration::from_secs(8),
            http_read_timeout: Duration::from_secs(45),
            max_retries: 4,
            backoff_base: 1.6,
            max_candidates_per_company: 8,
            search_results_per_call: 12,
            enable_dns_check: false,
            dns_timeout: Duration::from_secs(3),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, EnrichError> {
        let mut cfg = Self::new(required_env("OPENAI_API_KEY")?, required_env("SERPER_API_KEY")?);

        cfg.openai_org_id = env::var("OPENAI_ORG_ID").unwrap_or_default();
        if let Ok(model) = env::var("OPENAI_MODEL") {
            cfg.openai_model = model;
        }
        cfg.serp_max_rps = parsed_env("SERP_MAX_RPS", cfg.serp_max_rps)?;
        cfg.serp_concurrency = parsed_env("SERP_CONCURRENCY", cfg.serp_concurrency)?;
        cfg.openai_concurrency = parsed_env("OPENAI_CONCURRENCY", cfg.openai_concurrency)?;
        cfg.http_connect_timeout =
            Duration::from_secs(parsed_env("HTTP_CONNECT_TIMEOUT", 8u64)?);
        cfg.http_read_timeout = Duration::from_secs(parsed_env("HTTP_READ_TIMEOUT", 45u64)?);
        cfg.max_retries = parsed_env("MAX_RETRIES", cfg.max_retries)?;
        cfg.backoff_base = parsed_env("BACKOFF_BASE", cfg.backoff_base)?;
        cfg.max_candidates_per_company =
            parsed_env("MAX_CANDIDATES_PER_COMPANY", cfg.max_candidates_per_company)?;
        cfg.search_results_per_call =
            parsed_env("SEARCH_RESULTS_PER_CALL", cfg.search_results_per_call)?;
        cfg.enable_dns_check = parsed_env("ENABLE_DNS_CHECK", cfg.enable_dns_check)?;
        cfg.dns_timeout = Duration::from_secs(parsed_env("DNS_TIMEOUT", 3u64)?);

        Ok(cfg)
    }

    /// Total per-request budget: connect plus read.
    pub fn http_total_timeout(&self) -> Duration {
        self.http_connect_timeout + self.http_read_timeout
    }
}

fn required_env(name: &str) -> Result<String, EnrichError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| EnrichError::Config(format!("{name} is not set")))
}

fn parsed_env<T: FromStr>(name: &str, default: T) -> Result<T, EnrichError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EnrichError::Config(format!("{name} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
