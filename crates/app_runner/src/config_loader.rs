use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use latency_aggregator::DEFAULT_BUCKETS_MS;
use serde::Deserialize;

fn config_path() -> PathBuf {
    std::env::var("TXRACE_CONFIG_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("configs/race.toml"))
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct RaceConfig {
    /// Name of the source every other source is compared against.
    pub(super) reference: String,
    #[serde(default = "default_listen_addr")]
    pub(super) listen_addr: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub(super) connect_timeout_ms: u64,
    /// Total arrival-cache entries per source, split across shards.
    #[serde(default = "default_cache_capacity")]
    pub(super) cache_capacity: usize,
    #[serde(default = "default_cache_shards")]
    pub(super) cache_shards: usize,
    #[serde(default)]
    pub(super) aggregator: AggregatorConfig,
    pub(super) sources: Vec<SourceConfig>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:2112".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_cache_capacity() -> usize {
    16_384
}

fn default_cache_shards() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct AggregatorConfig {
    #[serde(default = "default_warmup_window")]
    pub(super) warmup_window: u32,
    #[serde(default = "default_lower_bound_ms")]
    pub(super) lower_bound_ms: f64,
    #[serde(default = "default_buckets_ms")]
    pub(super) buckets_ms: Vec<f64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            warmup_window: default_warmup_window(),
            lower_bound_ms: default_lower_bound_ms(),
            buckets_ms: default_buckets_ms(),
        }
    }
}

fn default_warmup_window() -> u32 {
    10
}

fn default_lower_bound_ms() -> f64 {
    -500.0
}

fn default_buckets_ms() -> Vec<f64> {
    DEFAULT_BUCKETS_MS.to_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(super) enum SourceKind {
    Ethrpc,
    Bloxroute,
    Fiber,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct SourceConfig {
    pub(super) name: String,
    pub(super) kind: SourceKind,
    pub(super) endpoint: String,
    #[serde(default)]
    pub(super) api_key: Option<String>,
    /// Name of an environment variable to read the key from instead of
    /// inlining it in the config file.
    #[serde(default)]
    pub(super) api_key_env: Option<String>,
}

impl SourceConfig {
    pub(super) fn requires_api_key(&self) -> bool {
        matches!(self.kind, SourceKind::Bloxroute | SourceKind::Fiber)
    }

    pub(super) fn resolved_api_key(&self) -> Result<Option<String>> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(Some(key.to_string()));
        }
        if let Some(var) = self.api_key_env.as_deref().filter(|v| !v.is_empty()) {
            let key = std::env::var(var)
                .with_context(|| format!("source {}: env var {var} is not set", self.name))?;
            return Ok(Some(key));
        }
        Ok(None)
    }
}

pub(super) fn load_config() -> Result<RaceConfig> {
    let path = config_path();
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("invalid config {}", path.display()))
}

pub(super) fn parse_config(raw: &str) -> Result<RaceConfig> {
    let cfg: RaceConfig = toml::from_str(raw).context("parse toml")?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &RaceConfig) -> Result<()> {
    if cfg.sources.len() < 2 {
        bail!("at least two sources are required (the reference plus one secondary)");
    }
    let mut names = HashSet::new();
    for source in &cfg.sources {
        if source.name.trim().is_empty() {
            bail!("source names must not be empty");
        }
        if !names.insert(source.name.as_str()) {
            bail!("duplicate source name: {}", source.name);
        }
        if source.requires_api_key() && source.resolved_api_key()?.is_none() {
            bail!(
                "source {} ({:?}) requires api_key or api_key_env",
                source.name,
                source.kind
            );
        }
    }
    if !names.contains(cfg.reference.as_str()) {
        bail!("reference source \"{}\" is not listed in [[sources]]", cfg.reference);
    }
    if cfg.cache_capacity == 0 {
        bail!("cache_capacity must be positive");
    }
    if cfg.cache_shards == 0 {
        bail!("cache_shards must be positive");
    }
    if cfg.aggregator.warmup_window == 0 {
        bail!("aggregator.warmup_window must be at least 1");
    }
    Ok(())
}
