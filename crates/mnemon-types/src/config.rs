//! Engine configuration.
//!
//! Callers build an [`EngineOptions`] (programmatically or from TOML) and the
//! engine validates it once into an immutable [`EngineConfig`]. Validation is
//! eager: a missing `path`, `tier` or `embeddings` section fails before any
//! store resource is opened, and the error names the offending field.

use crate::error::{MnemonError, MnemonResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default decay tick interval (minutes).
const DEFAULT_DECAY_INTERVAL_MINUTES: u64 = 60;

/// Default activation floor below which a record is cold.
const DEFAULT_COLD_THRESHOLD: f32 = 0.1;

/// Default activation boost applied on retrieval.
const DEFAULT_REINFORCEMENT_BOOST: f32 = 0.1;

/// Default minimum content length (chars) for compression.
const DEFAULT_COMPRESSION_MIN_LENGTH: usize = 500;

/// Default reflection interval (minutes).
const DEFAULT_REFLECTION_INTERVAL_MINUTES: u64 = 10;

/// Default number of eligible memories needed before reflecting.
const DEFAULT_REFLECTION_MIN_MEMORIES: usize = 5;

/// Default cosine similarity needed to join a reflection cluster.
const DEFAULT_REFLECTION_SIMILARITY: f32 = 0.8;

/// Default minimum cluster size that produces a reflection.
const DEFAULT_REFLECTION_MIN_CLUSTER: usize = 3;

/// Default minimum activation for a record to take part in reflection.
const DEFAULT_REFLECTION_MIN_ACTIVATION: f32 = 0.2;

/// Default number of query results.
const DEFAULT_QUERY_LIMIT: usize = 10;

/// Default number of listing results.
const DEFAULT_LIST_LIMIT: usize = 100;

/// Default number of concurrent embedding/summarization calls.
const DEFAULT_MAX_CONCURRENT_EMBEDDINGS: usize = 4;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Named resource preset selecting the default embedding dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// 256-dimensional vectors.
    Fast,
    /// 384-dimensional vectors.
    Smart,
    /// 1536-dimensional vectors.
    Deep,
    /// Dimension comes from `embeddings.dimensions`.
    Hybrid,
}

impl Tier {
    /// Default embedding dimension for this tier (`None` for hybrid).
    pub fn default_dimensions(&self) -> Option<usize> {
        match self {
            Tier::Fast => Some(256),
            Tier::Smart => Some(384),
            Tier::Deep => Some(1536),
            Tier::Hybrid => None,
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Tier::Fast),
            "smart" => Ok(Tier::Smart),
            "deep" => Ok(Tier::Deep),
            "hybrid" => Ok(Tier::Hybrid),
            other => Err(format!(
                "unknown tier '{other}', expected fast|smart|deep|hybrid"
            )),
        }
    }
}

/// Embedding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Deterministic offline vectors (feature hashing).
    Synthetic,
    /// OpenAI `/v1/embeddings`.
    OpenAi,
    /// Google Gemini `embedContent`.
    Gemini,
    /// Ollama's OpenAI-compatible endpoint.
    Ollama,
}

impl EmbeddingProvider {
    /// Whether this provider needs an API key.
    pub fn requires_api_key(&self) -> bool {
        matches!(self, EmbeddingProvider::OpenAi | EmbeddingProvider::Gemini)
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" => Ok(EmbeddingProvider::Synthetic),
            "openai" => Ok(EmbeddingProvider::OpenAi),
            "gemini" => Ok(EmbeddingProvider::Gemini),
            "ollama" => Ok(EmbeddingProvider::Ollama),
            other => Err(format!(
                "unknown provider '{other}', expected synthetic|openai|gemini|ollama"
            )),
        }
    }
}

/// How sector vectors are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingMode {
    /// One vector, shared by every sector.
    #[default]
    Simple,
    /// One sector-conditioned vector per sector.
    Advanced,
}

impl std::str::FromStr for EmbeddingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(EmbeddingMode::Simple),
            "advanced" => Ok(EmbeddingMode::Advanced),
            other => Err(format!("unknown mode '{other}', expected simple|advanced")),
        }
    }
}

/// What happens to records whose activation falls below the cold threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdPolicy {
    /// Hidden from default retrieval; visible with `include_cold`.
    #[default]
    Exclude,
    /// Physically deleted during the decay tick.
    Delete,
    /// Marked cold but still returned by default.
    Keep,
}

impl std::str::FromStr for ColdPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclude" => Ok(ColdPolicy::Exclude),
            "delete" => Ok(ColdPolicy::Delete),
            "keep" => Ok(ColdPolicy::Keep),
            other => Err(format!(
                "unknown cold policy '{other}', expected exclude|delete|keep"
            )),
        }
    }
}

/// Compression strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// Extractive summary by term salience (or a model-backed summarizer).
    #[default]
    Semantic,
    /// Whitespace and filler-word removal.
    Lexical,
    /// Extractive summary with a tight budget.
    Aggressive,
    /// Lexical for moderate text, semantic for long text.
    Auto,
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Ok(CompressionAlgorithm::Semantic),
            "lexical" | "syntactic" => Ok(CompressionAlgorithm::Lexical),
            "aggressive" => Ok(CompressionAlgorithm::Aggressive),
            "auto" => Ok(CompressionAlgorithm::Auto),
            other => Err(format!(
                "unknown algorithm '{other}', expected semantic|lexical|aggressive|auto"
            )),
        }
    }
}

impl CompressionAlgorithm {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Semantic => "semantic",
            CompressionAlgorithm::Lexical => "lexical",
            CompressionAlgorithm::Aggressive => "aggressive",
            CompressionAlgorithm::Auto => "auto",
        }
    }
}

// ---------------------------------------------------------------------------
// Raw options (as supplied by the caller)
// ---------------------------------------------------------------------------

/// Engine options as supplied by the caller. Validate with [`EngineOptions::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Store location (file path, or `:memory:`).
    pub path: Option<String>,
    /// Resource tier: fast | smart | deep | hybrid.
    pub tier: Option<String>,
    /// Embedding provider settings.
    pub embeddings: Option<EmbeddingOptions>,
    /// Decay scheduler settings.
    pub decay: Option<DecayOptions>,
    /// Compression settings.
    pub compression: Option<CompressionOptions>,
    /// Reflection settings.
    pub reflection: Option<ReflectionOptions>,
    /// Retrieval defaults.
    pub retrieval: Option<RetrievalOptions>,
    /// Ingest behaviour.
    pub ingest: Option<IngestOptions>,
    /// Bound on concurrent provider calls.
    #[serde(alias = "maxConcurrentEmbeddings")]
    pub max_concurrent_embeddings: Option<usize>,
}

/// Embedding provider options.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingOptions {
    /// synthetic | openai | gemini | ollama
    pub provider: Option<String>,
    /// Explicit vector dimension (required for the hybrid tier).
    pub dimensions: Option<usize>,
    /// simple | advanced
    pub mode: Option<String>,
    /// Provider model name.
    pub model: Option<String>,
    /// API key (openai, gemini).
    #[serde(alias = "apiKey")]
    pub api_key: Option<String>,
    /// Override the provider base URL.
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Chat model used for summaries (remote providers only).
    #[serde(alias = "chatModel")]
    pub chat_model: Option<String>,
}

impl std::fmt::Debug for EmbeddingOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingOptions")
            .field("provider", &self.provider)
            .field("dimensions", &self.dimensions)
            .field("mode", &self.mode)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .finish()
    }
}

impl EmbeddingOptions {
    /// Options for the offline synthetic provider.
    pub fn synthetic() -> Self {
        Self {
            provider: Some("synthetic".to_string()),
            ..Default::default()
        }
    }
}

/// Decay scheduler options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayOptions {
    /// Tick interval in minutes.
    #[serde(alias = "intervalMinutes")]
    pub interval_minutes: Option<f64>,
    /// Reinforce records returned by retrievals.
    #[serde(alias = "reinforceOnQuery")]
    pub reinforce_on_query: Option<bool>,
    /// Activation floor below which a record is cold.
    #[serde(alias = "coldThreshold")]
    pub cold_threshold: Option<f32>,
    /// Activation added on reinforcement.
    #[serde(alias = "reinforcementBoost")]
    pub reinforcement_boost: Option<f32>,
    /// exclude | delete | keep
    #[serde(alias = "coldPolicy")]
    pub cold_policy: Option<String>,
}

/// Compression options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionOptions {
    /// Compress on ingest.
    pub enabled: Option<bool>,
    /// semantic | lexical | aggressive | auto
    pub algorithm: Option<String>,
    /// Minimum content length (chars) to compress.
    #[serde(alias = "minLength")]
    pub min_length: Option<usize>,
    /// Re-embed from the compressed content instead of the original.
    pub reembed: Option<bool>,
}

/// Reflection options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionOptions {
    /// Run the periodic reflection task.
    pub enabled: Option<bool>,
    /// Interval between passes in minutes.
    #[serde(alias = "intervalMinutes")]
    pub interval_minutes: Option<f64>,
    /// Minimum eligible memories before a pass does anything.
    #[serde(alias = "minMemories")]
    pub min_memories: Option<usize>,
    /// Cosine similarity needed to join a cluster.
    #[serde(alias = "similarityThreshold")]
    pub similarity_threshold: Option<f32>,
    /// Minimum cluster size that yields a reflection.
    #[serde(alias = "minClusterSize")]
    pub min_cluster_size: Option<usize>,
    /// Minimum activation for eligibility.
    #[serde(alias = "minActivation")]
    pub min_activation: Option<f32>,
}

/// Retrieval defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    /// Default `query` limit.
    #[serde(alias = "defaultLimit")]
    pub default_limit: Option<usize>,
    /// Default `get_all`/`get_by_sector` limit.
    #[serde(alias = "listLimit")]
    pub list_limit: Option<usize>,
}

/// Ingest options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOptions {
    /// Reinforce an existing same-owner memory with identical simhash
    /// instead of storing a new one.
    pub deduplicate: Option<bool>,
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// Validated, immutable engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Store location.
    pub path: String,
    /// Resource tier.
    pub tier: Tier,
    /// Embedding settings.
    pub embeddings: EmbeddingConfig,
    /// Decay settings.
    pub decay: DecayConfig,
    /// Compression settings.
    pub compression: CompressionConfig,
    /// Reflection settings.
    pub reflection: ReflectionConfig,
    /// Retrieval defaults.
    pub retrieval: RetrievalConfig,
    /// Ingest behaviour.
    pub ingest: IngestConfig,
    /// Bound on concurrent provider calls.
    pub max_concurrent_embeddings: usize,
}

/// Validated embedding settings.
#[derive(Clone)]
pub struct EmbeddingConfig {
    /// Backend.
    pub provider: EmbeddingProvider,
    /// Vector dimension shared by every sector.
    pub dimensions: usize,
    /// Sector vector mode.
    pub mode: EmbeddingMode,
    /// Provider model name.
    pub model: Option<String>,
    /// API key.
    pub api_key: Option<String>,
    /// Base URL override.
    pub base_url: Option<String>,
    /// Chat model override for summaries.
    pub chat_model: Option<String>,
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("provider", &self.provider)
            .field("dimensions", &self.dimensions)
            .field("mode", &self.mode)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .finish()
    }
}

/// Validated decay settings.
#[derive(Debug, Clone)]
pub struct DecayConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Reinforce records returned by retrievals.
    pub reinforce_on_query: bool,
    /// Activation floor below which a record is cold.
    pub cold_threshold: f32,
    /// Activation added on reinforcement.
    pub reinforcement_boost: f32,
    /// What to do with cold records.
    pub cold_policy: ColdPolicy,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            interval: minutes(DEFAULT_DECAY_INTERVAL_MINUTES),
            reinforce_on_query: true,
            cold_threshold: DEFAULT_COLD_THRESHOLD,
            reinforcement_boost: DEFAULT_REINFORCEMENT_BOOST,
            cold_policy: ColdPolicy::Exclude,
        }
    }
}

/// Validated compression settings.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Compress on ingest.
    pub enabled: bool,
    /// Strategy.
    pub algorithm: CompressionAlgorithm,
    /// Minimum content length (chars).
    pub min_length: usize,
    /// Re-embed from compressed content.
    pub reembed: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: CompressionAlgorithm::Semantic,
            min_length: DEFAULT_COMPRESSION_MIN_LENGTH,
            reembed: false,
        }
    }
}

/// Validated reflection settings.
#[derive(Debug, Clone)]
pub struct ReflectionConfig {
    /// Run the periodic task.
    pub enabled: bool,
    /// Interval between passes.
    pub interval: Duration,
    /// Minimum eligible memories.
    pub min_memories: usize,
    /// Cluster join threshold.
    pub similarity_threshold: f32,
    /// Minimum cluster size.
    pub min_cluster_size: usize,
    /// Minimum activation for eligibility.
    pub min_activation: f32,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: minutes(DEFAULT_REFLECTION_INTERVAL_MINUTES),
            min_memories: DEFAULT_REFLECTION_MIN_MEMORIES,
            similarity_threshold: DEFAULT_REFLECTION_SIMILARITY,
            min_cluster_size: DEFAULT_REFLECTION_MIN_CLUSTER,
            min_activation: DEFAULT_REFLECTION_MIN_ACTIVATION,
        }
    }
}

/// Validated retrieval defaults.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Default `query` limit.
    pub default_limit: usize,
    /// Default listing limit.
    pub list_limit: usize,
}

/// Validated ingest behaviour.
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    /// Near-duplicate content reinforces the existing memory.
    pub deduplicate: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_QUERY_LIMIT,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }
}

/// Shortest accepted maintenance interval.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

fn parse_field<T>(field: &str, raw: &str) -> MnemonResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>().map_err(|e| MnemonError::config(field, e))
}

fn positive_minutes(field: &str, value: f64) -> MnemonResult<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(MnemonError::config(field, "must be a positive number of minutes"));
    }
    let interval = Duration::try_from_secs_f64(value * 60.0)
        .map_err(|e| MnemonError::config(field, format!("out of range: {e}")))?;
    if interval < MIN_INTERVAL {
        return Err(MnemonError::config(
            field,
            format!("must be at least {} ms", MIN_INTERVAL.as_millis()),
        ));
    }
    Ok(interval)
}

fn unit_interval(field: &str, value: f32) -> MnemonResult<f32> {
    if !(0.0..=1.0).contains(&value) {
        return Err(MnemonError::config(field, "must be within [0, 1]"));
    }
    Ok(value)
}

fn at_least_one(field: &str, value: usize) -> MnemonResult<usize> {
    if value == 0 {
        return Err(MnemonError::config(field, "must be at least 1"));
    }
    Ok(value)
}

impl EngineOptions {
    /// Options with the three required sections filled in.
    pub fn new(path: impl Into<String>, tier: impl Into<String>, embeddings: EmbeddingOptions) -> Self {
        Self {
            path: Some(path.into()),
            tier: Some(tier.into()),
            embeddings: Some(embeddings),
            ..Default::default()
        }
    }

    /// Parse options from TOML text.
    pub fn from_toml_str(text: &str) -> MnemonResult<Self> {
        toml::from_str(text).map_err(|e| MnemonError::Serialization(e.to_string()))
    }

    /// Validate into an immutable [`EngineConfig`].
    pub fn validate(&self) -> MnemonResult<EngineConfig> {
        let path = match self.path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => return Err(MnemonError::config("path", "required (e.g. \"./data/memory.db\")")),
        };

        let tier: Tier = match self.tier.as_deref() {
            Some(t) => parse_field("tier", t)?,
            None => return Err(MnemonError::config("tier", "required (fast|smart|deep|hybrid)")),
        };

        let emb = self
            .embeddings
            .as_ref()
            .ok_or_else(|| MnemonError::config("embeddings", "required (provider is mandatory)"))?;
        let embeddings = validate_embeddings(emb, tier)?;

        let decay = match &self.decay {
            Some(d) => {
                let defaults = DecayConfig::default();
                DecayConfig {
                    interval: match d.interval_minutes {
                        Some(m) => positive_minutes("decay.interval_minutes", m)?,
                        None => defaults.interval,
                    },
                    reinforce_on_query: d.reinforce_on_query.unwrap_or(defaults.reinforce_on_query),
                    cold_threshold: match d.cold_threshold {
                        Some(v) => unit_interval("decay.cold_threshold", v)?,
                        None => defaults.cold_threshold,
                    },
                    reinforcement_boost: match d.reinforcement_boost {
                        Some(v) => unit_interval("decay.reinforcement_boost", v)?,
                        None => defaults.reinforcement_boost,
                    },
                    cold_policy: match d.cold_policy.as_deref() {
                        Some(p) => parse_field("decay.cold_policy", p)?,
                        None => defaults.cold_policy,
                    },
                }
            }
            None => DecayConfig::default(),
        };

        let compression = match &self.compression {
            Some(c) => {
                let defaults = CompressionConfig::default();
                CompressionConfig {
                    enabled: c.enabled.unwrap_or(defaults.enabled),
                    algorithm: match c.algorithm.as_deref() {
                        Some(a) => parse_field("compression.algorithm", a)?,
                        None => defaults.algorithm,
                    },
                    min_length: match c.min_length {
                        Some(n) => at_least_one("compression.min_length", n)?,
                        None => defaults.min_length,
                    },
                    reembed: c.reembed.unwrap_or(defaults.reembed),
                }
            }
            None => CompressionConfig::default(),
        };

        let reflection = match &self.reflection {
            Some(r) => {
                let defaults = ReflectionConfig::default();
                let similarity_threshold = match r.similarity_threshold {
                    Some(v) => unit_interval("reflection.similarity_threshold", v)?,
                    None => defaults.similarity_threshold,
                };
                ReflectionConfig {
                    enabled: r.enabled.unwrap_or(defaults.enabled),
                    interval: match r.interval_minutes {
                        Some(m) => positive_minutes("reflection.interval_minutes", m)?,
                        None => defaults.interval,
                    },
                    min_memories: match r.min_memories {
                        Some(n) => at_least_one("reflection.min_memories", n)?,
                        None => defaults.min_memories,
                    },
                    similarity_threshold,
                    min_cluster_size: match r.min_cluster_size {
                        Some(n) => at_least_one("reflection.min_cluster_size", n)?,
                        None => defaults.min_cluster_size,
                    },
                    min_activation: match r.min_activation {
                        Some(v) => unit_interval("reflection.min_activation", v)?,
                        None => defaults.min_activation,
                    },
                }
            }
            None => ReflectionConfig::default(),
        };

        let retrieval = match &self.retrieval {
            Some(r) => {
                let defaults = RetrievalConfig::default();
                RetrievalConfig {
                    default_limit: match r.default_limit {
                        Some(n) => at_least_one("retrieval.default_limit", n)?,
                        None => defaults.default_limit,
                    },
                    list_limit: match r.list_limit {
                        Some(n) => at_least_one("retrieval.list_limit", n)?,
                        None => defaults.list_limit,
                    },
                }
            }
            None => RetrievalConfig::default(),
        };

        let ingest = IngestConfig {
            deduplicate: self
                .ingest
                .as_ref()
                .and_then(|i| i.deduplicate)
                .unwrap_or(false),
        };

        let max_concurrent_embeddings = match self.max_concurrent_embeddings {
            Some(n) => at_least_one("max_concurrent_embeddings", n)?,
            None => DEFAULT_MAX_CONCURRENT_EMBEDDINGS,
        };

        Ok(EngineConfig {
            path,
            tier,
            embeddings,
            decay,
            compression,
            reflection,
            retrieval,
            ingest,
            max_concurrent_embeddings,
        })
    }
}

fn validate_embeddings(emb: &EmbeddingOptions, tier: Tier) -> MnemonResult<EmbeddingConfig> {
    let provider: EmbeddingProvider = match emb.provider.as_deref() {
        Some(p) => parse_field("embeddings.provider", p)?,
        None => {
            return Err(MnemonError::config(
                "embeddings.provider",
                "required (synthetic|openai|gemini|ollama)",
            ))
        }
    };

    let dimensions = match (emb.dimensions, tier.default_dimensions()) {
        (Some(0), _) => {
            return Err(MnemonError::config("embeddings.dimensions", "must be at least 1"))
        }
        (Some(d), _) => d,
        (None, Some(d)) => d,
        (None, None) => {
            return Err(MnemonError::config(
                "embeddings.dimensions",
                "required when tier is hybrid",
            ))
        }
    };

    let mode = match emb.mode.as_deref() {
        Some(m) => parse_field("embeddings.mode", m)?,
        None => EmbeddingMode::default(),
    };

    let api_key = emb.api_key.clone().filter(|k| !k.trim().is_empty());
    if provider.requires_api_key() && api_key.is_none() {
        return Err(MnemonError::config(
            "embeddings.api_key",
            format!("required for the {provider:?} provider"),
        ));
    }

    Ok(EmbeddingConfig {
        provider,
        dimensions,
        mode,
        model: emb.model.clone(),
        api_key,
        base_url: emb.base_url.clone(),
        chat_model: emb.chat_model.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: MnemonError) -> String {
        match err {
            MnemonError::Config { field, .. } => field,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_fields_are_named() {
        let mut opts = EngineOptions::new(":memory:", "fast", EmbeddingOptions::synthetic());
        opts.path = None;
        assert_eq!(field_of(opts.validate().unwrap_err()), "path");

        let mut opts = EngineOptions::new(":memory:", "fast", EmbeddingOptions::synthetic());
        opts.tier = None;
        assert_eq!(field_of(opts.validate().unwrap_err()), "tier");

        let mut opts = EngineOptions::new(":memory:", "fast", EmbeddingOptions::synthetic());
        opts.embeddings = None;
        assert_eq!(field_of(opts.validate().unwrap_err()), "embeddings");
    }

    #[test]
    fn test_tier_dimensions() {
        for (tier, dims) in [("fast", 256), ("smart", 384), ("deep", 1536)] {
            let cfg = EngineOptions::new("db", tier, EmbeddingOptions::synthetic())
                .validate()
                .unwrap();
            assert_eq!(cfg.embeddings.dimensions, dims);
        }
    }

    #[test]
    fn test_hybrid_requires_dimensions() {
        let opts = EngineOptions::new("db", "hybrid", EmbeddingOptions::synthetic());
        assert_eq!(field_of(opts.validate().unwrap_err()), "embeddings.dimensions");

        let mut emb = EmbeddingOptions::synthetic();
        emb.dimensions = Some(64);
        let cfg = EngineOptions::new("db", "hybrid", emb).validate().unwrap();
        assert_eq!(cfg.embeddings.dimensions, 64);
    }

    #[test]
    fn test_remote_provider_requires_key() {
        let emb = EmbeddingOptions {
            provider: Some("openai".to_string()),
            ..Default::default()
        };
        let opts = EngineOptions::new("db", "smart", emb);
        assert_eq!(field_of(opts.validate().unwrap_err()), "embeddings.api_key");

        let emb = EmbeddingOptions {
            provider: Some("ollama".to_string()),
            ..Default::default()
        };
        assert!(EngineOptions::new("db", "smart", emb).validate().is_ok());
    }

    #[test]
    fn test_unknown_values_rejected() {
        let opts = EngineOptions::new("db", "turbo", EmbeddingOptions::synthetic());
        assert_eq!(field_of(opts.validate().unwrap_err()), "tier");

        let mut opts = EngineOptions::new("db", "fast", EmbeddingOptions::synthetic());
        opts.decay = Some(DecayOptions {
            cold_threshold: Some(1.5),
            ..Default::default()
        });
        assert_eq!(field_of(opts.validate().unwrap_err()), "decay.cold_threshold");
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = EngineOptions::new("db", "smart", EmbeddingOptions::synthetic())
            .validate()
            .unwrap();
        assert!(cfg.decay.reinforce_on_query);
        assert_eq!(cfg.decay.cold_policy, ColdPolicy::Exclude);
        assert!(!cfg.compression.enabled);
        assert!(!cfg.reflection.enabled);
        assert_eq!(cfg.reflection.min_memories, 5);
        assert_eq!(cfg.retrieval.default_limit, 10);
        assert_eq!(cfg.embeddings.mode, EmbeddingMode::Simple);
        assert!(!cfg.ingest.deduplicate);
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
            path = "./data/memory.db"
            tier = "deep"

            [embeddings]
            provider = "synthetic"
            mode = "advanced"

            [decay]
            intervalMinutes = 5
            cold_policy = "delete"

            [compression]
            enabled = true
            algorithm = "syntactic"
            minLength = 200

            [reflection]
            enabled = true
            min_memories = 8

            [ingest]
            deduplicate = true
        "#;
        let cfg = EngineOptions::from_toml_str(text).unwrap().validate().unwrap();
        assert_eq!(cfg.tier, Tier::Deep);
        assert_eq!(cfg.embeddings.mode, EmbeddingMode::Advanced);
        assert_eq!(cfg.decay.interval, Duration::from_secs(300));
        assert_eq!(cfg.decay.cold_policy, ColdPolicy::Delete);
        assert_eq!(cfg.compression.algorithm, CompressionAlgorithm::Lexical);
        assert_eq!(cfg.compression.min_length, 200);
        assert_eq!(cfg.reflection.min_memories, 8);
        assert!(cfg.ingest.deduplicate);
    }

    #[test]
    fn test_interval_extremes_rejected() {
        for value in [1e300, f64::MAX, 1e-15, 1e-6] {
            let mut opts = EngineOptions::new("db", "fast", EmbeddingOptions::synthetic());
            opts.decay = Some(DecayOptions {
                interval_minutes: Some(value),
                ..Default::default()
            });
            assert_eq!(
                field_of(opts.validate().unwrap_err()),
                "decay.interval_minutes",
                "value {value}"
            );

            let mut opts = EngineOptions::new("db", "fast", EmbeddingOptions::synthetic());
            opts.reflection = Some(ReflectionOptions {
                interval_minutes: Some(value),
                ..Default::default()
            });
            assert_eq!(
                field_of(opts.validate().unwrap_err()),
                "reflection.interval_minutes",
                "value {value}"
            );
        }

        let mut opts = EngineOptions::new("db", "fast", EmbeddingOptions::synthetic());
        opts.decay = Some(DecayOptions {
            interval_minutes: Some(0.5),
            ..Default::default()
        });
        let cfg = opts.validate().unwrap();
        assert_eq!(cfg.decay.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_api_key_redacted_in_debug() {
        let emb = EmbeddingOptions {
            provider: Some("openai".to_string()),
            api_key: Some("sk-secret".to_string()),
            ..Default::default()
        };
        let cfg = EngineOptions::new("db", "smart", emb).validate().unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("sk-secret"));
    }
}
