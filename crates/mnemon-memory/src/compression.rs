//! Content compression.
//!
//! Long memories can be replaced by a shorter form. The strategy is pluggable;
//! the built-in ones are lexical (filler and whitespace removal), semantic
//! (extractive summary by term salience, or any [`Summarizer`]), aggressive
//! (tighter summary followed by lexical cleanup) and auto.
//!
//! A compressed record keeps provenance under the `_compression` metadata key
//! but never the original text. Any failure, or a result that is not shorter,
//! leaves the record untouched.

use crate::text::{content_tokens, split_sentences, term_frequencies, truncate_chars};
use async_trait::async_trait;
use mnemon_types::config::{CompressionAlgorithm, CompressionConfig};
use mnemon_types::error::MnemonResult;
use mnemon_types::memory::{MemoryRecord, COMPRESSION_META_KEY};
use regex_lite::Regex;
use sha2::{Digest, Sha256};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Target size of a semantic summary, as a fraction of the input.
const SEMANTIC_RATIO: f64 = 0.5;

/// Target size of an aggressive summary, as a fraction of the input.
const AGGRESSIVE_RATIO: f64 = 0.25;

/// `auto` switches from lexical to semantic at this many characters.
const AUTO_SEMANTIC_THRESHOLD: usize = 1500;

/// Words dropped by lexical compression.
const FILLER_WORDS: &[&str] = &[
    "actually", "basically", "certainly", "definitely", "essentially", "honestly", "just",
    "literally", "obviously", "quite", "really", "simply", "totally", "very",
];

/// Produces a shorter text with the same meaning.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `text` in roughly `target_chars` characters.
    async fn summarize(&self, text: &str, target_chars: usize) -> MnemonResult<String>;
}

/// Offline extractive summarizer.
///
/// Scores sentences by the corpus frequency of their content words
/// (normalized by sentence length) and keeps the best ones, in their original
/// order, until the budget is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, text: &str, target_chars: usize) -> MnemonResult<String> {
        Ok(extractive_summary(text, target_chars))
    }
}

/// Extractive summary of `text` in at most `budget` characters.
pub fn extractive_summary(text: &str, budget: usize) -> String {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return String::new();
    }
    let freq = term_frequencies(sentences.iter().copied());

    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(idx, s)| {
            let tokens = content_tokens(s);
            if tokens.is_empty() {
                return (idx, 0.0);
            }
            let total: usize = tokens.iter().map(|t| freq.get(t).copied().unwrap_or(0)).sum();
            (idx, total as f64 / (tokens.len() as f64).sqrt())
        })
        .collect();
    // Earlier sentences win ties.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut chosen = Vec::new();
    let mut used = 0usize;
    for (idx, _) in &scored {
        let len = sentences[*idx].chars().count();
        let extra = if chosen.is_empty() { len } else { len + 1 };
        if used + extra <= budget {
            chosen.push(*idx);
            used += extra;
        }
    }

    if chosen.is_empty() {
        // Even the best sentence is over budget: cut it on a word boundary.
        let best = sentences[scored[0].0];
        let cut = truncate_chars(best, budget);
        let cut = match cut.rfind(char::is_whitespace) {
            Some(pos) if pos > 0 && cut.len() < best.len() => &cut[..pos],
            _ => cut,
        };
        return cut.trim().to_string();
    }

    chosen.sort_unstable();
    chosen
        .iter()
        .map(|idx| sentences[*idx])
        .collect::<Vec<_>>()
        .join(" ")
}

fn phrase_rewrites() -> &'static [(Regex, &'static str)] {
    static REWRITES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    REWRITES.get_or_init(|| {
        [
            (r"(?i)\bin order to\b", "to"),
            (r"(?i)\bdue to the fact that\b", "because"),
            (r"(?i)\bat this point in time\b", "now"),
            (r"(?i)\bin the event that\b", "if"),
            (r"(?i)\bfor the purpose of\b", "for"),
            (r"(?i)\b(kind|sort) of\b", ""),
        ]
        .into_iter()
        .map(|(p, r)| (Regex::new(p).expect("rewrite regex is valid"), r))
        .collect()
    })
}

/// Remove filler words, repeated words and redundant whitespace.
pub fn lexical_compress(text: &str) -> String {
    let mut rewritten = text.to_string();
    for (pattern, replacement) in phrase_rewrites() {
        rewritten = pattern.replace_all(&rewritten, *replacement).into_owned();
    }

    let mut out: Vec<&str> = Vec::new();
    let mut last_norm = String::new();
    for word in rewritten.split_whitespace() {
        let norm = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        let bare = word.chars().all(|c| c.is_alphanumeric());
        if bare && FILLER_WORDS.contains(&norm.as_str()) {
            continue;
        }
        if bare && !norm.is_empty() && norm == last_norm {
            continue;
        }
        last_norm = norm;
        out.push(word);
    }
    out.join(" ")
}

/// A way of shortening text.
#[async_trait]
pub trait CompressionStrategy: Send + Sync {
    /// Algorithm name recorded in provenance.
    fn algorithm(&self) -> CompressionAlgorithm;

    async fn compress(&self, text: &str) -> MnemonResult<String>;
}

/// Filler and whitespace removal.
pub struct LexicalStrategy;

#[async_trait]
impl CompressionStrategy for LexicalStrategy {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lexical
    }

    async fn compress(&self, text: &str) -> MnemonResult<String> {
        Ok(lexical_compress(text))
    }
}

/// Summarizer-backed summary at a fraction of the input length.
pub struct SummaryStrategy {
    summarizer: Arc<dyn Summarizer>,
    ratio: f64,
    algorithm: CompressionAlgorithm,
}

#[async_trait]
impl CompressionStrategy for SummaryStrategy {
    fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    async fn compress(&self, text: &str) -> MnemonResult<String> {
        let budget = ((text.chars().count() as f64) * self.ratio).ceil() as usize;
        let summary = self.summarizer.summarize(text, budget.max(1)).await?;
        if self.algorithm == CompressionAlgorithm::Aggressive {
            return Ok(lexical_compress(&summary));
        }
        Ok(summary)
    }
}

/// Lexical for moderate text, semantic for long text.
pub struct AutoStrategy {
    semantic: SummaryStrategy,
}

#[async_trait]
impl CompressionStrategy for AutoStrategy {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Auto
    }

    async fn compress(&self, text: &str) -> MnemonResult<String> {
        if text.chars().count() < AUTO_SEMANTIC_THRESHOLD {
            LexicalStrategy.compress(text).await
        } else {
            self.semantic.compress(text).await
        }
    }
}

/// Build the built-in strategy for `algorithm`.
pub fn strategy_for(
    algorithm: CompressionAlgorithm,
    summarizer: Arc<dyn Summarizer>,
) -> Arc<dyn CompressionStrategy> {
    let summary = |algorithm, ratio| SummaryStrategy {
        summarizer: summarizer.clone(),
        ratio,
        algorithm,
    };
    match algorithm {
        CompressionAlgorithm::Lexical => Arc::new(LexicalStrategy),
        CompressionAlgorithm::Semantic => {
            Arc::new(summary(CompressionAlgorithm::Semantic, SEMANTIC_RATIO))
        }
        CompressionAlgorithm::Aggressive => {
            Arc::new(summary(CompressionAlgorithm::Aggressive, AGGRESSIVE_RATIO))
        }
        CompressionAlgorithm::Auto => Arc::new(AutoStrategy {
            semantic: summary(CompressionAlgorithm::Semantic, SEMANTIC_RATIO),
        }),
    }
}

/// Hex SHA-256 of `text`.
pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Applies a compression strategy to records.
#[derive(Clone)]
pub struct Compressor {
    config: CompressionConfig,
    strategy: Arc<dyn CompressionStrategy>,
}

impl Compressor {
    pub fn new(config: CompressionConfig, strategy: Arc<dyn CompressionStrategy>) -> Self {
        Self { config, strategy }
    }

    /// Compressor using the built-in strategy for the configured algorithm.
    pub fn from_config(config: CompressionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        let strategy = strategy_for(config.algorithm, summarizer);
        Self::new(config, strategy)
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Whether `record` is long enough and not yet compressed.
    pub fn is_eligible(&self, record: &MemoryRecord) -> bool {
        !record.compressed && record.content.chars().count() >= self.config.min_length
    }

    /// Ingest-time compression: a no-op unless compression is enabled.
    pub async fn maybe_compress(&self, record: MemoryRecord) -> MemoryRecord {
        if !self.config.enabled {
            return record;
        }
        self.compress(record).await
    }

    /// Compress an eligible record, recording provenance.
    ///
    /// Never fails: on strategy error or a non-shrinking result the record
    /// comes back unchanged with `compressed = false`.
    pub async fn compress(&self, mut record: MemoryRecord) -> MemoryRecord {
        if !self.is_eligible(&record) {
            return record;
        }
        let original_len = record.content.chars().count();
        let compressed = match self.strategy.compress(&record.content).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!(id = %record.id, error = %e, "Compression failed, keeping original content");
                record.compressed = false;
                return record;
            }
        };
        let compressed_len = compressed.chars().count();
        if compressed.is_empty() || compressed_len >= original_len {
            debug!(id = %record.id, original_len, compressed_len, "Compression did not shrink content");
            record.compressed = false;
            return record;
        }

        record.metadata.insert(
            COMPRESSION_META_KEY.to_string(),
            serde_json::json!({
                "algorithm": self.strategy.algorithm().as_str(),
                "original_length": original_len,
                "compressed_length": compressed_len,
                "original_sha256": sha256_hex(&record.content),
            }),
        );
        record.content = compressed;
        record.compressed = true;
        debug!(id = %record.id, original_len, compressed_len, "Compressed memory content");
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mnemon_types::error::MnemonError;
    use mnemon_types::memory::{MemoryId, Sector};
    use std::collections::HashMap;

    const LONG_TEXT: &str = "Rust ownership rules govern memory. Each value in Rust has a single owner. \
        When the owner goes out of scope the value is dropped. Borrowing lets code use a value without owning it. \
        The weather was pleasant on the day I read about this. Rust ownership and borrowing prevent data races. \
        Lifetimes describe how long references to a value stay valid.";

    fn record(content: &str) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: MemoryId::new(),
            content: content.to_string(),
            sectors: vec![Sector::Semantic],
            tags: vec![],
            metadata: HashMap::new(),
            embeddings: HashMap::new(),
            created_at: now,
            last_accessed_at: now,
            decay_lambda: 0.005,
            activation_score: 1.0,
            compressed: false,
            cold: false,
            derived_from: None,
            user_id: None,
            reflected_at: None,
        }
    }

    fn compressor(algorithm: CompressionAlgorithm, min_length: usize) -> Compressor {
        Compressor::from_config(
            CompressionConfig {
                enabled: true,
                algorithm,
                min_length,
                reembed: false,
            },
            Arc::new(ExtractiveSummarizer),
        )
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _text: &str, _target: usize) -> MnemonResult<String> {
            Err(MnemonError::Provider("model offline".to_string()))
        }
    }

    struct EchoSummarizer;

    #[async_trait]
    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, text: &str, _target: usize) -> MnemonResult<String> {
            Ok(format!("{text} and more"))
        }
    }

    #[test]
    fn test_lexical_compress() {
        let out = lexical_compress("This is   really very  important, in order to   to succeed.");
        assert_eq!(out, "This is important, to succeed.");
    }

    #[test]
    fn test_extractive_summary_respects_budget() {
        let summary = extractive_summary(LONG_TEXT, 180);
        assert!(summary.chars().count() <= 180);
        assert!(summary.contains("Rust"));
        assert!(!summary.contains("weather"));
    }

    #[test]
    fn test_extractive_summary_cuts_single_long_sentence() {
        let summary = extractive_summary("alpha beta gamma delta epsilon zeta", 14);
        assert_eq!(summary, "alpha beta");
    }

    #[tokio::test]
    async fn test_semantic_compression_records_provenance() {
        let c = compressor(CompressionAlgorithm::Semantic, 100);
        let out = c.maybe_compress(record(LONG_TEXT)).await;
        assert!(out.compressed);
        assert!(out.content.chars().count() < LONG_TEXT.chars().count());
        let meta = &out.metadata[COMPRESSION_META_KEY];
        assert_eq!(meta["algorithm"], "semantic");
        assert_eq!(meta["original_length"], LONG_TEXT.chars().count());
        assert_eq!(meta["original_sha256"], sha256_hex(LONG_TEXT));
        assert!(!meta.to_string().contains("weather was pleasant"));
    }

    #[tokio::test]
    async fn test_short_or_disabled_is_untouched() {
        let c = compressor(CompressionAlgorithm::Semantic, 10_000);
        let out = c.maybe_compress(record(LONG_TEXT)).await;
        assert!(!out.compressed);
        assert_eq!(out.content, LONG_TEXT);

        let disabled = Compressor::from_config(
            CompressionConfig::default(),
            Arc::new(ExtractiveSummarizer),
        );
        let out = disabled.maybe_compress(record(LONG_TEXT)).await;
        assert!(!out.compressed);
    }

    #[tokio::test]
    async fn test_summarizer_failure_falls_back() {
        let config = CompressionConfig {
            enabled: true,
            min_length: 10,
            ..Default::default()
        };
        let c = Compressor::from_config(config, Arc::new(FailingSummarizer));
        let out = c.maybe_compress(record(LONG_TEXT)).await;
        assert!(!out.compressed);
        assert_eq!(out.content, LONG_TEXT);
        assert!(!out.metadata.contains_key(COMPRESSION_META_KEY));
    }

    #[tokio::test]
    async fn test_non_shrinking_result_is_discarded() {
        let config = CompressionConfig {
            enabled: true,
            min_length: 10,
            ..Default::default()
        };
        let c = Compressor::from_config(config, Arc::new(EchoSummarizer));
        let out = c.maybe_compress(record(LONG_TEXT)).await;
        assert!(!out.compressed);
        assert_eq!(out.content, LONG_TEXT);
    }

    #[tokio::test]
    async fn test_auto_uses_lexical_for_moderate_text() {
        let c = compressor(CompressionAlgorithm::Auto, 10);
        let out = c
            .maybe_compress(record("This is really very very important to know."))
            .await;
        assert!(out.compressed);
        assert_eq!(out.content, "This is important to know.");
        assert_eq!(out.metadata[COMPRESSION_META_KEY]["algorithm"], "auto");
    }

    #[tokio::test]
    async fn test_aggressive_is_tighter_than_semantic() {
        let semantic = compressor(CompressionAlgorithm::Semantic, 10)
            .maybe_compress(record(LONG_TEXT))
            .await;
        let aggressive = compressor(CompressionAlgorithm::Aggressive, 10)
            .maybe_compress(record(LONG_TEXT))
            .await;
        assert!(aggressive.content.chars().count() <= semantic.content.chars().count());
    }

    #[tokio::test]
    async fn test_already_compressed_is_skipped() {
        let c = compressor(CompressionAlgorithm::Lexical, 10);
        let mut r = record("This is really very important to know.");
        r.compressed = true;
        let out = c.compress(r).await;
        assert_eq!(out.content, "This is really very important to know.");
    }
}
