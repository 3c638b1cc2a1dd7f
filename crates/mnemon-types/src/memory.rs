//! Memory record types: ids, sectors, records, retrieval options and maintenance reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Reserved metadata key holding compression provenance.
pub const COMPRESSION_META_KEY: &str = "_compression";

/// Reserved metadata key holding reflection provenance.
pub const REFLECTION_META_KEY: &str = "reflection";

/// Unique identifier for a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random MemoryId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MemoryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One of the five cognitive sectors a memory can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    /// Events and experiences anchored in time.
    Episodic,
    /// Facts and general knowledge.
    Semantic,
    /// How-to knowledge and step sequences.
    Procedural,
    /// Feelings and affect.
    Emotional,
    /// Meta-cognition and synthesized insights.
    Reflective,
}

impl Sector {
    /// Every sector, in canonical order.
    pub const ALL: [Sector; 5] = [
        Sector::Episodic,
        Sector::Semantic,
        Sector::Procedural,
        Sector::Emotional,
        Sector::Reflective,
    ];

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Sector::Episodic => "episodic",
            Sector::Semantic => "semantic",
            Sector::Procedural => "procedural",
            Sector::Emotional => "emotional",
            Sector::Reflective => "reflective",
        }
    }

    /// Default per-day decay rate for memories whose primary sector is this one.
    pub fn default_decay_lambda(&self) -> f64 {
        match self {
            Sector::Episodic => 0.015,
            Sector::Semantic => 0.005,
            Sector::Procedural => 0.008,
            Sector::Emotional => 0.02,
            Sector::Reflective => 0.001,
        }
    }
}

impl std::fmt::Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "episodic" => Ok(Sector::Episodic),
            "semantic" => Ok(Sector::Semantic),
            "procedural" => Ok(Sector::Procedural),
            "emotional" => Ok(Sector::Emotional),
            "reflective" => Ok(Sector::Reflective),
            other => Err(format!("unknown sector '{other}'")),
        }
    }
}

/// A single stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique ID.
    pub id: MemoryId,
    /// Owner of this memory. `None` is the shared, unscoped namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Textual content (possibly the compressed form).
    pub content: String,
    /// Sectors this memory belongs to. Never empty; the first entry is the primary sector.
    pub sectors: Vec<Sector>,
    /// Caller-supplied tags, sorted and deduplicated.
    pub tags: Vec<String>,
    /// Arbitrary metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// One vector per sector in `sectors`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub embeddings: HashMap<Sector, Vec<f32>>,
    /// When this memory was created.
    pub created_at: DateTime<Utc>,
    /// When this memory was last returned by a retrieval.
    pub last_accessed_at: DateTime<Utc>,
    /// Exponential decay rate per day.
    pub decay_lambda: f64,
    /// Current relevance weight (0.0 - 1.0).
    pub activation_score: f32,
    /// Whether `content` has been replaced by a compressed form.
    pub compressed: bool,
    /// Whether the score fell below the cold threshold.
    pub cold: bool,
    /// Source records of a synthesized reflection.
    pub derived_from: Option<Vec<MemoryId>>,
    /// When this memory last contributed to a reflection.
    pub reflected_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    /// The primary (first) sector.
    pub fn primary_sector(&self) -> Sector {
        self.sectors.first().copied().unwrap_or(Sector::Semantic)
    }

    /// Whether this record belongs to `sector`.
    pub fn has_sector(&self, sector: Sector) -> bool {
        self.sectors.contains(&sector)
    }
}

/// A record returned by a similarity query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecord {
    /// The matched record (reflecting any reinforcement applied by the query).
    pub record: MemoryRecord,
    /// Best cosine similarity over the sectors shared with the query.
    pub similarity: f32,
    /// Final rank key combining similarity and activation.
    pub rank: f32,
}

/// Options for adding a memory.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Owner of the new memory.
    pub user_id: Option<String>,
    /// Tags to attach.
    pub tags: Vec<String>,
    /// Metadata to attach. `sector`/`sectors` keys pin sectors.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Override the default decay rate.
    pub decay_lambda: Option<f64>,
}

impl AddOptions {
    /// Scope the memory to a user.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach tags.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attach one metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Override the decay rate.
    pub fn decay_lambda(mut self, lambda: f64) -> Self {
        self.decay_lambda = Some(lambda);
        self
    }
}

/// Options for a similarity query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Restrict the query to these sectors. Empty means all sectors.
    pub sectors: Vec<Sector>,
    /// Maximum results (engine default when unset).
    pub limit: Option<usize>,
    /// Skip records below this activation.
    pub min_activation: Option<f32>,
    /// Include records marked cold.
    pub include_cold: bool,
    /// Only records owned by this user.
    pub user_id: Option<String>,
}

impl QueryOptions {
    /// Restrict to a single sector.
    pub fn sector(sector: Sector) -> Self {
        Self {
            sectors: vec![sector],
            ..Default::default()
        }
    }

    /// Set the result limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Only match records owned by `user_id`.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Report from a decay tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecayReport {
    /// Records inspected.
    pub evaluated: u64,
    /// Records whose score was lowered.
    pub decayed: u64,
    /// Records newly marked cold.
    pub cold_marked: u64,
    /// Records physically deleted by the cold policy.
    pub deleted: u64,
    /// How long the tick took.
    pub duration_ms: u64,
}

/// Report from a reflection pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflectionReport {
    /// Eligible records found.
    pub eligible: u64,
    /// Clusters large enough to reflect on.
    pub clusters: u64,
    /// Reflective records created.
    pub created: Vec<MemoryId>,
    /// How long the pass took.
    pub duration_ms: u64,
}

/// Report from a compression maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionReport {
    /// Records inspected.
    pub evaluated: u64,
    /// Records compressed.
    pub compressed: u64,
    /// Characters saved in total.
    pub chars_saved: u64,
}
