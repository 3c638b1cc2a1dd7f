//! Sector classifier.
//!
//! Assigns content to one or more cognitive sectors from lexical cues, with
//! caller-pinned sectors taking precedence. Pure and deterministic: the same
//! content and hints always yield the same ordered sector list.

use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::memory::Sector;
use regex_lite::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Tag prefix that pins a sector (`sector:procedural`).
pub const SECTOR_TAG_PREFIX: &str = "sector:";

/// A secondary sector must score at least this fraction of the primary's score.
const SECONDARY_RATIO: f32 = 0.3;

/// Occurrences of one cue counted toward a sector score.
const MAX_CUE_HITS: usize = 3;

/// Caller-supplied hints that may pin sectors.
#[derive(Debug, Clone, Copy)]
pub struct Hints<'a> {
    pub tags: &'a [String],
    pub metadata: &'a HashMap<String, serde_json::Value>,
}

struct Cue {
    sector: Sector,
    weight: f32,
    pattern: Regex,
}

const CUE_TABLE: &[(Sector, f32, &str)] = &[
    // Temporal markers
    (
        Sector::Episodic,
        2.0,
        r"(?i)\b(yesterday|today|tonight|this (morning|afternoon|evening)|last (night|week|weekend|month|year|summer|winter)|\d+ (days?|weeks?|months?|years?) ago|when i was)\b",
    ),
    // First-person past experience
    (
        Sector::Episodic,
        1.5,
        r"(?i)\b(i|we) (went|visited|saw|met|had|did|made|bought|ate|drove|flew|travel+ed|remember(ed)?|attended|spent|walked|talked)\b",
    ),
    (
        Sector::Episodic,
        1.0,
        r"(?i)\bon (monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b",
    ),
    // Declarative facts and definitions
    (Sector::Semantic, 1.0, r"(?i)\b(is|are)\b"),
    (
        Sector::Semantic,
        1.5,
        r"(?i)\b(means|refers to|is defined as|defined as|consists of|is known as|capital of|is a type of|is a kind of)\b",
    ),
    (Sector::Semantic, 1.0, r"(?i)\b(fact|definition|always|never|every)\b"),
    // Numbered or bulleted steps
    (Sector::Procedural, 2.0, r"(?m)(^|\s)\d+[.)]\s"),
    (
        Sector::Procedural,
        1.0,
        r"(?i)\b(step|steps|first|then|next|finally|afterwards|how to|instructions?)\b",
    ),
    // Leading imperative verbs
    (
        Sector::Procedural,
        1.0,
        r"(?im)^\s*(heat|add|pour|open|close|run|install|click|mix|press|type|set|use|make|take|put|turn|stir|remove|insert|select|enter|configure|restart)\b",
    ),
    (Sector::Procedural, 1.0, r"(?i)\bto [a-z]+[^.:\n]*:"),
    // Affect
    (
        Sector::Emotional,
        1.5,
        r"(?i)\b(love[ds]?|loving|hate[ds]?|happy|sad|angry|afraid|scared|excited|frustrat\w*|anxious|worried|proud|grateful|disappoint\w*|upset|thrilled|lonely|furious|joy(ful)?|fear(ful)?|annoy\w*|delight\w*|miserable|nervous)\b",
    ),
    (Sector::Emotional, 1.0, r"(?i)\b(i feel|i felt|feeling)\b"),
    (Sector::Emotional, 0.5, r"!"),
    // Meta-cognition
    (
        Sector::Reflective,
        2.0,
        r"(?i)\b(i think|i realize|i realized|i believe|i wonder|i noticed|i learned|i'm learning|i am learning|lesson|insight|in hindsight|looking back|reflect\w*)\b",
    ),
    (Sector::Reflective, 1.0, r"(?i)\b(pattern|tend to|i should|next time)\b"),
];

fn cues() -> &'static [Cue] {
    static CUES: OnceLock<Vec<Cue>> = OnceLock::new();
    CUES.get_or_init(|| {
        CUE_TABLE
            .iter()
            .map(|(sector, weight, pattern)| Cue {
                sector: *sector,
                weight: *weight,
                pattern: Regex::new(pattern).expect("sector cue regex is valid"),
            })
            .collect()
    })
}

/// Score each sector by the cues present in `content`.
pub fn sector_scores(content: &str) -> HashMap<Sector, f32> {
    let mut scores = HashMap::new();
    for cue in cues() {
        let hits = cue.pattern.find_iter(content).take(MAX_CUE_HITS).count();
        if hits > 0 {
            *scores.entry(cue.sector).or_insert(0.0) += cue.weight * hits as f32;
        }
    }
    scores
}

/// Sectors pinned by the caller, in the order given.
///
/// Reads metadata `sector` (string), metadata `sectors` (array of strings)
/// and tags of the form `sector:<name>`. Unknown sector names are rejected.
pub fn pinned_sectors(hints: &Hints<'_>) -> MnemonResult<Vec<Sector>> {
    let mut names: Vec<&str> = Vec::new();
    match hints.metadata.get("sector") {
        Some(serde_json::Value::String(s)) => names.push(s),
        Some(serde_json::Value::Null) | None => {}
        Some(other) => {
            return Err(MnemonError::InvalidInput(format!(
                "metadata.sector must be a string, got {other}"
            )))
        }
    }
    match hints.metadata.get("sectors") {
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                let s = item.as_str().ok_or_else(|| {
                    MnemonError::InvalidInput(format!(
                        "metadata.sectors entries must be strings, got {item}"
                    ))
                })?;
                names.push(s);
            }
        }
        Some(serde_json::Value::Null) | None => {}
        Some(other) => {
            return Err(MnemonError::InvalidInput(format!(
                "metadata.sectors must be an array, got {other}"
            )))
        }
    }
    for tag in hints.tags {
        if let Some(name) = tag.strip_prefix(SECTOR_TAG_PREFIX) {
            names.push(name);
        }
    }

    let mut pinned = Vec::new();
    for name in names {
        let sector: Sector = name.parse().map_err(MnemonError::InvalidInput)?;
        if !pinned.contains(&sector) {
            pinned.push(sector);
        }
    }
    Ok(pinned)
}

/// Classify `content` into a non-empty, ordered sector list (primary first).
///
/// Pinned sectors come first. Heuristic sectors follow by descending cue
/// score; a secondary sector must reach a fraction of the strongest score.
/// With no cue and nothing pinned the result is `[semantic]`.
pub fn classify(content: &str, hints: &Hints<'_>) -> MnemonResult<Vec<Sector>> {
    let mut sectors = pinned_sectors(hints)?;

    let scores = sector_scores(content);
    let mut ranked: Vec<(Sector, f32)> = Sector::ALL
        .iter()
        .filter_map(|s| scores.get(s).map(|score| (*s, *score)))
        .collect();
    // Stable sort keeps canonical sector order on equal scores.
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    if let Some(&(_, top)) = ranked.first() {
        for (sector, score) in ranked {
            if score >= top * SECONDARY_RATIO && !sectors.contains(&sector) {
                sectors.push(sector);
            }
        }
    }

    if sectors.is_empty() {
        sectors.push(Sector::Semantic);
    }
    Ok(sectors)
}
