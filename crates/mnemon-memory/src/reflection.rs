//! Reflective consolidation.
//!
//! Groups related, still-active memories by vector similarity and writes one
//! reflective memory per sufficiently large group. Sources are never removed;
//! they are stamped with `reflected_at` in the same transaction that inserts
//! the reflection, and only become eligible again once reinforced after that.

use crate::compression::{extractive_summary, Summarizer};
use crate::decay::SCAN_BATCH_SIZE;
use crate::embedding::BoundedGateway;
use crate::store::{load_embeddings, record_from_row, store_err, RecordStore, SELECT_RECORD};
use crate::text::top_keywords;
use crate::vector::{cosine_similarity, mean};
use chrono::{DateTime, Utc};
use mnemon_types::config::ReflectionConfig;
use mnemon_types::error::MnemonResult;
use mnemon_types::memory::{
    MemoryId, MemoryRecord, ReflectionReport, Sector, REFLECTION_META_KEY,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keywords named in a reflection.
const REFLECTION_KEYWORDS: usize = 5;

/// Character budget for the summary part of a reflection.
const REFLECTION_SUMMARY_CHARS: usize = 280;

/// Tag attached to every synthesized reflection.
pub const REFLECTION_TAG: &str = "reflection";

/// A group of related memories owned by one user, and its running centroid.
#[derive(Debug)]
pub struct Cluster {
    pub members: Vec<MemoryRecord>,
    pub user_id: Option<String>,
    centroid: Vec<f32>,
}

impl Cluster {
    fn new(record: MemoryRecord, vector: Vec<f32>) -> Self {
        Self {
            user_id: record.user_id.clone(),
            members: vec![record],
            centroid: vector,
        }
    }

    fn add(&mut self, record: MemoryRecord, vector: &[f32]) {
        let n = self.members.len() as f32;
        for (c, v) in self.centroid.iter_mut().zip(vector) {
            *c = (*c * n + v) / (n + 1.0);
        }
        self.members.push(record);
    }

    pub fn ids(&self) -> Vec<MemoryId> {
        self.members.iter().map(|m| m.id).collect()
    }
}

/// Mean of a record's sector vectors, in canonical sector order.
pub fn record_vector(record: &MemoryRecord) -> Option<Vec<f32>> {
    let vectors: Vec<&[f32]> = Sector::ALL
        .iter()
        .filter_map(|s| record.embeddings.get(s).map(Vec::as_slice))
        .collect();
    mean(vectors)
}

/// Greedy single-pass clustering.
///
/// Records are visited in the given order; each joins the existing cluster
/// whose centroid it is most similar to, if that similarity reaches
/// `threshold`, and otherwise starts a new cluster. Records only join
/// clusters of the same owner. Records without vectors are ignored.
pub fn cluster(records: Vec<MemoryRecord>, threshold: f32) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();
    for record in records {
        let Some(vector) = record_vector(&record) else {
            continue;
        };
        let best = clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.user_id == record.user_id)
            .map(|(idx, c)| (idx, cosine_similarity(&c.centroid, &vector)))
            .filter(|(_, sim)| *sim >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
        match best {
            Some((idx, _)) => clusters[idx].add(record, &vector),
            None => clusters.push(Cluster::new(record, vector)),
        }
    }
    clusters
}

/// Reflection engine.
#[derive(Clone)]
pub struct ReflectionEngine {
    store: RecordStore,
    gateway: BoundedGateway,
    summarizer: Arc<dyn Summarizer>,
    config: ReflectionConfig,
}

impl ReflectionEngine {
    pub fn new(
        store: RecordStore,
        gateway: BoundedGateway,
        summarizer: Arc<dyn Summarizer>,
        config: ReflectionConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            summarizer,
            config,
        }
    }

    /// Records that may take part in a reflection, with their vectors.
    ///
    /// Eligible: not reflective, not cold, activation at or above the
    /// configured floor, and never reflected or reinforced since.
    pub fn eligible(&self, should_stop: &dyn Fn() -> bool) -> MnemonResult<Vec<MemoryRecord>> {
        let ids = self.store.ids()?;
        let mut eligible = Vec::new();
        for batch in ids.chunks(SCAN_BATCH_SIZE) {
            if should_stop() {
                break;
            }
            self.store.with_conn(|conn| {
                let placeholders: Vec<String> =
                    (0..batch.len()).map(|i| format!("?{}", i + 2)).collect();
                let sql = format!(
                    "{SELECT_RECORD}
                     WHERE id IN ({})
                       AND cold = 0
                       AND activation >= ?1
                       AND NOT EXISTS (SELECT 1 FROM json_each(memories.sectors) WHERE json_each.value = 'reflective')
                       AND (reflected_at IS NULL OR last_accessed_at > reflected_at)",
                    placeholders.join(", ")
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
                    vec![Box::new(self.config.min_activation as f64)];
                for id in batch {
                    params.push(Box::new(id.0.to_string()));
                }
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let mut stmt = conn.prepare(&sql).map_err(store_err)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), record_from_row)
                    .map_err(store_err)?;
                let mut found = Vec::new();
                for row in rows {
                    found.push(row.map_err(store_err)?);
                }
                drop(stmt);
                for mut record in found {
                    record.embeddings = load_embeddings(conn, record.id)?;
                    eligible.push(record);
                }
                Ok(())
            })?;
        }
        Ok(eligible)
    }

    /// Run one reflection pass as of `now`.
    pub async fn run(
        &self,
        now: DateTime<Utc>,
        should_stop: &(dyn Fn() -> bool + Sync),
    ) -> MnemonResult<ReflectionReport> {
        let start = std::time::Instant::now();
        let mut eligible = self.eligible(should_stop)?;
        let mut report = ReflectionReport {
            eligible: eligible.len() as u64,
            ..Default::default()
        };

        if eligible.len() < self.config.min_memories {
            debug!(
                eligible = eligible.len(),
                min_memories = self.config.min_memories,
                "Not enough eligible memories to reflect"
            );
            report.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(report);
        }

        // Strongest memories seed clusters.
        eligible.sort_by(|a, b| {
            b.activation_score
                .total_cmp(&a.activation_score)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let clusters: Vec<Cluster> = cluster(eligible, self.config.similarity_threshold)
            .into_iter()
            .filter(|c| c.members.len() >= self.config.min_cluster_size)
            .collect();
        report.clusters = clusters.len() as u64;

        for group in &clusters {
            if should_stop() {
                debug!("Reflection pass interrupted by shutdown");
                break;
            }
            let reflection = self.synthesize(group, now).await?;
            let sources = group.ids();
            let marked = self.store.insert_reflection(&reflection, &sources, now)?;
            info!(
                id = %reflection.id,
                sources = sources.len(),
                marked,
                "Created reflective memory"
            );
            report.created.push(reflection.id);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Build the reflective record for one cluster.
    async fn synthesize(&self, group: &Cluster, now: DateTime<Utc>) -> MnemonResult<MemoryRecord> {
        let texts: Vec<&str> = group.members.iter().map(|m| m.content.as_str()).collect();
        let keywords = top_keywords(texts.iter().copied(), REFLECTION_KEYWORDS);
        let joined = texts.join("\n");

        let summary = {
            let _permit = self.gateway.permit().await?;
            self.summarizer
                .summarize(&joined, REFLECTION_SUMMARY_CHARS)
                .await
        };
        let summary = match summary {
            Ok(s) if !s.trim().is_empty() => s,
            Ok(_) => extractive_summary(&joined, REFLECTION_SUMMARY_CHARS),
            Err(e) => {
                warn!(error = %e, "Reflection summarizer failed, using extractive summary");
                extractive_summary(&joined, REFLECTION_SUMMARY_CHARS)
            }
        };

        let theme = if keywords.is_empty() {
            "a shared theme".to_string()
        } else {
            keywords.join(", ")
        };
        let content = format!(
            "Pattern across {} related memories about {}: {}",
            group.members.len(),
            theme,
            summary.trim()
        );

        let sectors = [Sector::Reflective];
        let embeddings = self.gateway.embed(&content, &sectors, None).await?;

        let mut metadata = HashMap::new();
        metadata.insert(
            REFLECTION_META_KEY.to_string(),
            serde_json::json!({
                "cluster_size": group.members.len(),
                "keywords": keywords,
            }),
        );

        Ok(MemoryRecord {
            id: MemoryId::new(),
            content,
            sectors: sectors.to_vec(),
            tags: vec![REFLECTION_TAG.to_string()],
            metadata,
            embeddings,
            created_at: now,
            last_accessed_at: now,
            decay_lambda: Sector::Reflective.default_decay_lambda(),
            activation_score: 1.0,
            compressed: false,
            cold: false,
            derived_from: Some(group.ids()),
            user_id: group.user_id.clone(),
            reflected_at: None,
        })
    }
}
