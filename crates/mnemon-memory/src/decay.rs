//! Activation decay.
//!
//! Each tick lowers every record's activation by
//! `score * exp(-lambda * days since decay origin)`, moves the origin to now,
//! and applies the cold policy to records that fall below the threshold.
//! The store is walked from an id snapshot in fixed-size batches so the
//! connection lock is released between batches.

use crate::store::{delete_record, parse_ts, store_err, ts, RecordStore};
use chrono::{DateTime, Utc};
use mnemon_types::config::{ColdPolicy, DecayConfig};
use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::memory::{DecayReport, MemoryId};
use rusqlite::OptionalExtension;
use tracing::{debug, info};

/// Records processed per lock acquisition.
pub const SCAN_BATCH_SIZE: usize = 256;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Exponential decay of `score` after `elapsed_days` at rate `lambda` (per day).
///
/// A zero (or negative) rate, or no elapsed time, leaves the score unchanged.
/// The result is always within [0, 1].
pub fn decayed_score(score: f32, lambda: f64, elapsed_days: f64) -> f32 {
    let score = score.clamp(0.0, 1.0);
    if lambda <= 0.0 || elapsed_days <= 0.0 || !elapsed_days.is_finite() {
        return score;
    }
    ((score as f64) * (-lambda * elapsed_days).exp()).clamp(0.0, 1.0) as f32
}

/// Fractional days between two instants (negative if `to` precedes `from`).
pub fn elapsed_days(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY
}

/// Decay engine.
#[derive(Clone)]
pub struct DecayEngine {
    store: RecordStore,
    config: DecayConfig,
}

enum Step {
    Skipped,
    Decayed { newly_cold: bool },
    Deleted,
}

impl DecayEngine {
    pub fn new(store: RecordStore, config: DecayConfig) -> Self {
        Self { store, config }
    }

    /// Run one decay tick as of `now`.
    ///
    /// `should_stop` is checked between batches; when it returns true the
    /// tick ends after the batch in progress.
    pub fn run(
        &self,
        now: DateTime<Utc>,
        should_stop: &dyn Fn() -> bool,
    ) -> MnemonResult<DecayReport> {
        let start = std::time::Instant::now();
        let ids = self.store.ids()?;
        let mut report = DecayReport::default();

        for batch in ids.chunks(SCAN_BATCH_SIZE) {
            if should_stop() {
                debug!(evaluated = report.evaluated, "Decay tick interrupted by shutdown");
                break;
            }
            self.run_batch(batch, now, &mut report)?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        if report.cold_marked > 0 || report.deleted > 0 {
            info!(
                evaluated = report.evaluated,
                decayed = report.decayed,
                cold_marked = report.cold_marked,
                deleted = report.deleted,
                "Decay tick retired records"
            );
        } else {
            debug!(
                evaluated = report.evaluated,
                decayed = report.decayed,
                duration_ms = report.duration_ms,
                "Decay tick complete"
            );
        }
        Ok(report)
    }

    fn run_batch(
        &self,
        batch: &[MemoryId],
        now: DateTime<Utc>,
        report: &mut DecayReport,
    ) -> MnemonResult<()> {
        let now_str = ts(&now);
        self.store.with_conn(|conn| {
            let tx = conn.transaction().map_err(store_err)?;
            for id in batch {
                match self.step(&tx, *id, now, &now_str)? {
                    None => {}
                    Some(step) => {
                        report.evaluated += 1;
                        match step {
                            Step::Skipped => {}
                            Step::Decayed { newly_cold } => {
                                report.decayed += 1;
                                if newly_cold {
                                    report.cold_marked += 1;
                                }
                            }
                            Step::Deleted => {
                                report.cold_marked += 1;
                                report.deleted += 1;
                            }
                        }
                    }
                }
            }
            tx.commit().map_err(store_err)?;
            Ok(())
        })
    }

    /// Decay one record. `None` means it was deleted since the snapshot.
    fn step(
        &self,
        conn: &rusqlite::Connection,
        id: MemoryId,
        now: DateTime<Utc>,
        now_str: &str,
    ) -> MnemonResult<Option<Step>> {
        let id_str = id.0.to_string();
        let row: Option<(f64, f64, String, i64)> = conn
            .query_row(
                "SELECT activation, decay_lambda, decayed_at, cold FROM memories WHERE id = ?1",
                rusqlite::params![id_str],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(store_err)?;
        let Some((activation, lambda, decayed_at, cold)) = row else {
            return Ok(None);
        };

        let decayed_at = parse_ts(&decayed_at).map_err(|e| {
            MnemonError::Store(format!("memory {id} has invalid decayed_at: {e}"))
        })?;
        let elapsed = elapsed_days(decayed_at, now);
        if lambda <= 0.0 || elapsed <= 0.0 {
            return Ok(Some(Step::Skipped));
        }

        let before = activation as f32;
        let after = decayed_score(before, lambda, elapsed);
        let is_cold = after < self.config.cold_threshold;

        if is_cold && self.config.cold_policy == ColdPolicy::Delete {
            delete_record(conn, id)?;
            return Ok(Some(Step::Deleted));
        }

        conn.execute(
            "UPDATE memories SET activation = ?1, decayed_at = ?2, cold = ?3 WHERE id = ?4",
            rusqlite::params![after as f64, now_str, is_cold as i64, id_str],
        )
        .map_err(store_err)?;

        Ok(Some(Step::Decayed {
            newly_cold: is_cold && cold == 0,
        }))
    }
}
