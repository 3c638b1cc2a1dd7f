//! Record store: durable memory records and their per-sector vectors.
//!
//! Records live in the `memories` table; every sector vector is a BLOB row in
//! `vectors` keyed by `(id, sector)`. All access goes through one SQLite
//! connection behind a mutex, so any single-record read-modify-write done
//! inside [`RecordStore::with_conn`] is atomic with respect to every other
//! store operation.

use crate::migration::run_migrations;
use crate::text::simhash_hex;
use crate::vector::{embedding_from_bytes, embedding_to_bytes};
use chrono::{DateTime, SecondsFormat, Utc};
use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::memory::{MemoryId, MemoryRecord, Sector};
use rusqlite::types::Type;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Column list matching [`record_from_row`].
pub(crate) const SELECT_RECORD: &str = "SELECT id, content, sectors, tags, metadata, created_at, last_accessed_at, decay_lambda, activation, compressed, cold, derived_from, reflected_at, user_id FROM memories";

/// Which records a scan should return.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Only records belonging to at least one of these sectors (empty = any).
    pub sectors: Vec<Sector>,
    /// Include records marked cold.
    pub include_cold: bool,
    /// Skip records below this activation.
    pub min_activation: Option<f32>,
    /// Load per-sector vectors too.
    pub with_embeddings: bool,
    /// Only records owned by this user.
    pub user_id: Option<String>,
}

/// SQLite-backed record store.
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl RecordStore {
    /// Open (or create) the store at `path`. `":memory:"` opens a private in-memory database.
    pub fn open(path: &str) -> MnemonResult<Self> {
        if path == ":memory:" {
            return Self::open_in_memory();
        }
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| MnemonError::Store(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| MnemonError::Store(e.to_string()))?;
        debug!(path, "Opened record store");
        Self::from_connection(conn)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> MnemonResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| MnemonError::Store(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> MnemonResult<Self> {
        run_migrations(&conn).map_err(|e| MnemonError::Store(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> MnemonResult<T>,
    ) -> MnemonResult<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| MnemonError::Internal(e.to_string()))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| MnemonError::Store("record store is closed".to_string()))?;
        f(conn)
    }

    /// Release the underlying connection. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        match self.conn.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(poisoned) => poisoned.into_inner().take().is_some(),
        }
    }

    /// Whether [`RecordStore::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.conn.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Insert a new record with its vectors.
    pub fn insert(&self, record: &MemoryRecord) -> MnemonResult<()> {
        self.insert_with_source(record, &record.content)
    }

    /// Insert a new record whose duplicate key is taken from `source`, the
    /// content as ingested before any compression.
    pub fn insert_with_source(&self, record: &MemoryRecord, source: &str) -> MnemonResult<()> {
        check_record(record)?;
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(store_err)?;
            insert_record(&tx, record, source)?;
            tx.commit().map_err(store_err)?;
            Ok(())
        })
    }

    /// Fetch one record with its vectors.
    pub fn get(&self, id: MemoryId) -> MnemonResult<Option<MemoryRecord>> {
        self.with_conn(|conn| {
            let sql = format!("{SELECT_RECORD} WHERE id = ?1");
            let mut stmt = conn.prepare(&sql).map_err(store_err)?;
            let mut rows = stmt
                .query_map(rusqlite::params![id.0.to_string()], record_from_row)
                .map_err(store_err)?;
            let Some(row) = rows.next() else {
                return Ok(None);
            };
            let mut record = row.map_err(store_err)?;
            record.embeddings = load_embeddings(conn, id)?;
            Ok(Some(record))
        })
    }

    /// Delete a record and its vectors. Returns `false` if the id was unknown.
    pub fn delete(&self, id: MemoryId) -> MnemonResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(store_err)?;
            let removed = delete_record(&tx, id)?;
            tx.commit().map_err(store_err)?;
            Ok(removed)
        })
    }

    /// Number of stored records.
    pub fn count(&self) -> MnemonResult<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
                .map_err(store_err)?;
            Ok(n as u64)
        })
    }

    /// Snapshot of every record id, for batched store-wide passes.
    pub fn ids(&self) -> MnemonResult<Vec<MemoryId>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM memories ORDER BY created_at, id")
                .map_err(store_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(store_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(parse_id(&row.map_err(store_err)?)?);
            }
            Ok(ids)
        })
    }

    /// Records ordered by activation (desc) then creation time (desc).
    pub fn list(
        &self,
        filter: &ScanFilter,
        limit: usize,
        offset: usize,
    ) -> MnemonResult<Vec<MemoryRecord>> {
        self.select(filter, Some((limit, offset)))
    }

    /// Every record matching `filter`, in listing order.
    pub fn scan(&self, filter: &ScanFilter) -> MnemonResult<Vec<MemoryRecord>> {
        self.select(filter, None)
    }

    fn select(
        &self,
        filter: &ScanFilter,
        page: Option<(usize, usize)>,
    ) -> MnemonResult<Vec<MemoryRecord>> {
        self.with_conn(|conn| {
            let mut sql = format!("{SELECT_RECORD} WHERE 1 = 1");
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            let mut param_idx = 1;

            if !filter.sectors.is_empty() {
                let placeholders: Vec<String> = filter
                    .sectors
                    .iter()
                    .map(|s| {
                        params.push(Box::new(s.as_str().to_string()));
                        let p = format!("?{param_idx}");
                        param_idx += 1;
                        p
                    })
                    .collect();
                sql.push_str(&format!(
                    " AND EXISTS (SELECT 1 FROM json_each(memories.sectors) WHERE json_each.value IN ({}))",
                    placeholders.join(", ")
                ));
            }
            if !filter.include_cold {
                sql.push_str(" AND cold = 0");
            }
            if let Some(user_id) = &filter.user_id {
                sql.push_str(&format!(" AND user_id = ?{param_idx}"));
                params.push(Box::new(user_id.clone()));
                param_idx += 1;
            }
            if let Some(min) = filter.min_activation {
                sql.push_str(&format!(" AND activation >= ?{param_idx}"));
                params.push(Box::new(min as f64));
                param_idx += 1;
            }

            sql.push_str(" ORDER BY activation DESC, created_at DESC, id");
            if let Some((limit, offset)) = page {
                sql.push_str(&format!(" LIMIT ?{param_idx} OFFSET ?{}", param_idx + 1));
                params.push(Box::new(limit as i64));
                params.push(Box::new(offset as i64));
            }

            let mut stmt = conn.prepare(&sql).map_err(store_err)?;
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), record_from_row)
                .map_err(store_err)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(store_err)?);
            }
            drop(stmt);

            if filter.with_embeddings {
                for record in records.iter_mut() {
                    record.embeddings = load_embeddings(conn, record.id)?;
                }
            }
            Ok(records)
        })
    }

    /// The strongest record owned by `user_id` whose content has the same
    /// simhash as `content`.
    pub fn find_duplicate(
        &self,
        content: &str,
        user_id: Option<&str>,
    ) -> MnemonResult<Option<MemoryId>> {
        let hash = simhash_hex(content);
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id FROM memories
                     WHERE simhash = ?1 AND user_id IS ?2
                     ORDER BY activation DESC, created_at DESC, id
                     LIMIT 1",
                )
                .map_err(store_err)?;
            let mut rows = stmt
                .query_map(rusqlite::params![hash, user_id], |row| row.get::<_, String>(0))
                .map_err(store_err)?;
            match rows.next() {
                Some(row) => Ok(Some(parse_id(&row.map_err(store_err)?)?)),
                None => Ok(None),
            }
        })
    }

    /// Reinforce records returned by a retrieval:
    /// `activation <- min(1, activation + boost)`, access time and decay origin set to `now`.
    ///
    /// Each update is a single statement under the connection lock, so it
    /// cannot interleave with a decay step on the same record. Returns the
    /// post-update activation of every id that still exists.
    pub fn reinforce(
        &self,
        ids: &[MemoryId],
        boost: f32,
        cold_threshold: f32,
        now: DateTime<Utc>,
    ) -> MnemonResult<HashMap<MemoryId, f32>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let now_str = ts(&now);
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(store_err)?;
            let mut updated = HashMap::new();
            {
                let mut upd = tx
                    .prepare(
                        "UPDATE memories
                         SET activation = MIN(1.0, MAX(0.0, activation + ?1)),
                             last_accessed_at = ?2,
                             decayed_at = ?2,
                             cold = CASE WHEN MIN(1.0, activation + ?1) < ?3 THEN 1 ELSE 0 END
                         WHERE id = ?4",
                    )
                    .map_err(store_err)?;
                let mut read = tx
                    .prepare("SELECT activation FROM memories WHERE id = ?1")
                    .map_err(store_err)?;
                for id in ids {
                    let id_str = id.0.to_string();
                    let changed = upd
                        .execute(rusqlite::params![
                            boost as f64,
                            now_str,
                            cold_threshold as f64,
                            id_str
                        ])
                        .map_err(store_err)?;
                    if changed == 0 {
                        continue;
                    }
                    let score: f64 = read
                        .query_row(rusqlite::params![id_str], |row| row.get(0))
                        .map_err(store_err)?;
                    updated.insert(*id, score as f32);
                }
            }
            tx.commit().map_err(store_err)?;
            Ok(updated)
        })
    }

    /// Replace a record's content with its compressed form.
    ///
    /// `embeddings` replaces the stored vectors when re-embedding is enabled.
    /// Returns `false` if the record no longer exists.
    pub fn update_compressed(
        &self,
        id: MemoryId,
        content: &str,
        metadata: &HashMap<String, serde_json::Value>,
        embeddings: Option<&HashMap<Sector, Vec<f32>>>,
    ) -> MnemonResult<bool> {
        let meta_str = to_json(metadata)?;
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(store_err)?;
            let changed = tx
                .execute(
                    "UPDATE memories SET content = ?1, metadata = ?2, compressed = 1 WHERE id = ?3",
                    rusqlite::params![content, meta_str, id.0.to_string()],
                )
                .map_err(store_err)?;
            if changed > 0 {
                if let Some(vectors) = embeddings {
                    for (sector, v) in vectors {
                        upsert_vector(&tx, id, *sector, v)?;
                    }
                }
            }
            tx.commit().map_err(store_err)?;
            Ok(changed > 0)
        })
    }

    /// Insert a synthesized reflection and mark its source records as reflected,
    /// in one transaction. Returns how many source records were marked.
    pub fn insert_reflection(
        &self,
        reflection: &MemoryRecord,
        sources: &[MemoryId],
        at: DateTime<Utc>,
    ) -> MnemonResult<u64> {
        check_record(reflection)?;
        let at_str = ts(&at);
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(store_err)?;
            insert_record(&tx, reflection, &reflection.content)?;
            let mut marked = 0u64;
            for id in sources {
                marked += tx
                    .execute(
                        "UPDATE memories SET reflected_at = ?1 WHERE id = ?2",
                        rusqlite::params![at_str, id.0.to_string()],
                    )
                    .map_err(store_err)? as u64;
            }
            tx.commit().map_err(store_err)?;
            Ok(marked)
        })
    }
}

// ---------------------------------------------------------------------------
// Row helpers shared with the decay and reflection passes
// ---------------------------------------------------------------------------

pub(crate) fn store_err(e: rusqlite::Error) -> MnemonError {
    MnemonError::Store(e.to_string())
}

/// Canonical timestamp encoding. Fixed precision keeps text comparisons ordered.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_id(s: &str) -> MnemonResult<MemoryId> {
    uuid::Uuid::parse_str(s)
        .map(MemoryId)
        .map_err(|e| MnemonError::Store(e.to_string()))
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Decode a row selected with [`SELECT_RECORD`]. Vectors are not loaded.
pub(crate) fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let id_str: String = row.get(0)?;
    let content: String = row.get(1)?;
    let sectors_str: String = row.get(2)?;
    let tags_str: String = row.get(3)?;
    let meta_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let accessed_str: String = row.get(6)?;
    let decay_lambda: f64 = row.get(7)?;
    let activation: f64 = row.get(8)?;
    let compressed: i64 = row.get(9)?;
    let cold: i64 = row.get(10)?;
    let derived_str: Option<String> = row.get(11)?;
    let reflected_str: Option<String> = row.get(12)?;
    let user_id: Option<String> = row.get(13)?;

    let id = uuid::Uuid::parse_str(&id_str)
        .map(MemoryId)
        .map_err(|e| conversion_err(0, e))?;
    let mut sectors: Vec<Sector> = serde_json::from_str(&sectors_str).unwrap_or_default();
    if sectors.is_empty() {
        sectors.push(Sector::Semantic);
    }
    let derived_from = match derived_str {
        Some(s) => Some(serde_json::from_str::<Vec<MemoryId>>(&s).map_err(|e| conversion_err(11, e))?),
        None => None,
    };
    let created_at = parse_ts(&created_str).map_err(|e| conversion_err(5, e))?;
    let last_accessed_at = parse_ts(&accessed_str).map_err(|e| conversion_err(6, e))?;
    let reflected_at = match reflected_str {
        Some(s) => Some(parse_ts(&s).map_err(|e| conversion_err(12, e))?),
        None => None,
    };

    Ok(MemoryRecord {
        id,
        user_id,
        content,
        sectors,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        metadata: serde_json::from_str(&meta_str).unwrap_or_default(),
        embeddings: HashMap::new(),
        created_at,
        last_accessed_at,
        decay_lambda,
        activation_score: (activation as f32).clamp(0.0, 1.0),
        compressed: compressed != 0,
        cold: cold != 0,
        derived_from,
        reflected_at,
    })
}

/// Load every sector vector stored for `id`.
pub(crate) fn load_embeddings(
    conn: &Connection,
    id: MemoryId,
) -> MnemonResult<HashMap<Sector, Vec<f32>>> {
    let mut stmt = conn
        .prepare_cached("SELECT sector, v FROM vectors WHERE id = ?1")
        .map_err(store_err)?;
    let rows = stmt
        .query_map(rusqlite::params![id.0.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map_err(store_err)?;
    let mut out = HashMap::new();
    for row in rows {
        let (sector_str, bytes) = row.map_err(store_err)?;
        if let Ok(sector) = sector_str.parse::<Sector>() {
            out.insert(sector, embedding_from_bytes(&bytes));
        }
    }
    Ok(out)
}

pub(crate) fn delete_record(conn: &Connection, id: MemoryId) -> MnemonResult<bool> {
    let id_str = id.0.to_string();
    let removed = conn
        .execute("DELETE FROM memories WHERE id = ?1", rusqlite::params![id_str])
        .map_err(store_err)?;
    conn.execute("DELETE FROM vectors WHERE id = ?1", rusqlite::params![id_str])
        .map_err(store_err)?;
    Ok(removed > 0)
}

fn insert_record(conn: &Connection, record: &MemoryRecord, source: &str) -> MnemonResult<()> {
    let sectors_str = to_json(&record.sectors)?;
    let tags_str = to_json(&record.tags)?;
    let meta_str = to_json(&record.metadata)?;
    let derived_str = match &record.derived_from {
        Some(ids) => Some(to_json(ids)?),
        None => None,
    };
    let created = ts(&record.created_at);
    let accessed = ts(&record.last_accessed_at);

    conn.execute(
        "INSERT INTO memories (id, content, primary_sector, sectors, tags, metadata, created_at, last_accessed_at, decayed_at, decay_lambda, activation, compressed, cold, derived_from, reflected_at, user_id, simhash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        rusqlite::params![
            record.id.0.to_string(),
            record.content,
            record.primary_sector().as_str(),
            sectors_str,
            tags_str,
            meta_str,
            created,
            accessed,
            record.decay_lambda,
            record.activation_score as f64,
            record.compressed as i64,
            record.cold as i64,
            derived_str,
            record.reflected_at.as_ref().map(ts),
            record.user_id,
            simhash_hex(source),
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MnemonError::Invariant(format!("duplicate memory id {}", record.id))
        }
        other => store_err(other),
    })?;

    for (sector, v) in &record.embeddings {
        upsert_vector(conn, record.id, *sector, v)?;
    }
    Ok(())
}

fn upsert_vector(conn: &Connection, id: MemoryId, sector: Sector, v: &[f32]) -> MnemonResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO vectors (id, sector, v, dim) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            id.0.to_string(),
            sector.as_str(),
            embedding_to_bytes(v),
            v.len() as i64
        ],
    )
    .map_err(store_err)?;
    Ok(())
}

/// Reject records that break the data model invariants.
fn check_record(record: &MemoryRecord) -> MnemonResult<()> {
    if record.sectors.is_empty() {
        return Err(MnemonError::Invariant(format!(
            "memory {} has no sectors",
            record.id
        )));
    }
    if let Some(sector) = record
        .embeddings
        .keys()
        .find(|s| !record.sectors.contains(s))
    {
        return Err(MnemonError::Invariant(format!(
            "memory {} has a {sector} vector but is not in that sector",
            record.id
        )));
    }
    if !(0.0..=1.0).contains(&record.activation_score) {
        return Err(MnemonError::Invariant(format!(
            "memory {} activation {} outside [0, 1]",
            record.id, record.activation_score
        )));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> MnemonResult<String> {
    serde_json::to_string(value).map_err(|e| MnemonError::Serialization(e.to_string()))
}
