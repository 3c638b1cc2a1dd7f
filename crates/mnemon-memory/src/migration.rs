//! SQLite schema creation and migration.
//!
//! Creates the tables needed by the record store on first open.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: memory records, decay bookkeeping, reflection provenance and
/// per-sector vectors.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            content TEXT NOT NULL,
            simhash TEXT NOT NULL DEFAULT '',
            primary_sector TEXT NOT NULL,
            sectors TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            last_accessed_at TEXT NOT NULL,
            decayed_at TEXT NOT NULL,
            decay_lambda REAL NOT NULL,
            activation REAL NOT NULL DEFAULT 1.0,
            compressed INTEGER NOT NULL DEFAULT 0,
            cold INTEGER NOT NULL DEFAULT 0,
            derived_from TEXT,
            reflected_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_memories_sector ON memories(primary_sector);
        CREATE INDEX IF NOT EXISTS idx_memories_activation ON memories(activation DESC, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id);
        CREATE INDEX IF NOT EXISTS idx_memories_simhash ON memories(simhash);

        CREATE TABLE IF NOT EXISTS vectors (
            id TEXT NOT NULL,
            sector TEXT NOT NULL,
            v BLOB NOT NULL,
            dim INTEGER NOT NULL,
            PRIMARY KEY (id, sector)
        );
        CREATE INDEX IF NOT EXISTS idx_vectors_sector ON vectors(sector);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        conn.prepare(&format!("PRAGMA table_info({table})"))
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_migrations_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert!(tables.contains(&"memories".to_string()));
        assert!(tables.contains(&"vectors".to_string()));
        let cols = columns(&conn, "memories");
        for col in ["user_id", "simhash", "decayed_at", "cold", "derived_from", "reflected_at"] {
            assert!(cols.iter().any(|c| c == col), "missing column {col}");
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }
}
