use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 2;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB instead of the default ~4MB
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Fold stale WAL data into the main file. In-memory and fresh
    // databases legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    // keywords carries no foreign key: a dangling entry must be loadable so
    // the index check can find it and trigger a rebuild.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS facts (
            id            INTEGER PRIMARY KEY,
            content_hash  TEXT NOT NULL UNIQUE,
            content       TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'active',
            access_count  INTEGER NOT NULL DEFAULT 0,
            created_at    INTEGER NOT NULL,
            last_accessed INTEGER
        );

        CREATE TABLE IF NOT EXISTS keywords (
            token   TEXT NOT NULL,
            fact_id INTEGER NOT NULL,
            PRIMARY KEY (token, fact_id)
        );

        CREATE TABLE IF NOT EXISTS phantoms (
            signature TEXT PRIMARY KEY,
            status    TEXT NOT NULL,
            hit_count INTEGER NOT NULL,
            record    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS axioms (
            name     TEXT PRIMARY KEY,
            concepts TEXT NOT NULL,
            position INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS grain_registry (
            grain_id       TEXT PRIMARY KEY,
            phantom_origin TEXT NOT NULL,
            axiom_link     TEXT NOT NULL,
            lock_state     TEXT NOT NULL,
            weight         REAL NOT NULL,
            created_cycle  INTEGER NOT NULL,
            supersedes     TEXT REFERENCES grain_registry(grain_id),
            validation_hash TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_kw_fact ON keywords(fact_id);
        CREATE INDEX IF NOT EXISTS idx_phantom_status ON phantoms(status);
        CREATE INDEX IF NOT EXISTS idx_grain_origin ON grain_registry(phantom_origin);
        ",
    )?;
    migrate(conn)?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Version 1 registries predate the stored validation hash.
fn migrate(conn: &Connection) -> Result<()> {
    let has_hash = conn
        .prepare("SELECT 1 FROM pragma_table_info('grain_registry') WHERE name = 'validation_hash'")?
        .exists([])?;
    if !has_hash {
        conn.execute_batch("ALTER TABLE grain_registry ADD COLUMN validation_hash TEXT;")?;
        tracing::info!("added validation_hash to grain_registry");
    }
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let Some(raw) = stmt
        .query_row([], |row| row.get::<_, String>(0))
        .optional()?
    else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|e| StoreError::InvalidData(format!("schema_version '{raw}': {e}")))
}
