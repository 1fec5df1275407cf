use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};

use kb_core::{
    Annotation, CartridgeState, DomainAxiom, Fact, FactId, FactStatus, PhantomRecord,
};

use crate::annotations::AnnotationLog;
use crate::error::{Result, StoreError};
use crate::schema;

pub const DB_FILE: &str = "cartridge.db";
pub const ANNOTATIONS_FILE: &str = "annotations.jsonl";
pub const GRAINS_DIR: &str = "grains";

/// On-disk side of one cartridge directory.
///
/// Layout:
/// ```text
/// <name>.kbc/
/// ├── cartridge.db
/// ├── annotations.jsonl
/// └── grains/<grain_id>.json
/// ```
pub struct Store {
    conn: Connection,
    dir: PathBuf,
    annotations: AnnotationLog,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join(GRAINS_DIR))?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn,
            dir: dir.to_path_buf(),
            annotations: AnnotationLog::new(&dir.join(ANNOTATIONS_FILE)),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn grains_dir(&self) -> PathBuf {
        self.dir.join(GRAINS_DIR)
    }

    pub fn annotations(&self) -> &AnnotationLog {
        &self.annotations
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        Ok(stmt.query_row([key], |row| row.get(0)).optional()?)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    pub fn get_metadata_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get_metadata(key)? {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|e| StoreError::InvalidData(format!("metadata {key}='{v}': {e}"))),
        }
    }

    // --- Facts ---

    /// Persist a new fact and its keyword rows in one transaction, followed
    /// by its annotation record.
    pub fn insert_fact<'a>(
        &self,
        fact: &Fact,
        annotation: &Annotation,
        tokens: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO facts (id, content_hash, content, status, access_count, created_at, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fact.id as i64,
                fact.content_hash,
                fact.content,
                fact.status.as_str(),
                fact.access_count as i64,
                fact.created_at as i64,
                fact.last_accessed.map(|t| t as i64),
            ],
        )?;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO keywords (token, fact_id) VALUES (?1, ?2)")?;
            for token in tokens {
                stmt.execute(params![token, fact.id as i64])?;
            }
        }
        // ids are never reused, even after a retracted insert
        let next = self.get_metadata_u64("next_fact_id")?.unwrap_or(1);
        set_metadata_on(&tx, "next_fact_id", &next.max(fact.id + 1).to_string())?;
        tx.commit()?;

        self.annotations.append(fact.id, annotation)
    }

    /// Remove a fact row and its keywords. Used to undo a failed insert.
    pub fn delete_fact(&self, id: FactId) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM keywords WHERE fact_id = ?1", [id as i64])?;
        tx.execute("DELETE FROM facts WHERE id = ?1", [id as i64])?;
        tx.commit()?;
        Ok(())
    }

    pub fn update_fact_status(&self, id: FactId, status: FactStatus) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE facts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id as i64],
        )?;
        if rows == 0 {
            return Err(StoreError::InvalidData(format!("fact not found: {id}")));
        }
        Ok(())
    }

    pub fn load_facts(&self) -> Result<Vec<Fact>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, content_hash, content, status, access_count, created_at, last_accessed
             FROM facts ORDER BY id",
        )?;
        let rows: Vec<(i64, String, String, String, i64, i64, Option<i64>)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(
                |(id, content_hash, content, status, access_count, created_at, last_accessed)| {
                    Ok(Fact {
                        id: id as u64,
                        content_hash,
                        content,
                        status: status.parse().map_err(StoreError::InvalidData)?,
                        access_count: access_count as u64,
                        created_at: created_at as u64,
                        last_accessed: last_accessed.map(|t| t as u64),
                    })
                },
            )
            .collect()
    }

    /// Annotation records by fact id. A torn record for a fact in
    /// `committed` is corruption rather than a tail to drop.
    pub fn load_annotations(
        &self,
        committed: &HashSet<FactId>,
    ) -> Result<HashMap<FactId, Annotation>> {
        self.annotations.load(|id| committed.contains(&id))
    }

    // --- Keyword index ---

    pub fn load_keywords(&self) -> Result<Vec<(String, FactId)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT token, fact_id FROM keywords ORDER BY token, fact_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    /// Replace the whole keyword table, e.g. after an index rebuild.
    pub fn replace_keywords<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, FactId)>,
    ) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM keywords", [])?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare("INSERT INTO keywords (token, fact_id) VALUES (?1, ?2)")?;
            for (token, id) in entries {
                stmt.execute(params![token, id as i64])?;
                count += 1;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    // --- Phantoms ---

    pub fn load_phantoms(&self) -> Result<Vec<PhantomRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM phantoms ORDER BY signature")?;
        let raw: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        raw.iter()
            .map(|r| serde_json::from_str(r).map_err(StoreError::from))
            .collect()
    }

    // --- Axioms ---

    /// Rewrite the axiom table in registration order.
    pub fn save_axioms(&self, axioms: &[DomainAxiom]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM axioms", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO axioms (name, concepts, position) VALUES (?1, ?2, ?3)")?;
            for (pos, axiom) in axioms.iter().enumerate() {
                stmt.execute(params![
                    axiom.name,
                    serde_json::to_string(&axiom.concepts)?,
                    pos as i64
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_axioms(&self) -> Result<Vec<DomainAxiom>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, concepts FROM axioms ORDER BY position")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter()
            .map(|(name, concepts)| {
                Ok(DomainAxiom {
                    name,
                    concepts: serde_json::from_str(&concepts)?,
                })
            })
            .collect()
    }

    // --- Checkpoint ---

    /// Write all mutable cartridge state in one transaction: phantom
    /// records, fact status and access counters, and the cycle counters.
    pub fn checkpoint(&self, state: &CartridgeState) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT OR REPLACE INTO phantoms (signature, status, hit_count, record)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for rec in state.tracker().iter() {
                upsert.execute(params![
                    rec.key.signature(),
                    rec.status.as_str(),
                    rec.hit_count as i64,
                    serde_json::to_string(rec)?,
                ])?;
            }

            let mut touch = tx.prepare(
                "UPDATE facts SET status = ?1, access_count = ?2, last_accessed = ?3 WHERE id = ?4",
            )?;
            for fact in state.facts().facts() {
                touch.execute(params![
                    fact.status.as_str(),
                    fact.access_count as i64,
                    fact.last_accessed.map(|t| t as i64),
                    fact.id as i64,
                ])?;
            }
        }
        set_metadata_on(&tx, "cycle", &state.current_cycle().to_string())?;
        set_metadata_on(&tx, "pending_queries", &state.pending_queries().to_string())?;
        tx.commit()?;
        Ok(())
    }
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}
