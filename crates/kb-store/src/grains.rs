//! Grain persistence: one JSON file per grain plus a registry table.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use rusqlite::{OptionalExtension, params};

use kb_core::{Grain, GrainSummary, KbError, LockState, Missing};

use crate::error::{Result, StoreError};
use crate::store::Store;

impl Store {
    fn grain_path(&self, grain_id: &str) -> PathBuf {
        self.grains_dir().join(format!("{grain_id}.json"))
    }

    /// Persist a grain. Append-only and idempotent.
    ///
    /// Saving a grain id that already exists, or a second grain for the same
    /// phantom origin without a `supersedes` link, returns the stored grain
    /// unchanged. A `supersedes` link must name an existing grain.
    pub fn save_grain(&self, grain: &Grain) -> Result<Grain> {
        if self.has_grain(&grain.grain_id)? {
            return self.load_grain(&grain.grain_id);
        }
        match &grain.supersedes {
            None => {
                if let Some(existing) = self.grain_for_origin(&grain.phantom_origin)? {
                    return self.load_grain(&existing);
                }
            }
            Some(prev) => {
                if !self.has_grain(prev)? {
                    return Err(KbError::NotFound(Missing::Grain(prev.clone())).into());
                }
            }
        }

        // file first: a registry row always points at a complete file
        let path = self.grain_path(&grain.grain_id);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(grain)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        self.conn().execute(
            "INSERT INTO grain_registry
               (grain_id, phantom_origin, axiom_link, lock_state, weight, created_cycle,
                supersedes, validation_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                grain.grain_id,
                grain.phantom_origin,
                grain.axiom_link,
                grain.lock_state.as_str(),
                grain.weight,
                grain.created_cycle as i64,
                grain.supersedes,
                grain.validation_hash,
            ],
        )?;
        Ok(grain.clone())
    }

    pub fn has_grain(&self, grain_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM grain_registry WHERE grain_id = ?1",
                [grain_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Newest grain crystallized from `phantom_origin`, if any.
    pub fn grain_for_origin(&self, phantom_origin: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT grain_id FROM grain_registry WHERE phantom_origin = ?1
                 ORDER BY rowid DESC LIMIT 1",
                [phantom_origin],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Read a grain file and check it against its registry row.
    ///
    /// The file must carry the registered id, origin, and validation hash;
    /// anything else means it was edited or swapped after it was written.
    pub fn load_grain(&self, grain_id: &str) -> Result<Grain> {
        let row: Option<(String, Option<String>)> = self
            .conn()
            .query_row(
                "SELECT phantom_origin, validation_hash FROM grain_registry WHERE grain_id = ?1",
                [grain_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((origin, hash)) = row else {
            return Err(KbError::NotFound(Missing::Grain(grain_id.to_string())).into());
        };
        let path = self.grain_path(grain_id);
        let json = fs::read_to_string(&path).map_err(|e| {
            StoreError::InvalidData(format!("grain file {}: {e}", path.display()))
        })?;
        let grain: Grain = serde_json::from_str(&json)?;

        let mismatch = if grain.grain_id != grain_id {
            Some("grain_id")
        } else if grain.phantom_origin != origin {
            Some("phantom_origin")
        } else if hash.is_some_and(|h| h != grain.validation_hash) {
            Some("validation_hash")
        } else {
            None
        };
        if let Some(field) = mismatch {
            return Err(StoreError::InvalidData(format!(
                "grain file {} does not match its registry row ({field})",
                path.display()
            )));
        }
        Ok(grain)
    }

    /// Every registered grain, oldest first.
    pub fn load_grains(&self) -> Result<Vec<Grain>> {
        self.grain_summaries()?
            .iter()
            .map(|s| self.load_grain(&s.grain_id))
            .collect()
    }

    /// Registry rows only; no grain files are read.
    pub fn grain_summaries(&self) -> Result<Vec<GrainSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT grain_id, phantom_origin, axiom_link, lock_state, weight, created_cycle, supersedes
             FROM grain_registry ORDER BY rowid",
        )?;
        let rows: Vec<(String, String, String, String, f64, i64, Option<String>)> = stmt
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
                |(grain_id, phantom_origin, axiom_link, lock_state, weight, created_cycle, supersedes)| {
                    Ok(GrainSummary {
                        grain_id,
                        phantom_origin,
                        axiom_link,
                        lock_state: parse_lock_state(&lock_state)?,
                        weight,
                        created_cycle: created_cycle as u64,
                        supersedes,
                    })
                },
            )
            .collect()
    }

    pub fn grain_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM grain_registry", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn parse_lock_state(s: &str) -> Result<LockState> {
    match s {
        "validated" => Ok(LockState::Validated),
        other => Err(StoreError::InvalidData(format!("unknown lock state '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use kb_core::TernaryDelta;
    use tempfile::TempDir;

    fn open() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("materials.kbc")).unwrap();
        (dir, store)
    }

    fn grain(id: &str, origin: &str) -> Grain {
        let mut delta = TernaryDelta::default();
        delta.pos.insert("temperature".into());
        delta.neg.insert("cold storage".into());
        Grain {
            grain_id: id.to_string(),
            cartridge_source: "materials".into(),
            phantom_origin: origin.to_string(),
            axiom_link: "thermal".into(),
            weight: 1.1,
            delta,
            lock_state: LockState::Validated,
            pointer_map: BTreeMap::new(),
            cycle_count: 51,
            created_cycle: 52,
            hit_count: 58,
            confidence: 0.9,
            supersedes: None,
            validation_hash: "ab".repeat(32),
        }
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, store) = open();
        let g = grain("a1", "fact:1");
        assert_eq!(store.save_grain(&g).unwrap(), g);
        assert_eq!(store.load_grain("a1").unwrap(), g);
        assert!(store.grains_dir().join("a1.json").exists());
        assert!(!store.grains_dir().join("a1.json.tmp").exists());

        let summaries = store.grain_summaries().unwrap();
        assert_eq!(summaries, vec![g.summary()]);
    }

    #[test]
    fn test_save_is_idempotent() {
        let (_dir, store) = open();
        let g = grain("a1", "fact:1");
        store.save_grain(&g).unwrap();
        let mut again = g.clone();
        again.weight = 9.0;
        assert_eq!(store.save_grain(&again).unwrap().weight, 1.1);
        assert_eq!(store.grain_count().unwrap(), 1);
    }

    #[test]
    fn test_same_origin_returns_existing() {
        let (_dir, store) = open();
        store.save_grain(&grain("a1", "fact:1")).unwrap();
        let second = store.save_grain(&grain("b2", "fact:1")).unwrap();
        assert_eq!(second.grain_id, "a1");
        assert_eq!(store.grain_count().unwrap(), 1);
    }

    #[test]
    fn test_supersedes_appends() {
        let (_dir, store) = open();
        store.save_grain(&grain("a1", "fact:1")).unwrap();
        let mut next = grain("b2", "fact:1");
        next.supersedes = Some("a1".into());
        assert_eq!(store.save_grain(&next).unwrap().grain_id, "b2");
        assert_eq!(store.grain_count().unwrap(), 2);
        assert_eq!(store.grain_for_origin("fact:1").unwrap().as_deref(), Some("b2"));
        // first grain is untouched
        assert_eq!(store.load_grain("a1").unwrap().supersedes, None);
    }

    #[test]
    fn test_supersedes_must_exist() {
        let (_dir, store) = open();
        let mut g = grain("b2", "fact:1");
        g.supersedes = Some("ghost".into());
        assert!(matches!(
            store.save_grain(&g),
            Err(StoreError::Core(KbError::NotFound(Missing::Grain(_))))
        ));
        assert_eq!(store.grain_count().unwrap(), 0);
    }

    #[test]
    fn test_edited_grain_file_rejected() {
        let (_dir, store) = open();
        let g = grain("a1", "fact:1");
        store.save_grain(&g).unwrap();

        let mut edited = g.clone();
        edited.validation_hash = "cd".repeat(32);
        edited.weight = 9.0;
        let path = store.grains_dir().join("a1.json");
        fs::write(&path, serde_json::to_string(&edited).unwrap()).unwrap();
        assert!(matches!(store.load_grain("a1"), Err(StoreError::InvalidData(_))));

        // a file swapped in from another origin is caught too
        fs::write(&path, serde_json::to_string(&grain("a1", "fact:9")).unwrap()).unwrap();
        assert!(matches!(store.load_grain("a1"), Err(StoreError::InvalidData(_))));
        assert!(store.load_grains().is_err());
    }

    #[test]
    fn test_load_missing_grain() {
        let (_dir, store) = open();
        assert!(matches!(
            store.load_grain("nope"),
            Err(StoreError::Core(KbError::NotFound(_)))
        ));
        assert!(store.load_grains().unwrap().is_empty());
    }
}
