//! Append-only JSON-lines annotation log, one record per fact.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use kb_core::{Annotation, FactId};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

#[derive(Serialize)]
struct LineRef<'a> {
    fact_id: FactId,
    annotation: &'a Annotation,
}

#[derive(Deserialize)]
struct Line {
    fact_id: FactId,
    annotation: Annotation,
}

pub struct AnnotationLog {
    path: PathBuf,
}

impl AnnotationLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it to disk.
    ///
    /// A torn tail left by an earlier failed append is cut off first, and a
    /// failed write is rolled back to the previous length, so every record
    /// starts on a line of its own.
    pub fn append(&self, fact_id: FactId, annotation: &Annotation) -> Result<()> {
        let mut line = serde_json::to_string(&LineRef {
            fact_id,
            annotation,
        })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)?;
        let len = clean_length(&mut file)?;
        if len < file.metadata()?.len() {
            tracing::warn!(
                path = %self.path.display(),
                "dropping torn annotation tail before append"
            );
            file.set_len(len)?;
        }

        let written = file
            .seek(SeekFrom::Start(len))
            .and_then(|_| file.write_all(line.as_bytes()))
            .and_then(|()| file.sync_data());
        if let Err(e) = written {
            if let Err(undo) = file.set_len(len) {
                tracing::warn!(path = %self.path.display(), "annotation rollback failed: {undo}");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Read every record. The first record for a fact wins.
    ///
    /// A final line without a newline is a torn write and is cut off the
    /// file with a warning, unless it belongs to a fact for which
    /// `committed` returns true. Any other malformed line is corruption.
    pub fn load(&self, committed: impl Fn(FactId) -> bool) -> Result<HashMap<FactId, Annotation>> {
        let mut out = HashMap::new();
        if !self.path.exists() {
            return Ok(out);
        }
        let text = fs::read_to_string(&self.path)?;
        let mut offset = 0usize;
        for (n, raw) in text.split_inclusive('\n').enumerate() {
            let start = offset;
            offset += raw.len();
            if raw.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Line>(raw.trim_end()) {
                Ok(line) => {
                    out.entry(line.fact_id).or_insert(line.annotation);
                }
                Err(e) if !raw.ends_with('\n') => {
                    if let Some(id) = leading_fact_id(raw)
                        && committed(id)
                    {
                        return Err(StoreError::InvalidData(format!(
                            "{} line {}: record for committed fact {id} is torn: {e}",
                            self.path.display(),
                            n + 1
                        )));
                    }
                    tracing::warn!(
                        path = %self.path.display(),
                        "truncating torn annotation record at line {}: {e}",
                        n + 1
                    );
                    OpenOptions::new()
                        .write(true)
                        .open(&self.path)?
                        .set_len(start as u64)?;
                }
                Err(e) => {
                    return Err(StoreError::InvalidData(format!(
                        "{} line {}: {e}",
                        self.path.display(),
                        n + 1
                    )));
                }
            }
        }
        Ok(out)
    }
}

/// Length of the file up to and including its last newline.
fn clean_length(file: &mut File) -> std::io::Result<u64> {
    const CHUNK: u64 = 4096;
    let len = file.metadata()?.len();
    let mut end = len;
    let mut buf = vec![0u8; CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Fact id of a record prefix such as `{"fact_id":12,"annot`. The id only
/// counts once the separator after it was written.
fn leading_fact_id(raw: &str) -> Option<FactId> {
    let rest = raw
        .trim_start()
        .strip_prefix('{')?
        .trim_start()
        .strip_prefix("\"fact_id\"")?
        .trim_start()
        .strip_prefix(':')?
        .trim_start();
    let digits = rest.find(|c: char| !c.is_ascii_digit())?;
    if !rest[digits..].trim_start().starts_with(',') {
        return None;
    }
    rest[..digits].parse().ok()
}
