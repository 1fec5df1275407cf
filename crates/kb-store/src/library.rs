use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::{env, fs, thread};

use kb_core::{ActivationTable, CycleReport, Grain, GrainSummary, KbError, Missing, Ternary};

use crate::cartridge::{Cartridge, QueryOutcome, QueryRequest};
use crate::config::KitbashConfig;
use crate::error::{Result, StoreError};

pub const CARTRIDGES_DIR: &str = "cartridges";
pub const ARCHIVE_DIR: &str = "archive";
pub const CARTRIDGE_EXT: &str = "kbc";

/// `KB_DATA_DIR` if set, else `~/.kitbash`.
pub fn default_base_dir() -> PathBuf {
    if let Ok(dir) = env::var("KB_DATA_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs_home().join(".kitbash")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Check a cartridge name for use as a directory name.
///
/// Surrounding whitespace is dropped. Anything else outside ASCII letters,
/// digits, `-` and `_` is rejected rather than rewritten, so two distinct
/// names never share a directory.
pub fn cartridge_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidData("cartridge name is empty".to_string()));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(StoreError::InvalidData(format!(
            "cartridge name '{name}' contains '{bad}'; use letters, digits, '-' or '_'"
        )));
    }
    Ok(name.to_string())
}

/// All cartridges under one base directory, plus the table of grains that
/// answer ternary queries.
///
/// Layout:
/// ```text
/// <base>/
/// ├── kitbash.toml
/// ├── cartridges/<name>.kbc/
/// └── archive/<name>-<unix>.kbc/
/// ```
///
/// Cartridges are opened lazily and shared as `Arc<Cartridge>`. Each one
/// serializes its own writes, so different cartridges never block each other.
///
/// Lock order is `activations` before any cartridge lock. `publish` runs
/// only after the cartridge call has returned.
pub struct Library {
    base: PathBuf,
    config: KitbashConfig,
    cartridges: RwLock<HashMap<String, Arc<Cartridge>>>,
    activations: RwLock<ActivationTable>,
}

impl Library {
    pub fn open(base: &Path) -> Result<Self> {
        fs::create_dir_all(base.join(CARTRIDGES_DIR))?;
        let config = KitbashConfig::load(base)?;
        let library = Self {
            base: base.to_path_buf(),
            config,
            cartridges: RwLock::new(HashMap::new()),
            activations: RwLock::new(ActivationTable::new()),
        };
        if library.config.auto_activate {
            for name in library.list()? {
                library.activate(&name)?;
            }
        }
        tracing::debug!(base = %base.display(), "opened library");
        Ok(library)
    }

    pub fn open_default() -> Result<Self> {
        Self::open(&default_base_dir())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> &KitbashConfig {
        &self.config
    }

    fn cartridge_dir(&self, name: &str) -> PathBuf {
        self.base
            .join(CARTRIDGES_DIR)
            .join(format!("{name}.{CARTRIDGE_EXT}"))
    }

    /// Names of every cartridge on disk, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.base.join(CARTRIDGES_DIR))? {
            let path = entry?.path();
            if path.is_dir()
                && path.extension().is_some_and(|e| e == CARTRIDGE_EXT)
                && let Some(stem) = path.file_stem()
            {
                let stem = stem.to_string_lossy();
                match cartridge_name(&stem) {
                    Ok(name) if name == stem => names.push(name),
                    _ => tracing::warn!(path = %path.display(), "skipping badly named cartridge"),
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn create(&self, name: &str) -> Result<Arc<Cartridge>> {
        let name = cartridge_name(name)?;
        let dir = self.cartridge_dir(&name);
        if dir.exists() {
            return Err(StoreError::InvalidData(format!(
                "cartridge '{name}' already exists"
            )));
        }
        let cartridge = Arc::new(Cartridge::open(&name, &dir, self.config.pipeline.clone())?);
        self.cartridges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::clone(&cartridge));
        tracing::info!(cartridge = %name, "created cartridge");
        Ok(cartridge)
    }

    /// Shared handle to a cartridge, opening it on first use.
    pub fn cartridge(&self, name: &str) -> Result<Arc<Cartridge>> {
        let name = cartridge_name(name)?;
        if let Some(c) = self
            .cartridges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
        {
            return Ok(Arc::clone(c));
        }

        let mut cache = self
            .cartridges
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // another caller may have opened it meanwhile
        if let Some(c) = cache.get(&name) {
            return Ok(Arc::clone(c));
        }
        let dir = self.cartridge_dir(&name);
        if !dir.is_dir() {
            return Err(KbError::NotFound(Missing::Cartridge(name)).into());
        }
        let cartridge = Arc::new(Cartridge::open(&name, &dir, self.config.pipeline.clone())?);
        cache.insert(name, Arc::clone(&cartridge));
        Ok(cartridge)
    }

    // --- Pipeline ---

    /// Tracked query against one cartridge. Grains committed by a cycle this
    /// query closes go live at once when the cartridge is active.
    pub fn query_and_track(&self, name: &str, request: &QueryRequest) -> Result<QueryOutcome> {
        let cartridge = self.cartridge(name)?;
        let outcome = cartridge
            .query_and_track(request)
            .inspect_err(|_| self.resync(&cartridge))?;
        if let Some(report) = &outcome.cycle {
            self.publish(cartridge.name(), &report.grains);
        }
        Ok(outcome)
    }

    pub fn advance(&self, name: &str) -> Result<CycleReport> {
        let cartridge = self.cartridge(name)?;
        let report = cartridge
            .advance_cycle()
            .inspect_err(|_| self.resync(&cartridge))?;
        self.publish(cartridge.name(), &report.grains);
        Ok(report)
    }

    /// Close one cycle on every cartridge, each on its own thread. A failing
    /// cartridge does not stop the others.
    pub fn advance_all(&self) -> Result<Vec<(String, Result<CycleReport>)>> {
        let cartridges = self
            .list()?
            .iter()
            .map(|name| self.cartridge(name))
            .collect::<Result<Vec<_>>>()?;

        let results: Vec<Result<CycleReport>> = thread::scope(|s| {
            let handles: Vec<_> = cartridges
                .iter()
                .map(|c| s.spawn(move || c.advance_cycle()))
                .collect();
            handles
                .into_iter()
                .zip(&cartridges)
                .map(|(handle, c)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(StoreError::InvalidData(format!(
                            "cycle thread for '{}' panicked",
                            c.name()
                        )))
                    })
                })
                .collect()
        });

        for (cartridge, result) in cartridges.iter().zip(&results) {
            match result {
                Ok(report) => self.publish(cartridge.name(), &report.grains),
                Err(e) => {
                    tracing::warn!(cartridge = %cartridge.name(), "cycle failed: {e}");
                    self.resync(cartridge);
                }
            }
        }
        Ok(cartridges
            .iter()
            .map(|c| c.name().to_string())
            .zip(results)
            .collect())
    }

    fn publish(&self, name: &str, grains: &[Grain]) {
        if grains.is_empty() {
            return;
        }
        let mut table = self
            .activations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if table.is_active(name) {
            for grain in grains {
                table.insert(name, grain);
            }
        }
    }

    /// Reload an active cartridge's grains from disk after a failed cycle.
    /// The cycle may have committed grains before it failed, and those never
    /// reach `publish`.
    fn resync(&self, cartridge: &Cartridge) {
        let mut table = self
            .activations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !table.is_active(cartridge.name()) {
            return;
        }
        match cartridge.load_grains() {
            Ok(grains) => {
                let count = table.activate(cartridge.name(), &grains);
                tracing::info!(cartridge = %cartridge.name(), grains = count, "reloaded active grains");
            }
            Err(e) => {
                tracing::warn!(cartridge = %cartridge.name(), "could not reload grains: {e}");
            }
        }
    }

    // --- Activation ---

    /// Load every grain of `name` into the lookup table, replacing whatever
    /// it had there. Returns the number of live grains.
    ///
    /// The table stays locked from the disk read until the grains are in, so
    /// a grain committed meanwhile is either read here or published after.
    pub fn activate(&self, name: &str) -> Result<usize> {
        let cartridge = self.cartridge(name)?;
        let mut table = self
            .activations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let grains = cartridge.load_grains()?;
        let count = table.activate(cartridge.name(), &grains);
        drop(table);
        tracing::info!(cartridge = %cartridge.name(), grains = count, "activated");
        Ok(count)
    }

    pub fn deactivate(&self, name: &str) -> usize {
        self.activations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .deactivate(name.trim())
    }

    pub fn active_cartridges(&self) -> Vec<String> {
        self.activations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active_cartridges()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// +1, -1, or 0 for `signal` against a live grain.
    pub fn ternary_query(&self, grain_id: &str, signal: &str) -> Result<Ternary> {
        Ok(self
            .activations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ternary_query(grain_id, signal)?)
    }

    /// Registry rows of every cartridge, by name.
    pub fn grain_summaries(&self) -> Result<Vec<(String, Vec<GrainSummary>)>> {
        self.list()?
            .into_iter()
            .map(|name| {
                let summaries = self.cartridge(&name)?.grain_summaries()?;
                Ok((name, summaries))
            })
            .collect()
    }

    // --- Lifecycle ---

    /// Move a cartridge into `archive/`. Its grains leave the live set.
    pub fn archive(&self, name: &str) -> Result<PathBuf> {
        let name = cartridge_name(name)?;
        let dir = self.cartridge_dir(&name);
        if !dir.is_dir() {
            return Err(KbError::NotFound(Missing::Cartridge(name)).into());
        }
        self.deactivate(&name);
        // drop the cached handle so its connection closes once callers let go
        self.cartridges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);

        let archive_dir = self.base.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir)?;
        let dest = archive_dir.join(format!(
            "{name}-{}.{CARTRIDGE_EXT}",
            kb_core::time::now_unix_secs()
        ));
        fs::rename(&dir, &dest)?;
        tracing::info!(cartridge = %name, dest = %dest.display(), "archived cartridge");
        Ok(dest)
    }
}
