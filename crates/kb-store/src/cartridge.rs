//! A live cartridge: in-memory pipeline state backed by its on-disk store.
//!
//! Memory is the source of truth. New facts are written through before the
//! call returns; phantoms, access counters, and the cycle counter are
//! checkpointed at the end of every cycle.
//!
//! Lock order is always `state` then `store`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kb_core::{
    AddedFact, Annotation, BatchReport, CartridgeState, CartridgeStats, CycleReport, DomainAxiom,
    Fact, FactId, FactStatus, Grain, GrainSummary, KbError, Manifest, PhantomStatus,
    PipelineConfig,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::store::Store;

const MANIFEST_KEY: &str = "manifest";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Health {
    Available,
    /// A storage write failed. Writes are refused until `recover` succeeds.
    Degraded(String),
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Available => f.write_str("available"),
            Health::Degraded(reason) => write!(f, "degraded ({reason})"),
        }
    }
}

/// One tracked query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub keywords: Vec<String>,
    /// Concepts the caller associates with this access.
    pub concepts: Vec<String>,
    /// Overrides the per-fact annotation confidence.
    pub confidence: Option<f64>,
    /// Also record the whole result set as one co-access pattern.
    pub pattern: bool,
}

impl QueryRequest {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.as_ref().to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_concepts<S: AsRef<str>>(mut self, concepts: &[S]) -> Self {
        self.concepts = concepts.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn as_pattern(mut self) -> Self {
        self.pattern = true;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueryOutcome {
    pub fact_ids: BTreeSet<FactId>,
    pub statuses: Vec<(FactId, PhantomStatus)>,
    /// Present when this query closed a cycle.
    pub cycle: Option<CycleReport>,
}

pub struct Cartridge {
    name: String,
    dir: PathBuf,
    state: RwLock<CartridgeState>,
    store: Mutex<Store>,
    health: RwLock<Health>,
}

impl Cartridge {
    /// Open (or initialize) the cartridge stored in `dir` and load it fully
    /// into memory.
    pub fn open(name: &str, dir: &Path, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = Store::open(dir)?;
        let mut state = CartridgeState::new(name, config);

        let facts = store.load_facts()?;
        let committed: HashSet<FactId> = facts.iter().map(|f| f.id).collect();
        let mut annotations = store.load_annotations(&committed)?;
        let mut max_id = store
            .get_metadata_u64("next_fact_id")?
            .unwrap_or(1)
            .saturating_sub(1);
        for fact in facts {
            let annotation = annotations.remove(&fact.id).ok_or_else(|| {
                StoreError::InvalidData(format!("fact {} has no annotation record", fact.id))
            })?;
            max_id = max_id.max(fact.id);
            state.facts_mut().restore(fact, annotation);
        }
        if !annotations.is_empty() {
            // left behind by inserts that were rolled back
            tracing::debug!(
                cartridge = name,
                count = annotations.len(),
                "ignoring annotation records without a fact"
            );
        }
        state.facts_mut().reserve_ids_through(max_id);

        let mut index: BTreeMap<String, Vec<FactId>> = BTreeMap::new();
        for (token, id) in store.load_keywords()? {
            index.entry(token).or_default().push(id);
        }
        for (token, ids) in index {
            state.facts_mut().restore_index_entry(&token, ids);
        }
        if let Err(e) = state.facts().verify_index() {
            tracing::warn!(cartridge = name, "{e}; rebuilding keyword index");
            rebuild_index(name, &mut state, &store)?;
        }

        for record in store.load_phantoms()? {
            state.restore_phantom(record);
        }
        for axiom in store.load_axioms()? {
            state.add_axiom(axiom);
        }
        if let Some(cycle) = store.get_metadata_u64("cycle")? {
            state.restore_cycle(cycle);
        }
        if let Some(pending) = store.get_metadata_u64("pending_queries")? {
            state.restore_pending_queries(pending);
        }

        let stats = state.stats();
        tracing::info!(
            cartridge = name,
            facts = stats.facts,
            phantoms = stats.phantoms,
            axioms = stats.axioms,
            cycle = stats.cycle,
            "opened cartridge"
        );

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
            store: Mutex::new(store),
            health: RwLock::new(Health::Available),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // --- Locking ---

    fn read_state(&self) -> RwLockReadGuard<'_, CartridgeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CartridgeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Health ---

    pub fn health(&self) -> Health {
        self.health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_available(&self) -> bool {
        self.health() == Health::Available
    }

    fn ensure_available(&self) -> Result<()> {
        match self.health() {
            Health::Available => Ok(()),
            Health::Degraded(reason) => Err(StoreError::Unavailable {
                name: self.name.clone(),
                reason,
            }),
        }
    }

    fn degrade(&self, err: &StoreError) {
        tracing::warn!(cartridge = %self.name, "storage failure, cartridge degraded: {err}");
        *self.health.write().unwrap_or_else(PoisonError::into_inner) =
            Health::Degraded(err.to_string());
    }

    /// Degrade on storage errors and pass the result through.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_storage()
        {
            self.degrade(e);
        }
        result
    }

    // --- Facts ---

    /// Add a fact and persist it before returning. Duplicate content returns
    /// the existing id without touching disk.
    pub fn add_fact(&self, content: &str, annotation: Annotation) -> Result<AddedFact> {
        self.ensure_available()?;
        let mut state = self.write_state();
        let added = state.add_fact(content, annotation)?;
        if !added.is_new {
            return Ok(added);
        }
        let store = self.store();
        if let Err(e) = persist_fact(&state, &store, added.id) {
            state.facts_mut().retract(added.id);
            if let Err(undo) = store.delete_fact(added.id) {
                tracing::warn!(cartridge = %self.name, fact = added.id, "rollback failed: {undo}");
            }
            self.degrade(&e);
            return Err(e);
        }
        tracing::debug!(cartridge = %self.name, fact = added.id, "added fact");
        Ok(added)
    }

    /// Move a fact through its lifecycle; returns the previous status.
    pub fn set_status(&self, id: FactId, status: FactStatus) -> Result<FactStatus> {
        self.ensure_available()?;
        let mut state = self.write_state();
        let before = snapshot(&state, id)?;
        let previous = state.set_status(id, status)?;
        let store = self.store();
        if let Err(e) = store.update_fact_status(id, status) {
            let (fact, annotation) = before;
            state.facts_mut().restore(fact, annotation);
            return self.guard(Err(e));
        }
        Ok(previous)
    }

    /// Add `content` as a correction of `old`, which becomes deprecated.
    pub fn supersede_fact(
        &self,
        old: FactId,
        content: &str,
        annotation: Annotation,
    ) -> Result<AddedFact> {
        self.ensure_available()?;
        let mut state = self.write_state();
        let before = snapshot(&state, old)?;
        let added = state.supersede_fact(old, content, annotation)?;
        let store = self.store();
        let persisted = if added.is_new {
            persist_fact(&state, &store, added.id)
        } else {
            Ok(())
        }
        .and_then(|()| store.update_fact_status(old, FactStatus::Deprecated));
        if let Err(e) = persisted {
            if added.is_new {
                state.facts_mut().retract(added.id);
                if let Err(undo) = store.delete_fact(added.id) {
                    tracing::warn!(cartridge = %self.name, fact = added.id, "rollback failed: {undo}");
                }
            }
            let (fact, annotation) = before;
            state.facts_mut().restore(fact, annotation);
            self.degrade(&e);
            return Err(e);
        }
        Ok(added)
    }

    pub fn get_fact(&self, id: FactId) -> Result<(Fact, Annotation)> {
        Ok(snapshot(&self.read_state(), id)?)
    }

    /// Plain lookup without tracking. An index entry naming a missing fact
    /// triggers a rebuild and one retry.
    pub fn query<S: AsRef<str>>(&self, keywords: &[S]) -> Result<BTreeSet<FactId>> {
        let first = self.read_state().query(keywords);
        let cause = match first {
            Err(cause @ KbError::CorruptIndex { .. }) => cause,
            other => return Ok(other?),
        };
        let mut state = self.write_state();
        self.repair_index(&mut state, &cause);
        Ok(state.query(keywords)?)
    }

    /// Rebuild the keyword index in memory and on disk. The rebuilt index
    /// serves even when the disk write fails; that only degrades the cartridge.
    fn repair_index(&self, state: &mut CartridgeState, cause: &KbError) {
        tracing::warn!(cartridge = %self.name, "{cause}; rebuilding keyword index");
        let store = self.store();
        let result = rebuild_index(&self.name, state, &store);
        if let Err(e) = self.guard(result) {
            tracing::warn!(cartridge = %self.name, "keyword table not rewritten: {e}");
        }
    }

    // --- Axioms ---

    pub fn add_axiom(&self, axiom: DomainAxiom) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.write_state();
        let is_new = state.add_axiom(axiom);
        let result = self.store().save_axioms(state.axioms());
        // the axiom stays in memory; recover() rewrites the table
        self.guard(result)?;
        Ok(is_new)
    }

    // --- Tracking & cycles ---

    /// Query, record the accesses, and close a cycle when one is due.
    pub fn query_and_track(&self, request: &QueryRequest) -> Result<QueryOutcome> {
        self.ensure_available()?;
        let mut state = self.write_state();
        let fact_ids = match state.query(&request.keywords) {
            Err(cause @ KbError::CorruptIndex { .. }) => {
                self.repair_index(&mut state, &cause);
                state.query(&request.keywords)?
            }
            other => other?,
        };
        let mut statuses = Vec::new();
        if !fact_ids.is_empty() {
            if request.pattern && fact_ids.len() > 1 {
                state.track_pattern(&fact_ids, request.concepts.as_slice(), request.confidence)?;
            }
            statuses =
                state.track_hits(&fact_ids, request.concepts.as_slice(), request.confidence)?;
        }
        let cycle = if state.tick() {
            Some(self.run_cycle(&mut state)?)
        } else {
            None
        };
        Ok(QueryOutcome {
            fact_ids,
            statuses,
            cycle,
        })
    }

    /// Record hits on known facts without a keyword lookup.
    pub fn track<S: AsRef<str>>(
        &self,
        ids: &BTreeSet<FactId>,
        concepts: &[S],
        confidence: Option<f64>,
    ) -> Result<Vec<(FactId, PhantomStatus)>> {
        self.ensure_available()?;
        Ok(self.write_state().track_hits(ids, concepts, confidence)?)
    }

    /// Close the current cycle regardless of the query driver.
    pub fn advance_cycle(&self) -> Result<CycleReport> {
        self.ensure_available()?;
        let mut state = self.write_state();
        self.run_cycle(&mut state)
    }

    fn run_cycle(&self, state: &mut CartridgeState) -> Result<CycleReport> {
        let mut report = state.advance_cycle();
        let store = self.store();

        let mut committed = Vec::with_capacity(report.grains.len());
        for grain in &report.grains {
            let stored = self.guard(store.save_grain(grain))?;
            if state.verify_grain(&stored) == Some(false) {
                // registry entries are append-only; the first write stands
                tracing::warn!(
                    cartridge = %self.name,
                    grain = %stored.grain_id,
                    origin = %stored.phantom_origin,
                    "stored grain differs from this cycle's compression, keeping stored grain"
                );
            }
            state.commit_grain(&stored)?;
            tracing::info!(
                cartridge = %self.name,
                grain = %stored.grain_id,
                origin = %stored.phantom_origin,
                axiom = %stored.axiom_link,
                weight = stored.weight,
                "crystallized grain"
            );
            committed.push(stored);
        }
        report.grains = committed;

        for (key, failure) in &report.failures {
            tracing::debug!(
                phantom = %key,
                check = failure.check(),
                "validation failed, retrying next cycle: {}",
                failure.reason()
            );
        }
        self.guard(store.checkpoint(state))?;

        tracing::debug!(
            cartridge = %self.name,
            cycle = report.cycle,
            locked = report.newly_locked.len(),
            grains = report.grains.len(),
            failures = report.failures.len(),
            "cycle closed"
        );
        Ok(report)
    }

    // --- Maintenance ---

    /// Flush every mutable piece of state to disk.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_available()?;
        let state = self.read_state();
        let store = self.store();
        self.guard(flush(&state, &store))
    }

    /// Retry a full flush on a degraded cartridge. Success makes it
    /// available again.
    pub fn recover(&self) -> Result<()> {
        let state = self.read_state();
        let store = self.store();
        flush(&state, &store)?;
        let mut health = self.health.write().unwrap_or_else(PoisonError::into_inner);
        if *health != Health::Available {
            tracing::info!(cartridge = %self.name, "cartridge recovered");
            *health = Health::Available;
        }
        Ok(())
    }

    // --- Introspection ---

    pub fn stats(&self) -> CartridgeStats {
        self.read_state().stats()
    }

    /// Run `f` against a consistent view of the state.
    pub fn read<R>(&self, f: impl FnOnce(&CartridgeState) -> R) -> R {
        f(&self.read_state())
    }

    pub fn load_grain(&self, grain_id: &str) -> Result<Grain> {
        let result = self.store().load_grain(grain_id);
        self.guard(result)
    }

    pub fn load_grains(&self) -> Result<Vec<Grain>> {
        let result = self.store().load_grains();
        self.guard(result)
    }

    pub fn grain_summaries(&self) -> Result<Vec<GrainSummary>> {
        let result = self.store().grain_summaries();
        self.guard(result)
    }

    pub fn grain_count(&self) -> Result<u64> {
        let result = self.store().grain_count();
        self.guard(result)
    }

    /// Dry run of the validation gate over every phantom awaiting a grain.
    pub fn validate_pending(&self) -> BatchReport {
        self.read_state().validate_pending()
    }

    // --- Manifest ---

    pub fn manifest(&self) -> Result<Manifest> {
        let raw = self.store().get_metadata(MANIFEST_KEY);
        match self.guard(raw)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Manifest::default()),
        }
    }

    /// Merge a description and domain/tag sets into the stored manifest.
    pub fn describe(
        &self,
        description: &str,
        domains: &[String],
        tags: &[String],
    ) -> Result<Manifest> {
        self.ensure_available()?;
        let store = self.store();
        let mut manifest = match store.get_metadata(MANIFEST_KEY)? {
            Some(json) => serde_json::from_str(&json)?,
            None => Manifest::default(),
        };
        if manifest.merge(description, domains, tags, kb_core::time::now_unix_secs()) {
            let json = serde_json::to_string(&manifest)?;
            self.guard(store.set_metadata(MANIFEST_KEY, &json))?;
            tracing::info!(cartridge = %self.name, "manifest updated");
        }
        Ok(manifest)
    }
}

fn snapshot(state: &CartridgeState, id: FactId) -> std::result::Result<(Fact, Annotation), KbError> {
    let fact = state.facts().get_fact(id)?.clone();
    let annotation = state.facts().annotation(id)?.clone();
    Ok((fact, annotation))
}

fn persist_fact(state: &CartridgeState, store: &Store, id: FactId) -> Result<()> {
    let (fact, annotation) = snapshot(state, id)?;
    let tokens = state.facts().tokens_for(id)?;
    store.insert_fact(&fact, &annotation, &tokens)
}

/// Rebuild the in-memory index from the facts and rewrite the keyword table.
fn rebuild_index(name: &str, state: &mut CartridgeState, store: &Store) -> Result<()> {
    let tokens = state.facts_mut().rebuild_index();
    let entries: Vec<(String, FactId)> = state
        .facts()
        .index_entries()
        .into_iter()
        .flat_map(|(token, ids)| ids.iter().map(move |&id| (token.to_string(), id)))
        .collect();
    store.replace_keywords(entries.iter().map(|(t, id)| (t.as_str(), *id)))?;
    tracing::info!(cartridge = name, tokens, "keyword index rebuilt");
    Ok(())
}

fn flush(state: &CartridgeState, store: &Store) -> Result<()> {
    store.checkpoint(state)?;
    store.save_axioms(state.axioms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    use kb_core::{Derivation, LockState, PhantomKey, TernaryDelta};
    use tempfile::TempDir;

    use crate::store::ANNOTATIONS_FILE;

    fn config() -> PipelineConfig {
        PipelineConfig {
            lock_min_cycle_span: 2,
            cycle_every: 1,
            ..PipelineConfig::default()
        }
    }

    fn open(dir: &TempDir) -> Cartridge {
        Cartridge::open("materials", &dir.path().join("materials.kbc"), config()).unwrap()
    }

    fn pla() -> Annotation {
        Annotation::new(0.92)
            .with_derivation(Derivation::positive("temperature"))
            .with_derivation(Derivation::positive("polymer"))
            .with_derivation(Derivation::negative("cold storage", None))
    }

    fn request() -> QueryRequest {
        QueryRequest::new(&["gelling"]).with_concepts(&["temperature", "polymer"])
    }

    /// Query until the first grain appears.
    fn crystallize(c: &Cartridge) -> Grain {
        for _ in 0..30 {
            let outcome = c.query_and_track(&request()).unwrap();
            if let Some(grain) = outcome.cycle.and_then(|r| r.grains.into_iter().next()) {
                return grain;
            }
        }
        panic!("no grain after 30 queries");
    }

    #[test]
    fn test_add_and_query() {
        let dir = TempDir::new().unwrap();
        let c = open(&dir);
        let added = c.add_fact("PLA gelling needs 60C", pla()).unwrap();
        assert!(added.is_new);
        assert!(!c.add_fact("PLA gelling needs 60C", Annotation::new(0.1)).unwrap().is_new);
        assert_eq!(c.query(&["GELLING"]).unwrap(), BTreeSet::from([added.id]));
        let (_, ann) = c.get_fact(added.id).unwrap();
        assert_eq!(ann.confidence, 0.92);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let grain_id = {
            let c = open(&dir);
            c.add_fact("PLA gelling needs 60C", pla()).unwrap();
            c.add_axiom(DomainAxiom::new("thermal", ["temperature"])).unwrap();
            crystallize(&c).grain_id
        };

        let c = open(&dir);
        let stats = c.stats();
        assert_eq!(stats.facts, 1);
        assert_eq!(stats.axioms, 1);
        assert_eq!(stats.crystallized, 1);
        assert!(stats.cycle > 0);
        assert_eq!(c.load_grain(&grain_id).unwrap().axiom_link, "thermal");
        let (fact, _) = c.get_fact(1).unwrap();
        assert!(fact.access_count >= 5);

        // ids continue after the stored ones
        assert_eq!(c.add_fact("agar gelling", Annotation::new(0.8)).unwrap().id, 2);
    }

    #[test]
    fn test_grain_committed_once() {
        let dir = TempDir::new().unwrap();
        let c = open(&dir);
        c.add_fact("PLA gelling needs 60C", pla()).unwrap();
        c.add_axiom(DomainAxiom::new("thermal", ["temperature"])).unwrap();
        crystallize(&c);
        for _ in 0..5 {
            let report = c.advance_cycle().unwrap();
            assert!(report.grains.is_empty());
        }
        assert_eq!(c.grain_summaries().unwrap().len(), 1);
        assert_eq!(c.grain_count().unwrap(), 1);
    }

    #[test]
    fn test_missing_axioms_retry() {
        let dir = TempDir::new().unwrap();
        let c = open(&dir);
        c.add_fact("PLA gelling needs 60C", pla()).unwrap();
        let mut failures = 0;
        for _ in 0..10 {
            let outcome = c.query_and_track(&request()).unwrap();
            let report = outcome.cycle.unwrap();
            assert!(report.grains.is_empty());
            failures += report.failures.len();
        }
        assert!(failures > 0);
        let dry = c.validate_pending();
        assert_eq!((dry.total, dry.passed_independence), (1, 0));
        // registering the axiom lets the same phantom through
        c.add_axiom(DomainAxiom::new("thermal", ["polymer"])).unwrap();
        assert_eq!(c.validate_pending().ready.len(), 1);
        let report = c.advance_cycle().unwrap();
        assert_eq!(report.grains.len(), 1);
    }

    #[test]
    fn test_corrupt_index_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let c = open(&dir);
            c.add_fact("PLA gelling needs 60C", pla()).unwrap();
        }
        {
            let store = Store::open(&dir.path().join("materials.kbc")).unwrap();
            store.replace_keywords([("gelling", 1), ("ghost", 42)]).unwrap();
        }
        let c = open(&dir);
        assert!(c.query(&["ghost"]).unwrap().is_empty());
        assert_eq!(c.query(&["pla"]).unwrap(), BTreeSet::from([1]));
        let store = Store::open(&dir.path().join("materials.kbc")).unwrap();
        assert!(store.load_keywords().unwrap().iter().all(|(_, id)| *id == 1));
    }

    #[test]
    fn test_status_change_persists() {
        let dir = TempDir::new().unwrap();
        {
            let c = open(&dir);
            let id = c.add_fact("PLA gelling needs 60C", pla()).unwrap().id;
            assert_eq!(
                c.set_status(id, FactStatus::Archived).unwrap(),
                FactStatus::Active
            );
            assert!(c.query(&["gelling"]).unwrap().is_empty());
        }
        let c = open(&dir);
        assert_eq!(c.get_fact(1).unwrap().0.status, FactStatus::Archived);
    }

    #[test]
    fn test_supersede_persists_both() {
        let dir = TempDir::new().unwrap();
        {
            let c = open(&dir);
            let old = c.add_fact("PLA gels at 50C", pla()).unwrap().id;
            let new = c
                .supersede_fact(old, "PLA gels at 60C", pla())
                .unwrap();
            assert_eq!(new.id, 2);
        }
        let c = open(&dir);
        assert_eq!(c.get_fact(1).unwrap().0.status, FactStatus::Deprecated);
        assert_eq!(c.query(&["gels"]).unwrap(), BTreeSet::from([2]));
    }

    #[test]
    fn test_degraded_refuses_writes_until_recover() {
        let dir = TempDir::new().unwrap();
        let c = open(&dir);
        c.degrade(&StoreError::Io(std::io::Error::other("disk gone")));
        assert!(!c.is_available());
        assert!(matches!(
            c.add_fact("x y", Annotation::new(0.9)),
            Err(StoreError::Unavailable { .. })
        ));
        // reads still work
        assert!(c.query(&["x"]).unwrap().is_empty());
        c.recover().unwrap();
        assert_eq!(c.health(), Health::Available);
        assert!(c.add_fact("x y", Annotation::new(0.9)).is_ok());
    }

    #[test]
    fn test_pattern_request_tracks_both() {
        let dir = TempDir::new().unwrap();
        let c = open(&dir);
        c.add_fact("PLA gelling", pla()).unwrap();
        c.add_fact("agar gelling", Annotation::new(0.8)).unwrap();
        let outcome = c.query_and_track(&request().as_pattern()).unwrap();
        assert_eq!(outcome.fact_ids.len(), 2);
        assert_eq!(outcome.statuses.len(), 2);
        assert_eq!(c.stats().phantoms, 3);
    }

    #[test]
    fn test_torn_annotation_tail_does_not_hide_next_fact() {
        let dir = TempDir::new().unwrap();
        {
            let c = open(&dir);
            c.add_fact("PLA gelling needs 60C", pla()).unwrap();
            // a crashed append left half a record behind
            let mut f = OpenOptions::new()
                .append(true)
                .open(c.dir().join(ANNOTATIONS_FILE))
                .unwrap();
            f.write_all(br#"{"fact_id":2,"annot"#).unwrap();
            assert_eq!(c.add_fact("agar gelling at 40C", Annotation::new(0.8)).unwrap().id, 2);
        }
        let c = open(&dir);
        assert_eq!(c.stats().facts, 2);
        assert_eq!(c.get_fact(2).unwrap().1.confidence, 0.8);
        assert_eq!(c.query(&["gelling"]).unwrap(), BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_unreadable_cycle_counter_fails_open() {
        let dir = TempDir::new().unwrap();
        {
            let c = open(&dir);
            c.add_fact("PLA gelling needs 60C", pla()).unwrap();
            c.advance_cycle().unwrap();
        }
        {
            let store = Store::open(&dir.path().join("materials.kbc")).unwrap();
            store
                .conn()
                .execute("UPDATE metadata SET value = x'00ff' WHERE key = 'cycle'", [])
                .unwrap();
        }
        // reopening must not silently restart at cycle 0
        assert!(Cartridge::open("materials", &dir.path().join("materials.kbc"), config()).is_err());
    }

    #[test]
    fn test_open_rejects_unusable_config() {
        let dir = TempDir::new().unwrap();
        let bad = PipelineConfig {
            lock_trend_window: 0,
            ..config()
        };
        assert!(matches!(
            Cartridge::open("materials", &dir.path().join("materials.kbc"), bad),
            Err(StoreError::Core(KbError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn test_query_repairs_dangling_index_entry() {
        let dir = TempDir::new().unwrap();
        let c = open(&dir);
        c.add_fact("PLA gelling needs 60C", pla()).unwrap();
        c.write_state().facts_mut().restore_index_entry("ghost", [42]);
        c.write_state().facts_mut().restore_index_entry("gelling", [42]);

        assert!(c.query(&["ghost"]).unwrap().is_empty());
        assert_eq!(c.query(&["gelling"]).unwrap(), BTreeSet::from([1]));
        assert!(c.read(|s| s.facts().verify_index()).is_ok());
        let store = Store::open(&dir.path().join("materials.kbc")).unwrap();
        assert!(store.load_keywords().unwrap().iter().all(|(_, id)| *id == 1));

        // tracked queries repair too
        c.write_state().facts_mut().restore_index_entry("gelling", [7]);
        let outcome = c.query_and_track(&request()).unwrap();
        assert_eq!(outcome.fact_ids, BTreeSet::from([1]));
        assert!(c.is_available());
    }

    #[test]
    fn test_queries_stay_consistent_during_writes() {
        let dir = TempDir::new().unwrap();
        let c = open(&dir);
        c.add_fact("PLA gelling needs 60C", pla()).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..40 {
                    c.add_fact(&format!("batch {i} gelling trial"), Annotation::new(0.8))
                        .unwrap();
                    if i % 10 == 0 {
                        c.advance_cycle().unwrap();
                    }
                }
            });
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..100 {
                        for id in c.query(&["gelling"]).unwrap() {
                            assert!(c.get_fact(id).is_ok(), "query returned unknown fact {id}");
                        }
                    }
                });
            }
        });

        assert_eq!(c.query(&["gelling"]).unwrap().len(), 41);
        assert!(c.read(|s| s.facts().verify_index()).is_ok());
        drop(c);
        assert_eq!(open(&dir).stats().facts, 41);
    }

    #[test]
    fn test_cycle_keeps_previously_stored_grain() {
        let dir = TempDir::new().unwrap();
        let c = open(&dir);
        c.add_fact("PLA gelling needs 60C", pla()).unwrap();
        c.add_axiom(DomainAxiom::new("thermal", ["temperature"])).unwrap();

        let earlier = Grain {
            grain_id: "0123456789abcdef".into(),
            cartridge_source: "materials".into(),
            phantom_origin: PhantomKey::fact("materials", 1).signature(),
            axiom_link: "thermal".into(),
            weight: 1.0,
            delta: TernaryDelta::default(),
            lock_state: LockState::Validated,
            pointer_map: BTreeMap::new(),
            cycle_count: 1,
            created_cycle: 1,
            hit_count: 5,
            confidence: 0.92,
            supersedes: None,
            validation_hash: "00".repeat(32),
        };
        Store::open(c.dir()).unwrap().save_grain(&earlier).unwrap();

        let grain = crystallize(&c);
        assert_eq!(grain, earlier);
        assert_eq!(c.stats().crystallized, 1);
        assert_eq!(c.grain_count().unwrap(), 1);
    }

    #[test]
    fn test_manifest_merges_and_persists() {
        let dir = TempDir::new().unwrap();
        {
            let c = open(&dir);
            assert_eq!(c.manifest().unwrap(), Manifest::default());
            c.describe("Polymer processing", &["materials".into()], &["3d-printing".into()])
                .unwrap();
            let m = c.describe("", &["thermal".into()], &[]).unwrap();
            assert_eq!(m.description, "Polymer processing");
            assert_eq!(m.domains.len(), 2);
            assert!(m.updated_at.is_some());
        }
        let m = open(&dir).manifest().unwrap();
        assert_eq!(m.description, "Polymer processing");
        assert!(m.tags.contains("3d-printing"));
    }
}
