//! Per-cartridge pipeline state.
//!
//! One `CartridgeState` owns everything a cartridge needs in memory: facts,
//! phantoms, axioms, and the pipeline stages. Nothing is global, so any
//! number of cartridges can live in one process. Callers serialize writes
//! per cartridge; see `kb_store::Cartridge`.

use std::collections::{BTreeSet, HashMap};

use crate::annotation::Annotation;
use crate::axiom::DomainAxiom;
use crate::compressor::TernaryCompressor;
use crate::config::PipelineConfig;
use crate::error::{KbError, Missing, Result};
use crate::fact::{FactId, FactStatus};
use crate::fact_store::{AddedFact, FactStore};
use crate::grain::Grain;
use crate::phantom::{PhantomKey, PhantomRecord, PhantomStatus};
use crate::scheduler::{CycleDriver, CycleScheduler};
use crate::time::now_unix_secs;
use crate::tracker::AccessTracker;
use crate::validator::{BatchReport, GrainValidator, ValidatedPhantom, ValidationFailure};

/// Result of [`CartridgeState::advance_cycle`].
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub newly_locked: Vec<PhantomKey>,
    /// Compressed but not yet committed.
    pub grains: Vec<Grain>,
    pub failures: Vec<(PhantomKey, ValidationFailure)>,
}

/// Counts for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartridgeStats {
    pub facts: usize,
    pub active_facts: usize,
    pub index_tokens: usize,
    pub axioms: usize,
    pub phantoms: usize,
    pub incubating: usize,
    pub persistent: usize,
    pub locked: usize,
    pub crystallized: usize,
    pub cycle: u64,
}

pub struct CartridgeState {
    name: String,
    config: PipelineConfig,
    facts: FactStore,
    tracker: AccessTracker,
    axioms: Vec<DomainAxiom>,
    scheduler: CycleScheduler,
    validator: GrainValidator,
    compressor: TernaryCompressor,
    driver: CycleDriver,
    /// Inputs of the grains compressed by the latest cycle, by origin.
    compressed: HashMap<String, ValidatedPhantom>,
}

impl CartridgeState {
    pub fn new(name: &str, config: PipelineConfig) -> Self {
        Self {
            name: name.to_string(),
            facts: FactStore::new(),
            tracker: AccessTracker::new(name, &config),
            axioms: Vec::new(),
            scheduler: CycleScheduler::new(&config),
            validator: GrainValidator::new(&config),
            compressor: TernaryCompressor::new(&config),
            driver: CycleDriver::new(config.cycle_every),
            compressed: HashMap::new(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    /// Direct access for restore and index repair.
    pub fn facts_mut(&mut self) -> &mut FactStore {
        &mut self.facts
    }

    pub fn tracker(&self) -> &AccessTracker {
        &self.tracker
    }

    pub fn compressor(&self) -> &TernaryCompressor {
        &self.compressor
    }

    pub fn validator(&self) -> &GrainValidator {
        &self.validator
    }

    pub fn axioms(&self) -> &[DomainAxiom] {
        &self.axioms
    }

    pub fn current_cycle(&self) -> u64 {
        self.tracker.current_cycle()
    }

    // --- Facts ---

    pub fn add_fact(&mut self, content: &str, annotation: Annotation) -> Result<AddedFact> {
        self.facts.add_fact(content, annotation)
    }

    pub fn set_status(&mut self, id: FactId, status: FactStatus) -> Result<FactStatus> {
        self.facts.set_status(id, status)
    }

    pub fn supersede_fact(
        &mut self,
        old: FactId,
        content: &str,
        annotation: Annotation,
    ) -> Result<AddedFact> {
        self.facts.supersede_fact(old, content, annotation)
    }

    pub fn query<I, S>(&self, keywords: I) -> Result<BTreeSet<FactId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.facts.query(keywords)
    }

    // --- Axioms ---

    /// Register an axiom. A second axiom with the same name replaces the
    /// concepts of the first but keeps its registration order.
    /// Returns true when the name was new.
    pub fn add_axiom(&mut self, axiom: DomainAxiom) -> bool {
        if let Some(existing) = self.axioms.iter_mut().find(|a| a.name == axiom.name) {
            existing.concepts = axiom.concepts;
            return false;
        }
        self.axioms.push(axiom);
        true
    }

    // --- Tracking ---

    /// Record one hit per fact. `confidence` defaults to each fact's
    /// annotation confidence.
    pub fn track_hits<S: AsRef<str>>(
        &mut self,
        ids: &BTreeSet<FactId>,
        concepts: &[S],
        confidence: Option<f64>,
    ) -> Result<Vec<(FactId, PhantomStatus)>> {
        let now = now_unix_secs();
        let mut statuses = Vec::with_capacity(ids.len());
        for &id in ids {
            let conf = match confidence {
                Some(c) => c,
                None => self.facts.annotation(id)?.confidence,
            };
            // validate before touching so a bad confidence leaves no trace
            if !conf.is_finite() || !(0.0..=1.0).contains(&conf) {
                return Err(KbError::InvalidConfidence(conf));
            }
            self.facts.touch(id, now)?;
            let status = self.tracker.record_hit(id, conf, concepts)?;
            statuses.push((id, status));
        }
        Ok(statuses)
    }

    /// Record one co-access of `ids` as a pattern phantom. `confidence`
    /// defaults to the members' mean annotation confidence.
    pub fn track_pattern<S: AsRef<str>>(
        &mut self,
        ids: &BTreeSet<FactId>,
        concepts: &[S],
        confidence: Option<f64>,
    ) -> Result<PhantomStatus> {
        let conf = match confidence {
            Some(c) => c,
            None => {
                let mut confs = Vec::with_capacity(ids.len());
                for &id in ids {
                    confs.push(self.facts.annotation(id)?.confidence);
                }
                crate::stats::mean(&confs)
            }
        };
        for &id in ids {
            self.facts.get_fact(id)?;
        }
        self.tracker.record_pattern_hit(ids, conf, concepts)
    }

    /// Count one query toward the next cycle. True when a cycle is due.
    pub fn tick(&mut self) -> bool {
        self.driver.tick()
    }

    /// Queries counted since the last cycle.
    pub fn pending_queries(&self) -> u64 {
        self.driver.pending()
    }

    // --- Pipeline ---

    /// Close the current cycle, then validate and compress every locked
    /// phantom still waiting for a grain.
    ///
    /// Failures are recorded on the phantom and retried next cycle. Grains
    /// are returned uncommitted: persist them, then call
    /// [`commit_grain`](Self::commit_grain).
    pub fn advance_cycle(&mut self) -> CycleReport {
        let advance = self.scheduler.advance_cycle(&mut self.tracker);
        self.compressed.clear();
        let mut report = CycleReport {
            cycle: advance.cycle,
            newly_locked: advance.newly_locked,
            ..CycleReport::default()
        };
        for candidate in advance.candidates {
            match self
                .validator
                .validate(&candidate, &self.facts, &self.axioms)
            {
                Ok(validated) => {
                    let grain = self.compressor.compress(&validated);
                    self.compressed
                        .insert(grain.phantom_origin.clone(), validated);
                    report.grains.push(grain);
                }
                Err(failure) => {
                    self.tracker
                        .record_failure(&candidate.key, failure.clone());
                    report.failures.push((candidate.key, failure));
                }
            }
        }
        report
    }

    /// Check a grain against the phantom the latest cycle compressed for
    /// its origin. `None` when that cycle compressed nothing for it.
    pub fn verify_grain(&self, grain: &Grain) -> Option<bool> {
        self.compressed
            .get(&grain.phantom_origin)
            .map(|validated| self.compressor.verify(grain, validated))
    }

    /// Run all three checks over every locked phantom still waiting for a
    /// grain. Nothing is recorded on the phantoms.
    pub fn validate_pending(&self) -> BatchReport {
        let pending: Vec<&PhantomRecord> =
            self.tracker.iter().filter(|p| p.awaiting_grain()).collect();
        self.validator
            .validate_batch(pending, &self.facts, &self.axioms)
    }

    /// Mark the grain's origin phantom consumed.
    pub fn commit_grain(&mut self, grain: &Grain) -> Result<()> {
        let key = PhantomKey::from_signature(&self.name, &grain.phantom_origin)
            .ok_or_else(|| KbError::NotFound(Missing::Phantom(grain.phantom_origin.clone())))?;
        self.tracker.mark_crystallized(&key, &grain.grain_id)
    }

    pub fn stats(&self) -> CartridgeStats {
        let t = &self.tracker;
        CartridgeStats {
            facts: self.facts.len(),
            active_facts: self.facts.facts().filter(|f| f.is_active()).count(),
            index_tokens: self.facts.index_entries().len(),
            axioms: self.axioms.len(),
            phantoms: t.len(),
            incubating: t.count_by_status(PhantomStatus::Incubating),
            persistent: t.count_by_status(PhantomStatus::Persistent),
            locked: t.count_by_status(PhantomStatus::Locked),
            crystallized: t.iter().filter(|p| p.is_consumed()).count(),
            cycle: t.current_cycle(),
        }
    }

    // --- Restore hooks ---

    pub fn restore_phantom(&mut self, record: PhantomRecord) {
        self.tracker.restore(record);
    }

    pub fn restore_cycle(&mut self, cycle: u64) {
        self.tracker.set_cycle(cycle);
    }

    pub fn restore_pending_queries(&mut self, pending: u64) {
        self.driver.restore_pending(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Derivation;

    fn state() -> CartridgeState {
        let config = PipelineConfig {
            cycle_every: 1,
            ..PipelineConfig::default()
        };
        let mut s = CartridgeState::new("materials", config);
        s.add_axiom(DomainAxiom::new("thermal", ["gelling", "temperature"]));
        s
    }

    fn pla() -> Annotation {
        Annotation::new(0.92)
            .with_derivation(Derivation::positive("temperature"))
            .with_derivation(Derivation::positive("polymer"))
            .with_derivation(Derivation::negative("cold", None))
    }

    #[test]
    fn test_track_hits_touches_and_defaults_confidence() {
        let mut s = state();
        let id = s.add_fact("PLA gels", pla()).unwrap().id;
        let ids = BTreeSet::from([id]);
        s.track_hits(&ids, &["gelling"], None).unwrap();
        assert_eq!(s.facts().get_fact(id).unwrap().access_count, 1);
        let rec = s.tracker().get_fact_phantom(id).unwrap();
        assert_eq!(rec.confidence_history, vec![0.92]);
        assert_eq!(rec.concept_hit_count("gelling"), 1);
    }

    #[test]
    fn test_track_hits_rejects_before_touching() {
        let mut s = state();
        let id = s.add_fact("PLA gels", pla()).unwrap().id;
        assert!(
            s.track_hits(&BTreeSet::from([id]), &["x"], Some(2.0))
                .is_err()
        );
        assert_eq!(s.facts().get_fact(id).unwrap().access_count, 0);
        assert!(s.tracker().is_empty());
    }

    #[test]
    fn test_track_unknown_fact() {
        let mut s = state();
        let err = s
            .track_hits(&BTreeSet::from([99]), &["x"], None)
            .unwrap_err();
        assert_eq!(err, KbError::NotFound(Missing::Annotation(99)));
    }

    #[test]
    fn test_axiom_replace_keeps_order() {
        let mut s = state();
        assert!(s.add_axiom(DomainAxiom::new("materials", ["pla"])));
        assert!(!s.add_axiom(DomainAxiom::new("thermal", ["heat"])));
        assert_eq!(s.axioms()[0].name, "thermal");
        assert_eq!(s.axioms()[0].concepts, vec!["heat"]);
    }

    #[test]
    fn test_failed_validation_retried_every_cycle() {
        let mut s = state();
        // no derivations: resistance fails forever
        let id = s.add_fact("PLA gelling", Annotation::new(0.92)).unwrap().id;
        let ids = BTreeSet::from([id]);
        for _ in 0..5 {
            s.track_hits(&ids, &["gelling"], None).unwrap();
        }
        for _ in 0..51 {
            s.advance_cycle();
        }
        let rec = s.tracker().get_fact_phantom(id).unwrap();
        assert_eq!(rec.status, PhantomStatus::Locked);
        assert!(matches!(
            rec.last_failure,
            Some(ValidationFailure::ResistanceFailed { .. })
        ));
        for _ in 0..3 {
            let report = s.advance_cycle();
            assert!(report.grains.is_empty());
            assert_eq!(report.failures.len(), 1);
        }
    }

    #[test]
    fn test_commit_consumes_phantom() {
        let mut s = state();
        let id = s.add_fact("PLA requires 60°C for gelling", pla()).unwrap().id;
        let ids = BTreeSet::from([id]);
        for _ in 0..5 {
            s.track_hits(&ids, &["temperature"], None).unwrap();
        }
        let mut grains = Vec::new();
        for _ in 0..60 {
            let report = s.advance_cycle();
            if let Some(g) = report.grains.into_iter().next() {
                grains.push(g);
                break;
            }
        }
        let grain = grains.pop().unwrap();
        s.commit_grain(&grain).unwrap();
        let rec = s.tracker().get_fact_phantom(id).unwrap();
        assert_eq!(rec.grain_id.as_deref(), Some(grain.grain_id.as_str()));
        assert!(s.advance_cycle().grains.is_empty());
        assert_eq!(s.stats().crystallized, 1);
    }

    #[test]
    fn test_uncommitted_grain_is_recompressed_identically() {
        let mut s = state();
        let id = s.add_fact("PLA requires 60°C for gelling", pla()).unwrap().id;
        for _ in 0..5 {
            s.track_hits(&BTreeSet::from([id]), &["polymer"], None)
                .unwrap();
        }
        let mut first = None;
        while first.is_none() {
            first = s.advance_cycle().grains.into_iter().next();
        }
        let again = s.advance_cycle().grains.into_iter().next().unwrap();
        let first = first.unwrap();
        assert_eq!(first.grain_id, again.grain_id);
        assert_eq!(first.delta, again.delta);
    }

    fn crystallize(s: &mut CartridgeState) -> Grain {
        let id = s.add_fact("PLA requires 60°C for gelling", pla()).unwrap().id;
        for _ in 0..5 {
            s.track_hits(&BTreeSet::from([id]), &["temperature"], None)
                .unwrap();
        }
        for _ in 0..60 {
            if let Some(g) = s.advance_cycle().grains.into_iter().next() {
                return g;
            }
        }
        panic!("no grain after 60 cycles");
    }

    #[test]
    fn test_verify_grain_against_latest_cycle() {
        let mut s = state();
        let grain = crystallize(&mut s);
        assert_eq!(s.verify_grain(&grain), Some(true));

        let mut edited = grain.clone();
        edited.validation_hash = "00".repeat(32);
        assert_eq!(s.verify_grain(&edited), Some(false));

        let mut stranger = grain.clone();
        stranger.phantom_origin = "fact:42".into();
        assert_eq!(s.verify_grain(&stranger), None);

        s.commit_grain(&grain).unwrap();
        s.advance_cycle();
        assert_eq!(s.verify_grain(&grain), None);
    }

    #[test]
    fn test_validate_pending_reports_without_recording() {
        let mut s = state();
        let id = s.add_fact("PLA gelling", Annotation::new(0.92)).unwrap().id;
        for _ in 0..5 {
            s.track_hits(&BTreeSet::from([id]), &["gelling"], None)
                .unwrap();
        }
        assert_eq!(s.validate_pending().total, 0);
        while s.tracker().get_fact_phantom(id).unwrap().status != PhantomStatus::Locked {
            s.advance_cycle();
        }
        let before = s.tracker().get_fact_phantom(id).unwrap().clone();
        let report = s.validate_pending();
        assert_eq!(report.total, 1);
        assert_eq!(report.passed_persistence, 1);
        assert_eq!(report.passed_resistance, 0);
        assert_eq!(report.rejection_rate(), 1.0);
        assert_eq!(s.tracker().get_fact_phantom(id).unwrap(), &before);
    }

    #[test]
    fn test_pattern_tracking() {
        let mut s = state();
        let a = s.add_fact("PLA gels", pla()).unwrap().id;
        let b = s.add_fact("Agar gels", Annotation::new(0.8)).unwrap().id;
        let status = s
            .track_pattern(&BTreeSet::from([a, b]), &["gelling"], None)
            .unwrap();
        assert_eq!(status, PhantomStatus::Incubating);
        let key = PhantomKey::pattern("materials", &BTreeSet::from([a, b]));
        let rec = s.tracker().get(&key).unwrap();
        assert!((rec.confidence_history[0] - 0.86).abs() < 1e-12);
        assert!(
            s.track_pattern(&BTreeSet::from([a, 77]), &["x"], Some(0.9))
                .is_err()
        );
    }
}
