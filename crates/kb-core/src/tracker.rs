//! Per-cartridge hit log ("delta registry").
//!
//! Every hit appends to a phantom's confidence history and re-evaluates its
//! promotion. A phantom can move back and forth between incubating and
//! persistent as its running mean crosses the threshold, so callers must read
//! `status` fresh instead of caching it. Locked is terminal.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::PipelineConfig;
use crate::error::{KbError, Missing, Result};
use crate::fact::FactId;
use crate::phantom::{PhantomKey, PhantomRecord, PhantomStatus};
use crate::validator::ValidationFailure;

pub struct AccessTracker {
    cartridge_id: String,
    phantoms: BTreeMap<PhantomKey, PhantomRecord>,
    cycle: u64,
    promotion_min_hits: u64,
    promotion_min_mean: f64,
}

impl AccessTracker {
    pub fn new(cartridge_id: &str, config: &PipelineConfig) -> Self {
        Self {
            cartridge_id: cartridge_id.to_string(),
            phantoms: BTreeMap::new(),
            cycle: 0,
            promotion_min_hits: config.promotion_min_hits,
            promotion_min_mean: config.promotion_min_mean_confidence,
        }
    }

    pub fn cartridge_id(&self) -> &str {
        &self.cartridge_id
    }

    /// The cycle new phantoms are stamped with.
    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    pub(crate) fn set_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    /// Record one access of a single fact. Returns the phantom's new status.
    pub fn record_hit<S: AsRef<str>>(
        &mut self,
        fact_id: FactId,
        confidence: f64,
        concepts: &[S],
    ) -> Result<PhantomStatus> {
        let key = PhantomKey::fact(&self.cartridge_id, fact_id);
        self.record(key, BTreeSet::from([fact_id]), confidence, concepts)
    }

    /// Record one co-access of several facts as a pattern.
    ///
    /// Pattern phantoms are independent of the members' own phantoms: a fact
    /// may sit in any number of patterns at once.
    pub fn record_pattern_hit<S: AsRef<str>>(
        &mut self,
        fact_ids: &BTreeSet<FactId>,
        confidence: f64,
        concepts: &[S],
    ) -> Result<PhantomStatus> {
        match fact_ids.len() {
            0 => Err(KbError::InvalidFact("pattern has no facts".to_string())),
            1 => {
                let id = *fact_ids.iter().next().unwrap_or(&0);
                self.record_hit(id, confidence, concepts)
            }
            _ => {
                let key = PhantomKey::pattern(&self.cartridge_id, fact_ids);
                self.record(key, fact_ids.clone(), confidence, concepts)
            }
        }
    }

    fn record<S: AsRef<str>>(
        &mut self,
        key: PhantomKey,
        fact_ids: BTreeSet<FactId>,
        confidence: f64,
        concepts: &[S],
    ) -> Result<PhantomStatus> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(KbError::InvalidConfidence(confidence));
        }
        let cycle = self.cycle;
        let rec = self
            .phantoms
            .entry(key.clone())
            .or_insert_with(|| PhantomRecord::new(key, fact_ids, cycle));

        rec.hit_count += 1;
        rec.confidence_history.push(confidence);
        rec.pending.push(confidence);
        let unique: BTreeSet<String> = concepts
            .iter()
            .map(|c| c.as_ref().trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        for concept in unique {
            *rec.concept_hits.entry(concept).or_insert(0) += 1;
        }

        if rec.status != PhantomStatus::Locked {
            rec.status = if rec.hit_count >= self.promotion_min_hits
                && rec.mean_confidence() >= self.promotion_min_mean
            {
                PhantomStatus::Persistent
            } else {
                PhantomStatus::Incubating
            };
        }
        Ok(rec.status)
    }

    pub fn get(&self, key: &PhantomKey) -> Option<&PhantomRecord> {
        self.phantoms.get(key)
    }

    pub fn get_fact_phantom(&self, fact_id: FactId) -> Option<&PhantomRecord> {
        self.phantoms
            .get(&PhantomKey::fact(&self.cartridge_id, fact_id))
    }

    /// Snapshot of every phantom currently `persistent`.
    pub fn get_persistent_phantoms(&self) -> Vec<PhantomRecord> {
        self.phantoms
            .values()
            .filter(|p| p.status == PhantomStatus::Persistent)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhantomRecord> {
        self.phantoms.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PhantomRecord> {
        self.phantoms.values_mut()
    }

    pub fn len(&self) -> usize {
        self.phantoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phantoms.is_empty()
    }

    pub fn count_by_status(&self, status: PhantomStatus) -> usize {
        self.phantoms.values().filter(|p| p.status == status).count()
    }

    /// Mark the phantom consumed by a committed grain.
    pub fn mark_crystallized(&mut self, key: &PhantomKey, grain_id: &str) -> Result<()> {
        let rec = self
            .phantoms
            .get_mut(key)
            .ok_or_else(|| KbError::NotFound(Missing::Phantom(key.signature())))?;
        rec.grain_id = Some(grain_id.to_string());
        rec.last_failure = None;
        Ok(())
    }

    pub fn record_failure(&mut self, key: &PhantomKey, failure: ValidationFailure) {
        if let Some(rec) = self.phantoms.get_mut(key) {
            rec.last_failure = Some(failure);
        }
    }

    /// Reinstate a persisted phantom.
    pub fn restore(&mut self, record: PhantomRecord) {
        self.phantoms.insert(record.key.clone(), record);
    }
}
