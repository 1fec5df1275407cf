//! Three-rule gate in front of the compressor.
//!
//! Checks run in order and stop at the first failure:
//! 1. persistence: every underlying fact is active with confidence above the floor
//! 2. resistance: enough derivations are ternary-expressible
//! 3. independence: enough registered axioms overlap the facts
//!
//! A failure is an ordinary value. It is stored on the phantom and the
//! phantom is retried on the next cycle.
//!
//! [`GrainValidator::validate_batch`] is the reporting variant: it runs all
//! three checks on every phantom and tallies the results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::annotation::Annotation;
use crate::axiom::DomainAxiom;
use crate::config::PipelineConfig;
use crate::fact::{Fact, FactId};
use crate::fact_store::FactStore;
use crate::phantom::{PhantomKey, PhantomRecord};

/// Which check rejected a phantom, and why.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ValidationFailure {
    PersistenceFailed { reason: String },
    ResistanceFailed { ratio: f64, reason: String },
    IndependenceFailed { ratio: f64, reason: String },
}

impl ValidationFailure {
    pub fn check(&self) -> &'static str {
        match self {
            ValidationFailure::PersistenceFailed { .. } => "persistence",
            ValidationFailure::ResistanceFailed { .. } => "resistance",
            ValidationFailure::IndependenceFailed { .. } => "independence",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ValidationFailure::PersistenceFailed { reason }
            | ValidationFailure::ResistanceFailed { reason, .. }
            | ValidationFailure::IndependenceFailed { reason, .. } => reason,
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} check failed: {}", self.check(), self.reason())
    }
}

/// A phantom that passed all three checks, frozen at validation time.
///
/// Only [`GrainValidator::validate`] can build one, so the compressor can
/// never run on an unvalidated phantom.
#[derive(Clone, Debug)]
pub struct ValidatedPhantom {
    phantom: PhantomRecord,
    facts: Vec<(Fact, Annotation)>,
    axiom_link: String,
}

impl ValidatedPhantom {
    pub fn phantom(&self) -> &PhantomRecord {
        &self.phantom
    }

    /// Underlying facts with their annotations, in id order.
    pub fn facts(&self) -> &[(Fact, Annotation)] {
        &self.facts
    }

    pub fn axiom_link(&self) -> &str {
        &self.axiom_link
    }

    pub fn cartridge_id(&self) -> &str {
        &self.phantom.key.cartridge_id
    }
}

/// Tally of [`GrainValidator::validate_batch`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub passed_persistence: usize,
    pub passed_resistance: usize,
    pub passed_independence: usize,
    pub passed_all: usize,
    /// Phantoms that passed every check.
    pub ready: Vec<PhantomKey>,
    /// Every failed check per rejected phantom.
    pub rejected: Vec<(PhantomKey, Vec<ValidationFailure>)>,
}

impl BatchReport {
    pub fn rejection_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.rejected.len() as f64 / self.total as f64
    }
}

pub struct GrainValidator {
    persistence_min_confidence: f64,
    resistance_min_ratio: f64,
    independence_min_ratio: f64,
}

impl GrainValidator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            persistence_min_confidence: config.persistence_min_confidence,
            resistance_min_ratio: config.resistance_min_ratio,
            independence_min_ratio: config.independence_min_ratio,
        }
    }

    pub fn validate(
        &self,
        phantom: &PhantomRecord,
        facts: &FactStore,
        axioms: &[DomainAxiom],
    ) -> Result<ValidatedPhantom, ValidationFailure> {
        let snapshot = self.check_persistence(&phantom.fact_ids, facts)?;
        self.check_resistance(&snapshot)?;
        let axiom_link = self.check_independence(&snapshot, axioms)?;
        Ok(ValidatedPhantom {
            phantom: phantom.clone(),
            facts: snapshot,
            axiom_link,
        })
    }

    /// Run every check on every phantom, without short-circuiting.
    ///
    /// When persistence fails, the other two checks see whichever facts
    /// still exist.
    pub fn validate_batch<'a>(
        &self,
        phantoms: impl IntoIterator<Item = &'a PhantomRecord>,
        facts: &FactStore,
        axioms: &[DomainAxiom],
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for phantom in phantoms {
            report.total += 1;
            let mut failures = Vec::new();
            let snapshot = match self.check_persistence(&phantom.fact_ids, facts) {
                Ok(snapshot) => {
                    report.passed_persistence += 1;
                    snapshot
                }
                Err(failure) => {
                    failures.push(failure);
                    phantom
                        .fact_ids
                        .iter()
                        .filter_map(|&id| {
                            Some((
                                facts.get_fact(id).ok()?.clone(),
                                facts.annotation(id).ok()?.clone(),
                            ))
                        })
                        .collect()
                }
            };
            match self.check_resistance(&snapshot) {
                Ok(()) => report.passed_resistance += 1,
                Err(failure) => failures.push(failure),
            }
            match self.check_independence(&snapshot, axioms) {
                Ok(_) => report.passed_independence += 1,
                Err(failure) => failures.push(failure),
            }
            if failures.is_empty() {
                report.passed_all += 1;
                report.ready.push(phantom.key.clone());
            } else {
                report.rejected.push((phantom.key.clone(), failures));
            }
        }
        report
    }

    fn check_persistence<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a FactId>,
        facts: &FactStore,
    ) -> Result<Vec<(Fact, Annotation)>, ValidationFailure> {
        let fail = |reason: String| ValidationFailure::PersistenceFailed { reason };
        let mut snapshot = Vec::new();
        for &id in ids {
            let fact = facts
                .get_fact(id)
                .map_err(|_| fail(format!("fact {id} no longer exists")))?;
            if !fact.is_active() {
                return Err(fail(format!("fact {id} is {}", fact.status)));
            }
            let ann = facts
                .annotation(id)
                .map_err(|_| fail(format!("fact {id} has no annotation")))?;
            if ann.confidence <= self.persistence_min_confidence {
                return Err(fail(format!(
                    "fact {id} confidence {:.3} <= {:.3}",
                    ann.confidence, self.persistence_min_confidence
                )));
            }
            snapshot.push((fact.clone(), ann.clone()));
        }
        if snapshot.is_empty() {
            return Err(fail("phantom has no facts".to_string()));
        }
        Ok(snapshot)
    }

    fn check_resistance(&self, snapshot: &[(Fact, Annotation)]) -> Result<(), ValidationFailure> {
        let total: usize = snapshot.iter().map(|(_, a)| a.derivations.len()).sum();
        if total == 0 {
            return Err(ValidationFailure::ResistanceFailed {
                ratio: 0.0,
                reason: "no derivations".to_string(),
            });
        }
        let ternary = snapshot
            .iter()
            .flat_map(|(_, a)| &a.derivations)
            .filter(|d| d.kind().is_ternary())
            .count();
        let ratio = ternary as f64 / total as f64;
        if ratio < self.resistance_min_ratio {
            return Err(ValidationFailure::ResistanceFailed {
                ratio,
                reason: format!(
                    "{ternary}/{total} derivations are ternary-expressible, need {:.2}",
                    self.resistance_min_ratio
                ),
            });
        }
        Ok(())
    }

    /// Returns the name of the best-matching axiom.
    fn check_independence(
        &self,
        snapshot: &[(Fact, Annotation)],
        axioms: &[DomainAxiom],
    ) -> Result<String, ValidationFailure> {
        if axioms.is_empty() {
            return Err(ValidationFailure::IndependenceFailed {
                ratio: 0.0,
                reason: "no axioms registered".to_string(),
            });
        }
        let mut haystacks = Vec::new();
        for (fact, ann) in snapshot {
            haystacks.push(fact.content.to_lowercase());
            haystacks.extend(ann.derivations.iter().map(|d| d.target().to_lowercase()));
        }

        let mut aligned = 0usize;
        let mut best: Option<(&DomainAxiom, usize)> = None;
        for axiom in axioms {
            let matched = axiom.matched_concepts(&haystacks);
            if matched == 0 {
                continue;
            }
            aligned += 1;
            // strict > keeps the earliest registered axiom on ties
            if best.is_none_or(|(_, n)| matched > n) {
                best = Some((axiom, matched));
            }
        }

        let ratio = aligned as f64 / axioms.len() as f64;
        match best {
            Some((axiom, _)) if ratio >= self.independence_min_ratio => Ok(axiom.name.clone()),
            _ => Err(ValidationFailure::IndependenceFailed {
                ratio,
                reason: format!(
                    "{aligned}/{} axioms overlap, need {:.2}",
                    axioms.len(),
                    self.independence_min_ratio
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::annotation::Derivation;
    use crate::fact::FactStatus;
    use crate::phantom::PhantomKey;

    fn pla_annotation(confidence: f64) -> Annotation {
        Annotation::new(confidence)
            .with_derivation(Derivation::positive("temperature"))
            .with_derivation(Derivation::positive("polymer"))
            .with_derivation(Derivation::negative("cold", Some("no gel below 60C")))
    }

    fn axioms() -> Vec<DomainAxiom> {
        vec![
            DomainAxiom::new("thermal", ["temperature", "gelling"]),
            DomainAxiom::new("materials", ["polymer", "pla"]),
        ]
    }

    fn setup(ann: Annotation) -> (FactStore, PhantomRecord) {
        let mut store = FactStore::new();
        let id = store
            .add_fact("PLA requires 60°C for gelling", ann)
            .unwrap()
            .id;
        let rec = PhantomRecord::new(PhantomKey::fact("c", id), BTreeSet::from([id]), 0);
        (store, rec)
    }

    fn validator() -> GrainValidator {
        GrainValidator::new(&PipelineConfig::default())
    }

    #[test]
    fn test_passes_all_checks() {
        let (store, rec) = setup(pla_annotation(0.92));
        let v = validator().validate(&rec, &store, &axioms()).unwrap();
        assert_eq!(v.facts().len(), 1);
        // both axioms match two concepts; the earlier one wins the tie
        assert_eq!(v.axiom_link(), "thermal");
    }

    #[test]
    fn test_persistence_threshold_is_strict() {
        let (store, rec) = setup(pla_annotation(0.7));
        let err = validator().validate(&rec, &store, &axioms()).unwrap_err();
        assert_eq!(err.check(), "persistence");
    }

    #[test]
    fn test_persistence_requires_active_fact() {
        let (mut store, rec) = setup(pla_annotation(0.92));
        store.set_status(1, FactStatus::Archived).unwrap();
        let err = validator().validate(&rec, &store, &axioms()).unwrap_err();
        assert!(matches!(err, ValidationFailure::PersistenceFailed { .. }));
    }

    #[test]
    fn test_resistance_zero_derivations_fails() {
        let (store, rec) = setup(Annotation::new(0.92));
        let err = validator().validate(&rec, &store, &axioms()).unwrap_err();
        assert!(matches!(
            err,
            ValidationFailure::ResistanceFailed { ratio, .. } if ratio == 0.0
        ));
    }

    #[test]
    fn test_resistance_ratio() {
        let ann = Annotation::new(0.92)
            .with_derivation(Derivation::positive("temperature"))
            .with_derivation(Derivation::boundary("temperature", "above 60C"));
        let (store, rec) = setup(ann);
        let err = validator().validate(&rec, &store, &axioms()).unwrap_err();
        assert!(matches!(
            err,
            ValidationFailure::ResistanceFailed { ratio, .. } if (ratio - 0.5).abs() < 1e-12
        ));
    }

    #[test]
    fn test_independence_short_circuits() {
        let (store, rec) = setup(pla_annotation(0.92));
        let unrelated = vec![
            DomainAxiom::new("thermal", ["temperature"]),
            DomainAxiom::new("finance", ["interest"]),
            DomainAxiom::new("law", ["statute"]),
        ];
        let err = validator().validate(&rec, &store, &unrelated).unwrap_err();
        match err {
            ValidationFailure::IndependenceFailed { ratio, .. } => {
                assert!((ratio - 1.0 / 3.0).abs() < 1e-12)
            }
            other => panic!("expected independence failure, got {other:?}"),
        }
    }

    #[test]
    fn test_independence_zero_axioms_fails() {
        let (store, rec) = setup(pla_annotation(0.92));
        let err = validator().validate(&rec, &store, &[]).unwrap_err();
        assert_eq!(err.check(), "independence");
    }

    #[test]
    fn test_axiom_link_prefers_most_matches() {
        let (store, rec) = setup(pla_annotation(0.92));
        let axioms = vec![
            DomainAxiom::new("thermal", ["temperature"]),
            DomainAxiom::new("materials", ["polymer", "pla", "gelling"]),
        ];
        let v = validator().validate(&rec, &store, &axioms).unwrap();
        assert_eq!(v.axiom_link(), "materials");
    }

    #[test]
    fn test_batch_runs_every_check() {
        let mut store = FactStore::new();
        let good = store
            .add_fact("PLA requires 60°C for gelling", pla_annotation(0.92))
            .unwrap()
            .id;
        // low confidence and no derivations: two failures on one phantom
        let weak = store
            .add_fact("agar gelling", Annotation::new(0.5))
            .unwrap()
            .id;
        let phantoms = [
            PhantomRecord::new(PhantomKey::fact("c", good), BTreeSet::from([good]), 0),
            PhantomRecord::new(PhantomKey::fact("c", weak), BTreeSet::from([weak]), 0),
            PhantomRecord::new(PhantomKey::fact("c", 99), BTreeSet::from([99]), 0),
        ];

        let axioms = vec![DomainAxiom::new("thermal", ["gelling"])];
        let report = validator().validate_batch(&phantoms, &store, &axioms);
        assert_eq!(report.total, 3);
        assert_eq!(report.passed_persistence, 1);
        assert_eq!(report.passed_resistance, 1);
        // the weak fact still overlaps the axiom
        assert_eq!(report.passed_independence, 2);
        assert_eq!(report.passed_all, 1);
        assert_eq!(report.ready, vec![PhantomKey::fact("c", good)]);

        let (key, failures) = &report.rejected[0];
        assert_eq!(*key, PhantomKey::fact("c", weak));
        let checks: Vec<_> = failures.iter().map(|f| f.check()).collect();
        assert_eq!(checks, vec!["persistence", "resistance"]);
        // a phantom with no surviving facts fails all three
        assert_eq!(report.rejected[1].1.len(), 3);
        assert!((report.rejection_rate() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(BatchReport::default().rejection_rate(), 0.0);
    }

    #[test]
    fn test_failure_roundtrips_as_tagged_json() {
        let f = ValidationFailure::ResistanceFailed {
            ratio: 0.5,
            reason: "x".into(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains(r#""check":"resistance_failed""#));
        assert_eq!(serde_json::from_str::<ValidationFailure>(&json).unwrap(), f);
    }
}
