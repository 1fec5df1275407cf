//! Access-pattern candidates ("phantoms") awaiting crystallization.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fact::FactId;
use crate::stats::{mean, tail, variance};
use crate::validator::ValidationFailure;

/// What a phantom tracks: a single fact, or a multi-fact pattern.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhantomSubject {
    Fact(FactId),
    /// Sorted, de-duplicated member ids joined by `+`.
    Pattern(String),
}

impl PhantomSubject {
    pub fn pattern(fact_ids: &BTreeSet<FactId>) -> Self {
        let sig = fact_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("+");
        PhantomSubject::Pattern(sig)
    }

    /// Inverse of [`PhantomKey::signature`].
    pub fn parse(signature: &str) -> Option<Self> {
        let (kind, rest) = signature.split_once(':')?;
        match kind {
            "fact" => rest.parse().ok().map(PhantomSubject::Fact),
            "pattern" if !rest.is_empty() => Some(PhantomSubject::Pattern(rest.to_string())),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhantomKey {
    pub cartridge_id: String,
    pub subject: PhantomSubject,
}

impl PhantomKey {
    pub fn fact(cartridge_id: &str, fact_id: FactId) -> Self {
        Self {
            cartridge_id: cartridge_id.to_string(),
            subject: PhantomSubject::Fact(fact_id),
        }
    }

    pub fn pattern(cartridge_id: &str, fact_ids: &BTreeSet<FactId>) -> Self {
        Self {
            cartridge_id: cartridge_id.to_string(),
            subject: PhantomSubject::pattern(fact_ids),
        }
    }

    pub fn from_signature(cartridge_id: &str, signature: &str) -> Option<Self> {
        Some(Self {
            cartridge_id: cartridge_id.to_string(),
            subject: PhantomSubject::parse(signature)?,
        })
    }

    /// Cartridge-local identity, e.g. `fact:12` or `pattern:3+7`.
    pub fn signature(&self) -> String {
        match &self.subject {
            PhantomSubject::Fact(id) => format!("fact:{id}"),
            PhantomSubject::Pattern(sig) => format!("pattern:{sig}"),
        }
    }
}

impl fmt::Display for PhantomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cartridge_id, self.signature())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhantomStatus {
    Incubating,
    Persistent,
    Locked,
}

impl PhantomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhantomStatus::Incubating => "incubating",
            PhantomStatus::Persistent => "persistent",
            PhantomStatus::Locked => "locked",
        }
    }
}

impl fmt::Display for PhantomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhantomRecord {
    pub key: PhantomKey,
    pub fact_ids: BTreeSet<FactId>,
    pub hit_count: u64,
    /// Every hit's confidence, in arrival order. Append-only.
    pub confidence_history: Vec<f64>,
    /// One mean-confidence entry per cycle spent persistent.
    pub trend: Vec<f64>,
    /// Confidences recorded since the last cycle boundary.
    #[serde(default)]
    pub pending: Vec<f64>,
    /// How many hits named each concept in their query context.
    #[serde(default)]
    pub concept_hits: BTreeMap<String, u64>,
    pub first_seen_cycle: u64,
    pub cycles_active: u64,
    pub status: PhantomStatus,
    #[serde(default)]
    pub locked_at_cycle: Option<u64>,
    /// Set once a grain for this phantom has been committed.
    #[serde(default)]
    pub grain_id: Option<String>,
    #[serde(default)]
    pub last_failure: Option<ValidationFailure>,
}

impl PhantomRecord {
    pub fn new(key: PhantomKey, fact_ids: BTreeSet<FactId>, cycle: u64) -> Self {
        Self {
            key,
            fact_ids,
            hit_count: 0,
            confidence_history: Vec::new(),
            trend: Vec::new(),
            pending: Vec::new(),
            concept_hits: BTreeMap::new(),
            first_seen_cycle: cycle,
            cycles_active: 0,
            status: PhantomStatus::Incubating,
            locked_at_cycle: None,
            grain_id: None,
            last_failure: None,
        }
    }

    pub fn mean_confidence(&self) -> f64 {
        mean(&self.confidence_history)
    }

    /// Variance over the trailing `window` trend entries.
    pub fn trend_variance(&self, window: usize) -> f64 {
        variance(tail(&self.trend, window))
    }

    /// `cycles_active - first_seen_cycle`, floored at zero.
    pub fn lock_span(&self) -> u64 {
        self.cycles_active.saturating_sub(self.first_seen_cycle)
    }

    pub fn concept_hit_count(&self, concept: &str) -> u64 {
        self.concept_hits.get(concept).copied().unwrap_or(0)
    }

    pub fn is_consumed(&self) -> bool {
        self.grain_id.is_some()
    }

    /// Locked and still waiting for a committed grain.
    pub fn awaiting_grain(&self) -> bool {
        self.status == PhantomStatus::Locked && !self.is_consumed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures() {
        assert_eq!(PhantomKey::fact("materials", 12).signature(), "fact:12");
        let ids = BTreeSet::from([7, 3, 7]);
        assert_eq!(
            PhantomKey::pattern("materials", &ids).signature(),
            "pattern:3+7"
        );
        assert_eq!(
            PhantomKey::fact("materials", 1).to_string(),
            "materials/fact:1"
        );
    }

    #[test]
    fn test_signature_parse() {
        let ids = BTreeSet::from([3, 7]);
        let key = PhantomKey::pattern("m", &ids);
        assert_eq!(PhantomKey::from_signature("m", &key.signature()), Some(key));
        assert_eq!(
            PhantomKey::from_signature("m", "fact:12"),
            Some(PhantomKey::fact("m", 12))
        );
        assert!(PhantomSubject::parse("fact:x").is_none());
        assert!(PhantomSubject::parse("grain:1").is_none());
    }

    #[test]
    fn test_lock_span_saturates() {
        let mut rec = PhantomRecord::new(PhantomKey::fact("c", 1), BTreeSet::from([1]), 10);
        rec.cycles_active = 4;
        assert_eq!(rec.lock_span(), 0);
        rec.cycles_active = 61;
        assert_eq!(rec.lock_span(), 51);
    }

    #[test]
    fn test_record_json_defaults() {
        let rec = PhantomRecord::new(PhantomKey::fact("c", 1), BTreeSet::from([1]), 0);
        let mut value = serde_json::to_value(&rec).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("pending");
        obj.remove("concept_hits");
        obj.remove("grain_id");
        let back: PhantomRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, rec);
    }
}
