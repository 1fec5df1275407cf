//! Immutable ternary records produced by the compressor.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::annotation::DerivationKind;
use crate::fact::FactId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Validated,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Validated => "validated",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-way partition of derivation refs. A ref sits in at most one set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TernaryDelta {
    pub pos: BTreeSet<String>,
    pub neg: BTreeSet<String>,
    pub void: BTreeSet<String>,
}

impl TernaryDelta {
    pub fn len(&self) -> usize {
        self.pos.len() + self.neg.len() + self.void.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, r: &str) -> bool {
        self.pos.contains(r) || self.neg.contains(r) || self.void.contains(r)
    }

    /// True when no ref appears in two sets.
    pub fn is_disjoint(&self) -> bool {
        self.pos.is_disjoint(&self.neg)
            && self.pos.is_disjoint(&self.void)
            && self.neg.is_disjoint(&self.void)
    }
}

/// Where a grain ref came from on its source fact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationPointer {
    pub fact_id: FactId,
    /// Position in the fact's derivation list.
    pub index: usize,
    pub kind: DerivationKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grain {
    pub grain_id: String,
    pub cartridge_source: String,
    /// Signature of the phantom this grain crystallized from.
    pub phantom_origin: String,
    pub axiom_link: String,
    pub weight: f64,
    pub delta: TernaryDelta,
    pub lock_state: LockState,
    pub pointer_map: BTreeMap<String, DerivationPointer>,
    pub cycle_count: u64,
    pub created_cycle: u64,
    pub hit_count: u64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    pub validation_hash: String,
}

impl Grain {
    pub fn summary(&self) -> GrainSummary {
        GrainSummary {
            grain_id: self.grain_id.clone(),
            phantom_origin: self.phantom_origin.clone(),
            axiom_link: self.axiom_link.clone(),
            lock_state: self.lock_state,
            weight: self.weight,
            created_cycle: self.created_cycle,
            supersedes: self.supersedes.clone(),
        }
    }
}

/// Registry row: enough to enumerate grains without loading them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrainSummary {
    pub grain_id: String,
    pub phantom_origin: String,
    pub axiom_link: String,
    pub lock_state: LockState,
    pub weight: f64,
    pub created_cycle: u64,
    pub supersedes: Option<String>,
}
