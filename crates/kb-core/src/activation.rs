//! In-memory ternary lookup over the grains of activated cartridges.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KbError, Missing, Result};
use crate::grain::Grain;

/// Answer of a ternary lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ternary {
    Negative,
    Void,
    Positive,
}

impl Ternary {
    pub fn as_i8(self) -> i8 {
        match self {
            Ternary::Negative => -1,
            Ternary::Void => 0,
            Ternary::Positive => 1,
        }
    }
}

impl fmt::Display for Ternary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Ternary::Negative => "-1",
            Ternary::Void => "0",
            Ternary::Positive => "+1",
        })
    }
}

#[derive(Debug, Default)]
struct ActiveGrain {
    pos: HashSet<String>,
    neg: HashSet<String>,
}

/// grain_id → ref sets, plus which grains each cartridge contributed.
#[derive(Debug, Default)]
pub struct ActivationTable {
    grains: HashMap<String, ActiveGrain>,
    by_cartridge: HashMap<String, Vec<String>>,
}

impl ActivationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a cartridge's grains, replacing any previous activation of it.
    /// Returns how many grains are now active for the cartridge.
    pub fn activate<'a>(
        &mut self,
        cartridge: &str,
        grains: impl IntoIterator<Item = &'a Grain>,
    ) -> usize {
        self.deactivate(cartridge);
        self.by_cartridge.entry(cartridge.to_string()).or_default();
        for grain in grains {
            self.insert(cartridge, grain);
        }
        self.by_cartridge.get(cartridge).map_or(0, Vec::len)
    }

    /// Drop a cartridge's grains from memory. Returns how many were removed.
    pub fn deactivate(&mut self, cartridge: &str) -> usize {
        let Some(ids) = self.by_cartridge.remove(cartridge) else {
            return 0;
        };
        for id in &ids {
            self.grains.remove(id);
        }
        ids.len()
    }

    /// Add one grain to an already-active cartridge.
    pub fn insert(&mut self, cartridge: &str, grain: &Grain) {
        let entry = ActiveGrain {
            pos: grain.delta.pos.iter().cloned().collect(),
            neg: grain.delta.neg.iter().cloned().collect(),
        };
        if self.grains.insert(grain.grain_id.clone(), entry).is_none() {
            self.by_cartridge
                .entry(cartridge.to_string())
                .or_default()
                .push(grain.grain_id.clone());
        }
    }

    pub fn is_active(&self, cartridge: &str) -> bool {
        self.by_cartridge.contains_key(cartridge)
    }

    pub fn active_cartridges(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_cartridge.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.grains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grains.is_empty()
    }

    /// +1 if `signal` is a positive ref, -1 if negative, 0 otherwise.
    /// Void membership and absence both read as 0.
    pub fn ternary_query(&self, grain_id: &str, signal: &str) -> Result<Ternary> {
        let grain = self
            .grains
            .get(grain_id)
            .ok_or_else(|| KbError::NotFound(Missing::Grain(grain_id.to_string())))?;
        let signal = signal.trim().to_lowercase();
        Ok(if grain.pos.contains(&signal) {
            Ternary::Positive
        } else if grain.neg.contains(&signal) {
            Ternary::Negative
        } else {
            Ternary::Void
        })
    }
}
