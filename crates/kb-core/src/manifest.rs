//! Descriptive metadata attached to a cartridge.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub description: String,
    pub domains: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub updated_at: Option<u64>,
}

impl Manifest {
    /// Fold an update in. A blank description keeps the current one;
    /// domains and tags accumulate. Returns true when anything changed.
    pub fn merge<D, T>(&mut self, description: &str, domains: D, tags: T, now: u64) -> bool
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        let mut changed = false;
        let description = description.trim();
        if !description.is_empty() && description != self.description {
            self.description = description.to_string();
            changed = true;
        }
        changed |= extend(&mut self.domains, domains);
        changed |= extend(&mut self.tags, tags);
        if changed {
            self.updated_at = Some(now);
        }
        changed
    }
}

fn extend<I>(set: &mut BTreeSet<String>, items: I) -> bool
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut changed = false;
    for item in items {
        let item = item.as_ref().trim();
        if !item.is_empty() {
            changed |= set.insert(item.to_string());
        }
    }
    changed
}
