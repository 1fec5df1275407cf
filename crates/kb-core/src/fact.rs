use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::digest::content_hash;

/// Stable integer identity of a fact within its cartridge.
pub type FactId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactStatus {
    Active,
    Archived,
    Deprecated,
    Tombstone,
}

impl FactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactStatus::Active => "active",
            FactStatus::Archived => "archived",
            FactStatus::Deprecated => "deprecated",
            FactStatus::Tombstone => "tombstone",
        }
    }

    /// Allowed lifecycle moves. Tombstone is terminal; deprecation only
    /// leads to tombstone; archived facts may come back.
    pub fn can_transition_to(self, next: FactStatus) -> bool {
        use FactStatus::*;
        matches!(
            (self, next),
            (Active, Archived | Deprecated | Tombstone)
                | (Archived, Active | Deprecated | Tombstone)
                | (Deprecated, Tombstone)
        )
    }
}

impl fmt::Display for FactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(FactStatus::Active),
            "archived" => Ok(FactStatus::Archived),
            "deprecated" => Ok(FactStatus::Deprecated),
            "tombstone" => Ok(FactStatus::Tombstone),
            other => Err(format!("unknown fact status '{other}'")),
        }
    }
}

/// An atomic, content-addressed statement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub content: String,
    pub content_hash: String,
    pub status: FactStatus,
    pub access_count: u64,
    pub created_at: u64,
    pub last_accessed: Option<u64>,
}

impl Fact {
    pub fn new(id: FactId, content: &str, created_at: u64) -> Self {
        Self {
            id,
            content: content.to_string(),
            content_hash: content_hash(content),
            status: FactStatus::Active,
            access_count: 0,
            created_at,
            last_accessed: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FactStatus::Active
    }

    /// Record one access at `now`.
    pub fn touch(&mut self, now: u64) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = Some(now);
    }
}
