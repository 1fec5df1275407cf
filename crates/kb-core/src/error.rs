use std::fmt;

use thiserror::Error;

use crate::fact::{FactId, FactStatus};

/// What a lookup failed to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Fact(FactId),
    Annotation(FactId),
    Grain(String),
    Phantom(String),
    Cartridge(String),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Fact(id) => write!(f, "fact {id}"),
            Missing::Annotation(id) => write!(f, "annotation for fact {id}"),
            Missing::Grain(id) => write!(f, "grain {id}"),
            Missing::Phantom(sig) => write!(f, "phantom {sig}"),
            Missing::Cartridge(name) => write!(f, "cartridge {name}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KbError {
    #[error("not found: {0}")]
    NotFound(Missing),

    /// The keyword index names a fact that does not exist.
    #[error("corrupt index: token '{token}' references missing fact {fact_id}")]
    CorruptIndex { token: String, fact_id: FactId },

    #[error("invalid fact: {0}")]
    InvalidFact(String),

    #[error("invalid annotation: {0}")]
    InvalidAnnotation(String),

    #[error("confidence must be finite and within [0, 1], got {0}")]
    InvalidConfidence(f64),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("fact {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: FactId,
        from: FactStatus,
        to: FactStatus,
    },

    #[error("fact {id}: {attempted} annotation cannot override {existing}")]
    EpistemicOverride {
        id: FactId,
        existing: String,
        attempted: String,
    },
}

pub type Result<T> = std::result::Result<T, KbError>;
