//! Kitbash cartridge engine.
//!
//! A cartridge is a store of deduplicated, annotated facts. Repeated, stable
//! access to the same facts is tracked as a "phantom"; once a phantom holds a
//! steady confidence trend long enough it locks, is validated against the
//! cartridge's domain axioms, and is compressed into an immutable ternary
//! "grain" with O(1) +1 / -1 / 0 lookup.
//!
//! Zero I/O. Persistence lives in `kb-store`.

pub mod activation;
pub mod annotation;
pub mod axiom;
pub mod cartridge;
pub mod compressor;
pub mod config;
pub mod constants;
pub mod digest;
pub mod error;
pub mod fact;
pub mod fact_store;
pub mod grain;
pub mod manifest;
pub mod packing;
pub mod phantom;
pub mod scheduler;
pub mod stats;
pub mod time;
pub mod tokenizer;
pub mod tracker;
pub mod validator;

pub use activation::{ActivationTable, Ternary};
pub use annotation::{
    Annotation, Derivation, DerivationKind, EpistemicLevel, FactContext, RelationKind,
    Relationship, TemporalValidity,
};
pub use axiom::DomainAxiom;
pub use cartridge::{CartridgeState, CartridgeStats, CycleReport};
pub use compressor::TernaryCompressor;
pub use config::PipelineConfig;
pub use error::{KbError, Missing, Result};
pub use fact::{Fact, FactId, FactStatus};
pub use fact_store::{AddedFact, FactStore};
pub use grain::{DerivationPointer, Grain, GrainSummary, LockState, TernaryDelta};
pub use manifest::Manifest;
pub use packing::{CompressionStats, GrainMetrics, PackedDelta};
pub use phantom::{PhantomKey, PhantomRecord, PhantomStatus, PhantomSubject};
pub use scheduler::{CycleAdvance, CycleDriver, CycleScheduler};
pub use tokenizer::{keyword_set, normalize_keywords, tokenize};
pub use tracker::AccessTracker;
pub use validator::{BatchReport, GrainValidator, ValidatedPhantom, ValidationFailure};
