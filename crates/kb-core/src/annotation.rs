//! Fact annotations: confidence, provenance, epistemic level, and the
//! typed derivations the validator and compressor reason over.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};
use crate::fact::FactId;

/// Ordered by immutability: a lower level cannot be overridden by a higher one.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EpistemicLevel {
    #[default]
    Empirical = 0,
    Narrative = 1,
    Axiomatic = 2,
    Persona = 3,
}

impl EpistemicLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpistemicLevel::Empirical => "empirical",
            EpistemicLevel::Narrative => "narrative",
            EpistemicLevel::Axiomatic => "axiomatic",
            EpistemicLevel::Persona => "persona",
        }
    }

    /// Whether a statement at this level may replace one at `existing`.
    pub fn can_override(self, existing: EpistemicLevel) -> bool {
        self <= existing
    }
}

impl fmt::Display for EpistemicLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpistemicLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "empirical" | "l0" => Ok(EpistemicLevel::Empirical),
            "narrative" | "l1" => Ok(EpistemicLevel::Narrative),
            "axiomatic" | "l2" => Ok(EpistemicLevel::Axiomatic),
            "persona" | "l3" => Ok(EpistemicLevel::Persona),
            other => Err(format!("unknown epistemic level '{other}'")),
        }
    }
}

/// Discriminant of a [`Derivation`], used for reporting and partitioning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationKind {
    PositiveDependency,
    NegativeFilter,
    Independent,
    Boundary,
    RangeConstraint,
}

impl DerivationKind {
    /// Kinds that map directly onto a ternary +1 / -1 / 0 slot.
    pub fn is_ternary(self) -> bool {
        matches!(
            self,
            DerivationKind::PositiveDependency
                | DerivationKind::NegativeFilter
                | DerivationKind::Independent
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationKind::PositiveDependency => "positive_dependency",
            DerivationKind::NegativeFilter => "negative_filter",
            DerivationKind::Independent => "independent",
            DerivationKind::Boundary => "boundary",
            DerivationKind::RangeConstraint => "range_constraint",
        }
    }
}

impl fmt::Display for DerivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed relation from a fact to some target concept.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Derivation {
    /// The fact holds because `target` holds.
    PositiveDependency { target: String },
    /// The fact excludes `target`.
    NegativeFilter {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The fact is unaffected by `target`.
    Independent { target: String },
    /// `target` marks an edge condition of the fact.
    Boundary { target: String, condition: String },
    /// `target` must fall inside `[min, max]`.
    RangeConstraint { target: String, min: f64, max: f64 },
}

impl Derivation {
    pub fn positive(target: &str) -> Self {
        Derivation::PositiveDependency {
            target: target.to_string(),
        }
    }

    pub fn negative(target: &str, reason: Option<&str>) -> Self {
        Derivation::NegativeFilter {
            target: target.to_string(),
            reason: reason.map(str::to_string),
        }
    }

    pub fn independent(target: &str) -> Self {
        Derivation::Independent {
            target: target.to_string(),
        }
    }

    pub fn boundary(target: &str, condition: &str) -> Self {
        Derivation::Boundary {
            target: target.to_string(),
            condition: condition.to_string(),
        }
    }

    /// Fails when the bounds are not finite or `min > max`.
    pub fn range(target: &str, min: f64, max: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(KbError::InvalidAnnotation(format!(
                "range constraint on '{target}' has invalid bounds [{min}, {max}]"
            )));
        }
        Ok(Derivation::RangeConstraint {
            target: target.to_string(),
            min,
            max,
        })
    }

    pub fn target(&self) -> &str {
        match self {
            Derivation::PositiveDependency { target }
            | Derivation::NegativeFilter { target, .. }
            | Derivation::Independent { target }
            | Derivation::Boundary { target, .. }
            | Derivation::RangeConstraint { target, .. } => target,
        }
    }

    pub fn kind(&self) -> DerivationKind {
        match self {
            Derivation::PositiveDependency { .. } => DerivationKind::PositiveDependency,
            Derivation::NegativeFilter { .. } => DerivationKind::NegativeFilter,
            Derivation::Independent { .. } => DerivationKind::Independent,
            Derivation::Boundary { .. } => DerivationKind::Boundary,
            Derivation::RangeConstraint { .. } => DerivationKind::RangeConstraint,
        }
    }

    /// Lower-cased target, the key a grain uses for this derivation.
    pub fn reference(&self) -> String {
        self.target().trim().to_lowercase()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Supports,
    Contradicts,
    Refines,
    Supersedes,
    RelatedTo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub fact_id: FactId,
    pub kind: RelationKind,
}

/// Optional validity window in unix seconds. Missing ends are open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalValidity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

impl TemporalValidity {
    pub fn is_valid_at(&self, t: u64) -> bool {
        self.start.is_none_or(|s| t >= s) && self.end.is_none_or(|e| t <= e)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactContext {
    pub domain: String,
    pub subdomains: Vec<String>,
    pub applies_to: BTreeSet<String>,
    pub excludes: BTreeSet<String>,
}

/// Metadata attached 1:1 to a fact. Written once; the first write wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub temporal_validity: TemporalValidity,
    #[serde(default)]
    pub epistemic_level: EpistemicLevel,
    #[serde(default)]
    pub derivations: Vec<Derivation>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub context: FactContext,
}

impl Default for Annotation {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Annotation {
    pub fn new(confidence: f64) -> Self {
        Self {
            confidence,
            sources: Vec::new(),
            temporal_validity: TemporalValidity::default(),
            epistemic_level: EpistemicLevel::default(),
            derivations: Vec::new(),
            relationships: Vec::new(),
            context: FactContext::default(),
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.sources.push(source.to_string());
        self
    }

    pub fn with_level(mut self, level: EpistemicLevel) -> Self {
        self.epistemic_level = level;
        self
    }

    pub fn with_derivation(mut self, derivation: Derivation) -> Self {
        self.derivations.push(derivation);
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.context.domain = domain.to_string();
        self
    }

    pub fn with_relationship(mut self, fact_id: FactId, kind: RelationKind) -> Self {
        self.relationships.push(Relationship { fact_id, kind });
        self
    }

    /// Structural checks applied before a fact is stored.
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(KbError::InvalidAnnotation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if let (Some(start), Some(end)) = (self.temporal_validity.start, self.temporal_validity.end)
            && start > end
        {
            return Err(KbError::InvalidAnnotation(format!(
                "temporal validity starts ({start}) after it ends ({end})"
            )));
        }
        for d in &self.derivations {
            if d.target().trim().is_empty() {
                return Err(KbError::InvalidAnnotation(format!(
                    "{} derivation has an empty target",
                    d.kind()
                )));
            }
            if let Derivation::RangeConstraint { target, min, max } = d
                && (!min.is_finite() || !max.is_finite() || min > max)
            {
                return Err(KbError::InvalidAnnotation(format!(
                    "range constraint on '{target}' has invalid bounds [{min}, {max}]"
                )));
            }
        }
        Ok(())
    }

    /// Share of derivations whose kind is ternary-expressible.
    /// `None` when there are no derivations at all.
    pub fn ternary_ratio(&self) -> Option<f64> {
        if self.derivations.is_empty() {
            return None;
        }
        let ternary = self
            .derivations
            .iter()
            .filter(|d| d.kind().is_ternary())
            .count();
        Some(ternary as f64 / self.derivations.len() as f64)
    }
}
