//! Deterministic transform of a validated phantom into a [`Grain`].
//!
//! No I/O. Given the same [`ValidatedPhantom`] the output is identical,
//! including `grain_id` and `validation_hash`, which is what makes a
//! crash between compression and commit safe to retry.

use std::collections::BTreeMap;

use serde_json::json;

use crate::annotation::{Derivation, DerivationKind};
use crate::config::PipelineConfig;
use crate::digest::{sha256_hex, short_digest};
use crate::fact::FactId;
use crate::grain::{DerivationPointer, Grain, LockState, TernaryDelta};
use crate::validator::ValidatedPhantom;

/// One derivation with its rank score.
#[derive(Debug, Clone)]
struct Ranked<'a> {
    fact_id: FactId,
    index: usize,
    derivation: &'a Derivation,
    score: f64,
}

pub struct TernaryCompressor {
    top_derivations: usize,
    weight_scale: f64,
    hit_blend: f64,
    confidence_blend: f64,
    lock_blend: f64,
    hit_saturation: f64,
    lock_saturation: f64,
}

impl TernaryCompressor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            top_derivations: config.grain_top_derivations,
            weight_scale: config.weight_scale,
            hit_blend: config.weight_hit_blend,
            confidence_blend: config.weight_confidence_blend,
            lock_blend: config.weight_lock_blend,
            hit_saturation: config.hit_score_saturation,
            lock_saturation: config.lock_score_saturation,
        }
    }

    pub fn compress(&self, validated: &ValidatedPhantom) -> Grain {
        let phantom = validated.phantom();
        let ranked = self.rank(validated);

        let mut delta = TernaryDelta::default();
        let mut pointer_map = BTreeMap::new();
        for r in ranked {
            let kind = r.derivation.kind();
            let reference = r.derivation.reference();
            if !kind.is_ternary() || delta.contains(&reference) {
                continue;
            }
            let slot = match kind {
                DerivationKind::PositiveDependency => &mut delta.pos,
                DerivationKind::NegativeFilter => &mut delta.neg,
                _ => &mut delta.void,
            };
            slot.insert(reference.clone());
            pointer_map.insert(
                reference,
                DerivationPointer {
                    fact_id: r.fact_id,
                    index: r.index,
                    kind,
                },
            );
        }

        let origin = phantom.key.signature();
        let cartridge = validated.cartridge_id();
        let created_cycle = created_cycle(validated);
        let grain_id = short_digest(&[&origin, cartridge, &created_cycle.to_string()], 16);

        Grain {
            grain_id,
            cartridge_source: cartridge.to_string(),
            phantom_origin: origin,
            axiom_link: validated.axiom_link().to_string(),
            weight: self.weight(validated),
            delta,
            lock_state: LockState::Validated,
            pointer_map,
            cycle_count: phantom.cycles_active,
            created_cycle,
            hit_count: phantom.hit_count,
            confidence: phantom.mean_confidence(),
            supersedes: None,
            validation_hash: self.validation_hash(validated),
        }
    }

    /// Recompute the validation hash and grain id from the inputs.
    pub fn verify(&self, grain: &Grain, validated: &ValidatedPhantom) -> bool {
        let origin = validated.phantom().key.signature();
        let expected_id = short_digest(
            &[
                &origin,
                validated.cartridge_id(),
                &created_cycle(validated).to_string(),
            ],
            16,
        );
        grain.grain_id == expected_id && grain.validation_hash == self.validation_hash(validated)
    }

    /// Blend of hit volume, mean confidence, and lock duration, each
    /// saturated to [0, 1], scaled around `weight_scale`.
    pub fn weight(&self, validated: &ValidatedPhantom) -> f64 {
        let p = validated.phantom();
        let hit_score = (p.hit_count as f64 / self.hit_saturation).min(1.0);
        let confidence_score = p.mean_confidence();
        let lock_score = (p.cycles_active as f64 / self.lock_saturation).min(1.0);
        self.weight_scale
            * (self.hit_blend * hit_score
                + self.confidence_blend * confidence_score
                + self.lock_blend * lock_score)
    }

    /// Facts in id order, derivations in list order, then a stable
    /// descending sort on `concept hits * fact confidence`.
    fn rank<'a>(&self, validated: &'a ValidatedPhantom) -> Vec<Ranked<'a>> {
        let phantom = validated.phantom();
        let mut ranked: Vec<Ranked<'a>> = validated
            .facts()
            .iter()
            .flat_map(|(fact, ann)| {
                ann.derivations
                    .iter()
                    .enumerate()
                    .map(move |(index, derivation)| Ranked {
                        fact_id: fact.id,
                        index,
                        derivation,
                        score: phantom.concept_hit_count(&derivation.reference()) as f64
                            * ann.confidence,
                    })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(self.top_derivations);
        ranked
    }

    fn validation_hash(&self, validated: &ValidatedPhantom) -> String {
        let p = validated.phantom();
        let facts: Vec<_> = validated
            .facts()
            .iter()
            .map(|(fact, ann)| {
                json!({
                    "id": fact.id,
                    "content_hash": fact.content_hash,
                    "confidence": ann.confidence,
                    "derivations": ann.derivations,
                })
            })
            .collect();
        let input = json!({
            "cartridge": validated.cartridge_id(),
            "phantom_origin": p.key.signature(),
            "axiom_link": validated.axiom_link(),
            "hit_count": p.hit_count,
            "confidence_history": p.confidence_history,
            "concept_hits": p.concept_hits,
            "cycles_active": p.cycles_active,
            "created_cycle": created_cycle(validated),
            "facts": facts,
            "top_derivations": self.top_derivations,
        });
        sha256_hex(input.to_string().as_bytes())
    }
}

fn created_cycle(validated: &ValidatedPhantom) -> u64 {
    let p = validated.phantom();
    p.locked_at_cycle
        .unwrap_or(p.first_seen_cycle + p.cycles_active)
}
