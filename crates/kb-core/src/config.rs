use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{KbError, Result};

/// Every tunable threshold of the detection → validation → compression
/// pipeline. Missing fields deserialize to the defaults in [`crate::constants`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub promotion_min_hits: u64,
    pub promotion_min_mean_confidence: f64,
    pub lock_min_cycle_span: u64,
    pub lock_max_trend_variance: f64,
    pub lock_trend_window: usize,
    pub persistence_min_confidence: f64,
    pub resistance_min_ratio: f64,
    pub independence_min_ratio: f64,
    pub grain_top_derivations: usize,
    pub weight_scale: f64,
    pub weight_hit_blend: f64,
    pub weight_confidence_blend: f64,
    pub weight_lock_blend: f64,
    pub hit_score_saturation: f64,
    pub lock_score_saturation: f64,
    pub cycle_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            promotion_min_hits: PROMOTION_MIN_HITS,
            promotion_min_mean_confidence: PROMOTION_MIN_MEAN_CONFIDENCE,
            lock_min_cycle_span: LOCK_MIN_CYCLE_SPAN,
            lock_max_trend_variance: LOCK_MAX_TREND_VARIANCE,
            lock_trend_window: LOCK_TREND_WINDOW,
            persistence_min_confidence: PERSISTENCE_MIN_CONFIDENCE,
            resistance_min_ratio: RESISTANCE_MIN_RATIO,
            independence_min_ratio: INDEPENDENCE_MIN_RATIO,
            grain_top_derivations: GRAIN_TOP_DERIVATIONS,
            weight_scale: WEIGHT_SCALE,
            weight_hit_blend: WEIGHT_HIT_BLEND,
            weight_confidence_blend: WEIGHT_CONFIDENCE_BLEND,
            weight_lock_blend: WEIGHT_LOCK_BLEND,
            hit_score_saturation: HIT_SCORE_SATURATION,
            lock_score_saturation: LOCK_SCORE_SATURATION,
            cycle_every: DEFAULT_CYCLE_EVERY,
        }
    }
}

impl PipelineConfig {
    /// Reject values the pipeline cannot run with: zero windows or
    /// intervals, non-positive saturations, and out-of-range ratios.
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: u64| {
            if v == 0 {
                Err(KbError::InvalidConfig(format!("{name} must be at least 1")))
            } else {
                Ok(())
            }
        };
        positive("cycle_every", self.cycle_every)?;
        positive("lock_trend_window", self.lock_trend_window as u64)?;
        positive("grain_top_derivations", self.grain_top_derivations as u64)?;

        for (name, v) in [
            ("promotion_min_mean_confidence", self.promotion_min_mean_confidence),
            ("persistence_min_confidence", self.persistence_min_confidence),
            ("resistance_min_ratio", self.resistance_min_ratio),
            ("independence_min_ratio", self.independence_min_ratio),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(KbError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {v}"
                )));
            }
        }
        for (name, v) in [
            ("hit_score_saturation", self.hit_score_saturation),
            ("lock_score_saturation", self.lock_score_saturation),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(KbError::InvalidConfig(format!(
                    "{name} must be finite and positive, got {v}"
                )));
            }
        }
        for (name, v) in [
            ("lock_max_trend_variance", self.lock_max_trend_variance),
            ("weight_scale", self.weight_scale),
            ("weight_hit_blend", self.weight_hit_blend),
            ("weight_confidence_blend", self.weight_confidence_blend),
            ("weight_lock_blend", self.weight_lock_blend),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(KbError::InvalidConfig(format!(
                    "{name} must be finite and non-negative, got {v}"
                )));
            }
        }
        Ok(())
    }
}
