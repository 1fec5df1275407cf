//! Default pipeline thresholds.
//!
//! None of these are derived; they are the shipped defaults for
//! [`PipelineConfig`](crate::config::PipelineConfig) and every one of them
//! can be overridden per library via `kitbash.toml`.

/// Promotion: minimum hits before a phantom can become persistent.
pub const PROMOTION_MIN_HITS: u64 = 5;

/// Promotion: minimum mean confidence across the hit history.
pub const PROMOTION_MIN_MEAN_CONFIDENCE: f64 = 0.75;

/// Harmonic lock: `cycles_active - first_seen_cycle` must exceed this.
pub const LOCK_MIN_CYCLE_SPAN: u64 = 50;

/// Harmonic lock: trend variance must stay strictly below this.
pub const LOCK_MAX_TREND_VARIANCE: f64 = 0.05;

/// Harmonic lock: number of trailing trend entries the variance covers.
pub const LOCK_TREND_WINDOW: usize = 10;

/// Persistence check: annotation confidence must be strictly above this.
pub const PERSISTENCE_MIN_CONFIDENCE: f64 = 0.7;

/// Resistance check: minimum share of ternary-expressible derivations.
pub const RESISTANCE_MIN_RATIO: f64 = 0.8;

/// Independence check: minimum share of axioms whose concepts overlap.
pub const INDEPENDENCE_MIN_RATIO: f64 = 0.6;

/// Compressor: derivations kept after ranking.
pub const GRAIN_TOP_DERIVATIONS: usize = 5;

/// Compressor: equilibrium scale applied to the blended score.
pub const WEIGHT_SCALE: f64 = 1.58;

/// Compressor: blend factor for the hit score.
pub const WEIGHT_HIT_BLEND: f64 = 0.4;

/// Compressor: blend factor for the confidence score.
pub const WEIGHT_CONFIDENCE_BLEND: f64 = 0.4;

/// Compressor: blend factor for the lock score.
pub const WEIGHT_LOCK_BLEND: f64 = 0.2;

/// Compressor: hits at which the hit score saturates.
pub const HIT_SCORE_SATURATION: f64 = 100.0;

/// Compressor: active cycles at which the lock score saturates.
pub const LOCK_SCORE_SATURATION: f64 = 100.0;

/// Driver: raw queries per scheduler cycle.
pub const DEFAULT_CYCLE_EVERY: u64 = 10;
