//! Bit-packed form of a grain's ternary delta, plus the size and shape
//! figures reported for a grain.
//!
//! Refs are laid out in sorted order. Position `i` sets bit `i % 8` of byte
//! `i / 8` in the positive plane for +1 and in the negative plane for -1;
//! a void ref leaves both clear.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::activation::Ternary;
use crate::grain::{Grain, TernaryDelta};
use crate::stats;

/// Dimensions of the float embedding a grain stands in for.
pub const EMBEDDING_DIMS: usize = 256;
/// Bytes of that embedding at 32-bit floats.
pub const EMBEDDING_BYTES: usize = EMBEDDING_DIMS * 4;

/// Hamming figure ceiling.
const MAX_INTERNAL_HAMMING: f64 = 8.0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedDelta {
    /// Number of packed positions.
    pub len: usize,
    pub positive: Vec<u8>,
    pub negative: Vec<u8>,
}

impl PackedDelta {
    pub fn pack(values: &[Ternary]) -> Self {
        let bytes = values.len().div_ceil(8);
        let mut positive = vec![0u8; bytes];
        let mut negative = vec![0u8; bytes];
        for (i, value) in values.iter().enumerate() {
            let plane = match value {
                Ternary::Positive => &mut positive,
                Ternary::Negative => &mut negative,
                Ternary::Void => continue,
            };
            plane[i / 8] |= 1 << (i % 8);
        }
        Self {
            len: values.len(),
            positive,
            negative,
        }
    }

    pub fn unpack(&self) -> Vec<Ternary> {
        (0..self.len)
            .map(|i| {
                let bit = |plane: &[u8]| plane.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0);
                if bit(&self.positive) {
                    Ternary::Positive
                } else if bit(&self.negative) {
                    Ternary::Negative
                } else {
                    Ternary::Void
                }
            })
            .collect()
    }

    pub fn byte_len(&self) -> usize {
        self.positive.len() + self.negative.len()
    }

    /// Rebuild the delta from the refs the values were packed against.
    /// `None` when the ref count does not match.
    pub fn unpack_delta(&self, refs: &[String]) -> Option<TernaryDelta> {
        if refs.len() != self.len {
            return None;
        }
        let mut delta = TernaryDelta::default();
        for (r, value) in refs.iter().zip(self.unpack()) {
            let slot = match value {
                Ternary::Positive => &mut delta.pos,
                Ternary::Negative => &mut delta.neg,
                Ternary::Void => &mut delta.void,
            };
            slot.insert(r.clone());
        }
        Some(delta)
    }
}

/// Shape of a grain's delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrainMetrics {
    pub positive: usize,
    pub negative: usize,
    pub void: usize,
    /// Spread between decided (+1/-1) and void refs, scaled to [0, 8].
    pub internal_hamming: f64,
    /// Imbalance between positive and negative refs relative to their mean.
    pub weight_skew: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub ternary_bytes: usize,
    pub embedding_bytes: usize,
    /// `ternary_bytes / embedding_bytes`, three decimals.
    pub compression_ratio: f64,
    /// One decimal.
    pub savings_percent: f64,
}

impl Grain {
    /// Every ref of the delta with its value, in ref order.
    pub fn ternary_values(&self) -> BTreeMap<&str, Ternary> {
        let mut values = BTreeMap::new();
        for (set, value) in [
            (&self.delta.pos, Ternary::Positive),
            (&self.delta.neg, Ternary::Negative),
            (&self.delta.void, Ternary::Void),
        ] {
            for r in set {
                values.entry(r.as_str()).or_insert(value);
            }
        }
        values
    }

    /// Refs in packing order alongside the packed planes.
    pub fn pack(&self) -> (Vec<String>, PackedDelta) {
        let values = self.ternary_values();
        let refs = values.keys().map(|r| r.to_string()).collect();
        let packed = PackedDelta::pack(&values.into_values().collect::<Vec<_>>());
        (refs, packed)
    }

    pub fn metrics(&self) -> GrainMetrics {
        let (positive, negative, void) = (
            self.delta.pos.len(),
            self.delta.neg.len(),
            self.delta.void.len(),
        );
        let decided: Vec<f64> = self
            .ternary_values()
            .values()
            .map(|v| if *v == Ternary::Void { 0.0 } else { 1.0 })
            .collect();
        let internal_hamming =
            (stats::sample_variance(&decided) * 10.0).min(MAX_INTERNAL_HAMMING);

        let counts = [positive as f64, negative as f64];
        let mean = stats::mean(&counts);
        let weight_skew = if mean == 0.0 {
            0.0
        } else {
            stats::sample_variance(&counts).sqrt() / mean
        };
        GrainMetrics {
            positive,
            negative,
            void,
            internal_hamming,
            weight_skew,
        }
    }

    pub fn compression_stats(&self) -> CompressionStats {
        let ternary_bytes = self.pack().1.byte_len();
        let ratio = ternary_bytes as f64 / EMBEDDING_BYTES as f64;
        CompressionStats {
            ternary_bytes,
            embedding_bytes: EMBEDDING_BYTES,
            compression_ratio: round_to(ratio, 3),
            savings_percent: round_to(100.0 * (1.0 - ratio), 1),
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use approx::assert_relative_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::grain::LockState;

    fn grain(pos: &[&str], neg: &[&str], void: &[&str]) -> Grain {
        let set = |xs: &[&str]| -> BTreeSet<String> { xs.iter().map(|s| s.to_string()).collect() };
        Grain {
            grain_id: "g1".into(),
            cartridge_source: "materials".into(),
            phantom_origin: "fact:1".into(),
            axiom_link: "thermal".into(),
            weight: 1.0,
            delta: TernaryDelta {
                pos: set(pos),
                neg: set(neg),
                void: set(void),
            },
            lock_state: LockState::Validated,
            pointer_map: BTreeMap::new(),
            cycle_count: 51,
            created_cycle: 52,
            hit_count: 60,
            confidence: 0.9,
            supersedes: None,
            validation_hash: String::new(),
        }
    }

    #[test]
    fn test_bit_layout() {
        use Ternary::*;
        let packed = PackedDelta::pack(&[
            Positive, Negative, Void, Positive, Void, Void, Void, Void, Negative,
        ]);
        assert_eq!(packed.len, 9);
        assert_eq!(packed.positive, vec![0b0000_1001, 0]);
        assert_eq!(packed.negative, vec![0b0000_0010, 0b0000_0001]);
        assert_eq!(packed.byte_len(), 4);
        assert!(PackedDelta::pack(&[]).positive.is_empty());
    }

    #[test]
    fn test_grain_pack_restores_delta() {
        let g = grain(&["temperature", "polymer"], &["cold storage"], &["color"]);
        let (refs, packed) = g.pack();
        assert_eq!(refs, vec!["cold storage", "color", "polymer", "temperature"]);
        assert_eq!(packed.unpack_delta(&refs), Some(g.delta.clone()));
        assert_eq!(packed.unpack_delta(&refs[1..]), None);
    }

    #[test]
    fn test_metrics() {
        let g = grain(&["a", "b", "c"], &["d"], &[]);
        let m = g.metrics();
        assert_eq!((m.positive, m.negative, m.void), (3, 1, 0));
        // all refs decided
        assert_eq!(m.internal_hamming, 0.0);
        // stdev(3, 1) = sqrt(2), mean 2
        assert_relative_eq!(m.weight_skew, 2f64.sqrt() / 2.0, epsilon = 1e-12);

        let mixed = grain(&["a"], &[], &["b"]).metrics();
        // sample variance of {1, 0} is 0.5
        assert_relative_eq!(mixed.internal_hamming, 5.0, epsilon = 1e-12);

        let empty = grain(&[], &[], &["x"]).metrics();
        assert_eq!(empty.weight_skew, 0.0);
        assert_eq!(empty.internal_hamming, 0.0);
    }

    #[test]
    fn test_compression_stats() {
        let s = grain(&["a", "b"], &["c"], &["d"]).compression_stats();
        assert_eq!(s.ternary_bytes, 2);
        assert_eq!(s.embedding_bytes, 1024);
        assert_eq!(s.compression_ratio, 0.002);
        assert_eq!(s.savings_percent, 99.8);
    }

    fn ternary() -> impl Strategy<Value = Ternary> {
        prop_oneof![
            Just(Ternary::Negative),
            Just(Ternary::Void),
            Just(Ternary::Positive)
        ]
    }

    proptest! {
        #[test]
        fn prop_unpack_inverts_pack(values in prop::collection::vec(ternary(), 0..64)) {
            let packed = PackedDelta::pack(&values);
            prop_assert_eq!(packed.positive.len(), values.len().div_ceil(8));
            prop_assert_eq!(packed.unpack(), values);
        }
    }
}
