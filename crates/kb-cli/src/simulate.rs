//! Synthetic query streams for driving a cartridge to crystallization.

use anyhow::{Context, Result, bail};
use kb_core::Grain;
use kb_store::{Library, QueryRequest};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub struct SimulateOptions {
    pub keywords: Vec<String>,
    pub concepts: Vec<String>,
    pub queries: usize,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub pattern: bool,
    pub seed: Option<u64>,
}

#[derive(Default)]
pub struct SimulateSummary {
    pub queries: usize,
    pub hits: usize,
    pub cycles: usize,
    pub failures: usize,
    pub grains: Vec<Grain>,
}

/// Issue `queries` tracked queries with confidences drawn uniformly from
/// `[min_confidence, max_confidence]`.
pub fn run(library: &Library, cartridge: &str, opts: &SimulateOptions) -> Result<SimulateSummary> {
    let (lo, hi) = (opts.min_confidence, opts.max_confidence);
    if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
        bail!("confidence range {lo}..{hi} must lie within [0, 1] with min <= max");
    }
    let mut rng = match opts.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };

    let mut summary = SimulateSummary::default();
    for n in 0..opts.queries {
        let mut request = QueryRequest::new(opts.keywords.as_slice())
            .with_concepts(opts.concepts.as_slice())
            .with_confidence(rng.random_range(lo..=hi));
        request.pattern = opts.pattern;

        let outcome = library
            .query_and_track(cartridge, &request)
            .with_context(|| format!("query {} of {}", n + 1, opts.queries))?;
        summary.queries += 1;
        summary.hits += outcome.fact_ids.len();
        if let Some(report) = outcome.cycle {
            summary.cycles += 1;
            summary.failures += report.failures.len();
            summary.grains.extend(report.grains);
        }
    }
    library
        .cartridge(cartridge)?
        .checkpoint()
        .context("failed to checkpoint after simulation")?;
    Ok(summary)
}
