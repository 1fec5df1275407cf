//! Event-driven cycle advancement and the harmonic-lock rule.
//!
//! Cycles are counted in queries, never wall-clock time, so a synthetic
//! query stream drives the pipeline deterministically.

use crate::config::PipelineConfig;
use crate::phantom::{PhantomKey, PhantomRecord, PhantomStatus};
use crate::stats::mean;
use crate::tracker::AccessTracker;

/// What one call to [`CycleScheduler::advance_cycle`] did.
#[derive(Debug, Clone)]
pub struct CycleAdvance {
    /// The cycle that was just closed.
    pub cycle: u64,
    pub newly_locked: Vec<PhantomKey>,
    /// Snapshots of every locked phantom still waiting for a grain.
    pub candidates: Vec<PhantomRecord>,
}

pub struct CycleScheduler {
    lock_min_cycle_span: u64,
    lock_max_trend_variance: f64,
    lock_trend_window: usize,
}

impl CycleScheduler {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            lock_min_cycle_span: config.lock_min_cycle_span,
            lock_max_trend_variance: config.lock_max_trend_variance,
            lock_trend_window: config.lock_trend_window,
        }
    }

    /// Close the current cycle.
    ///
    /// Every persistent, unconsumed phantom gets one trend entry and one more
    /// active cycle, then the lock rule is applied. Pending confidences are
    /// cleared for every phantom. Each locked phantom is yielded at most once
    /// per call.
    pub fn advance_cycle(&self, tracker: &mut AccessTracker) -> CycleAdvance {
        let cycle = tracker.current_cycle();
        let mut newly_locked = Vec::new();

        for rec in tracker.iter_mut() {
            if rec.status == PhantomStatus::Persistent && !rec.is_consumed() {
                let entry = if rec.pending.is_empty() {
                    rec.mean_confidence()
                } else {
                    mean(&rec.pending)
                };
                rec.trend.push(entry);
                rec.cycles_active += 1;

                if self.is_harmonic(rec) {
                    rec.status = PhantomStatus::Locked;
                    rec.locked_at_cycle = Some(cycle);
                    newly_locked.push(rec.key.clone());
                }
            }
            rec.pending.clear();
        }

        let candidates = tracker
            .iter()
            .filter(|p| p.awaiting_grain())
            .cloned()
            .collect();

        tracker.set_cycle(cycle + 1);
        CycleAdvance {
            cycle,
            newly_locked,
            candidates,
        }
    }

    /// Stable for long enough: the span exceeds the minimum and the recent
    /// trend barely moves.
    pub fn is_harmonic(&self, rec: &PhantomRecord) -> bool {
        rec.lock_span() > self.lock_min_cycle_span
            && rec.trend_variance(self.lock_trend_window) < self.lock_max_trend_variance
    }
}

/// Counts raw queries and reports when a cycle is due.
#[derive(Debug, Clone)]
pub struct CycleDriver {
    every: u64,
    since_last: u64,
}

impl CycleDriver {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            since_last: 0,
        }
    }

    pub fn every(&self) -> u64 {
        self.every
    }

    /// Count one query. True when this query completes a cycle.
    pub fn tick(&mut self) -> bool {
        self.since_last += 1;
        if self.since_last >= self.every {
            self.since_last = 0;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> u64 {
        self.since_last
    }

    /// Resume a count saved by an earlier process.
    pub fn restore_pending(&mut self, pending: u64) {
        self.since_last = pending.min(self.every - 1);
    }
}
