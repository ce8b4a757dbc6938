//! Timestep candidates and instrumentation of unusually short timesteps.
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SedflowError};
use crate::network::ReachNetwork;

/// One per-reach stability bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestepCandidate {
    pub dt: f64,
    pub index: usize,
    pub bound: &'static str,
}

/// Smallest candidate; ties keep the most upstream reach.
pub fn min_candidate<I>(candidates: I) -> Option<TimestepCandidate>
where
    I: IntoIterator<Item = TimestepCandidate>,
{
    candidates
        .into_iter()
        .fold(None, |best: Option<TimestepCandidate>, c| match best {
            Some(b) if b.dt < c.dt || (b.dt == c.dt && b.index <= c.index) => Some(b),
            _ => Some(c),
        })
}

/// Reports timestep candidates below `threshold` and aborts the run after
/// `maximum_outputs` reports.  The counter is shared by parallel workers.
#[derive(Debug, Serialize, Deserialize)]
pub struct TimestepMonitor {
    #[serde(default)]
    pub threshold: f64,
    #[serde(default = "default_maximum_outputs")]
    pub maximum_outputs: usize,
    #[serde(skip)]
    outputs: AtomicUsize,
}

fn default_maximum_outputs() -> usize {
    1000
}

impl Default for TimestepMonitor {
    fn default() -> Self {
        Self::new(0.0, default_maximum_outputs())
    }
}

impl Clone for TimestepMonitor {
    fn clone(&self) -> Self {
        Self {
            threshold: self.threshold,
            maximum_outputs: self.maximum_outputs,
            outputs: AtomicUsize::new(self.outputs()),
        }
    }
}

impl TimestepMonitor {
    pub fn new(threshold: f64, maximum_outputs: usize) -> Self {
        Self {
            threshold,
            maximum_outputs,
            outputs: AtomicUsize::new(0),
        }
    }

    /// Number of short timesteps reported so far.
    pub fn outputs(&self) -> usize {
        self.outputs.load(Ordering::Relaxed)
    }

    pub fn check(&self, candidate: &TimestepCandidate, network: &ReachNetwork) -> Result<()> {
        if !(candidate.dt < self.threshold) {
            return Ok(());
        }
        warn!(
            target: "sedflow::timestep",
            dt = candidate.dt,
            bound = candidate.bound,
            location = %network.label(candidate.index),
            "timestep.short"
        );
        let count = self.outputs.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.maximum_outputs {
            return Err(SedflowError::TimestepOutputBudgetExhausted { count });
        }
        Ok(())
    }

    /// Checks every candidate and reduces them to the smallest.
    pub fn reduce(&self, candidates: &[TimestepCandidate], network: &ReachNetwork) -> Result<Option<TimestepCandidate>> {
        for c in candidates {
            self.check(c, network)?;
        }
        Ok(min_candidate(candidates.iter().copied()))
    }
}
