//! Turning a peer's counters into a score.

use crate::errors::ScoringFault;
use crate::feedback::CounterVector;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A policy that maps a counter vector to a signed score.
pub trait ScorePolicy: Send + Sync {
    fn score(&self, counters: &CounterVector) -> Result<i64, ScoringFault>;
}

/// Weights for `[success, failure, latency > 300ms, latency > 1000ms, latency > 3000ms]`.
///
/// The call-completed counter is never weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreWeights(pub [i64; 5]);

impl ScoreWeights {
    pub const DEFAULT: ScoreWeights = ScoreWeights([50, -25, -5, -10, -15]);
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl ScorePolicy for ScoreWeights {
    fn score(&self, counters: &CounterVector) -> Result<i64, ScoringFault> {
        self.0.iter().zip(counters.scored_slots()).try_fold(0i64, |acc, (&weight, count)| {
            let count = i64::try_from(count).map_err(|_| ScoringFault::Overflow)?;
            weight.checked_mul(count).and_then(|term| acc.checked_add(term)).ok_or(ScoringFault::Overflow)
        })
    }
}

/// Runs a [`ScorePolicy`] and turns any fault inside it, including a panic, into a [`ScoringFault`].
#[derive(Clone)]
pub struct Scorer {
    policy: Arc<dyn ScorePolicy>,
}

impl Scorer {
    pub fn new<P: ScorePolicy + 'static>(policy: P) -> Self {
        Self { policy: Arc::new(policy) }
    }

    pub fn score(&self, counters: &CounterVector) -> Result<i64, ScoringFault> {
        match catch_unwind(AssertUnwindSafe(|| self.policy.score(counters))) {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ScoringFault::Panicked(reason))
            }
        }
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Scorer::new(ScoreWeights::DEFAULT)
    }
}

impl From<ScoreWeights> for Scorer {
    fn from(weights: ScoreWeights) -> Self {
        Scorer::new(weights)
    }
}
