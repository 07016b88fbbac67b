//! Early stopping on a validation score.

use serde::{Deserialize, Serialize};

/// Which way a validation score improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDirection {
    BiggerIsBetter,
    SmallerIsBetter,
}

impl ScoreDirection {
    pub fn from_bigger(bigger: bool) -> Self {
        if bigger {
            Self::BiggerIsBetter
        } else {
            Self::SmallerIsBetter
        }
    }

    /// Strict improvement of `candidate` over `best`.
    pub fn improves(&self, candidate: f64, best: f64) -> bool {
        match self {
            Self::BiggerIsBetter => candidate > best,
            Self::SmallerIsBetter => candidate < best,
        }
    }
}

/// Outcome of one early-stopping update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarlyStoppingDecision {
    pub best: Option<f64>,
    pub step: usize,
    pub stop: bool,
    pub improved: bool,
}

/// Pure early-stopping rule.
///
/// `best == None` means nothing has been scored yet, so any candidate
/// improves. A NaN candidate never improves.
pub fn early_stopping(
    candidate: f64,
    best: Option<f64>,
    step: usize,
    max_step: usize,
    direction: ScoreDirection,
) -> EarlyStoppingDecision {
    let improved = match best {
        None => !candidate.is_nan(),
        Some(best) => direction.improves(candidate, best),
    };
    if improved {
        EarlyStoppingDecision {
            best: Some(candidate),
            step: 0,
            stop: false,
            improved: true,
        }
    } else {
        let step = step + 1;
        EarlyStoppingDecision {
            best,
            step,
            stop: step >= max_step,
            improved: false,
        }
    }
}

/// Holds the best score and the non-improvement counter between updates.
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStoppingController {
    max_step: usize,
    direction: ScoreDirection,
    best: Option<f64>,
    step: usize,
}

impl EarlyStoppingController {
    pub fn new(max_step: usize, direction: ScoreDirection) -> Self {
        Self {
            max_step,
            direction,
            best: None,
            step: 0,
        }
    }

    pub fn update(&mut self, candidate: f64) -> EarlyStoppingDecision {
        let decision = early_stopping(candidate, self.best, self.step, self.max_step, self.direction);
        self.best = decision.best;
        self.step = decision.step;
        decision
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn direction(&self) -> ScoreDirection {
        self.direction
    }

    /// Restore counters, e.g. from a checkpoint.
    pub fn restore(&mut self, best: Option<f64>, step: usize) {
        self.best = best;
        self.step = step;
    }

    pub fn reset(&mut self) {
        self.restore(None, 0);
    }
}
