// rust/ddp-core/src/trainer/metrics.rs

use serde::{Deserialize, Serialize};

use crate::collective::{ProcessGroup, ReduceOp};
use crate::error::Result;

use super::traits::LocalStep;

/// Group-wide summary of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: u64,
    /// Sum of step losses over all ranks divided by the total step count
    pub mean_loss: f64,
    pub accuracy_pct: f64,
}

/// Per-rank running totals within an epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningTotals {
    pub loss_sum: f64,
    pub steps: u64,
    pub correct: u64,
    pub samples: u64,
}

impl RunningTotals {
    pub fn record(&mut self, step: &LocalStep) {
        self.loss_sum += step.loss;
        self.steps += 1;
        self.correct += step.correct;
        self.samples += step.samples;
    }

    /// Accuracy of this rank so far, in percent.
    pub fn accuracy_pct(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.samples as f64
        }
    }

    /// Sums the totals of every rank. Collective.
    pub fn reduce(&self, group: &mut ProcessGroup, epoch: u64) -> Result<EpochMetrics> {
        let reduced = group.all_reduce(
            &[
                self.loss_sum,
                self.steps as f64,
                self.correct as f64,
                self.samples as f64,
            ],
            ReduceOp::Sum,
        )?;
        let global = RunningTotals {
            loss_sum: reduced[0],
            steps: reduced[1] as u64,
            correct: reduced[2] as u64,
            samples: reduced[3] as u64,
        };

        Ok(EpochMetrics {
            epoch,
            mean_loss: if global.steps == 0 {
                0.0
            } else {
                global.loss_sum / global.steps as f64
            },
            accuracy_pct: global.accuracy_pct(),
        })
    }
}
