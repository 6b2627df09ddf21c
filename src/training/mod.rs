//! Training schedules and per-epoch metrics.

pub mod schedule;

pub use schedule::{ParameterSchedule, UpdateRule};

use serde::{Deserialize, Serialize};

/// Metrics reported by the RBM trainer after each epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Zero-based epoch index
    pub epoch: usize,
    /// Learning rate used during the epoch
    pub alpha: f32,
    /// Momentum used during the epoch
    pub momentum: f32,
    /// Mean per-sample squared error between training batches and their negative-phase reconstruction
    pub reconstruction_error: f32,
    /// Mean per-sample squared error of the one-step validation reconstruction
    pub validation_error: Option<f32>,
}

/// Average of the second half of a series minus the average of the first half.
///
/// Negative values mean the series trends downward.
pub fn trend(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let mid = values.len() / 2;
    let mean = |s: &[f32]| s.iter().sum::<f32>() / s.len() as f32;
    mean(&values[mid..]) - mean(&values[..mid])
}
