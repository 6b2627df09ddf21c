//! # DBN (Deep Belief Networks)
//!
//! Stacks of Restricted Boltzmann Machines trained greedily layer by layer, then
//! refined with supervised fine-tuning.
//!
//! ## Overview
//!
//! Each RBM is trained with contrastive divergence (CD-k) on the sampled hidden
//! representation of the RBM below it. The stack is then fine-tuned either by
//! backpropagation through an added softmax layer, or by the wake-sleep algorithm
//! with a top-level associative memory joining the penultimate layer and the labels
//! (Hinton, Osindero & Teh, 2006).
//!
//! ## Structure
//!
//! - [`core`] — RBM and DBN models, error type
//! - [`training`] — Learning-rate / momentum schedules, epoch metrics
//! - [`data`] — Mini-batch partitioning, MNIST loading, preprocessing
//! - [`classifier`] — Classifier head trained on the top representation
//! - [`checkpoint`] — JSON persistence of RBMs and training errors
//! - [`utils`] — Logistic, softmax, sampling and error helpers

pub mod checkpoint;
pub mod classifier;
pub mod core;
pub mod data;
pub mod training;
pub mod utils;

pub use classifier::{Classifier, LogisticRegression};
pub use core::{Dbn, DbnError, DbnResult, ForwardPass, Rbm};
pub use data::BatchPartitioner;
pub use training::{EpochMetrics, ParameterSchedule, UpdateRule};

use serde::{Deserialize, Serialize};

/// Hyper-parameters for contrastive-divergence training of a single RBM.
///
/// Used by [`Rbm::train`] and, for every layer, by [`Dbn::unsupervised_pretrain`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbmTrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Initial learning rate of each schedule segment
    pub alpha: Vec<f32>,
    /// Initial momentum of each schedule segment
    pub momentum: Vec<f32>,
    /// Gibbs steps in the negative phase (the k of CD-k)
    pub gibbs_k: usize,
    pub alpha_rule: UpdateRule,
    pub momentum_rule: UpdateRule,
}

impl Default for RbmTrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 10,
            alpha: vec![0.01],
            momentum: vec![0.5],
            gibbs_k: 1,
            alpha_rule: UpdateRule::Constant,
            momentum_rule: UpdateRule::Constant,
        }
    }
}

/// Hyper-parameters for supervised fine-tuning ([`Dbn::backprop`] and [`Dbn::wake_sleep`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuneConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub alpha: Vec<f32>,
    pub alpha_rule: UpdateRule,
    /// Gibbs steps on the top associative memory (wake-sleep only)
    pub top_gibbs_k: usize,
    /// Label units of the associative memory (wake-sleep only).
    /// `None` keeps the existing memory's label block, or uses `max(label) + 1` on the first run.
    pub num_labels: Option<usize>,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 1,
            alpha: vec![0.01],
            alpha_rule: UpdateRule::Constant,
            top_gibbs_k: 1,
            num_labels: None,
        }
    }
}
