//! Deep Belief Network: a stack of RBMs plus supervised fine-tuning state.
//!
//! ## Architecture
//!
//! ```text
//!              labels
//!                ↕
//!   top  ←──── last_rbm (associative memory over [pen | labels])
//!                ↕
//!   pen  ←── layers[L-2] ... layers[0] ←── visible
//! ```
//!
//! Layers below the top pretrained RBM form the directed part of the network.
//! Wake-sleep unties them into recognition weights (`layers[i].w`, bottom-up) and
//! generative weights (`top_down_w[i]`, top-down) that are trained separately.

use ndarray::{s, Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::rbm::DisplayFn;
use super::{ensure_width, DbnError, DbnResult, Rbm};
use crate::checkpoint;
use crate::classifier::Classifier;
use crate::data::BatchPartitioner;
use crate::training::{EpochMetrics, ParameterSchedule};
use crate::utils::{
    add_bias_column, argmax_rows, cross_entropy_error, d_logistic, hstack, logistic_matrix,
    mean_rows, one_hot, probs_to_binary, softmax_rows,
};
use crate::{FineTuneConfig, RbmTrainConfig};

/// Probability that a label unit starts on before wake-sleep inference.
const LABEL_INIT_PROB: f32 = 0.1;

/// Softmax weights are drawn from `SOFTMAX_INIT_SCALE * U[0, 1)`.
const SOFTMAX_INIT_SCALE: f32 = 0.01;

/// Result of a bottom-up pass.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Sampled hidden states of every layer, bottom to top
    pub middle: Vec<Array2<f32>>,
    /// Activation probabilities of the top layer
    pub last: Array2<f32>,
}

/// A Deep Belief Network.
///
/// # Fine-tuning state
///
/// - `pen_softmax_w` / `softmax_output`: created by [`Dbn::backprop`]
/// - `last_rbm` / `top_down_w`: created by [`Dbn::wake_sleep`]
/// - `errors`: one value per epoch of the most recent fine-tuning run
pub struct Dbn {
    pub layers: Vec<Rbm>,
    cls: Box<dyn Classifier>,
    /// Softmax activations of the last backprop mini-batch
    pub softmax_output: Option<Array2<f32>>,
    /// Bias-augmented softmax weights: row 0 is the bias row
    pub pen_softmax_w: Option<Array2<f32>>,
    /// Associative memory: visible units are `[pen | labels]`
    pub last_rbm: Option<Rbm>,
    /// Generative weights, `top_down_w[i]` has shape `(layers[i].num_hidden, layers[i].num_visible)`
    pub top_down_w: Option<Vec<Array2<f32>>>,
    pub errors: Vec<f32>,
}

impl std::fmt::Debug for Dbn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dbn")
            .field("sizes", &self.sizes())
            .field("cls", &format!("<{} classifier>", self.cls.name()))
            .field("backprop", &self.pen_softmax_w.is_some())
            .field("wake_sleep", &self.last_rbm.is_some())
            .field("errors", &format!("<{} epochs>", self.errors.len()))
            .finish()
    }
}

impl Dbn {
    /// Create a DBN with one RBM per adjacent pair of `sizes`.
    ///
    /// # Errors
    /// - `InvalidConfig` if fewer than 2 sizes are given or any size is zero
    pub fn new<R: Rng + ?Sized>(
        sizes: &[usize],
        cls: Box<dyn Classifier>,
        rng: &mut R,
    ) -> DbnResult<Self> {
        if sizes.len() < 2 {
            return Err(DbnError::InvalidConfig(
                "Must have at least 2 layers (visible and hidden)".to_string(),
            ));
        }
        let layers = sizes
            .windows(2)
            .map(|pair| Rbm::new(pair[0], pair[1], rng))
            .collect::<DbnResult<Vec<_>>>()?;

        Ok(Self {
            layers,
            cls,
            softmax_output: None,
            pen_softmax_w: None,
            last_rbm: None,
            top_down_w: None,
            errors: Vec::new(),
        })
    }

    /// Layer sizes `[visible, hidden_1, ..., hidden_L]`.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.layers.iter().map(|r| r.num_visible).collect();
        if let Some(top) = self.layers.last() {
            sizes.push(top.num_hidden);
        }
        sizes
    }

    fn num_visible(&self) -> usize {
        self.layers.first().map_or(0, |r| r.num_visible)
    }

    /// Greedy layer-wise pretraining.
    ///
    /// Each RBM is trained on the sampled hidden states of the RBM below it (raw
    /// data for the first). The validation set, if any, is propagated the same
    /// way. Only the first layer reports to `display`. Returns each layer's
    /// epoch metrics.
    ///
    /// # Errors
    /// Returns the first training error; layers below the failing one stay trained.
    pub fn unsupervised_pretrain<R: Rng + ?Sized>(
        &mut self,
        data: &Array2<f32>,
        validation: Option<&Array2<f32>>,
        config: &RbmTrainConfig,
        rng: &mut R,
        mut display: Option<DisplayFn<'_>>,
    ) -> DbnResult<Vec<Vec<EpochMetrics>>> {
        ensure_width("training data", data.ncols(), self.num_visible())?;

        let mut middle_repr = data.clone();
        let mut middle_val_repr = validation.cloned();
        let mut history = Vec::with_capacity(self.layers.len());
        let num_layers = self.layers.len();

        for (l, rbm) in self.layers.iter_mut().enumerate() {
            info!(
                "training RBM {}/{} ({}, {})",
                l + 1,
                num_layers,
                rbm.num_visible,
                rbm.num_hidden
            );
            let layer_display = if l == 0 { display.take() } else { None };
            let metrics = rbm.train(
                &middle_repr,
                middle_val_repr.as_ref(),
                config,
                rng,
                layer_display,
            )?;
            history.push(metrics);

            let (_, next) = rbm.sample_hidden_from_visible(&middle_repr, rng)?;
            middle_repr = next;
            if let Some(val) = middle_val_repr.as_ref() {
                let (_, next_val) = rbm.sample_hidden_from_visible(val, rng)?;
                middle_val_repr = Some(next_val);
            }
        }

        Ok(history)
    }

    fn check_supervised(&self, data: &Array2<f32>, labels: &[usize]) -> DbnResult<()> {
        if data.nrows() != labels.len() {
            return Err(DbnError::ShapeMismatch(format!(
                "{} data rows but {} labels",
                data.nrows(),
                labels.len()
            )));
        }
        if data.nrows() == 0 {
            return Err(DbnError::InvalidConfig("training data is empty".to_string()));
        }
        ensure_width("training data", data.ncols(), self.num_visible())
    }

    /// Fine-tune with backpropagation through an added softmax output layer.
    ///
    /// # Algorithm
    ///
    /// For each mini-batch, with `a_0 = batch` and `a_{l+1} = σ(a_l W_l + b_l)`:
    /// ```text
    /// y     = softmax([1 | a_L] · W_out)
    /// δ_out = targets - y
    /// δ_L   = (δ_out · W_outᵀ)[no bias] ⊙ σ'(a_L)
    /// δ_l   = (δ_{l+1} · W_lᵀ) ⊙ σ'(a_l)
    /// W_l  += α a_lᵀ δ_{l+1} / B,   b_l += α mean(δ_{l+1})
    /// ```
    /// Deltas are computed from the weights before the batch's update.
    ///
    /// # Errors
    /// - `ShapeMismatch` for data/label mismatches or labels outside `0..num_softmax`
    /// - `InvalidConfig` for an empty dataset, zero classes or a bad schedule
    pub fn backprop<R: Rng + ?Sized>(
        &mut self,
        num_softmax: usize,
        data: &Array2<f32>,
        labels: &[usize],
        config: &FineTuneConfig,
        rng: &mut R,
    ) -> DbnResult<()> {
        self.check_supervised(data, labels)?;
        if num_softmax == 0 {
            return Err(DbnError::InvalidConfig("num_softmax must be positive".to_string()));
        }
        let targets = one_hot(labels, num_softmax)?;
        let mut alpha_schedule = ParameterSchedule::new(config.alpha_rule, &config.alpha, config.epochs)?;
        let partitioner = BatchPartitioner::new(data.nrows(), config.batch_size)?;

        let last_hidden = self.layers.last().map_or(0, |r| r.num_hidden);
        let mut pen_softmax_w = Array2::random_using(
            (last_hidden + 1, num_softmax),
            Uniform::new(0.0f32, 1.0),
            rng,
        ) * SOFTMAX_INIT_SCALE;

        self.errors.clear();
        for epoch in 0..config.epochs {
            let alpha = alpha_schedule.update();
            let mut squared_error = 0.0f32;

            for (batch, batch_targets) in partitioner.paired(data, &targets)? {
                let (error, output) =
                    backprop_step(&mut self.layers, &mut pen_softmax_w, batch, batch_targets, alpha)?;
                squared_error += error;
                self.softmax_output = Some(output);
            }

            let epoch_error = squared_error / data.nrows() as f32;
            info!("backprop epoch {}/{}: mean squared error {:.6}", epoch + 1, config.epochs, epoch_error);
            self.errors.push(epoch_error);
        }

        self.pen_softmax_w = Some(pen_softmax_w);
        Ok(())
    }

    /// Fine-tune with the wake-sleep algorithm (Hinton et al. 2006).
    ///
    /// The first call unties the generative weights from the recognition
    /// weights and allocates the associative memory with `num_last_layer`
    /// hidden units and `config.num_labels` label units. Later calls continue
    /// from the existing state; the memory is reallocated only if either size
    /// changes.
    ///
    /// # Errors
    /// - `ShapeMismatch` for data/label mismatches or labels outside the label layer
    /// - `InvalidConfig` for an empty dataset, zero `top_gibbs_k`, `num_last_layer`
    ///   or a bad schedule
    pub fn wake_sleep<R: Rng + ?Sized>(
        &mut self,
        num_last_layer: usize,
        data: &Array2<f32>,
        labels: &[usize],
        config: &FineTuneConfig,
        rng: &mut R,
    ) -> DbnResult<()> {
        self.check_supervised(data, labels)?;
        if config.top_gibbs_k == 0 {
            return Err(DbnError::InvalidConfig("top_gibbs_k must be at least 1".to_string()));
        }
        if num_last_layer == 0 {
            return Err(DbnError::InvalidConfig("num_last_layer must be positive".to_string()));
        }

        if config.num_labels == Some(0) {
            return Err(DbnError::InvalidConfig("num_labels must be positive".to_string()));
        }

        let num_labels = match (config.num_labels, &self.last_rbm) {
            (Some(n), _) => n,
            (None, Some(last)) => last.num_visible - self.pen_size(),
            (None, None) => labels.iter().max().map_or(0, |&m| m + 1),
        };
        let targets = one_hot(labels, num_labels)?;
        let mut alpha_schedule = ParameterSchedule::new(config.alpha_rule, &config.alpha, config.epochs)?;
        let partitioner = BatchPartitioner::new(data.nrows(), config.batch_size)?;

        self.init_wake_sleep(num_last_layer, num_labels, rng)?;
        let directed = self.layers.len() - 1;
        let (layers, top_down_w, last_rbm) = match (&mut self.top_down_w, &mut self.last_rbm) {
            (Some(top_down_w), Some(last_rbm)) => (&mut self.layers[..directed], top_down_w, last_rbm),
            _ => return Err(DbnError::Untrained("wake-sleep state was not initialised")),
        };

        self.errors.clear();
        for epoch in 0..config.epochs {
            let alpha = alpha_schedule.update();
            let mut cross_entropy = 0.0f32;

            for (batch, batch_targets) in partitioner.paired(data, &targets)? {
                cross_entropy += wake_sleep_step(
                    layers,
                    top_down_w,
                    last_rbm,
                    batch,
                    batch_targets,
                    alpha,
                    config.top_gibbs_k,
                    rng,
                )?;
            }

            info!("wake-sleep epoch {}/{}: cross entropy error {:.6}", epoch + 1, config.epochs, cross_entropy);
            self.errors.push(cross_entropy);
        }

        Ok(())
    }

    /// Number of penultimate units joined with the labels in the associative memory.
    fn pen_size(&self) -> usize {
        self.layers.last().map_or(0, |r| r.num_visible)
    }

    fn init_wake_sleep<R: Rng + ?Sized>(
        &mut self,
        num_last_layer: usize,
        num_labels: usize,
        rng: &mut R,
    ) -> DbnResult<()> {
        let directed = self.layers.len() - 1;
        if self.top_down_w.is_none() {
            // Deep copies: the generative weights diverge from the recognition weights.
            self.top_down_w = Some(
                self.layers[..directed]
                    .iter()
                    .map(|rbm| rbm.w.t().to_owned())
                    .collect(),
            );
        }

        let pen = self.pen_size();
        let needs_alloc = self
            .last_rbm
            .as_ref()
            .map_or(true, |r| r.num_visible != pen + num_labels || r.num_hidden != num_last_layer);
        if needs_alloc {
            let mut last_rbm = Rbm::new(pen + num_labels, num_last_layer, rng)?;
            // Seed the pen block with the pretrained top RBM when the shapes agree.
            if let Some(top) = self.layers.last() {
                if top.num_hidden == num_last_layer {
                    last_rbm.w.slice_mut(s![..pen, ..]).assign(&top.w);
                    last_rbm.v_bias.slice_mut(s![..pen]).assign(&top.v_bias);
                    last_rbm.h_bias.assign(&top.h_bias);
                }
            }
            debug!(pen, num_labels, num_last_layer, "allocated associative memory");
            self.last_rbm = Some(last_rbm);
        }
        Ok(())
    }

    /// Bottom-up pass through every layer using sampled hidden states.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `data` width differs from the visible layer
    pub fn forward<R: Rng + ?Sized>(&self, data: &Array2<f32>, rng: &mut R) -> DbnResult<ForwardPass> {
        let mut middle = Vec::with_capacity(self.layers.len());
        let mut last = data.clone();
        let mut input = data.clone();
        for rbm in &self.layers {
            let (probs, states) = rbm.sample_hidden_from_visible(&input, rng)?;
            last = probs;
            middle.push(states.clone());
            input = states;
        }
        Ok(ForwardPass { middle, last })
    }

    /// Top-down pass through the recognition weights, from top-layer activity to
    /// a visible reconstruction (probabilities).
    ///
    /// # Errors
    /// - `ShapeMismatch` if `top` width differs from the top layer
    pub fn backward<R: Rng + ?Sized>(&self, top: &Array2<f32>, rng: &mut R) -> DbnResult<Array2<f32>> {
        let mut repr = top.clone();
        for rbm in self.layers.iter().rev() {
            let (probs, _) = rbm.sample_visible_from_hidden(&repr, rng)?;
            repr = probs;
        }
        Ok(repr)
    }

    /// Label distributions after Gibbs sampling on the associative memory.
    ///
    /// Label units start on with probability 0.1. The associative memory is
    /// clamped to the bottom-up pen probabilities, and probabilities rather than
    /// samples are used throughout.
    ///
    /// # Errors
    /// - `Untrained` before [`Dbn::wake_sleep`]
    /// - `InvalidConfig` if `top_gibbs_k` is zero
    /// - `ShapeMismatch` if `data` width differs from the visible layer
    pub fn predict_ws_proba<R: Rng + ?Sized>(
        &self,
        data: &Array2<f32>,
        top_gibbs_k: usize,
        rng: &mut R,
    ) -> DbnResult<Array2<f32>> {
        let last_rbm = self
            .last_rbm
            .as_ref()
            .ok_or(DbnError::Untrained("predict_ws requires wake_sleep training"))?;
        if top_gibbs_k == 0 {
            return Err(DbnError::InvalidConfig("top_gibbs_k must be at least 1".to_string()));
        }
        ensure_width("data", data.ncols(), self.num_visible())?;

        let pen = self.pen_size();
        let num_labels = last_rbm.num_visible - pen;
        let init = Array2::random_using((data.nrows(), num_labels), Uniform::new(0.0f32, 1.0), rng);
        let labels = init.mapv(|r| if r < LABEL_INIT_PROB { 1.0 } else { 0.0 });

        let mut pen_probs = data.clone();
        for rbm in &self.layers[..self.layers.len() - 1] {
            pen_probs = rbm.hidden_probs(&pen_probs)?;
        }

        let memory = AssociativeMemory::split(last_rbm, pen);
        let joint = hstack(&pen_probs, &labels)?;
        let mut top = last_rbm.hidden_probs(&joint)?;
        let pen_input = pen_probs.dot(&memory.pen_w);

        let mut lab_probs = Array2::zeros((data.nrows(), num_labels));
        for _ in 0..top_gibbs_k {
            lab_probs = memory.label_probs(&top);
            let mut activation = &pen_input + &lab_probs.dot(&memory.lab_w);
            activation += &memory.top_bias;
            top = logistic_matrix(&activation);
        }
        Ok(lab_probs)
    }

    /// Predicted labels after wake-sleep fine-tuning.
    ///
    /// # Errors
    /// See [`Dbn::predict_ws_proba`].
    pub fn predict_ws<R: Rng + ?Sized>(
        &self,
        data: &Array2<f32>,
        top_gibbs_k: usize,
        rng: &mut R,
    ) -> DbnResult<Vec<usize>> {
        Ok(argmax_rows(&self.predict_ws_proba(data, top_gibbs_k, rng)?))
    }

    /// Prediction through the backprop softmax head. Not supported.
    ///
    /// # Errors
    /// Always `NotImplemented`.
    pub fn predict_bp(&self, _data: &Array2<f32>) -> DbnResult<Vec<usize>> {
        Err(DbnError::NotImplemented("predict_bp"))
    }

    /// Generative sampling from random noise. Not supported.
    ///
    /// # Errors
    /// Always `NotImplemented`.
    pub fn fantasy(&self, _gibbs_k: usize) -> DbnResult<Array2<f32>> {
        Err(DbnError::NotImplemented("fantasy"))
    }

    /// Fit the classifier head on the top-layer representation of `data`.
    ///
    /// # Errors
    /// Propagates shape errors from the forward pass and classifier errors.
    pub fn fit_cls<R: Rng + ?Sized>(&mut self, data: &Array2<f32>, labels: &[usize], rng: &mut R) -> DbnResult<()> {
        let repr = self.forward(data, rng)?;
        self.cls.fit(&repr.last, labels)
    }

    /// Predict labels with the classifier head.
    ///
    /// # Errors
    /// Propagates shape errors from the forward pass and classifier errors.
    pub fn predict_cls<R: Rng + ?Sized>(&self, data: &Array2<f32>, rng: &mut R) -> DbnResult<Vec<usize>> {
        let repr = self.forward(data, rng)?;
        self.cls.predict(&repr.last)
    }

    /// Replace the RBM stack with RBMs loaded from configuration files, bottom first.
    ///
    /// Fine-tuning state tied to the old stack is dropped.
    ///
    /// # Errors
    /// - `InvalidConfig` if no files are given
    /// - `ShapeMismatch` if adjacent RBMs do not chain
    /// - `Io` / `Json` if a file cannot be read
    pub fn load_rbms<P: AsRef<Path>>(&mut self, paths: &[P]) -> DbnResult<()> {
        if paths.is_empty() {
            return Err(DbnError::InvalidConfig("no RBM files given".to_string()));
        }
        let layers = paths
            .iter()
            .map(|p| Rbm::from_configuration(p.as_ref()))
            .collect::<DbnResult<Vec<_>>>()?;
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].num_hidden != pair[1].num_visible {
                return Err(DbnError::ShapeMismatch(format!(
                    "RBM {i} has {} hidden units but RBM {} has {} visible units",
                    pair[0].num_hidden,
                    i + 1,
                    pair[1].num_visible
                )));
            }
        }

        self.layers = layers;
        self.pen_softmax_w = None;
        self.softmax_output = None;
        self.last_rbm = None;
        self.top_down_w = None;
        Ok(())
    }

    /// Save each RBM to `dir/rbm-<index>.json` and return the written paths.
    ///
    /// # Errors
    /// Returns an error if a file cannot be written.
    pub fn save_rbms(&self, dir: &Path) -> DbnResult<Vec<PathBuf>> {
        self.layers
            .iter()
            .enumerate()
            .map(|(i, rbm)| {
                let path = dir.join(format!("rbm-{i}.json"));
                rbm.save_configuration(&path)?;
                Ok(path)
            })
            .collect()
    }

    /// Write `{ "errors": [...] }` for the most recent fine-tuning run.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_performance_metrics(&self, path: &Path) -> DbnResult<()> {
        checkpoint::save_metrics(&self.errors, path)
    }
}

/// One backprop update on a mini-batch.
///
/// Returns the summed per-sample squared error and the softmax output.
fn backprop_step(
    layers: &mut [Rbm],
    pen_softmax_w: &mut Array2<f32>,
    batch: ArrayView2<'_, f32>,
    targets: ArrayView2<'_, f32>,
    alpha: f32,
) -> DbnResult<(f32, Array2<f32>)> {
    let batch_len = batch.nrows() as f32;

    // Forward pass with probabilities: acts[0] = batch, acts[l+1] = σ(acts[l] W_l + b_l)
    let mut acts = Vec::with_capacity(layers.len() + 1);
    acts.push(batch.to_owned());
    for rbm in layers.iter() {
        let next = rbm.hidden_probs(&acts[acts.len() - 1])?;
        acts.push(next);
    }
    let pen_aug = add_bias_column(&acts[layers.len()]);
    let output = softmax_rows(&pen_aug.dot(pen_softmax_w));

    let out_delta = &targets - &output;
    let squared_error = out_delta.mapv(|e| e * e).sum();

    // Error reaching the top hidden layer, excluding the bias row
    let mut delta = out_delta.dot(&pen_softmax_w.slice(s![1.., ..]).t())
        * &acts[layers.len()].mapv(d_logistic);
    pen_softmax_w.scaled_add(alpha / batch_len, &pen_aug.t().dot(&out_delta));

    for l in (0..layers.len()).rev() {
        let below = if l > 0 {
            Some(delta.dot(&layers[l].w.t()) * &acts[l].mapv(d_logistic))
        } else {
            None
        };
        let rbm = &mut layers[l];
        rbm.w.scaled_add(alpha / batch_len, &acts[l].t().dot(&delta));
        rbm.h_bias.scaled_add(alpha, &mean_rows(&delta));
        match below {
            Some(d) => delta = d,
            None => break,
        }
    }

    Ok((squared_error, output))
}

/// Views of the associative memory split into its pen and label blocks.
struct AssociativeMemory<'a> {
    pen_w: ArrayView2<'a, f32>,
    lab_w: ArrayView2<'a, f32>,
    pen_bias: ArrayView1<'a, f32>,
    lab_bias: ArrayView1<'a, f32>,
    top_bias: ArrayView1<'a, f32>,
}

impl<'a> AssociativeMemory<'a> {
    fn split(rbm: &'a Rbm, pen: usize) -> Self {
        Self {
            pen_w: rbm.w.slice(s![..pen, ..]),
            lab_w: rbm.w.slice(s![pen.., ..]),
            pen_bias: rbm.v_bias.slice(s![..pen]),
            lab_bias: rbm.v_bias.slice(s![pen..]),
            top_bias: rbm.h_bias.view(),
        }
    }

    fn pen_probs<S: Data<Elem = f32>>(&self, top: &ArrayBase<S, Ix2>) -> Array2<f32> {
        let mut activation = top.dot(&self.pen_w.t());
        activation += &self.pen_bias;
        logistic_matrix(&activation)
    }

    fn label_probs<S: Data<Elem = f32>>(&self, top: &ArrayBase<S, Ix2>) -> Array2<f32> {
        let mut activation = top.dot(&self.lab_w.t());
        activation += &self.lab_bias;
        softmax_rows(&activation)
    }

    fn top_probs(&self, pen: &Array2<f32>, labels: &Array2<f32>) -> Array2<f32> {
        let mut activation = pen.dot(&self.pen_w) + labels.dot(&self.lab_w);
        activation += &self.top_bias;
        logistic_matrix(&activation)
    }
}

/// One wake-sleep update on a mini-batch. Returns the batch's summed cross-entropy.
///
/// `layers` holds only the directed layers; `top_down_w[i]` is the generative
/// counterpart of `layers[i].w`.
#[allow(clippy::too_many_arguments)]
fn wake_sleep_step<R: Rng + ?Sized>(
    layers: &mut [Rbm],
    top_down_w: &mut [Array2<f32>],
    last_rbm: &mut Rbm,
    batch: ArrayView2<'_, f32>,
    targets: ArrayView2<'_, f32>,
    alpha: f32,
    top_gibbs_k: usize,
    rng: &mut R,
) -> DbnResult<f32> {
    let directed = layers.len();
    let batch_len = batch.nrows() as f32;
    let pen = last_rbm.num_visible - targets.ncols();

    // ===== Wake phase: bottom-up sampled states =====
    let mut wake = Vec::with_capacity(directed + 1);
    wake.push(batch.to_owned());
    for rbm in layers.iter() {
        let (_, states) = rbm.sample_hidden_from_visible(&wake[wake.len() - 1], rng)?;
        wake.push(states);
    }
    let wake_pen = &wake[directed];

    let joint = hstack(wake_pen, &targets)?;
    let (_, wake_top) = last_rbm.sample_hidden_from_visible(&joint, rng)?;

    let pos_lab_top = targets.t().dot(&wake_top);
    let pos_pen_top = wake_pen.t().dot(&wake_top);

    // ===== Gibbs sampling on the associative memory =====
    let (neg_pen, neg_lab_probs, neg_top, cross_entropy) = {
        let memory = AssociativeMemory::split(last_rbm, pen);
        let mut neg_top = wake_top.clone();
        let mut neg_pen = Array2::zeros(wake_pen.dim());
        let mut neg_lab_probs = Array2::zeros(targets.dim());
        for _ in 0..top_gibbs_k {
            let neg_pen_probs = memory.pen_probs(&neg_top);
            neg_pen = probs_to_binary(&neg_pen_probs, rng);
            neg_lab_probs = memory.label_probs(&neg_top);
            let neg_top_probs = memory.top_probs(&neg_pen, &neg_lab_probs);
            neg_top = probs_to_binary(&neg_top_probs, rng);
        }
        let cross_entropy = cross_entropy_error(&neg_lab_probs, &targets);
        (neg_pen, neg_lab_probs, neg_top, cross_entropy)
    };

    let neg_pen_top = neg_pen.t().dot(&neg_top);
    let neg_lab_top = neg_lab_probs.t().dot(&neg_top);

    // ===== Sleep phase: top-down generative pass =====
    // sleep[directed] is the negative pen state; sleep[0] stays as probabilities.
    let mut sleep: Vec<Array2<f32>> = vec![Array2::zeros((0, 0)); directed + 1];
    sleep[directed] = neg_pen.clone();
    for i in (0..directed).rev() {
        let mut activation = sleep[i + 1].dot(&top_down_w[i]);
        activation += &layers[i].v_bias;
        let probs = logistic_matrix(&activation);
        sleep[i] = if i == 0 { probs } else { probs_to_binary(&probs, rng) };
    }

    // ===== Predictions, all from pre-update weights =====
    // generative: what top_down_w[i] predicts for wake[i] from wake[i+1]
    let gen_pred: Vec<Array2<f32>> = (0..directed)
        .map(|i| {
            let mut activation = wake[i + 1].dot(&top_down_w[i]);
            activation += &layers[i].v_bias;
            logistic_matrix(&activation)
        })
        .collect();
    // recognition: what layers[i].w predicts for sleep[i+1] from sleep[i]
    let rec_pred = (0..directed)
        .map(|i| layers[i].hidden_probs(&sleep[i]))
        .collect::<DbnResult<Vec<_>>>()?;

    // ===== Generative parameter updates =====
    for i in 0..directed {
        let err = &wake[i] - &gen_pred[i];
        top_down_w[i].scaled_add(alpha / batch_len, &wake[i + 1].t().dot(&err));
        layers[i].v_bias.scaled_add(alpha, &mean_rows(&err));
    }

    // ===== Associative memory updates =====
    last_rbm
        .w
        .slice_mut(s![pen.., ..])
        .scaled_add(alpha / batch_len, &(&pos_lab_top - &neg_lab_top));
    last_rbm
        .v_bias
        .slice_mut(s![pen..])
        .scaled_add(alpha, &mean_rows(&(&targets - &neg_lab_probs)));
    last_rbm
        .w
        .slice_mut(s![..pen, ..])
        .scaled_add(alpha / batch_len, &(&pos_pen_top - &neg_pen_top));
    last_rbm
        .v_bias
        .slice_mut(s![..pen])
        .scaled_add(alpha, &mean_rows(&(wake_pen - &neg_pen)));
    last_rbm
        .h_bias
        .scaled_add(alpha, &mean_rows(&(&wake_top - &neg_top)));

    // ===== Recognition parameter updates =====
    for i in 0..directed {
        let err = &sleep[i + 1] - &rec_pred[i];
        layers[i].w.scaled_add(alpha / batch_len, &sleep[i].t().dot(&err));
        layers[i].h_bias.scaled_add(alpha, &mean_rows(&err));
    }

    Ok(cross_entropy)
}
