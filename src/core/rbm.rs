//! Restricted Boltzmann Machine with binary units.
//!
//! ## Contrastive Divergence (CD-k)
//!
//! For a mini-batch `V` of `B` rows:
//! ```text
//! positive = Vᵀ · p(h | V)
//! negative = Ṽᵀ · p(h | Ṽ)          Ṽ = visible reconstruction after k Gibbs steps
//!
//! ΔW  = α (positive - negative) / B + m ΔW_prev
//! Δa  = α mean(V - Ṽ)
//! Δb  = α mean(p(h | V) - p(h | Ṽ))
//! ```

use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;
use std::path::Path;
use tracing::{debug, info};

use super::{ensure_width, DbnError, DbnResult};
use crate::checkpoint;
use crate::data::BatchPartitioner;
use crate::training::{EpochMetrics, ParameterSchedule};
use crate::utils::{logistic_matrix, mean_rows, mean_square_error, probs_to_binary};
use crate::RbmTrainConfig;

/// Initial weights are drawn uniformly from `[-INIT_WEIGHT_RANGE, INIT_WEIGHT_RANGE]`.
const INIT_WEIGHT_RANGE: f32 = 0.01;

/// Observer called once per epoch with the epoch index and one reconstructed sample.
pub type DisplayFn<'a> = &'a mut dyn FnMut(usize, ArrayView1<'_, f32>);

/// A Restricted Boltzmann Machine with binary visible and hidden units.
///
/// # Parameters
///
/// - **Weights:** `w` has shape `(num_visible, num_hidden)` and is shared by both sampling directions
/// - **Biases:** `v_bias` has length `num_visible`, `h_bias` has length `num_hidden`
///
/// Shapes are fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Rbm {
    pub num_visible: usize,
    pub num_hidden: usize,
    pub w: Array2<f32>,
    pub v_bias: Array1<f32>,
    pub h_bias: Array1<f32>,
}

impl Rbm {
    /// Create an RBM with small uniform random weights and zero biases.
    ///
    /// # Errors
    /// - `InvalidConfig` if either layer is empty
    pub fn new<R: Rng + ?Sized>(num_visible: usize, num_hidden: usize, rng: &mut R) -> DbnResult<Self> {
        if num_visible == 0 || num_hidden == 0 {
            return Err(DbnError::InvalidConfig(format!(
                "RBM layers must be non-empty, got ({num_visible}, {num_hidden})"
            )));
        }
        let dist = Uniform::new_inclusive(-INIT_WEIGHT_RANGE, INIT_WEIGHT_RANGE);
        Ok(Self {
            num_visible,
            num_hidden,
            w: Array2::random_using((num_visible, num_hidden), dist, rng),
            v_bias: Array1::zeros(num_visible),
            h_bias: Array1::zeros(num_hidden),
        })
    }

    /// Hidden activation probabilities `σ(v·W + h_bias)`.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `v` does not have `num_visible` columns
    pub fn hidden_probs<S: Data<Elem = f32>>(&self, v: &ArrayBase<S, Ix2>) -> DbnResult<Array2<f32>> {
        ensure_width("visible input", v.ncols(), self.num_visible)?;
        let mut activation = v.dot(&self.w);
        activation += &self.h_bias;
        Ok(logistic_matrix(&activation))
    }

    /// Visible activation probabilities `σ(h·Wᵀ + v_bias)`.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `h` does not have `num_hidden` columns
    pub fn visible_probs<S: Data<Elem = f32>>(&self, h: &ArrayBase<S, Ix2>) -> DbnResult<Array2<f32>> {
        ensure_width("hidden input", h.ncols(), self.num_hidden)?;
        let mut activation = h.dot(&self.w.t());
        activation += &self.v_bias;
        Ok(logistic_matrix(&activation))
    }

    /// Returns `(hidden probabilities, binary hidden sample)`.
    pub fn sample_hidden_from_visible<S, R>(
        &self,
        v: &ArrayBase<S, Ix2>,
        rng: &mut R,
    ) -> DbnResult<(Array2<f32>, Array2<f32>)>
    where
        S: Data<Elem = f32>,
        R: Rng + ?Sized,
    {
        let probs = self.hidden_probs(v)?;
        let states = probs_to_binary(&probs, rng);
        Ok((probs, states))
    }

    /// Returns `(visible probabilities, binary visible sample)`.
    pub fn sample_visible_from_hidden<S, R>(
        &self,
        h: &ArrayBase<S, Ix2>,
        rng: &mut R,
    ) -> DbnResult<(Array2<f32>, Array2<f32>)>
    where
        S: Data<Elem = f32>,
        R: Rng + ?Sized,
    {
        let probs = self.visible_probs(h)?;
        let states = probs_to_binary(&probs, rng);
        Ok((probs, states))
    }

    /// Mean per-sample squared error of the deterministic one-step reconstruction of `data`.
    pub fn reconstruction_error<S: Data<Elem = f32>>(&self, data: &ArrayBase<S, Ix2>) -> DbnResult<f32> {
        let hidden = self.hidden_probs(data)?;
        let reconstruction = self.visible_probs(&hidden)?;
        Ok(mean_square_error(data, &reconstruction))
    }

    /// Train with CD-k on mini-batches of `data`.
    ///
    /// Parameters are updated in place. The validation set, when given, is only
    /// used to report a reconstruction error after each epoch.
    ///
    /// The negative phase samples hidden states but keeps visible
    /// reconstructions as probabilities instead of binary samples.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `data` or `validation` width differs from `num_visible`
    /// - `InvalidConfig` for empty data, zero batch size, zero Gibbs steps or a bad schedule
    ///
    /// All checks happen before the first update.
    pub fn train<R: Rng + ?Sized>(
        &mut self,
        data: &Array2<f32>,
        validation: Option<&Array2<f32>>,
        config: &RbmTrainConfig,
        rng: &mut R,
        mut display: Option<DisplayFn<'_>>,
    ) -> DbnResult<Vec<EpochMetrics>> {
        ensure_width("training data", data.ncols(), self.num_visible)?;
        if let Some(val) = validation {
            ensure_width("validation data", val.ncols(), self.num_visible)?;
        }
        if data.nrows() == 0 {
            return Err(DbnError::InvalidConfig("training data is empty".to_string()));
        }
        if config.gibbs_k == 0 {
            return Err(DbnError::InvalidConfig("gibbs_k must be at least 1".to_string()));
        }
        let mut alpha_schedule = ParameterSchedule::new(config.alpha_rule, &config.alpha, config.epochs)?;
        let mut momentum_schedule =
            ParameterSchedule::new(config.momentum_rule, &config.momentum, config.epochs)?;
        let partitioner = BatchPartitioner::new(data.nrows(), config.batch_size)?;

        debug!(
            num_visible = self.num_visible,
            num_hidden = self.num_hidden,
            batches = partitioner.num_batches(),
            "starting CD-{} training",
            config.gibbs_k
        );

        let mut velocity = Array2::<f32>::zeros(self.w.dim());
        let mut history = Vec::with_capacity(config.epochs);

        for epoch in 0..config.epochs {
            let alpha = alpha_schedule.update();
            let momentum = momentum_schedule.update();

            let mut epoch_error = 0.0f32;
            let mut last_reconstruction = None;
            for batch in partitioner.batches(data)? {
                let (error, reconstruction) =
                    self.cd_step(batch, alpha, momentum, config.gibbs_k, &mut velocity, rng)?;
                epoch_error += error * batch.nrows() as f32;
                last_reconstruction = Some(reconstruction);
            }
            let reconstruction_error = epoch_error / data.nrows() as f32;

            let validation_error = match validation {
                Some(val) if val.nrows() > 0 => Some(self.reconstruction_error(val)?),
                _ => None,
            };

            if let (Some(show), Some(recon)) = (display.as_deref_mut(), last_reconstruction.as_ref()) {
                let row = rng.gen_range(0..recon.nrows());
                show(epoch, recon.row(row));
            }

            info!(
                "RBM ({}, {}) epoch {}/{}: reconstruction error {:.6}, validation error {}",
                self.num_visible,
                self.num_hidden,
                epoch + 1,
                config.epochs,
                reconstruction_error,
                validation_error.map_or_else(|| "n/a".to_string(), |e| format!("{e:.6}"))
            );

            history.push(EpochMetrics {
                epoch,
                alpha,
                momentum,
                reconstruction_error,
                validation_error,
            });
        }

        Ok(history)
    }

    /// One CD-k update on a mini-batch.
    ///
    /// Returns the batch's mean squared reconstruction error and the negative-phase
    /// visible reconstruction.
    fn cd_step<R: Rng + ?Sized>(
        &mut self,
        batch: ArrayView2<'_, f32>,
        alpha: f32,
        momentum: f32,
        gibbs_k: usize,
        velocity: &mut Array2<f32>,
        rng: &mut R,
    ) -> DbnResult<(f32, Array2<f32>)> {
        let batch_len = batch.nrows() as f32;

        // Positive phase
        let (pos_h_probs, pos_h_states) = self.sample_hidden_from_visible(&batch, rng)?;

        // Negative phase: k alternating Gibbs steps from the sampled hidden state.
        // Visible reconstructions stay as probabilities.
        let mut h_states = pos_h_states;
        let mut neg_v = Array2::zeros(batch.dim());
        let mut neg_h_probs = Array2::zeros(pos_h_probs.dim());
        for _ in 0..gibbs_k {
            neg_v = self.visible_probs(&h_states)?;
            let (probs, states) = self.sample_hidden_from_visible(&neg_v, rng)?;
            neg_h_probs = probs;
            h_states = states;
        }

        let positive = batch.t().dot(&pos_h_probs);
        let negative = neg_v.t().dot(&neg_h_probs);

        velocity.mapv_inplace(|dw| dw * momentum);
        velocity.scaled_add(alpha / batch_len, &(&positive - &negative));
        self.w += &*velocity;

        self.v_bias.scaled_add(alpha, &mean_rows(&(&batch - &neg_v)));
        self.h_bias.scaled_add(alpha, &mean_rows(&(&pos_h_probs - &neg_h_probs)));

        Ok((mean_square_error(&batch, &neg_v), neg_v))
    }

    /// Write this RBM to a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_configuration(&self, path: &Path) -> DbnResult<()> {
        checkpoint::save_rbm(self, path)
    }

    /// Overwrite parameters from a configuration file with the same dimensions.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the stored dimensions differ; parameters are left untouched
    /// - `Io` / `Json` if the file cannot be read or parsed
    pub fn load_configuration(&mut self, path: &Path) -> DbnResult<()> {
        let loaded = checkpoint::load_rbm(path)?;
        if (loaded.num_visible, loaded.num_hidden) != (self.num_visible, self.num_hidden) {
            return Err(DbnError::ShapeMismatch(format!(
                "configuration {} is ({}, {}), RBM is ({}, {})",
                path.display(),
                loaded.num_visible,
                loaded.num_hidden,
                self.num_visible,
                self.num_hidden
            )));
        }
        *self = loaded;
        Ok(())
    }

    /// Build an RBM from a configuration file, taking its dimensions from the file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or is internally inconsistent.
    pub fn from_configuration(path: &Path) -> DbnResult<Self> {
        checkpoint::load_rbm(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_rbm_init() {
        let rbm = Rbm::new(6, 4, &mut rng()).unwrap();
        assert_eq!(rbm.w.dim(), (6, 4));
        assert_eq!(rbm.v_bias.len(), 6);
        assert_eq!(rbm.h_bias.len(), 4);
        assert!(rbm.w.iter().all(|w| w.abs() <= INIT_WEIGHT_RANGE));
        assert!(rbm.h_bias.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_invalid_dims() {
        assert!(Rbm::new(0, 3, &mut rng()).is_err());
        assert!(Rbm::new(3, 0, &mut rng()).is_err());
    }

    #[test]
    fn test_hidden_probs_in_open_unit_interval() {
        let mut rng = rng();
        let mut rbm = Rbm::new(5, 3, &mut rng).unwrap();
        rbm.w.fill(4.0);
        let v = Array2::random_using((20, 5), Uniform::new(0.0f32, 1.0), &mut rng);
        let (probs, states) = rbm.sample_hidden_from_visible(&v, &mut rng).unwrap();
        assert!(probs.iter().all(|&p| p > 0.0 && p < 1.0));
        assert!(states.iter().all(|&s| s == 0.0 || s == 1.0));
    }

    #[test]
    fn test_bernoulli_sample_matches_probability() {
        let mut rng = rng();
        let mut rbm = Rbm::new(2, 3, &mut rng).unwrap();
        rbm.w.fill(0.0);
        // σ(b) = 0.2, 0.5, 0.9
        rbm.h_bias = array![(0.2f32 / 0.8).ln(), 0.0, (0.9f32 / 0.1).ln()];
        let v = Array2::zeros((4000, 2));

        let (probs, states) = rbm.sample_hidden_from_visible(&v, &mut rng).unwrap();
        let freq = mean_rows(&states);
        for j in 0..3 {
            assert_abs_diff_eq!(freq[j], probs[[0, j]], epsilon = 0.03);
        }
    }

    #[test]
    fn test_sampling_shape_round_trip() {
        let mut rng = rng();
        let rbm = Rbm::new(7, 3, &mut rng).unwrap();
        let v = Array2::zeros((5, 7));
        let (_, h) = rbm.sample_hidden_from_visible(&v, &mut rng).unwrap();
        let (v_probs, v_states) = rbm.sample_visible_from_hidden(&h, &mut rng).unwrap();
        assert_eq!(v_probs.dim(), v.dim());
        assert_eq!(v_states.dim(), v.dim());
    }

    #[test]
    fn test_sampling_rejects_wrong_width() {
        let mut rng = rng();
        let rbm = Rbm::new(4, 2, &mut rng).unwrap();
        let v = Array2::zeros((3, 5));
        let err = rbm.sample_hidden_from_visible(&v, &mut rng).unwrap_err();
        assert!(matches!(err, DbnError::ShapeMismatch(_)));
        assert!(rbm.sample_visible_from_hidden(&v, &mut rng).is_err());
    }

    #[test]
    fn test_train_rejects_mismatch_before_update() {
        let mut rng = rng();
        let mut rbm = Rbm::new(4, 2, &mut rng).unwrap();
        let original = rbm.clone();
        let data = Array2::ones((10, 4));
        let bad_val = Array2::ones((2, 3));
        let result = rbm.train(&data, Some(&bad_val), &RbmTrainConfig::default(), &mut rng, None);
        assert!(matches!(result, Err(DbnError::ShapeMismatch(_))));
        assert_eq!(rbm, original);
    }

    #[test]
    fn test_train_rejects_zero_gibbs_steps() {
        let mut rng = rng();
        let mut rbm = Rbm::new(4, 2, &mut rng).unwrap();
        let config = RbmTrainConfig {
            gibbs_k: 0,
            ..RbmTrainConfig::default()
        };
        let data = Array2::ones((10, 4));
        assert!(rbm.train(&data, None, &config, &mut rng, None).is_err());
    }

    #[test]
    fn test_train_updates_parameters_and_reports() {
        let mut rng = rng();
        let mut rbm = Rbm::new(4, 3, &mut rng).unwrap();
        let original_w = rbm.w.clone();
        let data = array![[1.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 1.0], [1.0, 1.0, 0.0, 0.0]];
        let config = RbmTrainConfig {
            epochs: 3,
            batch_size: 2,
            gibbs_k: 2,
            ..RbmTrainConfig::default()
        };

        let mut shown = Vec::new();
        let mut display = |epoch: usize, sample: ArrayView1<'_, f32>| shown.push((epoch, sample.len()));
        let history = rbm
            .train(&data, Some(&data), &config, &mut rng, Some(&mut display))
            .unwrap();

        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|m| m.validation_error.is_some()));
        assert_ne!(rbm.w, original_w);
        assert_eq!(shown, vec![(0, 4), (1, 4), (2, 4)]);
    }
}
