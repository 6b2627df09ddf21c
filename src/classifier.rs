//! Classifier heads trained on the top representation of a DBN.
//!
//! The DBN only relies on the [`Classifier`] fit/predict contract. The bundled
//! [`LogisticRegression`] is a small multinomial softmax regression trained with
//! full-batch gradient descent.

use ndarray::{s, Array2};
use tracing::debug;

use crate::core::{DbnError, DbnResult};
use crate::utils::{add_bias_column, argmax_rows, one_hot, softmax_rows};

/// A supervised classifier over dense `f32` matrices (rows are samples).
pub trait Classifier {
    /// Fit the classifier to `data` with one integer label per row.
    fn fit(&mut self, data: &Array2<f32>, labels: &[usize]) -> DbnResult<()>;

    /// Predict one integer label per row of `data`.
    fn predict(&self, data: &Array2<f32>) -> DbnResult<Vec<usize>>;

    /// Name for debugging
    fn name(&self) -> &'static str;
}

/// Multinomial logistic regression with L2 regularisation.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    pub learning_rate: f32,
    pub epochs: usize,
    pub l2: f32,
    /// Bias-augmented weights, shape `(n_features + 1, n_classes)`; `None` until fitted
    weights: Option<Array2<f32>>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new(0.5, 200, 1e-4)
    }
}

impl LogisticRegression {
    pub fn new(learning_rate: f32, epochs: usize, l2: f32) -> Self {
        Self {
            learning_rate,
            epochs,
            l2,
            weights: None,
        }
    }

    /// Class probabilities for each row of `data`.
    ///
    /// # Errors
    /// - `Untrained` before `fit`
    /// - `ShapeMismatch` if the feature count differs from the training data
    pub fn predict_proba(&self, data: &Array2<f32>) -> DbnResult<Array2<f32>> {
        let weights = self
            .weights
            .as_ref()
            .ok_or(DbnError::Untrained("logistic regression must be fitted first"))?;
        crate::core::ensure_width("classifier input", data.ncols() + 1, weights.nrows())?;
        Ok(softmax_rows(&add_bias_column(data).dot(weights)))
    }
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, data: &Array2<f32>, labels: &[usize]) -> DbnResult<()> {
        if data.nrows() != labels.len() {
            return Err(DbnError::ShapeMismatch(format!(
                "{} rows but {} labels",
                data.nrows(),
                labels.len()
            )));
        }
        let num_classes = labels.iter().max().map_or(0, |&m| m + 1);
        if num_classes == 0 {
            return Err(DbnError::InvalidConfig("cannot fit on an empty dataset".to_string()));
        }

        let x = add_bias_column(data);
        let targets = one_hot(labels, num_classes)?;
        let n = x.nrows() as f32;
        let mut weights = Array2::<f32>::zeros((x.ncols(), num_classes));

        for _ in 0..self.epochs {
            let probs = softmax_rows(&x.dot(&weights));
            let mut grad = x.t().dot(&(&probs - &targets)) / n;
            // no penalty on the bias row
            grad.slice_mut(s![1.., ..])
                .scaled_add(self.l2, &weights.slice(s![1.., ..]));
            weights.scaled_add(-self.learning_rate, &grad);
        }

        debug!(
            features = data.ncols(),
            classes = num_classes,
            "fitted logistic regression"
        );
        self.weights = Some(weights);
        Ok(())
    }

    fn predict(&self, data: &Array2<f32>) -> DbnResult<Vec<usize>> {
        Ok(argmax_rows(&self.predict_proba(data)?))
    }

    fn name(&self) -> &'static str {
        "logistic-regression"
    }
}

/// Share of predictions equal to their label.
pub fn accuracy(predictions: &[usize], labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count();
    correct as f32 / labels.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_logistic_regression_separable() {
        let data = array![[0.0, 0.1], [0.1, 0.0], [1.0, 0.9], [0.9, 1.0], [0.0, 1.0], [0.1, 0.9]];
        let labels = vec![0, 0, 1, 1, 2, 2];
        let mut cls = LogisticRegression::new(1.0, 2000, 0.0);
        cls.fit(&data, &labels).unwrap();

        let predictions = cls.predict(&data).unwrap();
        assert!(accuracy(&predictions, &labels) >= 5.0 / 6.0, "{predictions:?}");
    }

    #[test]
    fn test_predict_before_fit() {
        let cls = LogisticRegression::default();
        let result = cls.predict(&array![[1.0]]);
        assert!(matches!(result, Err(DbnError::Untrained(_))));
    }

    #[test]
    fn test_fit_label_mismatch() {
        let mut cls = LogisticRegression::default();
        assert!(cls.fit(&array![[1.0], [2.0]], &[0]).is_err());
    }

    #[test]
    fn test_predict_width_mismatch() {
        let mut cls = LogisticRegression::new(0.1, 5, 0.0);
        cls.fit(&array![[1.0, 0.0], [0.0, 1.0]], &[0, 1]).unwrap();
        assert!(cls.predict(&array![[1.0]]).is_err());
    }

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[1, 2, 3, 4], &[1, 2, 0, 4]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }
}
