//! Math utilities, activation functions, and helpers.

use ndarray::{concatenate, Array1, Array2, ArrayBase, Axis, Data, Ix2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;

use crate::core::{DbnError, DbnResult};

/// Logistic arguments are clipped to this magnitude so `exp` never overflows
/// and probabilities stay strictly inside (0, 1) in f32.
pub const LOGISTIC_CLIP: f32 = 16.0;

/// Floor applied to probabilities before taking logarithms.
const LOG_FLOOR: f32 = 1e-10;

/// Activation function: logistic sigmoid.
#[inline]
pub fn logistic(x: f32) -> f32 {
    let x = x.clamp(-LOGISTIC_CLIP, LOGISTIC_CLIP);
    1.0 / (1.0 + (-x).exp())
}

/// Derivative of the logistic function, expressed through its output `p = σ(x)`.
#[inline]
pub fn d_logistic(p: f32) -> f32 {
    p * (1.0 - p)
}

/// Apply the logistic function elementwise.
pub fn logistic_matrix<S: Data<Elem = f32>>(x: &ArrayBase<S, Ix2>) -> Array2<f32> {
    x.mapv(logistic)
}

/// Row-wise softmax. Each row is shifted by its maximum before exponentiation.
pub fn softmax_rows<S: Data<Elem = f32>>(x: &ArrayBase<S, Ix2>) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

/// Draw binary states from unit probabilities.
///
/// One uniform threshold is drawn per unit; the unit is on iff the threshold
/// falls below its probability.
pub fn probs_to_binary<S, R>(probs: &ArrayBase<S, Ix2>, rng: &mut R) -> Array2<f32>
where
    S: Data<Elem = f32>,
    R: Rng + ?Sized,
{
    let thresholds = Array2::random_using(probs.dim(), Uniform::new(0.0f32, 1.0), rng);
    let mut states = probs.to_owned();
    states.zip_mut_with(&thresholds, |p, &t| *p = if t < *p { 1.0 } else { 0.0 });
    states
}

/// One-hot encode integer labels into a `(n, num_classes)` matrix.
///
/// # Errors
/// - `ShapeMismatch` if a label is outside `0..num_classes`
pub fn one_hot(labels: &[usize], num_classes: usize) -> DbnResult<Array2<f32>> {
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(DbnError::ShapeMismatch(format!(
                "label {label} at row {i} is out of range for {num_classes} classes"
            )));
        }
        out[[i, label]] = 1.0;
    }
    Ok(out)
}

/// Decode each row to the index of its largest entry.
pub fn argmax_rows<S: Data<Elem = f32>>(x: &ArrayBase<S, Ix2>) -> Vec<usize> {
    x.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_v), (j, &v)| {
                    if v > best_v {
                        (j, v)
                    } else {
                        (best, best_v)
                    }
                })
                .0
        })
        .collect()
}

/// Prepend a column of ones for the bias term.
pub fn add_bias_column<S: Data<Elem = f32>>(x: &ArrayBase<S, Ix2>) -> Array2<f32> {
    let ones = Array2::ones((x.nrows(), 1));
    concatenate![Axis(1), ones, x.view()]
}

/// Concatenate two matrices side by side (same number of rows).
///
/// # Errors
/// - `ShapeMismatch` if the row counts differ
pub fn hstack<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>) -> DbnResult<Array2<f32>>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    concatenate(Axis(1), &[a.view(), b.view()])
        .map_err(|e| DbnError::ShapeMismatch(format!("cannot join columns: {e}")))
}

/// Column means of a matrix (zeros for an empty matrix).
pub fn mean_rows<S: Data<Elem = f32>>(x: &ArrayBase<S, Ix2>) -> Array1<f32> {
    x.mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()))
}

/// Mean over samples of the per-sample squared error.
pub fn mean_square_error<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>) -> f32
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    if a.nrows() == 0 {
        return 0.0;
    }
    let diff = a - b;
    diff.mapv(|d| d * d).sum() / a.nrows() as f32
}

/// Summed cross-entropy `-Σ t·ln(p)` between predicted distributions and targets.
pub fn cross_entropy_error<S1, S2>(probs: &ArrayBase<S1, Ix2>, targets: &ArrayBase<S2, Ix2>) -> f32
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    probs
        .iter()
        .zip(targets.iter())
        .map(|(&p, &t)| -t * p.max(LOG_FLOOR).ln())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_logistic() {
        assert_abs_diff_eq!(logistic(0.0), 0.5);
        assert!(logistic(1e6) < 1.0);
        assert!(logistic(-1e6) > 0.0);
        assert_abs_diff_eq!(d_logistic(0.5), 0.25);
    }

    #[test]
    fn test_softmax_large_inputs() {
        let x = array![[1000.0, 1000.0], [0.0, -1000.0]];
        let s = softmax_rows(&x);
        assert!(s.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(s[[0, 0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(s.row(1).sum(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_probs_to_binary_extremes() {
        let mut rng = StdRng::seed_from_u64(3);
        let probs = array![[0.0, 1.0, 0.0], [1.0, 0.0, 1.0]];
        let states = probs_to_binary(&probs, &mut rng);
        assert_eq!(states, probs);
    }

    #[test]
    fn test_one_hot_and_argmax() {
        let encoded = one_hot(&[2, 0, 1], 3).unwrap();
        assert_eq!(encoded, array![[0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_eq!(argmax_rows(&encoded), vec![2, 0, 1]);
        assert!(one_hot(&[3], 3).is_err());
    }

    #[test]
    fn test_add_bias_column() {
        let x = array![[2.0, 3.0]];
        assert_eq!(add_bias_column(&x), array![[1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_hstack_row_mismatch() {
        let a = Array2::<f32>::zeros((2, 1));
        let b = Array2::<f32>::zeros((3, 1));
        assert!(hstack(&a, &b).is_err());
        assert_eq!(hstack(&a, &a).unwrap().dim(), (2, 2));
    }

    #[test]
    fn test_errors() {
        let a = array![[1.0, 0.0], [0.0, 1.0]];
        let b = array![[0.0, 0.0], [0.0, 1.0]];
        assert_abs_diff_eq!(mean_square_error(&a, &b), 0.5);
        let probs = array![[0.5, 0.5]];
        let targets = array![[1.0, 0.0]];
        assert_abs_diff_eq!(cross_entropy_error(&probs, &targets), 2.0f32.ln(), epsilon = 1e-6);
    }
}
