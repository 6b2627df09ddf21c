//! Dataset loading, preprocessing, and mini-batch partitioning.
//!
//! ## Submodules
//!
//! - [`batches`] — Contiguous mini-batches over data and paired labels
//! - [`mnist`] — MNIST IDX file loading

pub mod batches;
pub mod mnist;

pub use batches::BatchPartitioner;
pub use mnist::{load_mnist, MnistSplit};

use ndarray::{Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

use crate::core::{DbnError, DbnResult};

/// Scale every value into `[0, 1]` by the dataset's global min and max.
pub fn normalize(data: &mut Array2<f32>) {
    let data_min = data.iter().fold(f32::INFINITY, |a, &b| a.min(b));
    let data_max = data.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let range = data_max - data_min;

    if range == 0.0 || !range.is_finite() {
        warn!("cannot normalize data with range {range}, leaving it unchanged");
        return;
    }

    data.mapv_inplace(|v| (v - data_min) / range);
}

/// Binarise values: 1 where `value > threshold`, else 0.
pub fn binarize(data: &Array2<f32>, threshold: f32) -> Array2<f32> {
    data.mapv(|v| if v > threshold { 1.0 } else { 0.0 })
}

/// Shuffle rows of `data` and `labels` with one shared permutation.
///
/// # Errors
/// - `ShapeMismatch` if `labels.len()` differs from the number of rows
pub fn shuffle_rows<R: Rng + ?Sized>(
    data: &Array2<f32>,
    labels: &[usize],
    rng: &mut R,
) -> DbnResult<(Array2<f32>, Vec<usize>)> {
    if data.nrows() != labels.len() {
        return Err(DbnError::ShapeMismatch(format!(
            "{} data rows but {} labels",
            data.nrows(),
            labels.len()
        )));
    }
    let mut order: Vec<usize> = (0..labels.len()).collect();
    order.shuffle(rng);

    let shuffled = data.select(Axis(0), &order);
    let shuffled_labels = order.iter().map(|&i| labels[i]).collect();
    Ok((shuffled, shuffled_labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_normalize() {
        let mut data = array![[0.0, 255.0], [51.0, 102.0]];
        normalize(&mut data);

        assert_abs_diff_eq!(data[[0, 0]], 0.0);
        assert_abs_diff_eq!(data[[0, 1]], 1.0);
        assert_abs_diff_eq!(data[[1, 0]], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_normalize_constant_data_untouched() {
        let mut data = array![[3.0, 3.0]];
        normalize(&mut data);
        assert_eq!(data, array![[3.0, 3.0]]);
    }

    #[test]
    fn test_binarize() {
        let data = array![[0.1, 0.6], [0.5, 0.9]];
        assert_eq!(binarize(&data, 0.5), array![[0.0, 1.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_shuffle_keeps_pairs() {
        let data = Array2::from_shape_fn((10, 2), |(i, _)| i as f32);
        let labels: Vec<usize> = (0..10).collect();
        let mut rng = StdRng::seed_from_u64(11);
        let (x, y) = shuffle_rows(&data, &labels, &mut rng).unwrap();
        for (row, label) in x.rows().into_iter().zip(&y) {
            assert_eq!(row[0] as usize, *label);
        }
        let mut sorted = y.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, labels);
    }

    #[test]
    fn test_shuffle_length_mismatch() {
        let data = Array2::<f32>::zeros((3, 2));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(shuffle_rows(&data, &[0, 1], &mut rng).is_err());
    }
}
