//! Mini-batch partitioning.
//!
//! A [`BatchPartitioner`] computes one sequence of contiguous row ranges.
//! Data and labels are both sliced from that same sequence, so batch `i` of
//! the data always lines up with batch `i` of the labels.

use ndarray::{s, ArrayBase, ArrayView2, Data, Ix2};
use std::ops::Range;

use crate::core::{DbnError, DbnResult};

/// Splits `n_samples` ordered rows into batches of at most `batch_size` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPartitioner {
    n_samples: usize,
    batch_size: usize,
}

impl BatchPartitioner {
    /// # Errors
    /// - `InvalidConfig` if `batch_size` is zero
    pub fn new(n_samples: usize, batch_size: usize) -> DbnResult<Self> {
        if batch_size == 0 {
            return Err(DbnError::InvalidConfig("batch size must be positive".to_string()));
        }
        Ok(Self {
            n_samples,
            batch_size,
        })
    }

    /// Number of batches, counting a trailing short batch.
    pub fn num_batches(&self) -> usize {
        self.n_samples.div_ceil(self.batch_size)
    }

    /// Lazy sequence of row ranges; the last one may be shorter than the batch size.
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.n_samples)
            .step_by(self.batch_size)
            .map(move |start| start..(start + self.batch_size).min(self.n_samples))
    }

    /// Lazy sequence of row slices of `data`.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `data` does not have `n_samples` rows
    pub fn batches<'a, S>(
        &'a self,
        data: &'a ArrayBase<S, Ix2>,
    ) -> DbnResult<impl Iterator<Item = ArrayView2<'a, f32>> + 'a>
    where
        S: Data<Elem = f32>,
    {
        self.check_rows("data", data.nrows())?;
        Ok(self.ranges().map(move |r| data.slice(s![r, ..])))
    }

    /// Lazy sequence of `(data, labels)` slices cut from the same ranges.
    ///
    /// # Errors
    /// - `ShapeMismatch` if either matrix does not have `n_samples` rows
    pub fn paired<'a, S1, S2>(
        &'a self,
        data: &'a ArrayBase<S1, Ix2>,
        labels: &'a ArrayBase<S2, Ix2>,
    ) -> DbnResult<impl Iterator<Item = (ArrayView2<'a, f32>, ArrayView2<'a, f32>)> + 'a>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
    {
        self.check_rows("data", data.nrows())?;
        self.check_rows("labels", labels.nrows())?;
        Ok(self.ranges().map(move |r| {
            (
                data.slice(s![r.clone(), ..]),
                labels.slice(s![r, ..]),
            )
        }))
    }

    fn check_rows(&self, what: &str, rows: usize) -> DbnResult<()> {
        if rows != self.n_samples {
            return Err(DbnError::ShapeMismatch(format!(
                "{what} has {rows} rows, partition expects {}",
                self.n_samples
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn numbered(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(i, j)| (i * cols + j) as f32)
    }

    #[test]
    fn test_batch_sizes_23_by_5() {
        let data = numbered(23, 2);
        let partitioner = BatchPartitioner::new(23, 5).unwrap();
        let sizes: Vec<usize> = partitioner
            .batches(&data)
            .unwrap()
            .map(|b| b.nrows())
            .collect();
        assert_eq!(sizes, vec![5, 5, 5, 5, 3]);
        assert_eq!(sizes.iter().sum::<usize>(), 23);
        assert_eq!(partitioner.num_batches(), 5);
    }

    #[test]
    fn test_order_preserved() {
        let data = numbered(23, 2);
        let partitioner = BatchPartitioner::new(23, 5).unwrap();
        let mut next_row = 0;
        for batch in partitioner.batches(&data).unwrap() {
            for row in batch.rows() {
                assert_eq!(row, data.row(next_row));
                next_row += 1;
            }
        }
        assert_eq!(next_row, 23);
    }

    #[test]
    fn test_paired_batches_line_up() {
        let data = numbered(7, 3);
        let labels = Array2::from_shape_fn((7, 1), |(i, _)| i as f32);
        let partitioner = BatchPartitioner::new(7, 3).unwrap();
        for (x, y) in partitioner.paired(&data, &labels).unwrap() {
            assert_eq!(x.nrows(), y.nrows());
            for (xr, yr) in x.rows().into_iter().zip(y.rows()) {
                assert_eq!(xr[0], yr[0] * 3.0);
            }
        }
    }

    #[test]
    fn test_mismatched_rows() {
        let data = numbered(7, 3);
        let labels = Array2::<f32>::zeros((6, 1));
        let partitioner = BatchPartitioner::new(7, 3).unwrap();
        assert!(partitioner.paired(&data, &labels).is_err());
    }

    #[test]
    fn test_zero_batch_size() {
        assert!(BatchPartitioner::new(10, 0).is_err());
    }

    #[test]
    fn test_batch_larger_than_dataset() {
        let partitioner = BatchPartitioner::new(3, 10).unwrap();
        let ranges: Vec<_> = partitioner.ranges().collect();
        assert_eq!(ranges, vec![0..3]);
    }
}
