//! Core DBN algorithm implementation.
//!
//! This module provides the two model types and their shared error type:
//! - [`rbm`]: Restricted Boltzmann Machine with sampling, CD-k training and persistence
//! - [`dbn`]: Deep Belief Network orchestrating greedy pretraining and fine-tuning
//!
//! ## Energy Model
//!
//! Each RBM defines a joint distribution over binary visible and hidden units:
//! ```text
//! E(v, h) = -v·W·h - a·v - b·h
//!
//! p(h_j = 1 | v) = σ(b_j + Σ_i v_i W_ij)
//! p(v_i = 1 | h) = σ(a_i + Σ_j W_ij h_j)
//! ```
//!
//! All matrices follow the batch convention: rows are samples, columns are units.

pub mod dbn;
pub mod rbm;

pub use dbn::{Dbn, ForwardPass};
pub use rbm::Rbm;

use thiserror::Error;

/// Error type for RBM and DBN operations.
#[derive(Debug, Error)]
pub enum DbnError {
    /// Dimension mismatch between data, labels, layers or a loaded configuration
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Invalid hyper-parameters or network configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    /// Operation needs state that only a previous training step creates
    #[error("Untrained: {0}")]
    Untrained(&'static str),
    /// Operation is declared but not supported
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DbnResult<T> = Result<T, DbnError>;

/// Check that a matrix has the expected number of columns.
pub(crate) fn ensure_width(what: &str, actual: usize, expected: usize) -> DbnResult<()> {
    if actual != expected {
        return Err(DbnError::ShapeMismatch(format!(
            "{what} has {actual} columns, expected {expected}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_width() {
        assert!(ensure_width("data", 4, 4).is_ok());
        let err = ensure_width("data", 3, 4).unwrap_err();
        assert!(matches!(err, DbnError::ShapeMismatch(_)));
        assert_eq!(err.to_string(), "Shape mismatch: data has 3 columns, expected 4");
    }

    #[test]
    fn test_not_implemented_display() {
        let err = DbnError::NotImplemented("fantasy");
        assert_eq!(err.to_string(), "Not implemented: fantasy");
    }
}
