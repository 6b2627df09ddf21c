//! JSON persistence for RBMs and DBN training metrics.
//!
//! One file per RBM, with stable field names:
//! ```text
//! { "num_visible": 784, "num_hidden": 500, "W": [[...], ...], "v_bias": [...], "h_bias": [...] }
//! ```
//! Fine-tuning errors are stored as `{ "errors": [...] }`.

use crate::core::{DbnError, DbnResult, Rbm};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Serializable RBM configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbmConfiguration {
    pub num_visible: usize,
    pub num_hidden: usize,
    /// Weight matrix as `num_visible` rows of `num_hidden` values.
    #[serde(rename = "W")]
    pub w: Vec<Vec<f32>>,
    pub v_bias: Vec<f32>,
    pub h_bias: Vec<f32>,
}

/// Serializable fine-tuning error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub errors: Vec<f32>,
}

/// Convert an Array2 to Vec<Vec<f32>> for serialization.
fn array2_to_vecs(arr: &Array2<f32>) -> Vec<Vec<f32>> {
    arr.rows().into_iter().map(|row| row.to_vec()).collect()
}

/// Convert Vec<Vec<f32>> back to an Array2 of the expected shape.
fn vecs_to_array2(vecs: &[Vec<f32>], nrows: usize, ncols: usize) -> DbnResult<Array2<f32>> {
    if vecs.len() != nrows || vecs.iter().any(|r| r.len() != ncols) {
        return Err(DbnError::ShapeMismatch(format!(
            "stored weight matrix is not {nrows} x {ncols}"
        )));
    }
    let flat: Vec<f32> = vecs.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| DbnError::ShapeMismatch(format!("failed to rebuild weight matrix: {e}")))
}

impl From<&Rbm> for RbmConfiguration {
    fn from(rbm: &Rbm) -> Self {
        Self {
            num_visible: rbm.num_visible,
            num_hidden: rbm.num_hidden,
            w: array2_to_vecs(&rbm.w),
            v_bias: rbm.v_bias.to_vec(),
            h_bias: rbm.h_bias.to_vec(),
        }
    }
}

impl TryFrom<RbmConfiguration> for Rbm {
    type Error = DbnError;

    fn try_from(config: RbmConfiguration) -> DbnResult<Self> {
        let (nv, nh) = (config.num_visible, config.num_hidden);
        if nv == 0 || nh == 0 {
            return Err(DbnError::InvalidConfig(format!(
                "stored RBM has empty layer ({nv}, {nh})"
            )));
        }
        if config.v_bias.len() != nv || config.h_bias.len() != nh {
            return Err(DbnError::ShapeMismatch(format!(
                "stored biases have lengths ({}, {}), expected ({nv}, {nh})",
                config.v_bias.len(),
                config.h_bias.len()
            )));
        }
        Ok(Rbm {
            num_visible: nv,
            num_hidden: nh,
            w: vecs_to_array2(&config.w, nv, nh)?,
            v_bias: Array1::from(config.v_bias),
            h_bias: Array1::from(config.h_bias),
        })
    }
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> DbnResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let io_err = |source| DbnError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    std::fs::write(path, json).map_err(io_err)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> DbnResult<T> {
    let json = std::fs::read_to_string(path).map_err(|source| DbnError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&json)?)
}

/// Save an RBM configuration to a JSON file, creating parent directories.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the data cannot be serialized.
pub fn save_rbm(rbm: &Rbm, path: &Path) -> DbnResult<()> {
    write_json(&RbmConfiguration::from(rbm), path)
}

/// Load an RBM from a JSON configuration file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the stored
/// arrays disagree with the stored dimensions.
pub fn load_rbm(path: &Path) -> DbnResult<Rbm> {
    let config: RbmConfiguration = read_json(path)?;
    Rbm::try_from(config)
}

/// Save the fine-tuning error log as `{ "errors": [...] }`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_metrics(errors: &[f32], path: &Path) -> DbnResult<()> {
    write_json(
        &PerformanceMetrics {
            errors: errors.to_vec(),
        },
        path,
    )
}

/// Load a fine-tuning error log.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_metrics(path: &Path) -> DbnResult<PerformanceMetrics> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;

    fn make_test_rbm() -> Rbm {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rbm = Rbm::new(4, 3, &mut rng).expect("valid dims");
        rbm.v_bias = Array1::from(vec![0.1, -0.2, 0.3, 1e-7]);
        rbm.h_bias = Array1::from(vec![-1.5, 0.0, 2.25]);
        rbm
    }

    #[test]
    fn test_rbm_round_trip_is_exact() {
        let rbm = make_test_rbm();
        let dir = std::env::temp_dir().join("dbn_test_checkpoint");
        let path = dir.join("rbm.json");

        save_rbm(&rbm, &path).expect("save");
        let loaded = load_rbm(&path).expect("load");

        assert_eq!(loaded.w, rbm.w);
        assert_eq!(loaded.v_bias, rbm.v_bias);
        assert_eq!(loaded.h_bias, rbm.h_bias);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_field_names() {
        let json = serde_json::to_value(RbmConfiguration::from(&make_test_rbm())).unwrap();
        for key in ["num_visible", "num_hidden", "W", "v_bias", "h_bias"] {
            assert!(json.get(key).is_some(), "missing field {key}");
        }
        assert_eq!(json["W"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_inconsistent_configuration() {
        let mut config = RbmConfiguration::from(&make_test_rbm());
        config.w.pop();
        assert!(matches!(Rbm::try_from(config), Err(DbnError::ShapeMismatch(_))));

        let mut config = RbmConfiguration::from(&make_test_rbm());
        config.h_bias.push(0.0);
        assert!(Rbm::try_from(config).is_err());
    }

    #[test]
    fn test_metrics_round_trip() {
        let dir = std::env::temp_dir().join("dbn_test_metrics");
        let path = dir.join("nested").join("metrics.json");
        save_metrics(&[3.5, 2.25, 1.0], &path).expect("save");
        assert!(path.exists());

        let metrics = load_metrics(&path).expect("load");
        assert_eq!(metrics.errors, vec![3.5, 2.25, 1.0]);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"errors\""));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_nonexistent_configuration() {
        let result = load_rbm(Path::new("/nonexistent/path.json"));
        assert!(matches!(result, Err(DbnError::Io { .. })));
    }
}
