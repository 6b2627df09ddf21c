//! MNIST dataset loading.
//!
//! ## IDX Format
//!
//! Both files start with a big-endian header:
//! ```text
//! images: [magic 0x00000803: u32] [count: u32] [rows: u32] [cols: u32] [pixels: count×rows×cols u8]
//! labels: [magic 0x00000801: u32] [count: u32] [labels: count u8]
//! ```
//! Pixels are row-major, 0 (background) to 255 (ink).

use ndarray::{s, Array2};
use std::fs;
use std::io;
use std::path::Path;

/// Magic number of an IDX image file (unsigned bytes, 3 dimensions).
pub const IMAGES_MAGIC: u32 = 0x0000_0803;
/// Magic number of an IDX label file (unsigned bytes, 1 dimension).
pub const LABELS_MAGIC: u32 = 0x0000_0801;
/// Number of digit classes.
pub const MNIST_NUM_CLASSES: usize = 10;

/// Which half of the dataset to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MnistSplit {
    Train,
    Test,
}

impl MnistSplit {
    fn file_names(self) -> (&'static str, &'static str) {
        match self {
            MnistSplit::Train => ("train-images-idx3-ubyte", "train-labels-idx1-ubyte"),
            MnistSplit::Test => ("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte"),
        }
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_u32(bytes: &[u8], offset: usize) -> io::Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| invalid(format!("truncated IDX header at byte {offset}")))
}

/// Parse an IDX image file into a `(count, rows*cols)` matrix of raw pixel values.
///
/// # Errors
///
/// Returns `io::Error` if the header is wrong or the payload is truncated.
pub fn parse_images(bytes: &[u8]) -> io::Result<Array2<f32>> {
    let magic = read_u32(bytes, 0)?;
    if magic != IMAGES_MAGIC {
        return Err(invalid(format!("bad image magic {magic:#010x}")));
    }
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    let (pixels, expected) = rows
        .checked_mul(cols)
        .and_then(|pixels| Some((pixels, pixels.checked_mul(count)?)))
        .ok_or_else(|| invalid(format!("image header {count} x {rows} x {cols} overflows")))?;

    let payload = &bytes[16..];
    if payload.len() != expected {
        return Err(invalid(format!(
            "expected {expected} pixel bytes, found {}",
            payload.len()
        )));
    }

    let values: Vec<f32> = payload.iter().map(|&p| f32::from(p)).collect();
    Array2::from_shape_vec((count, pixels), values).map_err(|e| invalid(e.to_string()))
}

/// Parse an IDX label file.
///
/// # Errors
///
/// Returns `io::Error` if the header is wrong or the payload is truncated.
pub fn parse_labels(bytes: &[u8]) -> io::Result<Vec<usize>> {
    let magic = read_u32(bytes, 0)?;
    if magic != LABELS_MAGIC {
        return Err(invalid(format!("bad label magic {magic:#010x}")));
    }
    let count = read_u32(bytes, 4)? as usize;
    let payload = &bytes[8..];
    if payload.len() != count {
        return Err(invalid(format!(
            "expected {count} labels, found {}",
            payload.len()
        )));
    }
    Ok(payload.iter().map(|&l| usize::from(l)).collect())
}

/// Load one MNIST split from `data_dir`, optionally keeping only the first `limit` samples.
///
/// Pixel values are returned raw (0–255); see [`super::normalize`] and [`super::binarize`].
///
/// # Errors
///
/// Returns `io::Error` if either file cannot be read or parsed, or if the
/// image and label counts differ.
pub fn load_mnist(
    data_dir: &Path,
    split: MnistSplit,
    limit: Option<usize>,
) -> io::Result<(Array2<f32>, Vec<usize>)> {
    let (images_name, labels_name) = split.file_names();
    let images = parse_images(&fs::read(data_dir.join(images_name))?)?;
    let mut labels = parse_labels(&fs::read(data_dir.join(labels_name))?)?;

    if images.nrows() != labels.len() {
        return Err(invalid(format!(
            "{} images but {} labels",
            images.nrows(),
            labels.len()
        )));
    }

    match limit {
        Some(n) if n < labels.len() => {
            labels.truncate(n);
            Ok((images.slice(s![..n, ..]).to_owned(), labels))
        }
        _ => Ok((images, labels)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_parse_images() {
        let bytes = idx_images(2, 1, 2, &[0, 255, 10, 20]);
        let images = parse_images(&bytes).unwrap();
        assert_eq!(images.dim(), (2, 2));
        assert_eq!(images[[0, 1]], 255.0);
        assert_eq!(images[[1, 0]], 10.0);
    }

    #[test]
    fn test_parse_images_truncated() {
        let bytes = idx_images(2, 1, 2, &[0, 255, 10]);
        assert!(parse_images(&bytes).is_err());
        assert!(parse_images(&bytes[..6]).is_err());
    }

    #[test]
    fn test_parse_images_oversized_header() {
        let bytes = idx_images(u32::MAX, u32::MAX, u32::MAX, &[0; 4]);
        let err = parse_images(&bytes).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(parse_labels(&idx_labels(&[7, 1, 0])).unwrap(), vec![7, 1, 0]);
        let mut bad = idx_labels(&[1]);
        bad[3] = 0x03;
        assert!(parse_labels(&bad).is_err());
    }

    #[test]
    fn test_load_mnist_with_limit() {
        let dir = std::env::temp_dir().join("dbn_test_mnist");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("t10k-images-idx3-ubyte"),
            idx_images(3, 1, 1, &[1, 2, 3]),
        )
        .unwrap();
        fs::write(dir.join("t10k-labels-idx1-ubyte"), idx_labels(&[4, 5, 6])).unwrap();

        let (images, labels) = load_mnist(&dir, MnistSplit::Test, Some(2)).unwrap();
        assert_eq!(images.dim(), (2, 1));
        assert_eq!(labels, vec![4, 5]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_dir() {
        let result = load_mnist(Path::new("/nonexistent/mnist"), MnistSplit::Train, None);
        assert!(result.is_err());
    }
}
