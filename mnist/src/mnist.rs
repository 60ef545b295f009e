//! MNIST array artifacts and the loaders around them.
//!
//! A dataset split lives on disk as two `.npy` artifacts next to each other:
//! `{base}_imgs.npy` holding N images of 28x28 intensities and
//! `{base}_lbls.npy` holding N integer labels. This module resolves those paths,
//! loads the raw arrays, and can produce them from the IDX files the MNIST
//! dataset is distributed as.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::{Array1, Array2};
use npy::{NpyArray, NpyError};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const IMAGE_MAGIC_NUMBER: u32 = 2051;
pub const LABEL_MAGIC_NUMBER: u32 = 2049;
pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const PADDING: usize = 2;
pub const PADDED_SIDE: usize = IMAGE_SIDE + 2 * PADDING;
pub const PADDED_PIXELS: usize = PADDED_SIDE * PADDED_SIDE;
pub const MAX_INTENSITY: f32 = 255.0;
pub const IMAGES_SUFFIX: &str = "_imgs";
pub const LABELS_SUFFIX: &str = "_lbls";

/// Errors that can occur while handling MNIST data
#[derive(Debug, Error)]
pub enum MnistError {
    /// Wrapper for standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A `.npy` artifact is missing or malformed
    #[error("Failed to access array artifact {}: {source}", .path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: NpyError,
    },
    /// Binarization was requested without normalization
    #[error("Binarization not implemented for unnormalized data")]
    BinarizeWithoutNormalize,
    /// The stored element count cannot be split into whole images
    #[error("Shape mismatch: cannot split {elements} elements into images of {per_image} pixels")]
    ShapeMismatch { elements: usize, per_image: usize },
    /// Data fed to an iterator does not match its placeholder
    #[error("Placeholder expects images of width {expected}, got {actual}")]
    PlaceholderMismatch { expected: usize, actual: usize },
    /// Error for mismatches between images and labels
    #[error("Data mismatch: {0}")]
    DataMismatch(String),
    /// Error for invalid magic numbers in IDX files
    #[error("Invalid magic number for {kind} file: expected {expected}, got {actual}")]
    InvalidMagicNumber {
        kind: &'static str,
        expected: u32,
        actual: u32,
    },
    /// Error for invalid image dimensions in IDX files
    #[error(
        "Invalid image dimensions: expected {expected} pixels, got {actual} pixels ({rows}x{cols})"
    )]
    InvalidDimensions {
        expected: usize,
        actual: usize,
        rows: usize,
        cols: usize,
    },
    /// Batches must hold at least one element
    #[error("Invalid batch size {0}: batch size must be greater than zero")]
    InvalidBatchSize(usize),
    /// `get_next` was called before the iterator was initialized
    #[error("Iterator has not been initialized")]
    NotInitialized,
    /// Internal reshape failure
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    /// A configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
    /// A progress bar template failed to parse
    #[error("Progress template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),
}

/// Index-aligned pair of preprocessed images and their labels.
///
/// Images are stored one per row. Row `i` of `images` and element `i` of
/// `labels` always describe the same sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MnistArrays {
    images: Array2<f32>,
    labels: Array1<i32>,
}

impl MnistArrays {
    /// Creates a new MnistArrays instance from an image matrix and a label vector.
    ///
    /// # Arguments
    /// * `images` - One flattened image per row
    /// * `labels` - One class label per image
    ///
    /// # Returns
    /// * `Ok(MnistArrays)` if the number of images matches the number of labels
    /// * `Err(MnistError::DataMismatch)` if there's a mismatch between images and labels
    ///
    /// # Example
    /// ```
    /// use mnist::mnist::MnistArrays;
    /// use ndarray::{Array1, Array2};
    ///
    /// let images = Array2::<f32>::zeros((2, 1024));
    /// let labels = Array1::from(vec![3, 7]);
    /// let data = MnistArrays::new(images, labels).unwrap();
    /// assert_eq!(data.len(), 2);
    /// ```
    pub fn new(images: Array2<f32>, labels: Array1<i32>) -> Result<Self, MnistError> {
        if images.nrows() != labels.len() {
            return Err(MnistError::DataMismatch(format!(
                "Number of images ({}) does not match number of labels ({})",
                images.nrows(),
                labels.len()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of values per flattened image.
    pub fn width(&self) -> usize {
        self.images.ncols()
    }

    pub fn images(&self) -> &Array2<f32> {
        &self.images
    }

    pub fn labels(&self) -> &Array1<i32> {
        &self.labels
    }
}

/// Creates a progress bar style with a consistent look
pub(crate) fn create_progress_style(template: &str) -> Result<ProgressStyle, MnistError> {
    Ok(ProgressStyle::with_template(template)?.progress_chars("##-"))
}

fn append_suffix(base_path: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(base_path.as_os_str());
    path.push(suffix);
    path.push(npy::NPY_SUFFIX);
    PathBuf::from(path)
}

/// Returns the `(images, labels)` artifact paths for a dataset split.
///
/// The suffixes are appended to the final path component, so `data/train`
/// resolves to `data/train_imgs.npy` and `data/train_lbls.npy`.
pub fn artifact_paths(base_path: impl AsRef<Path>) -> (PathBuf, PathBuf) {
    let base_path = base_path.as_ref();
    (
        append_suffix(base_path, IMAGES_SUFFIX),
        append_suffix(base_path, LABELS_SUFFIX),
    )
}

fn read_artifact(path: &Path) -> Result<NpyArray, MnistError> {
    npy::read_npy(path).map_err(|source| MnistError::Artifact {
        path: path.to_path_buf(),
        source,
    })
}

fn write_artifact(path: &Path, array: &NpyArray) -> Result<(), MnistError> {
    npy::write_npy(path, array).map_err(|source| MnistError::Artifact {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the raw images and labels artifacts of a dataset split.
///
/// # Arguments
/// * `base_path` - Base path of the split, without the artifact suffixes
///
/// # Returns
/// * `Ok((images, labels))` with the arrays exactly as stored
/// * `Err(MnistError::Artifact)` if either artifact is missing or malformed
pub fn load_mnist_arrays(
    base_path: impl AsRef<Path>,
) -> Result<(NpyArray, NpyArray), MnistError> {
    let (images_path, labels_path) = artifact_paths(base_path);

    let progress = ProgressBar::new_spinner();
    progress.set_style(create_progress_style(
        "{spinner:.green} [{elapsed_precise}] {msg}",
    )?);

    progress.enable_steady_tick(Duration::from_millis(100));

    let abandon = |err: &MnistError| progress.abandon_with_message(err.to_string());
    progress.set_message(format!("Loading {}...", images_path.display()));
    let images = read_artifact(&images_path).inspect_err(abandon)?;
    progress.set_message(format!("Loading {}...", labels_path.display()));
    let labels = read_artifact(&labels_path).inspect_err(abandon)?;

    progress.finish_with_message(format!(
        "Loaded {} images and {} labels",
        images.shape().first().copied().unwrap_or_default(),
        labels.len()
    ));
    Ok((images, labels))
}

/// Reads a 32-bit unsigned integer in big-endian format
fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buffer = [0; 4];
    reader.read_exact(&mut buffer)?;
    Ok(u32::from_be_bytes(buffer))
}

/// Reads MNIST image data from an IDX file.
///
/// # Arguments
/// * `path` - Path to the IDX image file
/// * `progress` - Progress bar for tracking loading progress
///
/// # Returns
/// * `Ok(Array2<u8>)` with one flattened 28x28 image per row, intensities unchanged
/// * `Err(MnistError)` if file reading fails or format is invalid
///
/// # Format
/// The IDX file format consists of:
/// * 32-bit magic number (2051)
/// * 32-bit number of images
/// * 32-bit number of rows
/// * 32-bit number of columns
/// * Pixels in row-major order (1 byte per pixel)
pub fn read_idx_images(
    path: impl AsRef<Path>,
    progress: &ProgressBar,
) -> Result<Array2<u8>, MnistError> {
    let mut reader = BufReader::new(File::open(path)?);

    let magic_number = read_u32(&mut reader)?;
    if magic_number != IMAGE_MAGIC_NUMBER {
        return Err(MnistError::InvalidMagicNumber {
            kind: "images",
            expected: IMAGE_MAGIC_NUMBER,
            actual: magic_number,
        });
    }

    let num_images = read_u32(&mut reader)? as usize;
    let num_rows = read_u32(&mut reader)? as usize;
    let num_cols = read_u32(&mut reader)? as usize;
    let pixels_per_image = num_rows * num_cols;

    if pixels_per_image != IMAGE_PIXELS {
        return Err(MnistError::InvalidDimensions {
            expected: IMAGE_PIXELS,
            actual: pixels_per_image,
            rows: num_rows,
            cols: num_cols,
        });
    }

    progress.set_length(num_images as u64);
    progress.set_message("Loading images...");

    let mut pixels = vec![0u8; num_images * pixels_per_image];
    for image in pixels.chunks_mut(pixels_per_image) {
        reader.read_exact(image)?;
        progress.inc(1);
    }

    progress.finish_with_message("Images loaded successfully");
    Ok(Array2::from_shape_vec((num_images, pixels_per_image), pixels)?)
}

/// Reads MNIST label data from an IDX file.
///
/// # Format
/// The IDX file format consists of:
/// * 32-bit magic number (2049)
/// * 32-bit number of labels
/// * Labels (1 byte per label)
pub fn read_idx_labels(
    path: impl AsRef<Path>,
    progress: &ProgressBar,
) -> Result<Array1<u8>, MnistError> {
    let mut reader = BufReader::new(File::open(path)?);

    let magic_number = read_u32(&mut reader)?;
    if magic_number != LABEL_MAGIC_NUMBER {
        return Err(MnistError::InvalidMagicNumber {
            kind: "labels",
            expected: LABEL_MAGIC_NUMBER,
            actual: magic_number,
        });
    }

    let num_labels = read_u32(&mut reader)? as usize;
    progress.set_length(num_labels as u64);
    progress.set_message("Loading labels...");

    let mut labels = vec![0u8; num_labels];
    reader.read_exact(&mut labels)?;
    progress.inc(num_labels as u64);

    progress.finish_with_message("Labels loaded successfully");
    Ok(Array1::from(labels))
}

/// Converts a pair of IDX files into the `{base}_imgs.npy` / `{base}_lbls.npy`
/// artifacts read by the preprocessor.
///
/// Images are written as `uint8` with shape `(N, 784)` and labels as `uint8`
/// with shape `(N,)`.
///
/// # Returns
/// * `Ok(n)` with the number of samples written
/// * `Err(MnistError::DataMismatch)` if the image and label counts differ
pub fn convert_idx_to_npy(
    images_path: impl AsRef<Path>,
    labels_path: impl AsRef<Path>,
    base_path: impl AsRef<Path>,
) -> Result<usize, MnistError> {
    let multi_progress = MultiProgress::new();
    let style = create_progress_style(
        "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}",
    )?;

    let images_progress = multi_progress.add(ProgressBar::new(0));
    let labels_progress = multi_progress.add(ProgressBar::new(0));
    images_progress.set_style(style.clone());
    labels_progress.set_style(style);

    let images = read_idx_images(images_path, &images_progress)?;
    let labels = read_idx_labels(labels_path, &labels_progress)?;

    if images.nrows() != labels.len() {
        return Err(MnistError::DataMismatch(format!(
            "Number of images ({}) does not match number of labels ({})",
            images.nrows(),
            labels.len()
        )));
    }

    let count = labels.len();
    let (images_out, labels_out) = artifact_paths(base_path);
    write_artifact(&images_out, &NpyArray::from(images.into_dyn()))?;
    write_artifact(&labels_out, &NpyArray::from(labels.into_dyn()))?;
    Ok(count)
}
