//! Turns the stored MNIST artifacts into arrays ready for batching.
//!
//! Each image is cast to `f32`, optionally zero-padded from 28x28 to 32x32,
//! scaled into `[0.0, 1.0]` and rounded to `{0.0, 1.0}`. Labels are cast to
//! `i32`. Row order is never changed, so labels stay aligned with their images.

use crate::mnist::{
    IMAGE_PIXELS, IMAGE_SIDE, MAX_INTENSITY, MnistArrays, MnistError, PADDED_PIXELS, PADDED_SIDE,
    PADDING, load_mnist_arrays,
};
use derive_builder::Builder;
use ndarray::{Array1, Array2, Array3, ArrayD, s};
use npy::NpyArray;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Options controlling how images are transformed.
///
/// # Example
///
/// ```
/// use mnist::preprocess::{PreprocessConfig, PreprocessConfigBuilder};
///
/// let config = PreprocessConfigBuilder::default().binarize(true).build().unwrap();
/// assert!(config.normalize);
/// assert!(config.binarize);
/// assert!(config.pad_to_32);
/// assert_eq!(config.image_width(), 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(default)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Scale intensities from 0-255 to 0.0-1.0. Default: true.
    pub normalize: bool,
    /// Round normalized values to the nearest of {0.0, 1.0}, ties to even.
    /// Requires `normalize`. Default: false.
    pub binarize: bool,
    /// Zero-pad each 28x28 image to 32x32 before flattening. Default: true.
    pub pad_to_32: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            normalize: true,
            binarize: false,
            pad_to_32: true,
        }
    }
}

impl PreprocessConfig {
    /// Loads a preprocessing configuration from a JSON file.
    ///
    /// Fields missing from the file keep their default values.
    pub fn load(path: &Path) -> Result<Self, MnistError> {
        let config_str = fs::read_to_string(path)?;
        let config: PreprocessConfig = serde_json::from_str(&config_str)?;
        Ok(config)
    }

    /// Width of a flattened MNIST image after preprocessing.
    pub fn image_width(&self) -> usize {
        if self.pad_to_32 {
            PADDED_PIXELS
        } else {
            IMAGE_PIXELS
        }
    }
}

impl fmt::Display for PreprocessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Preprocessing:")?;
        writeln!(f, "  normalize: {}", self.normalize)?;
        writeln!(f, "  binarize:  {}", self.binarize)?;
        write!(f, "  pad to 32: {}", self.pad_to_32)
    }
}

/// Loads and transforms a dataset split.
///
/// Steps, in order:
/// 1. load `{base}_imgs.npy` and `{base}_lbls.npy`
/// 2. cast labels to `i32` and images, of any stored element type, to `f32`
/// 3. pad images to 32x32 and flatten to 1024 values, or flatten to the stored
///    per-image size when padding is off
/// 4. divide by 255 when normalizing
/// 5. round to `{0.0, 1.0}` when binarizing
///
/// # Errors
/// * `MnistError::Artifact` if either artifact is missing or malformed
/// * `MnistError::ShapeMismatch` if padding is requested and the image element
///   count is not a multiple of 784
/// * `MnistError::BinarizeWithoutNormalize` if `binarize` is set without
///   `normalize`. This is checked at step 5, after loading.
/// * `MnistError::DataMismatch` if the image and label counts differ
pub fn preprocess_mnist(
    base_path: impl AsRef<Path>,
    config: &PreprocessConfig,
) -> Result<MnistArrays, MnistError> {
    let (images, labels) = load_mnist_arrays(base_path)?;
    let labels = labels_to_i32(labels);

    let images = images_to_f32(images);
    let mut images = if config.pad_to_32 {
        pad_images(&flatten_images(images, Some(IMAGE_PIXELS))?)?
    } else {
        flatten_images(images, None)?
    };

    if config.normalize {
        normalize_images(&mut images);
    }
    if config.binarize {
        if !config.normalize {
            return Err(MnistError::BinarizeWithoutNormalize);
        }
        binarize_images(&mut images);
    }

    MnistArrays::new(images, labels)
}

/// Casts a stored label array to a flat `i32` vector.
///
/// Values are converted with a plain numeric cast, as an `astype(int32)` would:
/// wide integers wrap and floats truncate towards zero.
fn labels_to_i32(labels: NpyArray) -> Array1<i32> {
    let labels: Vec<i32> = match labels {
        NpyArray::U8(labels) => labels.iter().map(|&l| i32::from(l)).collect(),
        NpyArray::U32(labels) => labels.iter().map(|&l| l as i32).collect(),
        NpyArray::I32(labels) => labels.iter().copied().collect(),
        NpyArray::I64(labels) => labels.iter().map(|&l| l as i32).collect(),
        NpyArray::F32(labels) => labels.iter().map(|&l| l as i32).collect(),
        NpyArray::F64(labels) => labels.iter().map(|&l| l as i32).collect(),
    };
    Array1::from(labels)
}

/// Casts stored pixel values of any element type to `f32`.
fn images_to_f32(images: NpyArray) -> ArrayD<f32> {
    match images {
        NpyArray::U8(images) => images.mapv(f32::from),
        NpyArray::U32(images) => images.mapv(|p| p as f32),
        NpyArray::I32(images) => images.mapv(|p| p as f32),
        NpyArray::I64(images) => images.mapv(|p| p as f32),
        NpyArray::F32(images) => images,
        NpyArray::F64(images) => images.mapv(|p| p as f32),
    }
}

/// Reshapes stored images to one flattened image per row.
///
/// With `per_image` set, the element count must split evenly into images of
/// that size. Otherwise the leading axis is the image count.
fn flatten_images(
    images: ArrayD<f32>,
    per_image: Option<usize>,
) -> Result<Array2<f32>, MnistError> {
    let elements = images.len();
    let (count, per_image) = match per_image {
        Some(per_image) => {
            if per_image == 0 || elements % per_image != 0 {
                return Err(MnistError::ShapeMismatch {
                    elements,
                    per_image,
                });
            }
            (elements / per_image, per_image)
        }
        None => match images.shape().split_first() {
            Some((&count, rest)) => (count, rest.iter().product()),
            None => {
                return Err(MnistError::ShapeMismatch {
                    elements,
                    per_image: IMAGE_PIXELS,
                });
            }
        },
    };
    Ok(images.to_shape((count, per_image))?.into_owned())
}

/// Zero-pads flattened 28x28 images to 32x32 and flattens them again.
///
/// The 2-pixel border on every side is 0 and the interior holds the original
/// image.
///
/// # Errors
/// * `MnistError::ShapeMismatch` if rows are not 784 values wide
pub fn pad_images(images: &Array2<f32>) -> Result<Array2<f32>, MnistError> {
    if images.ncols() != IMAGE_PIXELS {
        return Err(MnistError::ShapeMismatch {
            elements: images.len(),
            per_image: IMAGE_PIXELS,
        });
    }
    let count = images.nrows();
    let source = images.to_shape((count, IMAGE_SIDE, IMAGE_SIDE))?;

    let mut padded = Array3::<f32>::zeros((count, PADDED_SIDE, PADDED_SIDE));
    padded
        .slice_mut(s![
            ..,
            PADDING..PADDING + IMAGE_SIDE,
            PADDING..PADDING + IMAGE_SIDE
        ])
        .assign(&source);

    Ok(padded.into_shape_with_order((count, PADDED_PIXELS))?)
}

/// Scales intensities from 0-255 into `[0.0, 1.0]`.
pub fn normalize_images(images: &mut Array2<f32>) {
    images.mapv_inplace(|pixel| pixel / MAX_INTENSITY);
}

/// Rounds every value to the nearest integer, ties to even.
///
/// On normalized images this maps each pixel to 0.0 or 1.0.
pub fn binarize_images(images: &mut Array2<f32>) {
    images.mapv_inplace(round_half_to_even);
}

/// Rounds to the nearest integer, resolving ties towards the even neighbour.
///
/// `0.5` rounds to `0.0`, `1.5` to `2.0` and `2.5` to `2.0`.
pub fn round_half_to_even(value: f32) -> f32 {
    value.round_ties_even()
}
