//! Iterator handle that is created first and fed with data later.
//!
//! [`make_mnist_iter`] builds an uninitialized [`InitializableIterator`] that
//! only knows the shape of what it will receive. [`init_mnist`] preprocesses a
//! split and feeds it in, after which batches can be drawn with
//! [`InitializableIterator::get_next`]. Initializing again restarts iteration
//! on the new data, so one handle can alternate between splits.

use crate::dataset::{Batch, BatchCursor, DEFAULT_SHUFFLE_BUFFER, Dataset};
use crate::mnist::{IMAGE_PIXELS, MnistArrays, MnistError, PADDED_PIXELS};
use crate::preprocess::{PreprocessConfig, preprocess_mnist};
use std::path::Path;

/// Shapes of the inputs an iterator accepts.
///
/// Images are `f32` rows of `image_width` values, labels are `i32`; the number
/// of samples is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholders {
    pub image_width: usize,
}

impl Placeholders {
    pub fn new(pad_to_32: bool) -> Self {
        let image_width = if pad_to_32 { PADDED_PIXELS } else { IMAGE_PIXELS };
        Self { image_width }
    }

    fn check(&self, data: &MnistArrays) -> Result<(), MnistError> {
        if data.width() != self.image_width {
            return Err(MnistError::PlaceholderMismatch {
                expected: self.image_width,
                actual: data.width(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Fed {
    dataset: Dataset,
    cursor: BatchCursor,
}

/// Batched iterator over data supplied after construction.
#[derive(Debug)]
pub struct InitializableIterator {
    placeholders: Placeholders,
    batch_size: usize,
    train: bool,
    shuffle_buffer: usize,
    seed: Option<u64>,
    fed: Option<Fed>,
}

impl InitializableIterator {
    pub fn placeholders(&self) -> Placeholders {
        self.placeholders
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_initialized(&self) -> bool {
        self.fed.is_some()
    }

    /// Fixes the shuffle seed used by every subsequent initialization.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_shuffle_buffer(mut self, shuffle_buffer: usize) -> Self {
        self.shuffle_buffer = shuffle_buffer;
        self
    }

    /// Feeds images and labels into the iterator and rewinds it.
    ///
    /// # Errors
    /// * `MnistError::PlaceholderMismatch` if the image width differs from the
    ///   placeholder. The iterator keeps its previous state in that case.
    pub fn initialize(&mut self, data: MnistArrays) -> Result<(), MnistError> {
        self.placeholders.check(&data)?;

        let mut dataset = Dataset::from_tensor_slices(data);
        if self.train {
            dataset = dataset.shuffle_and_repeat(self.shuffle_buffer, None);
            if let Some(seed) = self.seed {
                dataset = dataset.with_seed(seed);
            }
        }
        let dataset = dataset.batch(self.batch_size)?;
        let cursor = BatchCursor::new(&dataset);
        self.fed = Some(Fed { dataset, cursor });
        Ok(())
    }

    /// Returns the next batch, or `None` once a non-repeating pass is done.
    ///
    /// # Errors
    /// * `MnistError::NotInitialized` if no data has been fed yet
    pub fn get_next(&mut self) -> Result<Option<Batch>, MnistError> {
        let fed = self.fed.as_mut().ok_or(MnistError::NotInitialized)?;
        Ok(fed.cursor.next_batch(fed.dataset.data()))
    }
}

/// Creates an uninitialized iterator for MNIST data.
///
/// Training iterators shuffle through a 60000 element buffer and repeat
/// forever; otherwise a single ordered pass is made.
///
/// # Errors
/// * `MnistError::InvalidBatchSize` if `batch_size` is 0
pub fn make_mnist_iter(
    batch_size: usize,
    train: bool,
    pad_to_32: bool,
) -> Result<InitializableIterator, MnistError> {
    if batch_size == 0 {
        return Err(MnistError::InvalidBatchSize(batch_size));
    }
    Ok(InitializableIterator {
        placeholders: Placeholders::new(pad_to_32),
        batch_size,
        train,
        shuffle_buffer: DEFAULT_SHUFFLE_BUFFER,
        seed: None,
        fed: None,
    })
}

/// Preprocesses a split and initializes `iterator` with it.
///
/// # Example
///
/// ```no_run
/// use mnist::feed::{init_mnist, make_mnist_iter};
/// use mnist::preprocess::PreprocessConfig;
///
/// let mut iterator = make_mnist_iter(64, true, true).unwrap();
/// init_mnist("data/train", &mut iterator, &PreprocessConfig::default()).unwrap();
/// let batch = iterator.get_next().unwrap();
/// ```
pub fn init_mnist(
    base_path: impl AsRef<Path>,
    iterator: &mut InitializableIterator,
    config: &PreprocessConfig,
) -> Result<(), MnistError> {
    let data = preprocess_mnist(base_path, config)?;
    iterator.initialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mnist::artifact_paths;
    use assert_fs::prelude::*;
    use ndarray::{Array1, Array2};
    use npy::NpyArray;

    fn arrays(len: usize, width: usize) -> MnistArrays {
        let images = Array2::from_shape_fn((len, width), |(row, _)| row as f32);
        let labels = Array1::from_iter((0..len).map(|i| i as i32));
        MnistArrays::new(images, labels).unwrap()
    }

    #[test]
    fn test_make_mnist_iter_placeholders() {
        let iterator = make_mnist_iter(16, true, true).unwrap();
        assert_eq!(iterator.placeholders().image_width, 1024);
        assert_eq!(iterator.batch_size(), 16);
        assert!(!iterator.is_initialized());

        let iterator = make_mnist_iter(16, false, false).unwrap();
        assert_eq!(iterator.placeholders().image_width, 784);

        assert!(matches!(
            make_mnist_iter(0, true, true),
            Err(MnistError::InvalidBatchSize(0))
        ));
    }

    #[test]
    fn test_get_next_before_initialize() {
        let mut iterator = make_mnist_iter(4, false, true).unwrap();
        assert!(matches!(
            iterator.get_next(),
            Err(MnistError::NotInitialized)
        ));
    }

    #[test]
    fn test_initialize_rejects_wrong_width() {
        let mut iterator = make_mnist_iter(4, false, true).unwrap();
        match iterator.initialize(arrays(3, 784)) {
            Err(MnistError::PlaceholderMismatch { expected, actual }) => {
                assert_eq!(expected, 1024);
                assert_eq!(actual, 784);
            }
            other => panic!("Expected PlaceholderMismatch, got {other:?}"),
        }
        assert!(!iterator.is_initialized());
    }

    #[test]
    fn test_evaluation_pass_ends() -> Result<(), MnistError> {
        let mut iterator = make_mnist_iter(2, false, false)?;
        iterator.initialize(arrays(3, 784))?;

        let first = iterator.get_next()?.unwrap();
        assert_eq!(first.labels.to_vec(), vec![0, 1]);
        let second = iterator.get_next()?.unwrap();
        assert_eq!(second.labels.to_vec(), vec![2]);
        assert!(iterator.get_next()?.is_none());
        Ok(())
    }

    #[test]
    fn test_reinitialize_restarts() -> Result<(), MnistError> {
        let mut iterator = make_mnist_iter(2, false, false)?;
        iterator.initialize(arrays(2, 784))?;
        iterator.get_next()?;
        assert!(iterator.get_next()?.is_none());

        iterator.initialize(arrays(4, 784))?;
        let batch = iterator.get_next()?.unwrap();
        assert_eq!(batch.labels.to_vec(), vec![0, 1]);
        Ok(())
    }

    #[test]
    fn test_training_iterator_repeats_with_seed() -> Result<(), MnistError> {
        let mut iterator = make_mnist_iter(3, true, false)?.with_seed(11);
        iterator.initialize(arrays(4, 784))?;
        let mut first_run = Vec::new();
        for _ in 0..6 {
            let batch = iterator.get_next()?.unwrap();
            assert_eq!(batch.len(), 3);
            first_run.push(batch);
        }

        iterator.initialize(arrays(4, 784))?;
        for expected in &first_run {
            assert_eq!(&iterator.get_next()?.unwrap(), expected);
        }
        Ok(())
    }

    #[test]
    fn test_init_mnist() -> Result<(), Box<dyn std::error::Error>> {
        let temp = assert_fs::TempDir::new()?;
        let base = temp.child("train");
        let (images_path, labels_path) = artifact_paths(base.path());
        let images = Array2::<u8>::from_elem((3, IMAGE_PIXELS), 255);
        let labels = Array1::from(vec![2i32, 4, 6]);
        npy::write_npy(images_path, &NpyArray::from(images.into_dyn()))?;
        npy::write_npy(labels_path, &NpyArray::from(labels.into_dyn()))?;

        let mut iterator = make_mnist_iter(8, false, true)?;
        init_mnist(base.path(), &mut iterator, &PreprocessConfig::default())?;
        let batch = iterator.get_next()?.ok_or("expected a batch")?;
        assert_eq!(batch.images.dim(), (3, PADDED_PIXELS));
        assert_eq!(batch.labels.to_vec(), vec![2, 4, 6]);
        assert_eq!(batch.images.iter().fold(0.0f32, |a, &b| a.max(b)), 1.0);

        // Unpadded data cannot be fed to a padded placeholder.
        let config = PreprocessConfig {
            pad_to_32: false,
            ..PreprocessConfig::default()
        };
        let result = init_mnist(base.path(), &mut iterator, &config);
        assert!(matches!(
            result,
            Err(MnistError::PlaceholderMismatch { .. })
        ));
        Ok(())
    }
}
