//! Batched, optionally shuffled and repeated iteration over preprocessed data.
//!
//! A [`Dataset`] pairs images with labels and describes how they are consumed:
//! in stored order for a single pass, or shuffled through a buffer and repeated
//! for training. Batches are consecutive groups of `batch_size` elements. The
//! last batch of a finite pass may be smaller. When repeating, batches run
//! across epoch boundaries.

use crate::mnist::{MnistArrays, MnistError};
use crate::preprocess::{PreprocessConfig, preprocess_mnist};
use derive_builder::Builder;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Shuffle buffer large enough to hold the whole MNIST training split.
pub const DEFAULT_SHUFFLE_BUFFER: usize = 60_000;
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Configuration for building a training or evaluation dataset.
///
/// # Example
///
/// ```
/// use mnist::dataset::{DatasetConfig, DatasetConfigBuilder};
///
/// let config = DatasetConfigBuilder::default()
///     .batch_size(64)
///     .train(false)
///     .build()
///     .unwrap();
/// assert_eq!(config.batch_size, 64);
/// assert_eq!(config.shuffle_buffer, 60_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(default)]
#[serde(default)]
pub struct DatasetConfig {
    /// Number of samples per batch
    pub batch_size: usize,
    /// Shuffle and repeat forever when true, single ordered pass otherwise
    pub train: bool,
    /// Number of elements the shuffle buffer holds
    pub shuffle_buffer: usize,
    /// Seed for reproducible shuffling
    #[builder(setter(strip_option))]
    pub seed: Option<u64>,
    /// How images are transformed before batching
    pub preprocess: PreprocessConfig,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            train: true,
            shuffle_buffer: DEFAULT_SHUFFLE_BUFFER,
            seed: None,
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl DatasetConfig {
    /// Loads a dataset configuration from a JSON file.
    ///
    /// ```no_run
    /// use mnist::dataset::DatasetConfig;
    /// use std::path::Path;
    ///
    /// let config = DatasetConfig::load(Path::new("dataset.json")).unwrap();
    /// ```
    pub fn load(path: &Path) -> Result<Self, MnistError> {
        let config_str = fs::read_to_string(path)?;
        let config: DatasetConfig = serde_json::from_str(&config_str)?;
        Ok(config)
    }
}

impl fmt::Display for DatasetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dataset:")?;
        writeln!(f, "  batch size:     {}", self.batch_size)?;
        writeln!(f, "  train:          {}", self.train)?;
        writeln!(f, "  shuffle buffer: {}", self.shuffle_buffer)?;
        match self.seed {
            Some(seed) => writeln!(f, "  seed:           {seed}")?,
            None => writeln!(f, "  seed:           random")?,
        }
        write!(f, "{}", self.preprocess)
    }
}

/// Buffered shuffling followed by repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleAndRepeat {
    pub buffer_size: usize,
    /// Number of epochs, or `None` to repeat forever
    pub count: Option<usize>,
}

/// A group of consecutive elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Array2<f32>,
    pub labels: Array1<i32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Index-aligned images and labels plus the recipe for iterating them.
#[derive(Debug, Clone)]
pub struct Dataset {
    data: MnistArrays,
    shuffle: Option<ShuffleAndRepeat>,
    seed: Option<u64>,
    batch_size: usize,
}

impl Dataset {
    /// Wraps preprocessed arrays, one element per image. Batch size starts at 1.
    pub fn from_tensor_slices(data: MnistArrays) -> Self {
        Self {
            data,
            shuffle: None,
            seed: None,
            batch_size: 1,
        }
    }

    /// Shuffles each epoch through a buffer of `buffer_size` elements and
    /// repeats `count` epochs, or forever when `count` is `None`.
    ///
    /// A buffer at least as large as the dataset gives a uniform permutation
    /// per epoch. A buffer of 0 or 1 keeps stored order.
    pub fn shuffle_and_repeat(mut self, buffer_size: usize, count: Option<usize>) -> Self {
        self.shuffle = Some(ShuffleAndRepeat { buffer_size, count });
        self
    }

    /// Fixes the shuffle seed so every iteration produces the same order.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Groups elements into batches of `batch_size`, keeping a final partial batch.
    ///
    /// # Errors
    /// * `MnistError::InvalidBatchSize` if `batch_size` is 0
    pub fn batch(mut self, batch_size: usize) -> Result<Self, MnistError> {
        if batch_size == 0 {
            return Err(MnistError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    pub fn data(&self) -> &MnistArrays {
        &self.data
    }

    /// Number of elements in one epoch.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn shuffle(&self) -> Option<ShuffleAndRepeat> {
        self.shuffle
    }

    /// Number of batches needed to cover one epoch, counting a partial batch.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn iter(&self) -> Batches<'_> {
        Batches {
            dataset: self,
            cursor: BatchCursor::new(self),
        }
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = Batch;
    type IntoIter = Batches<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the batches of a [`Dataset`].
///
/// Never ends when the dataset repeats forever.
pub struct Batches<'a> {
    dataset: &'a Dataset,
    cursor: BatchCursor,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_batch(self.dataset.data())
    }
}

/// Iteration state kept apart from the data so owners of a dataset can hold it.
#[derive(Debug, Clone)]
pub(crate) struct BatchCursor {
    order: ElementOrder,
    batch_size: usize,
}

impl BatchCursor {
    pub(crate) fn new(dataset: &Dataset) -> Self {
        let order = match dataset.shuffle {
            Some(shuffle) => {
                let rng = match dataset.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_rng(&mut rand::rng()),
                };
                ElementOrder::Shuffled(ShuffledIndices::new(dataset.len(), shuffle, rng))
            }
            None => ElementOrder::Sequential {
                next: 0,
                len: dataset.len(),
            },
        };
        Self {
            order,
            batch_size: dataset.batch_size,
        }
    }

    pub(crate) fn next_batch(&mut self, data: &MnistArrays) -> Option<Batch> {
        let indices: Vec<usize> = std::iter::from_fn(|| self.order.next_index())
            .take(self.batch_size)
            .collect();
        if indices.is_empty() {
            return None;
        }
        Some(Batch {
            images: data.images().select(Axis(0), &indices),
            labels: data.labels().select(Axis(0), &indices),
        })
    }
}

#[derive(Debug, Clone)]
enum ElementOrder {
    Sequential { next: usize, len: usize },
    Shuffled(ShuffledIndices),
}

impl ElementOrder {
    fn next_index(&mut self) -> Option<usize> {
        match self {
            ElementOrder::Sequential { next, len } => {
                if *next >= *len {
                    return None;
                }
                let index = *next;
                *next += 1;
                Some(index)
            }
            ElementOrder::Shuffled(indices) => indices.next_index(),
        }
    }
}

/// Index stream of a buffered shuffle, restarted every epoch.
///
/// The buffer is filled from the epoch's elements in stored order. Each step
/// emits a uniformly chosen buffered element and refills from the epoch.
#[derive(Debug, Clone)]
struct ShuffledIndices {
    len: usize,
    buffer_size: usize,
    count: Option<usize>,
    epochs_started: usize,
    cursor: usize,
    buffer: Vec<usize>,
    rng: StdRng,
}

impl ShuffledIndices {
    fn new(len: usize, shuffle: ShuffleAndRepeat, rng: StdRng) -> Self {
        Self {
            len,
            buffer_size: shuffle.buffer_size.max(1),
            count: shuffle.count,
            epochs_started: 0,
            cursor: len,
            buffer: Vec::with_capacity(shuffle.buffer_size.min(len)),
            rng,
        }
    }

    fn next_index(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        loop {
            while self.buffer.len() < self.buffer_size && self.cursor < self.len {
                self.buffer.push(self.cursor);
                self.cursor += 1;
            }
            if !self.buffer.is_empty() {
                let pick = self.rng.random_range(0..self.buffer.len());
                return Some(self.buffer.swap_remove(pick));
            }
            if self.count.is_some_and(|count| self.epochs_started >= count) {
                return None;
            }
            self.epochs_started += 1;
            self.cursor = 0;
        }
    }
}

/// Preprocesses a split and returns it as a ready-to-iterate dataset.
///
/// Training datasets are shuffled through `config.shuffle_buffer` elements and
/// repeat forever. Evaluation datasets are a single pass in stored order.
///
/// # Example
///
/// ```no_run
/// use mnist::dataset::{DatasetConfig, mnist_eager};
///
/// let dataset = mnist_eager("data/train", &DatasetConfig::default()).unwrap();
/// for batch in dataset.iter().take(10) {
///     println!("{} images", batch.len());
/// }
/// ```
pub fn mnist_eager(
    base_path: impl AsRef<Path>,
    config: &DatasetConfig,
) -> Result<Dataset, MnistError> {
    let data = preprocess_mnist(base_path, &config.preprocess)?;
    let mut dataset = Dataset::from_tensor_slices(data);
    if config.train {
        dataset = dataset.shuffle_and_repeat(config.shuffle_buffer, None);
        if let Some(seed) = config.seed {
            dataset = dataset.with_seed(seed);
        }
    }
    dataset.batch(config.batch_size)
}
