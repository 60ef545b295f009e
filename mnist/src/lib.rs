pub mod dataset;
pub mod feed;
pub mod mnist;
pub mod preprocess;

pub use crate::dataset::{Batch, Batches, Dataset, DatasetConfig, ShuffleAndRepeat, mnist_eager};
pub use crate::feed::{InitializableIterator, Placeholders, init_mnist, make_mnist_iter};
pub use crate::mnist::*;
pub use crate::preprocess::{PreprocessConfig, preprocess_mnist};
