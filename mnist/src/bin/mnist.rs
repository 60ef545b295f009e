use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use image::{ImageBuffer, Luma};
use mnist::dataset::{DatasetConfig, mnist_eager};
use mnist::{MAX_INTENSITY, PreprocessConfig, convert_idx_to_npy, preprocess_mnist};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn format_duration(duration: Duration) -> String {
    let total_millis = duration.as_millis();
    let seconds = total_millis / 1000;
    let millis = total_millis % 1000;

    if seconds > 0 {
        format!("{seconds}.{millis:03}s")
    } else {
        format!("{millis}ms")
    }
}

fn convert(images: PathBuf, labels: PathBuf, output: PathBuf) -> Result<()> {
    println!(
        "Converting {} and {}...",
        images.display(),
        labels.display()
    );
    let count = convert_idx_to_npy(&images, &labels, &output)
        .context("Failed to convert IDX files")?;
    let (images_out, labels_out) = mnist::artifact_paths(&output);
    println!(
        "Wrote {count} samples to {} and {}",
        images_out.display(),
        labels_out.display()
    );
    Ok(())
}

fn load_config(config: Option<PathBuf>) -> Result<DatasetConfig> {
    match config {
        Some(path) => DatasetConfig::load(&path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(DatasetConfig::default()),
    }
}

fn inspect(base: PathBuf, config: Option<PathBuf>, batch_size: Option<usize>) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(batch_size) = batch_size {
        config.batch_size = batch_size;
    }
    println!("{config}");

    let start_time = Instant::now();
    let dataset = mnist_eager(&base, &config).context("Failed to build dataset")?;
    println!(
        "\nPreprocessed in {}",
        format_duration(start_time.elapsed())
    );

    let data = dataset.data();
    let (min, max) = data
        .images()
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &p| {
            (lo.min(p), hi.max(p))
        });

    println!("Samples:         {}", data.len());
    println!("Image width:     {}", data.width());
    if !data.is_empty() {
        println!("Pixel range:     {min:.4} - {max:.4}");
    }
    println!("Batches / epoch: {}", dataset.batches_per_epoch());

    let mut histogram: BTreeMap<i32, usize> = BTreeMap::new();
    for &label in data.labels() {
        *histogram.entry(label).or_default() += 1;
    }
    println!("\nLabel counts:");
    for (label, count) in &histogram {
        println!("  {label:>3}: {count}");
    }

    if let Some(batch) = dataset.iter().next() {
        println!(
            "\nFirst batch: images {:?}, labels {:?}",
            batch.images.dim(),
            batch.labels.to_vec()
        );
    }
    Ok(())
}

fn preview(base: PathBuf, config: Option<PathBuf>, index: usize, output: PathBuf) -> Result<()> {
    let config = match config {
        Some(path) => PreprocessConfig::load(&path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => PreprocessConfig::default(),
    };
    let data = preprocess_mnist(&base, &config).context("Failed to preprocess data")?;
    if index >= data.len() {
        bail!("Index {index} out of range for {} samples", data.len());
    }

    let width = data.width();
    let side = (width as f64).sqrt() as usize;
    if side * side != width {
        bail!("Images of width {width} are not square");
    }

    let scale = if config.normalize { MAX_INTENSITY } else { 1.0 };
    let row = data.images().row(index);
    let label = data
        .labels()
        .get(index)
        .ok_or_else(|| anyhow!("Missing label for index {index}"))?;

    let img = ImageBuffer::from_fn(side as u32, side as u32, |x, y| {
        let pixel = row
            .get(y as usize * side + x as usize)
            .copied()
            .unwrap_or_default();
        Luma([(pixel * scale).clamp(0.0, MAX_INTENSITY) as u8])
    });
    img.save(&output)
        .with_context(|| format!("Failed to save {}", output.display()))?;

    println!(
        "Image {index} (label {label}) saved to {}",
        output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Convert {
            images,
            labels,
            output,
        } => convert(images, labels, output)?,
        Command::Inspect {
            base,
            config,
            batch_size,
        } => inspect(base, config, batch_size).context("Failed to inspect dataset")?,
        Command::Preview {
            base,
            config,
            index,
            output,
        } => preview(base, config, index, output).context("Failed to preview image")?,
    }

    Ok(())
}

#[derive(clap::Parser)]
#[command(name = "mnist", about = "MNIST dataset preparation", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
#[command(about = "MNIST dataset operations")]
enum Command {
    /// Convert IDX distribution files into {base}_imgs.npy and {base}_lbls.npy
    Convert {
        /// IDX images file, e.g. train-images-idx3-ubyte
        #[arg(long)]
        images: PathBuf,
        /// IDX labels file, e.g. train-labels-idx1-ubyte
        #[arg(long)]
        labels: PathBuf,
        /// Base path of the artifacts to write
        #[arg(long)]
        output: PathBuf,
    },
    /// Preprocess a split and print a summary of the resulting dataset
    Inspect {
        /// Base path of the split
        #[arg(long)]
        base: PathBuf,
        /// JSON dataset configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Save one preprocessed image as a grayscale PNG
    Preview {
        /// Base path of the split
        #[arg(long)]
        base: PathBuf,
        /// JSON preprocessing configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Index of the image to save
        #[arg(long, default_value_t = 0)]
        index: usize,
        /// Output PNG path
        #[arg(long)]
        output: PathBuf,
    },
}
