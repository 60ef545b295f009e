use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mnist::preprocess::{PreprocessConfig, binarize_images, normalize_images, pad_images};
use mnist::{IMAGE_PIXELS, artifact_paths, preprocess_mnist};
use ndarray::{Array1, Array2};
use npy::NpyArray;

const SAMPLES: usize = 1_000;

fn synthetic_images() -> Array2<u8> {
    Array2::from_shape_fn((SAMPLES, IMAGE_PIXELS), |(row, col)| {
        ((row * 31 + col * 7) % 256) as u8
    })
}

fn transform_steps(c: &mut Criterion) {
    let floats = synthetic_images().mapv(f32::from);

    c.bench_function("pad_1000_images", |b| {
        b.iter(|| pad_images(black_box(&floats)))
    });

    c.bench_function("normalize_and_binarize_1000_images", |b| {
        b.iter(|| {
            let mut pixels = floats.clone();
            normalize_images(&mut pixels);
            binarize_images(&mut pixels);
            pixels
        })
    });
}

fn preprocess_from_disk(c: &mut Criterion) {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let base = dir.path().join("train");
    let (images_path, labels_path) = artifact_paths(&base);
    let labels = Array1::from_iter((0..SAMPLES).map(|i| (i % 10) as u8));
    let written = npy::write_npy(&images_path, &NpyArray::from(synthetic_images().into_dyn()))
        .and_then(|()| npy::write_npy(&labels_path, &NpyArray::from(labels.into_dyn())));
    if written.is_err() {
        return;
    }

    let config = PreprocessConfig::default();
    c.bench_function("preprocess_mnist_1000_images", |b| {
        b.iter(|| preprocess_mnist(black_box(&base), black_box(&config)))
    });
}

criterion_group!(benches, transform_steps, preprocess_from_disk);
criterion_main!(benches);
