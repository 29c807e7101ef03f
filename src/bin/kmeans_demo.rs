//! Small end-to-end demo: clusters three synthetic blobs across two
//! simulated devices and prints the recovered centroids.
//!
//! Run with `RUST_LOG=debug` to see the orchestration trace.

use multikmeans_rs::{ClusterConfig, HostBackend, InitMethod, MultiKMeans};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn blobs(centers: &[[f32; 2]], per_center: usize, seed: u64) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = Array2::zeros((centers.len() * per_center, 2));
    for (b, center) in centers.iter().enumerate() {
        for i in 0..per_center {
            let row = b * per_center + i;
            data[[row, 0]] = center[0] + rng.gen_range(-0.5..0.5);
            data[[row, 1]] = center[1] + rng.gen_range(-0.5..0.5);
        }
    }
    data
}

fn main() {
    env_logger::init();

    let centers = [[0.0f32, 0.0], [10.0, 10.0], [-8.0, 6.0]];
    let data = blobs(&centers, 400, 42);

    let backend = HostBackend::new(2);
    let config = ClusterConfig::new(3)
        .with_init(InitMethod::PlusPlus)
        .with_tolerance(0.001)
        .with_yinyang_fraction(0.0)
        .with_seed(42)
        .with_verbosity(1);

    let mut kmeans = MultiKMeans::with_config(config);
    if let Err(e) = kmeans.fit_with(&backend, &data.view()) {
        eprintln!("clustering failed: {e}");
        std::process::exit(1);
    }

    let centroids = kmeans.centroids().expect("fitted");
    println!("recovered centroids:");
    for row in centroids.outer_iter() {
        println!("  ({:8.3}, {:8.3})", row[0], row[1]);
    }

    let labels = kmeans.labels().expect("fitted");
    let mut sizes = vec![0usize; 3];
    for &l in labels.iter() {
        sizes[l as usize] += 1;
    }
    println!("cluster sizes: {sizes:?}");
}
