#![cfg(feature = "cuda")]

//! Require a CUDA-capable machine; run with `cargo test --features cuda`.

use multikmeans_rs::cuda::CudaBackend;
use multikmeans_rs::{kmeans, ClusterConfig, InitMethod};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn two_blobs(seed: u64) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(200);
    for center in [[0.0f32, 0.0], [10.0, 10.0]] {
        for _ in 0..50 {
            data.push(center[0] + rng.gen_range(-0.5..0.5));
            data.push(center[1] + rng.gen_range(-0.5..0.5));
        }
    }
    data
}

#[test]
fn test_cuda_two_blobs_converge() {
    let backend = CudaBackend::new();
    let samples = two_blobs(7);
    let mut centroids = vec![0f32; 4];
    let mut assignments = vec![0u32; 100];

    let config = ClusterConfig::new(2)
        .with_init(InitMethod::Random)
        .with_tolerance(0.01)
        .with_yinyang_fraction(0.0)
        .with_seed(42)
        .with_device_mask(0b1);
    kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments).unwrap();

    let near = |c: &[f32], target: [f32; 2]| {
        (c[0] - target[0]).abs() < 0.6 && (c[1] - target[1]).abs() < 0.6
    };
    let (a, b) = (&centroids[0..2], &centroids[2..4]);
    assert!(
        (near(a, [0.0, 0.0]) && near(b, [10.0, 10.0]))
            || (near(a, [10.0, 10.0]) && near(b, [0.0, 0.0]))
    );
}

#[test]
fn test_cuda_import_round_trip() {
    let backend = CudaBackend::new();
    let samples = two_blobs(1);
    let input = vec![1.5f32, -2.25, 3.75, 0.5];
    let mut centroids = input.clone();
    let mut assignments = vec![0u32; 100];

    let config = ClusterConfig::new(2)
        .with_init(InitMethod::Import)
        .with_yinyang_fraction(0.0)
        .with_device_mask(0b1)
        .with_max_iters(0);
    kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments).unwrap();
    assert_eq!(centroids, input);
}
