use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use multikmeans_rs::{ClusterConfig, HostBackend, InitMethod, MultiKMeans};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::time::Duration;

fn bench_config(k: usize) -> ClusterConfig {
    ClusterConfig::new(k)
        .with_init(InitMethod::Random)
        .with_tolerance(0.0)
        .with_yinyang_fraction(0.0)
        .with_seed(42)
        .with_max_iters(5)
}

fn benchmark_varying_samples(c: &mut Criterion) {
    let mut group = c.benchmark_group("kmeans_samples");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(2));

    let n_features = 32;
    let k = 16;
    for n_samples in [1_000usize, 5_000, 10_000] {
        group.throughput(Throughput::Elements(n_samples as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(n_samples),
            &n_samples,
            |b, &n_samples| {
                let data = Array2::random((n_samples, n_features), Uniform::new(-1.0f32, 1.0));
                let backend = HostBackend::new(1);
                b.iter(|| {
                    let mut kmeans = MultiKMeans::with_config(bench_config(k));
                    kmeans.fit_with(&backend, black_box(&data.view())).unwrap();
                    kmeans
                });
            },
        );
    }
    group.finish();
}

fn benchmark_varying_devices(c: &mut Criterion) {
    let mut group = c.benchmark_group("kmeans_devices");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(2));

    let data = Array2::random((5_000, 32), Uniform::new(-1.0f32, 1.0));
    for n_devices in [1usize, 2, 4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(n_devices),
            &n_devices,
            |b, &n_devices| {
                let backend = HostBackend::new(n_devices);
                b.iter(|| {
                    let mut kmeans = MultiKMeans::with_config(bench_config(16));
                    kmeans.fit_with(&backend, black_box(&data.view())).unwrap();
                    kmeans
                });
            },
        );
    }
    group.finish();
}

fn benchmark_yinyang_grouping(c: &mut Criterion) {
    let mut group = c.benchmark_group("kmeans_grouping");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));

    let data = Array2::random((10_000, 32), Uniform::new(-1.0f32, 1.0));
    for fraction in [0.0f32, 0.1, 0.25] {
        group.bench_with_input(
            BenchmarkId::from_parameter(fraction),
            &fraction,
            |b, &fraction| {
                let backend = HostBackend::new(1);
                let config = bench_config(64)
                    .with_yinyang_fraction(fraction)
                    .with_max_iters(10);
                b.iter(|| {
                    let mut kmeans = MultiKMeans::with_config(config.clone());
                    kmeans.fit_with(&backend, black_box(&data.view())).unwrap();
                    kmeans
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_varying_samples,
    benchmark_varying_devices,
    benchmark_yinyang_grouping,
);

criterion_main!(benches);
