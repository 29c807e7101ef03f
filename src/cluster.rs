//! Top-level orchestration of a clustering run.
//!
//! Wires validation, topology resolution, buffer distribution,
//! initialization and refinement together, and copies results back to the
//! caller. Every owned buffer is registered with a [`BufferGuard`], so all
//! exit paths (including mid-run failures) release what was acquired.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::backend::{Backend, Mem, ProblemShape, RefineParams};
use crate::config::{ClusterConfig, InitMethod};
use crate::distribute::{allocate, distribute, BufferGuard, YinyangBuffers};
use crate::error::{ClusterError, Result};
use crate::init::init_centroids;
use crate::topology::resolve_devices;

/// Caller-owned buffers already resident on one device.
///
/// All three handles must live on the same device. They are borrowed for the
/// run: that device's slots alias them instead of allocating, and they are
/// never freed by this crate.
#[derive(Debug, Clone, Copy)]
pub struct DeviceResident {
    pub device: usize,
    pub samples: Mem<f32>,
    pub centroids: Mem<f32>,
    pub assignments: Mem<u32>,
}

enum Input<'a> {
    Host {
        samples: &'a [f32],
        centroids: &'a mut [f32],
        assignments: &'a mut [u32],
        /// Copy of the caller's centroid data, taken before distribution so
        /// import initialization can read it while the output slice is
        /// mutably held.
        import: Option<Vec<f32>>,
    },
    Device(DeviceResident),
}

impl Input<'_> {
    fn resident_device(&self) -> Option<usize> {
        match self {
            Input::Host { .. } => None,
            Input::Device(r) => Some(r.device),
        }
    }

    fn samples_mem(&self) -> Option<Mem<f32>> {
        match self {
            Input::Host { .. } => None,
            Input::Device(r) => Some(r.samples),
        }
    }

    fn centroids_mem(&self) -> Option<Mem<f32>> {
        match self {
            Input::Host { .. } => None,
            Input::Device(r) => Some(r.centroids),
        }
    }

    fn assignments_mem(&self) -> Option<Mem<u32>> {
        match self {
            Input::Host { .. } => None,
            Input::Device(r) => Some(r.assignments),
        }
    }
}

/// Cluster host-resident samples across the devices selected by
/// `config.device_mask`.
///
/// `samples` is `samples_size * features` row-major; `centroids`
/// (`clusters * features`) doubles as the import source and the output;
/// `assignments` receives the final cluster index of every sample.
pub fn kmeans<B: Backend>(
    backend: &B,
    config: &ClusterConfig,
    features: usize,
    samples: &[f32],
    centroids: &mut [f32],
    assignments: &mut [u32],
) -> Result<()> {
    if features == 0 {
        return Err(ClusterError::InvalidArguments(
            "feature count must be positive".into(),
        ));
    }
    if samples.len() % features != 0 {
        return Err(ClusterError::InvalidArguments(format!(
            "sample data length {} is not a multiple of {} features",
            samples.len(),
            features
        )));
    }
    let n = samples.len() / features;
    check_args(backend, config, n, features, centroids.len(), assignments.len())?;

    let import = match config.init {
        InitMethod::Import => Some(centroids.to_vec()),
        _ => None,
    };
    run(
        backend,
        config,
        n,
        features,
        Input::Host {
            samples,
            centroids,
            assignments,
            import,
        },
    )
}

/// Cluster samples already resident on a device.
///
/// The resident device's slots borrow the caller's buffers. If that device
/// is part of the selection, results are left in place; otherwise they are
/// written back through a peer copy followed by a full synchronization
/// barrier.
pub fn kmeans_device<B: Backend>(
    backend: &B,
    config: &ClusterConfig,
    features: usize,
    resident: &DeviceResident,
) -> Result<()> {
    if features == 0 {
        return Err(ClusterError::InvalidArguments(
            "feature count must be positive".into(),
        ));
    }
    if resident.samples.len() % features != 0 {
        return Err(ClusterError::InvalidArguments(format!(
            "sample buffer length {} is not a multiple of {} features",
            resident.samples.len(),
            features
        )));
    }
    if resident.samples.device() != resident.device
        || resident.centroids.device() != resident.device
        || resident.assignments.device() != resident.device
    {
        return Err(ClusterError::InvalidArguments(
            "resident buffers must all live on the resident device".into(),
        ));
    }
    let n = resident.samples.len() / features;
    check_args(
        backend,
        config,
        n,
        features,
        resident.centroids.len(),
        resident.assignments.len(),
    )?;
    let present = backend.device_count()?;
    if resident.device >= present {
        return Err(ClusterError::NoSuchDevice(format!(
            "resident device {} is not present",
            resident.device
        )));
    }
    run(backend, config, n, features, Input::Device(*resident))
}

/// Global per-feature normalization entry point.
pub fn normalize<B: Backend>(
    _backend: &B,
    _features: usize,
    _samples: &[f32],
    _output: &mut [f32],
) -> Result<()> {
    // TODO: per-feature min-max scaling pass
    Ok(())
}

fn check_args<B: Backend>(
    backend: &B,
    config: &ClusterConfig,
    samples_size: usize,
    features: usize,
    centroids_len: usize,
    assignments_len: usize,
) -> Result<()> {
    let k = config.clusters;
    if k < 2 || k >= u32::MAX as usize {
        return Err(ClusterError::InvalidArguments(format!(
            "cluster count {k} is out of range"
        )));
    }
    if samples_size < k {
        return Err(ClusterError::InvalidArguments(format!(
            "{samples_size} samples cannot form {k} clusters"
        )));
    }
    if centroids_len != k * features {
        return Err(ClusterError::InvalidArguments(format!(
            "centroid buffer holds {centroids_len} values, expected {}",
            k * features
        )));
    }
    if assignments_len != samples_size {
        return Err(ClusterError::InvalidArguments(format!(
            "assignment buffer holds {assignments_len} values, expected {samples_size}"
        )));
    }
    if !(0.0..=1.0).contains(&config.tolerance) {
        return Err(ClusterError::InvalidArguments(format!(
            "tolerance {} is outside [0, 1]",
            config.tolerance
        )));
    }
    if !(0.0..=0.5).contains(&config.yinyang_fraction) {
        return Err(ClusterError::InvalidArguments(format!(
            "grouping fraction {} is outside [0, 0.5]",
            config.yinyang_fraction
        )));
    }

    let present = backend.device_count()?;
    if u64::from(config.device_mask) > (1u64 << present) {
        return Err(ClusterError::NoSuchDevice(format!(
            "selector {:#x} names devices beyond the {present} present",
            config.device_mask
        )));
    }
    if config.reduced_precision {
        for dev in 0..present {
            let selected = config.device_mask == 0 || config.device_mask & (1 << dev) != 0;
            if selected && !backend.supports_reduced_precision(dev)? {
                return Err(ClusterError::InvalidArguments(format!(
                    "device {dev} does not support reduced precision"
                )));
            }
        }
    }
    Ok(())
}

fn run<B: Backend>(
    backend: &B,
    config: &ClusterConfig,
    n: usize,
    features: usize,
    mut input: Input<'_>,
) -> Result<()> {
    let k = config.clusters;
    let groups = config.groups();
    log::debug!("arguments: {config:?} samples={n} features={features}");
    log::info!(
        "reassignments threshold: {}",
        (config.tolerance * n as f32) as usize
    );
    log::debug!("yinyang groups: {groups}");

    let devs = resolve_devices(backend, config.device_mask, input.resident_device())?;
    if devs.is_empty() {
        return Err(ClusterError::NoSuchDevice(
            "no usable device in the selection".into(),
        ));
    }
    let shape = ProblemShape {
        samples: n,
        features,
        clusters: k,
        groups,
    };
    let mut guard = BufferGuard::new(backend);

    let samples_resident = input.samples_mem();
    let device_samples = distribute(
        backend,
        &devs,
        &mut guard,
        n * features,
        samples_resident.as_ref(),
    )?;
    match &input {
        Input::Host { samples, .. } => {
            for entry in device_samples.iter() {
                backend.copy_to_device(&entry.mem, 0, samples)?;
            }
        }
        Input::Device(r) => {
            for entry in device_samples.iter() {
                if entry.mem.device() != r.device {
                    backend.copy_peer(&entry.mem, &r.samples, n * features)?;
                }
            }
        }
    }

    let centroids_resident = input.centroids_mem();
    let mut device_centroids = distribute(
        backend,
        &devs,
        &mut guard,
        k * features,
        centroids_resident.as_ref(),
    )?;
    let assignments_resident = input.assignments_mem();
    let mut device_assignments =
        distribute(backend, &devs, &mut guard, n, assignments_resident.as_ref())?;
    let mut device_prev = allocate::<u32, B>(backend, &devs, &mut guard, n)?;
    let mut device_counts = allocate::<u32, B>(backend, &devs, &mut guard, k)?;

    let mut yinyang = if groups >= 1 {
        Some(YinyangBuffers::distribute(backend, &devs, &mut guard, &shape)?)
    } else {
        None
    };

    if config.verbosity > 1 {
        log_memory_stats(backend, &devs)?;
    }
    backend.kernel_setup(&shape, &devs, config.verbosity)?;

    // the assignment buffers are free until refinement starts; the
    // initializer uses them as distance scratch
    let dists = device_assignments.cast::<f32>();
    let dist_sums = device_prev.cast::<f32>();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let host_import = match &input {
        Input::Host { import, .. } => import.as_deref(),
        Input::Device(_) => None,
    };
    init_centroids(
        backend,
        config.init,
        config.metric,
        &shape,
        &devs,
        host_import,
        input.centroids_mem(),
        &device_samples,
        &device_centroids,
        &dists,
        &dist_sums,
        &mut rng,
        config.verbosity,
    )?;

    // refinement consumes the initialization result: barrier first
    for &dev in &devs {
        backend.synchronize(dev)?;
    }

    let params = RefineParams {
        tolerance: config.tolerance,
        metric: config.metric,
        reduced_precision: config.reduced_precision,
        verbosity: config.verbosity,
        max_iters: config.max_iters,
    };
    backend.refine(
        &params,
        &shape,
        &devs,
        &device_samples,
        &mut device_centroids,
        &mut device_counts,
        &mut device_prev,
        &mut device_assignments,
        yinyang.as_mut(),
    )?;

    let origin = input
        .resident_device()
        .and_then(|d| devs.iter().position(|&x| x == d));
    let last = devs.len() - 1;
    match &mut input {
        Input::Host {
            centroids,
            assignments,
            ..
        } => {
            backend.copy_to_host(centroids, &device_centroids.get(last).mem, 0)?;
            backend.copy_to_host(assignments, &device_assignments.get(last).mem, 0)?;
        }
        Input::Device(r) => {
            if origin.is_none() {
                backend.copy_peer(&r.centroids, &device_centroids.get(last).mem, k * features)?;
                backend.copy_peer(&r.assignments, &device_assignments.get(last).mem, n)?;
                for &dev in &devs {
                    backend.synchronize(dev)?;
                }
            }
            // a selected resident device holds the result in place already
        }
    }
    Ok(())
}

/// Per-device memory usage report, emitted at verbosity >= 2.
fn log_memory_stats<B: Backend>(backend: &B, devs: &[usize]) -> Result<()> {
    for &dev in devs {
        let info = backend.memory_info(dev)?;
        let used = info.total_bytes - info.free_bytes;
        log::info!(
            "device #{dev} memory: used {used} bytes ({:.1}%), free {} bytes, total {} bytes",
            used as f64 * 100.0 / info.total_bytes as f64,
            info.free_bytes,
            info.total_bytes
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;

    fn two_blob_data() -> Vec<f32> {
        let mut data = Vec::with_capacity(40);
        for i in 0..10 {
            data.push(0.0 + (i as f32) * 0.01);
            data.push(0.0 - (i as f32) * 0.01);
        }
        for i in 0..10 {
            data.push(10.0 + (i as f32) * 0.01);
            data.push(10.0 - (i as f32) * 0.01);
        }
        data
    }

    #[test]
    fn test_invalid_cluster_count_touches_no_device() {
        let backend = HostBackend::new(1);
        let samples = two_blob_data();
        let mut centroids = vec![0f32; 2];
        let mut assignments = vec![0u32; 20];

        let config = ClusterConfig::new(1);
        let err = kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments);
        assert!(matches!(err, Err(ClusterError::InvalidArguments(_))));
        assert_eq!(backend.allocations_performed(), 0);
    }

    #[test]
    fn test_more_clusters_than_samples_rejected() {
        let backend = HostBackend::new(1);
        let samples = vec![0f32; 6];
        let mut centroids = vec![0f32; 8];
        let mut assignments = vec![0u32; 3];

        let config = ClusterConfig::new(4);
        let err = kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments);
        assert!(matches!(err, Err(ClusterError::InvalidArguments(_))));
        assert_eq!(backend.allocations_performed(), 0);
    }

    #[test]
    fn test_out_of_range_tolerance_rejected() {
        let backend = HostBackend::new(1);
        let samples = two_blob_data();
        let mut centroids = vec![0f32; 4];
        let mut assignments = vec![0u32; 20];

        let config = ClusterConfig::new(2).with_tolerance(1.5);
        let err = kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments);
        assert!(matches!(err, Err(ClusterError::InvalidArguments(_))));

        let config = ClusterConfig::new(2).with_yinyang_fraction(0.9);
        let err = kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments);
        assert!(matches!(err, Err(ClusterError::InvalidArguments(_))));
        assert_eq!(backend.allocations_performed(), 0);
    }

    #[test]
    fn test_reduced_precision_requires_support() {
        let backend = HostBackend::new(1).with_reduced_precision_support(false);
        let samples = two_blob_data();
        let mut centroids = vec![0f32; 4];
        let mut assignments = vec![0u32; 20];

        let config = ClusterConfig::new(2).with_reduced_precision(true);
        let err = kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments);
        assert!(matches!(err, Err(ClusterError::InvalidArguments(_))));
    }

    #[test]
    fn test_no_devices_is_no_such_device() {
        let backend = HostBackend::new(0);
        let samples = two_blob_data();
        let mut centroids = vec![0f32; 4];
        let mut assignments = vec![0u32; 20];

        let config = ClusterConfig::new(2);
        let err = kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments);
        assert!(matches!(err, Err(ClusterError::NoSuchDevice(_))));
    }

    #[test]
    fn test_mask_beyond_present_devices() {
        let backend = HostBackend::new(1);
        let samples = two_blob_data();
        let mut centroids = vec![0f32; 4];
        let mut assignments = vec![0u32; 20];

        let config = ClusterConfig::new(2).with_device_mask(0b1000);
        let err = kmeans(&backend, &config, 2, &samples, &mut centroids, &mut assignments);
        assert!(matches!(err, Err(ClusterError::NoSuchDevice(_))));
    }

    #[test]
    fn test_normalize_is_a_stub() {
        let backend = HostBackend::new(1);
        let samples = [1.0f32, 2.0];
        let mut output = [0f32; 2];
        normalize(&backend, 2, &samples, &mut output).unwrap();
        assert_eq!(output, [0.0, 0.0]);
    }
}
