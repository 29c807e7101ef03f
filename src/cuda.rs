//! CUDA backend built on cudarc.
//!
//! Enable the `cuda` feature to use this module. Kernels are compiled with
//! NVRTC at setup time and loaded on every selected device; cluster-sum
//! accumulation runs on the host, which keeps device memory pressure low at
//! the cost of one assignment download per iteration.
//!
//! Cross-device transfers are staged through host memory; the refinement
//! path performs exact reassignment each iteration.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::compile_ptx;

use crate::backend::{
    Backend, Element, Mem, MemoryInfo, PeerStatus, ProblemShape, RefineParams,
};
use crate::config::DistanceMetric;
use crate::distribute::{shard_range, PerDevice, YinyangBuffers};
use crate::error::{ClusterError, Result};

const MODULE_NAME: &str = "multikmeans_kernels";

const CUDA_KERNELS: &str = r#"
__device__ float pair_distance(
    const float* x,
    const float* c,
    int n_features,
    int metric
) {
    if (metric == 0) {
        float sum = 0.0f;
        for (int j = 0; j < n_features; j++) {
            float d = x[j] - c[j];
            sum += d * d;
        }
        return sum;
    }
    float dot = 0.0f, nx = 0.0f, nc = 0.0f;
    for (int j = 0; j < n_features; j++) {
        dot += x[j] * c[j];
        nx += x[j] * x[j];
        nc += c[j] * c[j];
    }
    float denom = sqrtf(nx * nc);
    if (denom == 0.0f) {
        return 1.0f;
    }
    return 1.0f - dot / denom;
}

extern "C" __global__ void min_centroid_distance(
    const float* samples,
    const float* centroids,
    float* dists,
    int start,
    int end,
    int n_features,
    int k_used,
    int metric
) {
    int s = start + blockIdx.x * blockDim.x + threadIdx.x;
    if (s < end) {
        const float* x = samples + (long long)s * n_features;
        float best = 3.4028235e+38f;
        for (int c = 0; c < k_used; c++) {
            float d = pair_distance(x, centroids + (long long)c * n_features,
                                    n_features, metric);
            if (d < best) {
                best = d;
            }
        }
        dists[s] = best;
    }
}

extern "C" __global__ void assign_nearest(
    const float* samples,
    const float* centroids,
    unsigned int* assignments,
    int start,
    int end,
    int n_features,
    int k,
    int metric
) {
    int s = start + blockIdx.x * blockDim.x + threadIdx.x;
    if (s < end) {
        const float* x = samples + (long long)s * n_features;
        float best = 3.4028235e+38f;
        unsigned int best_c = 0;
        for (int c = 0; c < k; c++) {
            float d = pair_distance(x, centroids + (long long)c * n_features,
                                    n_features, metric);
            if (d < best) {
                best = d;
                best_c = c;
            }
        }
        assignments[s] = best_c;
    }
}
"#;

fn metric_code(metric: DistanceMetric) -> i32 {
    match metric {
        DistanceMetric::L2 => 0,
        DistanceMetric::Cosine => 1,
    }
}

fn launch_config(work: usize) -> LaunchConfig {
    let block = 256usize;
    LaunchConfig {
        block_dim: (block as u32, 1, 1),
        grid_dim: (work.div_ceil(block) as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// CUDA accelerator backend.
pub struct CudaBackend {
    devices: Mutex<HashMap<usize, Arc<CudaDevice>>>,
    loaded: Mutex<HashSet<usize>>,
    buffers: Mutex<HashMap<u64, CudaSlice<u8>>>,
    next_id: AtomicU64,
}

impl CudaBackend {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashSet::new()),
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn device(&self, dev: usize) -> Result<Arc<CudaDevice>> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.get(&dev) {
            return Ok(device.clone());
        }
        let device = CudaDevice::new(dev).map_err(|e| {
            ClusterError::NoSuchDevice(format!("failed to open device {dev}: {e}"))
        })?;
        devices.insert(dev, device.clone());
        Ok(device)
    }

    fn read_bytes(&self, mem_dev: usize, id: u64) -> Result<Vec<u8>> {
        let device = self.device(mem_dev)?;
        let buffers = self.buffers.lock().unwrap();
        let slice = buffers.get(&id).ok_or_else(|| {
            ClusterError::MemoryCopy(format!("buffer {id} is not alive on device {mem_dev}"))
        })?;
        device
            .dtoh_sync_copy(slice)
            .map_err(|e| ClusterError::MemoryCopy(format!("device to host copy failed: {e}")))
    }

    fn write_bytes(&self, mem_dev: usize, id: u64, bytes: &[u8]) -> Result<()> {
        let device = self.device(mem_dev)?;
        let mut buffers = self.buffers.lock().unwrap();
        let slice = buffers.get_mut(&id).ok_or_else(|| {
            ClusterError::MemoryCopy(format!("buffer {id} is not alive on device {mem_dev}"))
        })?;
        device
            .htod_sync_copy_into(bytes, slice)
            .map_err(|e| ClusterError::MemoryCopy(format!("host to device copy failed: {e}")))
    }

    fn raw_ptr<T: Element>(&self, mem: &Mem<T>) -> Result<u64> {
        let buffers = self.buffers.lock().unwrap();
        let slice = buffers.get(&mem.id()).ok_or_else(|| {
            ClusterError::MemoryCopy(format!(
                "buffer {} is not alive on device {}",
                mem.id(),
                mem.device()
            ))
        })?;
        Ok(*slice.device_ptr())
    }

    fn read_vec<T: Element>(&self, mem: &Mem<T>) -> Result<Vec<T>> {
        let bytes = self.read_bytes(mem.device(), mem.id())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    fn write_vec<T: Element>(&self, mem: &Mem<T>, data: &[T]) -> Result<()> {
        // whole-buffer write; partial writes stage through read_bytes
        if data.len() == mem.len() {
            return self.write_bytes(mem.device(), mem.id(), bytemuck::cast_slice(data));
        }
        let mut elems: Vec<T> = self.read_vec(mem)?;
        elems[..data.len()].copy_from_slice(data);
        self.write_bytes(mem.device(), mem.id(), bytemuck::cast_slice(&elems))
    }
}

impl Default for CudaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CudaBackend {
    fn device_count(&self) -> Result<usize> {
        let count = CudaDevice::count()
            .map_err(|e| ClusterError::Runtime(format!("device enumeration failed: {e}")))?;
        Ok(count as usize)
    }

    fn make_current(&self, dev: usize) -> Result<()> {
        let device = self.device(dev)?;
        device
            .bind_to_thread()
            .map_err(|e| ClusterError::Runtime(format!("failed to activate device {dev}: {e}")))
    }

    fn can_access_peer(&self, _dev: usize, _peer: usize) -> Result<bool> {
        // direct mappings are not negotiated here; transfers stage through
        // host memory instead
        Ok(false)
    }

    fn enable_peer_access(&self, dev: usize, peer: usize) -> Result<PeerStatus> {
        Err(ClusterError::Runtime(format!(
            "peer access {dev} -> {peer} unavailable, transfers will be staged"
        )))
    }

    fn supports_reduced_precision(&self, dev: usize) -> Result<bool> {
        let device = self.device(dev)?;
        let major = device
            .attribute(cudarc::driver::sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .map_err(|e| ClusterError::Runtime(format!("attribute query failed: {e}")))?;
        Ok(major >= 6)
    }

    fn memory_info(&self, dev: usize) -> Result<MemoryInfo> {
        self.make_current(dev)?;
        let (free, total) = cudarc::driver::result::mem_get_info()
            .map_err(|e| ClusterError::Runtime(format!("memory query failed: {e}")))?;
        Ok(MemoryInfo {
            free_bytes: free,
            total_bytes: total,
        })
    }

    fn synchronize(&self, dev: usize) -> Result<()> {
        let device = self.device(dev)?;
        device
            .synchronize()
            .map_err(|e| ClusterError::Runtime(format!("synchronize failed on {dev}: {e}")))
    }

    fn alloc<T: Element>(&self, dev: usize, len: usize) -> Result<Mem<T>> {
        let bytes = len * std::mem::size_of::<T>();
        let device = self.device(dev)?;
        let slice = device.alloc_zeros::<u8>(bytes).map_err(|e| {
            ClusterError::MemoryCopy(format!("allocation of {bytes} bytes failed on {dev}: {e}"))
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().unwrap().insert(id, slice);
        Ok(Mem::new(dev, id, len))
    }

    fn free(&self, _dev: usize, id: u64) {
        self.buffers.lock().unwrap().remove(&id);
    }

    fn copy_to_device<T: Element>(&self, dst: &Mem<T>, dst_off: usize, src: &[T]) -> Result<()> {
        if dst_off + src.len() > dst.len() {
            return Err(ClusterError::MemoryCopy(format!(
                "write of {} elements at offset {dst_off} exceeds buffer extent {}",
                src.len(),
                dst.len()
            )));
        }
        if dst_off == 0 && src.len() == dst.len() {
            return self.write_bytes(dst.device(), dst.id(), bytemuck::cast_slice(src));
        }
        let mut elems: Vec<T> = self.read_vec(dst)?;
        elems[dst_off..dst_off + src.len()].copy_from_slice(src);
        self.write_bytes(dst.device(), dst.id(), bytemuck::cast_slice(&elems))
    }

    fn copy_to_host<T: Element>(&self, dst: &mut [T], src: &Mem<T>, src_off: usize) -> Result<()> {
        if src_off + dst.len() > src.len() {
            return Err(ClusterError::MemoryCopy(format!(
                "read of {} elements at offset {src_off} exceeds buffer extent {}",
                dst.len(),
                src.len()
            )));
        }
        let data = self.read_vec::<T>(src)?;
        dst.copy_from_slice(&data[src_off..src_off + dst.len()]);
        Ok(())
    }

    fn copy_on_device<T: Element>(
        &self,
        dst: &Mem<T>,
        dst_off: usize,
        src: &Mem<T>,
        src_off: usize,
        len: usize,
    ) -> Result<()> {
        if src_off + len > src.len() {
            return Err(ClusterError::MemoryCopy(format!(
                "read of {len} elements at offset {src_off} exceeds buffer extent {}",
                src.len()
            )));
        }
        let data = self.read_vec::<T>(src)?;
        self.copy_to_device(dst, dst_off, &data[src_off..src_off + len])
    }

    fn copy_peer<T: Element>(&self, dst: &Mem<T>, src: &Mem<T>, len: usize) -> Result<()> {
        if dst.device() == src.device() {
            return Err(ClusterError::MemoryCopy(format!(
                "peer copy within device {}",
                dst.device()
            )));
        }
        if len > src.len() || len > dst.len() {
            return Err(ClusterError::MemoryCopy(format!(
                "peer copy of {len} elements exceeds buffer extents {} / {}",
                src.len(),
                dst.len()
            )));
        }
        let data = self.read_vec::<T>(src)?;
        self.copy_to_device(dst, 0, &data[..len])
    }

    fn kernel_setup(&self, shape: &ProblemShape, devs: &[usize], verbosity: i32) -> Result<()> {
        let ptx = compile_ptx(CUDA_KERNELS)
            .map_err(|e| ClusterError::Runtime(format!("kernel compilation failed: {e}")))?;
        for &dev in devs {
            let device = self.device(dev)?;
            let mut loaded = self.loaded.lock().unwrap();
            if loaded.contains(&dev) {
                continue;
            }
            device
                .load_ptx(
                    ptx.clone(),
                    MODULE_NAME,
                    &["min_centroid_distance", "assign_nearest"],
                )
                .map_err(|e| {
                    ClusterError::Runtime(format!("kernel load failed on device {dev}: {e}"))
                })?;
            loaded.insert(dev);
        }
        if verbosity > 1 {
            eprintln!(
                "kernel setup: {} samples, {} features, {} clusters, {} groups on {} device(s)",
                shape.samples,
                shape.features,
                shape.clusters,
                shape.groups,
                devs.len()
            );
        }
        Ok(())
    }

    fn nearest_distances(
        &self,
        round: usize,
        metric: DistanceMetric,
        shape: &ProblemShape,
        devs: &[usize],
        samples: &PerDevice<f32>,
        centroids: &PerDevice<f32>,
        dists: &PerDevice<f32>,
        dist_sums: &PerDevice<f32>,
        host_dists: &mut [f32],
    ) -> Result<f32> {
        let n = shape.samples;
        let f = shape.features;
        let mut total = 0f64;

        for (pos, &dev) in devs.iter().enumerate() {
            let range = shard_range(n, devs.len(), pos);
            if range.is_empty() {
                continue;
            }
            let device = self.device(dev)?;
            let func = device
                .get_func(MODULE_NAME, "min_centroid_distance")
                .ok_or_else(|| {
                    ClusterError::Runtime("kernel min_centroid_distance is not loaded".into())
                })?;

            let s_ptr = self.raw_ptr(&samples.get(pos).mem)?;
            let c_ptr = self.raw_ptr(&centroids.get(pos).mem)?;
            let d_ptr = self.raw_ptr(&dists.get(pos).mem)?;
            let cfg = launch_config(range.len());
            unsafe {
                func.launch(
                    cfg,
                    (
                        s_ptr,
                        c_ptr,
                        d_ptr,
                        range.start as i32,
                        range.end as i32,
                        f as i32,
                        round as i32,
                        metric_code(metric),
                    ),
                )
            }
            .map_err(|e| ClusterError::Runtime(format!("kernel launch failed on {dev}: {e}")))?;

            self.synchronize(dev)?;
            let all = self.read_vec::<f32>(&dists.get(pos).mem)?;
            let shard = &all[range.clone()];
            let partial: f64 = shard.iter().map(|&d| f64::from(d)).sum();
            host_dists[range.clone()].copy_from_slice(shard);
            self.write_vec(&dist_sums.get(pos).mem, &[partial as f32])?;
            total += partial;
        }
        Ok(total as f32)
    }

    fn refine(
        &self,
        params: &RefineParams,
        shape: &ProblemShape,
        devs: &[usize],
        samples: &PerDevice<f32>,
        centroids: &mut PerDevice<f32>,
        counts: &mut PerDevice<u32>,
        prev_assignments: &mut PerDevice<u32>,
        assignments: &mut PerDevice<u32>,
        _yinyang: Option<&mut YinyangBuffers>,
    ) -> Result<()> {
        if params.max_iters == 0 {
            return Ok(());
        }
        let n = shape.samples;
        let f = shape.features;
        let k = shape.clusters;
        let threshold = (f64::from(params.tolerance) * n as f64) as usize;

        let data = self.read_vec::<f32>(&samples.get(0).mem)?;
        let mut cents = self.read_vec::<f32>(&centroids.get(0).mem)?;
        let mut assign = vec![0u32; n];
        let mut prev = vec![0u32; n];

        for iter in 0..params.max_iters {
            for (pos, &dev) in devs.iter().enumerate() {
                let range = shard_range(n, devs.len(), pos);
                if range.is_empty() {
                    continue;
                }
                let device = self.device(dev)?;
                let func = device
                    .get_func(MODULE_NAME, "assign_nearest")
                    .ok_or_else(|| {
                        ClusterError::Runtime("kernel assign_nearest is not loaded".into())
                    })?;

                let s_ptr = self.raw_ptr(&samples.get(pos).mem)?;
                let c_ptr = self.raw_ptr(&centroids.get(pos).mem)?;
                let a_ptr = self.raw_ptr(&assignments.get(pos).mem)?;
                let cfg = launch_config(range.len());
                unsafe {
                    func.launch(
                        cfg,
                        (
                            s_ptr,
                            c_ptr,
                            a_ptr,
                            range.start as i32,
                            range.end as i32,
                            f as i32,
                            k as i32,
                            metric_code(params.metric),
                        ),
                    )
                }
                .map_err(|e| {
                    ClusterError::Runtime(format!("kernel launch failed on {dev}: {e}"))
                })?;

                self.synchronize(dev)?;
                let shard_assign = self.read_vec::<u32>(&assignments.get(pos).mem)?;
                assign[range.clone()].copy_from_slice(&shard_assign[range.clone()]);
            }

            let reassigned = assign.iter().zip(prev.iter()).filter(|(a, p)| a != p).count();
            prev.copy_from_slice(&assign);

            // accumulate on the host, then push the new state everywhere
            let mut sums = vec![0f64; k * f];
            let mut cluster_counts = vec![0u32; k];
            for s in 0..n {
                let c = assign[s] as usize;
                cluster_counts[c] += 1;
                for j in 0..f {
                    sums[c * f + j] += f64::from(data[s * f + j]);
                }
            }
            for c in 0..k {
                if cluster_counts[c] == 0 {
                    log::debug!("cluster {c} is empty, keeping its centroid");
                    continue;
                }
                for j in 0..f {
                    cents[c * f + j] = (sums[c * f + j] / f64::from(cluster_counts[c])) as f32;
                }
            }
            for pos in 0..devs.len() {
                self.write_vec(&centroids.get(pos).mem, &cents)?;
                self.write_vec(&counts.get(pos).mem, &cluster_counts)?;
                self.write_vec(&assignments.get(pos).mem, &assign)?;
                self.write_vec(&prev_assignments.get(pos).mem, &prev)?;
            }

            if params.verbosity > 0 {
                eprintln!("iteration {}: {} reassignments", iter + 1, reassigned);
            }
            if reassigned <= threshold {
                break;
            }
        }
        Ok(())
    }
}
