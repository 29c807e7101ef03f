//! CPU reference backend.
//!
//! Simulates any number of devices with byte-addressed buffer pools and
//! implements the numeric entry points (distance pass, iterative refinement)
//! on the host. Besides serving as the portable execution path, it carries
//! fault-injection knobs (unusable devices, denied peer access, allocation
//! failures) that make topology and cleanup behavior testable without
//! hardware.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;

use crate::backend::{
    Backend, Element, Mem, MemoryInfo, PeerStatus, ProblemShape, RefineParams,
};
use crate::config::DistanceMetric;
use crate::distribute::{shard_range, PerDevice, YinyangBuffers};
use crate::error::{ClusterError, Result};

const DEVICE_TOTAL_BYTES: usize = 16 << 30;

struct HostDevice {
    // 4-byte words keep the storage aligned for every element type
    buffers: Mutex<HashMap<u64, Vec<u32>>>,
    usable: bool,
}

/// Host-memory backend simulating `n` devices.
pub struct HostBackend {
    devices: Vec<HostDevice>,
    reduced_precision: bool,
    peer_allowed: bool,
    peer_enabled: Mutex<HashSet<(usize, usize)>>,
    remaining_allocs: Mutex<Option<usize>>,
    allocations: AtomicU64,
    next_id: AtomicU64,
}

impl HostBackend {
    pub fn new(n_devices: usize) -> Self {
        let devices = (0..n_devices)
            .map(|_| HostDevice {
                buffers: Mutex::new(HashMap::new()),
                usable: true,
            })
            .collect();
        Self {
            devices,
            reduced_precision: true,
            peer_allowed: true,
            peer_enabled: Mutex::new(HashSet::new()),
            remaining_allocs: Mutex::new(None),
            allocations: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Report peer access as impossible between every device pair.
    pub fn deny_peer_access(mut self) -> Self {
        self.peer_allowed = false;
        self
    }

    /// Let the first `n` allocations succeed and fail every one after.
    pub fn fail_allocations_after(self, n: usize) -> Self {
        *self.remaining_allocs.lock().unwrap() = Some(n);
        self
    }

    /// Make `dev` fail its activation probe.
    pub fn mark_unusable(mut self, dev: usize) -> Self {
        if let Some(d) = self.devices.get_mut(dev) {
            d.usable = false;
        }
        self
    }

    /// Control whether devices report reduced-precision support.
    pub fn with_reduced_precision_support(mut self, supported: bool) -> Self {
        self.reduced_precision = supported;
        self
    }

    /// Number of buffers currently alive across all devices.
    pub fn live_buffers(&self) -> usize {
        self.devices
            .iter()
            .map(|d| d.buffers.lock().unwrap().len())
            .sum()
    }

    /// Total allocations performed since construction.
    pub fn allocations_performed(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    fn device(&self, dev: usize) -> Result<&HostDevice> {
        self.devices
            .get(dev)
            .ok_or_else(|| ClusterError::NoSuchDevice(format!("device {dev} is not present")))
    }

    fn read_vec<T: Element>(&self, mem: &Mem<T>) -> Result<Vec<T>> {
        let device = self.device(mem.device())?;
        let buffers = device.buffers.lock().unwrap();
        let words = buffers.get(&mem.id()).ok_or_else(|| {
            ClusterError::MemoryCopy(format!(
                "buffer {} is not alive on device {}",
                mem.id(),
                mem.device()
            ))
        })?;
        Ok(bytemuck::cast_slice(words).to_vec())
    }

    fn write_at<T: Element>(&self, mem: &Mem<T>, off: usize, src: &[T]) -> Result<()> {
        if off + src.len() > mem.len() {
            return Err(ClusterError::MemoryCopy(format!(
                "write of {} elements at offset {} exceeds buffer extent {}",
                src.len(),
                off,
                mem.len()
            )));
        }
        let device = self.device(mem.device())?;
        let mut buffers = device.buffers.lock().unwrap();
        let words = buffers.get_mut(&mem.id()).ok_or_else(|| {
            ClusterError::MemoryCopy(format!(
                "buffer {} is not alive on device {}",
                mem.id(),
                mem.device()
            ))
        })?;
        let elems: &mut [T] = bytemuck::cast_slice_mut(words);
        elems[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Backend for HostBackend {
    fn device_count(&self) -> Result<usize> {
        Ok(self.devices.len())
    }

    fn make_current(&self, dev: usize) -> Result<()> {
        let device = self.device(dev)?;
        if !device.usable {
            return Err(ClusterError::Runtime(format!("device {dev} is not usable")));
        }
        Ok(())
    }

    fn can_access_peer(&self, dev: usize, peer: usize) -> Result<bool> {
        self.device(dev)?;
        self.device(peer)?;
        Ok(self.peer_allowed)
    }

    fn enable_peer_access(&self, dev: usize, peer: usize) -> Result<PeerStatus> {
        self.device(dev)?;
        self.device(peer)?;
        if !self.peer_allowed {
            return Err(ClusterError::Runtime(format!(
                "peer access {dev} -> {peer} is not supported"
            )));
        }
        let mut enabled = self.peer_enabled.lock().unwrap();
        if enabled.insert((dev, peer)) {
            Ok(PeerStatus::Enabled)
        } else {
            Ok(PeerStatus::AlreadyEnabled)
        }
    }

    fn supports_reduced_precision(&self, dev: usize) -> Result<bool> {
        self.device(dev)?;
        Ok(self.reduced_precision)
    }

    fn memory_info(&self, dev: usize) -> Result<MemoryInfo> {
        let device = self.device(dev)?;
        let used: usize = device
            .buffers
            .lock()
            .unwrap()
            .values()
            .map(|words| words.len() * 4)
            .sum();
        Ok(MemoryInfo {
            free_bytes: DEVICE_TOTAL_BYTES.saturating_sub(used),
            total_bytes: DEVICE_TOTAL_BYTES,
        })
    }

    fn synchronize(&self, dev: usize) -> Result<()> {
        self.device(dev)?;
        Ok(())
    }

    fn alloc<T: Element>(&self, dev: usize, len: usize) -> Result<Mem<T>> {
        let bytes = len * std::mem::size_of::<T>();
        let device = self.device(dev)?;
        {
            let mut remaining = self.remaining_allocs.lock().unwrap();
            if let Some(n) = remaining.as_mut() {
                if *n == 0 {
                    return Err(ClusterError::MemoryCopy(format!(
                        "allocation of {bytes} bytes failed on device {dev}"
                    )));
                }
                *n -= 1;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        device.buffers.lock().unwrap().insert(id, vec![0u32; bytes / 4]);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Mem::new(dev, id, len))
    }

    fn free(&self, dev: usize, id: u64) {
        if let Some(device) = self.devices.get(dev) {
            device.buffers.lock().unwrap().remove(&id);
        }
    }

    fn copy_to_device<T: Element>(&self, dst: &Mem<T>, dst_off: usize, src: &[T]) -> Result<()> {
        self.write_at(dst, dst_off, src)
    }

    fn copy_to_host<T: Element>(&self, dst: &mut [T], src: &Mem<T>, src_off: usize) -> Result<()> {
        if src_off + dst.len() > src.len() {
            return Err(ClusterError::MemoryCopy(format!(
                "read of {} elements at offset {} exceeds buffer extent {}",
                dst.len(),
                src_off,
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
        if dst.device() != src.device() {
            return Err(ClusterError::MemoryCopy(
                "same-device copy across distinct devices".into(),
            ));
        }
        if src_off + len > src.len() {
            return Err(ClusterError::MemoryCopy(format!(
                "read of {len} elements at offset {src_off} exceeds buffer extent {}",
                src.len()
            )));
        }
        let data = self.read_vec::<T>(src)?;
        self.write_at(dst, dst_off, &data[src_off..src_off + len])
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
        // staged through host memory; direct access is a hardware notion
        let data = self.read_vec::<T>(src)?;
        self.write_at(dst, 0, &data[..len])
    }

    fn kernel_setup(&self, shape: &ProblemShape, devs: &[usize], verbosity: i32) -> Result<()> {
        for &dev in devs {
            self.make_current(dev)?;
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
        let f = shape.features;
        let n = shape.samples;
        let mut total = 0f64;

        for pos in 0..devs.len() {
            let range = shard_range(n, devs.len(), pos);
            if range.is_empty() {
                continue;
            }
            let data = self.read_vec::<f32>(&samples.get(pos).mem)?;
            let cents = self.read_vec::<f32>(&centroids.get(pos).mem)?;

            let shard: Vec<f32> = range
                .clone()
                .into_par_iter()
                .map(|s| {
                    let x = &data[s * f..(s + 1) * f];
                    let mut best = f32::INFINITY;
                    for c in 0..round {
                        let d = sampling_distance(metric, x, &cents[c * f..(c + 1) * f]);
                        if d < best {
                            best = d;
                        }
                    }
                    best
                })
                .collect();

            let partial: f64 = shard.iter().map(|&d| f64::from(d)).sum();
            self.write_at(&dists.get(pos).mem, range.start, &shard)?;
            self.write_at(&dist_sums.get(pos).mem, 0, &[partial as f32])?;
            host_dists[range.clone()].copy_from_slice(&shard);
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
        yinyang: Option<&mut YinyangBuffers>,
    ) -> Result<()> {
        if params.max_iters == 0 {
            return Ok(());
        }
        let n = shape.samples;
        let f = shape.features;
        let k = shape.clusters;
        let g = shape.groups;
        let ndev = devs.len();
        let threshold = (f64::from(params.tolerance) * n as f64) as usize;

        let data = self.read_vec::<f32>(&samples.get(0).mem)?;
        let mut cents = self.read_vec::<f32>(&centroids.get(0).mem)?;
        let mut assign = vec![0u32; n];
        let mut prev = vec![0u32; n];

        let pruning = g >= 1 && yinyang.is_some();
        let group_of: Vec<u32> = (0..k).map(|c| ((c * g.max(1)) / k) as u32).collect();
        if let Some(yy) = yinyang.as_deref() {
            for entry in yy.group_assignments.iter() {
                self.write_at(&entry.mem, 0, &group_of)?;
            }
        }

        let mut upper = vec![f32::INFINITY; n];
        let mut lower = vec![0f32; n * g.max(1)];
        let mut drift = vec![0f32; k];
        let mut group_drift = vec![0f32; g.max(1)];

        for iter in 0..params.max_iters {
            let full_pass = iter == 0;
            let mut skipped_total = 0usize;

            for pos in 0..ndev {
                let range = shard_range(n, ndev, pos);
                if range.is_empty() {
                    continue;
                }
                let dev_data = self.read_vec::<f32>(&samples.get(pos).mem)?;
                let base = range.start;

                // (assignment, upper bound, per-group lower bounds or skip)
                let results: Vec<(u32, f32, Option<Vec<f32>>)> = range
                    .clone()
                    .into_par_iter()
                    .map(|s| {
                        let old = assign[s];
                        if pruning && !full_pass {
                            let u = upper[s];
                            let lmin = lower[s * g..(s + 1) * g]
                                .iter()
                                .fold(f32::INFINITY, |m, &v| m.min(v));
                            if u <= lmin {
                                return (old, u, None);
                            }
                        }
                        let x = &dev_data[(s - base) * f..(s - base + 1) * f];
                        let mut best = f32::INFINITY;
                        let mut best_c = 0u32;
                        let mut lows = vec![f32::INFINITY; g.max(1)];
                        for c in 0..k {
                            let d = metric_distance(params.metric, x, &cents[c * f..(c + 1) * f]);
                            if d < best {
                                if best.is_finite() {
                                    let og = group_of[best_c as usize] as usize;
                                    lows[og] = lows[og].min(best);
                                }
                                best = d;
                                best_c = c as u32;
                            } else {
                                let gi = group_of[c] as usize;
                                lows[gi] = lows[gi].min(d);
                            }
                        }
                        (best_c, best, Some(lows))
                    })
                    .collect();

                let mut passed_flags = vec![0u32; range.len()];
                for (li, (a, u, lows)) in results.into_iter().enumerate() {
                    let s = base + li;
                    assign[s] = a;
                    upper[s] = u;
                    match lows {
                        Some(lows) => {
                            if pruning {
                                lower[s * g..(s + 1) * g].copy_from_slice(&lows[..g]);
                            }
                        }
                        None => {
                            passed_flags[li] = 1;
                            skipped_total += 1;
                        }
                    }
                }
                if let Some(yy) = yinyang.as_deref() {
                    self.write_at(&yy.passed.get(pos).mem, 0, &passed_flags)?;
                }
            }

            let reassigned = assign.iter().zip(prev.iter()).filter(|(a, p)| a != p).count();
            prev.copy_from_slice(&assign);

            // centroid update; empty clusters keep their previous position
            let old_cents = cents.clone();
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
                let count = cluster_counts[c];
                if count == 0 {
                    log::debug!("cluster {c} is empty, keeping its centroid");
                    continue;
                }
                for j in 0..f {
                    cents[c * f + j] = (sums[c * f + j] / f64::from(count)) as f32;
                }
            }

            for c in 0..k {
                drift[c] =
                    metric_distance(params.metric, &old_cents[c * f..(c + 1) * f], &cents[c * f..(c + 1) * f]);
            }
            if pruning {
                group_drift.iter_mut().for_each(|v| *v = 0.0);
                for c in 0..k {
                    let gi = group_of[c] as usize;
                    group_drift[gi] = group_drift[gi].max(drift[c]);
                }
                for s in 0..n {
                    upper[s] += drift[assign[s] as usize];
                    for gi in 0..g {
                        lower[s * g + gi] -= group_drift[gi];
                    }
                }
            }

            self.mirror_state(
                shape,
                devs,
                centroids,
                counts,
                prev_assignments,
                assignments,
                yinyang.as_deref(),
                &cents,
                &old_cents,
                &drift,
                &cluster_counts,
                &assign,
                &prev,
                &group_of,
                &upper,
                &lower,
            )?;

            if params.verbosity > 0 {
                eprintln!(
                    "iteration {}: {} reassignments, {} skipped",
                    iter + 1,
                    reassigned,
                    skipped_total
                );
            }
            if reassigned <= threshold {
                break;
            }
        }
        Ok(())
    }
}

impl HostBackend {
    /// Push the host-side refinement state back into every device's buffers
    /// so all replicas are consistent at the synchronization point.
    #[allow(clippy::too_many_arguments)]
    fn mirror_state(
        &self,
        shape: &ProblemShape,
        devs: &[usize],
        centroids: &PerDevice<f32>,
        counts: &PerDevice<u32>,
        prev_assignments: &PerDevice<u32>,
        assignments: &PerDevice<u32>,
        yinyang: Option<&YinyangBuffers>,
        cents: &[f32],
        old_cents: &[f32],
        drift: &[f32],
        cluster_counts: &[u32],
        assign: &[u32],
        prev: &[u32],
        group_of: &[u32],
        upper: &[f32],
        lower: &[f32],
    ) -> Result<()> {
        let n = shape.samples;
        let f = shape.features;
        let k = shape.clusters;
        let g = shape.groups;

        for pos in 0..devs.len() {
            self.write_at(&centroids.get(pos).mem, 0, cents)?;
            self.write_at(&counts.get(pos).mem, 0, cluster_counts)?;
            self.write_at(&assignments.get(pos).mem, 0, assign)?;
            self.write_at(&prev_assignments.get(pos).mem, 0, prev)?;

            if let Some(yy) = yinyang {
                let range = shard_range(n, devs.len(), pos);
                let mut shard_bounds = vec![0f32; range.len() * (g + 1)];
                for (li, s) in range.clone().enumerate() {
                    shard_bounds[li * (g + 1)] = upper[s];
                    shard_bounds[li * (g + 1) + 1..li * (g + 1) + 1 + g]
                        .copy_from_slice(&lower[s * g..(s + 1) * g]);
                }
                self.write_at(&yy.bounds.get(pos).mem, 0, &shard_bounds)?;

                let drifts_mem = &yy.drifts.get(pos).mem;
                self.write_at(drifts_mem, 0, old_cents)?;
                self.write_at(drifts_mem, k * f, drift)?;

                // per-group centroid means, into the recorded physical home
                let mut group_cents = vec![0f32; g * f];
                let mut members = vec![0u32; g];
                for c in 0..k {
                    let gi = group_of[c] as usize;
                    members[gi] += 1;
                    for j in 0..f {
                        group_cents[gi * f + j] += cents[c * f + j];
                    }
                }
                for gi in 0..g {
                    if members[gi] > 0 {
                        for j in 0..f {
                            group_cents[gi * f + j] /= members[gi] as f32;
                        }
                    }
                }
                self.write_at(&yy.group_centroid_mem(pos), 0, &group_cents)?;
            }
        }
        Ok(())
    }
}

/// Distance used by the weighted-sampling pass: squared Euclidean for L2,
/// one minus cosine similarity for the cosine metric.
fn sampling_distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::L2 => a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| (x - y) * (x - y))
            .sum(),
        DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
    }
}

/// Distance used for assignment and drift bounds. Both variants satisfy the
/// triangle inequality, which the group bounds rely on.
fn metric_distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::L2 => a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::Cosine => cosine_similarity(a, b).clamp(-1.0, 1.0).acos(),
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = (na * nb).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_copy_roundtrip() {
        let backend = HostBackend::new(2);
        let mem = backend.alloc::<f32>(1, 8).unwrap();

        let src = [1.0f32, 2.0, 3.0, 4.0];
        backend.copy_to_device(&mem, 2, &src).unwrap();

        let mut out = [0f32; 4];
        backend.copy_to_host(&mut out, &mem, 2).unwrap();
        assert_eq!(out, src);

        backend.free(1, mem.id());
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_copy_outside_extent_fails() {
        let backend = HostBackend::new(1);
        let mem = backend.alloc::<u32>(4, 4).err();
        assert!(mem.is_some(), "device 4 does not exist");

        let mem = backend.alloc::<u32>(0, 4).unwrap();
        let err = backend.copy_to_device(&mem, 2, &[1u32, 2, 3]);
        assert!(matches!(err, Err(ClusterError::MemoryCopy(_))));
    }

    #[test]
    fn test_peer_copy_rejects_same_device() {
        let backend = HostBackend::new(2);
        let a = backend.alloc::<f32>(0, 4).unwrap();
        let b = backend.alloc::<f32>(0, 4).unwrap();
        let err = backend.copy_peer(&b, &a, 4);
        assert!(matches!(err, Err(ClusterError::MemoryCopy(_))));
    }

    #[test]
    fn test_peer_copy_between_devices() {
        let backend = HostBackend::new(2);
        let a = backend.alloc::<f32>(0, 4).unwrap();
        let b = backend.alloc::<f32>(1, 4).unwrap();
        backend.copy_to_device(&a, 0, &[9.0f32, 8.0, 7.0, 6.0]).unwrap();
        backend.copy_peer(&b, &a, 4).unwrap();

        let mut out = [0f32; 4];
        backend.copy_to_host(&mut out, &b, 0).unwrap();
        assert_eq!(out, [9.0, 8.0, 7.0, 6.0]);
    }

    #[test]
    fn test_memory_info_tracks_usage() {
        let backend = HostBackend::new(1);
        let before = backend.memory_info(0).unwrap();
        let _mem = backend.alloc::<f32>(0, 1024).unwrap();
        let after = backend.memory_info(0).unwrap();
        assert_eq!(before.free_bytes - after.free_bytes, 4096);
        assert_eq!(after.total_bytes, before.total_bytes);
    }

    #[test]
    fn test_enable_peer_access_reports_already_enabled() {
        let backend = HostBackend::new(2);
        assert_eq!(
            backend.enable_peer_access(0, 1).unwrap(),
            PeerStatus::Enabled
        );
        assert_eq!(
            backend.enable_peer_access(0, 1).unwrap(),
            PeerStatus::AlreadyEnabled
        );
    }

    #[test]
    fn test_denied_peer_access() {
        let backend = HostBackend::new(2).deny_peer_access();
        assert!(!backend.can_access_peer(0, 1).unwrap());
        assert!(backend.enable_peer_access(0, 1).is_err());
    }

    #[test]
    fn test_metric_distances() {
        use approx::assert_relative_eq;

        let a = [0.0f32, 0.0];
        let b = [3.0f32, 4.0];
        assert_relative_eq!(sampling_distance(DistanceMetric::L2, &a, &b), 25.0);
        assert_relative_eq!(metric_distance(DistanceMetric::L2, &a, &b), 5.0);

        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        assert_relative_eq!(sampling_distance(DistanceMetric::Cosine, &a, &b), 1.0);
        assert_relative_eq!(
            metric_distance(DistanceMetric::Cosine, &a, &b),
            std::f32::consts::FRAC_PI_2,
            epsilon = 1e-5
        );
    }
}
