//! Per-device buffer distribution.
//!
//! Every logical array of a run (samples, centroids, assignments, counts,
//! yinyang auxiliaries) is materialized as one buffer per selected device.
//! A buffer is either owned by this crate (allocated here, released when the
//! run's [`BufferGuard`] drops) or borrowed (an alias onto caller-resident
//! device memory, never freed here).

use std::ops::Range;

use crate::backend::{Backend, Element, Mem, ProblemShape};
use crate::error::Result;

/// One device's view of a distributed array.
#[derive(Debug, Clone, Copy)]
pub struct DeviceArray<T: Element> {
    pub mem: Mem<T>,
    /// Runtime ownership flag consulted at teardown. Borrowed buffers belong
    /// to the caller (or to another device's allocation) and are never freed.
    pub owned: bool,
}

/// A distributed array: one buffer per selected device, indexed by the
/// device's position in the run's ordered device list.
#[derive(Debug, Clone)]
pub struct PerDevice<T: Element> {
    entries: Vec<DeviceArray<T>>,
}

impl<T: Element> PerDevice<T> {
    pub fn get(&self, pos: usize) -> &DeviceArray<T> {
        &self.entries[pos]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceArray<T>> {
        self.entries.iter()
    }

    /// Position of the entry living on device `dev`, if any.
    pub fn position_of(&self, dev: usize) -> Option<usize> {
        self.entries.iter().position(|e| e.mem.device() == dev)
    }

    /// Reinterpret every buffer as elements of `U` (same byte extents).
    /// The view is borrowed: releasing memory stays with the original set.
    pub fn cast<U: Element>(&self) -> PerDevice<U> {
        PerDevice {
            entries: self
                .entries
                .iter()
                .map(|e| DeviceArray {
                    mem: e.mem.cast(),
                    owned: false,
                })
                .collect(),
        }
    }
}

/// Scoped release of every buffer a run allocates.
///
/// Each successful allocation is registered here; when the guard drops (on
/// success, on validation failure, or after a mid-run allocation failure)
/// every registered buffer is freed, in reverse allocation order. Borrowed
/// buffers are never registered.
pub struct BufferGuard<'a, B: Backend> {
    backend: &'a B,
    allocated: Vec<(usize, u64)>,
}

impl<'a, B: Backend> BufferGuard<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self {
            backend,
            allocated: Vec::new(),
        }
    }

    fn register<T: Element>(&mut self, mem: &Mem<T>) {
        self.allocated.push((mem.device(), mem.id()));
    }
}

impl<B: Backend> Drop for BufferGuard<'_, B> {
    fn drop(&mut self) {
        for &(dev, id) in self.allocated.iter().rev() {
            self.backend.free(dev, id);
        }
    }
}

/// Distribute a `len`-element array across `devs`.
///
/// When `resident` names a buffer on one of the selected devices, that
/// device's slot borrows the caller's memory instead of allocating,
/// eliminating a redundant copy. Allocation failure on any device is fatal;
/// buffers already registered with the guard are released by its drop.
pub fn distribute<T: Element, B: Backend>(
    backend: &B,
    devs: &[usize],
    guard: &mut BufferGuard<'_, B>,
    len: usize,
    resident: Option<&Mem<T>>,
) -> Result<PerDevice<T>> {
    let mut entries = Vec::with_capacity(devs.len());
    for &dev in devs {
        match resident {
            Some(mem) if mem.device() == dev => {
                entries.push(DeviceArray { mem: *mem, owned: false });
            }
            _ => {
                let mem = backend.alloc::<T>(dev, len)?;
                guard.register(&mem);
                entries.push(DeviceArray { mem, owned: true });
            }
        }
    }
    Ok(PerDevice { entries })
}

/// Distribute with no caller-resident aliasing: one owned buffer per device.
pub fn allocate<T: Element, B: Backend>(
    backend: &B,
    devs: &[usize],
    guard: &mut BufferGuard<'_, B>,
    len: usize,
) -> Result<PerDevice<T>> {
    distribute(backend, devs, guard, len, None)
}

/// Length of the longest per-device sample shard.
pub fn max_shard_len(samples: usize, n_devs: usize) -> usize {
    samples.div_ceil(n_devs)
}

/// Contiguous shard of the sample range owned by the device at `pos`.
pub fn shard_range(samples: usize, n_devs: usize, pos: usize) -> Range<usize> {
    let chunk = max_shard_len(samples, n_devs);
    let start = (chunk * pos).min(samples);
    let end = (start + chunk).min(samples);
    start..end
}

/// Where the per-group centroid data physically lives.
///
/// The decision is made once at allocation time and recorded here so later
/// stages never re-derive it.
pub enum GroupCentroids {
    /// The "passed" buffer had enough capacity and is reused.
    ReusesPassed,
    Separate(PerDevice<f32>),
}

/// Auxiliary buffers for the grouped (bound-pruned) refinement path.
pub struct YinyangBuffers {
    /// Group id per cluster (`clusters` entries).
    pub group_assignments: PerDevice<u32>,
    /// Per-sample distance bounds: `max_shard * (groups + 1)` entries
    /// (one upper bound plus one lower bound per group).
    pub bounds: PerDevice<f32>,
    /// Previous centroid data plus per-cluster drift norms:
    /// `clusters * features + clusters` entries.
    pub drifts: PerDevice<f32>,
    /// Per-sample skip flags, `max(max_shard, clusters + groups)` entries.
    pub passed: PerDevice<u32>,
    pub group_centroids: GroupCentroids,
}

impl YinyangBuffers {
    /// Allocate the full auxiliary set for `shape` across `devs`.
    pub fn distribute<B: Backend>(
        backend: &B,
        devs: &[usize],
        guard: &mut BufferGuard<'_, B>,
        shape: &ProblemShape,
    ) -> Result<Self> {
        let group_assignments = allocate::<u32, B>(backend, devs, guard, shape.clusters)?;

        let max_len = max_shard_len(shape.samples, devs.len());
        let bounds = allocate::<f32, B>(backend, devs, guard, max_len * (shape.groups + 1))?;

        let drifts = allocate::<f32, B>(
            backend,
            devs,
            guard,
            shape.clusters * shape.features + shape.clusters,
        )?;

        let passed_len = max_len.max(shape.clusters + shape.groups);
        let passed = allocate::<u32, B>(backend, devs, guard, passed_len)?;

        let group_data_len = shape.groups * shape.features;
        let group_centroids = if group_data_len <= passed_len {
            log::debug!("reusing passed buffer for group centroid data");
            GroupCentroids::ReusesPassed
        } else {
            GroupCentroids::Separate(allocate::<f32, B>(backend, devs, guard, group_data_len)?)
        };

        Ok(Self {
            group_assignments,
            bounds,
            drifts,
            passed,
            group_centroids,
        })
    }

    /// The buffer holding group centroid data on the device at `pos`.
    pub fn group_centroid_mem(&self, pos: usize) -> Mem<f32> {
        match &self.group_centroids {
            GroupCentroids::ReusesPassed => self.passed.get(pos).mem.cast(),
            GroupCentroids::Separate(per_dev) => per_dev.get(pos).mem,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;

    #[test]
    fn test_max_shard_len() {
        assert_eq!(max_shard_len(100, 1), 100);
        assert_eq!(max_shard_len(100, 3), 34);
        assert_eq!(max_shard_len(99, 3), 33);
    }

    #[test]
    fn test_shard_ranges_cover_samples() {
        let n = 101;
        let devs = 3;
        let mut covered = 0;
        for pos in 0..devs {
            let r = shard_range(n, devs, pos);
            assert_eq!(r.start, covered);
            covered = r.end;
        }
        assert_eq!(covered, n);
    }

    #[test]
    fn test_distribute_allocates_per_device() {
        let backend = HostBackend::new(3);
        let devs = [0, 1, 2];
        let mut guard = BufferGuard::new(&backend);

        let set = allocate::<f32, _>(&backend, &devs, &mut guard, 64).unwrap();
        assert_eq!(set.len(), 3);
        for entry in set.iter() {
            assert!(entry.owned);
            assert_eq!(entry.mem.len(), 64);
        }
        assert_eq!(backend.live_buffers(), 3);
        drop(guard);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_distribute_borrows_resident_buffer() {
        let backend = HostBackend::new(2);
        let devs = [0, 1];
        let caller_mem = backend.alloc::<f32>(1, 64).unwrap();

        let mut guard = BufferGuard::new(&backend);
        let set = distribute(&backend, &devs, &mut guard, 64, Some(&caller_mem)).unwrap();
        assert!(set.get(0).owned);
        assert!(!set.get(1).owned);
        assert_eq!(set.get(1).mem, caller_mem);

        // only one fresh allocation happened
        assert_eq!(backend.live_buffers(), 2);
        drop(guard);
        // the borrowed buffer survives the guard
        assert_eq!(backend.live_buffers(), 1);
        backend.free(1, caller_mem.id());
    }

    #[test]
    fn test_guard_releases_partial_set_on_failure() {
        let backend = HostBackend::new(3).fail_allocations_after(4);
        let devs = [0, 1, 2];
        let mut guard = BufferGuard::new(&backend);

        allocate::<f32, _>(&backend, &devs, &mut guard, 16).unwrap();
        let err = allocate::<u32, _>(&backend, &devs, &mut guard, 16);
        assert!(err.is_err());
        drop(guard);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_group_centroid_reuse_decision() {
        let backend = HostBackend::new(1);
        let devs = [0];

        // passed buffer (max(samples, clusters+groups) = 1000) fits
        // groups * features = 2 * 4
        let shape = ProblemShape {
            samples: 1000,
            features: 4,
            clusters: 8,
            groups: 2,
        };
        let mut guard = BufferGuard::new(&backend);
        let yy = YinyangBuffers::distribute(&backend, &devs, &mut guard, &shape).unwrap();
        assert!(matches!(yy.group_centroids, GroupCentroids::ReusesPassed));
        assert_eq!(yy.group_centroid_mem(0).id(), yy.passed.get(0).mem.id());
        drop(guard);

        // groups * features = 4 * 512 exceeds passed capacity (16 samples)
        let shape = ProblemShape {
            samples: 16,
            features: 512,
            clusters: 8,
            groups: 4,
        };
        let mut guard = BufferGuard::new(&backend);
        let yy = YinyangBuffers::distribute(&backend, &devs, &mut guard, &shape).unwrap();
        assert!(matches!(yy.group_centroids, GroupCentroids::Separate(_)));
        drop(guard);
        assert_eq!(backend.live_buffers(), 0);
    }
}
