//! Accelerator abstraction.
//!
//! The orchestration layer talks to devices exclusively through [`Backend`]:
//! device management, raw buffer memory, and the opaque numeric entry points
//! (distance pass and iterative refinement). [`crate::HostBackend`] provides
//! the CPU reference implementation; a CUDA implementation lives behind the
//! `cuda` feature.

use std::marker::PhantomData;

use crate::config::DistanceMetric;
use crate::distribute::{PerDevice, YinyangBuffers};
use crate::error::Result;

/// Element types storable in device buffers.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {}

impl Element for f32 {}
impl Element for u32 {}

/// Handle to a device-resident buffer of `len` elements of `T`.
///
/// A `Mem` is a plain handle: copying it does not duplicate device memory,
/// and dropping it does not free anything. Deallocation goes through
/// [`Backend::free`] (driven by the buffer distributor for memory it owns;
/// caller-owned buffers are never freed by this crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem<T: Element> {
    dev: usize,
    id: u64,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T: Element> Mem<T> {
    pub fn new(dev: usize, id: u64, len: usize) -> Self {
        Self {
            dev,
            id,
            len,
            _elem: PhantomData,
        }
    }

    /// Device ordinal this buffer lives on.
    pub fn device(&self) -> usize {
        self.dev
    }

    /// Backend-assigned buffer id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Length in elements of `T`.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reinterpret the underlying bytes as elements of `U`.
    ///
    /// The byte extent is unchanged; the element length is rescaled. Used for
    /// the documented scratch reuse (assignment buffers as f32 distance
    /// scratch, the "passed" buffer as group-centroid storage).
    pub fn cast<U: Element>(&self) -> Mem<U> {
        let bytes = self.len * std::mem::size_of::<T>();
        Mem::new(self.dev, self.id, bytes / std::mem::size_of::<U>())
    }
}

/// Outcome of a peer-access enable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Enabled,
    /// The pair was already connected; treated as a non-error condition.
    AlreadyEnabled,
}

/// Free/total device memory, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    pub free_bytes: usize,
    pub total_bytes: usize,
}

/// Problem dimensions shared by every kernel entry point.
#[derive(Debug, Clone, Copy)]
pub struct ProblemShape {
    pub samples: usize,
    pub features: usize,
    pub clusters: usize,
    pub groups: usize,
}

/// Parameters forwarded to the iterative refinement entry point.
#[derive(Debug, Clone, Copy)]
pub struct RefineParams {
    pub tolerance: f32,
    pub metric: DistanceMetric,
    pub reduced_precision: bool,
    pub verbosity: i32,
    pub max_iters: usize,
}

/// A compute accelerator family: device management, buffer memory, and the
/// numeric kernel entry points the orchestration layer drives.
///
/// Buffer extents are enforced by implementations: any copy reaching outside
/// a buffer's declared length fails with a memory error instead of writing.
pub trait Backend {
    /// Number of devices present on the system.
    fn device_count(&self) -> Result<usize>;

    /// Make `dev` the active device, probing that it is usable. Failure is
    /// recoverable at topology-resolution time: the device is dropped from
    /// the selection.
    fn make_current(&self, dev: usize) -> Result<()>;

    /// Whether `dev` can access `peer`'s memory directly.
    fn can_access_peer(&self, dev: usize, peer: usize) -> Result<bool>;

    /// Enable direct access from `dev` to `peer`'s memory.
    fn enable_peer_access(&self, dev: usize, peer: usize) -> Result<PeerStatus>;

    /// Whether `dev` supports the reduced-precision numeric path.
    fn supports_reduced_precision(&self, dev: usize) -> Result<bool>;

    fn memory_info(&self, dev: usize) -> Result<MemoryInfo>;

    /// Block until all work queued on `dev` has completed.
    fn synchronize(&self, dev: usize) -> Result<()>;

    /// Allocate a zero-initialized buffer of `len` elements on `dev`.
    fn alloc<T: Element>(&self, dev: usize, len: usize) -> Result<Mem<T>>;

    /// Release a buffer previously returned by [`Backend::alloc`].
    fn free(&self, dev: usize, id: u64);

    /// Host → device copy into `dst` starting at element `dst_off`.
    fn copy_to_device<T: Element>(&self, dst: &Mem<T>, dst_off: usize, src: &[T]) -> Result<()>;

    /// Device → host copy from `src` starting at element `src_off`.
    fn copy_to_host<T: Element>(&self, dst: &mut [T], src: &Mem<T>, src_off: usize) -> Result<()>;

    /// Same-device copy of `len` elements.
    fn copy_on_device<T: Element>(
        &self,
        dst: &Mem<T>,
        dst_off: usize,
        src: &Mem<T>,
        src_off: usize,
        len: usize,
    ) -> Result<()>;

    /// Cross-device copy of `len` elements between distinct devices.
    fn copy_peer<T: Element>(&self, dst: &Mem<T>, src: &Mem<T>, len: usize) -> Result<()>;

    /// One-time per-device kernel preparation for the given problem shape.
    fn kernel_setup(&self, shape: &ProblemShape, devs: &[usize], verbosity: i32) -> Result<()>;

    /// Distance pass for weighted sampling step `round`: for every sample,
    /// the distance to the nearest of the first `round` centroids.
    ///
    /// Fills `dists`/`dist_sums` device scratch, writes the gathered
    /// distances into `host_dists`, and returns their total.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<f32>;

    /// Iterative refinement: run reassignment/update iterations until the
    /// number of reassigned samples drops to the tolerance threshold or the
    /// iteration cap is reached. Buffers are mutated in place and left
    /// mutually consistent across devices on return.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;
}
