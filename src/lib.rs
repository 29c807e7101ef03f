//! # multikmeans-rs
//!
//! Multi-device k-means clustering in Rust.
//!
//! ## Features
//!
//! - **Multi-device orchestration**: distributes samples, centroids and
//!   assignments across any number of devices, with peer-to-peer copies
//!   where the topology allows them and staged transfers where it does not
//! - **Three initialization strategies**: import, seeded random selection,
//!   and greedy weighted ("k-means++") sampling
//! - **Bound-pruned refinement**: grouped distance bounds let samples that
//!   provably kept their cluster skip recomputation
//! - **Pluggable backends**: a portable [`HostBackend`] (also the test
//!   harness, with fault-injection knobs), and a CUDA backend behind the
//!   `cuda` feature
//! - **ndarray compatible**: the [`MultiKMeans`] front end works directly
//!   with ndarray views
//!
//! ## Example
//!
//! ```rust
//! use multikmeans_rs::{ClusterConfig, HostBackend, InitMethod, MultiKMeans};
//! use ndarray::Array2;
//! use ndarray_rand::RandomExt;
//! use ndarray_rand::rand_distr::Uniform;
//!
//! let data = Array2::random((1000, 16), Uniform::new(-1.0f32, 1.0));
//!
//! let backend = HostBackend::new(1);
//! let mut kmeans = MultiKMeans::new(16, 8);
//! kmeans.fit_with(&backend, &data.view()).unwrap();
//!
//! let labels = kmeans.labels().unwrap();
//! assert_eq!(labels.len(), 1000);
//! ```
//!
//! ## Low-level entry points
//!
//! [`kmeans`] clusters host-resident data; [`kmeans_device`] accepts caller
//! buffers already resident on a device (they are borrowed, not copied, and
//! results are left in place when that device participates in the run).

mod backend;
mod cluster;
mod config;
mod distribute;
mod error;
mod host;
mod init;
mod kmeans;
mod topology;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use backend::{Backend, Element, Mem, MemoryInfo, PeerStatus, ProblemShape, RefineParams};
pub use cluster::{kmeans, kmeans_device, normalize, DeviceResident};
pub use config::{ClusterConfig, DistanceMetric, InitMethod};
pub use distribute::{DeviceArray, GroupCentroids, PerDevice, YinyangBuffers};
pub use error::{ClusterError, Result};
pub use host::HostBackend;
pub use kmeans::MultiKMeans;
