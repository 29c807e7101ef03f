use ndarray::{Array1, Array2, ArrayView2};

use crate::backend::Backend;
use crate::cluster;
use crate::config::{ClusterConfig, InitMethod};
use crate::error::{ClusterError, Result};
use crate::host::HostBackend;

/// ndarray-friendly front end over the clustering entry points.
///
/// # Example
///
/// ```
/// use multikmeans_rs::{HostBackend, MultiKMeans};
/// use ndarray::Array2;
/// use ndarray_rand::RandomExt;
/// use ndarray_rand::rand_distr::Uniform;
///
/// let data = Array2::random((500, 8), Uniform::new(-1.0f32, 1.0));
///
/// let mut kmeans = MultiKMeans::new(8, 4);
/// kmeans.fit(&data.view()).unwrap();
/// assert_eq!(kmeans.centroids().unwrap().nrows(), 4);
/// ```
pub struct MultiKMeans {
    /// Run configuration.
    config: ClusterConfig,

    /// Number of features (dimensions).
    d: usize,

    /// Final centroids (None until fitted).
    centroids: Option<Array2<f32>>,

    /// Final per-sample cluster assignments (None until fitted).
    labels: Option<Array1<u32>>,
}

impl MultiKMeans {
    /// Create a model with default configuration.
    ///
    /// # Panics
    ///
    /// Panics if `clusters` is below 2.
    pub fn new(d: usize, clusters: usize) -> Self {
        assert!(clusters >= 2, "cluster count must be at least 2");
        Self {
            config: ClusterConfig::new(clusters),
            d,
            centroids: None,
            labels: None,
        }
    }

    /// Create a model with a custom configuration. The feature count is
    /// taken from the first `fit` call.
    pub fn with_config(config: ClusterConfig) -> Self {
        Self {
            config,
            d: 0,
            centroids: None,
            labels: None,
        }
    }

    /// Fit on a single simulated host device.
    pub fn fit(&mut self, data: &ArrayView2<f32>) -> Result<&mut Self> {
        let backend = HostBackend::default();
        self.fit_with(&backend, data)
    }

    /// Fit using the given backend and the configured device selection.
    ///
    /// With [`InitMethod::Import`], previously stored centroids seed the run.
    pub fn fit_with<B: Backend>(
        &mut self,
        backend: &B,
        data: &ArrayView2<f32>,
    ) -> Result<&mut Self> {
        let n_features = data.ncols();
        if self.d == 0 {
            self.d = n_features;
        } else if n_features != self.d {
            return Err(ClusterError::InvalidArguments(format!(
                "expected {} features, got {}",
                self.d, n_features
            )));
        }

        let n_samples = data.nrows();
        let k = self.config.clusters;
        let flat: Vec<f32> = data.iter().cloned().collect();

        let mut centroids = vec![0f32; k * self.d];
        if self.config.init == InitMethod::Import {
            if let Some(seed) = &self.centroids {
                centroids.copy_from_slice(seed.as_slice().ok_or_else(|| {
                    ClusterError::InvalidArguments("stored centroids are not contiguous".into())
                })?);
            }
        }
        let mut assignments = vec![0u32; n_samples];

        cluster::kmeans(
            backend,
            &self.config,
            self.d,
            &flat,
            &mut centroids,
            &mut assignments,
        )?;

        self.centroids = Some(
            Array2::from_shape_vec((k, self.d), centroids)
                .map_err(|e| ClusterError::Runtime(e.to_string()))?,
        );
        self.labels = Some(Array1::from_vec(assignments));
        Ok(self)
    }

    /// Final centroids, `None` until fitted.
    pub fn centroids(&self) -> Option<&Array2<f32>> {
        self.centroids.as_ref()
    }

    /// Final cluster assignments, `None` until fitted.
    pub fn labels(&self) -> Option<&Array1<u32>> {
        self.labels.as_ref()
    }

    /// Number of clusters.
    pub fn k(&self) -> usize {
        self.config.clusters
    }

    /// Number of features (dimensions).
    pub fn d(&self) -> usize {
        self.d
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitMethod;
    use ndarray::Array2;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    #[test]
    fn test_new_model_is_unfitted() {
        let kmeans = MultiKMeans::new(16, 4);
        assert_eq!(kmeans.k(), 4);
        assert_eq!(kmeans.d(), 16);
        assert!(kmeans.centroids().is_none());
        assert!(kmeans.labels().is_none());
    }

    #[test]
    #[should_panic(expected = "cluster count must be at least 2")]
    fn test_single_cluster_panics() {
        let _ = MultiKMeans::new(16, 1);
    }

    #[test]
    fn test_fit_sets_centroids_and_labels() {
        let data = Array2::random((200, 8), Uniform::new(-1.0f32, 1.0));
        let mut kmeans = MultiKMeans::new(8, 5);

        kmeans.fit(&data.view()).unwrap();

        let centroids = kmeans.centroids().unwrap();
        assert_eq!(centroids.nrows(), 5);
        assert_eq!(centroids.ncols(), 8);

        let labels = kmeans.labels().unwrap();
        assert_eq!(labels.len(), 200);
        for &label in labels.iter() {
            assert!(label < 5);
        }
    }

    #[test]
    fn test_dimension_mismatch_on_refit() {
        let data = Array2::random((100, 8), Uniform::new(-1.0f32, 1.0));
        let other = Array2::random((100, 16), Uniform::new(-1.0f32, 1.0));

        let mut kmeans = MultiKMeans::new(8, 4);
        kmeans.fit(&data.view()).unwrap();

        let result = kmeans.fit(&other.view());
        assert!(matches!(result, Err(ClusterError::InvalidArguments(_))));
    }

    #[test]
    fn test_import_reuses_stored_centroids() {
        let data = Array2::random((120, 4), Uniform::new(-1.0f32, 1.0));

        let config = ClusterConfig::new(3).with_seed(11);
        let mut kmeans = MultiKMeans::with_config(config);
        kmeans.fit(&data.view()).unwrap();
        let first = kmeans.centroids().unwrap().clone();

        // re-fitting with import and a zero iteration cap must echo the
        // stored centroids untouched
        let config = ClusterConfig::new(3)
            .with_init(InitMethod::Import)
            .with_max_iters(0);
        let mut imported = MultiKMeans::with_config(config);
        imported.d = 4;
        imported.centroids = Some(first.clone());
        imported.fit(&data.view()).unwrap();

        assert_eq!(imported.centroids().unwrap(), &first);
    }
}
