/// How the initial centroids are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMethod {
    /// Copy caller-provided centroid data onto every device.
    Import,
    /// Pick `clusters` distinct samples via a seeded uniform shuffle.
    Random,
    /// Greedy weighted sampling: each new centroid is drawn with probability
    /// proportional to its squared distance from the nearest chosen one.
    PlusPlus,
}

/// Distance metric used for assignment and weighted sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    /// Squared Euclidean distance.
    L2,
    /// Cosine distance (1 - cosine similarity).
    Cosine,
}

/// Configuration for a clustering run.
///
/// Immutable for the duration of the run.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of clusters. Must be at least 2 and no larger than the
    /// number of samples.
    pub clusters: usize,

    /// Centroid initialization strategy.
    pub init: InitMethod,

    /// Convergence tolerance: the fraction of samples (in `[0, 1]`) that may
    /// still be reassigned in an iteration before the run is declared
    /// converged.
    pub tolerance: f32,

    /// Grouping fraction in `[0, 0.5]`. The cluster set is partitioned into
    /// `yinyang_fraction * clusters` groups with shared distance bounds;
    /// 0 disables the grouped (bound-pruned) path.
    pub yinyang_fraction: f32,

    /// Distance metric.
    pub metric: DistanceMetric,

    /// Random seed for initialization.
    pub seed: u64,

    /// Device selector bitmask: 0 means "all available devices", otherwise
    /// each set bit `k` selects device `k`.
    pub device_mask: u32,

    /// Request the reduced-precision numeric path. Valid only when every
    /// selected device supports it.
    pub reduced_precision: bool,

    /// 0 = silent, 1 = coarse progress, 2 = per-step progress plus memory
    /// statistics, 3+ = full diagnostic buffer dumps.
    pub verbosity: i32,

    /// Upper bound on refinement iterations. 0 skips refinement entirely,
    /// leaving the initialized centroids untouched.
    pub max_iters: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            clusters: 8,
            init: InitMethod::PlusPlus,
            tolerance: 0.01,
            yinyang_fraction: 0.1,
            metric: DistanceMetric::L2,
            seed: 0,
            device_mask: 0,
            reduced_precision: false,
            verbosity: 0,
            max_iters: 300,
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration with the specified number of clusters.
    pub fn new(clusters: usize) -> Self {
        Self {
            clusters,
            ..Default::default()
        }
    }

    /// Set the initialization strategy.
    pub fn with_init(mut self, init: InitMethod) -> Self {
        self.init = init;
        self
    }

    /// Set the convergence tolerance (fraction of reassigned samples).
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set the grouping fraction.
    pub fn with_yinyang_fraction(mut self, fraction: f32) -> Self {
        self.yinyang_fraction = fraction;
        self
    }

    /// Set the distance metric.
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the device selector bitmask.
    pub fn with_device_mask(mut self, mask: u32) -> Self {
        self.device_mask = mask;
        self
    }

    /// Request the reduced-precision numeric path.
    pub fn with_reduced_precision(mut self, enabled: bool) -> Self {
        self.reduced_precision = enabled;
        self
    }

    /// Set the verbosity level.
    pub fn with_verbosity(mut self, verbosity: i32) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set the iteration cap.
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    /// Number of yinyang groups for this configuration.
    pub fn groups(&self) -> usize {
        (self.yinyang_fraction * self.clusters as f32) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = ClusterConfig::new(16)
            .with_init(InitMethod::Random)
            .with_tolerance(0.05)
            .with_seed(7)
            .with_device_mask(0b11)
            .with_verbosity(2);

        assert_eq!(config.clusters, 16);
        assert_eq!(config.init, InitMethod::Random);
        assert_eq!(config.tolerance, 0.05);
        assert_eq!(config.device_mask, 0b11);
        assert_eq!(config.verbosity, 2);
    }

    #[test]
    fn test_group_count_scales_with_clusters() {
        let config = ClusterConfig::new(100).with_yinyang_fraction(0.1);
        assert_eq!(config.groups(), 10);

        let config = ClusterConfig::new(2).with_yinyang_fraction(0.1);
        assert_eq!(config.groups(), 0);

        let config = ClusterConfig::new(2).with_yinyang_fraction(0.5);
        assert_eq!(config.groups(), 1);
    }
}
