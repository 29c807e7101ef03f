//! Centroid initialization strategies.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::backend::{Backend, Mem, ProblemShape};
use crate::config::{DistanceMetric, InitMethod};
use crate::distribute::PerDevice;
use crate::error::{ClusterError, Result};

/// Populate every device's centroid buffer according to `method`.
///
/// `host_centroids` carries the import source for host-resident callers;
/// `resident_centroids` carries it when the caller's centroid memory already
/// lives on a device. `dists` and `dist_sums` are scratch views over the
/// assignment buffers (they are free until refinement starts) used by the
/// weighted-sampling distance pass.
#[allow(clippy::too_many_arguments)]
pub fn init_centroids<B: Backend>(
    backend: &B,
    method: InitMethod,
    metric: DistanceMetric,
    shape: &ProblemShape,
    devs: &[usize],
    host_centroids: Option<&[f32]>,
    resident_centroids: Option<Mem<f32>>,
    samples: &PerDevice<f32>,
    centroids: &PerDevice<f32>,
    dists: &PerDevice<f32>,
    dist_sums: &PerDevice<f32>,
    rng: &mut ChaCha8Rng,
    verbosity: i32,
) -> Result<()> {
    let f = shape.features;
    match method {
        InitMethod::Import => match resident_centroids {
            None => {
                let data = host_centroids.ok_or_else(|| {
                    ClusterError::InvalidArguments(
                        "import initialization requires centroid data".into(),
                    )
                })?;
                for entry in centroids.iter() {
                    backend.copy_to_device(&entry.mem, 0, data)?;
                }
            }
            Some(src) => {
                // Every other device receives the caller's device-resident
                // centroids directly; the origin device is skipped.
                for entry in centroids.iter() {
                    if entry.mem.device() == src.device() {
                        continue;
                    }
                    backend.copy_peer(&entry.mem, &src, shape.clusters * f)?;
                }
            }
        },
        InitMethod::Random => {
            log::info!("randomly picking initial centroids...");
            let mut chosen: Vec<usize> = (0..shape.samples).collect();
            chosen.shuffle(rng);
            log::debug!("shuffle complete, copying to device(s)");
            for (pos, entry) in centroids.iter().enumerate() {
                let dev_samples = &samples.get(pos).mem;
                for c in 0..shape.clusters {
                    backend.copy_on_device(&entry.mem, c * f, dev_samples, chosen[c] * f, f)?;
                }
            }
        }
        InitMethod::PlusPlus => {
            plus_plus(
                backend, metric, shape, devs, samples, centroids, dists, dist_sums, rng,
                verbosity,
            )?;
        }
    }
    if verbosity > 0 {
        eprintln!("\rdone            ");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn plus_plus<B: Backend>(
    backend: &B,
    metric: DistanceMetric,
    shape: &ProblemShape,
    devs: &[usize],
    samples: &PerDevice<f32>,
    centroids: &PerDevice<f32>,
    dists: &PerDevice<f32>,
    dist_sums: &PerDevice<f32>,
    rng: &mut ChaCha8Rng,
    verbosity: i32,
) -> Result<()> {
    log::info!("performing greedy weighted sampling...");
    let f = shape.features;
    let n = shape.samples;
    let k = shape.clusters;

    // The first seed must not be a NaN hole in the data: probe random
    // offsets until a finite leading value turns up.
    let mut probe = [f32::NAN];
    let first = loop {
        let s = rng.gen_range(0..n);
        backend.copy_to_host(&mut probe, &samples.get(0).mem, s * f)?;
        if !probe[0].is_nan() {
            break s;
        }
    };
    for (pos, entry) in centroids.iter().enumerate() {
        backend.copy_on_device(&entry.mem, 0, &samples.get(pos).mem, first * f, f)?;
    }

    let mut host_dists = vec![0f32; n];
    if verbosity > 2 {
        eprintln!("weighted sampling: dump {} {} ({} bytes)", n, f, n * 4);
        for (pos, &dev) in devs.iter().enumerate() {
            eprintln!(
                "weighted sampling: dev #{}: buffers {} {} {} {}",
                dev,
                samples.get(pos).mem.id(),
                centroids.get(pos).mem.id(),
                dists.get(pos).mem.id(),
                dist_sums.get(pos).mem.id(),
            );
        }
    }

    for i in 1..k {
        if verbosity > 1 || (verbosity > 0 && (k < 100 || i % (k / 100) == 0)) {
            eprint!("\rstep {i}");
        }
        let dist_sum = backend.nearest_distances(
            i, metric, shape, devs, samples, centroids, dists, dist_sums, &mut host_dists,
        )?;
        if dist_sum.is_nan() {
            log::warn!("internal bug during weighted sampling: distance sum is NaN");
        }
        let choice: f64 = rng.gen();
        let estimate = (choice * n as f64) as usize;
        let target = choice * dist_sum as f64;
        let j = weighted_pick(&host_dists, target, estimate);
        if j == 0 || j > n {
            log::warn!("internal bug during weighted sampling: picked position {j} out of range");
        }
        let pick = j.clamp(1, n) - 1;
        for (pos, entry) in centroids.iter().enumerate() {
            backend.copy_on_device(&entry.mem, i * f, &samples.get(pos).mem, pick * f, f)?;
        }
    }
    Ok(())
}

/// Locate the position whose cumulative distance first reaches `target`.
///
/// Returns the one-past position `j` of the selected sample (the winner is
/// `j - 1`). `estimate` is the caller's guess of where the boundary lies;
/// it picks one of three equivalent search strategies:
/// a small estimate scans linearly from the start, otherwise the prefix sum
/// up to the estimate is taken in one pass and the scan continues forward on
/// undershoot or walks backward on overshoot, avoiding a rescan from the
/// beginning in either direction.
pub(crate) fn weighted_pick(dists: &[f32], target: f64, estimate: usize) -> usize {
    let n = dists.len();
    if estimate < 100 {
        let mut acc = 0f64;
        let mut j = 0;
        while j < n && acc < target {
            acc += f64::from(dists[j]);
            j += 1;
        }
        j
    } else {
        let mut acc: f64 = dists[..estimate].iter().map(|&d| f64::from(d)).sum();
        if acc < target {
            let mut j = estimate;
            while j < n && acc < target {
                acc += f64::from(dists[j]);
                j += 1;
            }
            j
        } else {
            // overshoot: walk backward until the cumulative sum drops below
            // the target, then step forward one position
            let mut j = estimate;
            while j > 0 && acc >= target {
                acc -= f64::from(dists[j - 1]);
                j -= 1;
            }
            j + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_weighted_pick_branches_agree() {
        // integer-valued weights keep all three accumulation orders exact
        let dists: Vec<f32> = vec![1.0; 1000];
        let target = 250.3;

        let direct = weighted_pick(&dists, target, 50);
        let forward = weighted_pick(&dists, target, 200);
        let backward = weighted_pick(&dists, target, 900);

        assert_eq!(direct, 251);
        assert_eq!(direct, forward);
        assert_eq!(direct, backward);
    }

    #[test]
    fn test_weighted_pick_branches_agree_nonuniform() {
        let dists: Vec<f32> = (0..500).map(|i| (i % 7 + 1) as f32).collect();
        let total: f64 = dists.iter().map(|&d| f64::from(d)).sum();

        for frac in [0.001, 0.25, 0.5, 0.75, 0.999] {
            let target = total * frac;
            let direct = weighted_pick(&dists, target, 0);
            let forward = weighted_pick(&dists, target, 100);
            let backward = weighted_pick(&dists, target, 499);
            assert_eq!(direct, forward, "forward branch diverged at frac {frac}");
            assert_eq!(direct, backward, "backward branch diverged at frac {frac}");
        }
    }

    #[test]
    fn test_weighted_pick_first_and_last() {
        let dists: Vec<f32> = vec![2.0; 200];
        assert_eq!(weighted_pick(&dists, 0.5, 0), 1);
        assert_eq!(weighted_pick(&dists, 399.5, 150), 200);
    }

    #[test]
    fn test_weighted_pick_zero_target_yields_zero() {
        // a degenerate target never advances the scan; the caller logs and
        // clamps this case
        let dists: Vec<f32> = vec![1.0; 200];
        assert_eq!(weighted_pick(&dists, 0.0, 0), 0);
    }

    #[test]
    fn test_selection_frequency_tracks_weights() {
        let dists: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let total: f64 = 10.0;
        let mut rng = ChaCha8Rng::seed_from_u64(99);

        let trials = 20_000usize;
        let mut hits = [0usize; 4];
        for _ in 0..trials {
            let choice: f64 = rng.gen();
            let estimate = (choice * dists.len() as f64) as usize;
            let j = weighted_pick(&dists, choice * total, estimate);
            hits[j.clamp(1, dists.len()) - 1] += 1;
        }

        for (idx, &count) in hits.iter().enumerate() {
            let expected = dists[idx] as f64 / total;
            let observed = count as f64 / trials as f64;
            assert!(
                (observed - expected).abs() < 0.02,
                "sample {idx}: observed {observed:.3}, expected {expected:.3}"
            );
        }
    }
}
