//! K-means with k-means++ seeding.
//!
//! Pure and synchronous; the clusterer runs it on the blocking pool.

use crate::error::{EngineError, Result};
use crate::utils::euclidean_distance;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansParams {
    pub k: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Always exactly `k` entries; an empty cluster keeps a zero centroid
    pub centroids: Vec<Vec<f64>>,
    /// Nearest centroid of each input point under the final centroids
    pub labels: Vec<usize>,
    pub iterations: usize,
    pub converged: bool,
}

/// First centroid uniformly at random, the rest sampled with probability
/// proportional to the squared distance to the nearest chosen centroid
pub fn seed_centroids(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    if points.is_empty() || k == 0 {
        return centroids;
    }
    centroids.push(points[rng.gen_range(0..points.len())].clone());

    let mut nearest_sq: Vec<f64> = points
        .iter()
        .map(|p| squared(euclidean_distance(p, &centroids[0])))
        .collect();

    while centroids.len() < k {
        let total: f64 = nearest_sq.iter().sum();
        let chosen = if total > 0.0 && total.is_finite() {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = points.len() - 1;
            for (i, d) in nearest_sq.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        } else {
            // every point coincides with a centroid; duplicates are allowed
            rng.gen_range(0..points.len())
        };

        let centroid = points[chosen].clone();
        for (d, p) in nearest_sq.iter_mut().zip(points) {
            *d = d.min(squared(euclidean_distance(p, &centroid)));
        }
        centroids.push(centroid);
    }
    centroids
}

fn squared(x: f64) -> f64 {
    x * x
}

/// Index and distance of the nearest centroid, plus the runner-up if any
pub fn nearest_two(point: &[f64], centroids: &[Vec<f64>]) -> Option<((usize, f64), Option<(usize, f64)>)> {
    let mut best: Option<(usize, f64)> = None;
    let mut second: Option<(usize, f64)> = None;
    for (i, c) in centroids.iter().enumerate() {
        let d = euclidean_distance(point, c);
        match best {
            Some((_, bd)) if d >= bd => {
                if second.map_or(true, |(_, sd)| d < sd) {
                    second = Some((i, d));
                }
            }
            _ => {
                second = best;
                best = Some((i, d));
            }
        }
    }
    best.map(|b| (b, second))
}

fn assign(points: &[Vec<f64>], centroids: &[Vec<f64>]) -> Vec<usize> {
    points
        .iter()
        .map(|p| nearest_two(p, centroids).map_or(0, |((i, _), _)| i))
        .collect()
}

pub fn fit(points: &[Vec<f64>], params: &KMeansParams) -> Result<KMeansResult> {
    let k = params.k;
    if k == 0 {
        return Err(EngineError::InvalidInput("k must be positive".into()));
    }
    if points.len() < k {
        return Err(EngineError::InsufficientData(format!(
            "{} users for {} clusters",
            points.len(),
            k
        )));
    }
    let dim = points[0].len();
    if let Some(bad) = points.iter().find(|p| p.len() != dim) {
        return Err(EngineError::DimensionMismatch {
            expected: dim,
            actual: bad.len(),
        });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = seed_centroids(points, k, &mut rng);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < params.max_iterations {
        iterations += 1;
        let labels = assign(points, &centroids);

        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, label) in points.iter().zip(&labels) {
            counts[*label] += 1;
            for (s, x) in sums[*label].iter_mut().zip(point) {
                *s += x;
            }
        }

        let mut max_shift: f64 = 0.0;
        for (i, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
            let updated = if count == 0 {
                vec![0.0; dim]
            } else {
                sum.into_iter().map(|s| s / count as f64).collect()
            };
            max_shift = max_shift.max(euclidean_distance(&centroids[i], &updated));
            centroids[i] = updated;
        }

        if max_shift < params.tolerance {
            converged = true;
            break;
        }
    }

    let labels = assign(points, &centroids);
    Ok(KMeansResult {
        centroids,
        labels,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(k: usize) -> KMeansParams {
        KMeansParams {
            k,
            max_iterations: 100,
            tolerance: 1e-4,
            seed: 42,
        }
    }

    fn blobs() -> Vec<Vec<f64>> {
        let mut points = Vec::new();
        for i in 0..10 {
            let jitter = i as f64 * 0.001;
            points.push(vec![0.1 + jitter, 0.1]);
            points.push(vec![0.9 - jitter, 0.9]);
        }
        points
    }

    #[test]
    fn test_exactly_k_centroids() {
        for k in 1..=6 {
            let result = fit(&blobs(), &params(k)).unwrap();
            assert_eq!(result.centroids.len(), k);
            assert_eq!(result.labels.len(), 20);
        }
    }

    #[test]
    fn test_duplicate_points_still_give_k_centroids() {
        let points = vec![vec![0.5, 0.5]; 4];
        let result = fit(&points, &params(3)).unwrap();
        assert_eq!(result.centroids.len(), 3);
        assert!(result.converged);
    }

    #[test]
    fn test_separates_two_blobs() {
        let points = blobs();
        let result = fit(&points, &params(2)).unwrap();

        assert!(result.converged);
        let low = result.labels[0];
        let high = result.labels[1];
        assert_ne!(low, high);
        for (i, label) in result.labels.iter().enumerate() {
            assert_eq!(*label, if i % 2 == 0 { low } else { high });
        }
    }

    #[test]
    fn test_fewer_points_than_k() {
        let result = fit(&blobs()[..2], &params(3));
        assert!(matches!(result, Err(EngineError::InsufficientData(_))));
    }

    #[test]
    fn test_seeding_is_deterministic() {
        let points = blobs();
        let a = fit(&points, &params(3)).unwrap();
        let b = fit(&points, &params(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_nearest_two() {
        let centroids = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![3.0, 0.0]];
        let ((best, d1), second) = nearest_two(&[0.9, 0.0], &centroids).unwrap();
        assert_eq!(best, 1);
        assert!((d1 - 0.1).abs() < 1e-12);
        let (second, d2) = second.unwrap();
        assert_eq!(second, 0);
        assert!((d2 - 0.9).abs() < 1e-12);

        let ((only, _), none) = nearest_two(&[0.0, 0.0], &centroids[..1]).unwrap();
        assert_eq!(only, 0);
        assert!(none.is_none());
    }
}
