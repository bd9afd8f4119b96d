//! K-means over embedding vectors.
//!
//! k-means++ seeding from a seeded [`StdRng`], then Lloyd iterations until
//! no assignment changes or `max_iterations` is reached. Vectors are
//! L2-normalised first, so squared Euclidean distance orders points the same
//! way cosine distance does.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::embedding::normalize;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster index per input vector, in input order.
    pub assignments: Vec<usize>,
    pub centroids: Vec<Vec<f32>>,
    pub iterations: usize,
    pub converged: bool,
}

/// Default cluster count for `n` points: `clamp(round(sqrt(n / 2)), 1, n)`.
pub fn default_k(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let k = ((n as f64) / 2.0).sqrt().round() as usize;
    k.clamp(1, n)
}

#[inline]
fn distance_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Cluster `vectors` into at most `k` groups.
///
/// All vectors must share one dimensionality. `k` is clamped to the number
/// of points. Identical inputs and seed give identical output.
pub fn kmeans(vectors: &[Vec<f32>], k: usize, seed: u64, max_iterations: usize) -> KMeansResult {
    let n = vectors.len();
    if n == 0 || k == 0 {
        return KMeansResult {
            assignments: Vec::new(),
            centroids: Vec::new(),
            iterations: 0,
            converged: true,
        };
    }
    let k = k.min(n);

    let points: Vec<Vec<f32>> = vectors
        .iter()
        .map(|v| {
            let mut v = v.clone();
            normalize(&mut v);
            v
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_plus_plus_init(&points, k, &mut rng);
    let mut assignments = vec![usize::MAX; n];
    let mut iterations = 0;
    let mut converged = false;

    for _ in 0..max_iterations.max(1) {
        iterations += 1;

        // Assignment step: assign each point to nearest centroid
        let mut changed = false;
        for (i, point) in points.iter().enumerate() {
            let best = nearest(point, &centroids).0;
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }
        if !changed {
            converged = true;
            break;
        }

        // Update step: recompute centroids
        centroids = compute_centroids(&points, &assignments, &centroids);
    }

    KMeansResult {
        assignments,
        centroids,
        iterations,
        converged,
    }
}

fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut best = (0, f32::MAX);
    for (j, centroid) in centroids.iter().enumerate() {
        let d = distance_squared(point, centroid);
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

/// Pick centroids with probability proportional to squared distance.
fn kmeans_plus_plus_init(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = points.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..n)].clone());

    let mut min_distances = vec![f32::MAX; n];
    while centroids.len() < k {
        if let Some(last) = centroids.last() {
            for (i, point) in points.iter().enumerate() {
                min_distances[i] = min_distances[i].min(distance_squared(point, last));
            }
        }

        let total: f32 = min_distances.iter().sum();
        if total <= f32::EPSILON {
            // Every remaining point coincides with a centroid.
            break;
        }
        let mut target = rng.gen_range(0.0..total);
        let mut chosen = n - 1;
        for (i, d) in min_distances.iter().enumerate() {
            if target < *d {
                chosen = i;
                break;
            }
            target -= d;
        }
        centroids.push(points[chosen].clone());
    }
    centroids
}

/// Mean of assigned points; an empty cluster keeps its previous centroid.
fn compute_centroids(
    points: &[Vec<f32>],
    assignments: &[usize],
    previous: &[Vec<f32>],
) -> Vec<Vec<f32>> {
    let dims = points[0].len();
    let mut sums = vec![vec![0.0f32; dims]; previous.len()];
    let mut counts = vec![0usize; previous.len()];

    for (point, &cluster) in points.iter().zip(assignments) {
        counts[cluster] += 1;
        for (s, x) in sums[cluster].iter_mut().zip(point) {
            *s += x;
        }
    }

    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((mut sum, count), prev)| {
            if count == 0 {
                return prev.clone();
            }
            for s in sum.iter_mut() {
                *s /= count as f32;
            }
            sum
        })
        .collect()
}
