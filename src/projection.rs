//! Dimensionality reduction to 2D.

/// Maps high-dimensional vectors onto the plane.
pub trait Projector: Send + Sync {
    fn name(&self) -> &str;

    /// One point per input vector, in input order.
    fn project(&self, vectors: &[Vec<f32>]) -> Vec<[f32; 2]>;
}

/// Projection onto the top two principal components.
///
/// Components are found by power iteration on the centred data, with a fixed
/// start vector and a sign convention, so the output is deterministic.
pub struct PcaProjector {
    pub iterations: usize,
}

impl Default for PcaProjector {
    fn default() -> Self {
        Self { iterations: 100 }
    }
}

impl Projector for PcaProjector {
    fn name(&self) -> &str {
        "pca"
    }

    fn project(&self, vectors: &[Vec<f32>]) -> Vec<[f32; 2]> {
        let n = vectors.len();
        if n == 0 {
            return Vec::new();
        }
        let dims = vectors[0].len();
        if n == 1 || dims == 0 {
            return vec![[0.0, 0.0]; n];
        }

        let mut mean = vec![0.0f64; dims];
        for v in vectors {
            for (m, x) in mean.iter_mut().zip(v) {
                *m += f64::from(*x);
            }
        }
        for m in mean.iter_mut() {
            *m /= n as f64;
        }
        let centred: Vec<Vec<f64>> = vectors
            .iter()
            .map(|v| v.iter().zip(&mean).map(|(x, m)| f64::from(*x) - m).collect())
            .collect();

        let first = principal_component(&centred, &[], self.iterations);
        let second = principal_component(&centred, std::slice::from_ref(&first), self.iterations);

        centred
            .iter()
            .map(|row| [dot(row, &first) as f32, dot(row, &second) as f32])
            .collect()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn unit(v: &mut [f64]) -> bool {
    let norm = dot(v, v).sqrt();
    if norm < 1e-12 {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

fn orthogonalise(v: &mut [f64], basis: &[Vec<f64>]) {
    for b in basis {
        let p = dot(v, b);
        for (x, y) in v.iter_mut().zip(b) {
            *x -= p * y;
        }
    }
}

/// Dominant eigenvector of `XᵀX` orthogonal to `basis`; zero if none exists.
fn principal_component(rows: &[Vec<f64>], basis: &[Vec<f64>], iterations: usize) -> Vec<f64> {
    let dims = rows[0].len();
    // Fixed, non-degenerate start vector.
    let mut v: Vec<f64> = (0..dims).map(|i| 1.0 + (i as f64 * 0.618).fract()).collect();
    orthogonalise(&mut v, basis);
    if !unit(&mut v) {
        return vec![0.0; dims];
    }

    for _ in 0..iterations.max(1) {
        let mut next = vec![0.0f64; dims];
        for row in rows {
            let p = dot(row, &v);
            for (n, x) in next.iter_mut().zip(row) {
                *n += p * x;
            }
        }
        orthogonalise(&mut next, basis);
        if !unit(&mut next) {
            return vec![0.0; dims];
        }
        v = next;
    }

    // Sign convention: largest-magnitude coordinate is positive.
    let pivot = v
        .iter()
        .copied()
        .fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        for x in v.iter_mut() {
            *x = -*x;
        }
    }
    v
}

/// Scale each axis independently into `[-1, 1]` by its largest magnitude.
pub fn normalize_unit_square(points: &mut [[f32; 2]]) {
    for axis in 0..2 {
        let max = points.iter().map(|p| p[axis].abs()).fold(0.0f32, f32::max);
        for p in points.iter_mut() {
            p[axis] = if max > f32::EPSILON { p[axis] / max } else { 0.0 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_projects_onto_first_axis() {
        let vectors: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32, 2.0 * i as f32, 0.0]).collect();
        let points = PcaProjector::default().project(&vectors);
        let xs: Vec<f32> = points.iter().map(|p| p[0]).collect();
        assert!(xs.windows(2).all(|w| w[0] < w[1]));
        assert!(points.iter().all(|p| p[1].abs() < 1e-3));
    }

    #[test]
    fn degenerate_inputs() {
        let projector = PcaProjector::default();
        assert!(projector.project(&[]).is_empty());
        assert_eq!(projector.project(&[vec![1.0, 2.0]]), vec![[0.0, 0.0]]);
        let same = vec![vec![1.0, 1.0]; 3];
        assert_eq!(projector.project(&same), vec![[0.0, 0.0]; 3]);
    }

    #[test]
    fn deterministic() {
        let vectors = vec![vec![0.1, 0.9, 0.3], vec![0.5, 0.2, 0.7], vec![0.9, 0.4, 0.1]];
        let projector = PcaProjector::default();
        assert_eq!(projector.project(&vectors), projector.project(&vectors));
    }

    #[test]
    fn unit_square_bounds() {
        let mut points = vec![[4.0, -1.0], [-2.0, 0.5], [0.0, 0.0]];
        normalize_unit_square(&mut points);
        assert_eq!(points[0], [1.0, -1.0]);
        assert_eq!(points[1], [-0.5, 0.5]);
    }
}
