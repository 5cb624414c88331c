//! Distance metrics for dense vectors.
//!
//! A single, shared definition of the dense metrics the index supports.
//! All kernels return a value where *smaller means closer*, so inner product
//! is negated. L2 is squared: the square root is monotone and never needed
//! for ordering.

use serde::{Deserialize, Serialize};

/// Pure distance function over two equal-length vectors.
///
/// This is the seam the NN-descent builder consumes; callers rely on
/// ordering consistency only.
pub type DistanceFunc = fn(&[f32], &[f32]) -> f32;

/// Distance metric for dense vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Squared Euclidean (L2) distance.
    L2,
    /// Inner product distance, negated dot product (for MIPS).
    InnerProduct,
    /// Cosine distance `1 - cos(a, b)`.
    Cosine,
}

impl DistanceMetric {
    /// Compute distance between two vectors.
    ///
    /// If dimensions mismatch, returns `f32::INFINITY` so the pair is never
    /// selected as a nearest neighbor.
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        self.kernel()(a, b)
    }

    /// The raw kernel for this metric.
    #[inline]
    #[must_use]
    pub fn kernel(self) -> DistanceFunc {
        match self {
            DistanceMetric::L2 => l2_distance_squared,
            DistanceMetric::InnerProduct => inner_product_distance,
            DistanceMetric::Cosine => cosine_distance,
        }
    }

    /// Stable id used in the serialized stream.
    #[must_use]
    pub fn wire_id(self) -> u32 {
        match self {
            DistanceMetric::L2 => 0,
            DistanceMetric::InnerProduct => 1,
            DistanceMetric::Cosine => 2,
        }
    }

    /// Inverse of [`DistanceMetric::wire_id`].
    #[must_use]
    pub fn from_wire_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(DistanceMetric::L2),
            1 => Some(DistanceMetric::InnerProduct),
            2 => Some(DistanceMetric::Cosine),
            _ => None,
        }
    }
}

/// Dot product of two vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm of a vector.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Squared L2 distance (faster when only comparing distances).
#[inline]
#[must_use]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Inner product distance (negative dot product).
#[inline]
#[must_use]
pub fn inner_product_distance(a: &[f32], b: &[f32]) -> f32 {
    -dot(a, b)
}

/// Cosine distance `1 - cos(a, b)`.
///
/// Computes norms, so it does **not** require pre-normalized inputs. Zero
/// vectors get distance 1.0 against everything.
#[inline]
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    const NORM_EPSILON: f32 = 1e-9;
    let na = norm(a);
    let nb = norm(b);
    if na > NORM_EPSILON && nb > NORM_EPSILON {
        1.0 - (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
    } else {
        1.0
    }
}
