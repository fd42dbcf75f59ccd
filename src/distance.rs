//! Distance kernels vectorized with `wide::f32x8`, with scalar tails for
//! lengths that are not a multiple of eight.

use wide::f32x8;

use crate::error::{Error, Result};

/// Distance metric of an index.
///
/// Angular requires vectors to be L2-normalized; the builder and searcher
/// normalize on insertion and query. Dot stores vectors as provided and
/// ranks by negated inner product internally, so that a smaller distance
/// always means a better match.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Metric {
    /// `1 - a·b` over unit vectors.
    Angular,
    /// Squared euclidean distance.
    L2,
    /// Negated inner product.
    Dot,
}

impl Metric {
    /// Parse a metric name as accepted by index constructors.
    pub fn parse(name: &str) -> Result<Metric> {
        match name {
            "angular" => Ok(Metric::Angular),
            "L2" | "l2" | "euclidean" => Ok(Metric::L2),
            "dot" => Ok(Metric::Dot),
            other => Err(Error::config(format!("unknown distance metric: {other}"))),
        }
    }

    /// Wire code used in the model header.
    pub(crate) fn code(self) -> i32 {
        match self {
            Metric::Angular => 0,
            Metric::L2 => 1,
            Metric::Dot => 2,
        }
    }

    pub(crate) fn from_code(code: i32) -> Option<Metric> {
        match code {
            0 => Some(Metric::Angular),
            1 => Some(Metric::L2),
            2 => Some(Metric::Dot),
            _ => None,
        }
    }

    pub(crate) fn needs_normalization(self) -> bool {
        matches!(self, Metric::Angular)
    }

    /// Distance between two vectors of the same dimension.
    #[inline]
    pub(crate) fn evaluate(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Angular => angular_distance(a, b),
            Metric::L2 => squared_l2_distance(a, b),
            Metric::Dot => dot_distance(a, b),
        }
    }
}

#[inline]
fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let dim = a.len();
    let chunks = dim / 8;
    let mut sum = f32x8::ZERO;
    for i in 0..chunks {
        let offset = i * 8;
        let va = f32x8::from(&a[offset..offset + 8]);
        let vb = f32x8::from(&b[offset..offset + 8]);
        sum = va.mul_add(vb, sum);
    }

    let mut result: f32 = sum.to_array().iter().sum();
    for i in chunks * 8..dim {
        result += a[i] * b[i];
    }
    result
}

/// `sum((a[i] - b[i])^2)`; the square root is never taken.
pub fn squared_l2_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }

    let dim = a.len();
    let chunks = dim / 8;
    let mut sum = f32x8::ZERO;
    for i in 0..chunks {
        let offset = i * 8;
        let va = f32x8::from(&a[offset..offset + 8]);
        let vb = f32x8::from(&b[offset..offset + 8]);
        let diff = va - vb;
        sum = diff.mul_add(diff, sum);
    }

    let mut result: f32 = sum.to_array().iter().sum();
    for i in chunks * 8..dim {
        let diff = a[i] - b[i];
        result += diff * diff;
    }
    result
}

/// `1 - a·b`, assuming both inputs are already L2-normalized.
pub fn angular_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    1.0 - inner_product(a, b)
}

/// `-(a·b)`, so that smaller means more similar.
pub fn dot_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    -inner_product(a, b)
}

/// Scale `v` to unit L2 norm in place. The zero vector is left unchanged.
pub fn normalize_in_place(v: &mut [f32]) {
    let norm_sq = inner_product(v, v);
    if norm_sq != 0.0 {
        let inv = 1.0 / norm_sq.sqrt();
        for x in v.iter_mut() {
            *x *= inv;
        }
    }
}
