//! Reference arrays and tolerance-based comparison.

use std::path::Path;

use anyhow::Context;
use log::{debug, warn};
use tract_nnef::internal::*;
use tract_nnef::prelude::tract_ndarray::{ArrayD, Dimension};

/// Element-wise closeness: `|a - b| <= atol + rtol * |b|`, `b` being the
/// expected value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Default for Tolerance {
    /// tract's approximate comparison policy.
    fn default() -> Tolerance {
        Tolerance { atol: 5e-4, rtol: 1e-4 }
    }
}

impl Tolerance {
    pub fn new(atol: f32, rtol: f32) -> Tolerance {
        Tolerance { atol, rtol }
    }

    /// Ten machine epsilons, absolute and relative.
    pub fn strict() -> Tolerance {
        Tolerance { atol: 10.0 * f32::EPSILON, rtol: 10.0 * f32::EPSILON }
    }

    pub fn accepts(&self, actual: f32, expected: f32) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return actual.is_nan() && expected.is_nan();
        }
        if actual.is_infinite() || expected.is_infinite() {
            return actual == expected;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }

    /// Compares `actual` against `expected`, failing on shape mismatch or on
    /// any element outside tolerance. Shapes only differing by leading unit
    /// axes match, so a squeezed `(1000,)` reference checks a `(1, 1000)`
    /// output.
    pub fn check(&self, actual: &Tensor, expected: &Tensor) -> TractResult<()> {
        if without_leading_units(actual.shape()) != without_leading_units(expected.shape()) {
            bail!("Shape mismatch {:?} != {:?}", actual.shape(), expected.shape())
        }
        let actual = actual.cast_to::<f32>()?;
        let actual = actual.to_array_view::<f32>()?;
        let expected = expected.cast_to::<f32>()?;
        let expected = expected.to_array_view::<f32>()?;
        let mut first = None;
        let mut mismatches = 0;
        let mut max_diff = 0f32;
        for ((ix, a), b) in actual.indexed_iter().zip(expected.iter()) {
            let diff = (a - b).abs();
            if diff.is_finite() {
                max_diff = max_diff.max(diff);
            }
            if !self.accepts(*a, *b) {
                mismatches += 1;
                first.get_or_insert((ix.slice().to_vec(), *a, *b));
            }
        }
        debug!("Compared {} values, max abs diff {:e}", actual.len(), max_diff);
        if let Some((ix, a, b)) = first {
            bail!(
                "{} of {} values out of tolerance (atol {:e}, rtol {:e}), \
                 first at {:?}: {} != {} (max abs diff {:e})",
                mismatches,
                actual.len(),
                self.atol,
                self.rtol,
                ix,
                a,
                b,
                max_diff
            );
        }
        Ok(())
    }
}

fn without_leading_units(shape: &[usize]) -> &[usize] {
    let units = shape.iter().take_while(|d| **d == 1).count();
    &shape[units..]
}

/// Loads a `.npy` reference array as f32. f64 arrays are narrowed.
pub fn load_reference(path: impl AsRef<Path>) -> TractResult<Tensor> {
    let path = path.as_ref();
    if !path.exists() {
        bail!("Reference array not found: {:?}", path);
    }
    match ndarray_npy::read_npy::<_, ArrayD<f32>>(path) {
        Ok(array) => Ok(array.into()),
        Err(f32_err) => {
            let array = ndarray_npy::read_npy::<_, ArrayD<f64>>(path)
                .map_err(|_| f32_err)
                .with_context(|| format!("Reading reference array {path:?}"))?;
            warn!("{:?} holds f64 values, narrowing to f32", path);
            Ok(array.mapv(|x| x as f32).into())
        }
    }
}
