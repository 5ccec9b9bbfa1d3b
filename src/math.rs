//! Scalar and array helpers shared by the front-end components.
//!
//! Mask thresholds are configured in decibels and converted once to linear
//! magnitude at construction time via [`db_to_mag`]. Length masking is
//! implemented as a pure function returning a new array, so all core
//! computations stay side-effect free; applying the length mask twice yields
//! the same result as applying it once.

use std::f64::consts::PI;

use ndarray::{Array3, Array4, s};
use num_traits::Zero;

use crate::error::{FrontendError, FrontendResult};

/// Converts a value in decibels to linear magnitude, `10^(db / 20)`.
///
/// # Examples
///
/// ```rust
/// use farfield::db_to_mag;
///
/// assert_eq!(db_to_mag(0.0), 1.0);
/// assert!((db_to_mag(-20.0) - 0.1).abs() < 1e-12);
/// ```
pub fn db_to_mag(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Wraps an angle in radians to the interval (−π, π].
///
/// # Examples
///
/// ```rust
/// use std::f64::consts::PI;
/// use farfield::wrap_to_pi;
///
/// assert!((wrap_to_pi(3.0 * PI) - PI).abs() < 1e-12);
/// assert!((wrap_to_pi(-0.5 * PI) + 0.5 * PI).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(2.0 * PI);
    if wrapped > PI { wrapped - 2.0 * PI } else { wrapped }
}

/// Clamps every element of a mask to the `[mask_min, mask_max]` range.
///
/// # Panics
///
/// Panics if `mask_min > mask_max`. Components validate their threshold pair
/// at construction, so this cannot be reached through the public contract.
pub fn threshold_mask(mask: &Array4<f64>, mask_min: f64, mask_max: f64) -> Array4<f64> {
    mask.mapv(|v| v.clamp(mask_min, mask_max))
}

/// Returns a copy of a batched (B, ..., T) array with all frames at or beyond
/// the per-batch valid length set to zero.
///
/// The first axis is the batch axis and the last axis is the time axis.
/// Lengths greater than the number of frames leave the item untouched.
pub fn mask_invalid_frames4<A>(x: &Array4<A>, lengths: &[usize]) -> FrontendResult<Array4<A>>
where
    A: Clone + Zero,
{
    let (batch_size, _, _, num_frames) = x.dim();
    validate_lengths(batch_size, lengths)?;

    let mut out = x.clone();
    for (b, &len) in lengths.iter().enumerate() {
        if len < num_frames {
            out.slice_mut(s![b, .., .., len..]).fill(A::zero());
        }
    }
    Ok(out)
}

/// Three-dimensional variant of [`mask_invalid_frames4`] for (B, F, T) arrays.
pub fn mask_invalid_frames3<A>(x: &Array3<A>, lengths: &[usize]) -> FrontendResult<Array3<A>>
where
    A: Clone + Zero,
{
    let (batch_size, _, num_frames) = x.dim();
    validate_lengths(batch_size, lengths)?;

    let mut out = x.clone();
    for (b, &len) in lengths.iter().enumerate() {
        if len < num_frames {
            out.slice_mut(s![b, .., len..]).fill(A::zero());
        }
    }
    Ok(out)
}

fn validate_lengths(batch_size: usize, lengths: &[usize]) -> FrontendResult<()> {
    if lengths.len() != batch_size {
        return Err(FrontendError::Shape(format!(
            "Expected {} length entries to match the batch size, got {}",
            batch_size,
            lengths.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx_eq::assert_approx_eq;
    use ndarray::Array4;

    #[test]
    fn test_db_to_mag() {
        assert_approx_eq!(db_to_mag(0.0), 1.0, 1e-12);
        assert_approx_eq!(db_to_mag(-200.0), 1e-10, 1e-20);
        assert_approx_eq!(db_to_mag(20.0), 10.0, 1e-10);
    }

    #[test]
    fn test_wrap_to_pi_boundaries() {
        // PI maps to itself, -PI wraps to the closed end of the interval
        assert_approx_eq!(wrap_to_pi(PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(0.0), 0.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(2.5 * PI), 0.5 * PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-2.5 * PI), -0.5 * PI, 1e-12);
    }

    #[test]
    fn test_threshold_mask_range() {
        let mask = Array4::from_shape_fn((1, 1, 2, 3), |(_, _, f, t)| (f + t) as f64 - 1.0);
        let clamped = threshold_mask(&mask, 1e-10, 1.0);
        for &v in clamped.iter() {
            assert!((1e-10..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_mask_invalid_frames_idempotent() {
        let x = Array4::from_shape_fn((2, 1, 2, 4), |(b, _, f, t)| (b + f + t) as f64 + 1.0);
        let lengths = [2, 4];

        let once = mask_invalid_frames4(&x, &lengths).unwrap();
        let twice = mask_invalid_frames4(&once, &lengths).unwrap();
        assert_eq!(once, twice);

        // Frames beyond the valid length are zero, valid frames untouched
        assert_eq!(once[[0, 0, 0, 2]], 0.0);
        assert_eq!(once[[0, 0, 1, 3]], 0.0);
        assert_eq!(once[[0, 0, 0, 1]], x[[0, 0, 0, 1]]);
        assert_eq!(once[[1, 0, 0, 3]], x[[1, 0, 0, 3]]);
    }

    #[test]
    fn test_mask_invalid_frames_length_mismatch() {
        let x = Array4::<f64>::zeros((2, 1, 2, 4));
        assert!(matches!(
            mask_invalid_frames4(&x, &[2]),
            Err(FrontendError::Shape(_))
        ));
    }
}
