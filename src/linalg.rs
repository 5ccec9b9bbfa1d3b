//! Thin wrappers around the complex linear-algebra backend.
//!
//! The front-end components only need a handful of dense operations on small
//! Hermitian matrices: eigendecomposition, Cholesky factorization with
//! forward/backward triangular solves, and Hermitian symmetrization. These are
//! delegated to `nalgebra` and applied independently per (batch, frequency)
//! subproblem; with the `parallel` feature the independent subproblems are
//! fanned out across a rayon pool.

use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use ndarray::ArrayView2;
use num_complex::Complex64;

use crate::error::{FrontendError, FrontendResult};

/// Copies a two-dimensional complex array view into a dense nalgebra matrix.
pub(crate) fn to_dmatrix(view: ArrayView2<'_, Complex64>) -> DMatrix<Complex64> {
    DMatrix::from_fn(view.nrows(), view.ncols(), |i, j| view[[i, j]])
}

/// Returns the Hermitian part of a square matrix, `(A + A^H) / 2`.
pub(crate) fn hermitian_part(m: &DMatrix<Complex64>) -> DMatrix<Complex64> {
    (m.adjoint() + m) * Complex64::new(0.5, 0.0)
}

/// Eigendecomposition of a Hermitian matrix.
///
/// Returns real eigenvalues and the corresponding eigenvectors as columns.
pub(crate) fn hermitian_eigh(
    m: DMatrix<Complex64>,
) -> FrontendResult<(DVector<f64>, DMatrix<Complex64>)> {
    let eig = SymmetricEigen::try_new(m, f64::EPSILON, 0).ok_or_else(|| {
        FrontendError::Numerical("Hermitian eigendecomposition did not converge".to_string())
    })?;
    Ok((eig.eigenvalues, eig.eigenvectors))
}

/// Solves `A * X = B` for a Hermitian positive-definite `A` via Cholesky
/// factorization followed by forward and backward triangular substitution.
///
/// The complex factorization takes square roots of negative pivots instead of
/// failing, so positive-definiteness is verified on the diagonal of the
/// factor: every pivot must be real and positive.
pub(crate) fn solve_hermitian(
    a: DMatrix<Complex64>,
    b: &DMatrix<Complex64>,
) -> FrontendResult<DMatrix<Complex64>> {
    let chol = Cholesky::new(a).ok_or_else(|| {
        FrontendError::Numerical(
            "Cholesky factorization failed: matrix is not positive definite".to_string(),
        )
    })?;
    let lower = chol.l();
    for d in 0..lower.nrows() {
        let pivot = lower[(d, d)];
        if pivot.re <= 0.0 || pivot.im.abs() > pivot.re * 1e-8 {
            return Err(FrontendError::Numerical(
                "Cholesky factorization failed: matrix is not positive definite".to_string(),
            ));
        }
    }
    let y = lower.solve_lower_triangular(b).ok_or_else(|| {
        FrontendError::Numerical("Forward substitution failed on a singular factor".to_string())
    })?;
    let x = lower.adjoint().solve_upper_triangular(&y).ok_or_else(|| {
        FrontendError::Numerical("Backward substitution failed on a singular factor".to_string())
    })?;
    Ok(x)
}

/// Maps a fallible kernel over a batch of independent subproblems.
///
/// Results are returned in input order; the first error aborts the batch.
#[cfg(feature = "parallel")]
pub(crate) fn batch_map<I, T, F>(items: Vec<I>, kernel: F) -> FrontendResult<Vec<T>>
where
    I: Send,
    T: Send,
    F: Fn(I) -> FrontendResult<T> + Sync + Send,
{
    use rayon::prelude::*;
    items.into_par_iter().map(kernel).collect()
}

/// Maps a fallible kernel over a batch of independent subproblems.
///
/// Results are returned in input order; the first error aborts the batch.
#[cfg(not(feature = "parallel"))]
pub(crate) fn batch_map<I, T, F>(items: Vec<I>, kernel: F) -> FrontendResult<Vec<T>>
where
    I: Send,
    T: Send,
    F: Fn(I) -> FrontendResult<T> + Sync + Send,
{
    items.into_iter().map(kernel).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx_eq::assert_approx_eq;

    fn hermitian_2x2() -> DMatrix<Complex64> {
        // [[2, i], [-i, 2]], eigenvalues 1 and 3
        DMatrix::from_row_slice(
            2,
            2,
            &[
                Complex64::new(2.0, 0.0),
                Complex64::new(0.0, 1.0),
                Complex64::new(0.0, -1.0),
                Complex64::new(2.0, 0.0),
            ],
        )
    }

    #[test]
    fn test_hermitian_eigh_known_spectrum() {
        let (eigenvalues, eigenvectors) = hermitian_eigh(hermitian_2x2()).unwrap();
        let mut sorted: Vec<f64> = eigenvalues.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_approx_eq!(sorted[0], 1.0, 1e-10);
        assert_approx_eq!(sorted[1], 3.0, 1e-10);

        // A v = lambda v for each eigenpair
        let a = hermitian_2x2();
        for k in 0..2 {
            let v = eigenvectors.column(k).into_owned();
            let av = &a * &v;
            let lv = &v * Complex64::new(eigenvalues[k], 0.0);
            for i in 0..2 {
                assert_approx_eq!((av[i] - lv[i]).norm(), 0.0, 1e-10);
            }
        }
    }

    #[test]
    fn test_solve_hermitian_known_solution() {
        let b = DMatrix::from_row_slice(2, 1, &[Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)]);
        let x = solve_hermitian(hermitian_2x2(), &b).unwrap();
        // inv(A) * e0 = [2/3, i/3]
        assert_approx_eq!((x[(0, 0)] - Complex64::new(2.0 / 3.0, 0.0)).norm(), 0.0, 1e-12);
        assert_approx_eq!((x[(1, 0)] - Complex64::new(0.0, 1.0 / 3.0)).norm(), 0.0, 1e-12);
    }

    #[test]
    fn test_solve_hermitian_rejects_indefinite() {
        let a = DMatrix::from_row_slice(
            2,
            2,
            &[
                Complex64::new(-1.0, 0.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(-1.0, 0.0),
            ],
        );
        let b = DMatrix::from_element(2, 1, Complex64::new(1.0, 0.0));
        assert!(matches!(
            solve_hermitian(a, &b),
            Err(FrontendError::Numerical(_))
        ));
    }

    #[test]
    fn test_solve_hermitian_rejects_indefinite_with_positive_pivot() {
        // [[1, 2], [2, 1]] has eigenvalues 3 and -1: the first pivot is
        // positive, the second one is the complex square root of -3
        let a = DMatrix::from_row_slice(
            2,
            2,
            &[
                Complex64::new(1.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(1.0, 0.0),
            ],
        );
        let b = DMatrix::from_element(2, 1, Complex64::new(1.0, 0.0));
        assert!(matches!(
            solve_hermitian(a, &b),
            Err(FrontendError::Numerical(_))
        ));
    }

    #[test]
    fn test_hermitian_part() {
        let m = DMatrix::from_row_slice(
            2,
            2,
            &[
                Complex64::new(1.0, 0.5),
                Complex64::new(2.0, 1.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(3.0, -0.5),
            ],
        );
        let h = hermitian_part(&m);
        for i in 0..2 {
            for j in 0..2 {
                assert_approx_eq!((h[(i, j)] - h[(j, i)].conj()).norm(), 0.0, 1e-12);
            }
        }
    }
}
