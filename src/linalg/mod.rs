//! Small dense linear-algebra seam used by the fitter and the bundle executive.
//!
//! Normal equations are assembled as [`SymmetricMatrix`]/[`Vector`] (plain
//! `nalgebra` dynamic types) and solved through the functions here, which refuse
//! to divide by a near-zero pivot: a rank-deficient system is reported as
//! [`LinAlgError::RankDeficient`] instead of producing NaN or huge corrections.

use nalgebra::{DMatrix, DVector};

/// Symmetric positive (semi-)definite matrix, stored densely.
pub type SymmetricMatrix = DMatrix<f64>;

/// Column vector.
pub type Vector = DVector<f64>;

/// Relative eigenvalue threshold below which a direction is considered null.
pub const DEFAULT_RANK_TOLERANCE: f64 = 1e-12;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LinAlgError {
    #[error("Rank deficient system: rank {rank} of {size}")]
    RankDeficient { rank: usize, size: usize },
    #[error("Matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Matrix contains non-finite values")]
    NonFinite,
}

/// Eigen-decomposition of a symmetric matrix with its numerical rank.
#[derive(Debug, Clone)]
pub struct SymmetricDecomposition {
    pub eigenvalues: Vector,
    pub eigenvectors: DMatrix<f64>,
    pub rank: usize,
    threshold: f64,
}

impl SymmetricDecomposition {
    pub fn size(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn is_full_rank(&self) -> bool {
        self.rank == self.size()
    }

    /// Ratio of the largest to the smallest retained eigenvalue.
    pub fn condition_number(&self) -> f64 {
        let retained: Vec<f64> = self
            .eigenvalues
            .iter()
            .copied()
            .filter(|v| *v > self.threshold)
            .collect();
        let max = retained.iter().copied().fold(0.0, f64::max);
        let min = retained.iter().copied().fold(f64::INFINITY, f64::min);
        if retained.is_empty() {
            f64::INFINITY
        } else {
            max / min
        }
    }

    /// Moore-Penrose pseudo-inverse restricted to the retained eigen-directions.
    pub fn pseudo_inverse(&self) -> DMatrix<f64> {
        let n = self.size();
        let mut inv = DMatrix::zeros(n, n);
        for (k, lambda) in self.eigenvalues.iter().enumerate() {
            if *lambda <= self.threshold {
                continue;
            }
            let v = self.eigenvectors.column(k);
            inv += (v * v.transpose()) / *lambda;
        }
        inv
    }

    /// Minimum-norm solution of `A x = b`.
    pub fn solve(&self, b: &Vector) -> Result<Vector, LinAlgError> {
        if b.len() != self.size() {
            return Err(LinAlgError::DimensionMismatch {
                expected: self.size(),
                found: b.len(),
            });
        }
        Ok(self.pseudo_inverse() * b)
    }

    /// Unit vectors spanning the numerical null space.
    pub fn null_space(&self) -> Vec<Vector> {
        self.eigenvalues
            .iter()
            .enumerate()
            .filter(|(_, lambda)| **lambda <= self.threshold)
            .map(|(k, _)| self.eigenvectors.column(k).into_owned())
            .collect()
    }
}

fn check_square(a: &SymmetricMatrix) -> Result<(), LinAlgError> {
    if a.nrows() != a.ncols() {
        return Err(LinAlgError::DimensionMismatch {
            expected: a.nrows(),
            found: a.ncols(),
        });
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(LinAlgError::NonFinite);
    }
    Ok(())
}

/// Averages `a` with its transpose to remove assembly round-off asymmetry.
pub fn symmetrize(a: &SymmetricMatrix) -> SymmetricMatrix {
    (a + a.transpose()) * 0.5
}

/// Decomposes a symmetric matrix and determines its numerical rank.
///
/// Eigenvalues at or below `relative_tolerance * max|lambda|` count as zero.
/// Clearly negative eigenvalues mean the input is not a valid normal matrix.
pub fn decompose_symmetric(
    a: &SymmetricMatrix,
    relative_tolerance: f64,
) -> Result<SymmetricDecomposition, LinAlgError> {
    check_square(a)?;
    let n = a.nrows();
    if n == 0 {
        return Ok(SymmetricDecomposition {
            eigenvalues: Vector::zeros(0),
            eigenvectors: DMatrix::zeros(0, 0),
            rank: 0,
            threshold: 0.0,
        });
    }
    let eigen = symmetrize(a).symmetric_eigen();
    let max_abs = eigen.eigenvalues.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let threshold = (relative_tolerance * max_abs).max(f64::MIN_POSITIVE);
    if eigen.eigenvalues.iter().any(|v| *v < -threshold * 1e3) {
        return Err(LinAlgError::NotPositiveDefinite);
    }
    let rank = eigen.eigenvalues.iter().filter(|v| **v > threshold).count();
    Ok(SymmetricDecomposition {
        eigenvalues: eigen.eigenvalues,
        eigenvectors: eigen.eigenvectors,
        rank,
        threshold,
    })
}

/// Solves `A x = b` for symmetric positive definite `A`.
///
/// Cholesky is tried first; on failure the eigen-decomposition decides whether
/// the system is rank deficient (error) or merely ill-conditioned (solved).
pub fn solve_symmetric(
    a: &SymmetricMatrix,
    b: &Vector,
    relative_tolerance: f64,
) -> Result<Vector, LinAlgError> {
    check_square(a)?;
    if b.len() != a.nrows() {
        return Err(LinAlgError::DimensionMismatch {
            expected: a.nrows(),
            found: b.len(),
        });
    }
    let decomposition = decompose_symmetric(a, relative_tolerance)?;
    if !decomposition.is_full_rank() {
        return Err(LinAlgError::RankDeficient {
            rank: decomposition.rank,
            size: decomposition.size(),
        });
    }
    if let Some(chol) = symmetrize(a).cholesky() {
        return Ok(chol.solve(b));
    }
    decomposition.solve(b)
}

/// Inverts a symmetric positive definite matrix, rejecting rank-deficient input.
pub fn invert_symmetric(
    a: &SymmetricMatrix,
    relative_tolerance: f64,
) -> Result<SymmetricMatrix, LinAlgError> {
    let decomposition = decompose_symmetric(a, relative_tolerance)?;
    if !decomposition.is_full_rank() {
        return Err(LinAlgError::RankDeficient {
            rank: decomposition.rank,
            size: decomposition.size(),
        });
    }
    if let Some(chol) = symmetrize(a).cholesky() {
        return Ok(chol.inverse());
    }
    Ok(decomposition.pseudo_inverse())
}

/// Solves the (possibly overdetermined) system `J x ≈ r` in the least-squares sense via SVD.
pub fn solve_least_squares(
    j: &DMatrix<f64>,
    r: &Vector,
    relative_tolerance: f64,
) -> Result<Vector, LinAlgError> {
    if j.nrows() != r.len() {
        return Err(LinAlgError::DimensionMismatch {
            expected: j.nrows(),
            found: r.len(),
        });
    }
    if j.iter().any(|v| !v.is_finite()) || r.iter().any(|v| !v.is_finite()) {
        return Err(LinAlgError::NonFinite);
    }
    let svd = j.clone().svd(true, true);
    let max_sv = svd.singular_values.iter().fold(0.0_f64, |m, v| m.max(*v));
    let eps = (relative_tolerance * max_sv).max(f64::MIN_POSITIVE);
    let rank = svd.singular_values.iter().filter(|v| **v > eps).count();
    if rank < j.ncols() {
        return Err(LinAlgError::RankDeficient {
            rank,
            size: j.ncols(),
        });
    }
    svd.solve(r, eps)
        .map_err(|_| LinAlgError::RankDeficient {
            rank,
            size: j.ncols(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_solve_well_conditioned() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 0.5, 0.0, 0.5, 2.0]);
        let x = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let b = &a * &x;
        let solved = solve_symmetric(&a, &b, DEFAULT_RANK_TOLERANCE).unwrap();
        assert_relative_eq!(solved, x, epsilon = 1e-12);

        let inv = invert_symmetric(&a, DEFAULT_RANK_TOLERANCE).unwrap();
        assert_relative_eq!(&inv * &a, DMatrix::identity(3, 3), epsilon = 1e-12);
    }

    #[test]
    fn test_rank_deficiency_is_reported() {
        // Second column is twice the first.
        let j = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, -1.0, -2.0]);
        let a = j.transpose() * &j;
        let b = DVector::from_vec(vec![1.0, 2.0]);
        match solve_symmetric(&a, &b, DEFAULT_RANK_TOLERANCE) {
            Err(LinAlgError::RankDeficient { rank, size }) => {
                assert_eq!(rank, 1);
                assert_eq!(size, 2);
            }
            other => panic!("expected rank deficiency, got {other:?}"),
        }
        let decomposition = decompose_symmetric(&a, DEFAULT_RANK_TOLERANCE).unwrap();
        let null = decomposition.null_space();
        assert_eq!(null.len(), 1);
        assert_relative_eq!((&a * &null[0]).norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_indefinite_matrix_rejected() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        assert_eq!(
            decompose_symmetric(&a, DEFAULT_RANK_TOLERANCE).unwrap_err(),
            LinAlgError::NotPositiveDefinite
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = DMatrix::identity(2, 2);
        let b = DVector::zeros(3);
        assert!(matches!(
            solve_symmetric(&a, &b, DEFAULT_RANK_TOLERANCE),
            Err(LinAlgError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_least_squares_line_fit() {
        let j = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let r = DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0]);
        let x = solve_least_squares(&j, &r, 1e-12).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-10);
    }
}
