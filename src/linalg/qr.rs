use faer::{
    Mat,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Qr, SymbolicQr},
};

use crate::linalg::{
    LinAlgError, LinAlgResult, SparseLinearSolver, build_regularized_normal_equations,
    sparse::SparseMatrix,
};

/// Sparse QR backend for the regularized normal equations.
///
/// Slower than [`super::SparseCholeskySolver`] but does not require the
/// normal matrix to be positive definite, which makes it the safer choice
/// when the regularization is tiny compared to the Jacobian scale.
#[derive(Debug, Clone)]
pub struct SparseQRSolver {
    /// Cached symbolic factorization for reuse across iterations.
    ///
    /// Only rebuilt when the sparsity pattern of the normal matrix changes.
    symbolic_factorization: Option<SymbolicQr<usize>>,
    cached_pattern: Option<Vec<(usize, usize)>>,
}

impl SparseQRSolver {
    pub fn new() -> Self {
        SparseQRSolver {
            symbolic_factorization: None,
            cached_pattern: None,
        }
    }

    fn symbolic_for(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<SymbolicQr<usize>> {
        let pattern = matrix.sparsity_pattern();
        if let (Some(cached_sym), Some(cached_pattern)) =
            (&self.symbolic_factorization, &self.cached_pattern)
            && *cached_pattern == pattern
        {
            return Ok(cached_sym.clone());
        }

        let new_sym = SymbolicQr::try_new(matrix.symbolic()).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic QR decomposition failed".to_string())
                .log_with_source(e)
        })?;
        self.symbolic_factorization = Some(new_sym.clone());
        self.cached_pattern = Some(pattern);
        Ok(new_sym)
    }
}

impl Default for SparseQRSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseLinearSolver for SparseQRSolver {
    fn solve_regularized(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) =
            build_regularized_normal_equations(jacobian, residuals, diagonal)?;
        let sym = self.symbolic_for(&hessian)?;

        let qr = Qr::try_new_with_symbolic(sym, hessian.as_ref()).map_err(|e| {
            LinAlgError::FactorizationFailed("QR factorization failed".to_string())
                .log_with_source(e)
        })?;

        // A rank-deficient R yields Inf/NaN instead of an error
        let step = qr.solve(-&gradient);
        if !step.is_all_finite() {
            return Err(LinAlgError::NonFiniteSolution.log());
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::sparse::Triplet;

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_data()
    -> Result<(SparseColMat<usize, f64>, Mat<f64>), faer::sparse::CreationError> {
        let triplets = vec![
            Triplet::new(0, 0, 2.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 3.0),
            Triplet::new(1, 2, 1.0),
            Triplet::new(2, 1, 1.0),
            Triplet::new(2, 2, 2.0),
            Triplet::new(3, 0, 1.5),
            Triplet::new(3, 2, 0.5),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(4, 3, &triplets)?;
        let residuals = Mat::from_fn(4, 1, |i, _| [1.0, -2.0, 0.5, 1.2][i]);
        Ok((jacobian, residuals))
    }

    #[test]
    fn test_qr_solver_creation() {
        let solver = SparseQRSolver::new();
        assert!(solver.symbolic_factorization.is_none());
        assert!(SparseQRSolver::default().cached_pattern.is_none());
    }

    #[test]
    fn test_qr_matches_cholesky() -> TestResult {
        let (jacobian, residuals) = create_test_data()?;
        let diagonal = Mat::from_fn(3, 1, |i, _| 0.05 * (i + 1) as f64);

        let mut qr = SparseQRSolver::new();
        let mut llt = super::super::SparseCholeskySolver::new();

        for d in [None, Some(&diagonal)] {
            let a = qr.solve_regularized(&jacobian, &residuals, d)?;
            let b = llt.solve_regularized(&jacobian, &residuals, d)?;
            for i in 0..3 {
                assert!(
                    (a[(i, 0)] - b[(i, 0)]).abs() < 1e-8,
                    "component {i}: qr {} vs llt {}",
                    a[(i, 0)],
                    b[(i, 0)]
                );
            }
        }
        Ok(())
    }

    /// The gradient of the regularized model vanishes at the QR solution
    #[test]
    fn test_qr_solution_is_stationary() -> TestResult {
        let (jacobian, residuals) = create_test_data()?;
        let diagonal = Mat::from_fn(3, 1, |_, _| 0.3);
        let mut solver = SparseQRSolver::new();
        let step = solver.solve_regularized(&jacobian, &residuals, Some(&diagonal))?;

        let mut model_residual = residuals.clone();
        jacobian.right_multiply(&step, &mut model_residual);
        let mut grad = Mat::zeros(3, 1);
        jacobian.left_multiply(&model_residual, &mut grad);
        for i in 0..3 {
            grad[(i, 0)] += 0.09 * step[(i, 0)];
        }
        assert!(grad.norm_l2() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_qr_symbolic_caching() -> TestResult {
        let (jacobian, residuals) = create_test_data()?;
        let diagonal = Mat::from_fn(3, 1, |_, _| 1e-2);
        let mut solver = SparseQRSolver::new();

        let sol1 = solver.solve_regularized(&jacobian, &residuals, Some(&diagonal))?;
        let pattern = solver.cached_pattern.clone();
        assert!(pattern.is_some());

        let sol2 = solver.solve_regularized(&jacobian, &residuals, Some(&diagonal))?;
        assert_eq!(pattern, solver.cached_pattern);
        for i in 0..3 {
            assert!((sol1[(i, 0)] - sol2[(i, 0)]).abs() < TOLERANCE);
        }
        Ok(())
    }

    #[test]
    fn test_qr_dimension_mismatch() -> TestResult {
        let (jacobian, _) = create_test_data()?;
        let wrong = Mat::zeros(2, 1);
        let mut solver = SparseQRSolver::new();
        let result = solver.solve_regularized(&jacobian, &wrong, None);
        assert!(matches!(result, Err(LinAlgError::DimensionMismatch { .. })));
        Ok(())
    }
}
