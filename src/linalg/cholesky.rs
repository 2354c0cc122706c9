use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};

use crate::linalg::{
    LinAlgError, LinAlgResult, SparseLinearSolver, build_regularized_normal_equations,
    sparse::SparseMatrix,
};

/// Sparse Cholesky (LLT) backend for the regularized normal equations.
///
/// The regularized matrix `J^T J + D^2` is symmetric positive definite as
/// soon as every entry of `D` is positive, so LLT is the natural choice.
/// Without regularization a rank-deficient Jacobian makes the factorization
/// fail, which is reported as [`LinAlgError::SingularMatrix`].
#[derive(Debug, Clone)]
pub struct SparseCholeskySolver {
    /// Cached symbolic factorization for reuse across iterations.
    ///
    /// Valid while the sparsity pattern of the regularized normal matrix
    /// matches `cached_pattern`. Within one minimization the pattern only
    /// changes if the caller switches between regularized and plain solves
    /// on a Jacobian with structurally empty diagonal entries in `J^T J`.
    symbolic_factorization: Option<SymbolicLlt<usize>>,
    cached_pattern: Option<Vec<(usize, usize)>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver {
            symbolic_factorization: None,
            cached_pattern: None,
        }
    }

    fn symbolic_for(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<SymbolicLlt<usize>> {
        let pattern = matrix.sparsity_pattern();
        if let (Some(cached_sym), Some(cached_pattern)) =
            (&self.symbolic_factorization, &self.cached_pattern)
            && *cached_pattern == pattern
        {
            // SymbolicLlt is reference-counted, clone is O(1)
            return Ok(cached_sym.clone());
        }

        let new_sym = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic Cholesky decomposition failed".to_string())
                .log_with_source(e)
        })?;
        self.symbolic_factorization = Some(new_sym.clone());
        self.cached_pattern = Some(pattern);
        Ok(new_sym)
    }
}

impl Default for SparseCholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_regularized(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) =
            build_regularized_normal_equations(jacobian, residuals, diagonal)?;
        let sym = self.symbolic_for(&hessian)?;

        let cholesky = Llt::try_new_with_symbolic(sym, hessian.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        let step = cholesky.solve(-&gradient);
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

    /// Overdetermined 4x3 system
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

        let residuals = Mat::from_fn(4, 1, |i, _| match i {
            0 => 1.0,
            1 => -2.0,
            2 => 0.5,
            3 => 1.2,
            _ => 0.0,
        });

        Ok((jacobian, residuals))
    }

    /// Residual of the regularized normal equations, `(J^T J + D^2) h + J^T r`
    fn normal_equation_residual(
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        diagonal: Option<&Mat<f64>>,
        step: &Mat<f64>,
    ) -> f64 {
        let n = jacobian.ncols();
        let mut j_step = Mat::zeros(jacobian.nrows(), 1);
        jacobian.right_multiply(step, &mut j_step);
        for i in 0..residuals.nrows() {
            j_step[(i, 0)] += residuals[(i, 0)];
        }
        let mut out = Mat::zeros(n, 1);
        jacobian.left_multiply(&j_step, &mut out);
        if let Some(d) = diagonal {
            for i in 0..n {
                out[(i, 0)] += d[(i, 0)] * d[(i, 0)] * step[(i, 0)];
            }
        }
        out.norm_l2()
    }

    #[test]
    fn test_solver_creation() {
        let solver = SparseCholeskySolver::new();
        assert!(solver.symbolic_factorization.is_none());

        let default_solver = SparseCholeskySolver::default();
        assert!(default_solver.cached_pattern.is_none());
    }

    #[test]
    fn test_gauss_newton_solve_satisfies_normal_equations() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;

        let step = solver.solve_regularized(&jacobian, &residuals, None)?;
        assert_eq!(step.nrows(), 3);
        assert!(normal_equation_residual(&jacobian, &residuals, None, &step) < TOLERANCE);
        assert!(solver.symbolic_factorization.is_some());
        Ok(())
    }

    #[test]
    fn test_regularized_solve_satisfies_normal_equations() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;
        let diagonal = Mat::from_fn(3, 1, |i, _| 0.1 * (i + 1) as f64);

        let step = solver.solve_regularized(&jacobian, &residuals, Some(&diagonal))?;
        assert!(
            normal_equation_residual(&jacobian, &residuals, Some(&diagonal), &step) < TOLERANCE
        );
        Ok(())
    }

    #[test]
    fn test_symbolic_pattern_caching() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;
        let diagonal = Mat::from_fn(3, 1, |_, _| 1e-3);

        let sol1 = solver.solve_regularized(&jacobian, &residuals, Some(&diagonal))?;
        let pattern = solver.cached_pattern.clone();
        let sol2 = solver.solve_regularized(&jacobian, &residuals, Some(&diagonal))?;

        assert_eq!(pattern, solver.cached_pattern);
        for i in 0..sol1.nrows() {
            assert!((sol1[(i, 0)] - sol2[(i, 0)]).abs() < TOLERANCE);
        }
        Ok(())
    }

    #[test]
    fn test_pattern_change_rebuilds_symbolic() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;
        solver.solve_regularized(&jacobian, &residuals, None)?;
        let first_pattern = solver.cached_pattern.clone();

        // Different structure and size
        let other = SparseColMat::try_new_from_triplets(
            2,
            2,
            &[Triplet::new(0, 0, 1.0), Triplet::new(1, 1, 2.0)],
        )?;
        let other_residuals = Mat::from_fn(2, 1, |_, _| 1.0);
        let step = solver.solve_regularized(&other, &other_residuals, None)?;

        assert_ne!(first_pattern, solver.cached_pattern);
        assert!((step[(0, 0)] + 1.0).abs() < TOLERANCE);
        assert!((step[(1, 0)] + 0.5).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_larger_regularization_shortens_step() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;

        let small = Mat::from_fn(3, 1, |_, _| 0.01);
        let large = Mat::from_fn(3, 1, |_, _| 10.0);

        let sol_small = solver.solve_regularized(&jacobian, &residuals, Some(&small))?;
        let sol_large = solver.solve_regularized(&jacobian, &residuals, Some(&large))?;

        assert!(sol_large.norm_l2() < sol_small.norm_l2());
        Ok(())
    }

    #[test]
    fn test_rank_deficient_without_regularization_fails() -> TestResult {
        let mut solver = SparseCholeskySolver::new();

        // Second column is structurally present but identically zero
        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(1, 0, 2.0),
            Triplet::new(1, 1, 0.0),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets)?;
        let residuals = Mat::from_fn(2, 1, |i, _| i as f64 + 1.0);

        let result = solver.solve_regularized(&jacobian, &residuals, None);
        assert!(result.is_err(), "Rank-deficient system should return Err");
        Ok(())
    }

    #[test]
    fn test_rank_deficient_with_regularization_succeeds() -> TestResult {
        let mut solver = SparseCholeskySolver::new();

        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(1, 0, 2.0),
            Triplet::new(1, 1, 0.0),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets)?;
        let residuals = Mat::from_fn(2, 1, |i, _| i as f64 + 1.0);
        let diagonal = Mat::from_fn(2, 1, |_, _| 1e-3);

        let step = solver.solve_regularized(&jacobian, &residuals, Some(&diagonal))?;
        // The unobservable parameter receives no update
        assert!(step[(1, 0)].abs() < TOLERANCE);
        assert!(
            normal_equation_residual(&jacobian, &residuals, Some(&diagonal), &step) < 1e-8
        );
        Ok(())
    }

    #[test]
    fn test_numerical_accuracy() -> TestResult {
        let mut solver = SparseCholeskySolver::new();

        let triplets = vec![Triplet::new(0, 0, 1.0), Triplet::new(1, 1, 1.0)];
        let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets)?;
        let residuals = Mat::from_fn(2, 1, |i, _| -((i + 1) as f64)); // [-1, -2]

        let solution = solver.solve_regularized(&jacobian, &residuals, None)?;
        // J^T J = I and -J^T r = [1, 2]
        assert!((solution[(0, 0)] - 1.0).abs() < TOLERANCE);
        assert!((solution[(1, 0)] - 2.0).abs() < TOLERANCE);
        Ok(())
    }
}
