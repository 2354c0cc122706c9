pub mod cholesky;
pub mod qr;
pub mod sparse;

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use std::{
    fmt,
    fmt::{Display, Formatter},
    ops::Mul,
};
use thiserror::Error;
use tracing::error;
use web_time::{Duration, Instant};

pub use cholesky::SparseCholeskySolver;
pub use qr::SparseQRSolver;
pub use sparse::SparseMatrix;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    #[default]
    SparseCholesky,
    SparseQR,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::SparseQR => write!(f, "Sparse QR"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// Operand shapes do not agree
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The solve finished but produced NaN or Inf entries
    #[error("Linear solve produced non-finite values")]
    NonFiniteSolution,
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the third-party error that caused it
    /// (e.g. faer's `FaerError`, `LltError`, `CreationError`).
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }

    /// How a strategy should react to this error.
    ///
    /// Numerical breakdowns are recoverable by regularizing harder, anything
    /// structural is not.
    pub fn termination_type(&self) -> LinearSolverTerminationType {
        match self {
            LinAlgError::FactorizationFailed(_)
            | LinAlgError::SingularMatrix
            | LinAlgError::NonFiniteSolution => LinearSolverTerminationType::Failure,
            LinAlgError::SparseMatrixCreation(_)
            | LinAlgError::MatrixConversion(_)
            | LinAlgError::DimensionMismatch { .. } => LinearSolverTerminationType::FatalError,
        }
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Outcome class of a linear solve.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverTerminationType {
    /// Solution computed to the requested accuracy
    #[default]
    Success,
    /// Numerical failure (rank deficiency, breakdown). Retrying with more
    /// regularization may help.
    Failure,
    /// Unrecoverable error (bad input, allocation or conversion failure)
    FatalError,
}

impl Display for LinearSolverTerminationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverTerminationType::Success => write!(f, "Success"),
            LinearSolverTerminationType::Failure => write!(f, "Failure"),
            LinearSolverTerminationType::FatalError => write!(f, "Fatal error"),
        }
    }
}

/// Summary returned by every linear solve.
#[derive(Debug, Clone, Default)]
pub struct LinearSolverSummary {
    pub termination_type: LinearSolverTerminationType,
    /// Iterations used by the solver (0 for direct factorizations and for
    /// steps recombined from cached solves)
    pub num_iterations: usize,
    pub message: String,
    pub solve_time: Duration,
}

impl LinearSolverSummary {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            termination_type: LinearSolverTerminationType::Success,
            num_iterations: 0,
            message: message.into(),
            solve_time: Duration::ZERO,
        }
    }

    pub fn from_error(err: &LinAlgError) -> Self {
        Self {
            termination_type: err.termination_type(),
            num_iterations: 0,
            message: err.to_string(),
            solve_time: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.termination_type == LinearSolverTerminationType::Success
    }

    /// Whether the returned step can be used.
    pub fn is_usable(&self) -> bool {
        self.is_success()
    }
}

impl Display for LinearSolverSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} iterations, {:.3}ms): {}",
            self.termination_type,
            self.num_iterations,
            self.solve_time.as_secs_f64() * 1000.0,
            self.message
        )
    }
}

/// Per-solve options handed to a [`SparseLinearSolver`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearSolverPerSolveOptions<'a> {
    /// Diagonal `D` of the regularization term `||D h||^2`; `None` solves the
    /// plain Gauss-Newton normal equations.
    pub diagonal: Option<&'a Mat<f64>>,
}

/// Trait for sparse linear solvers used by the trust region strategies.
///
/// Implementations solve the regularized normal equations
///
/// ```text
/// (J^T J + D^2) h = -J^T r
/// ```
///
/// i.e. the minimizer of `||J h + r||^2 + ||D h||^2`. The returned `h` is a
/// descent step that is added to the parameters.
pub trait SparseLinearSolver {
    /// Solve the (optionally) regularized normal equations.
    ///
    /// # Errors
    /// Returns `LinAlgError` if:
    /// - Shapes of `jacobian`, `residuals` and `diagonal` disagree
    /// - Matrix factorization fails
    /// - Matrix is singular or the solution is not finite
    fn solve_regularized(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        diagonal: Option<&Mat<f64>>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve and report the outcome as a [`LinearSolverSummary`].
    ///
    /// The solution is `None` whenever the summary is not usable.
    fn solve(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
        options: &LinearSolverPerSolveOptions<'_>,
    ) -> (LinearSolverSummary, Option<Mat<f64>>) {
        let start = Instant::now();
        let result = self.solve_regularized(jacobian, residuals, options.diagonal);
        let solve_time = start.elapsed();

        match result {
            Ok(solution) => {
                let mut summary = LinearSolverSummary::success("Factorization and solve succeeded");
                summary.solve_time = solve_time;
                (summary, Some(solution))
            }
            Err(err) => {
                let mut summary = LinearSolverSummary::from_error(&err);
                summary.solve_time = solve_time;
                (summary, None)
            }
        }
    }
}

/// Create the linear solver backend for the given type.
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn SparseLinearSolver> {
    match solver_type {
        LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
        LinearSolverType::SparseQR => Box::new(SparseQRSolver::new()),
    }
}

/// Form `H = J^T J + D^2` and `g = J^T r`.
///
/// Shared by the factorization backends; `D^2` is added as a sparse diagonal
/// so the sparsity pattern of `H` is the pattern of `J^T J` plus the diagonal.
pub(crate) fn build_regularized_normal_equations(
    jacobian: &SparseColMat<usize, f64>,
    residuals: &Mat<f64>,
    diagonal: Option<&Mat<f64>>,
) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
    let n = jacobian.ncols();

    if residuals.nrows() != jacobian.nrows() {
        return Err(LinAlgError::DimensionMismatch {
            context: "residual vector",
            expected: jacobian.nrows(),
            actual: residuals.nrows(),
        }
        .log());
    }

    // H = J^T * J
    let jt = jacobian.as_ref().transpose();
    let hessian = jt
        .to_col_major()
        .map_err(|e| {
            LinAlgError::MatrixConversion(
                "Failed to convert transposed Jacobian to column-major format".to_string(),
            )
            .log_with_source(e)
        })?
        .mul(jacobian.as_ref());

    // g = J^T * r
    let gradient = jacobian.as_ref().transpose().mul(residuals);

    let Some(diagonal) = diagonal else {
        return Ok((hessian, gradient));
    };

    if diagonal.nrows() != n {
        return Err(LinAlgError::DimensionMismatch {
            context: "regularization diagonal",
            expected: n,
            actual: diagonal.nrows(),
        }
        .log());
    }

    // H_reg = H + D^2
    let d_squared_triplets: Vec<Triplet<usize, usize, f64>> = (0..n)
        .map(|i| Triplet::new(i, i, diagonal[(i, 0)] * diagonal[(i, 0)]))
        .collect();
    let d_squared = SparseColMat::try_new_from_triplets(n, n, &d_squared_triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create D^2 matrix".to_string())
            .log_with_source(e)
    })?;

    Ok((&hessian + d_squared, gradient))
}
