//! Dogleg trust region strategy.
//!
//! Each call to [`TrustRegionStrategy::compute_step`] produces three pieces:
//!
//! 1. The Gauss-Newton step, from the regularized normal equations
//!    ```text
//!    (J^T J + mu * D^2) h_gn = -J^T r,    D = clamp(column norms of J)
//!    ```
//!    The small `mu * D^2` term keeps the solve well posed for rank-deficient
//!    Jacobians. `mu` grows on invalid steps and shrinks on accepted ones.
//! 2. The Cauchy step, the minimizer of the model along `-g` with `g = J^T r`:
//!    ```text
//!    alpha = ||g||^2 / ||J g||^2,    h_sd = -alpha * g
//!    ```
//! 3. The combination of both inside the trust region, either along Powell's
//!    dogleg path ([`traditional_dogleg_step`]) or by minimizing the model over
//!    `span{g, h_gn}` ([`super::subspace`]).
//!
//! After a rejected step only the radius changes, so the next call reuses the
//! cached gradient, Gauss-Newton step and Cauchy parameters and skips the
//! linear solve entirely.
//!
//! Steps are descent steps: the caller applies `x_new = x + h`.

use faer::{Mat, sparse::SparseColMat};
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::linalg::{
    LinAlgError, LinearSolverPerSolveOptions, LinearSolverSummary, LinearSolverTerminationType,
    SparseLinearSolver,
    sparse::{SparseMatrix, dot},
};
use crate::trust_region::{
    DoglegStepType, DoglegType, PerSolveOptions, StrategyResult, TrustRegionStep,
    TrustRegionStrategy, TrustRegionStrategyOptions, subspace::SubspaceModel,
};

/// Combine a Gauss-Newton step and a Cauchy step along the dogleg path.
///
/// * `||h_gn|| <= radius`: the Gauss-Newton step, unchanged.
/// * `||h_sd|| >= radius`: the Cauchy step scaled to the boundary.
/// * otherwise: the point where the segment from `h_sd` to `h_gn` leaves the
///   region.
///
/// The segment parameter `beta` solves `||a + beta (b - a)||^2 = radius^2`
/// with `a = h_sd`, `b = h_gn`. Of the two algebraically equivalent root
/// formulas the one without cancellation is used, depending on the sign of
/// `a^T (b - a)`.
pub fn traditional_dogleg_step(
    gauss_newton_step: &Mat<f64>,
    cauchy_step: &Mat<f64>,
    radius: f64,
) -> (Mat<f64>, DoglegStepType) {
    let n = gauss_newton_step.nrows();
    let gauss_newton_norm = gauss_newton_step.norm_l2();
    if gauss_newton_norm <= radius {
        return (gauss_newton_step.clone(), DoglegStepType::GaussNewton);
    }

    let cauchy_norm = cauchy_step.norm_l2();
    if cauchy_norm >= radius {
        let scale = radius / cauchy_norm;
        return (
            Mat::from_fn(n, 1, |i, _| scale * cauchy_step[(i, 0)]),
            DoglegStepType::SteepestDescent,
        );
    }

    let b_minus_a = Mat::from_fn(n, 1, |i, _| gauss_newton_step[(i, 0)] - cauchy_step[(i, 0)]);
    let c = dot(cauchy_step, &b_minus_a);
    let b_minus_a_squared_norm = b_minus_a.squared_norm_l2();
    let a_squared_norm = cauchy_norm * cauchy_norm;

    // ||h_gn|| > radius > ||h_sd|| rules this out up to round-off
    if b_minus_a_squared_norm <= f64::EPSILON * a_squared_norm.max(f64::MIN_POSITIVE) {
        let scale = radius / gauss_newton_norm;
        return (
            Mat::from_fn(n, 1, |i, _| scale * gauss_newton_step[(i, 0)]),
            DoglegStepType::Interpolated,
        );
    }

    let radius_squared_minus_a = radius * radius - a_squared_norm;
    let d = (c * c + b_minus_a_squared_norm * radius_squared_minus_a)
        .max(0.0)
        .sqrt();
    let beta = if c <= 0.0 {
        (d - c) / b_minus_a_squared_norm
    } else {
        radius_squared_minus_a / (d + c)
    };
    let beta = if beta.is_finite() {
        beta.clamp(0.0, 1.0)
    } else {
        1.0
    };

    (
        Mat::from_fn(n, 1, |i, _| cauchy_step[(i, 0)] + beta * b_minus_a[(i, 0)]),
        DoglegStepType::Interpolated,
    )
}

/// Dogleg trust region strategy with adaptive Levenberg-Marquardt
/// regularization of the Gauss-Newton solve.
///
/// # Example
///
/// ```
/// use apex_trust_region::linalg::{LinearSolverType, create_linear_solver};
/// use apex_trust_region::trust_region::{
///     DoglegStrategy, PerSolveOptions, TrustRegionStrategy, TrustRegionStrategyOptions,
/// };
/// use faer::{Mat, sparse::{SparseColMat, Triplet}};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let options = TrustRegionStrategyOptions::new().with_initial_radius(1.0);
/// let solver = create_linear_solver(LinearSolverType::SparseCholesky);
/// let mut strategy = DoglegStrategy::new(options, solver)?;
///
/// let jacobian = SparseColMat::try_new_from_triplets(
///     2, 2, &[Triplet::new(0, 0, 1.0), Triplet::new(1, 1, 1.0)],
/// )?;
/// let residuals = Mat::from_fn(2, 1, |_, _| 0.1);
///
/// let result = strategy.compute_step(&PerSolveOptions::default(), &jacobian, &residuals);
/// assert!(result.is_usable());
/// strategy.step_accepted(1.0);
/// # Ok(())
/// # }
/// ```
pub struct DoglegStrategy {
    options: TrustRegionStrategyOptions,
    linear_solver: Box<dyn SparseLinearSolver>,

    radius: f64,
    mu: f64,

    diagonal: Mat<f64>,
    lm_diagonal: Mat<f64>,
    gradient: Mat<f64>,
    gauss_newton_step: Mat<f64>,
    alpha: f64,
    subspace: Option<SubspaceModel>,

    dogleg_step_norm: f64,
    last_step_type: Option<DoglegStepType>,

    /// Set by `step_rejected`; the next `compute_step` skips the solve.
    reuse: bool,
    /// The cached vectors come from a successful solve.
    cache_valid: bool,
}

impl DoglegStrategy {
    /// Create a strategy that solves the Gauss-Newton system with
    /// `linear_solver`.
    ///
    /// # Errors
    /// Returns `StrategyError` if the options do not validate.
    pub fn new(
        options: TrustRegionStrategyOptions,
        linear_solver: Box<dyn SparseLinearSolver>,
    ) -> StrategyResult<Self> {
        options.validate()?;
        Ok(Self {
            radius: options.initial_radius,
            mu: options.initial_mu,
            diagonal: Mat::zeros(0, 1),
            lm_diagonal: Mat::zeros(0, 1),
            gradient: Mat::zeros(0, 1),
            gauss_newton_step: Mat::zeros(0, 1),
            alpha: 0.0,
            subspace: None,
            dogleg_step_norm: 0.0,
            last_step_type: None,
            reuse: false,
            cache_valid: false,
            options,
            linear_solver,
        })
    }

    /// Current Levenberg-Marquardt regularization.
    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// Norm of the last step returned by `compute_step`.
    pub fn step_norm(&self) -> f64 {
        self.dogleg_step_norm
    }

    /// Dogleg branch of the last step, `None` before the first one.
    pub fn last_step_type(&self) -> Option<DoglegStepType> {
        self.last_step_type
    }

    /// Whether the next `compute_step` will reuse the cached solve.
    pub fn is_reusing(&self) -> bool {
        self.reuse
    }

    /// Cauchy step length of the current linearization.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// `J^T r` of the current linearization.
    pub fn gradient(&self) -> &Mat<f64> {
        &self.gradient
    }

    /// Clamped Jacobian column norms of the current linearization.
    pub fn diagonal(&self) -> &Mat<f64> {
        &self.diagonal
    }

    /// Regularized Gauss-Newton step from the last successful solve.
    pub fn gauss_newton_step(&self) -> &Mat<f64> {
        &self.gauss_newton_step
    }

    /// `h_sd = -alpha * g`
    fn cauchy_step(&self) -> Mat<f64> {
        Mat::from_fn(self.gradient.nrows(), 1, |i, _| {
            -self.alpha * self.gradient[(i, 0)]
        })
    }

    fn compute_gradient(&mut self, jacobian: &SparseColMat<usize, f64>, residuals: &Mat<f64>) {
        let mut gradient = Mat::zeros(jacobian.ncols(), 1);
        jacobian.left_multiply(residuals, &mut gradient);
        self.gradient = gradient;
    }

    /// `alpha = ||g||^2 / ||J g||^2`, zero when `J g` vanishes.
    fn compute_cauchy_point(&mut self, jacobian: &SparseColMat<usize, f64>) {
        let mut jacobian_gradient = Mat::zeros(jacobian.nrows(), 1);
        jacobian.right_multiply(&self.gradient, &mut jacobian_gradient);

        let gradient_squared_norm = self.gradient.squared_norm_l2();
        let jacobian_gradient_squared_norm = jacobian_gradient.squared_norm_l2();
        let alpha = gradient_squared_norm / jacobian_gradient_squared_norm;

        self.alpha = if jacobian_gradient_squared_norm > f64::MIN_POSITIVE && alpha.is_finite() {
            alpha
        } else {
            0.0
        };
        trace!(
            "Cauchy point: |g|^2 = {:.3e}, |Jg|^2 = {:.3e}, alpha = {:.3e}",
            gradient_squared_norm, jacobian_gradient_squared_norm, self.alpha
        );
    }

    /// Solve `(J^T J + mu D^2) h = -J^T r` once with the current `mu`.
    fn compute_gauss_newton_step(
        &mut self,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
    ) -> LinearSolverSummary {
        let (min_diagonal, max_diagonal) = (self.options.min_diagonal, self.options.max_diagonal);
        let column_norms = jacobian.column_norm();
        self.diagonal = Mat::from_fn(jacobian.ncols(), 1, |i, _| {
            column_norms[(i, 0)].clamp(min_diagonal, max_diagonal)
        });

        let sqrt_mu = self.mu.sqrt();
        self.lm_diagonal = Mat::from_fn(jacobian.ncols(), 1, |i, _| {
            sqrt_mu * self.diagonal[(i, 0)]
        });

        let solve_options = LinearSolverPerSolveOptions {
            diagonal: Some(&self.lm_diagonal),
        };
        let (mut summary, solution) =
            self.linear_solver.solve(jacobian, residuals, &solve_options);

        let usable = summary.is_usable();
        match solution {
            Some(step) if usable && step.is_all_finite() => {
                self.gauss_newton_step = step;
            }
            Some(_) if usable => {
                summary.termination_type = LinearSolverTerminationType::Failure;
                summary.message = LinAlgError::NonFiniteSolution.to_string();
            }
            None if usable => {
                summary.termination_type = LinearSolverTerminationType::Failure;
                summary.message = "Linear solver reported success without a solution".to_string();
            }
            _ => {}
        }
        summary
    }

    fn combine_steps(&mut self) -> Mat<f64> {
        let (step, step_type) = match &self.subspace {
            Some(model) if self.gauss_newton_step.norm_l2() > self.radius => {
                (model.minimize(self.radius), DoglegStepType::Subspace)
            }
            _ => traditional_dogleg_step(&self.gauss_newton_step, &self.cauchy_step(), self.radius),
        };

        self.dogleg_step_norm = step.norm_l2();
        self.last_step_type = Some(step_type);
        debug!(
            "Dogleg step [{}]: |h| = {:.3e}, radius = {:.3e}, mu = {:.3e}",
            step_type, self.dogleg_step_norm, self.radius, self.mu
        );
        step
    }

    fn failed_step(&mut self, summary: LinearSolverSummary) -> TrustRegionStep {
        self.cache_valid = false;
        self.subspace = None;
        TrustRegionStep {
            summary,
            step: None,
        }
    }
}

impl TrustRegionStrategy for DoglegStrategy {
    fn compute_step(
        &mut self,
        per_solve_options: &PerSolveOptions,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
    ) -> TrustRegionStep {
        trace!(
            "compute_step: {}x{} Jacobian, eta = {:.2e} (exact solve)",
            jacobian.nrows(),
            jacobian.ncols(),
            per_solve_options.eta
        );

        if self.reuse {
            if self.cache_valid && self.gradient.nrows() == jacobian.ncols() {
                let start = Instant::now();
                let step = self.combine_steps();
                let mut summary =
                    LinearSolverSummary::success("Reused cached Gauss-Newton and Cauchy steps");
                summary.solve_time = start.elapsed();
                return TrustRegionStep {
                    summary,
                    step: Some(step),
                };
            }
            warn!(
                "Cannot reuse cached steps for a Jacobian with {} columns (cache has {}), recomputing",
                jacobian.ncols(),
                self.gradient.nrows()
            );
            self.reuse = false;
        }

        if residuals.nrows() != jacobian.nrows() || residuals.ncols() != 1 {
            let err = LinAlgError::DimensionMismatch {
                context: "residual vector",
                expected: jacobian.nrows(),
                actual: residuals.nrows(),
            }
            .log();
            return self.failed_step(LinearSolverSummary::from_error(&err));
        }

        self.compute_gradient(jacobian, residuals);
        self.compute_cauchy_point(jacobian);

        let summary = self.compute_gauss_newton_step(jacobian, residuals);
        if !summary.is_usable() {
            debug!(
                "Gauss-Newton solve failed with mu = {:.3e}: {}",
                self.mu, summary
            );
            return self.failed_step(summary);
        }

        self.subspace = match self.options.dogleg_type {
            DoglegType::Subspace => {
                SubspaceModel::new(jacobian, &self.gradient, &self.gauss_newton_step)
            }
            DoglegType::Traditional => None,
        };
        self.cache_valid = true;

        let step = self.combine_steps();
        TrustRegionStep {
            summary,
            step: Some(step),
        }
    }

    fn step_accepted(&mut self, step_quality: f64) {
        if !step_quality.is_finite() || step_quality <= 0.0 {
            warn!(
                "Step accepted with non-positive quality {}, radius update may be meaningless",
                step_quality
            );
        }

        if step_quality < self.options.decrease_threshold {
            self.radius =
                (self.radius * self.options.radius_decrease_factor).max(self.options.min_radius);
        } else if step_quality > self.options.increase_threshold {
            self.radius = self
                .radius
                .max(self.options.radius_increase_factor * self.dogleg_step_norm)
                .min(self.options.max_radius);
        }

        self.mu = (self.mu / (0.5 * self.options.mu_increase_factor))
            .clamp(self.options.min_mu, self.options.max_mu);
        self.reuse = false;

        debug!(
            "Step accepted (quality {:.3}): radius = {:.3e}, mu = {:.3e}",
            step_quality, self.radius, self.mu
        );
    }

    fn step_rejected(&mut self, step_quality: f64) {
        self.radius =
            (self.radius * self.options.radius_decrease_factor).max(self.options.min_radius);

        if !self.cache_valid {
            warn!("Step rejected without a successful solve, the next step will be recomputed");
        }
        self.reuse = self.cache_valid;

        debug!(
            "Step rejected (quality {:.3}): radius = {:.3e}",
            step_quality, self.radius
        );
    }

    fn step_is_invalid(&mut self) {
        self.mu = (self.mu * self.options.mu_increase_factor).min(self.options.max_mu);
        self.reuse = false;
        self.cache_valid = false;
        self.subspace = None;

        debug!("Step invalid: mu = {:.3e}", self.mu);
    }

    fn radius(&self) -> f64 {
        self.radius
    }
}
