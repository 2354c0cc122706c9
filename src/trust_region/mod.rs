//! Trust region strategies for nonlinear least squares.
//!
//! A strategy turns the Jacobian and residuals at the current point into a
//! candidate step and adapts its trust region radius from the outcome the
//! outer minimizer reports back:
//!
//! ```text
//! loop {
//!     let step = strategy.compute_step(&per_solve, &jacobian, &residuals);
//!     // evaluate the step, compute rho = actual / predicted reduction
//!     match outcome {
//!         Invalid  => strategy.step_is_invalid(),
//!         Rejected => strategy.step_rejected(rho),
//!         Accepted => strategy.step_accepted(rho),
//!     }
//! }
//! ```
//!
//! Exactly one of the three callbacks is expected after every
//! `compute_step`. Violating that order never panics and never moves the
//! radius or `mu` outside their configured bounds, but the steps produced
//! are then not meaningful.
//!
//! The only strategy provided is [`DoglegStrategy`], in its traditional and
//! subspace variants.

pub mod dogleg;
pub mod subspace;

pub use dogleg::{DoglegStrategy, traditional_dogleg_step};

use crate::{
    error::ApexResult,
    linalg::{self, LinearSolverSummary, LinearSolverType},
};
use faer::{Mat, sparse::SparseColMat};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::{debug, error};

/// Trust region strategy specific error types
#[derive(Debug, Clone, Error)]
pub enum StrategyError {
    /// Options that do not fit any more specific category
    #[error("Invalid trust region options: {0}")]
    InvalidOptions(String),

    /// Radius bounds or radius update factors are inconsistent
    #[error("Invalid trust region radius configuration: {message}")]
    InvalidRadius { message: String },

    /// `mu` bounds or the `mu` increase factor are inconsistent
    #[error("Invalid regularization configuration: {message}")]
    InvalidRegularization { message: String },
}

impl StrategyError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for strategy construction
pub type StrategyResult<T> = Result<T, StrategyError>;

/// How the Gauss-Newton and Cauchy steps are combined.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DoglegType {
    /// Powell's piecewise linear path through the Cauchy point
    #[default]
    Traditional,
    /// Exact minimizer of the model over `span{g, h_gn}` inside the region
    Subspace,
}

impl Display for DoglegType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DoglegType::Traditional => write!(f, "Traditional"),
            DoglegType::Subspace => write!(f, "Subspace"),
        }
    }
}

/// Which branch of the dogleg construction produced the last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoglegStepType {
    /// Full Gauss-Newton step, inside the region
    GaussNewton,
    /// Steepest descent scaled to the boundary
    SteepestDescent,
    /// Point on the segment from the Cauchy step to the Gauss-Newton step
    Interpolated,
    /// Two-dimensional subspace minimizer
    Subspace,
}

impl Display for DoglegStepType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DoglegStepType::GaussNewton => write!(f, "GN"),
            DoglegStepType::SteepestDescent => write!(f, "SD"),
            DoglegStepType::Interpolated => write!(f, "DL"),
            DoglegStepType::Subspace => write!(f, "SUB"),
        }
    }
}

/// Options that vary per `compute_step` call.
#[derive(Debug, Clone, Copy)]
pub struct PerSolveOptions {
    /// Forcing sequence value for inexact (iterative) linear solves.
    ///
    /// The dogleg strategy always solves exactly, so this is only logged.
    pub eta: f64,
}

impl Default for PerSolveOptions {
    fn default() -> Self {
        Self { eta: 0.1 }
    }
}

/// Result of one `compute_step` call.
#[derive(Debug, Clone)]
pub struct TrustRegionStep {
    /// Outcome of the linear solve (or of the cache reuse)
    pub summary: LinearSolverSummary,
    /// Step to add to the parameters; `None` when the solve failed
    pub step: Option<Mat<f64>>,
}

impl TrustRegionStep {
    pub fn is_usable(&self) -> bool {
        self.step.is_some() && self.summary.is_usable()
    }
}

/// The operations an outer minimizer drives a trust region strategy with.
pub trait TrustRegionStrategy {
    /// Compute a step for the given Jacobian and residuals.
    ///
    /// Solver failures are reported in the summary, with no step. The
    /// caller is expected to react with [`TrustRegionStrategy::step_is_invalid`]
    /// and try again.
    fn compute_step(
        &mut self,
        per_solve_options: &PerSolveOptions,
        jacobian: &SparseColMat<usize, f64>,
        residuals: &Mat<f64>,
    ) -> TrustRegionStep;

    /// The last step reduced the objective; `step_quality` is the ratio of
    /// actual to predicted reduction.
    fn step_accepted(&mut self, step_quality: f64);

    /// The last step was evaluated but not taken.
    fn step_rejected(&mut self, step_quality: f64);

    /// The last step could not be evaluated (solve failure, non-finite cost).
    fn step_is_invalid(&mut self);

    /// Current trust region radius.
    fn radius(&self) -> f64;
}

/// Configuration of a trust region strategy.
///
/// Defaults follow the values commonly used by Ceres Solver:
///
/// | Option | Default |
/// |---|---|
/// | `initial_radius` | 1e4 |
/// | `max_radius` / `min_radius` | 1e16 / 1e-32 |
/// | `min_diagonal` / `max_diagonal` | 1e-6 / 1e32 |
/// | `initial_mu` / `min_mu` / `max_mu` | 1e-8 / 1e-8 / 1.0 |
/// | `mu_increase_factor` | 10 |
/// | `increase_threshold` / `decrease_threshold` | 0.75 / 0.25 |
/// | `radius_increase_factor` / `radius_decrease_factor` | 3 / 0.5 |
///
/// ```
/// use apex_trust_region::trust_region::{DoglegType, TrustRegionStrategyOptions};
///
/// let options = TrustRegionStrategyOptions::new()
///     .with_initial_radius(10.0)
///     .with_mu_params(1e-6, 1e-8, 1.0, 10.0)
///     .with_dogleg_type(DoglegType::Subspace);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct TrustRegionStrategyOptions {
    /// Type of linear solver for the regularized Gauss-Newton system
    pub linear_solver_type: LinearSolverType,
    /// Dogleg variant
    pub dogleg_type: DoglegType,
    /// Radius used for the first step
    pub initial_radius: f64,
    /// Upper bound for the radius
    pub max_radius: f64,
    /// Floor applied whenever the radius shrinks
    pub min_radius: f64,
    /// Lower clamp for the Jacobian column norms
    pub min_diagonal: f64,
    /// Upper clamp for the Jacobian column norms
    pub max_diagonal: f64,
    pub initial_mu: f64,
    pub min_mu: f64,
    pub max_mu: f64,
    /// Multiplier applied to `mu` on invalid steps. Accepted steps divide
    /// `mu` by half of it, so it must exceed 2.
    pub mu_increase_factor: f64,
    /// Step quality above which the radius may grow
    pub increase_threshold: f64,
    /// Step quality below which an accepted step still shrinks the radius
    pub decrease_threshold: f64,
    /// Radius grows to at least this multiple of the last step norm
    pub radius_increase_factor: f64,
    /// Radius multiplier on rejected or poor steps
    pub radius_decrease_factor: f64,
}

impl Default for TrustRegionStrategyOptions {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            dogleg_type: DoglegType::default(),
            initial_radius: 1e4,
            max_radius: 1e16,
            min_radius: 1e-32,
            min_diagonal: 1e-6,
            max_diagonal: 1e32,
            initial_mu: 1e-8,
            min_mu: 1e-8,
            max_mu: 1.0,
            mu_increase_factor: 10.0,
            increase_threshold: 0.75,
            decrease_threshold: 0.25,
            radius_increase_factor: 3.0,
            radius_decrease_factor: 0.5,
        }
    }
}

impl TrustRegionStrategyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    /// Set the dogleg variant
    pub fn with_dogleg_type(mut self, dogleg_type: DoglegType) -> Self {
        self.dogleg_type = dogleg_type;
        self
    }

    /// Set the initial trust region radius
    pub fn with_initial_radius(mut self, radius: f64) -> Self {
        self.initial_radius = radius;
        self
    }

    /// Set the trust region radius bounds
    pub fn with_radius_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_radius = min;
        self.max_radius = max;
        self
    }

    /// Set the clamp range for the diagonal scaling
    pub fn with_diagonal_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_diagonal = min;
        self.max_diagonal = max;
        self
    }

    /// Set adaptive mu regularization parameters
    pub fn with_mu_params(
        mut self,
        initial_mu: f64,
        min_mu: f64,
        max_mu: f64,
        increase_factor: f64,
    ) -> Self {
        self.initial_mu = initial_mu;
        self.min_mu = min_mu;
        self.max_mu = max_mu;
        self.mu_increase_factor = increase_factor;
        self
    }

    /// Set the step quality thresholds
    pub fn with_step_quality_thresholds(mut self, decrease: f64, increase: f64) -> Self {
        self.decrease_threshold = decrease;
        self.increase_threshold = increase;
        self
    }

    /// Set the radius adjustment factors
    pub fn with_radius_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.radius_increase_factor = increase;
        self.radius_decrease_factor = decrease;
        self
    }

    /// Check the options for consistency.
    ///
    /// # Errors
    /// Returns `StrategyError` if any bound is non-positive, inverted or not
    /// finite, or if the update factors cannot keep the state within bounds.
    pub fn validate(&self) -> StrategyResult<()> {
        let positive = |x: f64| x.is_finite() && x > 0.0;

        if !positive(self.initial_radius) || !positive(self.max_radius) || !positive(self.min_radius)
        {
            return Err(StrategyError::InvalidRadius {
                message: format!(
                    "radii must be positive and finite (min {:e}, initial {:e}, max {:e})",
                    self.min_radius, self.initial_radius, self.max_radius
                ),
            }
            .log());
        }
        if self.min_radius > self.initial_radius {
            return Err(StrategyError::InvalidRadius {
                message: format!(
                    "min_radius {:e} must not exceed initial_radius {:e}",
                    self.min_radius, self.initial_radius
                ),
            }
            .log());
        }
        if self.initial_radius > self.max_radius {
            return Err(StrategyError::InvalidRadius {
                message: format!(
                    "initial_radius {:e} must not exceed max_radius {:e}",
                    self.initial_radius, self.max_radius
                ),
            }
            .log());
        }
        if !positive(self.radius_increase_factor)
            || !positive(self.radius_decrease_factor)
            || self.radius_decrease_factor >= 1.0
        {
            return Err(StrategyError::InvalidRadius {
                message: format!(
                    "radius factors must satisfy increase > 0 and 0 < decrease < 1 (got {}, {})",
                    self.radius_increase_factor, self.radius_decrease_factor
                ),
            }
            .log());
        }

        if !positive(self.min_diagonal) || self.min_diagonal >= self.max_diagonal {
            return Err(StrategyError::InvalidOptions(format!(
                "diagonal bounds must satisfy 0 < min_diagonal < max_diagonal (got [{:e}, {:e}])",
                self.min_diagonal, self.max_diagonal
            ))
            .log());
        }

        if !positive(self.min_mu) || !positive(self.max_mu) || self.min_mu > self.max_mu {
            return Err(StrategyError::InvalidRegularization {
                message: format!(
                    "mu bounds must satisfy 0 < min_mu <= max_mu (got [{:e}, {:e}])",
                    self.min_mu, self.max_mu
                ),
            }
            .log());
        }
        if !(self.min_mu..=self.max_mu).contains(&self.initial_mu) {
            return Err(StrategyError::InvalidRegularization {
                message: format!(
                    "initial_mu {:e} outside [{:e}, {:e}]",
                    self.initial_mu, self.min_mu, self.max_mu
                ),
            }
            .log());
        }
        if !self.mu_increase_factor.is_finite() || self.mu_increase_factor <= 2.0 {
            return Err(StrategyError::InvalidRegularization {
                message: format!(
                    "mu_increase_factor must be greater than 2 (got {})",
                    self.mu_increase_factor
                ),
            }
            .log());
        }

        if !self.decrease_threshold.is_finite()
            || !self.increase_threshold.is_finite()
            || self.decrease_threshold > self.increase_threshold
        {
            return Err(StrategyError::InvalidOptions(format!(
                "step quality thresholds must satisfy decrease <= increase (got {}, {})",
                self.decrease_threshold, self.increase_threshold
            ))
            .log());
        }

        Ok(())
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Strategy:      Dogleg ({})\n  Linear solver: {}\n\nTrust Region:\n  Initial radius:      {:.2e}\n  Radius range:        [{:.2e}, {:.2e}]\n  Radius factors:      x{:.2} / x{:.2}\n  Quality thresholds:  {:.2} / {:.2}\n\nRegularization:\n  Initial mu:          {:.2e}\n  Mu range:            [{:.2e}, {:.2e}]\n  Mu increase factor:  {:.2}\n  Diagonal range:      [{:.2e}, {:.2e}]",
            self.dogleg_type,
            self.linear_solver_type,
            self.initial_radius,
            self.min_radius,
            self.max_radius,
            self.radius_increase_factor,
            self.radius_decrease_factor,
            self.decrease_threshold,
            self.increase_threshold,
            self.initial_mu,
            self.min_mu,
            self.max_mu,
            self.mu_increase_factor,
            self.min_diagonal,
            self.max_diagonal,
        );
    }
}

/// Build the configured strategy together with its linear solver.
///
/// # Errors
/// Returns `ApexError::Strategy` if the options do not validate.
pub fn create_trust_region_strategy(
    options: TrustRegionStrategyOptions,
) -> ApexResult<Box<dyn TrustRegionStrategy>> {
    options.print_configuration();
    let linear_solver = linalg::create_linear_solver(options.linear_solver_type);
    let strategy = DoglegStrategy::new(options, linear_solver)?;
    Ok(Box::new(strategy))
}
