//! # Apex Trust Region
//!
//! Dogleg trust region step computation for sparse nonlinear least squares
//! problems `min 1/2 ||r(x)||^2`.
//!
//! The crate provides the step-selection half of a trust region minimizer.
//! Evaluating residuals and Jacobians, accepting steps and deciding
//! convergence stay with the caller, which drives the strategy through the
//! [`TrustRegionStrategy`] trait.
//!
//! ## Features
//!
//! - **Dogleg strategy**: Powell's traditional dogleg and the two-dimensional
//!   subspace variant
//! - **Adaptive regularization**: Levenberg-Marquardt `mu` keeps the
//!   Gauss-Newton solve well posed for rank-deficient Jacobians
//! - **Step reuse**: rejected steps are recombined from the cached solve
//! - **Sparse backends**: faer sparse Cholesky and QR with symbolic
//!   factorization caching
//!
//! ## Example
//!
//! ```
//! use apex_trust_region::{
//!     PerSolveOptions, TrustRegionStrategy, TrustRegionStrategyOptions,
//!     create_trust_region_strategy,
//! };
//! use faer::{Mat, sparse::{SparseColMat, Triplet}};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut strategy = create_trust_region_strategy(TrustRegionStrategyOptions::default())?;
//!
//! let jacobian = SparseColMat::try_new_from_triplets(
//!     3, 2,
//!     &[Triplet::new(0, 0, 1.0), Triplet::new(1, 1, 2.0), Triplet::new(2, 0, 1.0)],
//! )?;
//! let residuals = Mat::from_fn(3, 1, |i, _| i as f64);
//!
//! let result = strategy.compute_step(&PerSolveOptions::default(), &jacobian, &residuals);
//! match result.step {
//!     Some(_step) => strategy.step_accepted(0.9),
//!     None => strategy.step_is_invalid(),
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod trust_region;

pub use error::{ApexError, ApexResult};
pub use linalg::{
    LinearSolverSummary, LinearSolverTerminationType, LinearSolverType, SparseCholeskySolver,
    SparseLinearSolver, SparseMatrix, SparseQRSolver,
};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use trust_region::{
    DoglegStepType, DoglegStrategy, DoglegType, PerSolveOptions, StrategyError, TrustRegionStep,
    TrustRegionStrategy, TrustRegionStrategyOptions, create_trust_region_strategy,
};
