//! Error types for the apex-trust-region library
//!
//! Every module owns a `thiserror` enum (`LinAlgError`, `StrategyError`).
//! Public constructors return [`ApexResult`], which wraps the module errors
//! while keeping their source chain intact.
//!
//! Example error chain:
//! ```text
//! ApexError::Strategy(
//!     StrategyError::InvalidRadius {
//!         message: "min_radius must not exceed initial_radius",
//!     }
//! )
//! ```

use crate::{linalg::LinAlgError, trust_region::StrategyError};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the library
pub type ApexResult<T> = Result<T, ApexError>;

/// Top-level error type exposed by public APIs.
///
/// Linear solve failures during `compute_step` are not errors: they travel
/// inside the returned `LinearSolverSummary`. This type covers construction
/// and configuration problems.
#[derive(Debug, Error)]
pub enum ApexError {
    /// Trust region strategy errors (options, construction)
    #[error(transparent)]
    Strategy(#[from] StrategyError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
}

impl ApexError {
    /// Full error chain, one cause per line.
    ///
    /// ```rust,ignore
    /// if let Err(e) = create_trust_region_strategy(options) {
    ///     warn!("Full chain: {}", e.chain());
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line variant of [`ApexError::chain`].
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apex_error_display() {
        let error = ApexError::from(LinAlgError::SingularMatrix);
        assert!(error.to_string().contains("Singular matrix"));
    }

    #[test]
    fn test_apex_error_chain_includes_cause() {
        let error = ApexError::from(StrategyError::InvalidRegularization {
            message: "min_mu must not exceed max_mu".to_string(),
        });

        let chain = error.chain();
        assert!(chain.contains("min_mu"));
        assert!(error.chain_compact().contains("regularization"));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let strategy_error = StrategyError::InvalidOptions("dimension".to_string());
        let apex_error: ApexError = strategy_error.into();
        assert!(matches!(apex_error, ApexError::Strategy(_)));

        let linalg_error = LinAlgError::NonFiniteSolution;
        let apex_error: ApexError = linalg_error.into();
        assert!(matches!(apex_error, ApexError::LinearAlgebra(_)));
    }

    #[test]
    fn test_apex_result_question_mark() {
        fn inner() -> ApexResult<i32> {
            Err(LinAlgError::SingularMatrix)?;
            Ok(1)
        }
        assert!(inner().is_err());
    }
}
