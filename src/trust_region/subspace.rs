//! Two-dimensional subspace dogleg.
//!
//! Instead of walking the piecewise linear dogleg path, the quadratic model
//!
//! ```text
//! m(h) = g^T h + 1/2 h^T J^T J h
//! ```
//!
//! is minimized exactly over `span{g, h_gn}` subject to `||h|| <= radius`.
//! With an orthonormal basis `Q = [q1 q2]` of that span the problem becomes
//!
//! ```text
//! min_y  s^T y + 1/2 y^T H y   s.t. ||y|| <= radius,   H = (J Q)^T (J Q),  s = Q^T g
//! ```
//!
//! which is solved in the eigenbasis of `H`. On the boundary the optimal
//! shift `lambda` satisfies the secular equation `||(H + lambda I)^-1 s|| = radius`.
//! It is found with a safeguarded Newton iteration on `1/||y(lambda)|| - 1/radius`,
//! which is nearly linear in `lambda`.

use faer::{Mat, sparse::SparseColMat};
use nalgebra::{Matrix2, SymmetricEigen, Vector2};
use tracing::trace;

use crate::linalg::sparse::{SparseMatrix, dot};

/// Relative size below which the second basis direction is considered
/// linearly dependent on the gradient.
const SUBSPACE_EPSILON: f64 = 1e-10;

/// Relative eigenvalue size treated as zero curvature.
const EIGEN_TOLERANCE: f64 = 1e-12;

const SECULAR_TOLERANCE: f64 = 1e-12;
const MAX_SECULAR_ITERATIONS: usize = 100;

/// The model restricted to `span{g, h_gn}`.
///
/// Built once per Jacobian and kept while the strategy reuses its cache, so
/// a rejected step only costs a 2x2 solve.
#[derive(Debug, Clone)]
pub struct SubspaceModel {
    basis: [Mat<f64>; 2],
    hessian: Matrix2<f64>,
    gradient: Vector2<f64>,
}

impl SubspaceModel {
    /// Project the model onto `span{gradient, gauss_newton_step}`.
    ///
    /// Returns `None` if the span is one-dimensional (zero gradient, zero
    /// step, or parallel vectors). The traditional dogleg handles that case.
    pub fn new(
        jacobian: &SparseColMat<usize, f64>,
        gradient: &Mat<f64>,
        gauss_newton_step: &Mat<f64>,
    ) -> Option<Self> {
        let gradient_norm = gradient.norm_l2();
        if gradient_norm <= f64::MIN_POSITIVE || !gradient_norm.is_finite() {
            return None;
        }
        let n = gradient.nrows();
        let q1 = Mat::from_fn(n, 1, |i, _| gradient[(i, 0)] / gradient_norm);

        // Gram-Schmidt on the Gauss-Newton step
        let projection = dot(&q1, gauss_newton_step);
        let mut q2 = Mat::from_fn(n, 1, |i, _| {
            gauss_newton_step[(i, 0)] - projection * q1[(i, 0)]
        });
        let q2_norm = q2.norm_l2();
        if q2_norm <= SUBSPACE_EPSILON * gauss_newton_step.norm_l2() || q2_norm <= f64::MIN_POSITIVE
        {
            trace!("Subspace is one-dimensional (|q2| = {:.3e})", q2_norm);
            return None;
        }
        for i in 0..n {
            q2[(i, 0)] /= q2_norm;
        }

        let m = jacobian.nrows();
        let mut jq1 = Mat::zeros(m, 1);
        let mut jq2 = Mat::zeros(m, 1);
        jacobian.right_multiply(&q1, &mut jq1);
        jacobian.right_multiply(&q2, &mut jq2);

        let off_diagonal = dot(&jq1, &jq2);
        let hessian = Matrix2::new(
            jq1.squared_norm_l2(),
            off_diagonal,
            off_diagonal,
            jq2.squared_norm_l2(),
        );
        let projected_gradient = Vector2::new(dot(&q1, gradient), dot(&q2, gradient));

        Some(Self {
            basis: [q1, q2],
            hessian,
            gradient: projected_gradient,
        })
    }

    /// Minimizer of the projected model inside the ball, mapped back to the
    /// full parameter space.
    pub fn minimize(&self, radius: f64) -> Mat<f64> {
        let y = solve_two_dimensional_subproblem(&self.hessian, &self.gradient, radius);
        let [q1, q2] = &self.basis;
        Mat::from_fn(q1.nrows(), 1, |i, _| y[0] * q1[(i, 0)] + y[1] * q2[(i, 0)])
    }

    pub fn hessian(&self) -> &Matrix2<f64> {
        &self.hessian
    }

    pub fn gradient(&self) -> &Vector2<f64> {
        &self.gradient
    }
}

/// Minimize `s^T y + 1/2 y^T H y` subject to `||y|| <= radius` for a symmetric
/// (possibly indefinite) 2x2 `H`.
pub fn solve_two_dimensional_subproblem(
    hessian: &Matrix2<f64>,
    gradient: &Vector2<f64>,
    radius: f64,
) -> Vector2<f64> {
    let eigen = SymmetricEigen::new(*hessian);
    let eigenvalues = eigen.eigenvalues;
    let eigenvectors = eigen.eigenvectors;
    let c = eigenvectors.transpose() * gradient;

    let (i_min, lambda_min) = if eigenvalues[0] <= eigenvalues[1] {
        (0, eigenvalues[0])
    } else {
        (1, eigenvalues[1])
    };
    let curvature_scale = eigenvalues.amax().max(f64::MIN_POSITIVE);
    let zero_curvature = EIGEN_TOLERANCE * curvature_scale;
    let gradient_norm = c.norm();

    // Step in eigen coordinates for a given shift
    let step_at = |shift: f64| {
        Vector2::new(
            -c[0] / (eigenvalues[0] + shift),
            -c[1] / (eigenvalues[1] + shift),
        )
    };

    if lambda_min > zero_curvature {
        let y = step_at(0.0);
        if y.norm() <= radius {
            return eigenvectors * y;
        }
    } else if gradient_norm <= f64::MIN_POSITIVE && lambda_min >= -zero_curvature {
        return Vector2::zeros();
    }

    let lower = (-lambda_min).max(0.0);

    // Hard case: no gradient component along the most negative curvature
    if c[i_min].abs() <= EIGEN_TOLERANCE * gradient_norm {
        let other = 1 - i_min;
        let denominator = eigenvalues[other] + lower;
        let y_other = if denominator > zero_curvature {
            -c[other] / denominator
        } else {
            0.0
        };
        if y_other.abs() <= radius {
            let tau = (radius * radius - y_other * y_other).max(0.0).sqrt();
            let mut y = Vector2::zeros();
            y[other] = y_other;
            y[i_min] = if c[i_min] > 0.0 { -tau } else { tau };
            trace!("Subspace hard case, shift {:.3e}", lower);
            return eigenvectors * y;
        }
    }

    // ||y(shift)|| <= radius holds at shift = lower + |s| / radius
    let mut lo = lower;
    let mut hi = lower + gradient_norm / radius;
    let mut shift = hi;
    for _ in 0..MAX_SECULAR_ITERATIONS {
        let y = step_at(shift);
        let norm = y.norm();
        if (norm - radius).abs() <= SECULAR_TOLERANCE * radius {
            break;
        }
        if norm > radius {
            lo = shift;
        } else {
            hi = shift;
        }

        let d0 = eigenvalues[0] + shift;
        let d1 = eigenvalues[1] + shift;
        let psi = 1.0 / norm - 1.0 / radius;
        let psi_prime = (c[0] * c[0] / (d0 * d0 * d0) + c[1] * c[1] / (d1 * d1 * d1))
            / (norm * norm * norm);
        let candidate = shift - psi / psi_prime;
        shift = if candidate.is_finite() && candidate > lo && candidate < hi {
            candidate
        } else {
            0.5 * (lo + hi)
        };
    }

    let mut y = step_at(shift);
    let norm = y.norm();
    if norm > radius {
        y *= radius / norm;
    }
    eigenvectors * y
}
