//! Jacobian operations needed by trust region strategies.
//!
//! Strategies never touch the Jacobian storage directly. They only need
//! matrix-vector products in both directions, the per-column norms used for
//! diagonal scaling and the dimensions. [`SparseMatrix`] collects exactly
//! those operations and is implemented for faer's compressed sparse column
//! matrix.

use faer::{Mat, sparse::SparseColMat};

/// Read-only view of a (sparse) Jacobian matrix.
///
/// Vectors are faer column matrices (`n x 1`), following the rest of the
/// crate. The products accumulate into `y` instead of overwriting it, so
/// callers that want `y = A x` must zero `y` first.
pub trait SparseMatrix {
    /// Number of rows (residuals).
    fn num_rows(&self) -> usize;

    /// Number of columns (parameters).
    fn num_cols(&self) -> usize;

    /// `y += A * x`
    fn right_multiply(&self, x: &Mat<f64>, y: &mut Mat<f64>);

    /// `y += A^T * x`
    fn left_multiply(&self, x: &Mat<f64>, y: &mut Mat<f64>);

    /// Squared L2 norm of every column, as an `n x 1` vector.
    fn squared_column_norm(&self) -> Mat<f64>;

    /// L2 norm of every column, as an `n x 1` vector.
    fn column_norm(&self) -> Mat<f64> {
        let squared = self.squared_column_norm();
        Mat::from_fn(squared.nrows(), 1, |i, _| squared[(i, 0)].sqrt())
    }

    /// Structural non-zeros as `(row, col)` pairs in storage order.
    fn sparsity_pattern(&self) -> Vec<(usize, usize)>;
}

impl SparseMatrix for SparseColMat<usize, f64> {
    fn num_rows(&self) -> usize {
        self.nrows()
    }

    fn num_cols(&self) -> usize {
        self.ncols()
    }

    fn right_multiply(&self, x: &Mat<f64>, y: &mut Mat<f64>) {
        *y += self.as_ref() * x;
    }

    fn left_multiply(&self, x: &Mat<f64>, y: &mut Mat<f64>) {
        *y += self.as_ref().transpose() * x;
    }

    fn squared_column_norm(&self) -> Mat<f64> {
        let mut norms = Mat::zeros(self.ncols(), 1);
        for t in self.triplet_iter() {
            norms[(t.col, 0)] += t.val * t.val;
        }
        norms
    }

    fn sparsity_pattern(&self) -> Vec<(usize, usize)> {
        self.triplet_iter().map(|t| (t.row, t.col)).collect()
    }
}

/// Dot product of two column vectors, `a^T b`.
pub fn dot(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    let product = a.transpose() * b;
    product[(0, 0)]
}
