//! Fit y = a exp(b t) to noisy samples with the dogleg strategy.
//!
//! Run with:
//! ```bash
//! cargo run --example curve_fitting --features logging
//! RUST_LOG=debug cargo run --example curve_fitting --features logging
//! ```

use apex_trust_region::{
    DoglegType, LinearSolverType, PerSolveOptions, SparseMatrix, TrustRegionStrategyOptions,
    create_trust_region_strategy, init_logger,
};
use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use tracing::{info, warn};
use web_time::Instant;

const MAX_ITERATIONS: usize = 100;
const MIN_RELATIVE_DECREASE: f64 = 1e-3;
const GRADIENT_TOLERANCE: f64 = 1e-10;
const COST_TOLERANCE: f64 = 1e-12;

struct Samples {
    t: Vec<f64>,
    y: Vec<f64>,
}

impl Samples {
    /// Deterministic pseudo-noise so runs are reproducible
    fn generate(a: f64, b: f64, count: usize) -> Self {
        let t: Vec<f64> = (0..count).map(|i| 0.1 * i as f64).collect();
        let y = t
            .iter()
            .enumerate()
            .map(|(i, &t)| a * (b * t).exp() + 0.01 * ((i as f64) * 1.7).sin())
            .collect();
        Self { t, y }
    }

    fn residuals(&self, x: &[f64]) -> Mat<f64> {
        Mat::from_fn(self.t.len(), 1, |i, _| {
            x[0] * (x[1] * self.t[i]).exp() - self.y[i]
        })
    }

    fn jacobian(&self, x: &[f64]) -> Result<SparseColMat<usize, f64>, Box<dyn std::error::Error>> {
        let triplets: Vec<_> = self
            .t
            .iter()
            .enumerate()
            .flat_map(|(i, &t)| {
                let e = (x[1] * t).exp();
                [Triplet::new(i, 0, e), Triplet::new(i, 1, x[0] * t * e)]
            })
            .collect();
        Ok(SparseColMat::try_new_from_triplets(
            self.t.len(),
            2,
            &triplets,
        )?)
    }
}

fn cost(residuals: &Mat<f64>) -> f64 {
    0.5 * residuals.norm_l2().powi(2)
}

fn fit(
    samples: &Samples,
    options: TrustRegionStrategyOptions,
) -> Result<Vec<f64>, Box<dyn std::error::Error>> {
    let label = format!("{} / {}", options.linear_solver_type, options.dogleg_type);
    let mut strategy = create_trust_region_strategy(options)?;
    let per_solve = PerSolveOptions::default();

    let mut x = vec![1.0, 0.0];
    let mut residuals = samples.residuals(&x);
    let mut jacobian = samples.jacobian(&x)?;
    let mut current_cost = cost(&residuals);
    let start = Instant::now();

    info!("{label}: initial cost {:.6e}", current_cost);
    info!(
        "{:>4} {:>14} {:>12} {:>12} {:>10} {:>10}",
        "iter", "cost", "cost_change", "|gradient|", "|step|", "radius"
    );

    for iteration in 0..MAX_ITERATIONS {
        let mut gradient = Mat::zeros(2, 1);
        jacobian.left_multiply(&residuals, &mut gradient);
        if gradient.norm_max() < GRADIENT_TOLERANCE {
            info!("{label}: gradient tolerance reached");
            break;
        }

        let radius = strategy.radius();
        let result = strategy.compute_step(&per_solve, &jacobian, &residuals);
        let Some(step) = result.step else {
            warn!("{label}: step computation failed: {}", result.summary);
            strategy.step_is_invalid();
            continue;
        };

        let mut model_residuals = residuals.clone();
        jacobian.right_multiply(&step, &mut model_residuals);
        let predicted = current_cost - cost(&model_residuals);

        let candidate = vec![x[0] + step[(0, 0)], x[1] + step[(1, 0)]];
        let candidate_residuals = samples.residuals(&candidate);
        let candidate_cost = cost(&candidate_residuals);
        if !candidate_cost.is_finite() {
            strategy.step_is_invalid();
            continue;
        }

        let actual = current_cost - candidate_cost;
        let step_quality = if predicted > 0.0 {
            actual / predicted
        } else {
            -1.0
        };

        info!(
            "{:>4} {:>14.6e} {:>12.3e} {:>12.3e} {:>10.3e} {:>10.3e}",
            iteration,
            current_cost,
            actual,
            gradient.norm_max(),
            step.norm_l2(),
            radius
        );

        if step_quality > MIN_RELATIVE_DECREASE {
            strategy.step_accepted(step_quality);
            x = candidate;
            residuals = candidate_residuals;
            jacobian = samples.jacobian(&x)?;
            if actual < COST_TOLERANCE * current_cost {
                current_cost = candidate_cost;
                info!("{label}: function tolerance reached");
                break;
            }
            current_cost = candidate_cost;
        } else {
            strategy.step_rejected(step_quality);
        }
    }

    info!(
        "{label}: final cost {:.6e}, a = {:.6}, b = {:.6}, {:.2} ms",
        current_cost,
        x[0],
        x[1],
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(x)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();

    let samples = Samples::generate(2.5, -0.8, 60);
    info!("Fitting y = a exp(b t) to {} samples", samples.t.len());

    for linear_solver_type in [LinearSolverType::SparseCholesky, LinearSolverType::SparseQR] {
        for dogleg_type in [DoglegType::Traditional, DoglegType::Subspace] {
            let options = TrustRegionStrategyOptions::new()
                .with_linear_solver_type(linear_solver_type)
                .with_dogleg_type(dogleg_type)
                .with_initial_radius(1.0);
            fit(&samples, options)?;
        }
    }
    Ok(())
}
