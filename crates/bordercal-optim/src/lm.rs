//! Levenberg–Marquardt backend.
//!
//! Problems expose residuals and a Jacobian over a flat parameter vector;
//! [`solve`] hands them to the MINPACK-style minimiser of the
//! `levenberg-marquardt` crate.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Non-linear least-squares problem over `f64` parameters.
pub trait NllsProblem {
    /// Residual vector at `x`, or `None` if `x` is outside the valid domain
    /// (e.g. a point moves behind the camera).
    fn residuals(&self, x: &DVector<f64>) -> Option<DVector<f64>>;

    /// Jacobian of [`Self::residuals`] at `x` (rows = residuals, cols = params).
    fn jacobian(&self, x: &DVector<f64>) -> Option<DMatrix<f64>>;
}

/// Stopping criteria, passed through to the minimiser.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Minimiser patience: at most `max_iterations * (n + 1)` residual
    /// evaluations for `n` parameters.
    pub max_iterations: usize,
    /// Relative cost reduction below which the solve is converged.
    pub ftol: f64,
    /// Relative step size below which the solve is converged.
    pub xtol: f64,
    /// Cosine between residuals and Jacobian columns below which the
    /// gradient counts as zero.
    pub gtol: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    ResidualsZero,
    CostConverged,
    StepConverged,
    GradientConverged,
    /// The minimiser cannot reduce the cost any further.
    Stalled,
    MaxIterations,
    /// Residuals or Jacobian could not be evaluated at the start point.
    InvalidStart,
}

impl Termination {
    pub fn was_successful(self) -> bool {
        !matches!(self, Termination::MaxIterations | Termination::InvalidStart)
    }
}

impl From<&TerminationReason> for Termination {
    fn from(reason: &TerminationReason) -> Self {
        match reason {
            TerminationReason::ResidualsZero => Termination::ResidualsZero,
            TerminationReason::Orthogonal => Termination::GradientConverged,
            TerminationReason::Converged { ftol: true, .. } => Termination::CostConverged,
            TerminationReason::Converged { .. } => Termination::StepConverged,
            TerminationReason::LostPatience => Termination::MaxIterations,
            _ => Termination::Stalled,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    /// Residual evaluations spent by the minimiser.
    pub evaluations: usize,
    pub initial_cost: f64,
    /// `½‖r‖²` at the returned parameters.
    pub final_cost: f64,
    pub termination: Termination,
}

struct LmWrapper<'a, P: ?Sized> {
    problem: &'a P,
    params: DVector<f64>,
    /// Lowest-cost parameters evaluated so far.
    best: RefCell<(f64, DVector<f64>)>,
}

impl<P: NllsProblem + ?Sized> LeastSquaresProblem<f64, Dyn, Dyn> for LmWrapper<'_, P> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self.problem.residuals(&self.params).filter(all_finite)?;
        let c = 0.5 * r.norm_squared();
        let mut best = self.best.borrow_mut();
        if c < best.0 {
            *best = (c, self.params.clone());
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        self.problem
            .jacobian(&self.params)
            .filter(|j| j.iter().all(|v| v.is_finite()))
    }
}

/// Minimise `problem` starting from `x0`.
///
/// The returned parameters always evaluate to finite residuals: if the
/// minimiser stops on a point outside the problem's domain, the best point
/// it visited is returned with [`Termination::Stalled`].
pub fn solve<P: NllsProblem + ?Sized>(
    problem: &P,
    x0: DVector<f64>,
    opts: &SolverOptions,
) -> (DVector<f64>, SolveReport) {
    let Some(initial_cost) = cost(problem, &x0) else {
        return (x0, invalid_start());
    };

    let lm = LevenbergMarquardt::new()
        .with_ftol(opts.ftol)
        .with_xtol(opts.xtol)
        .with_gtol(opts.gtol)
        .with_patience(opts.max_iterations.max(1));
    let wrapper = LmWrapper {
        problem,
        params: x0.clone(),
        best: RefCell::new((initial_cost, x0)),
    };
    let (wrapper, report) = lm.minimize(wrapper);
    let mut termination = Termination::from(&report.termination);

    let (x, final_cost) = match cost(problem, &wrapper.params) {
        Some(c) => (wrapper.params, c),
        None => {
            log::debug!("lm: stopped outside the domain ({:?})", report.termination);
            termination = Termination::Stalled;
            let (c, x) = wrapper.best.into_inner();
            (x, c)
        }
    };

    log::trace!(
        "lm: {:?} after {} evaluations, cost {initial_cost:.3e} -> {final_cost:.3e}",
        report.termination,
        report.number_of_evaluations
    );

    (
        x,
        SolveReport {
            evaluations: report.number_of_evaluations,
            initial_cost,
            final_cost,
            termination,
        },
    )
}

fn cost<P: NllsProblem + ?Sized>(problem: &P, x: &DVector<f64>) -> Option<f64> {
    problem
        .residuals(x)
        .filter(all_finite)
        .map(|r| 0.5 * r.norm_squared())
}

fn invalid_start() -> SolveReport {
    SolveReport {
        evaluations: 0,
        initial_cost: f64::NAN,
        final_cost: f64::NAN,
        termination: Termination::InvalidStart,
    }
}

fn all_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}
