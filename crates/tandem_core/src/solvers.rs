use anyhow::{bail, Result};
use log::{log, Level};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Options accepted by [`Session::solve`](crate::session::Session::solve).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    /// Caps the number of solver iterations.
    pub max_iterations: usize,
    /// Convergence threshold on the residual norm.
    pub tolerance: f64,
    /// Emit per-iteration progress at `Info` instead of `Debug`.
    pub verbose: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
            verbose: false,
        }
    }
}

impl SolveOptions {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::InvalidOptions(
                "max_iterations must be greater than zero".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(Error::InvalidOptions(
                "tolerance must be positive and finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary of a converged solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    pub iterations: usize,
    /// L2 norm of equality residuals and constraint violations at the solution.
    pub residual_norm: f64,
    /// Sum of squares of the least-squares terms (zero when there are none).
    pub objective: f64,
}

/// Values of the three row blocks of a problem at one point.
#[derive(Debug, Clone)]
pub struct BlockValues {
    pub residuals: DVector<f64>,
    pub constraints: DVector<f64>,
    pub objective: DVector<f64>,
}

/// Jacobians of the three row blocks, one column per decision variable.
#[derive(Debug, Clone)]
pub struct BlockJacobians {
    pub residuals: DMatrix<f64>,
    pub constraints: DMatrix<f64>,
    pub objective: DMatrix<f64>,
}

/// What a solve session hands to a solver backend.
///
/// Equality residuals must reach zero, constraint rows must land inside
/// their bounds, and objective rows are minimized in the least-squares
/// sense. Absent bounds are infinite.
pub trait NonlinearProblem {
    fn dimension(&self) -> usize;

    fn initial_guess(&self) -> DVector<f64>;

    fn lower_bounds(&self) -> &[f64];

    fn upper_bounds(&self) -> &[f64];

    fn constraint_lower(&self) -> &[f64];

    fn constraint_upper(&self) -> &[f64];

    fn evaluate(&self, x: &DVector<f64>) -> Result<BlockValues>;

    fn jacobian(&self, x: &DVector<f64>) -> Result<BlockJacobians>;
}

/// Result of a backend run. A backend reports non-convergence through
/// `converged = false`, never through a partially valid `x`.
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub x: DVector<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub residual_norm: f64,
    pub objective: f64,
}

/// A pluggable nonlinear solver backend owned by a session.
pub trait NonlinearSolver: Send + Sync {
    fn solve(&self, problem: &dyn NonlinearProblem, options: &SolveOptions)
        -> Result<SolverOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevenbergMarquardtConfig {
    pub initial_damping: f64,
    pub min_damping: f64,
    /// Giving up threshold: a step this heavily damped cannot make progress.
    pub max_damping: f64,
    pub damping_increase: f64,
    pub damping_decrease: f64,
    /// Relative size of the nudge applied at infeasible stationary points.
    pub perturbation: f64,
    /// Weight of the residual and violation rows in the first
    /// augmented-Lagrangian pass.
    pub initial_penalty: f64,
    /// Factor applied to the weight when a pass fails to cut the violation
    /// by [`SUFFICIENT_DECREASE`].
    pub penalty_growth: f64,
    pub max_penalty: f64,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            initial_damping: 1e-3,
            min_damping: 1e-12,
            max_damping: 1e12,
            damping_increase: 4.0,
            damping_decrease: 3.0,
            perturbation: 1e-2,
            initial_penalty: 10.0,
            penalty_growth: 10.0,
            max_penalty: 1e10,
        }
    }
}

/// Fraction by which one augmented-Lagrangian pass must reduce the
/// residual/violation norm before the penalty weight is left alone.
pub const SUFFICIENT_DECREASE: f64 = 0.25;

/// Projected Levenberg-Marquardt on the stacked rows
/// `[residuals; constraint violations; objective]`.
///
/// Constraint rows only contribute while violated (hinge rows), variable
/// bounds are enforced by projecting every iterate. At a stationary point that
/// is still infeasible the iterate is nudged by `perturbation` and the search
/// resumes; this is how a zero Jacobian at the initial guess is escaped.
///
/// When objective rows are combined with residuals or constraints the rows
/// are solved as an augmented Lagrangian: each pass minimizes
/// `||objective||^2 + mu * ||shifted violations||^2` with the damped search
/// above, then the multiplier shifts are updated and `mu` grows until the
/// residuals and constraints hold to `tolerance`.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
}

impl LevenbergMarquardt {
    pub fn new(config: LevenbergMarquardtConfig) -> crate::error::Result<Self> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(config.initial_damping)
            || !positive(config.min_damping)
            || !positive(config.max_damping)
        {
            return Err(Error::InvalidOptions(
                "damping limits must be positive and finite".to_string(),
            ));
        }
        if config.min_damping > config.max_damping {
            return Err(Error::InvalidOptions(
                "min_damping must not exceed max_damping".to_string(),
            ));
        }
        if !(config.damping_increase > 1.0 && config.damping_decrease > 1.0) {
            return Err(Error::InvalidOptions(
                "damping factors must be greater than one".to_string(),
            ));
        }
        if !positive(config.perturbation) {
            return Err(Error::InvalidOptions(
                "perturbation must be positive and finite".to_string(),
            ));
        }
        if !positive(config.initial_penalty)
            || !positive(config.max_penalty)
            || config.initial_penalty > config.max_penalty
        {
            return Err(Error::InvalidOptions(
                "penalty weights must be positive, finite and ordered".to_string(),
            ));
        }
        if !(config.penalty_growth > 1.0 && config.penalty_growth.is_finite()) {
            return Err(Error::InvalidOptions(
                "penalty_growth must be greater than one".to_string(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    fn augmented_lagrangian(
        &self,
        descent: &mut Descent<'_>,
        mut x: DVector<f64>,
        feasibility_rows: usize,
    ) -> Result<SolverOutcome> {
        let cfg = &self.config;
        let tolerance = descent.options.tolerance;
        let mut penalty = Penalty {
            weight: cfg.initial_penalty,
            multipliers: DVector::zeros(feasibility_rows),
        };
        let mut previous = f64::INFINITY;

        loop {
            let (next, rows, status) = descent.run(x, &penalty, Goal::Stationary)?;
            x = next;
            log!(
                descent.level,
                "penalty {:.1e}: residual {:.3e}, objective {:.3e}",
                penalty.weight,
                rows.feasibility,
                rows.objective_value()
            );
            if status == Status::Exhausted {
                return Ok(rows.outcome(x, false, descent.iterations));
            }
            if rows.feasibility <= tolerance {
                return Ok(rows.outcome(x, true, descent.iterations));
            }

            penalty.multipliers = &rows.shifted * penalty.weight;
            if rows.feasibility.is_nan() || rows.feasibility > SUFFICIENT_DECREASE * previous {
                penalty.weight *= cfg.penalty_growth;
                if penalty.weight > cfg.max_penalty {
                    log!(
                        descent.level,
                        "penalty exceeded {:.1e} with residual {:.3e}, giving up",
                        cfg.max_penalty,
                        rows.feasibility
                    );
                    return Ok(rows.outcome(x, false, descent.iterations));
                }
            }
            previous = rows.feasibility;
        }
    }
}

impl NonlinearSolver for LevenbergMarquardt {
    fn solve(
        &self,
        problem: &dyn NonlinearProblem,
        options: &SolveOptions,
    ) -> Result<SolverOutcome> {
        let n = problem.dimension();
        let lower = problem.lower_bounds();
        let upper = problem.upper_bounds();
        if lower.len() != n || upper.len() != n {
            bail!(
                "Bound dimension mismatch. Expected {}, got {} lower and {} upper.",
                n,
                lower.len(),
                upper.len()
            );
        }

        let x = project(&problem.initial_guess(), lower, upper);
        if x.len() != n {
            bail!(
                "Initial guess dimension mismatch. Expected {}, got {}.",
                n,
                x.len()
            );
        }
        let initial = problem.evaluate(&x)?;
        let feasibility_rows = initial.residuals.len() + initial.constraints.len();
        let has_objective = !initial.objective.is_empty();

        let mut descent = Descent {
            problem,
            options,
            config: &self.config,
            level: if options.verbose {
                Level::Info
            } else {
                Level::Debug
            },
            lower,
            upper,
            iterations: 0,
            damping: self.config.initial_damping,
        };

        if has_objective && feasibility_rows > 0 {
            return self.augmented_lagrangian(&mut descent, x, feasibility_rows);
        }
        let goal = if has_objective {
            Goal::Stationary
        } else {
            Goal::Feasible
        };
        let (x, rows, status) = descent.run(x, &Penalty::neutral(feasibility_rows), goal)?;
        Ok(rows.outcome(x, status == Status::Converged, descent.iterations))
    }
}

/// When a damped search stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    /// Residual and violation rows reach `tolerance`.
    Feasible,
    /// The merit has no descent direction left.
    Stationary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Converged,
    /// Damping exceeded `max_damping` before the goal was met.
    Stalled,
    /// `max_iterations` reached.
    Exhausted,
}

/// Augmented-Lagrangian weight and multipliers on the residual and
/// constraint rows.
struct Penalty {
    weight: f64,
    multipliers: DVector<f64>,
}

impl Penalty {
    /// Plain least squares: unit weight, no shift.
    fn neutral(rows: usize) -> Self {
        Self {
            weight: 1.0,
            multipliers: DVector::zeros(rows),
        }
    }
}

/// State shared by the passes of one backend run.
struct Descent<'a> {
    problem: &'a dyn NonlinearProblem,
    options: &'a SolveOptions,
    config: &'a LevenbergMarquardtConfig,
    level: Level,
    lower: &'a [f64],
    upper: &'a [f64],
    iterations: usize,
    damping: f64,
}

impl Descent<'_> {
    fn rows(&self, x: &DVector<f64>, penalty: &Penalty) -> Result<StackedRows> {
        StackedRows::new(
            self.problem.evaluate(x)?,
            self.problem.constraint_lower(),
            self.problem.constraint_upper(),
            penalty,
        )
    }

    fn run(
        &mut self,
        mut x: DVector<f64>,
        penalty: &Penalty,
        goal: Goal,
    ) -> Result<(DVector<f64>, StackedRows, Status)> {
        let cfg = self.config;
        let tolerance = self.options.tolerance;
        let (lower, upper) = (self.lower, self.upper);
        let mut rows = self.rows(&x, penalty)?;
        let mut linearization: Option<(DMatrix<f64>, DVector<f64>)> = None;
        let mut small_step = false;

        loop {
            if goal == Goal::Feasible && rows.feasibility <= tolerance {
                return Ok((x, rows, Status::Converged));
            }

            let (jacobian, gradient) = match linearization.take() {
                Some(cached) => cached,
                None => {
                    let jacobian = rows.jacobian(self.problem.jacobian(&x)?)?;
                    let gradient = jacobian.tr_mul(&rows.stacked);
                    (jacobian, gradient)
                }
            };
            let finite = jacobian.iter().all(|v| v.is_finite());
            let gradient_norm = projected_gradient_norm(&x, &gradient, lower, upper);
            let merit = rows.merit();
            let stationary = finite && gradient_norm <= f64::EPSILON * (1.0 + merit);

            if goal == Goal::Stationary
                && finite
                && (small_step || stationary || gradient_norm <= tolerance)
            {
                return Ok((x, rows, Status::Converged));
            }
            if self.iterations >= self.options.max_iterations {
                return Ok((x, rows, Status::Exhausted));
            }
            self.iterations += 1;
            let iterations = self.iterations;

            // No usable linearization here: a zero Jacobian away from the
            // goal, or an infinite slope such as sqrt at 0.
            if stationary || !finite {
                x = perturb(&x, lower, upper, cfg.perturbation);
                rows = self.rows(&x, penalty)?;
                small_step = false;
                log!(
                    self.level,
                    "iteration {iterations}: no descent at residual {:.3e}, perturbing iterate",
                    rows.feasibility
                );
                continue;
            }

            let mut normal = jacobian.tr_mul(&jacobian);
            for i in 0..normal.nrows() {
                normal[(i, i)] += self.damping;
            }
            let step = match normal.cholesky() {
                Some(factor) => factor.solve(&(-&gradient)),
                None => {
                    self.damping *= cfg.damping_increase;
                    linearization = Some((jacobian, gradient));
                    continue;
                }
            };

            let trial = project(&(&x + &step), lower, upper);
            let trial_rows = self.rows(&trial, penalty)?;
            let trial_merit = trial_rows.merit();

            if trial_merit.is_finite() && trial_merit < merit {
                let step_norm = (&trial - &x).norm();
                let reduction = (merit - trial_merit) / merit.max(f64::MIN_POSITIVE);
                small_step = step_norm <= tolerance * (x.norm() + tolerance)
                    || reduction <= tolerance;
                x = trial;
                rows = trial_rows;
                self.damping = (self.damping / cfg.damping_decrease).max(cfg.min_damping);
            } else {
                self.damping *= cfg.damping_increase;
                if self.damping > cfg.max_damping {
                    log!(
                        self.level,
                        "iteration {iterations}: damping exceeded {:.1e}, giving up",
                        cfg.max_damping
                    );
                    self.damping = cfg.initial_damping;
                    return Ok((x, rows, Status::Stalled));
                }
                linearization = Some((jacobian, gradient));
            }

            log!(
                self.level,
                "iteration {iterations}: residual {:.3e}, objective {:.3e}, damping {:.1e}",
                rows.feasibility,
                rows.objective_value(),
                self.damping
            );
        }
    }
}

/// Row values stacked as `[residuals; violations; objective]`, the first two
/// blocks shifted by the multipliers and scaled by `sqrt(weight)`.
struct StackedRows {
    stacked: DVector<f64>,
    /// Shifted residuals and violations before scaling.
    shifted: DVector<f64>,
    /// Norm of the unshifted residuals and violations.
    feasibility: f64,
    scale: f64,
    active: Vec<bool>,
    residual_rows: usize,
    constraint_rows: usize,
    objective_rows: usize,
}

impl StackedRows {
    fn new(
        values: BlockValues,
        c_lower: &[f64],
        c_upper: &[f64],
        penalty: &Penalty,
    ) -> Result<Self> {
        let m = values.constraints.len();
        if c_lower.len() != m || c_upper.len() != m {
            bail!(
                "Constraint bound dimension mismatch. Expected {}, got {} lower and {} upper.",
                m,
                c_lower.len(),
                c_upper.len()
            );
        }
        let residual_rows = values.residuals.len();
        let objective_rows = values.objective.len();
        if penalty.multipliers.len() != residual_rows + m {
            bail!("Multiplier count does not match the residual and constraint rows.");
        }
        let shift = |i: usize| penalty.multipliers[i] / penalty.weight;
        let scale = penalty.weight.sqrt();

        let mut raw = DVector::zeros(residual_rows + m);
        let mut shifted = DVector::zeros(residual_rows + m);
        let mut active = vec![false; m];
        for i in 0..residual_rows {
            raw[i] = values.residuals[i];
            shifted[i] = values.residuals[i] + shift(i);
        }
        for k in 0..m {
            let i = residual_rows + k;
            let g = values.constraints[k];
            raw[i] = violation(g, c_lower[k], c_upper[k]);
            shifted[i] = violation(g + shift(i), c_lower[k], c_upper[k]);
            active[k] = shifted[i] != 0.0;
        }

        let mut stacked = DVector::zeros(residual_rows + m + objective_rows);
        stacked
            .rows_mut(0, residual_rows + m)
            .copy_from(&(&shifted * scale));
        stacked
            .rows_mut(residual_rows + m, objective_rows)
            .copy_from(&values.objective);

        Ok(Self {
            stacked,
            shifted,
            feasibility: raw.norm(),
            scale,
            active,
            residual_rows,
            constraint_rows: m,
            objective_rows,
        })
    }

    fn jacobian(&self, blocks: BlockJacobians) -> Result<DMatrix<f64>> {
        let n = blocks.residuals.ncols();
        if blocks.residuals.nrows() != self.residual_rows
            || blocks.constraints.nrows() != self.constraint_rows
            || blocks.objective.nrows() != self.objective_rows
        {
            bail!("Jacobian block rows do not match the evaluated rows.");
        }
        let mut jacobian = DMatrix::zeros(self.stacked.len(), n);
        jacobian
            .rows_mut(0, self.residual_rows)
            .copy_from(&(&blocks.residuals * self.scale));
        for (k, &active) in self.active.iter().enumerate() {
            if active {
                jacobian
                    .row_mut(self.residual_rows + k)
                    .copy_from(&(blocks.constraints.row(k) * self.scale));
            }
        }
        jacobian
            .rows_mut(self.residual_rows + self.constraint_rows, self.objective_rows)
            .copy_from(&blocks.objective);
        Ok(jacobian)
    }

    fn objective_value(&self) -> f64 {
        self.stacked
            .rows(self.residual_rows + self.constraint_rows, self.objective_rows)
            .norm_squared()
    }

    fn merit(&self) -> f64 {
        self.stacked.norm_squared()
    }

    fn outcome(&self, x: DVector<f64>, converged: bool, iterations: usize) -> SolverOutcome {
        SolverOutcome {
            x,
            converged,
            iterations,
            residual_norm: self.feasibility,
            objective: self.objective_value(),
        }
    }
}

/// Signed distance of `g` outside `[lower, upper]`, zero inside.
fn violation(g: f64, lower: f64, upper: f64) -> f64 {
    if g > upper {
        g - upper
    } else if g < lower {
        g - lower
    } else {
        0.0
    }
}

fn project(x: &DVector<f64>, lower: &[f64], upper: &[f64]) -> DVector<f64> {
    DVector::from_fn(x.len(), |i, _| {
        let lo = lower.get(i).copied().unwrap_or(f64::NEG_INFINITY);
        let hi = upper.get(i).copied().unwrap_or(f64::INFINITY);
        x[i].max(lo).min(hi)
    })
}

fn perturb(x: &DVector<f64>, lower: &[f64], upper: &[f64], size: f64) -> DVector<f64> {
    DVector::from_fn(x.len(), |i, _| {
        let delta = size * (1.0 + x[i].abs());
        if x[i] + delta <= upper[i] {
            x[i] + delta
        } else {
            (x[i] - delta).max(lower[i])
        }
    })
}

/// Infinity norm of the gradient, ignoring components that push an iterate
/// further into an active bound.
fn projected_gradient_norm(
    x: &DVector<f64>,
    gradient: &DVector<f64>,
    lower: &[f64],
    upper: &[f64],
) -> f64 {
    gradient
        .iter()
        .enumerate()
        .filter(|&(i, &g)| !((x[i] >= upper[i] && g < 0.0) || (x[i] <= lower[i] && g > 0.0)))
        .fold(0.0, |acc, (_, g)| acc.max(g.abs()))
}
