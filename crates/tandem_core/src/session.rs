//! Solve sessions: the implicit-analysis engine.
//!
//! A session owns an expression tape, the decision variables declared on it
//! and the rows registered against it. It moves through
//! `Building -> Solving -> Solved -> Closed` (or straight to `Closed` when the
//! solver fails) and is solved at most once.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use anyhow::{anyhow, Context};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::solvers::{
    BlockJacobians, BlockValues, LevenbergMarquardt, NonlinearProblem, NonlinearSolver,
    SolveOptions, SolveReport,
};
use crate::value::{Shape, Value};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a session, carried by every symbolic value it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Building,
    Solving,
    Solved,
    Closed,
}

/// A decision variable to declare on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub shape: Shape,
    pub initial_guess: Vec<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Declaration {
    pub fn scalar(name: impl Into<String>, initial_guess: f64) -> Self {
        Self {
            name: name.into(),
            shape: Shape::Scalar,
            initial_guess: vec![initial_guess],
            lower: None,
            upper: None,
        }
    }

    pub fn vector(name: impl Into<String>, initial_guess: impl Into<Vec<f64>>) -> Self {
        let initial_guess = initial_guess.into();
        Self {
            name: name.into(),
            shape: Shape::Vector(initial_guess.len()),
            initial_guess,
            lower: None,
            upper: None,
        }
    }

    /// A vector of `len` elements all starting at `initial_guess`.
    pub fn filled(name: impl Into<String>, len: usize, initial_guess: f64) -> Self {
        Self::vector(name, vec![initial_guess; len])
    }

    pub fn lower(mut self, bound: f64) -> Self {
        self.lower = Some(bound);
        self
    }

    pub fn upper(mut self, bound: f64) -> Self {
        self.upper = Some(bound);
        self
    }

    pub fn bounds(self, lower: f64, upper: f64) -> Self {
        self.lower(lower).upper(upper)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidDeclaration {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.initial_guess.len() != self.shape.len() {
            return Err(Error::ShapeMismatch {
                operation: "declare_variable",
                left: self.shape,
                right: Shape::Vector(self.initial_guess.len()),
            });
        }
        if self.initial_guess.iter().any(|v| !v.is_finite()) {
            return Err(invalid("initial guess must be finite"));
        }
        if self.lower.is_some_and(f64::is_nan) || self.upper.is_some_and(f64::is_nan) {
            return Err(invalid("bounds must not be NaN"));
        }
        if let (Some(lo), Some(hi)) = (self.lower, self.upper) {
            if lo > hi {
                return Err(invalid("lower bound exceeds upper bound"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct VariableRecord {
    name: String,
    shape: Shape,
    offset: usize,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    phase: Phase,
    graph: Graph,
    variables: Vec<VariableRecord>,
    names: HashSet<String>,
    initial: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    residuals: Vec<NodeId>,
    constraints: Vec<NodeId>,
    constraint_lower: Vec<f64>,
    constraint_upper: Vec<f64>,
    objective: Vec<NodeId>,
    solution: Option<DVector<f64>>,
    report: Option<SolveReport>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::Building,
            graph: Graph::new(),
            variables: Vec::new(),
            names: HashSet::new(),
            initial: Vec::new(),
            lower: Vec::new(),
            upper: Vec::new(),
            residuals: Vec::new(),
            constraints: Vec::new(),
            constraint_lower: Vec::new(),
            constraint_upper: Vec::new(),
            objective: Vec::new(),
            solution: None,
            report: None,
        }
    }
}

/// Non-owning link from a symbolic value back to its session.
///
/// Never keeps the session alive; once the session is closed or dropped every
/// use fails with [`Error::StaleSymbolicHandle`].
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    state: Weak<RwLock<SessionState>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.state.upgrade().is_some_and(|state| {
            state.read().unwrap_or_else(PoisonError::into_inner).phase != Phase::Closed
        })
    }

    /// Runs `f` against the session's tape.
    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&mut Graph) -> R) -> Result<R> {
        let stale = Error::StaleSymbolicHandle { session: self.id };
        let state = self.state.upgrade().ok_or(stale)?;
        let mut state = state.write().unwrap_or_else(PoisonError::into_inner);
        if state.phase == Phase::Closed {
            return Err(Error::StaleSymbolicHandle { session: self.id });
        }
        Ok(f(&mut state.graph))
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

/// Concrete results of a solved session, keyed by variable name.
#[derive(Debug, Clone)]
pub struct Solution {
    pub session: SessionId,
    pub report: SolveReport,
    pub values: BTreeMap<String, Value>,
}

impl Solution {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// An embedded nonlinear program built by running analysis code on symbolic
/// values.
///
/// Registration is serialized by the caller (`&self` methods take an internal
/// write lock); `value_of` only takes a read lock and may be called from
/// several threads once the session is solved.
pub struct Session {
    id: SessionId,
    state: Arc<RwLock<SessionState>>,
    solver: Box<dyn NonlinearSolver>,
}

impl Session {
    /// A session using the default [`LevenbergMarquardt`] backend.
    pub fn new() -> Self {
        Self::with_solver(LevenbergMarquardt::default())
    }

    pub fn with_solver(solver: impl NonlinearSolver + 'static) -> Self {
        let id = SessionId::next();
        debug!("session {id}: created");
        Self {
            id,
            state: Arc::new(RwLock::new(SessionState::new())),
            solver: Box::new(solver),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.read().phase
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Declares a decision variable and returns it as a symbolic value.
    pub fn declare_variable(&self, declaration: Declaration) -> Result<Value> {
        declaration.validate()?;
        let mut state = self.write();
        self.ensure_building(&state)?;
        if state.names.contains(&declaration.name) {
            return Err(Error::InvalidDeclaration {
                name: declaration.name,
                reason: "a variable with this name already exists".to_string(),
            });
        }

        let offset = state.initial.len();
        let len = declaration.shape.len();
        let lower = declaration.lower.unwrap_or(f64::NEG_INFINITY);
        let upper = declaration.upper.unwrap_or(f64::INFINITY);
        state.initial.extend_from_slice(&declaration.initial_guess);
        state.lower.extend(std::iter::repeat(lower).take(len));
        state.upper.extend(std::iter::repeat(upper).take(len));
        let nodes: Vec<NodeId> = (offset..offset + len)
            .map(|idx| state.graph.variable(idx))
            .collect();

        debug!(
            "session {}: declared `{}` ({}) at offset {offset}",
            self.id, declaration.name, declaration.shape
        );
        state.names.insert(declaration.name.clone());
        state.variables.push(VariableRecord {
            name: declaration.name,
            shape: declaration.shape,
            offset,
        });
        Ok(Value::symbolic(nodes, declaration.shape, self.handle()))
    }

    /// Registers equality residuals: every element must be zero at a solution.
    pub fn add_residual(&self, expr: &Value) -> Result<()> {
        let nodes = self.own_nodes(expr)?;
        let mut state = self.write();
        self.ensure_building(&state)?;
        state.residuals.extend(nodes);
        Ok(())
    }

    /// Registers inequality constraints `lower <= expr <= upper`, elementwise.
    pub fn add_constraint(
        &self,
        expr: &Value,
        lower: Option<f64>,
        upper: Option<f64>,
    ) -> Result<()> {
        if lower.is_none() && upper.is_none() {
            return Err(Error::InvalidArgument {
                operation: "add_constraint",
                reason: "at least one bound is required".to_string(),
            });
        }
        let lo = lower.unwrap_or(f64::NEG_INFINITY);
        let hi = upper.unwrap_or(f64::INFINITY);
        if lo.is_nan() || hi.is_nan() || lo > hi {
            return Err(Error::InvalidArgument {
                operation: "add_constraint",
                reason: format!("invalid bounds [{lo}, {hi}]"),
            });
        }
        let nodes = self.own_nodes(expr)?;
        let mut state = self.write();
        self.ensure_building(&state)?;
        let count = nodes.len();
        state.constraints.extend(nodes);
        state.constraint_lower.extend(std::iter::repeat(lo).take(count));
        state.constraint_upper.extend(std::iter::repeat(hi).take(count));
        Ok(())
    }

    /// Registers least-squares terms: the solver minimizes the sum of their squares.
    pub fn add_least_squares(&self, expr: &Value) -> Result<()> {
        let nodes = self.own_nodes(expr)?;
        let mut state = self.write();
        self.ensure_building(&state)?;
        state.objective.extend(nodes);
        Ok(())
    }

    /// Solves the registered program with this session's backend.
    ///
    /// On failure the session is closed and no partial solution is kept.
    pub fn solve(&self, options: &SolveOptions) -> Result<SolveReport> {
        options.validate()?;
        let problem = {
            let mut state = self.write();
            self.ensure_building(&state)?;
            state.phase = Phase::Solving;
            debug!(
                "session {}: solving {} variables, {} residuals, {} constraints, {} least-squares terms",
                self.id,
                state.initial.len(),
                state.residuals.len(),
                state.constraints.len(),
                state.objective.len()
            );
            TapeProblem::from_state(&state)
        };

        let outcome = self.solver.solve(&problem, options);
        let mut state = self.write();
        match outcome {
            Ok(outcome) if outcome.converged => {
                let report = SolveReport {
                    iterations: outcome.iterations,
                    residual_norm: outcome.residual_norm,
                    objective: outcome.objective,
                };
                debug!(
                    "session {}: solved in {} iterations (residual {:.3e})",
                    self.id, report.iterations, report.residual_norm
                );
                state.solution = Some(outcome.x);
                state.report = Some(report);
                state.phase = Phase::Solved;
                Ok(report)
            }
            Ok(outcome) => {
                warn!(
                    "session {}: no convergence after {} iterations (residual {:.3e})",
                    self.id, outcome.iterations, outcome.residual_norm
                );
                Self::close_state(&mut state);
                Err(Error::Convergence {
                    session: self.id,
                    iterations: outcome.iterations,
                    residual_norm: outcome.residual_norm,
                })
            }
            Err(source) => {
                warn!("session {}: solver backend failed: {source:#}", self.id);
                Self::close_state(&mut state);
                Err(Error::Backend {
                    session: self.id,
                    source,
                })
            }
        }
    }

    /// Concrete value of any expression of this session at the solution.
    /// Concrete inputs are returned unchanged.
    pub fn value_of(&self, value: &Value) -> Result<Value> {
        let state = self.read();
        let solution = self.solution(&state)?;
        let symbolic = match value {
            Value::Concrete(_) => return Ok(value.clone()),
            Value::Symbolic(s) => s,
        };
        if symbolic.session.id() != self.id {
            return Err(Error::ForeignSession {
                session: self.id,
                found: Some(symbolic.session.id()),
            });
        }
        let data = state
            .graph
            .evaluate_rows(solution, &symbolic.nodes)
            .map_err(|source| Error::Backend {
                session: self.id,
                source,
            })?;
        Ok(Value::concrete(data, symbolic.shape))
    }

    /// All declared variables at the solution.
    pub fn results(&self) -> Result<Solution> {
        let state = self.read();
        let solution = self.solution(&state)?;
        let report = state.report.ok_or(Error::NotYetSolved { session: self.id })?;
        let values = state
            .variables
            .iter()
            .map(|var| {
                let data = solution.rows(var.offset, var.shape.len()).into_owned();
                (var.name.clone(), Value::concrete(data, var.shape))
            })
            .collect();
        Ok(Solution {
            session: self.id,
            report,
            values,
        })
    }

    /// Ends the session. Symbolic values it produced become stale.
    pub fn close(&self) {
        let mut state = self.write();
        if state.phase != Phase::Closed {
            Self::close_state(&mut state);
            debug!("session {}: closed", self.id);
        }
    }

    fn close_state(state: &mut SessionState) {
        state.phase = Phase::Closed;
        state.graph = Graph::new();
        state.solution = None;
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_building(&self, state: &SessionState) -> Result<()> {
        match state.phase {
            Phase::Building => Ok(()),
            Phase::Solving | Phase::Solved => Err(Error::AlreadySolved { session: self.id }),
            Phase::Closed => Err(Error::SessionClosed { session: self.id }),
        }
    }

    fn solution<'a>(&self, state: &'a SessionState) -> Result<&'a DVector<f64>> {
        match state.phase {
            Phase::Building | Phase::Solving => Err(Error::NotYetSolved { session: self.id }),
            Phase::Closed => Err(Error::SessionClosed { session: self.id }),
            Phase::Solved => state
                .solution
                .as_ref()
                .ok_or(Error::NotYetSolved { session: self.id }),
        }
    }

    fn own_nodes(&self, expr: &Value) -> Result<Vec<NodeId>> {
        match expr {
            Value::Symbolic(s) if s.session.id() == self.id => Ok(s.nodes.clone()),
            other => Err(Error::ForeignSession {
                session: self.id,
                found: other.session_id(),
            }),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Snapshot of a session's program, detached from the lock while solving.
struct TapeProblem {
    graph: Graph,
    initial: DVector<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    constraint_lower: Vec<f64>,
    constraint_upper: Vec<f64>,
    rows: Vec<NodeId>,
    residual_rows: usize,
    constraint_rows: usize,
}

impl TapeProblem {
    fn from_state(state: &SessionState) -> Self {
        let rows: Vec<NodeId> = state
            .residuals
            .iter()
            .chain(&state.constraints)
            .chain(&state.objective)
            .copied()
            .collect();
        Self {
            graph: state.graph.clone(),
            initial: DVector::from_column_slice(&state.initial),
            lower: state.lower.clone(),
            upper: state.upper.clone(),
            constraint_lower: state.constraint_lower.clone(),
            constraint_upper: state.constraint_upper.clone(),
            rows,
            residual_rows: state.residuals.len(),
            constraint_rows: state.constraints.len(),
        }
    }

    fn objective_rows(&self) -> usize {
        self.rows.len() - self.residual_rows - self.constraint_rows
    }
}

impl NonlinearProblem for TapeProblem {
    fn dimension(&self) -> usize {
        self.initial.len()
    }

    fn initial_guess(&self) -> DVector<f64> {
        self.initial.clone()
    }

    fn lower_bounds(&self) -> &[f64] {
        &self.lower
    }

    fn upper_bounds(&self) -> &[f64] {
        &self.upper
    }

    fn constraint_lower(&self) -> &[f64] {
        &self.constraint_lower
    }

    fn constraint_upper(&self) -> &[f64] {
        &self.constraint_upper
    }

    fn evaluate(&self, x: &DVector<f64>) -> anyhow::Result<BlockValues> {
        let all = self
            .graph
            .evaluate_rows(x, &self.rows)
            .context("Failed to evaluate session rows")?;
        let (r, c, o) = (
            self.residual_rows,
            self.constraint_rows,
            self.objective_rows(),
        );
        Ok(BlockValues {
            residuals: all.rows(0, r).into_owned(),
            constraints: all.rows(r, c).into_owned(),
            objective: all.rows(r + c, o).into_owned(),
        })
    }

    fn jacobian(&self, x: &DVector<f64>) -> anyhow::Result<BlockJacobians> {
        let all: DMatrix<f64> = self
            .graph
            .jacobian(x, &self.rows)
            .context("Failed to differentiate session rows")?;
        if all.iter().any(|v| v.is_nan()) {
            return Err(anyhow!(
                "Jacobian contains NaN entries; an operation was evaluated outside its domain."
            ));
        }
        let (r, c, o) = (
            self.residual_rows,
            self.constraint_rows,
            self.objective_rows(),
        );
        Ok(BlockJacobians {
            residuals: all.rows(0, r).into_owned(),
            constraints: all.rows(r, c).into_owned(),
            objective: all.rows(r + c, o).into_owned(),
        })
    }
}
