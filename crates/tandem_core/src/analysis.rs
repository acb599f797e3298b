//! The two analysis categories.
//!
//! An explicit analysis is a direct formula over [`Value`]s and runs the same
//! way on concrete and symbolic inputs. An implicit analysis is itself an
//! embedded nonlinear program: it declares unknowns and residuals on a
//! [`Session`] and its outputs only have numbers once that session is solved.

use log::debug;

use crate::error::{Error, Result};
use crate::session::Session;
use crate::solvers::SolveOptions;
use crate::value::Value;

/// A pure function from input values to output values.
///
/// Must not branch natively on inputs that may be symbolic; conditional logic
/// goes through [`select`](crate::dispatch::select).
pub trait ExplicitAnalysis {
    fn evaluate(&self, inputs: &[Value]) -> Result<Vec<Value>>;
}

impl<F> ExplicitAnalysis for F
where
    F: Fn(&[Value]) -> Result<Vec<Value>>,
{
    fn evaluate(&self, inputs: &[Value]) -> Result<Vec<Value>> {
        self(inputs)
    }
}

/// An analysis whose outputs are defined by residuals rather than a formula.
pub trait ImplicitAnalysis {
    /// Declares the analysis unknowns on `session`, registers its residuals
    /// and constraints, and returns its (symbolic) outputs.
    ///
    /// Variable names must be unique within the session, so an analysis that
    /// may be flattened more than once into one session should prefix them.
    fn build(&self, session: &Session, inputs: &[Value]) -> Result<Vec<Value>>;

    /// Runs the analysis in a fresh session of its own and returns concrete
    /// outputs. The sub-session is closed before returning.
    fn solve_separately(&self, inputs: &[Value], options: &SolveOptions) -> Result<Vec<Value>> {
        let sub = Session::new();
        if let Some(outer) = inputs.iter().find_map(Value::session_id) {
            return Err(Error::MixedSession {
                operation: "solve_separately",
                left: outer,
                right: sub.id(),
            });
        }
        debug!("session {}: separate sub-solve", sub.id());
        let outputs = self.build(&sub, inputs)?;
        sub.solve(options)?;
        let concrete = outputs
            .iter()
            .map(|output| sub.value_of(output))
            .collect::<Result<Vec<_>>>();
        sub.close();
        concrete
    }
}

/// How an implicit analysis nests inside surrounding work.
#[derive(Debug, Clone, Copy)]
pub enum Nesting<'a> {
    /// Register everything in the enclosing session; outputs stay symbolic
    /// and are solved together with the caller's own residuals.
    Flatten(&'a Session),
    /// Solve in a separate, already-closed sub-session and feed its concrete
    /// outputs back as constants.
    Separate(&'a SolveOptions),
}

/// Either analysis category behind one call.
#[derive(Clone, Copy)]
pub enum Analysis<'a> {
    Explicit(&'a dyn ExplicitAnalysis),
    Implicit(&'a dyn ImplicitAnalysis),
}

impl Analysis<'_> {
    /// Runs the analysis. Explicit analyses ignore `nesting`.
    pub fn run(&self, inputs: &[Value], nesting: Nesting<'_>) -> Result<Vec<Value>> {
        match (self, nesting) {
            (Analysis::Explicit(analysis), _) => analysis.evaluate(inputs),
            (Analysis::Implicit(analysis), Nesting::Flatten(session)) => {
                analysis.build(session, inputs)
            }
            (Analysis::Implicit(analysis), Nesting::Separate(options)) => {
                analysis.solve_separately(inputs, options)
            }
        }
    }
}
