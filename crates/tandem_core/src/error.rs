use thiserror::Error;

use crate::session::SessionId;
use crate::value::{Kind, Shape};

/// Errors raised by the dispatch layer, the analysis protocol and solve sessions.
///
/// None of these are retried internally; a caller that wants to retry (for
/// example `solve()` from a perturbed initial guess) does so itself.
#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch in `{operation}`: {left} vs {right}")]
    ShapeMismatch {
        operation: &'static str,
        left: Shape,
        right: Shape,
    },

    #[error("`{operation}` combines symbolic values from unrelated sessions {left} and {right}")]
    MixedSession {
        operation: &'static str,
        left: SessionId,
        right: SessionId,
    },

    #[error("expression registered with session {session} is {}", describe_origin(.found))]
    ForeignSession {
        session: SessionId,
        found: Option<SessionId>,
    },

    #[error("`{operation}` has no symbolic equivalent (operand kind: {kind})")]
    UnsupportedOperation { operation: &'static str, kind: Kind },

    #[error("solver did not converge after {iterations} iterations (residual norm = {residual_norm:e})")]
    Convergence {
        session: SessionId,
        iterations: usize,
        residual_norm: f64,
    },

    #[error("symbolic value refers to session {session}, which is closed or dropped")]
    StaleSymbolicHandle { session: SessionId },

    #[error("session {session} is closed")]
    SessionClosed { session: SessionId },

    #[error("session {session} has not been solved yet")]
    NotYetSolved { session: SessionId },

    #[error("session {session} has already been solved")]
    AlreadySolved { session: SessionId },

    #[error("`{operation}` needs a concrete value but got a symbolic one from session {session}; use `select` or `value_of`")]
    SymbolicValue {
        operation: &'static str,
        session: SessionId,
    },

    #[error("index {index} out of range in `{operation}` (length {len})")]
    IndexOutOfRange {
        operation: &'static str,
        index: usize,
        len: usize,
    },

    #[error("invalid argument to `{operation}`: {reason}")]
    InvalidArgument {
        operation: &'static str,
        reason: String,
    },

    #[error("invalid declaration `{name}`: {reason}")]
    InvalidDeclaration { name: String, reason: String },

    #[error("invalid solve options: {0}")]
    InvalidOptions(String),

    #[error("solver backend failed in session {session}: {source:#}")]
    Backend {
        session: SessionId,
        #[source]
        source: anyhow::Error,
    },
}

fn describe_origin(found: &Option<SessionId>) -> String {
    match found {
        Some(id) => format!("a symbolic value from session {id}"),
        None => "a concrete value, not an expression of this session".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
