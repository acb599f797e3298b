//! The `tandem_core` crate lets one piece of analysis code run in two modes.
//!
//! Called with concrete numbers it evaluates directly. Called with symbolic
//! decision variables of a [`Session`] it records an expression tape that the
//! session later solves as a nonlinear program, with exact derivatives from
//! dual numbers.
//!
//! Key components:
//! - **Value**: `Value` is either a concrete array or a symbolic handle into a session.
//! - **Dispatch**: every arithmetic, reduction, linear-algebra and array operation picks its backend from the operand kinds.
//! - **Session**: declares variables, registers residuals, constraints and least-squares terms, and solves them once.
//! - **Solvers**: `NonlinearSolver` backends; `LevenbergMarquardt` is the default.
//! - **Analysis**: `ExplicitAnalysis` and `ImplicitAnalysis`, plus least-squares `fit`.
pub mod analysis;
pub mod autodiff;
pub mod dispatch;
pub mod error;
pub mod fit;
pub mod graph;
pub mod ops;
pub mod session;
pub mod solvers;
pub mod traits;
pub mod value;

pub use analysis::{Analysis, ExplicitAnalysis, ImplicitAnalysis, Nesting};
pub use dispatch::NormKind;
pub use error::{Error, Result};
pub use fit::{fit, FitReport};
pub use session::{Declaration, Phase, Session, SessionId, Solution};
pub use solvers::{LevenbergMarquardt, LevenbergMarquardtConfig, SolveOptions, SolveReport};
pub use value::{Kind, Shape, Value};
