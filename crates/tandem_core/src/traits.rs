use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::autodiff::Dual;

/// A numeric type the expression tape and the dispatch rules can run on.
/// `f64` drives plain evaluation, [`Dual`] drives Jacobian columns.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts a plain constant into this scalar type (zero derivative part).
    fn constant(value: f64) -> Self;

    /// The real part, discarding any derivative information.
    fn real(self) -> f64;
}

impl Scalar for f64 {
    fn constant(value: f64) -> Self {
        value
    }

    fn real(self) -> f64 {
        self
    }
}

impl Scalar for Dual {
    fn constant(value: f64) -> Self {
        Dual::new(value, 0.0)
    }

    fn real(self) -> f64 {
        self.val
    }
}
