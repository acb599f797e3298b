//! The dispatch table.
//!
//! Every elementwise operation has exactly one numeric rule, written once and
//! generic over [`Scalar`]. The concrete backend runs it on `f64`, the
//! expression tape runs it on `f64` or [`Dual`](crate::autodiff::Dual). The
//! `symbolic_support` entries decide which operations may enter a tape at all.

use serde::{Deserialize, Serialize};

use crate::traits::Scalar;
use crate::value::Kind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Ln,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Floor,
    Ceil,
    Round,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 18] = [
        UnaryOp::Neg,
        UnaryOp::Abs,
        UnaryOp::Sqrt,
        UnaryOp::Exp,
        UnaryOp::Ln,
        UnaryOp::Log10,
        UnaryOp::Sin,
        UnaryOp::Cos,
        UnaryOp::Tan,
        UnaryOp::Asin,
        UnaryOp::Acos,
        UnaryOp::Atan,
        UnaryOp::Sinh,
        UnaryOp::Cosh,
        UnaryOp::Tanh,
        UnaryOp::Floor,
        UnaryOp::Ceil,
        UnaryOp::Round,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Exp => "exp",
            UnaryOp::Ln => "ln",
            UnaryOp::Log10 => "log10",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Asin => "asin",
            UnaryOp::Acos => "acos",
            UnaryOp::Atan => "atan",
            UnaryOp::Sinh => "sinh",
            UnaryOp::Cosh => "cosh",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Round => "round",
        }
    }

    /// Whether the symbolic backend has a differentiable rule for this operation.
    pub fn symbolic_support(self) -> bool {
        !matches!(self, UnaryOp::Floor | UnaryOp::Ceil | UnaryOp::Round)
    }

    /// Whether the operation may run for operands of `kind`.
    pub fn supports(self, kind: Kind) -> bool {
        match kind {
            Kind::Concrete => true,
            Kind::Symbolic => self.symbolic_support(),
        }
    }

    pub fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            UnaryOp::Neg => -a,
            UnaryOp::Abs => a.abs(),
            UnaryOp::Sqrt => a.sqrt(),
            UnaryOp::Exp => a.exp(),
            UnaryOp::Ln => a.ln(),
            UnaryOp::Log10 => a.log10(),
            UnaryOp::Sin => a.sin(),
            UnaryOp::Cos => a.cos(),
            UnaryOp::Tan => a.tan(),
            UnaryOp::Asin => a.asin(),
            UnaryOp::Acos => a.acos(),
            UnaryOp::Atan => a.atan(),
            UnaryOp::Sinh => a.sinh(),
            UnaryOp::Cosh => a.cosh(),
            UnaryOp::Tanh => a.tanh(),
            UnaryOp::Floor => a.floor(),
            UnaryOp::Ceil => a.ceil(),
            UnaryOp::Round => a.round(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Atan2,
    Hypot,
    Max,
    Min,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 16] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Pow,
        BinaryOp::Atan2,
        BinaryOp::Hypot,
        BinaryOp::Max,
        BinaryOp::Min,
        BinaryOp::Rem,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
        BinaryOp::Eq,
        BinaryOp::Ne,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::Hypot => "hypot",
            BinaryOp::Max => "maximum",
            BinaryOp::Min => "minimum",
            BinaryOp::Rem => "rem",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
        }
    }

    pub fn symbolic_support(self) -> bool {
        !matches!(self, BinaryOp::Rem)
    }

    pub fn supports(self, kind: Kind) -> bool {
        match kind {
            Kind::Concrete => true,
            Kind::Symbolic => self.symbolic_support(),
        }
    }

    /// Comparisons yield 1.0 for true and 0.0 for false and carry no derivative.
    pub fn apply<T: Scalar>(self, a: T, b: T) -> T {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Atan2 => a.atan2(b),
            BinaryOp::Hypot => a.hypot(b),
            BinaryOp::Max => {
                if a >= b {
                    a
                } else {
                    b
                }
            }
            BinaryOp::Min => {
                if a <= b {
                    a
                } else {
                    b
                }
            }
            BinaryOp::Rem => a % b,
            BinaryOp::Lt => indicator(a < b),
            BinaryOp::Le => indicator(a <= b),
            BinaryOp::Gt => indicator(a > b),
            BinaryOp::Ge => indicator(a >= b),
            BinaryOp::Eq => indicator(a.real() == b.real()),
            BinaryOp::Ne => indicator(a.real() != b.real()),
        }
    }
}

/// Conditional selection; any nonzero condition picks `if_true`.
pub fn select<T: Scalar>(condition: T, if_true: T, if_false: T) -> T {
    if condition.real() != 0.0 {
        if_true
    } else {
        if_false
    }
}

fn indicator<T: Scalar>(flag: bool) -> T {
    if flag {
        T::one()
    } else {
        T::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    #[test]
    fn rounding_operations_are_concrete_only() {
        for op in UnaryOp::ALL {
            let rounding = matches!(op, UnaryOp::Floor | UnaryOp::Ceil | UnaryOp::Round);
            assert_eq!(op.supports(Kind::Symbolic), !rounding, "{}", op.name());
            assert!(op.supports(Kind::Concrete));
        }
        assert!(!BinaryOp::Rem.supports(Kind::Symbolic));
        assert!(BinaryOp::Lt.supports(Kind::Symbolic));
    }

    #[test]
    fn rules_agree_between_f64_and_dual() {
        for op in UnaryOp::ALL {
            let plain = op.apply(0.3_f64);
            let dual = op.apply(Dual::variable(0.3));
            assert_eq!(plain, dual.val, "{}", op.name());
        }
        for op in BinaryOp::ALL {
            let plain = op.apply(1.5_f64, 0.5);
            let dual = op.apply(Dual::variable(1.5), Dual::new(0.5, 0.0));
            assert_eq!(plain, dual.val, "{}", op.name());
        }
    }

    #[test]
    fn comparisons_produce_indicators_without_slope() {
        let x = Dual::variable(2.0);
        let gt = BinaryOp::Gt.apply(x, Dual::new(1.0, 0.0));
        assert_eq!(gt, Dual::new(1.0, 0.0));
        let eq = BinaryOp::Eq.apply(2.0_f64, 3.0);
        assert_eq!(eq, 0.0);
    }

    #[test]
    fn select_follows_the_nonzero_condition() {
        assert_eq!(select(1.0_f64, 10.0, 20.0), 10.0);
        assert_eq!(select(0.0_f64, 10.0, 20.0), 20.0);
        let picked = select(Dual::new(-2.0, 0.0), Dual::variable(3.0), Dual::new(4.0, 0.0));
        assert_eq!(picked.eps, 1.0);
    }

    #[test]
    fn maximum_keeps_the_slope_of_the_larger_operand() {
        let a = Dual::variable(3.0);
        let b = Dual::new(2.0, 0.0);
        assert_eq!(BinaryOp::Max.apply(a, b).eps, 1.0);
        assert_eq!(BinaryOp::Min.apply(a, b).eps, 0.0);
    }
}
