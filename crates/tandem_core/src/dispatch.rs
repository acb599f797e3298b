//! The dispatch layer.
//!
//! Every operation inspects the kinds of its operands. All-concrete operands
//! run on `nalgebra` directly and give a concrete [`Value`]; as soon as one
//! operand is symbolic the operation is recorded on the owning session's tape
//! and the result is symbolic. This module is the only place where the two
//! backends meet.

use std::cmp::Ordering;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::ops::{self, BinaryOp, UnaryOp};
use crate::session::SessionHandle;
use crate::value::{Kind, Shape, Value};

/// Which vector norm [`norm`] computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormKind {
    L1,
    L2,
    Inf,
}

/// Where an operation runs, decided from the operand kinds alone.
enum Route<'a> {
    Concrete(Vec<&'a DVector<f64>>),
    Symbolic(SessionHandle),
}

fn route<'a>(operation: &'static str, operands: &[&'a Value]) -> Result<Route<'a>> {
    let mut handle: Option<&SessionHandle> = None;
    let mut data = Vec::with_capacity(operands.len());
    for &operand in operands {
        match operand {
            Value::Concrete(c) => data.push(&c.data),
            Value::Symbolic(s) => match handle {
                None => handle = Some(&s.session),
                Some(h) if h.id() == s.session.id() => {}
                Some(h) => {
                    return Err(Error::MixedSession {
                        operation,
                        left: h.id(),
                        right: s.session.id(),
                    })
                }
            },
        }
    }
    Ok(match handle {
        Some(h) => Route::Symbolic(h.clone()),
        None => Route::Concrete(data),
    })
}

fn unsupported(operation: &'static str) -> Error {
    Error::UnsupportedOperation {
        operation,
        kind: Kind::Symbolic,
    }
}

/// Tape nodes for an operand; concrete elements become constants.
fn lift(graph: &mut Graph, value: &Value) -> Vec<NodeId> {
    match value {
        Value::Concrete(c) => c.data.iter().map(|&v| graph.constant(v)).collect(),
        Value::Symbolic(s) => s.nodes.clone(),
    }
}

/// Element `i` of a broadcast operand.
fn at<T: Copy>(items: &[T], i: usize) -> T {
    if items.len() == 1 {
        items[0]
    } else {
        items[i]
    }
}

fn record(
    handle: SessionHandle,
    shape: Shape,
    build: impl FnOnce(&mut Graph) -> Vec<NodeId>,
) -> Result<Value> {
    let nodes = handle.with_graph(build)?;
    Ok(Value::symbolic(nodes, shape, handle))
}

fn scalar_shape_check(operation: &'static str, value: &Value, expected: Shape) -> Result<()> {
    if value.shape() == expected {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            operation,
            left: value.shape(),
            right: expected,
        })
    }
}

fn require_non_empty(operation: &'static str, value: &Value) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument {
            operation,
            reason: "empty input".to_string(),
        });
    }
    Ok(())
}

pub fn unary(op: UnaryOp, a: &Value) -> Result<Value> {
    match route(op.name(), &[a])? {
        Route::Concrete(data) => Ok(Value::concrete(data[0].map(|v| op.apply(v)), a.shape())),
        Route::Symbolic(handle) => {
            if !op.supports(Kind::Symbolic) {
                return Err(unsupported(op.name()));
            }
            record(handle, a.shape(), |g| {
                let nodes = lift(g, a);
                nodes.into_iter().map(|n| g.unary(op, n)).collect()
            })
        }
    }
}

/// Elementwise binary operation; a scalar operand broadcasts over a vector.
pub fn binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value> {
    let shape = a.shape().broadcast(b.shape(), op.name())?;
    let len = shape.len();
    match route(op.name(), &[a, b])? {
        Route::Concrete(data) => {
            let (x, y) = (data[0].as_slice(), data[1].as_slice());
            let out = DVector::from_fn(len, |i, _| op.apply(at(x, i), at(y, i)));
            Ok(Value::concrete(out, shape))
        }
        Route::Symbolic(handle) => {
            if !op.supports(Kind::Symbolic) {
                return Err(unsupported(op.name()));
            }
            record(handle, shape, |g| {
                let x = lift(g, a);
                let y = lift(g, b);
                (0..len).map(|i| g.binary(op, at(&x, i), at(&y, i))).collect()
            })
        }
    }
}

/// Elementwise `if condition != 0 { if_true } else { if_false }`.
///
/// This is how analysis code branches on values that may be symbolic; both
/// branches stay on the tape and only the taken one carries a derivative.
pub fn select(condition: &Value, if_true: &Value, if_false: &Value) -> Result<Value> {
    let shape = condition
        .shape()
        .broadcast(if_true.shape(), "select")?
        .broadcast(if_false.shape(), "select")?;
    let len = shape.len();
    match route("select", &[condition, if_true, if_false])? {
        Route::Concrete(data) => {
            let (c, t, f) = (data[0].as_slice(), data[1].as_slice(), data[2].as_slice());
            let out = DVector::from_fn(len, |i, _| ops::select(at(c, i), at(t, i), at(f, i)));
            Ok(Value::concrete(out, shape))
        }
        Route::Symbolic(handle) => record(handle, shape, |g| {
            let c = lift(g, condition);
            let t = lift(g, if_true);
            let f = lift(g, if_false);
            (0..len)
                .map(|i| g.select(at(&c, i), at(&t, i), at(&f, i)))
                .collect()
        }),
    }
}

/// Folds `op` over all elements, starting from `empty` when there are none.
fn reduce(operation: &'static str, op: BinaryOp, a: &Value, empty: f64) -> Result<Value> {
    match route(operation, &[a])? {
        Route::Concrete(data) => {
            let total = data[0].iter().copied().reduce(|acc, v| op.apply(acc, v));
            Ok(Value::scalar(total.unwrap_or(empty)))
        }
        Route::Symbolic(handle) => record(handle, Shape::Scalar, |g| {
            let nodes = lift(g, a);
            let total = g.fold(op, &nodes).unwrap_or_else(|| g.constant(empty));
            vec![total]
        }),
    }
}

pub fn sum(a: &Value) -> Result<Value> {
    match route("sum", &[a])? {
        Route::Concrete(data) => Ok(Value::scalar(data[0].sum())),
        Route::Symbolic(_) => reduce("sum", BinaryOp::Add, a, 0.0),
    }
}

pub fn prod(a: &Value) -> Result<Value> {
    match route("prod", &[a])? {
        Route::Concrete(data) => Ok(Value::scalar(data[0].product())),
        Route::Symbolic(_) => reduce("prod", BinaryOp::Mul, a, 1.0),
    }
}

pub fn mean(a: &Value) -> Result<Value> {
    require_non_empty("mean", a)?;
    match route("mean", &[a])? {
        Route::Concrete(data) => Ok(Value::scalar(data[0].mean())),
        Route::Symbolic(_) => binary(BinaryOp::Div, &sum(a)?, &Value::scalar(a.len() as f64)),
    }
}

pub fn max(a: &Value) -> Result<Value> {
    require_non_empty("max", a)?;
    reduce("max", BinaryOp::Max, a, f64::NEG_INFINITY)
}

pub fn min(a: &Value) -> Result<Value> {
    require_non_empty("min", a)?;
    reduce("min", BinaryOp::Min, a, f64::INFINITY)
}

pub fn norm(a: &Value, kind: NormKind) -> Result<Value> {
    match route("norm", &[a])? {
        Route::Concrete(data) => {
            let v = data[0];
            Ok(Value::scalar(match kind {
                NormKind::L1 => v.lp_norm(1),
                NormKind::L2 => v.norm(),
                NormKind::Inf => v.amax(),
            }))
        }
        Route::Symbolic(handle) => record(handle, Shape::Scalar, |g| {
            let nodes = lift(g, a);
            let total = match kind {
                NormKind::L1 => {
                    let abs: Vec<NodeId> =
                        nodes.iter().map(|&n| g.unary(UnaryOp::Abs, n)).collect();
                    g.fold(BinaryOp::Add, &abs)
                }
                NormKind::L2 => {
                    let squares: Vec<NodeId> =
                        nodes.iter().map(|&n| g.binary(BinaryOp::Mul, n, n)).collect();
                    g.fold(BinaryOp::Add, &squares)
                        .map(|s| g.unary(UnaryOp::Sqrt, s))
                }
                NormKind::Inf => {
                    let abs: Vec<NodeId> =
                        nodes.iter().map(|&n| g.unary(UnaryOp::Abs, n)).collect();
                    g.fold(BinaryOp::Max, &abs)
                }
            };
            vec![total.unwrap_or_else(|| g.constant(0.0))]
        }),
    }
}

/// Inner product of two values of the same shape.
pub fn dot(a: &Value, b: &Value) -> Result<Value> {
    scalar_shape_check("dot", b, a.shape())?;
    match route("dot", &[a, b])? {
        Route::Concrete(data) => Ok(Value::scalar(data[0].dot(data[1]))),
        Route::Symbolic(handle) => record(handle, Shape::Scalar, |g| {
            let x = lift(g, a);
            let y = lift(g, b);
            let products: Vec<NodeId> = x
                .iter()
                .zip(&y)
                .map(|(&p, &q)| g.binary(BinaryOp::Mul, p, q))
                .collect();
            vec![g
                .fold(BinaryOp::Add, &products)
                .unwrap_or_else(|| g.constant(0.0))]
        }),
    }
}

/// Cross product of two 3-vectors.
pub fn cross(a: &Value, b: &Value) -> Result<Value> {
    scalar_shape_check("cross", a, Shape::Vector(3))?;
    scalar_shape_check("cross", b, Shape::Vector(3))?;
    match route("cross", &[a, b])? {
        Route::Concrete(data) => Ok(Value::from_dvector(data[0].cross(data[1]))),
        Route::Symbolic(handle) => record(handle, Shape::Vector(3), |g| {
            let x = lift(g, a);
            let y = lift(g, b);
            (0..3)
                .map(|i| {
                    let (j, k) = ((i + 1) % 3, (i + 2) % 3);
                    let left = g.binary(BinaryOp::Mul, x[j], y[k]);
                    let right = g.binary(BinaryOp::Mul, x[k], y[j]);
                    g.binary(BinaryOp::Sub, left, right)
                })
                .collect()
        }),
    }
}

/// Product of a concrete matrix with a vector value.
pub fn matvec(matrix: &DMatrix<f64>, x: &Value) -> Result<Value> {
    scalar_shape_check("matvec", x, Shape::Vector(matrix.ncols()))?;
    let shape = Shape::Vector(matrix.nrows());
    match route("matvec", &[x])? {
        Route::Concrete(data) => Ok(Value::concrete(matrix * data[0], shape)),
        Route::Symbolic(handle) => record(handle, shape, |g| {
            let x = lift(g, x);
            (0..matrix.nrows())
                .map(|i| {
                    let terms: Vec<NodeId> = x
                        .iter()
                        .enumerate()
                        .map(|(j, &n)| {
                            let coefficient = g.constant(matrix[(i, j)]);
                            g.binary(BinaryOp::Mul, coefficient, n)
                        })
                        .collect();
                    g.fold(BinaryOp::Add, &terms)
                        .unwrap_or_else(|| g.constant(0.0))
                })
                .collect()
        }),
    }
}

/// Joins values end to end into one vector. Scalars count as one element.
pub fn concat(values: &[Value]) -> Result<Value> {
    let operands: Vec<&Value> = values.iter().collect();
    let shape = Shape::Vector(values.iter().map(Value::len).sum());
    match route("concat", &operands)? {
        Route::Concrete(data) => {
            let joined: Vec<f64> = data.iter().flat_map(|d| d.iter().copied()).collect();
            Ok(Value::concrete(DVector::from_vec(joined), shape))
        }
        Route::Symbolic(handle) => record(handle, shape, |g| {
            values.iter().flat_map(|v| lift(g, v)).collect()
        }),
    }
}

/// Element `index` as a scalar.
pub fn index(a: &Value, index: usize) -> Result<Value> {
    if index >= a.len() {
        return Err(Error::IndexOutOfRange {
            operation: "index",
            index,
            len: a.len(),
        });
    }
    match a {
        Value::Concrete(c) => Ok(Value::scalar(c.data[index])),
        Value::Symbolic(s) => Ok(Value::symbolic(
            s.session.with_graph(|_| vec![s.nodes[index]])?,
            Shape::Scalar,
            s.session.clone(),
        )),
    }
}

/// Elements `start..end` as a vector.
pub fn slice(a: &Value, start: usize, end: usize) -> Result<Value> {
    if end > a.len() {
        return Err(Error::IndexOutOfRange {
            operation: "slice",
            index: end,
            len: a.len(),
        });
    }
    if start > end {
        return Err(Error::InvalidArgument {
            operation: "slice",
            reason: format!("start {start} is after end {end}"),
        });
    }
    let shape = Shape::Vector(end - start);
    match a {
        Value::Concrete(c) => Ok(Value::concrete(
            c.data.rows(start, end - start).into_owned(),
            shape,
        )),
        Value::Symbolic(s) => Ok(Value::symbolic(
            s.session.with_graph(|_| s.nodes[start..end].to_vec())?,
            shape,
            s.session.clone(),
        )),
    }
}

/// Differences of consecutive elements, one shorter than the input.
pub fn diff(a: &Value) -> Result<Value> {
    let shape = Shape::Vector(a.len().saturating_sub(1));
    match route("diff", &[a])? {
        Route::Concrete(data) => {
            let v = data[0];
            let out = DVector::from_fn(shape.len(), |i, _| {
                BinaryOp::Sub.apply(v[i + 1], v[i])
            });
            Ok(Value::concrete(out, shape))
        }
        Route::Symbolic(handle) => record(handle, shape, |g| {
            let nodes = lift(g, a);
            nodes
                .windows(2)
                .map(|w| g.binary(BinaryOp::Sub, w[1], w[0]))
                .collect()
        }),
    }
}

/// Running sums, same length as the input.
pub fn cumsum(a: &Value) -> Result<Value> {
    let shape = Shape::Vector(a.len());
    match route("cumsum", &[a])? {
        Route::Concrete(data) => {
            let mut total = 0.0;
            let out = data[0].map(|v| {
                total += v;
                total
            });
            Ok(Value::concrete(out, shape))
        }
        Route::Symbolic(handle) => record(handle, shape, |g| {
            let nodes = lift(g, a);
            let mut out: Vec<NodeId> = Vec::with_capacity(nodes.len());
            for n in nodes {
                let next = match out.last() {
                    Some(&prev) => g.binary(BinaryOp::Add, prev, n),
                    None => n,
                };
                out.push(next);
            }
            out
        }),
    }
}

/// Limits every element to `[lower, upper]`.
pub fn clip(a: &Value, lower: f64, upper: f64) -> Result<Value> {
    if lower.is_nan() || upper.is_nan() || lower > upper {
        return Err(Error::InvalidArgument {
            operation: "clip",
            reason: format!("invalid range [{lower}, {upper}]"),
        });
    }
    let floored = binary(BinaryOp::Max, a, &Value::scalar(lower))?;
    binary(BinaryOp::Min, &floored, &Value::scalar(upper))
}

/// Ascending sort. Has no differentiable form, so it is concrete-only.
pub fn sort(a: &Value) -> Result<Value> {
    match route("sort", &[a])? {
        Route::Concrete(data) => {
            let mut sorted: Vec<f64> = data[0].iter().copied().collect();
            sorted.sort_by(|x, y| x.partial_cmp(y).unwrap_or(Ordering::Equal));
            Ok(Value::concrete(DVector::from_vec(sorted), a.shape()))
        }
        Route::Symbolic(_) => Err(unsupported("sort")),
    }
}

macro_rules! unary_methods {
    ($($(#[$meta:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name(&self) -> Result<Value> {
                unary(UnaryOp::$op, self)
            }
        )*
    };
}

macro_rules! binary_methods {
    ($($(#[$meta:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name(&self, other: impl Into<Value>) -> Result<Value> {
                binary(BinaryOp::$op, self, &other.into())
            }
        )*
    };
}

/// The dispatch operations as methods, so analysis code reads like ordinary
/// arithmetic: `x.mul(&x)?.sub(4.0)?`.
#[allow(clippy::should_implement_trait)]
impl Value {
    unary_methods! {
        neg => Neg,
        abs => Abs,
        sqrt => Sqrt,
        exp => Exp,
        /// Natural logarithm.
        ln => Ln,
        log10 => Log10,
        sin => Sin,
        cos => Cos,
        tan => Tan,
        asin => Asin,
        acos => Acos,
        atan => Atan,
        sinh => Sinh,
        cosh => Cosh,
        tanh => Tanh,
        /// Concrete-only.
        floor => Floor,
        /// Concrete-only.
        ceil => Ceil,
        /// Concrete-only.
        round => Round,
    }

    binary_methods! {
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
        pow => Pow,
        atan2 => Atan2,
        hypot => Hypot,
        /// Elementwise maximum.
        maximum => Max,
        /// Elementwise minimum.
        minimum => Min,
        /// Concrete-only remainder.
        rem => Rem,
        lt => Lt,
        le => Le,
        gt => Gt,
        ge => Ge,
        eq => Eq,
        ne => Ne,
    }

    /// `select(self, if_true, if_false)`.
    pub fn select(&self, if_true: impl Into<Value>, if_false: impl Into<Value>) -> Result<Value> {
        select(self, &if_true.into(), &if_false.into())
    }

    pub fn sum(&self) -> Result<Value> {
        sum(self)
    }

    pub fn mean(&self) -> Result<Value> {
        mean(self)
    }

    pub fn prod(&self) -> Result<Value> {
        prod(self)
    }

    pub fn max(&self) -> Result<Value> {
        max(self)
    }

    pub fn min(&self) -> Result<Value> {
        min(self)
    }

    pub fn norm(&self, kind: NormKind) -> Result<Value> {
        norm(self, kind)
    }

    pub fn dot(&self, other: impl Into<Value>) -> Result<Value> {
        dot(self, &other.into())
    }

    pub fn cross(&self, other: impl Into<Value>) -> Result<Value> {
        cross(self, &other.into())
    }

    /// `matrix * self`.
    pub fn matvec(&self, matrix: &DMatrix<f64>) -> Result<Value> {
        matvec(matrix, self)
    }

    /// `self` followed by `other`.
    pub fn concat(&self, other: impl Into<Value>) -> Result<Value> {
        concat(&[self.clone(), other.into()])
    }

    pub fn index(&self, i: usize) -> Result<Value> {
        index(self, i)
    }

    pub fn slice(&self, start: usize, end: usize) -> Result<Value> {
        slice(self, start, end)
    }

    pub fn diff(&self) -> Result<Value> {
        diff(self)
    }

    pub fn cumsum(&self) -> Result<Value> {
        cumsum(self)
    }

    pub fn clip(&self, lower: f64, upper: f64) -> Result<Value> {
        clip(self, lower, upper)
    }

    pub fn sort(&self) -> Result<Value> {
        sort(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Declaration, Session};
    use crate::solvers::SolveOptions;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn values(v: &Value) -> Vec<f64> {
        v.to_vec().expect("concrete value")
    }

    #[test]
    fn concrete_elementwise_and_broadcasting() {
        let v = Value::vector(vec![1.0, 4.0, 9.0]);
        assert_eq!(values(&v.sqrt().unwrap()), vec![1.0, 2.0, 3.0]);
        assert_eq!(values(&v.mul(2.0).unwrap()), vec![2.0, 8.0, 18.0]);
        assert_eq!(values(&Value::scalar(10.0).sub(&v).unwrap()), vec![9.0, 6.0, 1.0]);
        assert_eq!(values(&v.gt(3.0).unwrap()), vec![0.0, 1.0, 1.0]);
        assert_eq!(values(&v.floor().unwrap()), vec![1.0, 4.0, 9.0]);
        assert_err_contains(
            v.add(Value::vector(vec![1.0, 2.0])),
            "shape mismatch in `add`",
        );
    }

    #[test]
    fn concrete_results_match_nalgebra_directly() {
        let data = DVector::from_vec(vec![3.0, -4.0, 1.5]);
        let v = Value::from_dvector(data.clone());
        assert_eq!(v.sum().unwrap().to_f64().unwrap(), data.sum());
        assert_eq!(v.prod().unwrap().to_f64().unwrap(), data.product());
        assert_eq!(v.norm(NormKind::L2).unwrap().to_f64().unwrap(), data.norm());
        assert_eq!(v.norm(NormKind::L1).unwrap().to_f64().unwrap(), 8.5);
        assert_eq!(v.norm(NormKind::Inf).unwrap().to_f64().unwrap(), 4.0);
        assert_eq!(v.max().unwrap().to_f64().unwrap(), 3.0);
        assert_eq!(v.min().unwrap().to_f64().unwrap(), -4.0);
        assert_eq!(v.dot(&v).unwrap().to_f64().unwrap(), data.dot(&data));
    }

    #[test]
    fn array_operations() {
        let v = Value::vector(vec![3.0, 1.0, 2.0, 5.0]);
        assert_eq!(values(&v.diff().unwrap()), vec![-2.0, 1.0, 3.0]);
        assert_eq!(values(&v.cumsum().unwrap()), vec![3.0, 4.0, 6.0, 11.0]);
        assert_eq!(values(&v.sort().unwrap()), vec![1.0, 2.0, 3.0, 5.0]);
        assert_eq!(values(&v.clip(1.5, 4.0).unwrap()), vec![3.0, 1.5, 2.0, 4.0]);
        assert_eq!(values(&v.slice(1, 3).unwrap()), vec![1.0, 2.0]);
        assert_eq!(v.index(3).unwrap().to_f64().unwrap(), 5.0);
        let joined = Value::scalar(0.0).concat(v.slice(0, 2).unwrap()).unwrap();
        assert_eq!(values(&joined), vec![0.0, 3.0, 1.0]);
        assert_eq!(joined.shape(), Shape::Vector(3));

        assert_err_contains(v.index(4), "index 4 out of range");
        assert_err_contains(v.slice(3, 2), "start 3 is after end 2");
        assert_err_contains(v.clip(2.0, 1.0), "invalid range");
        assert_err_contains(Value::zeros(0).mean(), "empty input");
    }

    #[test]
    fn cross_and_matvec() {
        let x = Value::vector(vec![1.0, 0.0, 0.0]);
        let y = Value::vector(vec![0.0, 1.0, 0.0]);
        assert_eq!(values(&x.cross(&y).unwrap()), vec![0.0, 0.0, 1.0]);
        assert_err_contains(cross(&Value::zeros(2), &y), "shape mismatch in `cross`");

        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let v = Value::vector(vec![1.0, 1.0, 1.0]);
        assert_eq!(values(&v.matvec(&m).unwrap()), vec![6.0, 15.0]);
        assert_err_contains(matvec(&m, &Value::zeros(2)), "matvec");
    }

    #[test]
    fn symbolic_operands_give_symbolic_results() {
        let session = Session::new();
        let x = session
            .declare_variable(Declaration::scalar("x", 1.0))
            .unwrap();
        let y = x.mul(2.0).unwrap();
        assert!(y.is_symbolic());
        assert_eq!(y.session_id(), Some(session.id()));
        let z = Value::vector(vec![1.0, 2.0]).add(&x).unwrap();
        assert!(z.is_symbolic());
        assert_eq!(z.shape(), Shape::Vector(2));
    }

    #[test]
    fn concrete_only_operations_reject_symbolic_operands() {
        let session = Session::new();
        let x = session
            .declare_variable(Declaration::vector("x", vec![1.0, 2.0]))
            .unwrap();
        assert_err_contains(x.floor(), "`floor` has no symbolic equivalent");
        assert_err_contains(x.rem(2.0), "`rem` has no symbolic equivalent");
        assert_err_contains(x.sort(), "`sort` has no symbolic equivalent");
        assert!(matches!(
            x.round(),
            Err(Error::UnsupportedOperation { operation: "round", kind: Kind::Symbolic })
        ));
    }

    #[test]
    fn operands_from_two_sessions_are_rejected() {
        let a = Session::new();
        let b = Session::new();
        let x = a.declare_variable(Declaration::scalar("x", 1.0)).unwrap();
        let y = b.declare_variable(Declaration::scalar("y", 1.0)).unwrap();
        let err = x.add(&y).expect_err("mixed sessions");
        assert!(matches!(
            err,
            Error::MixedSession { operation: "add", left, right } if left == a.id() && right == b.id()
        ));
        assert_err_contains(concat(&[x.clone(), y.clone()]), "`concat` combines");
        assert_err_contains(select(&x, &y, &Value::scalar(0.0)), "`select` combines");
    }

    #[test]
    fn select_keeps_both_branches_representable() {
        let session = Session::new();
        let x = session
            .declare_variable(Declaration::scalar("x", -3.0))
            .unwrap();
        // |x| - 2 through select, solved from the negative side.
        let magnitude = x.lt(0.0).unwrap().select(x.neg().unwrap(), &x).unwrap();
        session
            .add_residual(&magnitude.sub(2.0).unwrap())
            .unwrap();
        session.solve(&SolveOptions::default()).unwrap();
        let x = session.value_of(&x).unwrap().to_f64().unwrap();
        assert!((x + 2.0).abs() < 1e-8);
    }

    #[test]
    fn symbolic_reductions_evaluate_like_concrete_ones() {
        let session = Session::new();
        let guess = vec![0.5, -1.5, 2.0];
        let v = session
            .declare_variable(Declaration::vector("v", guess.clone()))
            .unwrap();
        let target = Value::vector(guess);
        session.add_residual(&v.sub(&target).unwrap()).unwrap();
        session.solve(&SolveOptions::default()).unwrap();

        let checks: Vec<(Value, Value)> = vec![
            (v.sum().unwrap(), target.sum().unwrap()),
            (v.mean().unwrap(), target.mean().unwrap()),
            (v.prod().unwrap(), target.prod().unwrap()),
            (v.max().unwrap(), target.max().unwrap()),
            (v.min().unwrap(), target.min().unwrap()),
            (v.norm(NormKind::L1).unwrap(), target.norm(NormKind::L1).unwrap()),
            (v.norm(NormKind::L2).unwrap(), target.norm(NormKind::L2).unwrap()),
            (v.norm(NormKind::Inf).unwrap(), target.norm(NormKind::Inf).unwrap()),
            (v.cumsum().unwrap(), target.cumsum().unwrap()),
            (v.diff().unwrap(), target.diff().unwrap()),
        ];
        for (symbolic, concrete) in checks {
            let solved = values(&session.value_of(&symbolic).unwrap());
            for (s, c) in solved.iter().zip(values(&concrete)) {
                assert!((s - c).abs() < 1e-8, "{s} vs {c}");
            }
        }
    }
}
