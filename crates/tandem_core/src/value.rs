//! The uniform value type shared by concrete and symbolic evaluation.

use std::fmt;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::session::{SessionHandle, SessionId};

/// Shape of a [`Value`]: a scalar or a one-dimensional array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Scalar,
    Vector(usize),
}

impl Shape {
    /// Number of elements.
    pub fn len(self) -> usize {
        match self {
            Shape::Scalar => 1,
            Shape::Vector(n) => n,
        }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn is_scalar(self) -> bool {
        matches!(self, Shape::Scalar)
    }

    /// Elementwise broadcasting: scalars stretch, vectors must agree.
    pub fn broadcast(self, other: Shape, operation: &'static str) -> Result<Shape> {
        match (self, other) {
            (Shape::Scalar, s) | (s, Shape::Scalar) => Ok(s),
            (Shape::Vector(a), Shape::Vector(b)) if a == b => Ok(self),
            _ => Err(Error::ShapeMismatch {
                operation,
                left: self,
                right: other,
            }),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Scalar => write!(f, "scalar"),
            Shape::Vector(n) => write!(f, "vector[{n}]"),
        }
    }
}

/// Which backend a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Concrete,
    Symbolic,
}

impl Kind {
    /// Symbolic dominates: once any operand is symbolic the result is too.
    pub fn dominant(self, other: Kind) -> Kind {
        match (self, other) {
            (Kind::Concrete, Kind::Concrete) => Kind::Concrete,
            _ => Kind::Symbolic,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Concrete => write!(f, "concrete"),
            Kind::Symbolic => write!(f, "symbolic"),
        }
    }
}

/// Plain numbers, no relation to any session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteArray {
    pub(crate) data: DVector<f64>,
    pub(crate) shape: Shape,
}

/// One tape node per element plus a weak link to the owning session.
#[derive(Debug, Clone)]
pub struct SymbolicArray {
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) shape: Shape,
    pub(crate) session: SessionHandle,
}

impl SymbolicArray {
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }
}

/// A scalar or array that is either concrete or a handle into a solve session.
///
/// Analysis code is written once against `Value` and the dispatch layer picks
/// the backend from the operand kinds.
#[derive(Debug, Clone)]
pub enum Value {
    Concrete(ConcreteArray),
    Symbolic(SymbolicArray),
}

impl Value {
    pub fn scalar(value: f64) -> Self {
        Value::Concrete(ConcreteArray {
            data: DVector::from_element(1, value),
            shape: Shape::Scalar,
        })
    }

    pub fn vector(values: impl Into<Vec<f64>>) -> Self {
        Self::from_dvector(DVector::from_vec(values.into()))
    }

    pub fn from_dvector(data: DVector<f64>) -> Self {
        let shape = Shape::Vector(data.len());
        Value::Concrete(ConcreteArray { data, shape })
    }

    pub fn zeros(len: usize) -> Self {
        Self::from_dvector(DVector::zeros(len))
    }

    pub fn ones(len: usize) -> Self {
        Self::from_dvector(DVector::from_element(len, 1.0))
    }

    /// `len` evenly spaced points from `start` to `stop` inclusive.
    pub fn linspace(start: f64, stop: f64, len: usize) -> Self {
        let step = if len > 1 {
            (stop - start) / (len - 1) as f64
        } else {
            0.0
        };
        Self::from_dvector(DVector::from_fn(len, |i, _| {
            if i + 1 == len && len > 1 {
                stop
            } else {
                start + step * i as f64
            }
        }))
    }

    pub(crate) fn concrete(data: DVector<f64>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.len());
        Value::Concrete(ConcreteArray { data, shape })
    }

    pub(crate) fn symbolic(nodes: Vec<NodeId>, shape: Shape, session: SessionHandle) -> Self {
        debug_assert_eq!(nodes.len(), shape.len());
        Value::Symbolic(SymbolicArray {
            nodes,
            shape,
            session,
        })
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Concrete(_) => Kind::Concrete,
            Value::Symbolic(_) => Kind::Symbolic,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        self.kind() == Kind::Symbolic
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Concrete(c) => c.shape,
            Value::Symbolic(s) => s.shape,
        }
    }

    pub fn len(&self) -> usize {
        self.shape().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The session a symbolic value belongs to; `None` for concrete values.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Value::Concrete(_) => None,
            Value::Symbolic(s) => Some(s.session.id()),
        }
    }

    pub fn as_concrete(&self) -> Option<&DVector<f64>> {
        match self {
            Value::Concrete(c) => Some(&c.data),
            Value::Symbolic(_) => None,
        }
    }

    pub fn as_symbolic(&self) -> Option<&SymbolicArray> {
        match self {
            Value::Concrete(_) => None,
            Value::Symbolic(s) => Some(s),
        }
    }

    /// Reads a concrete scalar.
    pub fn to_f64(&self) -> Result<f64> {
        let data = self.require_concrete("to_f64")?;
        match self.shape() {
            Shape::Scalar => Ok(data[0]),
            shape => Err(Error::ShapeMismatch {
                operation: "to_f64",
                left: shape,
                right: Shape::Scalar,
            }),
        }
    }

    /// Reads all elements of a concrete value.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        Ok(self.require_concrete("to_vec")?.iter().copied().collect())
    }

    /// Native truthiness for host-language branching: true when every element
    /// is nonzero.
    ///
    /// Symbolic values cannot be branched on; use [`select`](crate::dispatch::select).
    pub fn truthy(&self) -> Result<bool> {
        Ok(self.require_concrete("truthy")?.iter().all(|v| *v != 0.0))
    }

    fn require_concrete(&self, operation: &'static str) -> Result<&DVector<f64>> {
        match self {
            Value::Concrete(c) => Ok(&c.data),
            Value::Symbolic(s) => Err(Error::SymbolicValue {
                operation,
                session: s.session.id(),
            }),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::scalar(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Value::vector(values)
    }
}

impl From<&[f64]> for Value {
    fn from(values: &[f64]) -> Self {
        Value::vector(values.to_vec())
    }
}

impl From<DVector<f64>> for Value {
    fn from(data: DVector<f64>) -> Self {
        Value::from_dvector(data)
    }
}

impl From<&Value> for Value {
    fn from(value: &Value) -> Self {
        value.clone()
    }
}
