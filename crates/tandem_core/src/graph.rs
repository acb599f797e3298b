use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use crate::autodiff::Dual;
use crate::ops::{self, BinaryOp, UnaryOp};
use crate::traits::Scalar;

/// Index of a node on an expression tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One instruction of the tape. Operands always precede the node that uses
/// them, so a single forward sweep evaluates everything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node {
    /// A constant lifted from a concrete operand.
    Const(f64),
    /// Entry `i` of the session's flat decision vector.
    Var(usize),
    Unary(UnaryOp, NodeId),
    Binary(BinaryOp, NodeId, NodeId),
    Select(NodeId, NodeId, NodeId),
}

/// Append-only expression tape owned by one solve session.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn constant(&mut self, value: f64) -> NodeId {
        self.push(Node::Const(value))
    }

    pub fn variable(&mut self, index: usize) -> NodeId {
        self.push(Node::Var(index))
    }

    pub fn unary(&mut self, op: UnaryOp, a: NodeId) -> NodeId {
        self.push(Node::Unary(op, a))
    }

    pub fn binary(&mut self, op: BinaryOp, a: NodeId, b: NodeId) -> NodeId {
        self.push(Node::Binary(op, a, b))
    }

    pub fn select(&mut self, condition: NodeId, if_true: NodeId, if_false: NodeId) -> NodeId {
        self.push(Node::Select(condition, if_true, if_false))
    }

    /// Left fold of `op` over `ids`; `None` for an empty slice.
    pub fn fold(&mut self, op: BinaryOp, ids: &[NodeId]) -> Option<NodeId> {
        let (&first, rest) = ids.split_first()?;
        Some(rest.iter().fold(first, |acc, &id| self.binary(op, acc, id)))
    }

    /// Evaluates every node for the given decision vector.
    ///
    /// `values` is reused between calls to avoid reallocating; after the call
    /// `values[id.index()]` holds the value of node `id`.
    pub fn evaluate<T: Scalar>(&self, vars: &[T], values: &mut Vec<T>) -> Result<()> {
        values.clear();
        values.reserve(self.nodes.len());

        for node in &self.nodes {
            let value = match *node {
                Node::Const(c) => T::constant(c),
                Node::Var(idx) => match vars.get(idx) {
                    Some(v) => *v,
                    None => bail!(
                        "Tape references variable {} but only {} were supplied.",
                        idx,
                        vars.len()
                    ),
                },
                Node::Unary(op, a) => op.apply(values[a.0]),
                Node::Binary(op, a, b) => op.apply(values[a.0], values[b.0]),
                Node::Select(c, t, f) => ops::select(values[c.0], values[t.0], values[f.0]),
            };
            values.push(value);
        }
        Ok(())
    }

    /// Values of the selected `rows` at `x`.
    pub fn evaluate_rows(&self, x: &DVector<f64>, rows: &[NodeId]) -> Result<DVector<f64>> {
        let mut values = Vec::new();
        self.evaluate(x.as_slice(), &mut values)?;
        Ok(DVector::from_iterator(
            rows.len(),
            rows.iter().map(|id| values[id.0]),
        ))
    }

    /// Exact Jacobian of the selected `rows` with respect to the decision vector.
    ///
    /// Column `j` comes from one dual-number sweep with `x[j]` seeded and every
    /// other variable held constant.
    pub fn jacobian(&self, x: &DVector<f64>, rows: &[NodeId]) -> Result<DMatrix<f64>> {
        let n = x.len();
        let mut jacobian = DMatrix::zeros(rows.len(), n);
        let mut dual_x: Vec<Dual> = x.iter().map(|&v| Dual::new(v, 0.0)).collect();
        let mut values: Vec<Dual> = Vec::new();

        for j in 0..n {
            dual_x[j].eps = 1.0;
            self.evaluate(&dual_x, &mut values)?;
            for (i, id) in rows.iter().enumerate() {
                jacobian[(i, j)] = values[id.0].eps;
            }
            dual_x[j].eps = 0.0;
        }
        Ok(jacobian)
    }
}
