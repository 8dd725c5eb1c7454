//! Symbolic expression batches.
//!
//! An expression is a small array of binary nodes whose leaves are device
//! buffers or host scalars. Children are always stored before their parents,
//! so the node array is acyclic by construction and the root is the last
//! node. Kernel templates read sizes and operands from here; the
//! fingerprinter walks the same structure.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::{smallvec, SmallVec};

use crate::backend::ContextId;
use crate::dtype::NumericType;
use crate::error::{TuneError, TuneResult};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A device buffer as seen by the expression layer. Clones share the handle
/// id, which is what the bind-to-handle fingerprint policy keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    id: BufferId,
    dtype: NumericType,
    dims: SmallVec<[usize; 2]>,
    context: ContextId,
}

impl BufferHandle {
    fn allocate(context: ContextId, dtype: NumericType, dims: SmallVec<[usize; 2]>) -> Self {
        BufferHandle {
            id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            dtype,
            dims,
            context,
        }
    }

    /// A single device-resident value.
    pub fn scalar(context: ContextId, dtype: NumericType) -> Self {
        Self::allocate(context, dtype, SmallVec::new())
    }

    pub fn vector(context: ContextId, dtype: NumericType, len: usize) -> Self {
        Self::allocate(context, dtype, smallvec![len])
    }

    /// Row-major `rows x cols` matrix.
    pub fn matrix(context: ContextId, dtype: NumericType, rows: usize, cols: usize) -> Self {
        Self::allocate(context, dtype, smallvec![rows, cols])
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn dtype(&self) -> NumericType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Element count; `1` for scalars.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    pub fn cols(&self) -> usize {
        self.dims.get(1).copied().unwrap_or(1)
    }

    /// `s`calar, `v`ector or `m`atrix.
    pub fn kind_code(&self) -> char {
        match self.dims.len() {
            0 => 's',
            1 => 'v',
            _ => 'm',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Missing operand of a unary node.
    Empty,
    Buffer(BufferHandle),
    HostScalar {
        dtype: NumericType,
        value: f64,
    },
    /// Index of another node of the same expression.
    Node(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    ElementProd,
    Scale,
    InnerProduct,
    /// `A x`, one dot product per matrix row.
    MatVecRows,
    /// `A^T x`, one dot product per matrix column.
    MatVecCols,
    MatMat,
    Transpose,
}

impl OpKind {
    /// Fingerprint token.
    pub fn token(self) -> &'static str {
        match self {
            OpKind::Assign => "as",
            OpKind::Add => "ad",
            OpKind::Sub => "sb",
            OpKind::Mul => "mu",
            OpKind::Div => "dv",
            OpKind::ElementProd => "ep",
            OpKind::Scale => "sc",
            OpKind::InnerProduct => "ip",
            OpKind::MatVecRows => "mr",
            OpKind::MatVecCols => "mc",
            OpKind::MatMat => "mm",
            OpKind::Transpose => "tr",
        }
    }

    pub fn is_elementwise(self) -> bool {
        matches!(
            self,
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::ElementProd | OpKind::Scale
        )
    }

    /// Infix operator for element-wise nodes.
    pub fn infix(self) -> Option<&'static str> {
        match self {
            OpKind::Add => Some("+"),
            OpKind::Sub => Some("-"),
            OpKind::Mul | OpKind::ElementProd | OpKind::Scale => Some("*"),
            OpKind::Div => Some("/"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub lhs: Operand,
    pub op: OpKind,
    pub rhs: Operand,
}

/// Item handed to traversal callbacks.
#[derive(Debug, Clone, Copy)]
pub enum Visit<'a> {
    Node(&'a Node),
    Leaf(&'a Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicExpression {
    nodes: Vec<Node>,
    root: usize,
    context: ContextId,
    dtype: NumericType,
}

impl SymbolicExpression {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn root(&self) -> &Node {
        &self.nodes[self.root]
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn dtype(&self) -> NumericType {
        self.dtype
    }

    /// Prefix traversal from the root: node, then its lhs, then its rhs.
    pub fn visit<'a, F>(&'a self, mut f: F)
    where
        F: FnMut(Visit<'a>),
    {
        let _ = self.try_visit(|visit| {
            f(visit);
            ControlFlow::<()>::Continue(())
        });
    }

    /// [`SymbolicExpression::visit`] that stops at the first `Break`.
    ///
    /// Nodes may be shared, so a full traversal can be exponential in the
    /// node count; callers with a budget should break out of it.
    pub fn try_visit<'a, B, F>(&'a self, mut f: F) -> ControlFlow<B>
    where
        F: FnMut(Visit<'a>) -> ControlFlow<B>,
    {
        self.visit_node(self.root, &mut f)
    }

    fn visit_node<'a, B, F>(&'a self, index: usize, f: &mut F) -> ControlFlow<B>
    where
        F: FnMut(Visit<'a>) -> ControlFlow<B>,
    {
        let node = &self.nodes[index];
        f(Visit::Node(node))?;
        self.visit_operand(&node.lhs, f)?;
        self.visit_operand(&node.rhs, f)
    }

    fn visit_operand<'a, B, F>(&'a self, operand: &'a Operand, f: &mut F) -> ControlFlow<B>
    where
        F: FnMut(Visit<'a>) -> ControlFlow<B>,
    {
        match operand {
            Operand::Node(child) => self.visit_node(*child, f),
            Operand::Empty => ControlFlow::Continue(()),
            leaf => f(Visit::Leaf(leaf)),
        }
    }

    /// First node with operator `op` in prefix order.
    pub fn find(&self, op: OpKind) -> Option<&Node> {
        match self.try_visit(|visit| match visit {
            Visit::Node(node) if node.op == op => ControlFlow::Break(node),
            _ => ControlFlow::Continue(()),
        }) {
            ControlFlow::Break(node) => Some(node),
            ControlFlow::Continue(()) => None,
        }
    }

    /// The buffer written by a root `Assign`.
    pub fn assigned(&self) -> Option<&BufferHandle> {
        let root = self.root();
        match (&root.op, &root.lhs) {
            (OpKind::Assign, Operand::Buffer(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Resolves an operand to a buffer, looking through `Transpose` nodes.
    /// Returns the buffer and whether it is read transposed.
    pub fn buffer_operand<'a>(&'a self, operand: &'a Operand) -> Option<(&'a BufferHandle, bool)> {
        match operand {
            Operand::Buffer(handle) => Some((handle, false)),
            Operand::Node(index) => {
                let node = self.nodes.get(*index)?;
                if node.op != OpKind::Transpose {
                    return None;
                }
                self.buffer_operand(&node.lhs)
                    .map(|(handle, transposed)| (handle, !transposed))
            }
            _ => None,
        }
    }

    /// `out = alpha * x + y` on scalars, vectors or matrices.
    pub fn axpy(
        out: &BufferHandle,
        alpha: f64,
        x: &BufferHandle,
        y: &BufferHandle,
    ) -> TuneResult<Self> {
        let mut builder = ExprBuilder::new(out.context(), out.dtype());
        let scaled = builder.push(
            Operand::Buffer(x.clone()),
            OpKind::Scale,
            Operand::HostScalar {
                dtype: out.dtype(),
                value: alpha,
            },
        );
        let sum = builder.push(scaled, OpKind::Add, Operand::Buffer(y.clone()));
        let root = builder.push(Operand::Buffer(out.clone()), OpKind::Assign, sum);
        builder.finish(root)
    }

    /// `out = x . y` with `out` a device scalar.
    pub fn dot(out: &BufferHandle, x: &BufferHandle, y: &BufferHandle) -> TuneResult<Self> {
        let mut builder = ExprBuilder::new(out.context(), out.dtype());
        let product = builder.push(
            Operand::Buffer(x.clone()),
            OpKind::InnerProduct,
            Operand::Buffer(y.clone()),
        );
        let root = builder.push(Operand::Buffer(out.clone()), OpKind::Assign, product);
        builder.finish(root)
    }

    /// `out = A x` or, when `transposed`, `out = A^T x`.
    pub fn gemv(
        out: &BufferHandle,
        a: &BufferHandle,
        x: &BufferHandle,
        transposed: bool,
    ) -> TuneResult<Self> {
        let mut builder = ExprBuilder::new(out.context(), out.dtype());
        let op = if transposed {
            OpKind::MatVecCols
        } else {
            OpKind::MatVecRows
        };
        let product = builder.push(Operand::Buffer(a.clone()), op, Operand::Buffer(x.clone()));
        let root = builder.push(Operand::Buffer(out.clone()), OpKind::Assign, product);
        builder.finish(root)
    }

    /// `out = op(A) op(B)` where `op` transposes when requested.
    pub fn gemm(
        out: &BufferHandle,
        a: &BufferHandle,
        b: &BufferHandle,
        trans_a: bool,
        trans_b: bool,
    ) -> TuneResult<Self> {
        let mut builder = ExprBuilder::new(out.context(), out.dtype());
        let operand = |builder: &mut ExprBuilder, handle: &BufferHandle, transposed: bool| {
            let leaf = Operand::Buffer(handle.clone());
            if transposed {
                builder.push(leaf, OpKind::Transpose, Operand::Empty)
            } else {
                leaf
            }
        };
        let lhs = operand(&mut builder, a, trans_a);
        let rhs = operand(&mut builder, b, trans_b);
        let product = builder.push(lhs, OpKind::MatMat, rhs);
        let root = builder.push(Operand::Buffer(out.clone()), OpKind::Assign, product);
        builder.finish(root)
    }
}

/// Incremental construction of a [`SymbolicExpression`].
pub struct ExprBuilder {
    context: ContextId,
    dtype: NumericType,
    nodes: Vec<Node>,
}

impl ExprBuilder {
    pub fn new(context: ContextId, dtype: NumericType) -> Self {
        ExprBuilder {
            context,
            dtype,
            nodes: Vec::new(),
        }
    }

    /// Appends a node and returns an operand referring to it.
    pub fn push(&mut self, lhs: Operand, op: OpKind, rhs: Operand) -> Operand {
        self.nodes.push(Node { lhs, op, rhs });
        Operand::Node(self.nodes.len() - 1)
    }

    /// Validates the node array; `root` must be the last node pushed.
    pub fn finish(self, root: Operand) -> TuneResult<SymbolicExpression> {
        let root = match root {
            Operand::Node(index) if index + 1 == self.nodes.len() => index,
            other => {
                return Err(TuneError::invalid_argument(format!(
                    "expression root must be the last node ({}), got {other:?}",
                    self.nodes.len().saturating_sub(1)
                )))
            }
        };
        for (index, node) in self.nodes.iter().enumerate() {
            for operand in [&node.lhs, &node.rhs] {
                match operand {
                    Operand::Node(child) if *child >= index => {
                        return Err(TuneError::invalid_argument(format!(
                            "node {index} refers to node {child}, which is not built before it"
                        )));
                    }
                    Operand::Buffer(handle) if handle.context() != self.context => {
                        return Err(TuneError::invalid_argument(format!(
                            "buffer {:?} lives on {}, expression is built on {}",
                            handle.id(),
                            handle.context(),
                            self.context
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(SymbolicExpression {
            nodes: self.nodes,
            root,
            context: self.context,
            dtype: self.dtype,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrder {
    /// Unrelated expressions that may be fused into one launch.
    Independent,
    /// One composed expression.
    Sequential,
}

impl BatchOrder {
    /// Leading fingerprint character.
    pub fn prefix(self) -> char {
        match self {
            BatchOrder::Independent => 'i',
            BatchOrder::Sequential => 's',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionBatch {
    order: BatchOrder,
    expressions: Vec<SymbolicExpression>,
}

impl ExpressionBatch {
    pub fn single(expression: SymbolicExpression) -> Self {
        ExpressionBatch {
            order: BatchOrder::Sequential,
            expressions: vec![expression],
        }
    }

    pub fn independent(expressions: Vec<SymbolicExpression>) -> TuneResult<Self> {
        let first = expressions
            .first()
            .ok_or_else(|| TuneError::invalid_argument("expression batch must not be empty"))?;
        let context = first.context();
        if let Some(stray) = expressions.iter().find(|expr| expr.context() != context) {
            return Err(TuneError::invalid_argument(format!(
                "expression batch mixes {} and {}",
                context,
                stray.context()
            )));
        }
        Ok(ExpressionBatch {
            order: BatchOrder::Independent,
            expressions,
        })
    }

    pub fn order(&self) -> BatchOrder {
        self.order
    }

    pub fn expressions(&self) -> &[SymbolicExpression] {
        &self.expressions
    }

    pub fn first(&self) -> &SymbolicExpression {
        &self.expressions[0]
    }

    pub fn context(&self) -> ContextId {
        self.first().context()
    }

    pub fn dtype(&self) -> NumericType {
        self.first().dtype()
    }
}

impl From<SymbolicExpression> for ExpressionBatch {
    fn from(expression: SymbolicExpression) -> Self {
        ExpressionBatch::single(expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: ContextId = ContextId::new(1);

    #[test]
    fn axpy_places_root_last_and_visits_in_prefix_order() {
        let x = BufferHandle::vector(CTX, NumericType::F32, 8);
        let y = BufferHandle::vector(CTX, NumericType::F32, 8);
        let expr = SymbolicExpression::axpy(&y, 2.0, &x, &y).unwrap();
        assert_eq!(expr.root().op, OpKind::Assign);
        assert_eq!(expr.assigned().map(BufferHandle::id), Some(y.id()));

        let mut tokens = Vec::new();
        expr.visit(|visit| match visit {
            Visit::Node(node) => tokens.push(node.op.token().to_string()),
            Visit::Leaf(Operand::Buffer(handle)) => tokens.push(format!("b{}", handle.kind_code())),
            Visit::Leaf(_) => tokens.push("h".to_string()),
        });
        assert_eq!(tokens, ["as", "bv", "ad", "sc", "bv", "h", "bv"]);
    }

    #[test]
    fn gemm_resolves_transposed_operands() {
        let a = BufferHandle::matrix(CTX, NumericType::F64, 16, 8);
        let b = BufferHandle::matrix(CTX, NumericType::F64, 16, 4);
        let c = BufferHandle::matrix(CTX, NumericType::F64, 8, 4);
        let expr = SymbolicExpression::gemm(&c, &a, &b, true, false).unwrap();
        let product = expr.find(OpKind::MatMat).unwrap();
        let (lhs, lhs_t) = expr.buffer_operand(&product.lhs).unwrap();
        let (rhs, rhs_t) = expr.buffer_operand(&product.rhs).unwrap();
        assert_eq!((lhs.id(), lhs_t), (a.id(), true));
        assert_eq!((rhs.id(), rhs_t), (b.id(), false));
    }

    #[test]
    fn builder_rejects_forward_references_and_foreign_buffers() {
        let mut builder = ExprBuilder::new(CTX, NumericType::F32);
        let root = builder.push(Operand::Node(0), OpKind::Add, Operand::Empty);
        assert!(builder.finish(root).unwrap_err().is_invalid_argument());

        let foreign = BufferHandle::vector(ContextId::new(2), NumericType::F32, 4);
        let mut builder = ExprBuilder::new(CTX, NumericType::F32);
        let root = builder.push(Operand::Buffer(foreign), OpKind::Assign, Operand::Empty);
        assert!(builder.finish(root).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn builder_requires_the_root_to_be_the_last_node() {
        let x = BufferHandle::vector(CTX, NumericType::F32, 4);
        let mut builder = ExprBuilder::new(CTX, NumericType::F32);
        let inner = builder.push(Operand::Buffer(x.clone()), OpKind::Add, Operand::Buffer(x.clone()));
        builder.push(Operand::Buffer(x), OpKind::Assign, inner.clone());
        assert!(builder.finish(inner).unwrap_err().is_invalid_argument());

        let builder = ExprBuilder::new(CTX, NumericType::F32);
        assert!(builder.finish(Operand::Node(0)).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn try_visit_stops_at_the_first_break() {
        let x = BufferHandle::vector(CTX, NumericType::F32, 8);
        let y = BufferHandle::vector(CTX, NumericType::F32, 8);
        let expr = SymbolicExpression::axpy(&y, 2.0, &x, &y).unwrap();
        let mut seen = 0;
        let flow = expr.try_visit(|visit| {
            seen += 1;
            match visit {
                Visit::Node(node) if node.op == OpKind::Scale => ControlFlow::Break(seen),
                _ => ControlFlow::Continue(()),
            }
        });
        assert_eq!(flow, ControlFlow::Break(4));
        assert_eq!(seen, 4);
    }

    #[test]
    fn independent_batch_requires_one_context() {
        let a = BufferHandle::vector(CTX, NumericType::F32, 4);
        let b = BufferHandle::vector(ContextId::new(2), NumericType::F32, 4);
        let ea = SymbolicExpression::axpy(&a, 1.0, &a, &a).unwrap();
        let eb = SymbolicExpression::axpy(&b, 1.0, &b, &b).unwrap();
        assert!(ExpressionBatch::independent(vec![ea.clone(), eb]).is_err());
        assert!(ExpressionBatch::independent(Vec::new()).is_err());
        let batch = ExpressionBatch::independent(vec![ea.clone(), ea]).unwrap();
        assert_eq!(batch.order().prefix(), 'i');
    }
}
