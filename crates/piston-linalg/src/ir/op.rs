use std::fmt;

use crate::{AffineMap, BlockId, OpId, RVec, ReassociationIndices, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IteratorType {
    Parallel,
    Reduction,
}

impl IteratorType {
    pub fn is_parallel(&self) -> bool {
        matches!(self, IteratorType::Parallel)
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self, IteratorType::Reduction)
    }
}

impl fmt::Display for IteratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IteratorType::Parallel => f.write_str("parallel"),
            IteratorType::Reduction => f.write_str("reduction"),
        }
    }
}

/// Loop-nest description shared by every structured op.
///
/// Operands are laid out inputs first, then inits; `indexing_maps` holds one
/// map per operand in that order.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredAttrs {
    pub indexing_maps: Vec<AffineMap>,
    pub iterator_types: RVec<IteratorType>,
    pub num_inputs: usize,
}

impl StructuredAttrs {
    pub fn num_loops(&self) -> usize {
        self.iterator_types.len()
    }

    pub fn all_parallel(&self) -> bool {
        self.iterator_types
            .iter()
            .all(|it| *it == IteratorType::Parallel)
    }

    pub fn reduction_dims(&self) -> Vec<usize> {
        self.iterator_types
            .iter()
            .enumerate()
            .filter(|(_, it)| **it == IteratorType::Reduction)
            .map(|(d, _)| d)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    /// Float division.
    Div,
    /// Signed integer division rounding toward zero.
    DivSI,
    /// Signed integer remainder with the sign of the dividend.
    RemSI,
    Max,
    Min,
}

impl ArithOp {
    pub fn name(&self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::DivSI => "divsi",
            ArithOp::RemSI => "remsi",
            ArithOp::Max => "max",
            ArithOp::Min => "min",
        }
    }

    pub fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ArithOp::Add => lhs + rhs,
            ArithOp::Sub => lhs - rhs,
            ArithOp::Mul => lhs * rhs,
            ArithOp::Div => lhs / rhs,
            ArithOp::DivSI => (lhs / rhs).trunc(),
            ArithOp::RemSI => lhs % rhs,
            ArithOp::Max => lhs.max(rhs),
            ArithOp::Min => lhs.min(rhs),
        }
    }
}

/// Payload of a `constant` op.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    /// A single scalar of the result's (scalar) type.
    Scalar(f64),
    /// Every element of the shaped result holds the same value.
    Splat(f64),
    /// Row-major elements of a statically shaped result.
    Dense(Vec<f64>),
}

/// The closed set of operation kinds the transforms understand.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Structured op with an arbitrary payload region.
    Generic(StructuredAttrs),
    /// `init[...] = value`. Operands: `[value, init]`.
    Fill(StructuredAttrs),
    /// `init[...] = input[...]`. Operands: `[input, init]`.
    Copy(StructuredAttrs),
    /// `init[i0, .., in] = input[permuted]` where result dim `i` is input dim
    /// `permutation[i]`. Operands: `[input, init]`.
    Transpose {
        attrs: StructuredAttrs,
        permutation: RVec<usize>,
    },
    /// Operands: `[src, dynamic output sizes..]`, one size per dynamic dim of
    /// the result type.
    ExpandShape {
        reassociation: Vec<ReassociationIndices>,
    },
    /// Operands: `[src]`.
    CollapseShape {
        reassociation: Vec<ReassociationIndices>,
    },
    /// Operands: `[src, padding value]`.
    Pad {
        low: RVec<usize>,
        high: RVec<usize>,
    },
    /// Operands: one size per dynamic dim of the result type.
    Empty,
    /// Unit-stride slice. Operands: `[src, dynamic sizes..]`.
    ExtractSlice { offsets: RVec<usize> },
    /// Unit-stride insertion of the whole source. Operands: `[src, dest]`.
    InsertSlice { offsets: RVec<usize> },
    /// Size of dim `index` of the operand.
    Dim { index: usize },
    Constant(ConstantValue),
    Arith(ArithOp),
    /// Element-type conversion of a scalar.
    Cast,
    /// Current iteration of loop `dim` of the enclosing structured op.
    Index { dim: usize },
    /// Evaluates a single-result map on index operands (dims).
    AffineApply(AffineMap),
    /// Terminator of a structured op payload.
    Yield,
    /// Terminator of the top-level block.
    Return,
    /// An op the transforms know nothing about; never erased as dead.
    Opaque { name: String },
}

impl OpKind {
    pub fn name(&self) -> &str {
        match self {
            OpKind::Generic(_) => "generic",
            OpKind::Fill(_) => "fill",
            OpKind::Copy(_) => "copy",
            OpKind::Transpose { .. } => "transpose",
            OpKind::ExpandShape { .. } => "expand_shape",
            OpKind::CollapseShape { .. } => "collapse_shape",
            OpKind::Pad { .. } => "pad",
            OpKind::Empty => "empty",
            OpKind::ExtractSlice { .. } => "extract_slice",
            OpKind::InsertSlice { .. } => "insert_slice",
            OpKind::Dim { .. } => "dim",
            OpKind::Constant(_) => "constant",
            OpKind::Arith(op) => op.name(),
            OpKind::Cast => "cast",
            OpKind::Index { .. } => "index",
            OpKind::AffineApply(_) => "affine_apply",
            OpKind::Yield => "yield",
            OpKind::Return => "return",
            OpKind::Opaque { name } => name.as_str(),
        }
    }

    pub fn structured(&self) -> Option<&StructuredAttrs> {
        match self {
            OpKind::Generic(attrs) | OpKind::Fill(attrs) | OpKind::Copy(attrs) => Some(attrs),
            OpKind::Transpose { attrs, .. } => Some(attrs),
            _ => None,
        }
    }

    pub fn structured_mut(&mut self) -> Option<&mut StructuredAttrs> {
        match self {
            OpKind::Generic(attrs) | OpKind::Fill(attrs) | OpKind::Copy(attrs) => Some(attrs),
            OpKind::Transpose { attrs, .. } => Some(attrs),
            _ => None,
        }
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, OpKind::Generic(_))
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, OpKind::Yield | OpKind::Return)
    }

    pub fn reassociation(&self) -> Option<&[ReassociationIndices]> {
        match self {
            OpKind::ExpandShape { reassociation } | OpKind::CollapseShape { reassociation } => {
                Some(reassociation)
            }
            _ => None,
        }
    }

    /// Ops that may be erased once none of their results are used.
    pub fn is_pure(&self) -> bool {
        !matches!(self, OpKind::Opaque { .. } | OpKind::Return | OpKind::Yield)
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    /// Single-block payload of structured ops.
    pub region: Option<BlockId>,
    /// The block this op lives in; `None` once detached.
    pub parent: Option<BlockId>,
}

impl Operation {
    pub fn name(&self) -> &str {
        self.kind.name()
    }

    pub fn structured(&self) -> Option<&StructuredAttrs> {
        self.kind.structured()
    }

    pub fn result(&self, index: usize) -> ValueId {
        self.results[index]
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub args: Vec<ValueId>,
    pub ops: Vec<OpId>,
    pub parent: Option<OpId>,
}
