#![allow(dead_code)]

use anyhow::ensure;
use ndarray::{ArrayD, Dimension, IxDyn};
use piston_linalg::interp::{self, HostValue};
use piston_linalg::{
    AffineMap, ArithOp, DimSize, ElemType, Graph, IteratorType, MixedSize, OpId, OpKind, RVec,
    Rewriter, Type, ValueId,
};

/// Deterministic, exactly representable test data.
pub fn sample(shape: &[usize], seed: usize) -> HostValue {
    ArrayD::from_shape_fn(IxDyn(shape), |idx| {
        let h = idx
            .slice()
            .iter()
            .fold(seed.wrapping_mul(7919), |acc, &i| acc.wrapping_mul(31).wrapping_add(i));
        ((h % 17) as f64 - 8.0) * 0.25
    })
    .into()
}

pub fn static_sizes(shape: &[usize]) -> Vec<MixedSize> {
    shape.iter().map(|&s| MixedSize::Static(s as i64)).collect()
}

pub fn generics(graph: &Graph) -> Vec<OpId> {
    graph
        .walk()
        .into_iter()
        .filter(|&op| graph.is_generic(op))
        .collect()
}

/// `lhs <op> rhs` over identically shaped f32 tensors, written into a fresh
/// `empty`.
pub fn elementwise(rewriter: &mut Rewriter<'_>, op: ArithOp, lhs: ValueId, rhs: ValueId) -> ValueId {
    elementwise_sized_by(rewriter, op, lhs, rhs, lhs)
}

/// Like [`elementwise`], with the `empty` sized from the dims of `like`.
/// Sizing from a function argument keeps a dynamically shaped producer at a
/// single use.
pub fn elementwise_sized_by(
    rewriter: &mut Rewriter<'_>,
    op: ArithOp,
    lhs: ValueId,
    rhs: ValueId,
    like: ValueId,
) -> ValueId {
    let ctx = rewriter.ctx();
    let ty = rewriter.graph().value_type(lhs).clone();
    let rank = ty.rank();
    let sizes = rewriter.mixed_sizes(like);
    let init = rewriter.empty(&sizes, ty.elem());
    let identity = AffineMap::identity(&ctx, rank);
    let iterator_types: RVec<IteratorType> = vec![IteratorType::Parallel; rank].into();
    let generic = rewriter.generic(
        &[lhs, rhs],
        &[init],
        vec![identity.clone(), identity.clone(), identity],
        iterator_types,
        |rw, args| vec![rw.arith(op, args[0], args[1])],
    );
    rewriter.graph().op(generic).result(0)
}

/// f32 tensor arguments of the given ranks with every dim dynamic.
pub fn dynamic_args(graph: &mut Graph, ranks: &[usize]) -> Vec<ValueId> {
    let body = graph.body();
    ranks
        .iter()
        .map(|&rank| {
            let ty = Type::tensor(vec![DimSize::Dynamic; rank], ElemType::F32);
            graph.add_argument(body, ty)
        })
        .collect()
}

/// Whether `value` is a `dim` of `source`.
pub fn is_dim_of(graph: &Graph, value: ValueId, source: ValueId) -> bool {
    graph.defining_op(value).is_some_and(|op| {
        matches!(graph.kind(op), OpKind::Dim { .. }) && graph.op(op).operands[0] == source
    })
}

/// Printed lines of `graph` containing `needle`.
pub fn printed_lines(graph: &Graph, needle: &str) -> Vec<String> {
    graph
        .to_string()
        .lines()
        .filter(|line| line.contains(needle))
        .map(|line| line.trim().to_string())
        .collect()
}

pub fn tensor_args(graph: &mut Graph, shapes: &[&[usize]]) -> Vec<ValueId> {
    let body = graph.body();
    shapes
        .iter()
        .map(|shape| graph.add_argument(body, Type::tensor(*shape, ElemType::F32)))
        .collect()
}

pub fn assert_same_semantics(
    before: &Graph,
    after: &Graph,
    args: &[HostValue],
) -> anyhow::Result<()> {
    let expected = interp::evaluate(before, args)?;
    let actual = interp::evaluate(after, args)?;
    ensure!(
        expected.len() == actual.len(),
        "{} results before, {} after",
        expected.len(),
        actual.len()
    );
    for (a, e) in actual.iter().zip(&expected) {
        interp::all_close(a, e, 1e-6, 1e-6)?;
    }
    Ok(())
}
