mod common;

use std::rc::Rc;

use common::*;
use piston_linalg::fusion::{
    collapse_op_iteration_dims, get_collapsable_iteration_space_dims,
    populate_collapse_dimensions, populate_fold_reshape_ops_by_collapsing_patterns,
};
use piston_linalg::{
    apply_patterns_greedily, default_control_fn, AffineMap, ArithOp, BufferType, DimSize,
    ElemType, FusionError, Graph, GreedyRewriteConfig, IteratorType, Layout, MixedSize, OpId,
    OpKind, PatternSet, ReassociationIndices, Rewriter, Type,
};
use smallvec::smallvec;

/// A row reduction over `[2, 3, 3]` whose input is read through `input_map`.
fn reduction(input_map: &[usize]) -> (Graph, OpId) {
    let mut graph = Graph::new();
    let args = tensor_args(&mut graph, &[&[2, 3, 3], &[2]]);
    let mut rewriter = Rewriter::new(&mut graph);
    let ctx = rewriter.ctx();
    let op = rewriter.generic(
        &[args[0]],
        &[args[1]],
        vec![
            AffineMap::from_dims(&ctx, 3, input_map),
            AffineMap::from_dims(&ctx, 3, &[0]),
        ],
        vec![
            IteratorType::Parallel,
            IteratorType::Reduction,
            IteratorType::Reduction,
        ]
        .into(),
        |rw, block_args| vec![rw.add(block_args[0], block_args[1])],
    );
    (graph, op)
}

#[test]
fn folded_reductions_must_stay_in_order() {
    let (graph, op) = reduction(&[0, 1, 2]);
    let expected: Vec<ReassociationIndices> = vec![smallvec![1, 2]];
    assert_eq!(
        get_collapsable_iteration_space_dims(&graph, op, 0, &[smallvec![0], smallvec![1, 2]]),
        expected
    );

    let (graph, op) = reduction(&[0, 2, 1]);
    assert!(
        get_collapsable_iteration_space_dims(&graph, op, 0, &[smallvec![0], smallvec![1, 2]])
            .is_empty()
    );
}

#[test]
fn expanded_input_collapses_the_consumer() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = tensor_args(&mut graph, &[&[32], &[4, 8]]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let grid = rewriter.expand_shape(
            Type::tensor([4, 8], ElemType::F32),
            args[0],
            vec![smallvec![0, 1]],
            &static_sizes(&[4, 8]),
        );
        let sum = elementwise(&mut rewriter, ArithOp::Mul, grid, args[1]);
        rewriter.ret(vec![sum]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_fold_reshape_ops_by_collapsing_patterns(&mut patterns, default_control_fn());
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert!(result.reached_fixpoint);

    let collapsed = generics(&graph);
    assert_eq!(collapsed.len(), 1);
    assert_eq!(graph.num_loops(collapsed[0]), 1);
    assert_eq!(graph.inputs(collapsed[0])[0], args[0]);
    graph.verify()?;

    assert_same_semantics(&before, &graph, &[sample(&[32], 1), sample(&[4, 8], 2)])
}

#[test]
fn dynamic_expanded_input_collapses_the_consumer() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = dynamic_args(&mut graph, &[1, 2]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let rows = rewriter.dim(args[1], 0);
        let cols = rewriter.dim(args[1], 1);
        let grid = rewriter.expand_shape(
            Type::tensor(vec![DimSize::Dynamic; 2], ElemType::F32),
            args[0],
            vec![smallvec![0, 1]],
            &[MixedSize::Value(rows), MixedSize::Value(cols)],
        );
        let product = elementwise_sized_by(&mut rewriter, ArithOp::Mul, grid, args[1], args[1]);
        rewriter.ret(vec![product]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_fold_reshape_ops_by_collapsing_patterns(&mut patterns, default_control_fn());
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert!(result.reached_fixpoint);
    // The collapse, then the cancelled reshape pair.
    assert_eq!(result.rewrites, 2);

    let collapsed = generics(&graph);
    assert_eq!(collapsed.len(), 1);
    assert_eq!(graph.num_loops(collapsed[0]), 1);
    assert_eq!(graph.inputs(collapsed[0])[0], args[0]);
    let returned = graph.returned_values();
    let Some(expand) = graph.defining_op(returned[0]) else {
        anyhow::bail!("returned value is a function argument");
    };
    assert!(matches!(graph.kind(expand), OpKind::ExpandShape { .. }));
    assert_eq!(graph.op(expand).operands[0], graph.op(collapsed[0]).result(0));
    graph.verify()?;

    let generic = printed_lines(&graph, " = generic ");
    assert_eq!(generic.len(), 1);
    assert!(generic[0].contains("iterators = [parallel]}"), "{}", generic[0]);
    assert!(generic[0].ends_with(": tensor<?xf32> {"));

    assert_same_semantics(&before, &graph, &[sample(&[30], 1), sample(&[5, 6], 2)])
}

#[test]
fn collapsed_loops_recover_their_indices() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let ctx = rewriter.ctx();
        let init = rewriter.empty(&[MixedSize::Static(3), MixedSize::Static(4)], ElemType::F32);
        let op = rewriter.generic(
            &[],
            &[init],
            vec![AffineMap::identity(&ctx, 2)],
            vec![IteratorType::Parallel; 2].into(),
            |rw, _| {
                let (i, j) = (rw.index(0), rw.index(1));
                let ten = rw.constant_index(10);
                let row = rw.mul(i, ten);
                let linear = rw.add(row, j);
                vec![rw.cast(linear, ElemType::F32)]
            },
        );
        let result = rewriter.graph().op(op).result(0);
        rewriter.ret(vec![result]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_collapse_dimensions(
        &mut patterns,
        Rc::new(|graph: &Graph, op: OpId| -> Vec<ReassociationIndices> {
            if graph.num_loops(op) == 2 {
                vec![smallvec![0, 1]]
            } else {
                vec![]
            }
        }),
    );
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert_eq!(result.rewrites, 1);

    let collapsed = generics(&graph);
    assert_eq!(collapsed.len(), 1);
    assert_eq!(graph.num_loops(collapsed[0]), 1);
    graph.verify()?;

    assert_same_semantics(&before, &graph, &[])
}

#[test]
fn dynamic_collapsed_loops_recover_their_indices() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = dynamic_args(&mut graph, &[2]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let ctx = rewriter.ctx();
        let sizes = rewriter.mixed_sizes(args[0]);
        let init = rewriter.empty(&sizes, ElemType::F32);
        let identity = AffineMap::identity(&ctx, 2);
        let op = rewriter.generic(
            &[args[0]],
            &[init],
            vec![identity.clone(), identity],
            vec![IteratorType::Parallel; 2].into(),
            |rw, block_args| {
                let (i, j) = (rw.index(0), rw.index(1));
                let hundred = rw.constant_index(100);
                let row = rw.mul(i, hundred);
                let linear = rw.add(row, j);
                let linear = rw.cast(linear, ElemType::F32);
                vec![rw.add(block_args[0], linear)]
            },
        );
        let result = rewriter.graph().op(op).result(0);
        rewriter.ret(vec![result]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_collapse_dimensions(
        &mut patterns,
        Rc::new(|graph: &Graph, op: OpId| -> Vec<ReassociationIndices> {
            if graph.num_loops(op) == 2 {
                vec![smallvec![0, 1]]
            } else {
                vec![]
            }
        }),
    );
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert_eq!(result.rewrites, 1);

    let collapsed = generics(&graph);
    assert_eq!(collapsed.len(), 1);
    assert_eq!(graph.num_loops(collapsed[0]), 1);
    graph.verify()?;

    // The inner extent is only known at runtime, so the delinearization
    // reads it from the input.
    let Some(body) = graph.body_block(collapsed[0]) else {
        anyhow::bail!("collapsed op without a payload");
    };
    let delinearized = graph
        .block(body)
        .ops
        .iter()
        .filter(|&&op| matches!(graph.kind(op), OpKind::Arith(ArithOp::RemSI | ArithOp::DivSI)))
        .map(|&op| graph.op(op).operands[1])
        .collect::<Vec<_>>();
    assert_eq!(delinearized.len(), 2);
    assert!(delinearized.iter().all(|&extent| is_dim_of(&graph, extent, args[0])));
    assert_eq!(printed_lines(&graph, " = remsi ").len(), 1);
    assert_eq!(printed_lines(&graph, " = divsi ").len(), 1);
    assert!(printed_lines(&graph, " = generic ")[0].contains("iterators = [parallel]}"));

    assert_same_semantics(&before, &graph, &[sample(&[3, 7], 6)])
}

fn buffer_copy(layout: Layout) -> (Graph, OpId) {
    let mut graph = Graph::new();
    let body = graph.body();
    let src = graph.add_argument(
        body,
        Type::Buffer(BufferType {
            shape: [4, 8].into(),
            elem: ElemType::F32,
            layout,
        }),
    );
    let dst = graph.add_argument(body, Type::buffer([4, 8], ElemType::F32));
    let mut rewriter = Rewriter::new(&mut graph);
    let copy = rewriter.copy(src, dst);
    rewriter.ret(vec![]);
    (graph, copy)
}

#[test]
fn strided_buffers_are_not_collapsed() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut graph, copy) = buffer_copy(Layout::Strided {
        strides: smallvec![Some(16), Some(1)],
    });
    let mut rewriter = Rewriter::new(&mut graph);
    match collapse_op_iteration_dims(&mut rewriter, copy, &[smallvec![0, 1]]) {
        Err(FusionError::MatchFailure { reason, .. }) => {
            assert_eq!(reason, "memref is not guaranteed collapsible")
        }
        other => anyhow::bail!("expected a match failure, got {other:?}"),
    }

    let (mut graph, copy) = buffer_copy(Layout::Identity);
    let mut rewriter = Rewriter::new(&mut graph);
    let collapsed = collapse_op_iteration_dims(&mut rewriter, copy, &[smallvec![0, 1]])?;
    assert!(collapsed.results.is_empty());
    assert_eq!(rewriter.graph().num_loops(collapsed.collapsed_op), 1);
    Ok(())
}
