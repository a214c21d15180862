mod common;

use common::*;
use piston_linalg::fusion::{populate_fold_reshape_ops_by_expansion_patterns, ElementwiseFusionPass};
use piston_linalg::{
    apply_patterns_greedily, default_control_fn, ArithOp, DimSize, ElemType, Graph,
    GreedyRewriteConfig, MixedSize, OpId, OpKind, PatternSet, Rewriter, Type, ValueId,
};
use smallvec::smallvec;

#[test]
fn collapsed_input_expands_the_consumer() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = tensor_args(&mut graph, &[&[4, 8], &[32]]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let flat = rewriter.collapse_shape(args[0], vec![smallvec![0, 1]]);
        let sum = elementwise(&mut rewriter, ArithOp::Add, flat, args[1]);
        rewriter.ret(vec![sum]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_fold_reshape_ops_by_expansion_patterns(&mut patterns, default_control_fn());
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert_eq!(result.rewrites, 1);

    let expanded = generics(&graph);
    assert_eq!(expanded.len(), 1);
    assert_eq!(graph.num_loops(expanded[0]), 2);
    assert_eq!(graph.inputs(expanded[0])[0], args[0]);
    let returned = graph.returned_values();
    let Some(collapse) = graph.defining_op(returned[0]) else {
        anyhow::bail!("returned value is a function argument");
    };
    assert!(matches!(graph.kind(collapse), OpKind::CollapseShape { .. }));
    graph.verify()?;

    assert_same_semantics(&before, &graph, &[sample(&[4, 8], 1), sample(&[32], 2)])
}

/// The `expand_shape` of `src`, if there is exactly one.
fn expansion_of(graph: &Graph, src: ValueId) -> Option<OpId> {
    let mut found = graph.walk().into_iter().filter(|&op| {
        matches!(graph.kind(op), OpKind::ExpandShape { .. }) && graph.op(op).operands[0] == src
    });
    let op = found.next()?;
    found.next().is_none().then_some(op)
}

#[test]
fn dynamic_collapsed_input_expands_the_consumer() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = dynamic_args(&mut graph, &[2, 1]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let flat = rewriter.collapse_shape(args[0], vec![smallvec![0, 1]]);
        let sum = elementwise_sized_by(&mut rewriter, ArithOp::Add, flat, args[1], args[1]);
        rewriter.ret(vec![sum]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_fold_reshape_ops_by_expansion_patterns(&mut patterns, default_control_fn());
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert_eq!(result.rewrites, 1);

    let expanded = generics(&graph);
    assert_eq!(expanded.len(), 1);
    assert_eq!(graph.num_loops(expanded[0]), 2);
    assert_eq!(graph.inputs(expanded[0])[0], args[0]);
    // The other input is split with the runtime extents of the collapsed
    // source.
    let Some(reshape) = expansion_of(&graph, args[1]) else {
        anyhow::bail!("expected one expand_shape of the second argument:\n{graph}");
    };
    let sizes = &graph.op(reshape).operands[1..];
    assert_eq!(sizes.len(), 2);
    assert!(is_dim_of(&graph, sizes[0], args[0]) && is_dim_of(&graph, sizes[1], args[0]));
    graph.verify()?;

    let printed = printed_lines(&graph, " = expand_shape [[0, 1]] ");
    assert!(!printed.is_empty(), "{graph}");
    assert!(printed.iter().all(|line| line.ends_with(": tensor<?x?xf32>")));
    let generic = printed_lines(&graph, " = generic ");
    assert_eq!(generic.len(), 1);
    assert!(generic[0].contains("iterators = [parallel, parallel]"));
    assert_eq!(printed_lines(&graph, " = collapse_shape [[0, 1]] ").len(), 1);

    assert_same_semantics(&before, &graph, &[sample(&[4, 8], 1), sample(&[32], 2)])
}

#[test]
fn expanded_result_expands_the_producer() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = tensor_args(&mut graph, &[&[24], &[24]]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let sum = elementwise(&mut rewriter, ArithOp::Sub, args[0], args[1]);
        let grid = rewriter.expand_shape(
            Type::tensor([2, 3, 4], ElemType::F32),
            sum,
            vec![smallvec![0, 1, 2]],
            &static_sizes(&[2, 3, 4]),
        );
        rewriter.ret(vec![grid]);
    }
    let before = graph.clone();

    ElementwiseFusionPass::default().run(&mut graph);
    let expanded = generics(&graph);
    assert_eq!(expanded.len(), 1);
    assert_eq!(graph.num_loops(expanded[0]), 3);
    assert_eq!(graph.returned_values(), graph.op(expanded[0]).results);
    graph.verify()?;

    assert_same_semantics(&before, &graph, &[sample(&[24], 3), sample(&[24], 4)])
}

#[test]
fn dynamic_expanded_result_expands_the_producer() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = dynamic_args(&mut graph, &[1, 1, 2]);
    let like = args[2];
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let difference =
            elementwise_sized_by(&mut rewriter, ArithOp::Sub, args[0], args[1], args[1]);
        // Read after the producer, so the fold has to hoist them above it.
        let rows = rewriter.dim(like, 0);
        let cols = rewriter.dim(like, 1);
        let grid = rewriter.expand_shape(
            Type::tensor(vec![DimSize::Dynamic; 2], ElemType::F32),
            difference,
            vec![smallvec![0, 1]],
            &[MixedSize::Value(rows), MixedSize::Value(cols)],
        );
        rewriter.ret(vec![grid]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_fold_reshape_ops_by_expansion_patterns(&mut patterns, default_control_fn());
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert_eq!(result.rewrites, 1);

    let expanded = generics(&graph);
    assert_eq!(expanded.len(), 1);
    assert_eq!(graph.num_loops(expanded[0]), 2);
    assert_eq!(graph.returned_values(), graph.op(expanded[0]).results);
    for &input in &args[..2] {
        let Some(reshape) = expansion_of(&graph, input) else {
            anyhow::bail!("expected one expand_shape of {input:?}:\n{graph}");
        };
        let sizes = &graph.op(reshape).operands[1..];
        assert!(sizes.len() == 2 && sizes.iter().all(|&s| is_dim_of(&graph, s, like)));
    }
    // Dominance of the hoisted sizes.
    graph.verify()?;

    let printed = printed_lines(&graph, " = expand_shape [[0, 1]] ");
    assert!(printed.len() >= 2, "{graph}");
    assert!(printed.iter().all(|line| line.ends_with(": tensor<?x?xf32>")));
    assert!(printed_lines(&graph, " = generic ")[0].ends_with(": tensor<?x?xf32> {"));

    let inputs = [sample(&[24], 3), sample(&[24], 4), sample(&[4, 6], 5)];
    assert_same_semantics(&before, &graph, &inputs)
}

#[test]
fn expansion_bubbles_past_a_collapse_into_the_producer() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = tensor_args(&mut graph, &[&[2, 3, 10], &[2, 3, 10]]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let sum = elementwise(&mut rewriter, ArithOp::Add, args[0], args[1]);
        let rows = rewriter.collapse_shape(sum, vec![smallvec![0, 1], smallvec![2]]);
        let split = rewriter.expand_shape(
            Type::tensor([6, 2, 5], ElemType::F32),
            rows,
            vec![smallvec![0], smallvec![1, 2]],
            &static_sizes(&[6, 2, 5]),
        );
        rewriter.ret(vec![split]);
    }
    let before = graph.clone();

    let result = ElementwiseFusionPass::default().run(&mut graph);
    assert!(result.reached_fixpoint);

    let expanded = generics(&graph);
    assert_eq!(expanded.len(), 1);
    assert_eq!(graph.num_loops(expanded[0]), 4);
    let returned = graph.returned_values();
    let Some(collapse) = graph.defining_op(returned[0]) else {
        anyhow::bail!("returned value is a function argument");
    };
    assert!(matches!(graph.kind(collapse), OpKind::CollapseShape { .. }));
    assert_eq!(graph.op(collapse).operands[0], graph.op(expanded[0]).result(0));
    graph.verify()?;

    let inputs = [sample(&[2, 3, 10], 6), sample(&[2, 3, 10], 7)];
    assert_same_semantics(&before, &graph, &inputs)
}

#[test]
fn reshape_round_trip_folds_away() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = tensor_args(&mut graph, &[&[4, 8]]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let flat = rewriter.collapse_shape(args[0], vec![smallvec![0, 1]]);
        let back = rewriter.expand_shape(
            Type::tensor([4, 8], ElemType::F32),
            flat,
            vec![smallvec![0, 1]],
            &static_sizes(&[4, 8]),
        );
        rewriter.ret(vec![back]);
    }

    ElementwiseFusionPass::default().run(&mut graph);
    assert_eq!(graph.returned_values(), vec![args[0]]);
    assert_eq!(graph.num_ops(), 1);
    Ok(())
}
