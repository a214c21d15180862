mod common;

use common::*;
use piston_linalg::fusion::{
    populate_fold_reshape_ops_by_expansion_patterns,
    populate_fuse_tensor_pad_with_producer_linalg_op_patterns,
};
use piston_linalg::{
    apply_patterns_greedily, default_control_fn, ArithOp, ElemType, Graph, GreedyRewriteConfig,
    OpKind, PatternSet, Rewriter,
};
use smallvec::smallvec;

#[test]
fn pad_of_generic_writes_into_the_padded_tensor() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = tensor_args(&mut graph, &[&[3, 4], &[3, 4]]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let sum = elementwise(&mut rewriter, ArithOp::Add, args[0], args[1]);
        let fill_value = rewriter.constant(-1.0, ElemType::F32);
        let padded = rewriter.pad(sum, smallvec![1, 0], smallvec![2, 3], fill_value);
        rewriter.ret(vec![padded]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_fuse_tensor_pad_with_producer_linalg_op_patterns(&mut patterns);
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert_eq!(result.rewrites, 1);

    let returned = graph.returned_values();
    let Some(insert) = graph.defining_op(returned[0]) else {
        anyhow::bail!("returned value is a function argument");
    };
    assert!(matches!(graph.kind(insert), OpKind::InsertSlice { .. }));
    assert!(graph
        .walk()
        .into_iter()
        .all(|op| !matches!(graph.kind(op), OpKind::Pad { .. })));
    assert_eq!(generics(&graph).len(), 1);
    graph.verify()?;

    assert_same_semantics(&before, &graph, &[sample(&[3, 4], 1), sample(&[3, 4], 2)])
}

#[test]
fn pad_moves_above_a_collapse_of_unpadded_groups() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut graph = Graph::new();
    let args = tensor_args(&mut graph, &[&[2, 3, 4]]);
    {
        let mut rewriter = Rewriter::new(&mut graph);
        let flat = rewriter.collapse_shape(args[0], vec![smallvec![0], smallvec![1, 2]]);
        let zero = rewriter.constant(0.0, ElemType::F32);
        let padded = rewriter.pad(flat, smallvec![1, 0], smallvec![2, 0], zero);
        rewriter.ret(vec![padded]);
    }
    let before = graph.clone();

    let mut patterns = PatternSet::new();
    populate_fold_reshape_ops_by_expansion_patterns(&mut patterns, default_control_fn());
    let result = apply_patterns_greedily(&mut graph, &patterns, &GreedyRewriteConfig::default());
    assert_eq!(result.rewrites, 1);

    let returned = graph.returned_values();
    let Some(collapse) = graph.defining_op(returned[0]) else {
        anyhow::bail!("returned value is a function argument");
    };
    assert!(matches!(graph.kind(collapse), OpKind::CollapseShape { .. }));
    graph.verify()?;

    assert_same_semantics(&before, &graph, &[sample(&[2, 3, 4], 3)])
}
