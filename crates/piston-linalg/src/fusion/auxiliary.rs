//! Point-wise cleanups that expose more fusion: inlining scalar constants and
//! fills into payloads, cutting false dependencies on init values, dropping
//! operands and results the payload never needs, and evaluating generics
//! whose inputs are all constants.

use derive_new::new;

use crate::interp::{self, HostValue};
use crate::{
    concat_affine_maps, inverse_permutation, AffineMap, ConstantValue, ControlFusionFn,
    FusionError, FusionResult, Graph, InsertionPoint, IrMapping, OpId, OpKind, OpOperand,
    RewritePattern, Rewriter,
};

/// Whether the maps of the operands not in `dropped` still determine every
/// loop bound.
fn loop_bounds_computable(graph: &Graph, maps: &[AffineMap], dropped: &[bool]) -> bool {
    let kept = maps
        .iter()
        .zip(dropped)
        .filter(|(_, &d)| !d)
        .map(|(m, _)| m.clone())
        .collect::<Vec<_>>();
    concat_affine_maps(&kept)
        .is_some_and(|concat| inverse_permutation(graph.ctx(), &concat).is_some())
}

/// Replaces a scalar or splat constant input of a generic op by the scalar
/// itself, used directly in the payload.
#[derive(new)]
pub struct FoldScalarOrSplatConstant {
    control: ControlFusionFn,
}

impl RewritePattern for FoldScalarOrSplatConstant {
    fn name(&self) -> &'static str {
        "FoldScalarOrSplatConstant"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        kind.is_generic()
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        if !graph.has_pure_tensor_semantics(op) {
            return Err(FusionError::NotApplicable);
        }
        let candidate = (0..graph.num_inputs(op)).find_map(|index| {
            let value = graph.op(op).operands[index];
            let producer = graph.defining_op(value)?;
            let scalar = match graph.kind(producer) {
                OpKind::Constant(ConstantValue::Scalar(v) | ConstantValue::Splat(v)) => *v,
                _ => return None,
            };
            (self.control)(graph, OpOperand::new(op, index)).then_some((index, scalar))
        });
        let Some((index, scalar)) = candidate else {
            return Err(FusionError::NotApplicable);
        };

        let operand = graph.op(op).operands[index];
        let elem = graph.value_type(operand).elem();
        let Some(attrs) = graph.structured(op).cloned() else {
            return Err(FusionError::NotApplicable);
        };
        let mut dropped = vec![false; attrs.indexing_maps.len()];
        dropped[index] = true;
        if !loop_bounds_computable(graph, &attrs.indexing_maps, &dropped) {
            return Err(rewriter.notify_match_failure(op, "fused op loop bound computation failed"));
        }
        let mut maps = attrs.indexing_maps;
        maps.remove(index);

        let mut inputs = graph.inputs(op).to_vec();
        inputs.remove(index);
        let inits = graph.inits(op).to_vec();
        let Some(body) = graph.body_block(op) else {
            return Err(FusionError::NotApplicable);
        };
        let folded_arg = graph.block(body).args[index];

        let constant = rewriter.constant(scalar, elem);
        let (fused, block) =
            rewriter.generic_without_body(&inputs, &inits, maps, attrs.iterator_types);
        let mut mapping = IrMapping::new();
        mapping.map(folded_arg, constant);
        rewriter.clone_block_into(body, block, &mut mapping);
        let results = rewriter.graph().op(fused).results.clone();
        rewriter.replace_op(op, &results);
        Ok(())
    }
}

/// Replaces a generic whose inputs are all constants by the dense constant
/// it computes. Limited to a single statically shaped result, permutation
/// maps, and a payload that ignores its init.
#[derive(new)]
pub struct FoldConstantGenericOp {
    control: ControlFusionFn,
}

impl RewritePattern for FoldConstantGenericOp {
    fn name(&self) -> &'static str {
        "FoldConstantGenericOp"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        kind.is_generic()
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        let num_inputs = graph.num_inputs(op);
        if num_inputs == 0 || graph.inits(op).len() != 1 || !graph.has_pure_tensor_semantics(op) {
            return Err(FusionError::NotApplicable);
        }
        let all_constant = graph.inputs(op).iter().all(|&value| {
            graph.value_type(value).is_tensor()
                && graph
                    .defining_op(value)
                    .is_some_and(|p| matches!(graph.kind(p), OpKind::Constant(_)))
        });
        if !all_constant {
            return Err(FusionError::NotApplicable);
        }
        let result_ty = graph.value_type(graph.op(op).result(0)).clone();
        if !result_ty.shape().is_some_and(|shape| shape.is_static()) {
            return Err(rewriter.notify_match_failure(op, "result shape is not static"));
        }
        let ctx = graph.ctx();
        if !graph.indexing_maps(op).iter().all(|map| map.is_permutation(ctx)) {
            return Err(rewriter.notify_match_failure(op, "indexing maps are not permutations"));
        }
        if graph.payload_uses_value_from_operand(op, num_inputs) {
            return Err(rewriter.notify_match_failure(op, "payload reads the init"));
        }
        if !(0..num_inputs).all(|index| (self.control)(graph, OpOperand::new(op, index))) {
            return Err(FusionError::NotApplicable);
        }

        let values = match interp::evaluate_detached(graph, op) {
            Ok(results) => match results.into_iter().next() {
                Some(HostValue::Tensor(folded)) => folded.iter().copied().collect::<Vec<_>>(),
                _ => return Err(rewriter.notify_match_failure(op, "no tensor result")),
            },
            Err(err) => {
                return Err(rewriter.notify_match_failure(op, format!("cannot evaluate: {err:#}")))
            }
        };
        let folded = rewriter.dense(values, result_ty);
        rewriter.replace_op(op, &[folded]);
        Ok(())
    }
}

/// Reads of an input produced by `fill` become reads of the fill value.
#[derive(Debug, Default)]
pub struct FoldFillWithGenericOp;

impl RewritePattern for FoldFillWithGenericOp {
    fn name(&self) -> &'static str {
        "FoldFillWithGenericOp"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        kind.is_generic()
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        if !graph.has_pure_tensor_semantics(op) {
            return Err(FusionError::NotApplicable);
        }
        let Some(body) = graph.body_block(op) else {
            return Err(FusionError::NotApplicable);
        };
        // (block arg, fill value, element type of the fill result)
        let folds = (0..graph.num_inputs(op))
            .filter(|&index| graph.payload_uses_value_from_operand(op, index))
            .filter_map(|index| {
                let fill = graph.defining_op(graph.op(op).operands[index])?;
                if !matches!(graph.kind(fill), OpKind::Fill(_)) {
                    return None;
                }
                let fill_op = graph.op(fill);
                let elem = graph.value_type(fill_op.result(0)).elem();
                Some((graph.block(body).args[index], fill_op.operands[0], elem))
            })
            .collect::<Vec<_>>();
        if folds.is_empty() {
            return Err(FusionError::NotApplicable);
        }
        for (arg, value, elem) in folds {
            let converted = rewriter.cast(value, elem);
            rewriter.replace_all_uses_with(arg, converted);
        }
        Ok(())
    }
}

/// Inits whose value the payload never reads are replaced by `empty`, so
/// the op stops depending on whatever produced them.
#[derive(Debug, Default)]
pub struct RemoveOutsDependency;

impl RewritePattern for RemoveOutsDependency {
    fn name(&self) -> &'static str {
        "RemoveOutsDependency"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        kind.is_generic()
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        let candidates = (graph.num_inputs(op)..graph.op(op).operands.len())
            .filter(|&index| !graph.payload_uses_value_from_operand(op, index))
            .filter_map(|index| {
                let value = graph.op(op).operands[index];
                let ty = graph.value_type(value);
                if !ty.is_tensor() || ty.is_sparse() {
                    return None;
                }
                let already_empty = graph
                    .defining_op(value)
                    .is_some_and(|p| matches!(graph.kind(p), OpKind::Empty));
                (!already_empty).then_some((index, value, ty.elem()))
            })
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Err(FusionError::NotApplicable);
        }
        for (index, value, elem) in candidates {
            let sizes = rewriter.mixed_sizes(value);
            let empty = rewriter.empty(&sizes, elem);
            rewriter.set_operand(op, index, empty);
        }
        Ok(())
    }
}

/// Drops inputs the payload never reads, merges inputs that repeat the same
/// value through the same map, and drops results nobody uses whose init the
/// payload does not read. Operands stay whenever removing them would leave
/// a loop without a bound.
#[derive(Debug, Default)]
pub struct EraseUnusedOperandsAndResults;

impl RewritePattern for EraseUnusedOperandsAndResults {
    fn name(&self) -> &'static str {
        "EraseUnusedOperandsAndResults"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        kind.is_generic()
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        if !graph.has_pure_tensor_semantics(op) {
            return Err(FusionError::NotApplicable);
        }
        let Some(body) = graph.body_block(op) else {
            return Err(FusionError::NotApplicable);
        };
        let Some(attrs) = graph.structured(op).cloned() else {
            return Err(FusionError::NotApplicable);
        };
        let operands = graph.op(op).operands.clone();
        let results = graph.op(op).results.clone();
        let num_inputs = attrs.num_inputs;
        let maps = &attrs.indexing_maps;

        let mut dropped = vec![false; operands.len()];
        // Dropped duplicate input -> the input it repeats.
        let mut duplicate_of = vec![None; operands.len()];
        let mut kept_inputs: Vec<usize> = vec![];
        for index in 0..num_inputs {
            let repeated = kept_inputs
                .iter()
                .copied()
                .find(|&k| operands[k] == operands[index] && maps[k] == maps[index]);
            let used = graph.payload_uses_value_from_operand(op, index);
            if used && repeated.is_none() {
                kept_inputs.push(index);
                continue;
            }
            dropped[index] = true;
            if !loop_bounds_computable(graph, maps, &dropped) {
                dropped[index] = false;
                kept_inputs.push(index);
                continue;
            }
            if used {
                duplicate_of[index] = repeated;
            }
        }

        let live_results = results.iter().filter(|&&r| !graph.use_empty(r)).count();
        // A fully dead op is left to dead-code erasure.
        if live_results > 0 {
            for (number, &result) in results.iter().enumerate() {
                let index = num_inputs + number;
                if !graph.use_empty(result) || graph.payload_uses_value_from_operand(op, index) {
                    continue;
                }
                dropped[index] = true;
                if !loop_bounds_computable(graph, maps, &dropped) {
                    dropped[index] = false;
                }
            }
        }
        if !dropped.iter().any(|&d| d) {
            return Err(FusionError::NotApplicable);
        }

        let Some(yield_op) = graph.yield_op(body) else {
            return Err(rewriter.notify_match_failure(op, "payload without a terminator"));
        };
        let yielded = graph.op(yield_op).operands.clone();
        let old_args = graph.block(body).args.clone();
        let body_ops = graph.block(body).ops.clone();
        let keep = |i: &usize| !dropped[*i];
        let new_inputs = (0..num_inputs).filter(keep).map(|i| operands[i]).collect::<Vec<_>>();
        let new_inits = (num_inputs..operands.len())
            .filter(keep)
            .map(|i| operands[i])
            .collect::<Vec<_>>();
        let new_maps = (0..operands.len()).filter(keep).map(|i| maps[i].clone()).collect();

        let (new_op, block) =
            rewriter.generic_without_body(&new_inputs, &new_inits, new_maps, attrs.iterator_types);
        let mut mapping = IrMapping::new();
        for (index, &arg) in old_args.iter().enumerate() {
            if !dropped[index] {
                let ty = rewriter.graph().value_type(arg).clone();
                let new_arg = rewriter.add_block_argument(block, ty);
                mapping.map(arg, new_arg);
            }
        }
        for (index, original) in duplicate_of.iter().enumerate() {
            if let Some(original) = *original {
                mapping.map(old_args[index], mapping.lookup_or_default(old_args[original]));
            }
        }

        let saved = rewriter.insertion_point();
        rewriter.set_insertion_point(InsertionPoint::End(block));
        for body_op in body_ops.into_iter().filter(|&o| o != yield_op) {
            rewriter.clone_op(body_op, &mut mapping);
        }
        let new_yielded = yielded
            .iter()
            .enumerate()
            .filter(|(number, _)| !dropped[num_inputs + number])
            .map(|(_, &v)| mapping.lookup_or_default(v))
            .collect();
        rewriter.yield_values(new_yielded);
        rewriter.set_insertion_point(saved);

        let new_results = rewriter.graph().op(new_op).results.clone();
        let kept_results = results
            .iter()
            .enumerate()
            .filter(|(number, _)| !dropped[num_inputs + number])
            .map(|(_, &r)| r);
        for (old, new) in kept_results.zip(new_results) {
            rewriter.replace_all_uses_with(old, new);
        }
        rewriter.erase_op(op);
        Ok(())
    }
}

/// `collapse_shape(expand_shape(x))` and `expand_shape(collapse_shape(x))`
/// with the same reassociation fold to `x`.
#[derive(Debug, Default)]
pub struct FoldReshapeOfInverseReshape;

impl RewritePattern for FoldReshapeOfInverseReshape {
    fn name(&self) -> &'static str {
        "FoldReshapeOfInverseReshape"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        matches!(kind, OpKind::ExpandShape { .. } | OpKind::CollapseShape { .. })
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        let Some(producer) = graph.defining_op(graph.op(op).operands[0]) else {
            return Err(FusionError::NotApplicable);
        };
        let inverse = match (graph.kind(op), graph.kind(producer)) {
            (
                OpKind::CollapseShape { reassociation: outer },
                OpKind::ExpandShape { reassociation: inner },
            )
            | (
                OpKind::ExpandShape { reassociation: outer },
                OpKind::CollapseShape { reassociation: inner },
            ) => outer == inner,
            _ => false,
        };
        if !inverse {
            return Err(FusionError::NotApplicable);
        }
        let origin = graph.op(producer).operands[0];
        let result = graph.op(op).result(0);
        let result_ty = graph.value_type(result);
        if graph.value_type(origin) != result_ty {
            return Err(FusionError::NotApplicable);
        }
        // Re-expanding splits a collapsed extent; with two dynamic dims in a
        // group the split is not determined by the type.
        if let (OpKind::ExpandShape { reassociation }, Some(shape)) =
            (graph.kind(op), result_ty.shape())
        {
            let ambiguous = reassociation
                .iter()
                .any(|group| group.iter().filter(|&&d| shape[d].is_dynamic()).count() > 1);
            if ambiguous {
                return Err(rewriter.notify_match_failure(
                    op,
                    "more than one dynamic dim in a reassociation group",
                ));
            }
        }
        rewriter.replace_op(op, &[origin]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        always_control_fn, apply_patterns_greedily, ElemType, GreedyRewriteConfig, IteratorType,
        MixedSize, PatternSet, Type, ValueId,
    };

    fn run(graph: &mut Graph, pattern: impl RewritePattern + 'static) -> usize {
        let mut set = PatternSet::new();
        set.add(pattern);
        apply_patterns_greedily(graph, &set, &GreedyRewriteConfig::default()).rewrites
    }

    /// `out[i] = a[i] + b[i]` over a 1-d tensor of `n` f32s.
    fn add_op(rewriter: &mut Rewriter<'_>, a: ValueId, b: ValueId, init: ValueId) -> OpId {
        let ctx = rewriter.ctx();
        let identity = AffineMap::identity(&ctx, 1);
        rewriter.generic(
            &[a, b],
            &[init],
            vec![identity.clone(), identity.clone(), identity],
            rvec![IteratorType::Parallel],
            |rw, args| vec![rw.add(args[0], args[1])],
        )
    }

    #[test]
    fn splat_input_is_inlined() {
        let mut graph = Graph::new();
        let body = graph.body();
        let a = graph.add_argument(body, Type::tensor([8], ElemType::F32));
        let init = graph.add_argument(body, Type::tensor([8], ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        let splat = rewriter.splat(2.0, Type::tensor([8], ElemType::F32));
        let op = add_op(&mut rewriter, a, splat, init);
        let result = rewriter.graph().op(op).result(0);
        rewriter.ret(vec![result]);

        assert_eq!(run(&mut graph, FoldScalarOrSplatConstant::new(always_control_fn())), 1);
        graph.verify().unwrap();
        let generic = graph.walk().into_iter().find(|&o| graph.is_generic(o)).unwrap();
        assert_eq!(graph.num_inputs(generic), 1);
        // A second run has nothing left to fold.
        assert_eq!(run(&mut graph, FoldScalarOrSplatConstant::new(always_control_fn())), 0);
    }

    #[test]
    fn unused_init_becomes_empty() {
        let mut graph = Graph::new();
        let body = graph.body();
        let a = graph.add_argument(body, Type::tensor([8], ElemType::F32));
        let init = graph.add_argument(body, Type::tensor([8], ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        let op = add_op(&mut rewriter, a, a, init);
        let result = rewriter.graph().op(op).result(0);
        rewriter.ret(vec![result]);

        assert_eq!(run(&mut graph, RemoveOutsDependency), 1);
        let new_init = graph.inits(op)[0];
        let producer = graph.defining_op(new_init).unwrap();
        assert!(matches!(graph.kind(producer), OpKind::Empty));
    }

    #[test]
    fn duplicate_inputs_are_merged() {
        let mut graph = Graph::new();
        let body = graph.body();
        let a = graph.add_argument(body, Type::tensor([8], ElemType::F32));
        let init = graph.add_argument(body, Type::tensor([8], ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        let op = add_op(&mut rewriter, a, a, init);
        let result = rewriter.graph().op(op).result(0);
        rewriter.ret(vec![result]);

        assert_eq!(run(&mut graph, EraseUnusedOperandsAndResults), 1);
        graph.verify().unwrap();
        let generic = graph.walk().into_iter().find(|&o| graph.is_generic(o)).unwrap();
        assert_eq!(graph.inputs(generic), &[a]);
    }

    #[test]
    fn inverse_reshapes_cancel() {
        let mut graph = Graph::new();
        let body = graph.body();
        let x = graph.add_argument(body, Type::tensor([4, 8], ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        let reassociation = vec![rvec![0, 1]];
        let collapsed = rewriter.collapse_shape(x, reassociation.clone());
        let expanded = rewriter.expand_shape(
            Type::tensor([4, 8], ElemType::F32),
            collapsed,
            reassociation,
            &[MixedSize::Static(4), MixedSize::Static(8)],
        );
        rewriter.ret(vec![expanded]);

        assert_eq!(run(&mut graph, FoldReshapeOfInverseReshape), 1);
        assert_eq!(graph.returned_values(), vec![x]);
    }

    #[test]
    fn constant_inputs_fold_to_a_dense_constant() {
        let mut graph = Graph::new();
        let mut rewriter = Rewriter::new(&mut graph);
        let ty = Type::tensor([4], ElemType::F32);
        let a = rewriter.dense(vec![1.0, 2.0, 3.0, 4.0], ty.clone());
        let b = rewriter.dense(vec![0.5, 0.5, -1.0, 2.0], ty);
        let init = rewriter.empty(&[MixedSize::Static(4)], ElemType::F32);
        let op = add_op(&mut rewriter, a, b, init);
        let result = rewriter.graph().op(op).result(0);
        rewriter.ret(vec![result]);

        assert_eq!(run(&mut graph, FoldConstantGenericOp::new(always_control_fn())), 1);
        graph.verify().unwrap();
        assert!(graph.walk().into_iter().all(|o| !graph.is_generic(o)));
        let folded = graph.defining_op(graph.returned_values()[0]).unwrap();
        assert!(matches!(
            graph.kind(folded),
            OpKind::Constant(ConstantValue::Dense(values)) if values == &[1.5, 2.5, 2.0, 6.0]
        ));
    }

    #[test]
    fn generic_reading_an_argument_is_not_folded() {
        let mut graph = Graph::new();
        let body = graph.body();
        let a = graph.add_argument(body, Type::tensor([4], ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        let b = rewriter.dense(vec![1.0; 4], Type::tensor([4], ElemType::F32));
        let init = rewriter.empty(&[MixedSize::Static(4)], ElemType::F32);
        let op = add_op(&mut rewriter, a, b, init);
        let result = rewriter.graph().op(op).result(0);
        rewriter.ret(vec![result]);

        assert_eq!(run(&mut graph, FoldConstantGenericOp::new(always_control_fn())), 0);
        assert!(graph.contains_op(op));
    }
}
