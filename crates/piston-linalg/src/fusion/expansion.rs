//! Folding reshapes into structured ops by expanding their loop nest.
//!
//! A `collapse_shape` feeding a structured op, or an `expand_shape` of its
//! result, disappears when every loop the reshape touches is split into the
//! expanded dims. Other operands are reshaped to match, and results are
//! collapsed back to their original types.

use derive_new::new;

use crate::{
    invert_permutation_vector, reshape_like_shapes_are_compatible, AffineContext, AffineExpr,
    AffineMap, BlockId, ControlFusionFn, DimSize, FusionError, FusionResult, Graph, HashSet, IrMapping,
    IteratorType, MixedSize, OpId, OpKind, OpOperand, RVec, ReassociationIndices, RewritePattern,
    Rewriter, Shape, Type, ValueId,
};

/// Whether `op` can be expanded to absorb a reshape of `operand`: tensors
/// only, every map a projected permutation, and the operand not a scalar.
pub fn is_fusable_with_reshape_by_dim_expansion(graph: &Graph, op: OpId, operand: usize) -> bool {
    let ctx = graph.ctx();
    graph.has_pure_tensor_semantics(op)
        && graph
            .indexing_maps(op)
            .iter()
            .all(|map| map.is_projected_permutation(ctx))
        && graph.matching_indexing_map(op, operand).num_results() > 0
}

/// How each loop of the original op splits into loops of the expanded op.
#[derive(Debug, Clone)]
pub struct ExpansionInfo {
    /// Original loop -> the expanded loops it becomes.
    reassociation: Vec<ReassociationIndices>,
    /// Original loop -> extents of its expanded loops.
    expanded_shape_map: Vec<Vec<MixedSize>>,
    original_loop_extent: Vec<MixedSize>,
    expanded_op_num_dims: usize,
}

impl ExpansionInfo {
    /// `reassociation` groups the dims of `expanded_shape` into the dims of
    /// `operand`. Loop extents the reshape does not cover are materialized
    /// before `op`.
    pub fn compute(
        rewriter: &mut Rewriter<'_>,
        op: OpId,
        operand: usize,
        reassociation: &[ReassociationIndices],
        expanded_shape: &[MixedSize],
    ) -> Option<Self> {
        if reassociation.is_empty() {
            return None;
        }
        let ctx = rewriter.ctx();
        let fused_map = rewriter.graph().matching_indexing_map(op, operand).clone();

        let saved = rewriter.insertion_point();
        rewriter.set_insertion_point_before(op);
        let ranges = rewriter.create_loop_ranges(op);
        rewriter.set_insertion_point(saved);
        let original_loop_extent = ranges?.into_iter().map(|r| r.size).collect::<Vec<_>>();

        let num_dims = fused_map.num_dims();
        let mut num_expanded = vec![1; num_dims];
        let mut expanded_shape_map = vec![Vec::new(); num_dims];
        for (index, &expr) in fused_map.results().iter().enumerate() {
            let pos = ctx.as_dim(expr)?;
            let group = reassociation.get(index)?;
            let start = *group.first()?;
            num_expanded[pos] = group.len();
            expanded_shape_map[pos] = expanded_shape.get(start..start + group.len())?.to_vec();
        }
        for (dim, shape) in expanded_shape_map.iter_mut().enumerate() {
            if shape.is_empty() {
                *shape = vec![original_loop_extent[dim]];
            }
        }

        let mut next = 0;
        let reassociation = num_expanded
            .iter()
            .map(|&n| {
                let group = (next..next + n).collect::<ReassociationIndices>();
                next += n;
                group
            })
            .collect();
        Some(Self {
            reassociation,
            expanded_shape_map,
            original_loop_extent,
            expanded_op_num_dims: next,
        })
    }

    pub fn orig_op_num_dims(&self) -> usize {
        self.reassociation.len()
    }

    pub fn expanded_op_num_dims(&self) -> usize {
        self.expanded_op_num_dims
    }

    pub fn expanded_dims(&self, dim: usize) -> &[usize] {
        &self.reassociation[dim]
    }

    pub fn expanded_shape_of_dim(&self, dim: usize) -> &[MixedSize] {
        &self.expanded_shape_map[dim]
    }

    pub fn original_shape(&self) -> &[MixedSize] {
        &self.original_loop_extent
    }
}

/// The indexing map of the expanded op for an operand indexed by `map`.
fn indexing_map_in_expanded_op(
    ctx: &AffineContext,
    map: &AffineMap,
    info: &ExpansionInfo,
) -> AffineMap {
    let mut results = RVec::<AffineExpr>::new();
    for &expr in map.results() {
        if let Some(dim) = ctx.as_dim(expr) {
            for &expanded in info.expanded_dims(dim) {
                results.push(ctx.dim(expanded));
            }
        }
    }
    AffineMap::new(info.expanded_op_num_dims(), map.num_symbols(), results)
}

fn expanded_shape_and_type(
    ctx: &AffineContext,
    ty: &Type,
    map: &AffineMap,
    info: &ExpansionInfo,
) -> (Vec<MixedSize>, Type) {
    let mut shape = Vec::new();
    for &expr in map.results() {
        if let Some(dim) = ctx.as_dim(expr) {
            shape.extend_from_slice(info.expanded_shape_of_dim(dim));
        }
    }
    let static_shape = shape.iter().map(|s| s.to_dim_size()).collect::<Shape>();
    (shape, ty.with_shape(static_shape))
}

/// Reassociation taking an operand indexed by `map` to its expanded form.
fn reassociation_for_expansion(
    ctx: &AffineContext,
    map: &AffineMap,
    info: &ExpansionInfo,
) -> Vec<ReassociationIndices> {
    let mut reassociation = Vec::new();
    let mut next = 0;
    for &expr in map.results() {
        if let Some(dim) = ctx.as_dim(expr) {
            let n = info.expanded_dims(dim).len();
            reassociation.push((next..next + n).collect());
            next += n;
        }
    }
    reassociation
}

/// Rewrites every `index` read of an expanded loop as the linearization of
/// the indices of its expanded loops.
fn update_expanded_generic_op_region(
    rewriter: &mut Rewriter<'_>,
    block: BlockId,
    info: &ExpansionInfo,
) {
    let index_ops = rewriter
        .graph()
        .block(block)
        .ops
        .iter()
        .copied()
        .filter(|&op| matches!(rewriter.graph().kind(op), OpKind::Index { .. }))
        .collect::<Vec<_>>();
    for op in index_ops {
        let OpKind::Index { dim } = *rewriter.graph().kind(op) else {
            continue;
        };
        let expanded = info.expanded_dims(dim).to_vec();
        if expanded.len() == 1 && expanded[0] == dim {
            continue;
        }
        rewriter.set_insertion_point_after(op);
        let inner_shape = info.expanded_shape_of_dim(dim)[1..].to_vec();
        let inner_indices = expanded[1..]
            .iter()
            .map(|&d| rewriter.index(d))
            .collect::<Vec<_>>();
        let mut linear = rewriter.index(expanded[0]);
        for (size, index) in inner_shape.into_iter().zip(inner_indices) {
            let size = rewriter.materialize(size);
            let scaled = rewriter.mul(linear, size);
            linear = rewriter.add(index, scaled);
        }
        let old = rewriter.graph().op(op).result(0);
        rewriter.replace_all_uses_with(old, linear);
        rewriter.erase_op(op);
    }
}

/// Builds the expanded version of `op`. Fill, copy and transpose keep their
/// kind; everything else becomes a generic op.
fn create_expanded_op(
    rewriter: &mut Rewriter<'_>,
    op: OpId,
    inputs: &[ValueId],
    outputs: &[ValueId],
    maps: Vec<AffineMap>,
    info: &ExpansionInfo,
) -> FusionResult<OpId> {
    match rewriter.graph().kind(op).clone() {
        OpKind::Transpose { permutation, .. } => {
            let mut flattened = RVec::<usize>::new();
            for p in invert_permutation_vector(&permutation) {
                flattened.extend_from_slice(info.expanded_dims(p));
            }
            Ok(rewriter.transpose(
                inputs[0],
                outputs[0],
                invert_permutation_vector(&flattened),
            ))
        }
        OpKind::Fill(_) => Ok(rewriter.fill(inputs[0], outputs[0])),
        OpKind::Copy(_) => Ok(rewriter.copy(inputs[0], outputs[0])),
        OpKind::Generic(attrs) => {
            let mut iterator_types: RVec<IteratorType> =
                rvec![IteratorType::Parallel; info.expanded_op_num_dims()];
            for (dim, &it) in attrs.iterator_types.iter().enumerate() {
                for &expanded in info.expanded_dims(dim) {
                    iterator_types[expanded] = it;
                }
            }
            let Some(body) = rewriter.graph().body_block(op) else {
                return Err(rewriter.notify_match_failure(op, "generic op without a payload"));
            };
            let (expanded, block) =
                rewriter.generic_without_body(inputs, outputs, maps, iterator_types);
            rewriter.clone_block_into(body, block, &mut IrMapping::new());
            update_expanded_generic_op_region(rewriter, block, info);
            Ok(expanded)
        }
        _ => Err(FusionError::NotApplicable),
    }
}

/// Moves the ops computing `values` (and what they depend on) before
/// `before`, keeping their relative order.
pub fn move_value_definitions(
    rewriter: &mut Rewriter<'_>,
    values: &[ValueId],
    before: OpId,
) -> FusionResult<()> {
    let graph = rewriter.graph();
    let (block, _) = graph.position(before);
    let mut slice = Vec::new();
    let mut seen = HashSet::default();
    let mut worklist = values.to_vec();
    while let Some(value) = worklist.pop() {
        let Some(def) = graph.defining_op(value) else {
            continue;
        };
        if def == before {
            return Err(rewriter.notify_match_failure(
                before,
                "cannot move dependencies before an operation in their backward slice",
            ));
        }
        if graph.position(def).0 != block {
            return Err(rewriter.notify_match_failure(
                before,
                "cannot move values defined in another block",
            ));
        }
        if !graph.is_before_in_block(before, def) || !seen.insert(def) {
            continue;
        }
        let operation = graph.op(def);
        if !operation.kind.is_pure() || operation.region.is_some() {
            return Err(rewriter.notify_match_failure(
                before,
                "cannot move operation with side effects or regions",
            ));
        }
        slice.push(def);
        worklist.extend(operation.operands.iter().copied());
    }
    slice.sort_by_key(|&op| graph.position(op).1);
    for op in slice {
        rewriter.move_op_before(op, before);
    }
    Ok(())
}

/// Reshapes an operand of `op` to the expanded loop nest. Scalars and
/// operands the expansion does not touch are returned as is.
fn expand_operand(
    rewriter: &mut Rewriter<'_>,
    op: OpId,
    index: usize,
    value: ValueId,
    info: &ExpansionInfo,
) -> FusionResult<ValueId> {
    let ty = rewriter.graph().value_type(value).clone();
    let Some(shape) = ty.shape().filter(|_| ty.is_tensor()).cloned() else {
        return Ok(value);
    };
    let ctx = rewriter.ctx();
    let map = rewriter.graph().matching_indexing_map(op, index).clone();
    let (expanded_shape, expanded_ty) = expanded_shape_and_type(&ctx, &ty, &map, info);
    let expanded = expanded_ty.shape().cloned().unwrap_or_default();
    if expanded == shape {
        return Ok(value);
    }
    let reassociation = reassociation_for_expansion(&ctx, &map, info);
    if let Err(reason) = reshape_like_shapes_are_compatible(&shape, &expanded, &reassociation) {
        return Err(rewriter.notify_match_failure(op, reason));
    }
    Ok(rewriter.expand_shape(expanded_ty, value, reassociation, &expanded_shape))
}

/// Expands `op` so that `reshape`, which feeds (or consumes) `operand`,
/// becomes a no-op. Returns one replacement per result of `op`, with the
/// original types.
pub fn fuse_with_reshape_by_expansion(
    rewriter: &mut Rewriter<'_>,
    op: OpId,
    reshape: OpId,
    operand: usize,
) -> FusionResult<Vec<ValueId>> {
    debug_assert!(
        is_fusable_with_reshape_by_dim_expansion(rewriter.graph(), op, operand),
        "preconditions for fuse operation failed"
    );
    let ctx = rewriter.ctx();
    let reshape_operands = rewriter.graph().op(reshape).operands.clone();
    let src = reshape_operands[0];
    let (expanded_shape, reassociation) = match rewriter.graph().kind(reshape).clone() {
        OpKind::ExpandShape { reassociation } => {
            // The dynamic output sizes must dominate the expanded op.
            move_value_definitions(rewriter, &reshape_operands[1..], op)?;
            let Some(shape) = rewriter.graph().mixed_output_shape(reshape) else {
                return Err(rewriter.notify_match_failure(reshape, "missing output size"));
            };
            (shape, reassociation)
        }
        OpKind::CollapseShape { reassociation } => {
            rewriter.set_insertion_point_before(op);
            (rewriter.mixed_sizes(src), reassociation)
        }
        _ => return Err(FusionError::NotApplicable),
    };

    let Some(info) =
        ExpansionInfo::compute(rewriter, op, operand, &reassociation, &expanded_shape)
    else {
        return Err(rewriter.notify_match_failure(op, "failed to compute expansion info"));
    };
    let maps = rewriter
        .graph()
        .indexing_maps(op)
        .iter()
        .map(|map| indexing_map_in_expanded_op(&ctx, map, &info))
        .collect::<Vec<_>>();

    rewriter.set_insertion_point_before(op);
    let operands = rewriter.graph().op(op).operands.clone();
    let num_inputs = rewriter.graph().num_inputs(op);
    let mut inputs = Vec::with_capacity(num_inputs);
    for (index, &value) in operands[..num_inputs].iter().enumerate() {
        if index == operand {
            inputs.push(src);
        } else {
            inputs.push(expand_operand(rewriter, op, index, value, &info)?);
        }
    }
    let mut outputs = Vec::with_capacity(operands.len() - num_inputs);
    for (index, &value) in operands.iter().enumerate().skip(num_inputs) {
        outputs.push(expand_operand(rewriter, op, index, value, &info)?);
    }

    let expanded = create_expanded_op(rewriter, op, &inputs, &outputs, maps, &info)?;

    let results = rewriter.graph().op(op).results.clone();
    let expanded_results = rewriter.graph().op(expanded).results.clone();
    let mut replacements = Vec::with_capacity(results.len());
    for (number, (&result, &expanded_result)) in results.iter().zip(&expanded_results).enumerate()
    {
        let original_ty = rewriter.graph().value_type(result).clone();
        if rewriter.graph().value_type(expanded_result).shape() == original_ty.shape() {
            replacements.push(expanded_result);
            continue;
        }
        let map = rewriter.graph().indexing_map_matching_result(op, number).clone();
        let reassociation = reassociation_for_expansion(&ctx, &map, &info);
        replacements.push(rewriter.collapse_shape_to(original_ty, expanded_result, reassociation));
    }
    Ok(replacements)
}

/// `op(collapse_shape(x))` -> `collapse_shape(expanded op(x))`.
#[derive(new)]
pub struct FoldWithProducerReshapeOpByExpansion {
    control: ControlFusionFn,
}

impl RewritePattern for FoldWithProducerReshapeOpByExpansion {
    fn name(&self) -> &'static str {
        "FoldWithProducerReshapeOpByExpansion"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        kind.structured().is_some()
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        for index in 0..graph.num_inputs(op) {
            let value = graph.op(op).operands[index];
            let Some(reshape) = graph
                .defining_op(value)
                .filter(|&p| matches!(graph.kind(p), OpKind::CollapseShape { .. }))
            else {
                continue;
            };
            if !is_fusable_with_reshape_by_dim_expansion(graph, op, index)
                || !(self.control)(graph, OpOperand::new(op, index))
            {
                continue;
            }
            let replacements = fuse_with_reshape_by_expansion(rewriter, op, reshape, index)?;
            rewriter.replace_op(op, &replacements);
            return Ok(());
        }
        Err(FusionError::NotApplicable)
    }
}

/// `expand_shape(op(x))` -> `expanded op(expand_shape(x))`.
#[derive(new)]
pub struct FoldReshapeWithGenericOpByExpansion {
    control: ControlFusionFn,
}

impl RewritePattern for FoldReshapeWithGenericOpByExpansion {
    fn name(&self) -> &'static str {
        "FoldReshapeWithGenericOpByExpansion"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        matches!(kind, OpKind::ExpandShape { .. })
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        let src = graph.op(op).operands[0];
        let (Some(producer), Some(result_number)) =
            (graph.defining_op(src), graph.result_number(src))
        else {
            return Err(rewriter.notify_match_failure(op, "source not produced by an operation"));
        };
        if !graph.is_structured(producer) {
            return Err(rewriter.notify_match_failure(op, "producer not a structured op"));
        }
        let init = graph.init_for_result(producer, result_number);
        if !is_fusable_with_reshape_by_dim_expansion(graph, producer, init) {
            return Err(rewriter.notify_match_failure(
                op,
                "failed preconditions of fusion with producer generic op",
            ));
        }
        if !(self.control)(graph, OpOperand::new(op, 0)) {
            return Err(rewriter.notify_match_failure(op, "fusion blocked by control function"));
        }

        let replacements = match fuse_with_reshape_by_expansion(rewriter, producer, op, init) {
            Ok(replacements) => replacements,
            Err(_) => return Err(rewriter.notify_match_failure(op, "fusion by expansion failed")),
        };
        // The replacement has the producer's original type; the reshape
        // wants the expanded value underneath it.
        let mut replacement = replacements[result_number];
        if let Some(collapse) = rewriter.graph().defining_op(replacement) {
            if matches!(rewriter.graph().kind(collapse), OpKind::CollapseShape { .. }) {
                replacement = rewriter.graph().op(collapse).operands[0];
            }
        }
        rewriter.replace_op(op, &[replacement]);
        rewriter.replace_op(producer, &replacements);
        Ok(())
    }
}

/// `pad(collapse_shape(x))` -> `collapse_shape(pad(x))` when every folded
/// group is left unpadded.
#[derive(new)]
pub struct FoldPadWithProducerReshapeOpByExpansion {
    control: ControlFusionFn,
}

impl RewritePattern for FoldPadWithProducerReshapeOpByExpansion {
    fn name(&self) -> &'static str {
        "FoldPadWithProducerReshapeOpByExpansion"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        matches!(kind, OpKind::Pad { .. })
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        let OpKind::Pad { low, high } = graph.kind(op).clone() else {
            return Err(FusionError::NotApplicable);
        };
        let (src, pad_value) = (graph.op(op).operands[0], graph.op(op).operands[1]);
        let Some(reshape) = graph.defining_op(src) else {
            return Err(FusionError::NotApplicable);
        };
        let OpKind::CollapseShape { reassociation } = graph.kind(reshape).clone() else {
            return Err(FusionError::NotApplicable);
        };
        if !graph.has_one_use(src) {
            return Err(FusionError::NotApplicable);
        }
        if !(self.control)(graph, OpOperand::new(op, 0)) {
            return Err(rewriter.notify_match_failure(op, "fusion blocked by control function"));
        }
        let folded_group_padded = reassociation
            .iter()
            .zip(low.iter().zip(&high))
            .any(|(group, (&l, &h))| group.len() != 1 && (l != 0 || h != 0));
        if folded_group_padded {
            return Err(FusionError::NotApplicable);
        }

        let mut new_low = RVec::new();
        let mut new_high = RVec::new();
        for (index, group) in reassociation.iter().enumerate() {
            for _ in group {
                new_low.push(low[index]);
                new_high.push(high[index]);
            }
        }
        let expanded_src = graph.op(reshape).operands[0];
        let result_ty = graph.value_type(graph.op(op).result(0)).clone();
        let padded = rewriter.pad(expanded_src, new_low, new_high, pad_value);
        let collapsed = rewriter.collapse_shape_to(result_ty, padded, reassociation);
        rewriter.replace_op(op, &[collapsed]);
        Ok(())
    }
}

/// `expand_shape(collapse_shape(x))` -> `collapse_shape(expand_shape(x))`
/// when, group by group, at most one of the two reshapes changes anything.
/// Moving the expansion next to `x` lets it fold into whatever produced `x`.
#[derive(Debug, Default)]
pub struct BubbleUpExpandThroughParallelCollapse;

impl RewritePattern for BubbleUpExpandThroughParallelCollapse {
    fn name(&self) -> &'static str {
        "BubbleUpExpandThroughParallelCollapse"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        matches!(kind, OpKind::ExpandShape { .. })
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        let Some(collapse) = graph.defining_op(graph.op(op).operands[0]) else {
            return Err(FusionError::NotApplicable);
        };
        let OpKind::ExpandShape { reassociation: expand_groups } = graph.kind(op) else {
            return Err(FusionError::NotApplicable);
        };
        let OpKind::CollapseShape { reassociation: collapse_groups } = graph.kind(collapse) else {
            return Err(FusionError::NotApplicable);
        };
        // A 0-d intermediate has no groups to pair up.
        if expand_groups.is_empty() || expand_groups.len() != collapse_groups.len() {
            return Err(FusionError::NotApplicable);
        }
        let src = graph.op(collapse).operands[0];
        let src_ty = graph.value_type(src).clone();
        let result_ty = graph.value_type(graph.op(op).result(0)).clone();
        let (Some(src_shape), Some(result_shape)) = (src_ty.shape(), result_ty.shape()) else {
            return Err(FusionError::NotApplicable);
        };

        let num_dynamic = |dims: &[DimSize]| dims.iter().filter(|d| d.is_dynamic()).count();
        for (collapse_group, expand_group) in collapse_groups.iter().zip(expand_groups) {
            if collapse_group.len() == expand_group.len() {
                // Same group size: the expansion must undo the collapse, which
                // is only decidable with at most one dynamic extent.
                let collapsed = &src_shape.dims()[collapse_group[0]..][..collapse_group.len()];
                let expanded = &result_shape.dims()[expand_group[0]..][..expand_group.len()];
                if num_dynamic(collapsed) > 1 || num_dynamic(expanded) > 1 || collapsed != expanded
                {
                    return Err(rewriter.notify_match_failure(op, "groups do not mirror each other"));
                }
            } else if collapse_group.len() != 1 && expand_group.len() != 1 {
                return Err(
                    rewriter.notify_match_failure(op, "a group is both collapsed and expanded")
                );
            }
        }
        let Some(result_sizes) = graph.mixed_output_shape(op) else {
            return Err(rewriter.notify_match_failure(op, "missing output size"));
        };
        let collapse_groups = collapse_groups.clone();
        let expand_groups = expand_groups.clone();

        // Both new reassociations index the dims of the intermediate tensor,
        // one per entry of `sizes`.
        let mut sizes: Vec<MixedSize> = vec![];
        let mut new_expand_groups: Vec<ReassociationIndices> = vec![];
        let mut new_collapse_groups: Vec<ReassociationIndices> = vec![];
        let (mut src_dim, mut result_dim) = (0, 0);
        for (collapse_group, expand_group) in collapse_groups.iter().zip(&expand_groups) {
            if collapse_group.len() == expand_group.len() {
                for _ in collapse_group {
                    new_expand_groups.push(rvec![sizes.len()]);
                    new_collapse_groups.push(rvec![sizes.len()]);
                    sizes.push(result_sizes[result_dim]);
                    src_dim += 1;
                    result_dim += 1;
                }
            } else if collapse_group.len() != 1 {
                let mut group = RVec::new();
                for _ in collapse_group {
                    new_expand_groups.push(rvec![sizes.len()]);
                    group.push(sizes.len());
                    sizes.push(rewriter.mixed_size(src, src_dim));
                    src_dim += 1;
                }
                new_collapse_groups.push(group);
                result_dim += 1;
            } else {
                let mut group = RVec::new();
                for _ in expand_group {
                    new_collapse_groups.push(rvec![sizes.len()]);
                    group.push(sizes.len());
                    sizes.push(result_sizes[result_dim]);
                    result_dim += 1;
                }
                new_expand_groups.push(group);
                src_dim += 1;
            }
        }

        let mut replacement = src;
        if new_expand_groups.len() != sizes.len() {
            let shape = sizes.iter().map(|s| s.to_dim_size()).collect::<Shape>();
            replacement =
                rewriter.expand_shape(src_ty.with_shape(shape), src, new_expand_groups, &sizes);
        }
        if new_collapse_groups.len() != sizes.len() {
            replacement = rewriter.collapse_shape_to(result_ty, replacement, new_collapse_groups);
        }
        rewriter.replace_op(op, &[replacement]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;
    use crate::interp::{self, HostValue};
    use crate::{apply_patterns_greedily, ElemType, GreedyRewriteConfig, PatternSet, Rewriter};

    /// `expand_shape(collapse_shape(x))` returning the expansion.
    fn collapse_then_expand(
        src: &[usize],
        collapse: Vec<ReassociationIndices>,
        expanded: &[usize],
        expand: Vec<ReassociationIndices>,
    ) -> (Graph, ValueId) {
        let mut graph = Graph::new();
        let body = graph.body();
        let x = graph.add_argument(body, Type::tensor(src, ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        let collapsed = rewriter.collapse_shape(x, collapse);
        let sizes = expanded
            .iter()
            .map(|&s| MixedSize::Static(s as i64))
            .collect::<Vec<_>>();
        let result =
            rewriter.expand_shape(Type::tensor(expanded, ElemType::F32), collapsed, expand, &sizes);
        rewriter.ret(vec![result]);
        (graph, x)
    }

    fn bubble_up(graph: &mut Graph) -> usize {
        let mut set = PatternSet::new();
        set.add(BubbleUpExpandThroughParallelCollapse);
        apply_patterns_greedily(graph, &set, &GreedyRewriteConfig::default()).rewrites
    }

    #[test]
    fn expansion_info_splits_fused_loops() {
        let mut graph = Graph::new();
        let body = graph.body();
        let arg = graph.add_argument(body, Type::tensor([32, 5], ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        let init = rewriter.empty(&[MixedSize::Static(32), MixedSize::Static(5)], ElemType::F32);
        let op = rewriter.copy(arg, init);
        let reassociation: Vec<ReassociationIndices> = vec![rvec![0, 1], rvec![2]];
        let shape = [MixedSize::Static(4), MixedSize::Static(8), MixedSize::Static(5)];
        let info = ExpansionInfo::compute(&mut rewriter, op, 0, &reassociation, &shape).unwrap();

        assert_eq!(info.orig_op_num_dims(), 2);
        assert_eq!(info.expanded_op_num_dims(), 3);
        assert_eq!(info.expanded_dims(0), &[0, 1]);
        assert_eq!(info.expanded_dims(1), &[2]);
        assert_eq!(
            info.expanded_shape_of_dim(0),
            &[MixedSize::Static(4), MixedSize::Static(8)]
        );
        assert_eq!(info.original_shape()[1], MixedSize::Static(5));
    }

    #[test]
    fn value_definitions_move_in_order() {
        let mut graph = Graph::new();
        let mut rewriter = Rewriter::new(&mut graph);
        let anchor = rewriter.opaque("anchor", vec![], vec![]);
        let a = rewriter.constant_index(3);
        let b = rewriter.constant_index(4);
        let sum = rewriter.add(a, b);
        move_value_definitions(&mut rewriter, &[sum], anchor).unwrap();

        let graph = rewriter.graph();
        let order = graph.block(graph.body()).ops.clone();
        assert_eq!(order.last(), Some(&anchor));
        let defs = [a, b, sum].map(|v| graph.defining_op(v).unwrap());
        assert_eq!(&order[..3], &defs);
    }

    #[test]
    fn impure_definitions_do_not_move() {
        let mut graph = Graph::new();
        let mut rewriter = Rewriter::new(&mut graph);
        let anchor = rewriter.opaque("anchor", vec![], vec![]);
        let opaque = rewriter.opaque("size", vec![], vec![Type::index()]);
        let size = rewriter.graph().op(opaque).result(0);
        assert!(move_value_definitions(&mut rewriter, &[size], anchor).is_err());
    }

    #[test]
    fn expansion_bubbles_above_a_parallel_collapse() {
        let (mut graph, x) = collapse_then_expand(
            &[2, 3, 10],
            vec![rvec![0, 1], rvec![2]],
            &[6, 2, 5],
            vec![rvec![0], rvec![1, 2]],
        );
        let before = graph.clone();
        assert_eq!(bubble_up(&mut graph), 1);
        graph.verify().unwrap();

        let collapse = graph.defining_op(graph.returned_values()[0]).unwrap();
        let OpKind::CollapseShape { reassociation } = graph.kind(collapse) else {
            panic!("expected a collapse_shape, found {}", graph.op(collapse).name());
        };
        let expected: Vec<ReassociationIndices> = vec![rvec![0, 1], rvec![2], rvec![3]];
        assert_eq!(reassociation, &expected);
        let expand = graph.defining_op(graph.op(collapse).operands[0]).unwrap();
        assert_eq!(graph.kind(expand).reassociation().unwrap().len(), 3);
        assert_eq!(graph.op(expand).operands[0], x);
        assert_eq!(
            graph.value_type(graph.op(expand).result(0)),
            &Type::tensor([2, 3, 2, 5], ElemType::F32)
        );

        let input: HostValue = ArrayD::from_shape_fn(IxDyn(&[2, 3, 10]), |idx| {
            (idx[0] * 30 + idx[1] * 10 + idx[2]) as f64
        })
        .into();
        let expected = interp::evaluate(&before, &[input.clone()]).unwrap();
        let actual = interp::evaluate(&graph, &[input]).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn regrouped_dims_do_not_bubble() {
        // 4x6 -> 24 -> 2x12 changes the same group twice.
        let (mut graph, _) =
            collapse_then_expand(&[4, 6], vec![rvec![0, 1]], &[2, 12], vec![rvec![0, 1]]);
        assert_eq!(bubble_up(&mut graph), 0);

        let (mut graph, _) = collapse_then_expand(
            &[4, 6, 3],
            vec![rvec![0, 1, 2]],
            &[8, 9],
            vec![rvec![0, 1]],
        );
        assert_eq!(bubble_up(&mut graph), 0);
    }
}
