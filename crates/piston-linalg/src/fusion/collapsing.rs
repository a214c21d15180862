//! Collapsing contiguous loops of a structured op into one.
//!
//! This is the inverse of expansion: an `expand_shape` feeding a generic op
//! (or a `collapse_shape` of its result) can be folded away by merging the
//! loops the reshape splits, when every indexing map reads those loops as
//! one contiguous, in-order run.

use derive_new::new;

use crate::{
    invert_permutation_vector, is_guaranteed_collapsible, AffineContext, AffineExpr, AffineMap,
    ArithOp, BlockId, ControlFusionFn, FusionError, FusionResult, GetCollapsableDimensionsFn,
    Graph, HashMap, HashSet, IrMapping, IteratorType, MixedSize, OpId, OpKind, OpOperand, RVec,
    ReassociationIndices, RewritePattern, Rewriter, ValueId,
};

/// The loops read by the results of `map` at `range_reassociation`.
fn get_domain_reassociation(
    ctx: &AffineContext,
    map: &AffineMap,
    range_reassociation: &[usize],
) -> ReassociationIndices {
    debug_assert!(
        map.is_projected_permutation(ctx),
        "expected projected permutation"
    );
    range_reassociation
        .iter()
        .filter_map(|&pos| ctx.as_dim(map.result(pos)))
        .collect()
}

/// Whether `dims` appears in the results of `map` as one contiguous run in
/// the same order. A map that reads none of `dims` preserves the sequence
/// trivially.
pub fn is_dim_sequence_preserved(ctx: &AffineContext, map: &AffineMap, dims: &[usize]) -> bool {
    debug_assert!(
        !dims.is_empty(),
        "expected non-empty list for dimension sequence"
    );
    debug_assert!(
        map.is_projected_permutation(ctx),
        "expected indexing map to be projected permutation"
    );
    let Some(&start) = dims.first() else {
        return true;
    };
    let elements = dims.iter().copied().collect::<HashSet<_>>();
    for (index, &expr) in map.results().iter().enumerate() {
        let Some(dim) = ctx.as_dim(expr) else {
            return false;
        };
        if dim == start {
            if index + dims.len() > map.num_results() {
                return false;
            }
            return dims
                .iter()
                .enumerate()
                .all(|(offset, &d)| ctx.as_dim(map.result(index + offset)) == Some(d));
        }
        // A later element showing up before the start breaks the run.
        if elements.contains(&dim) {
            return false;
        }
    }
    true
}

pub fn are_dim_sequences_preserved(
    ctx: &AffineContext,
    maps: &[AffineMap],
    sequences: &[ReassociationIndices],
) -> bool {
    maps.iter().all(|map| {
        sequences
            .iter()
            .all(|sequence| is_dim_sequence_preserved(ctx, map, sequence))
    })
}

/// Loop groups of `op` that can be collapsed so that the reshape described
/// by `reassociation` on `operand` becomes a no-op. Empty when nothing can
/// be collapsed.
///
/// Folded loops must share an iterator type. Folded reductions must also
/// be contiguous and in order within the op's reduction loops, even though
/// associative reductions would not strictly need it.
pub fn get_collapsable_iteration_space_dims(
    graph: &Graph,
    op: OpId,
    operand: usize,
    reassociation: &[ReassociationIndices],
) -> Vec<ReassociationIndices> {
    let ctx = graph.ctx();
    let Some(attrs) = graph.structured(op) else {
        return vec![];
    };
    if !graph.has_pure_tensor_semantics(op)
        || !attrs
            .indexing_maps
            .iter()
            .all(|map| map.is_projected_permutation(ctx))
    {
        return vec![];
    }

    let reduction_dims = attrs.reduction_dims();
    let iterator_types = &attrs.iterator_types;
    let map = &attrs.indexing_maps[operand];
    let mut processed = HashSet::default();
    let mut collapsable = Vec::new();
    for folded_range_dims in reassociation {
        if folded_range_dims.len() == 1 {
            continue;
        }
        let folded = get_domain_reassociation(ctx, map, folded_range_dims);
        let Some(&first) = folded.first() else {
            continue;
        };
        if folded.iter().any(|d| processed.contains(d)) {
            continue;
        }
        let start_type = iterator_types[first];
        if folded.iter().any(|&d| iterator_types[d] != start_type) {
            continue;
        }

        if start_type.is_reduction() {
            let contiguous = reduction_dims
                .iter()
                .position(|&d| d == first)
                .is_some_and(|start| {
                    reduction_dims
                        .get(start..start + folded.len())
                        .is_some_and(|window| window == folded.as_slice())
                });
            if !contiguous {
                continue;
            }
        }

        if !attrs
            .indexing_maps
            .iter()
            .all(|m| is_dim_sequence_preserved(ctx, m, &folded))
        {
            continue;
        }
        processed.extend(folded.iter().copied());
        collapsable.push(folded);
    }
    collapsable
}

/// Bidirectional mapping between the loops of an op and the loops of its
/// collapsed form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollapsingInfo {
    collapsed_to_orig: Vec<ReassociationIndices>,
    /// Original loop -> (collapsed loop, position within its group).
    orig_to_collapsed: Vec<(usize, usize)>,
}

impl CollapsingInfo {
    /// `None` if a folded dim is out of range or folded twice.
    pub fn initialize(orig_num_loops: usize, folded: &[ReassociationIndices]) -> Option<Self> {
        let mut processed = HashSet::default();
        let mut collapsed_to_orig = Vec::new();
        for group in folded.iter().filter(|g| !g.is_empty()) {
            for &dim in group {
                if dim >= orig_num_loops || !processed.insert(dim) {
                    return None;
                }
            }
            collapsed_to_orig.push(group.clone());
        }
        for dim in 0..orig_num_loops {
            if !processed.contains(&dim) {
                collapsed_to_orig.push(rvec![dim]);
            }
        }
        collapsed_to_orig.sort_by_key(|group| group[0]);

        let mut orig_to_collapsed = vec![(0, 0); orig_num_loops];
        for (collapsed, group) in collapsed_to_orig.iter().enumerate() {
            for (position, &dim) in group.iter().enumerate() {
                orig_to_collapsed[dim] = (collapsed, position);
            }
        }
        Some(Self {
            collapsed_to_orig,
            orig_to_collapsed,
        })
    }

    pub fn collapsed_op_to_orig_op_mapping(&self) -> &[ReassociationIndices] {
        &self.collapsed_to_orig
    }

    pub fn orig_op_to_collapsed_op_mapping(&self) -> &[(usize, usize)] {
        &self.orig_to_collapsed
    }

    pub fn collapsed_op_iteration_rank(&self) -> usize {
        self.collapsed_to_orig.len()
    }
}

fn collapsed_iterator_types(
    iterator_types: &[IteratorType],
    info: &CollapsingInfo,
) -> RVec<IteratorType> {
    info.collapsed_op_to_orig_op_mapping()
        .iter()
        .map(|group| iterator_types[group[0]])
        .collect()
}

/// Each folded run of results becomes one result naming its collapsed loop.
fn collapsed_indexing_map(ctx: &AffineContext, map: &AffineMap, info: &CollapsingInfo) -> AffineMap {
    let orig_to_collapsed = info.orig_op_to_collapsed_op_mapping();
    let results = map
        .results()
        .iter()
        .filter_map(|&expr| ctx.as_dim(expr))
        .filter(|&dim| orig_to_collapsed[dim].1 == 0)
        .map(|dim| ctx.dim(orig_to_collapsed[dim].0))
        .collect::<RVec<AffineExpr>>();
    AffineMap::new(info.collapsed_op_iteration_rank(), 0, results)
}

/// Reassociation collapsing an operand indexed by `map`.
fn operand_reassociation(
    ctx: &AffineContext,
    map: &AffineMap,
    info: &CollapsingInfo,
) -> Vec<ReassociationIndices> {
    let orig_to_collapsed = info.orig_op_to_collapsed_op_mapping();
    let collapsed_to_orig = info.collapsed_op_to_orig_op_mapping();
    let mut reassociation = Vec::new();
    let mut counter = 0;
    while counter < map.num_results() {
        let Some(dim) = ctx.as_dim(map.result(counter)) else {
            break;
        };
        let (collapsed, position) = orig_to_collapsed[dim];
        let num_folded = collapsed_to_orig[collapsed].len();
        if position == 0 {
            reassociation.push((counter..counter + num_folded).collect());
        }
        counter += num_folded;
    }
    reassociation
}

fn collapsed_operand(
    rewriter: &mut Rewriter<'_>,
    op: OpId,
    index: usize,
    info: &CollapsingInfo,
) -> ValueId {
    let ctx = rewriter.ctx();
    let map = rewriter.graph().matching_indexing_map(op, index).clone();
    let operand = rewriter.graph().op(op).operands[index];
    let reassociation = operand_reassociation(&ctx, &map, info);
    if reassociation.len() == map.num_results() {
        return operand;
    }
    rewriter.collapse_shape(operand, reassociation)
}

/// Builds the collapsed form of `op` at the insertion point. Generic ops get
/// a clone of their payload, so the original stays intact until replaced.
fn clone_to_collapsed_op(
    rewriter: &mut Rewriter<'_>,
    op: OpId,
    info: &CollapsingInfo,
) -> FusionResult<OpId> {
    let ctx = rewriter.ctx();
    let num_operands = rewriter.graph().op(op).operands.len();
    let num_inputs = rewriter.graph().num_inputs(op);
    let operands = (0..num_operands)
        .map(|index| collapsed_operand(rewriter, op, index, info))
        .collect::<Vec<_>>();
    let (inputs, outputs) = operands.split_at(num_inputs);

    match rewriter.graph().kind(op).clone() {
        OpKind::Generic(attrs) => {
            let maps = attrs
                .indexing_maps
                .iter()
                .map(|map| collapsed_indexing_map(&ctx, map, info))
                .collect();
            let iterator_types = collapsed_iterator_types(&attrs.iterator_types, info);
            let Some(body) = rewriter.graph().body_block(op) else {
                return Err(rewriter.notify_match_failure(op, "generic op without a payload"));
            };
            let (collapsed, block) =
                rewriter.generic_without_body(inputs, outputs, maps, iterator_types);
            rewriter.clone_block_into(body, block, &mut IrMapping::new());
            Ok(collapsed)
        }
        OpKind::Copy(_) => Ok(rewriter.copy(inputs[0], outputs[0])),
        OpKind::Fill(_) => Ok(rewriter.fill(inputs[0], outputs[0])),
        OpKind::Transpose { attrs, .. } => {
            let input_map = collapsed_indexing_map(&ctx, &attrs.indexing_maps[0], info);
            let inverse = input_map
                .results()
                .iter()
                .filter_map(|&e| ctx.as_dim(e))
                .collect::<Vec<_>>();
            Ok(rewriter.transpose(inputs[0], outputs[0], invert_permutation_vector(&inverse)))
        }
        _ => Err(FusionError::NotApplicable),
    }
}

/// Rewrites the `index` reads of the collapsed payload in terms of the
/// collapsed loops: for a group `[i0, i1, i2]` folded into `f`,
/// `i2 = f % d2`, `i1 = (f / d2) % d1`, `i0 = f / (d1 * d2)`.
fn generate_collapsed_indexing_region(
    rewriter: &mut Rewriter<'_>,
    block: BlockId,
    info: &CollapsingInfo,
    loop_range: &[MixedSize],
) {
    let index_ops = rewriter
        .graph()
        .block(block)
        .ops
        .iter()
        .copied()
        .filter(|&op| matches!(rewriter.graph().kind(op), OpKind::Index { .. }))
        .collect::<Vec<_>>();

    let saved = rewriter.insertion_point();
    rewriter.set_insertion_point_to_start(block);
    let mut replacements = HashMap::default();
    for (collapsed, group) in info.collapsed_op_to_orig_op_mapping().iter().enumerate() {
        let mut index = rewriter.index(collapsed);
        for &dim in group[1..].iter().rev() {
            let extent = rewriter.materialize(loop_range[dim]);
            replacements.insert(dim, rewriter.arith(ArithOp::RemSI, index, extent));
            index = rewriter.arith(ArithOp::DivSI, index, extent);
        }
        replacements.insert(group[0], index);
    }
    rewriter.set_insertion_point(saved);

    for op in index_ops {
        let OpKind::Index { dim } = *rewriter.graph().kind(op) else {
            continue;
        };
        if let Some(&replacement) = replacements.get(&dim) {
            let old = rewriter.graph().op(op).result(0);
            rewriter.replace_all_uses_with(old, replacement);
            rewriter.erase_op(op);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollapseResult {
    /// One value per result of the original op, with the original type.
    pub results: Vec<ValueId>,
    pub collapsed_op: OpId,
}

/// Collapses the loop groups `folded` of `op` into single loops, creating
/// the collapsed op at the insertion point. Results whose rank shrank are
/// expanded back.
pub fn collapse_op_iteration_dims(
    rewriter: &mut Rewriter<'_>,
    op: OpId,
    folded: &[ReassociationIndices],
) -> FusionResult<CollapseResult> {
    let ctx = rewriter.ctx();
    let graph = rewriter.graph();
    let num_loops = graph.num_loops(op);
    if num_loops <= 1 || folded.is_empty() || folded.iter().all(|group| group.len() <= 1) {
        return Err(FusionError::NotApplicable);
    }
    let Some(info) = CollapsingInfo::initialize(num_loops, folded) else {
        return Err(rewriter.notify_match_failure(op, "illegal to collapse specified dimensions"));
    };

    if graph.has_pure_buffer_semantics(op) {
        let collapsible = graph
            .op(op)
            .operands
            .iter()
            .zip(graph.indexing_maps(op))
            .all(|(&operand, map)| match graph.value_type(operand).as_buffer() {
                Some(buffer) => {
                    is_guaranteed_collapsible(buffer, &operand_reassociation(&ctx, map, &info))
                }
                None => true,
            });
        if !collapsible {
            return Err(rewriter.notify_match_failure(op, "memref is not guaranteed collapsible"));
        }
    }

    let Some(loop_ranges) = rewriter.create_loop_ranges(op) else {
        return Err(rewriter.notify_match_failure(op, "failed to compute loop ranges"));
    };
    if !loop_ranges.iter().all(|range| range.is_canonical()) {
        return Err(rewriter.notify_match_failure(
            op,
            "expected all loop ranges to have zero start and unit stride",
        ));
    }
    let loop_bound = loop_ranges.iter().map(|range| range.size).collect::<Vec<_>>();

    let collapsed_op = clone_to_collapsed_op(rewriter, op, &info)?;
    if rewriter.graph().has_index_semantics(collapsed_op) {
        if let Some(block) = rewriter.graph().body_block(collapsed_op) {
            generate_collapsed_indexing_region(rewriter, block, &info, &loop_bound);
        }
    }

    let original_results = rewriter.graph().op(op).results.clone();
    let collapsed_results = rewriter.graph().op(collapsed_op).results.clone();
    let mut results = Vec::with_capacity(original_results.len());
    for (number, (&original, &collapsed)) in
        original_results.iter().zip(&collapsed_results).enumerate()
    {
        let original_ty = rewriter.graph().value_type(original).clone();
        if rewriter.graph().value_type(collapsed).rank() == original_ty.rank() {
            results.push(collapsed);
            continue;
        }
        let map = rewriter.graph().indexing_map_matching_result(op, number).clone();
        debug_assert!(
            map.is_projected_permutation(&ctx),
            "expected indexing map to be a projected permutation for collapsing"
        );
        let reassociation = operand_reassociation(&ctx, &map, &info);
        let shape = map.apply_permutation(&ctx, &loop_bound);
        results.push(rewriter.expand_shape(original_ty, collapsed, reassociation, &shape));
    }
    Ok(CollapseResult {
        results,
        collapsed_op,
    })
}

/// `generic(expand_shape(x))` -> `expand_shape(collapsed generic(x))`.
#[derive(new)]
pub struct FoldWithProducerReshapeOpByCollapsing {
    control: ControlFusionFn,
}

impl RewritePattern for FoldWithProducerReshapeOpByCollapsing {
    fn name(&self) -> &'static str {
        "FoldWithProducerReshapeOpByCollapsing"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        kind.is_generic()
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        for index in 0..rewriter.graph().op(op).operands.len() {
            let graph = rewriter.graph();
            let value = graph.op(op).operands[index];
            let Some(reassociation) = graph
                .defining_op(value)
                .filter(|&p| matches!(graph.kind(p), OpKind::ExpandShape { .. }))
                .and_then(|p| graph.kind(p).reassociation())
                .map(<[_]>::to_vec)
            else {
                continue;
            };
            let dims = get_collapsable_iteration_space_dims(graph, op, index, &reassociation);
            if dims.is_empty() || !(self.control)(graph, OpOperand::new(op, index)) {
                continue;
            }
            let collapsed = match collapse_op_iteration_dims(rewriter, op, &dims) {
                Ok(collapsed) => collapsed,
                Err(_) => {
                    return Err(rewriter.notify_match_failure(
                        op,
                        "failed to do the fusion by collapsing transformation",
                    ))
                }
            };
            rewriter.replace_op(op, &collapsed.results);
            return Ok(());
        }
        Err(FusionError::NotApplicable)
    }
}

/// `collapse_shape(generic(x))` -> `collapse_shape(expand_shape(collapsed
/// generic))`, leaving the reshape pair to cancel out.
#[derive(new)]
pub struct FoldReshapeWithGenericOpByCollapsing {
    control: ControlFusionFn,
}

impl RewritePattern for FoldReshapeWithGenericOpByCollapsing {
    fn name(&self) -> &'static str {
        "FoldReshapeWithGenericOpByCollapsing"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        matches!(kind, OpKind::CollapseShape { .. })
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        let src = graph.op(op).operands[0];
        let (Some(producer), Some(result_number)) =
            (graph.defining_op(src), graph.result_number(src))
        else {
            return Err(rewriter.notify_match_failure(op, "source not produced by an operation"));
        };
        if !graph.is_generic(producer) {
            return Err(rewriter.notify_match_failure(op, "producer not a generic op"));
        }
        let reassociation = graph.kind(op).reassociation().unwrap_or_default().to_vec();
        let init = graph.init_for_result(producer, result_number);
        let dims = get_collapsable_iteration_space_dims(graph, producer, init, &reassociation);
        if dims.is_empty() {
            return Err(rewriter.notify_match_failure(
                op,
                "failed preconditions of fusion with producer generic op",
            ));
        }
        if !(self.control)(graph, OpOperand::new(op, 0)) {
            return Err(rewriter.notify_match_failure(op, "fusion blocked by control function"));
        }

        // Other users of the producer may sit between it and the reshape.
        rewriter.set_insertion_point_after(producer);
        let collapsed = match collapse_op_iteration_dims(rewriter, producer, &dims) {
            Ok(collapsed) => collapsed,
            Err(_) => {
                return Err(rewriter.notify_match_failure(
                    producer,
                    "failed to do the fusion by collapsing transformation",
                ))
            }
        };
        rewriter.replace_op(producer, &collapsed.results);
        Ok(())
    }
}

/// `pad(expand_shape(x))` -> `expand_shape(pad(x))` when every split group
/// is left unpadded.
#[derive(new)]
pub struct FoldPadWithProducerReshapeOpByCollapsing {
    control: ControlFusionFn,
}

impl RewritePattern for FoldPadWithProducerReshapeOpByCollapsing {
    fn name(&self) -> &'static str {
        "FoldPadWithProducerReshapeOpByCollapsing"
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
        let OpKind::ExpandShape { reassociation } = graph.kind(reshape).clone() else {
            return Err(FusionError::NotApplicable);
        };
        if !graph.has_one_use(src) {
            return Err(FusionError::NotApplicable);
        }
        if !(self.control)(graph, OpOperand::new(op, 0)) {
            return Err(rewriter.notify_match_failure(op, "fusion blocked by control function"));
        }
        let split_group_padded = reassociation.iter().any(|group| {
            group.len() != 1 && group.iter().any(|&d| low[d] != 0 || high[d] != 0)
        });
        if split_group_padded {
            return Err(FusionError::NotApplicable);
        }
        let Some(mut expanded_sizes) = graph.mixed_output_shape(reshape) else {
            return Err(FusionError::NotApplicable);
        };
        let collapsed_src = graph.op(reshape).operands[0];
        let result_ty = graph.value_type(graph.op(op).result(0)).clone();

        let mut new_low = RVec::new();
        let mut new_high = RVec::new();
        for group in &reassociation {
            let (l, h) = (low[group[0]], high[group[0]]);
            if group.len() == 1 && l + h > 0 {
                let d = group[0];
                expanded_sizes[d] = match expanded_sizes[d] {
                    MixedSize::Static(s) => MixedSize::Static(s + (l + h) as i64),
                    MixedSize::Value(v) => {
                        let padding = rewriter.constant_index((l + h) as i64);
                        MixedSize::Value(rewriter.add(v, padding))
                    }
                };
            }
            new_low.push(l);
            new_high.push(h);
        }
        let padded = rewriter.pad(collapsed_src, new_low, new_high, pad_value);
        let expanded = rewriter.expand_shape(result_ty, padded, reassociation, &expanded_sizes);
        rewriter.replace_op(op, &[expanded]);
        Ok(())
    }
}

/// Collapses the loops a caller-provided function picks, for generic and
/// copy ops.
#[derive(new)]
pub struct CollapseLinalgDimensions {
    control: GetCollapsableDimensionsFn,
}

impl RewritePattern for CollapseLinalgDimensions {
    fn name(&self) -> &'static str {
        "CollapseLinalgDimensions"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        matches!(kind, OpKind::Generic(_) | OpKind::Copy(_))
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let graph = rewriter.graph();
        let dims = (self.control)(graph, op);
        if dims.is_empty() {
            return Err(FusionError::NotApplicable);
        }
        let ctx = graph.ctx();
        let maps = graph.indexing_maps(op);
        if !maps.iter().all(|map| map.is_projected_permutation(ctx))
            || dims.iter().any(|group| group.is_empty())
            || !are_dim_sequences_preserved(ctx, maps, &dims)
        {
            return Err(rewriter.notify_match_failure(op, "specified dimensions cannot be collapsed"));
        }
        let collapsed = match collapse_op_iteration_dims(rewriter, op, &dims) {
            Ok(collapsed) => collapsed,
            Err(_) => return Err(rewriter.notify_match_failure(op, "failed to collapse dimensions")),
        };
        rewriter.replace_op(op, &collapsed.results);
        Ok(())
    }
}
