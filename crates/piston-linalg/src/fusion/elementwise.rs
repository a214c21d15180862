//! Producer/consumer fusion of elementwise generic ops.
//!
//! A generic op whose input is produced by an all-parallel generic op on
//! tensors can absorb that producer: the fused op iterates the consumer's
//! loops, reads the producer's inputs directly, and evaluates the producer's
//! payload inline before the consumer's.

use std::collections::BTreeSet;

use derive_new::new;

use crate::{
    concat_affine_maps, inverse_permutation, AffineContext, AffineMap, BlockId, ControlFusionFn,
    FusionError, FusionResult, Graph, IrMapping, IteratorType, OpId, OpKind, OpOperand, RVec,
    RewritePattern, Rewriter, ValueId,
};

/// Map from the fused (consumer) loops to the indices of a producer operand.
///
/// `arg_map` goes producer loops -> operand dims, the inverse of the
/// producer's result map goes result dims -> producer loops, and
/// `consumer_map` goes consumer loops -> result dims.
fn producer_operand_map_in_fused_op(
    ctx: &AffineContext,
    arg_map: &AffineMap,
    producer_result_map: &AffineMap,
    consumer_map: &AffineMap,
) -> Option<AffineMap> {
    let inverse = inverse_permutation(ctx, producer_result_map)?;
    Some(arg_map.compose(ctx, &inverse).compose(ctx, consumer_map))
}

/// Whether the producer of `fused` can be fused into its consumer.
pub fn are_elementwise_ops_fusable(graph: &Graph, fused: OpOperand) -> bool {
    let Some(consumer_op) = graph.try_op(fused.op) else {
        return false;
    };
    let Some(&value) = consumer_op.operands.get(fused.index) else {
        return false;
    };
    let Some(producer) = graph.defining_op(value) else {
        return false;
    };
    let consumer = fused.op;
    if !graph.is_generic(producer) || !graph.is_generic(consumer) {
        return false;
    }

    // The consumer may mix tensors and buffers; the producer may not.
    if !graph.has_pure_tensor_semantics(producer) || !graph.value_type(value).is_tensor() {
        return false;
    }
    if !graph.iterator_types(producer).iter().all(|it| it.is_parallel()) {
        return false;
    }
    if !graph.is_dps_input(consumer, fused.index) {
        return false;
    }

    let ctx = graph.ctx();
    let consumer_map = graph.matching_indexing_map(consumer, fused.index);
    if consumer_map.num_results() != graph.num_loops(producer) {
        return false;
    }
    let Some(result_number) = graph.result_number(value) else {
        return false;
    };
    let producer_result_map = graph.indexing_map_matching_result(producer, result_number);
    if !producer_result_map.is_permutation(ctx) {
        return false;
    }

    // Without reductions the inits still bound every loop. With them, each
    // consumer loop must stay covered by some operand of the fused op.
    if graph.iterator_types(consumer).iter().all(|it| it.is_parallel()) {
        return true;
    }
    let mut covered = vec![false; graph.num_loops(consumer)];
    let mut cover = |map: &AffineMap| {
        for &expr in map.results() {
            if let Some(d) = ctx.as_dim(expr) {
                covered[d] = true;
            }
        }
    };
    for (&operand, map) in consumer_op
        .operands
        .iter()
        .zip(graph.indexing_maps(consumer))
    {
        if operand != value {
            cover(map);
        }
    }
    for input in 0..graph.num_inputs(producer) {
        let arg_map = graph.matching_indexing_map(producer, input);
        match producer_operand_map_in_fused_op(ctx, arg_map, producer_result_map, consumer_map) {
            Some(map) => cover(&map),
            None => return false,
        }
    }
    covered.into_iter().all(|c| c)
}

/// True if the operands of `producer` and `consumer` left after dropping
/// `ignored` still determine every loop bound.
fn can_drop_operands(graph: &Graph, producer: OpId, consumer: OpId, ignored: &[OpOperand]) -> bool {
    let mut maps = Vec::new();
    for op in [producer, consumer] {
        for (index, map) in graph.indexing_maps(op).iter().enumerate() {
            if !ignored.contains(&OpOperand::new(op, index)) {
                maps.push(map.clone());
            }
        }
    }
    if maps.is_empty() {
        return graph.num_loops(producer) == 0 && graph.num_loops(consumer) == 0;
    }
    concat_affine_maps(&maps)
        .and_then(|concat| inverse_permutation(graph.ctx(), &concat))
        .is_some()
}

/// Indices of the producer results the fused op must still produce.
///
/// A result is kept when the producer's payload reads its init, when
/// dropping its init would leave some loop unbounded, or when something
/// other than the consumer uses it.
pub fn get_preserved_producer_results(
    graph: &Graph,
    producer: OpId,
    consumer: OpId,
    fused: OpOperand,
) -> BTreeSet<usize> {
    let mut preserved = BTreeSet::new();
    let mut ignored = vec![fused];
    for (index, &result) in graph.op(producer).results.iter().enumerate() {
        let init = graph.init_for_result(producer, index);
        ignored.push(OpOperand::new(producer, init));
        let used_elsewhere = graph.users(result).iter().any(|u| u.op != consumer);
        if graph.payload_uses_value_from_operand(producer, init)
            || !can_drop_operands(graph, producer, consumer, &ignored)
            || used_elsewhere
        {
            preserved.insert(index);
            ignored.pop();
        }
    }
    preserved
}

#[derive(Debug, Clone)]
pub struct ElementwiseOpFusionResult {
    pub fused_op: OpId,
    /// Original value -> fused-op result, for every preserved producer result
    /// and every consumer result.
    pub replacements: Vec<(ValueId, ValueId)>,
}

/// Everything about the producer/consumer pair the region builder needs,
/// gathered up front so the graph can be mutated freely afterwards.
struct FusionSite {
    producer: OpId,
    consumer: OpId,
    fused_index: usize,
    result_number: usize,
    producer_block: BlockId,
    consumer_block: BlockId,
    consumer_to_producer_loops: AffineMap,
    preserved: BTreeSet<usize>,
}

/// Fuses the producer of `fused` into its consumer, creating the fused op
/// before the consumer. Neither original op is modified.
pub fn fuse_elementwise_ops(
    rewriter: &mut Rewriter<'_>,
    fused: OpOperand,
) -> FusionResult<ElementwiseOpFusionResult> {
    debug_assert!(
        are_elementwise_ops_fusable(rewriter.graph(), fused),
        "expected elementwise operation pre-conditions to pass"
    );
    let ctx = rewriter.ctx();
    let graph = rewriter.graph();
    let consumer = fused.op;
    let producer_result = graph.op(consumer).operands[fused.index];
    let (Some(producer), Some(result_number)) = (
        graph.defining_op(producer_result),
        graph.result_number(producer_result),
    ) else {
        return Err(FusionError::NotApplicable);
    };
    let preserved = get_preserved_producer_results(graph, producer, consumer, fused);

    let consumer_map = graph.matching_indexing_map(consumer, fused.index).clone();
    let producer_result_map = graph
        .indexing_map_matching_result(producer, result_number)
        .clone();
    let Some(inverse_result_map) = inverse_permutation(&ctx, &producer_result_map) else {
        return Err(rewriter.notify_match_failure(consumer, "producer result map is not invertible"));
    };
    let in_fused_op = |arg_map: &AffineMap| {
        arg_map
            .compose(&ctx, &inverse_result_map)
            .compose(&ctx, &consumer_map)
    };

    let consumer_inputs = graph.inputs(consumer).to_vec();
    let consumer_maps = graph.indexing_maps(consumer).to_vec();
    let num_consumer_inputs = consumer_inputs.len();

    let mut inputs = Vec::new();
    let mut maps = Vec::new();
    for (index, &input) in consumer_inputs.iter().enumerate().take(fused.index) {
        inputs.push(input);
        maps.push(consumer_maps[index].clone());
    }
    for (index, &input) in graph.inputs(producer).iter().enumerate() {
        inputs.push(input);
        maps.push(in_fused_op(graph.matching_indexing_map(producer, index)));
    }
    for (index, &input) in consumer_inputs.iter().enumerate().skip(fused.index + 1) {
        inputs.push(input);
        maps.push(consumer_maps[index].clone());
    }

    let mut inits = Vec::new();
    for (result, &init) in graph.inits(producer).iter().enumerate() {
        if preserved.contains(&result) {
            inits.push(init);
            let operand = graph.init_for_result(producer, result);
            maps.push(in_fused_op(graph.matching_indexing_map(producer, operand)));
        }
    }
    for (index, &init) in graph.inits(consumer).iter().enumerate() {
        inits.push(init);
        maps.push(consumer_maps[num_consumer_inputs + index].clone());
    }
    let iterator_types: RVec<IteratorType> = graph.iterator_types(consumer).into();

    let (Some(producer_block), Some(consumer_block)) =
        (graph.body_block(producer), graph.body_block(consumer))
    else {
        return Err(rewriter.notify_match_failure(consumer, "generic op without a payload"));
    };
    let site = FusionSite {
        producer,
        consumer,
        fused_index: fused.index,
        result_number,
        producer_block,
        consumer_block,
        consumer_to_producer_loops: inverse_result_map.compose(&ctx, &consumer_map),
        preserved,
    };

    rewriter.set_insertion_point_before(consumer);
    let (fused_op, fused_block) =
        rewriter.generic_without_body(&inputs, &inits, maps, iterator_types);
    if rewriter.graph().shapes_to_loops_map(fused_op).is_none() {
        rewriter.erase_op(fused_op);
        return Err(rewriter.notify_match_failure(
            consumer,
            "fused op failed loop bound computation check",
        ));
    }
    generate_fused_region(rewriter, fused_block, &site);

    let graph = rewriter.graph();
    let fused_results = graph.op(fused_op).results.clone();
    let mut originals = graph
        .op(producer)
        .results
        .iter()
        .enumerate()
        .filter(|(index, _)| site.preserved.contains(index))
        .map(|(_, &r)| r)
        .collect::<Vec<_>>();
    originals.extend(graph.op(consumer).results.iter().copied());
    debug_assert_eq!(originals.len(), fused_results.len());
    Ok(ElementwiseOpFusionResult {
        fused_op,
        replacements: originals.into_iter().zip(fused_results).collect(),
    })
}

fn add_mapped_args(
    rewriter: &mut Rewriter<'_>,
    fused_block: BlockId,
    args: &[ValueId],
    mapping: &mut IrMapping,
) {
    for &arg in args {
        let ty = rewriter.graph().value_type(arg).clone();
        let new_arg = rewriter.add_block_argument(fused_block, ty);
        mapping.map(arg, new_arg);
    }
}

fn generate_fused_region(rewriter: &mut Rewriter<'_>, fused_block: BlockId, site: &FusionSite) {
    let saved = rewriter.insertion_point();
    rewriter.set_insertion_point_to_end(fused_block);
    let mut mapping = IrMapping::new();
    let graph = rewriter.graph();
    let producer_args = graph.block(site.producer_block).args.clone();
    let consumer_args = graph.block(site.consumer_block).args.clone();
    let producer_ops = graph.block(site.producer_block).ops.clone();
    let consumer_ops = graph.block(site.consumer_block).ops.clone();
    let producer_inputs = graph.num_inputs(site.producer);
    let consumer_inputs = graph.num_inputs(site.consumer);
    let consumer_loops = graph.num_loops(site.consumer);

    // Producer index reads become functions of the fused (consumer) loops.
    if graph.has_index_semantics(site.producer) {
        let fused_indices = (0..consumer_loops)
            .map(|dim| rewriter.index(dim))
            .collect::<Vec<_>>();
        for &op in &producer_ops {
            if let OpKind::Index { dim } = *rewriter.graph().kind(op) {
                let map = site.consumer_to_producer_loops.sub_map(&[dim]);
                let index = rewriter.affine_apply(map, &fused_indices);
                mapping.map(rewriter.graph().op(op).result(0), index);
            }
        }
    }

    add_mapped_args(rewriter, fused_block, &consumer_args[..site.fused_index], &mut mapping);
    add_mapped_args(rewriter, fused_block, &producer_args[..producer_inputs], &mut mapping);
    add_mapped_args(
        rewriter,
        fused_block,
        &consumer_args[site.fused_index + 1..consumer_inputs],
        &mut mapping,
    );
    let preserved_init_args = producer_args[producer_inputs..]
        .iter()
        .enumerate()
        .filter(|(result, _)| site.preserved.contains(result))
        .map(|(_, &arg)| arg)
        .collect::<Vec<_>>();
    add_mapped_args(rewriter, fused_block, &preserved_init_args, &mut mapping);
    add_mapped_args(rewriter, fused_block, &consumer_args[consumer_inputs..], &mut mapping);

    let mut producer_yield = vec![];
    for &op in &producer_ops {
        let kind = rewriter.graph().kind(op);
        if matches!(kind, OpKind::Yield) {
            producer_yield = rewriter.graph().op(op).operands.clone();
        } else if !matches!(kind, OpKind::Index { .. }) {
            rewriter.clone_op(op, &mut mapping);
        }
    }

    // The consumer reads the producer's yielded value in place of the fused
    // operand.
    let replacement = mapping.lookup_or_default(producer_yield[site.result_number]);
    mapping.map(consumer_args[site.fused_index], replacement);

    let mut consumer_yield = vec![];
    for &op in &consumer_ops {
        if matches!(rewriter.graph().kind(op), OpKind::Yield) {
            consumer_yield = rewriter.graph().op(op).operands.clone();
        } else {
            rewriter.clone_op(op, &mut mapping);
        }
    }

    let mut yielded = producer_yield
        .iter()
        .enumerate()
        .filter(|(result, _)| site.preserved.contains(result))
        .map(|(_, &v)| mapping.lookup_or_default(v))
        .collect::<Vec<_>>();
    yielded.extend(consumer_yield.iter().map(|&v| mapping.lookup_or_default(v)));
    rewriter.yield_values(yielded);
    rewriter.set_insertion_point(saved);

    let graph = rewriter.graph();
    debug_assert!(
        graph
            .parent_op(fused_block)
            .is_some_and(|op| graph.op(op).operands.len() == graph.block(fused_block).args.len()),
        "ill-formed generic op region"
    );
}

/// Fuses a generic op with the generic producer of one of its inputs.
///
/// Only the consumer's results are redirected to the fused op; the producer
/// keeps its other users and is erased by the driver once it is dead.
#[derive(new)]
pub struct FuseElementwiseOps {
    control: ControlFusionFn,
}

impl RewritePattern for FuseElementwiseOps {
    fn name(&self) -> &'static str {
        "FuseElementwiseOps"
    }

    fn matches_root(&self, kind: &OpKind) -> bool {
        kind.is_generic()
    }

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
        let num_operands = rewriter.graph().op(op).operands.len();
        for index in 0..num_operands {
            let operand = OpOperand::new(op, index);
            if !are_elementwise_ops_fusable(rewriter.graph(), operand)
                || !(self.control)(rewriter.graph(), operand)
            {
                continue;
            }
            let fusion = match fuse_elementwise_ops(rewriter, operand) {
                Ok(fusion) => fusion,
                Err(_) => return Err(rewriter.notify_match_failure(op, "fusion failed")),
            };
            let consumer_results = rewriter.graph().op(op).results.clone();
            for (original, replacement) in fusion.replacements {
                if consumer_results.contains(&original) {
                    rewriter.replace_all_uses_with(original, replacement);
                }
            }
            rewriter.erase_op(op);
            return Ok(());
        }
        Err(FusionError::NotApplicable)
    }
}
