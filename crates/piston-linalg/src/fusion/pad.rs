//! Fusing a pad into the generic op that produces its source.
//!
//! ```text
//! %0 = generic ins(..) outs(%init)
//! %1 = pad %0 low[..] high[..] value %v
//! ```
//!
//! becomes
//!
//! ```text
//! %e = empty(padded sizes)
//! %f = fill %v into %e
//! %s = extract_slice %f [low][sizes of %0]
//! %0' = generic ins(..) outs(%s)
//! %1 = insert_slice %0' into %f [low]
//! ```
//!
//! so the generic writes straight into the interior of the padded tensor.

use crate::{
    DimSize, FusionError, FusionResult, IrMapping, MixedSize, OpId, OpKind, RewritePattern,
    Rewriter,
};

#[derive(Debug, Default)]
pub struct FusePadOp;

impl RewritePattern for FusePadOp {
    fn name(&self) -> &'static str {
        "FusePadOp"
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
        let Some(producer) = graph.defining_op(src).filter(|&p| graph.is_generic(p)) else {
            return Err(rewriter.notify_match_failure(op, "expected source to be a generic op"));
        };
        if !graph.iterator_types(producer).iter().all(|it| it.is_parallel()) {
            return Err(rewriter.notify_match_failure(
                op,
                "only supported for ops with all parallel iterator types",
            ));
        }
        let (Some(result_number), Some(src_shape)) =
            (graph.result_number(src), graph.value_type(src).shape().cloned())
        else {
            return Err(rewriter.notify_match_failure(op, "failed to get shape of pad op result"));
        };
        let init = graph.init_for_result(producer, result_number);
        let elem = graph.value_type(graph.op(op).result(0)).elem();

        let mut padded_sizes = Vec::with_capacity(src_shape.rank());
        for (d, size) in src_shape.iter().enumerate() {
            let padding = low[d] + high[d];
            padded_sizes.push(match size {
                DimSize::Static(n) => MixedSize::Static((n + padding) as i64),
                DimSize::Dynamic => {
                    let extent = rewriter.dim(src, d);
                    if padding == 0 {
                        MixedSize::Value(extent)
                    } else {
                        let padding = rewriter.constant_index(padding as i64);
                        MixedSize::Value(rewriter.add(extent, padding))
                    }
                }
            });
        }

        // TODO: fill only the border instead of the whole padded tensor.
        let empty = rewriter.empty(&padded_sizes, elem);
        let fill = rewriter.fill(pad_value, empty);
        let filled = rewriter.graph().op(fill).result(0);

        let src_sizes = rewriter.mixed_sizes(src);
        let slice = rewriter.extract_slice(filled, low.clone(), &src_sizes);
        let cloned = rewriter.clone_op(producer, &mut IrMapping::new());
        rewriter.set_operand(cloned, init, slice);
        let computed = rewriter.graph().op(cloned).result(result_number);
        let inserted = rewriter.insert_slice(computed, filled, low);
        rewriter.replace_op(op, &[inserted]);
        Ok(())
    }
}
