//! Fusion rewrites on structured ops, and the pass that bundles them.
mod auxiliary;
mod collapsing;
mod elementwise;
mod expansion;
mod pad;

pub use auxiliary::*;
pub use collapsing::*;
pub use elementwise::*;
pub use expansion::*;
pub use pad::*;

use derive_new::new;

use crate::{
    always_control_fn, apply_patterns_greedily, default_control_fn, ApplyResult,
    ControlFusionFn, FusionConfig, GetCollapsableDimensionsFn, Graph, PatternSet,
};

/// Producer/consumer fusion plus the cleanups that enable it.
pub fn populate_elementwise_ops_fusion_patterns(
    patterns: &mut PatternSet,
    control: ControlFusionFn,
) {
    patterns
        .add(FuseElementwiseOps::new(control.clone()))
        .add(FoldFillWithGenericOp)
        .add(FoldScalarOrSplatConstant::new(control))
        .add(RemoveOutsDependency)
        .add(EraseUnusedOperandsAndResults);
}

/// Propagates reshapes through structured ops by expanding their loops.
pub fn populate_fold_reshape_ops_by_expansion_patterns(
    patterns: &mut PatternSet,
    control: ControlFusionFn,
) {
    patterns
        .add(FoldReshapeWithGenericOpByExpansion::new(control.clone()))
        .add(FoldPadWithProducerReshapeOpByExpansion::new(control.clone()))
        .add(FoldWithProducerReshapeOpByExpansion::new(control));
}

/// Propagates reshapes through generic ops by collapsing their loops. The
/// reshape pairs left behind cancel through [`FoldReshapeOfInverseReshape`].
pub fn populate_fold_reshape_ops_by_collapsing_patterns(
    patterns: &mut PatternSet,
    control: ControlFusionFn,
) {
    patterns
        .add(FoldWithProducerReshapeOpByCollapsing::new(control.clone()))
        .add(FoldPadWithProducerReshapeOpByCollapsing::new(control.clone()))
        .add(FoldReshapeWithGenericOpByCollapsing::new(control))
        .add(FoldReshapeOfInverseReshape);
}

/// Swaps expansions above collapses so they can reach the producer.
pub fn populate_bubble_up_expand_shape_patterns(patterns: &mut PatternSet) {
    patterns.add(BubbleUpExpandThroughParallelCollapse);
}

/// Evaluates generics whose inputs are all constants.
pub fn populate_constant_fold_linalg_operations(
    patterns: &mut PatternSet,
    control: ControlFusionFn,
) {
    patterns.add(FoldConstantGenericOp::new(control));
}

pub fn populate_collapse_dimensions(
    patterns: &mut PatternSet,
    control: GetCollapsableDimensionsFn,
) {
    patterns.add(CollapseLinalgDimensions::new(control));
}

pub fn populate_fuse_tensor_pad_with_producer_linalg_op_patterns(patterns: &mut PatternSet) {
    patterns.add(FusePadOp);
}

/// Greedily fuses elementwise ops and folds reshapes into them.
#[derive(new, Debug, Clone, Default)]
pub struct ElementwiseFusionPass {
    config: FusionConfig,
}

impl ElementwiseFusionPass {
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn control(&self) -> ControlFusionFn {
        if self.config.fuse_multi_use_producers {
            always_control_fn()
        } else {
            default_control_fn()
        }
    }

    pub fn patterns(&self) -> PatternSet {
        let control = self.control();
        let config = &self.config;
        let mut patterns = PatternSet::new();
        patterns.add(FuseElementwiseOps::new(control.clone()));
        if config.fold_constants {
            patterns
                .add(FoldFillWithGenericOp)
                .add(FoldScalarOrSplatConstant::new(control.clone()));
        }
        patterns
            .add(RemoveOutsDependency)
            .add(EraseUnusedOperandsAndResults);
        if config.fold_reshapes_by_expansion {
            populate_fold_reshape_ops_by_expansion_patterns(&mut patterns, control.clone());
            populate_bubble_up_expand_shape_patterns(&mut patterns);
        }
        if config.fold_reshapes_by_collapsing {
            populate_fold_reshape_ops_by_collapsing_patterns(&mut patterns, control.clone());
        } else {
            patterns.add(FoldReshapeOfInverseReshape);
        }
        if config.fold_constants {
            populate_constant_fold_linalg_operations(&mut patterns, control);
        }
        if config.fuse_pad_with_producer {
            populate_fuse_tensor_pad_with_producer_linalg_op_patterns(&mut patterns);
        }
        patterns
    }

    pub fn run(&self, graph: &mut Graph) -> ApplyResult {
        let patterns = self.patterns();
        log::debug!(
            "elementwise fusion: {} patterns, {} ops",
            patterns.len(),
            graph.num_ops()
        );
        apply_patterns_greedily(graph, &patterns, &self.config.greedy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pass_patterns() {
        let pass = ElementwiseFusionPass::default();
        assert_eq!(
            pass.patterns().names(),
            vec![
                "FuseElementwiseOps",
                "FoldFillWithGenericOp",
                "FoldScalarOrSplatConstant",
                "RemoveOutsDependency",
                "EraseUnusedOperandsAndResults",
                "FoldReshapeWithGenericOpByExpansion",
                "FoldPadWithProducerReshapeOpByExpansion",
                "FoldWithProducerReshapeOpByExpansion",
                "BubbleUpExpandThroughParallelCollapse",
                "FoldReshapeOfInverseReshape",
                "FoldConstantGenericOp",
            ]
        );
    }

    #[test]
    fn toggles_select_patterns() {
        let config = FusionConfig {
            fold_reshapes_by_expansion: false,
            fold_reshapes_by_collapsing: true,
            fuse_pad_with_producer: true,
            fold_constants: false,
            ..Default::default()
        };
        let names = ElementwiseFusionPass::new(config).patterns().names();
        assert!(!names.contains(&"FoldScalarOrSplatConstant"));
        assert!(!names.contains(&"FoldConstantGenericOp"));
        assert!(!names.contains(&"FoldWithProducerReshapeOpByExpansion"));
        assert!(!names.contains(&"BubbleUpExpandThroughParallelCollapse"));
        assert!(names.contains(&"FoldReshapeWithGenericOpByCollapsing"));
        assert_eq!(names.last(), Some(&"FusePadOp"));
        assert_eq!(
            names.iter().filter(|&&n| n == "FoldReshapeOfInverseReshape").count(),
            1
        );
    }
}
