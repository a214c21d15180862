//! Rewrite patterns and the greedy driver that applies them to a fixpoint.

use std::fmt;
use std::rc::Rc;

use crate::{FusionResult, Graph, GreedyRewriteConfig, OpId, OpKind, OpOperand, ReassociationIndices, Rewriter};

/// A local rewrite rooted at one op.
///
/// `match_and_rewrite` either rewrites and returns `Ok(())`, or returns an
/// error explaining why it did not apply. The driver rolls back anything a
/// failed attempt created, so implementations may build speculatively.
pub trait RewritePattern {
    fn name(&self) -> &'static str;

    fn benefit(&self) -> u16 {
        1
    }

    /// Cheap filter on the root op kind.
    fn matches_root(&self, kind: &OpKind) -> bool;

    fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()>;
}

/// Decides whether the producer feeding an operand may be fused into it.
pub type ControlFusionFn = Rc<dyn Fn(&Graph, OpOperand) -> bool>;

/// Returns the loop-dim groups to collapse for an op; empty to skip.
pub type GetCollapsableDimensionsFn = Rc<dyn Fn(&Graph, OpId) -> Vec<ReassociationIndices>>;

/// Fuse only when the producer has exactly one use.
pub fn default_control_fn() -> ControlFusionFn {
    Rc::new(|graph, operand| {
        let value = graph.op(operand.op).operands[operand.index];
        match graph.defining_op(value) {
            Some(producer) => {
                graph
                    .op(producer)
                    .results
                    .iter()
                    .map(|&r| graph.num_uses(r))
                    .sum::<usize>()
                    == 1
            }
            None => false,
        }
    })
}

/// Always fuse.
pub fn always_control_fn() -> ControlFusionFn {
    Rc::new(|_, _| true)
}

/// Patterns ordered by decreasing benefit; insertion order breaks ties.
#[derive(Default)]
pub struct PatternSet {
    patterns: Vec<Box<dyn RewritePattern>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: impl RewritePattern + 'static) -> &mut Self {
        let benefit = pattern.benefit();
        let at = self
            .patterns
            .iter()
            .position(|p| p.benefit() < benefit)
            .unwrap_or(self.patterns.len());
        self.patterns.insert(at, Box::new(pattern));
        self
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn RewritePattern> {
        self.patterns.iter().map(|p| p.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(|p| p.name()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub iterations: usize,
    pub rewrites: usize,
    pub erased: usize,
    pub reached_fixpoint: bool,
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rewrites, {} dead ops erased in {} iterations ({})",
            self.rewrites,
            self.erased,
            self.iterations,
            if self.reached_fixpoint {
                "fixpoint"
            } else {
                "iteration limit"
            }
        )
    }
}

/// Sweeps the top-level ops in program order, applying the first pattern
/// that succeeds on each, until a sweep changes nothing or the iteration cap
/// is hit.
pub fn apply_patterns_greedily(
    graph: &mut Graph,
    patterns: &PatternSet,
    config: &GreedyRewriteConfig,
) -> ApplyResult {
    let mut result = ApplyResult::default();
    while result.iterations < config.max_iterations {
        result.iterations += 1;
        let mut changed = false;
        let ops = graph.block(graph.body()).ops.clone();
        for op in ops {
            if !graph.contains_op(op) {
                continue;
            }
            if apply_first_match(graph, op, patterns) {
                result.rewrites += 1;
                changed = true;
            }
        }
        if config.erase_dead_ops {
            let erased = erase_dead_ops(graph);
            result.erased += erased;
            changed |= erased > 0;
        }
        if !changed {
            result.reached_fixpoint = true;
            break;
        }
    }
    log::debug!("greedy rewrite: {result}");
    result
}

fn apply_first_match(graph: &mut Graph, op: OpId, patterns: &PatternSet) -> bool {
    let mut rewriter = Rewriter::new(graph);
    for pattern in patterns.iter() {
        if !pattern.matches_root(rewriter.graph().kind(op)) {
            continue;
        }
        let checkpoint = rewriter.checkpoint();
        rewriter.set_insertion_point_before(op);
        match pattern.match_and_rewrite(op, &mut rewriter) {
            Ok(()) => {
                rewriter.commit();
                log::debug!("applied {} to {op:?}", pattern.name());
                return true;
            }
            Err(err) => {
                rewriter.rollback(checkpoint);
                if err.is_match_failure() {
                    log::trace!("{} did not apply to {op:?}: {err}", pattern.name());
                } else {
                    log::warn!("{} failed on {op:?}: {err}", pattern.name());
                }
            }
        }
    }
    false
}

/// Erases top-level ops with results, none of them used, and no side
/// effects. Returns how many were erased.
pub fn erase_dead_ops(graph: &mut Graph) -> usize {
    let mut erased = 0;
    loop {
        let dead = graph
            .block(graph.body())
            .ops
            .iter()
            .rev()
            .copied()
            .find(|&op| {
                let operation = graph.op(op);
                operation.kind.is_pure()
                    && !operation.results.is_empty()
                    && operation.results.iter().all(|&r| graph.use_empty(r))
            });
        match dead {
            Some(op) => {
                log::trace!("erasing dead {} {op:?}", graph.op(op).name());
                graph.remove_op(op);
                erased += 1;
            }
            None => return erased,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElemType, Type};

    struct Named(&'static str, u16);

    impl RewritePattern for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn benefit(&self) -> u16 {
            self.1
        }

        fn matches_root(&self, _: &OpKind) -> bool {
            true
        }

        fn match_and_rewrite(&self, op: OpId, rewriter: &mut Rewriter<'_>) -> FusionResult<()> {
            // Creates an op and then bails: the driver must discard it.
            rewriter.constant_index(7);
            Err(rewriter.notify_match_failure(op, "never applies"))
        }
    }

    #[test]
    fn patterns_sorted_by_benefit() {
        let mut set = PatternSet::new();
        set.add(Named("low", 1)).add(Named("high", 3)).add(Named("mid", 2)).add(Named("mid2", 2));
        assert_eq!(set.names(), vec!["high", "mid", "mid2", "low"]);
    }

    #[test]
    fn failed_attempts_leave_graph_unchanged() {
        let mut graph = Graph::new();
        let body = graph.body();
        let arg = graph.add_argument(body, Type::tensor([4], ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        rewriter.ret(vec![arg]);

        let mut set = PatternSet::new();
        set.add(Named("bail", 1));
        let before = graph.to_string();
        let result = apply_patterns_greedily(&mut graph, &set, &GreedyRewriteConfig::default());
        assert!(result.reached_fixpoint);
        assert_eq!(result.rewrites, 0);
        assert_eq!(graph.to_string(), before);
    }

    #[test]
    fn dead_ops_are_erased_transitively() {
        let mut graph = Graph::new();
        let mut rewriter = Rewriter::new(&mut graph);
        let a = rewriter.constant_index(1);
        let b = rewriter.constant_index(2);
        rewriter.add(a, b);
        assert_eq!(erase_dead_ops(&mut graph), 3);
        assert_eq!(graph.num_ops(), 0);
    }

    #[test]
    fn default_control_requires_single_use() {
        let mut graph = Graph::new();
        let mut rewriter = Rewriter::new(&mut graph);
        let a = rewriter.constant(1.0, ElemType::F32);
        let b = rewriter.add(a, a);
        let user = rewriter.opaque("use", vec![b], vec![]);
        let control = default_control_fn();
        assert!(control(&graph, OpOperand::new(user, 0)));
        let add = graph.defining_op(b).unwrap();
        assert!(!control(&graph, OpOperand::new(add, 0)));
    }
}
