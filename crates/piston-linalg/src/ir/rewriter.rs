use std::borrow::Cow;
use std::rc::Rc;

use crate::{
    AffineContext, BlockId, FusionError, Graph, InsertionPoint, IrMapping, OpId, OpKind,
    OpOperand, Type, ValueId,
};

/// Journal position returned by [`Rewriter::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug)]
enum Change {
    Created(OpId),
    OperandSet {
        op: OpId,
        index: usize,
        old: ValueId,
    },
    ArgAdded(BlockId),
    Moved {
        op: OpId,
        block: BlockId,
        index: usize,
    },
}

/// Transactional editor over a [`Graph`].
///
/// Creations, operand updates, block-argument additions and moves are
/// journaled so a failed rewrite attempt can be discarded with
/// [`Rewriter::rollback`]. Erasure is final: patterns erase ops only once
/// every legality check has passed.
pub struct Rewriter<'g> {
    graph: &'g mut Graph,
    ip: InsertionPoint,
    journal: Vec<Change>,
}

impl<'g> Rewriter<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        let ip = InsertionPoint::End(graph.body());
        Self {
            graph,
            ip,
            journal: vec![],
        }
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    pub fn ctx(&self) -> Rc<AffineContext> {
        self.graph.context()
    }

    pub fn insertion_point(&self) -> InsertionPoint {
        self.ip
    }

    pub fn set_insertion_point(&mut self, ip: InsertionPoint) {
        self.ip = ip;
    }

    pub fn set_insertion_point_before(&mut self, op: OpId) {
        self.ip = InsertionPoint::Before(op);
    }

    pub fn set_insertion_point_after(&mut self, op: OpId) {
        self.ip = self.graph.insertion_point_after(op);
    }

    pub fn set_insertion_point_to_start(&mut self, block: BlockId) {
        self.ip = InsertionPoint::Start(block);
    }

    pub fn set_insertion_point_to_end(&mut self, block: BlockId) {
        self.ip = InsertionPoint::End(block);
    }

    /// Creates an op at the insertion point. Ops inserted at the start of a
    /// block keep their creation order.
    pub fn create(&mut self, kind: OpKind, operands: Vec<ValueId>, result_types: Vec<Type>) -> OpId {
        self.create_impl(kind, operands, result_types, false).0
    }

    /// Like [`Rewriter::create`] but also gives the op an empty body block.
    pub fn create_with_region(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
    ) -> (OpId, BlockId) {
        let (op, region) = self.create_impl(kind, operands, result_types, true);
        (op, region.unwrap_or_else(|| self.graph.body()))
    }

    fn create_impl(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
        with_region: bool,
    ) -> (OpId, Option<BlockId>) {
        let op = self
            .graph
            .insert_op(self.ip, kind, operands, result_types, with_region);
        self.journal.push(Change::Created(op));
        // Keep start-of-block insertions in program order.
        if let InsertionPoint::Start(_) = self.ip {
            self.ip = self.graph.insertion_point_after(op);
        }
        log::trace!("created {} {op:?}", self.graph.op(op).name());
        (op, self.graph.op(op).region)
    }

    pub fn add_block_argument(&mut self, block: BlockId, ty: Type) -> ValueId {
        let value = self.graph.add_argument(block, ty);
        self.journal.push(Change::ArgAdded(block));
        value
    }

    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) {
        let old = self.graph.op(op).operands[index];
        if old == value {
            return;
        }
        self.journal.push(Change::OperandSet { op, index, old });
        self.graph.set_operand(op, index, value);
    }

    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) {
        self.replace_uses_with_if(from, to, |_, _| true);
    }

    pub fn replace_uses_with_if(
        &mut self,
        from: ValueId,
        to: ValueId,
        predicate: impl Fn(&Graph, OpOperand) -> bool,
    ) {
        for operand in self.graph.users(from) {
            if predicate(&*self.graph, operand) {
                self.set_operand(operand.op, operand.index, to);
            }
        }
    }

    /// Replaces every result of `op` and erases it.
    pub fn replace_op(&mut self, op: OpId, replacements: &[ValueId]) {
        let results = self.graph.op(op).results.clone();
        debug_assert_eq!(results.len(), replacements.len());
        for (&from, &to) in results.iter().zip(replacements) {
            self.replace_all_uses_with(from, to);
        }
        self.erase_op(op);
    }

    pub fn erase_op(&mut self, op: OpId) {
        log::trace!("erasing {} {op:?}", self.graph.op(op).name());
        self.graph.remove_op(op);
    }

    pub fn move_op_before(&mut self, op: OpId, before: OpId) {
        let (block, index) = self.graph.position(op);
        self.journal.push(Change::Moved { op, block, index });
        self.graph.move_op(op, InsertionPoint::Before(before));
    }

    /// Clones `op` (and its region) at the insertion point, remapping its
    /// operands through `mapping` and recording its results there.
    pub fn clone_op(&mut self, op: OpId, mapping: &mut IrMapping) -> OpId {
        let source = self.graph.op(op);
        let kind = source.kind.clone();
        let operands = source
            .operands
            .iter()
            .map(|&v| mapping.lookup_or_default(v))
            .collect();
        let result_types = source
            .results
            .iter()
            .map(|&v| self.graph.value_type(v).clone())
            .collect();
        let region = source.region;
        let (cloned, new_region) = self.create_impl(kind, operands, result_types, region.is_some());
        let from = self.graph.op(op).results.clone();
        let to = self.graph.op(cloned).results.clone();
        mapping.map_all(&from, &to);
        if let (Some(src), Some(dst)) = (region, new_region) {
            self.clone_block_into(src, dst, mapping);
        }
        cloned
    }

    /// Appends clones of `src`'s ops to `dst`. Block arguments already in
    /// `mapping` are substituted; the others become new arguments of `dst`.
    pub fn clone_block_into(&mut self, src: BlockId, dst: BlockId, mapping: &mut IrMapping) {
        let args = self.graph.block(src).args.clone();
        for arg in args {
            if !mapping.contains(arg) {
                let ty = self.graph.value_type(arg).clone();
                let new_arg = self.add_block_argument(dst, ty);
                mapping.map(arg, new_arg);
            }
        }
        let saved = self.ip;
        self.ip = InsertionPoint::End(dst);
        let ops = self.graph.block(src).ops.clone();
        for op in ops {
            self.clone_op(op, mapping);
        }
        self.ip = saved;
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.journal.len())
    }

    /// Undoes every journaled change made since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        while self.journal.len() > checkpoint.0 {
            let Some(change) = self.journal.pop() else {
                break;
            };
            match change {
                Change::Created(op) => {
                    if self.graph.contains_op(op) {
                        self.graph.remove_op(op);
                    }
                }
                Change::OperandSet { op, index, old } => {
                    if self.graph.contains_op(op) {
                        self.graph.set_operand(op, index, old);
                    }
                }
                Change::ArgAdded(block) => {
                    if self.graph.contains_block(block) {
                        self.graph.pop_argument(block);
                    }
                }
                Change::Moved { op, block, index } => {
                    if self.graph.contains_op(op) {
                        self.graph.detach(op);
                        self.graph.reinsert_at(op, block, index);
                    }
                }
            }
        }
    }

    /// Makes every change so far permanent.
    pub fn commit(&mut self) {
        self.journal.clear();
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Records why `op` could not be rewritten.
    pub fn notify_match_failure(
        &self,
        op: OpId,
        reason: impl Into<Cow<'static, str>>,
    ) -> FusionError {
        let reason = reason.into();
        match self.graph.try_op(op) {
            Some(operation) => log::debug!("{} {op:?}: {reason}", operation.name()),
            None => log::debug!("{op:?}: {reason}"),
        }
        FusionError::MatchFailure { op, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElemType, OpKind};

    #[test]
    fn rollback_discards_created_ops_and_operand_updates() {
        let mut graph = Graph::new();
        let body = graph.body();
        let a = graph.add_argument(body, Type::Scalar(ElemType::F32));
        let b = graph.add_argument(body, Type::Scalar(ElemType::F32));
        let mut rewriter = Rewriter::new(&mut graph);
        let user = rewriter.create(OpKind::Opaque { name: "use".into() }, vec![a], vec![]);
        rewriter.commit();

        let cp = rewriter.checkpoint();
        let sum = rewriter.add(a, b);
        rewriter.set_operand(user, 0, sum);
        assert_eq!(rewriter.graph().num_ops(), 2);
        rewriter.rollback(cp);

        assert_eq!(graph.num_ops(), 1);
        assert_eq!(graph.op(user).operands, vec![a]);
        graph.verify().unwrap();
    }

    #[test]
    fn start_insertions_keep_creation_order() {
        let mut graph = Graph::new();
        let body = graph.body();
        let mut rewriter = Rewriter::new(&mut graph);
        let last = rewriter.constant_index(2);
        rewriter.set_insertion_point_to_start(body);
        let first = rewriter.constant_index(0);
        let second = rewriter.constant_index(1);
        let order = graph.block(body).ops.clone();
        let defs = [first, second, last].map(|v| graph.defining_op(v).unwrap());
        assert_eq!(order, defs.to_vec());
    }
}
