use std::rc::Rc;

use slotmap::SlotMap;

use crate::{
    AffineContext, Block, BlockId, DimSize, HashSet, InvariantError, MixedSize, OpId, OpKind,
    OpOperand, Operation, Type, ValueData, ValueDef, ValueId,
};

/// Where the next created op goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPoint {
    Before(OpId),
    Start(BlockId),
    End(BlockId),
}

/// An SSA function body: one top-level block whose arguments are the
/// function arguments, holding ops that may own single-block regions.
///
/// Operations, values and blocks live in slotmap arenas; uses are found by
/// scanning, so there is no use-list to keep in sync. Clones share the
/// affine context.
#[derive(Debug, Clone)]
pub struct Graph {
    ctx: Rc<AffineContext>,
    ops: SlotMap<OpId, Operation>,
    values: SlotMap<ValueId, ValueData>,
    blocks: SlotMap<BlockId, Block>,
    body: BlockId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::with_context(Rc::new(AffineContext::new()))
    }

    pub fn with_context(ctx: Rc<AffineContext>) -> Self {
        let mut blocks = SlotMap::with_key();
        let body = blocks.insert(Block::default());
        Self {
            ctx,
            ops: SlotMap::with_key(),
            values: SlotMap::with_key(),
            blocks,
            body,
        }
    }

    pub fn ctx(&self) -> &AffineContext {
        &self.ctx
    }

    /// Shared handle to the affine context, for code that needs it while the
    /// graph is mutably borrowed.
    pub fn context(&self) -> Rc<AffineContext> {
        self.ctx.clone()
    }

    pub fn body(&self) -> BlockId {
        self.body
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id]
    }

    pub fn try_op(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(id)
    }

    pub fn contains_op(&self, id: OpId) -> bool {
        self.ops.contains_key(id)
    }

    pub fn kind(&self, id: OpId) -> &OpKind {
        &self.ops[id].kind
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn contains_block(&self, id: BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id]
    }

    pub fn contains_value(&self, id: ValueId) -> bool {
        self.values.contains_key(id)
    }

    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.values[id].ty
    }

    pub fn defining_op(&self, id: ValueId) -> Option<OpId> {
        match self.values[id].def {
            ValueDef::OpResult { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    pub fn result_number(&self, id: ValueId) -> Option<usize> {
        match self.values[id].def {
            ValueDef::OpResult { index, .. } => Some(index),
            ValueDef::BlockArg { .. } => None,
        }
    }

    pub fn block_arg_position(&self, id: ValueId) -> Option<(BlockId, usize)> {
        match self.values[id].def {
            ValueDef::BlockArg { block, index } => Some((block, index)),
            ValueDef::OpResult { .. } => None,
        }
    }

    /// The op owning `block`, `None` for the top-level block.
    pub fn parent_op(&self, block: BlockId) -> Option<OpId> {
        self.blocks[block].parent
    }

    /// Appends an argument to `block`. Arguments of the top-level block are
    /// the function arguments.
    pub fn add_argument(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.blocks[block].args.len();
        let value = self.values.insert(ValueData {
            ty,
            def: ValueDef::BlockArg { block, index },
        });
        self.blocks[block].args.push(value);
        value
    }

    pub(crate) fn pop_argument(&mut self, block: BlockId) {
        if let Some(value) = self.blocks[block].args.pop() {
            self.values.remove(value);
        }
    }

    fn new_block(&mut self, parent: Option<OpId>) -> BlockId {
        self.blocks.insert(Block {
            parent,
            ..Default::default()
        })
    }

    pub(crate) fn insert_op(
        &mut self,
        ip: InsertionPoint,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
        with_region: bool,
    ) -> OpId {
        let op = self.ops.insert(Operation {
            kind,
            operands,
            results: vec![],
            region: None,
            parent: None,
        });
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                self.values.insert(ValueData {
                    ty,
                    def: ValueDef::OpResult { op, index },
                })
            })
            .collect();
        self.ops[op].results = results;
        if with_region {
            let region = self.new_block(Some(op));
            self.ops[op].region = Some(region);
        }
        self.attach(op, ip);
        op
    }

    /// Block and index of an attached op.
    pub fn position(&self, op: OpId) -> (BlockId, usize) {
        let Some(block) = self.ops[op].parent else {
            panic!("{op:?} is not attached to a block");
        };
        let Some(index) = self.blocks[block].ops.iter().position(|&o| o == op) else {
            panic!("{op:?} missing from its parent block");
        };
        (block, index)
    }

    pub fn resolve(&self, ip: InsertionPoint) -> (BlockId, usize) {
        match ip {
            InsertionPoint::Before(op) => self.position(op),
            InsertionPoint::Start(block) => (block, 0),
            InsertionPoint::End(block) => (block, self.blocks[block].ops.len()),
        }
    }

    pub fn insertion_point_after(&self, op: OpId) -> InsertionPoint {
        let (block, index) = self.position(op);
        match self.blocks[block].ops.get(index + 1) {
            Some(&next) => InsertionPoint::Before(next),
            None => InsertionPoint::End(block),
        }
    }

    fn attach(&mut self, op: OpId, ip: InsertionPoint) {
        let (block, index) = self.resolve(ip);
        self.reinsert_at(op, block, index);
    }

    pub(crate) fn reinsert_at(&mut self, op: OpId, block: BlockId, index: usize) {
        self.blocks[block].ops.insert(index, op);
        self.ops[op].parent = Some(block);
    }

    pub(crate) fn detach(&mut self, op: OpId) -> Option<(BlockId, usize)> {
        self.ops[op].parent?;
        let (block, index) = self.position(op);
        self.blocks[block].ops.remove(index);
        self.ops[op].parent = None;
        Some((block, index))
    }

    pub(crate) fn move_op(&mut self, op: OpId, ip: InsertionPoint) {
        self.detach(op);
        self.attach(op, ip);
    }

    pub(crate) fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) {
        self.ops[op].operands[index] = value;
    }

    /// Erases `op`, its region and its results.
    pub(crate) fn remove_op(&mut self, op: OpId) {
        self.detach(op);
        let Some(operation) = self.ops.remove(op) else {
            return;
        };
        if let Some(region) = operation.region {
            self.remove_block(region);
        }
        for result in operation.results {
            self.values.remove(result);
        }
    }

    fn remove_block(&mut self, block: BlockId) {
        let Some(removed) = self.blocks.remove(block) else {
            return;
        };
        for op in removed.ops {
            self.ops[op].parent = None;
            self.remove_op(op);
        }
        for arg in removed.args {
            self.values.remove(arg);
        }
    }

    /// Every op in program order, nested ops right after their parent.
    pub fn walk(&self) -> Vec<OpId> {
        self.walk_block(self.body)
    }

    pub fn walk_block(&self, block: BlockId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_into(block, &mut out);
        out
    }

    fn walk_into(&self, block: BlockId, out: &mut Vec<OpId>) {
        for &op in &self.blocks[block].ops {
            out.push(op);
            if let Some(region) = self.ops[op].region {
                self.walk_into(region, out);
            }
        }
    }

    pub fn users(&self, value: ValueId) -> Vec<OpOperand> {
        let mut uses = Vec::new();
        for op in self.walk() {
            for (index, &operand) in self.ops[op].operands.iter().enumerate() {
                if operand == value {
                    uses.push(OpOperand::new(op, index));
                }
            }
        }
        uses
    }

    /// Distinct ops using any result of `op`.
    pub fn result_users(&self, op: OpId) -> Vec<OpId> {
        let results = &self.ops[op].results;
        let mut users = Vec::new();
        for user in self.walk() {
            if self.ops[user].operands.iter().any(|v| results.contains(v)) {
                users.push(user);
            }
        }
        users
    }

    pub fn num_uses(&self, value: ValueId) -> usize {
        self.users(value).len()
    }

    pub fn has_one_use(&self, value: ValueId) -> bool {
        self.num_uses(value) == 1
    }

    pub fn use_empty(&self, value: ValueId) -> bool {
        self.users(value).is_empty()
    }

    /// The op whose region (transitively) contains `op`, at top level.
    pub fn top_level_ancestor(&self, op: OpId) -> OpId {
        let mut current = op;
        while let Some(block) = self.ops[current].parent {
            match self.blocks[block].parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// True if `a` comes strictly before `b` in the same block.
    pub fn is_before_in_block(&self, a: OpId, b: OpId) -> bool {
        let (block_a, index_a) = self.position(a);
        let (block_b, index_b) = self.position(b);
        block_a == block_b && index_a < index_b
    }

    /// Operands of the top-level `return`, if any.
    pub fn returned_values(&self) -> Vec<ValueId> {
        self.blocks[self.body]
            .ops
            .iter()
            .find(|&&op| matches!(self.ops[op].kind, OpKind::Return))
            .map(|&op| self.ops[op].operands.clone())
            .unwrap_or_default()
    }

    /// Every result extent of an `expand_shape`, dynamic ones read from its
    /// size operands. `None` if an operand is missing.
    pub fn mixed_output_shape(&self, op: OpId) -> Option<Vec<MixedSize>> {
        let operation = &self.ops[op];
        let shape = self.value_type(*operation.results.first()?).shape()?;
        let mut sizes = operation.operands.iter().skip(1);
        shape
            .iter()
            .map(|dim| match dim {
                DimSize::Static(s) => Some(MixedSize::Static(s as i64)),
                DimSize::Dynamic => sizes.next().map(|&v| MixedSize::Value(v)),
            })
            .collect()
    }

    /// The terminator of a structured op's payload.
    pub fn yield_op(&self, block: BlockId) -> Option<OpId> {
        self.blocks[block]
            .ops
            .last()
            .copied()
            .filter(|&op| matches!(self.ops[op].kind, OpKind::Yield))
    }

    /// Checks SSA visibility and the structural rules of every op.
    pub fn verify(&self) -> Result<(), InvariantError> {
        self.verify_block(self.body, &HashSet::default())
    }

    fn verify_block(
        &self,
        block: BlockId,
        visible: &HashSet<ValueId>,
    ) -> Result<(), InvariantError> {
        let mut scope = visible.clone();
        scope.extend(self.blocks[block].args.iter().copied());
        for &op in &self.blocks[block].ops {
            let operation = &self.ops[op];
            for &operand in &operation.operands {
                if !scope.contains(&operand) || !self.values.contains_key(operand) {
                    return Err(InvariantError::UseBeforeDef {
                        op: operation.name().to_string(),
                        value: operand,
                    });
                }
            }
            self.verify_op(op)?;
            if let Some(region) = operation.region {
                self.verify_block(region, &scope)?;
            }
            scope.extend(operation.results.iter().copied());
        }
        Ok(())
    }

    fn verify_op(&self, op: OpId) -> Result<(), InvariantError> {
        let operation = &self.ops[op];
        let name = || operation.name().to_string();
        if let Some(attrs) = operation.structured() {
            let operands = operation.operands.len();
            if attrs.indexing_maps.len() != operands {
                return Err(InvariantError::IndexingMapCount {
                    op: name(),
                    maps: attrs.indexing_maps.len(),
                    operands,
                });
            }
            for (index, (map, &operand)) in attrs
                .indexing_maps
                .iter()
                .zip(&operation.operands)
                .enumerate()
            {
                if map.num_dims() != attrs.num_loops() {
                    return Err(InvariantError::MapArity {
                        op: name(),
                        index,
                        expected: attrs.num_loops(),
                        actual: map.num_dims(),
                    });
                }
                let rank = self.value_type(operand).rank();
                if map.num_results() != rank {
                    return Err(InvariantError::MapRank {
                        op: name(),
                        index,
                        expected: rank,
                        actual: map.num_results(),
                    });
                }
            }
            if let (OpKind::Generic(_), Some(region)) = (&operation.kind, operation.region) {
                let args = self.blocks[region].args.len();
                if args != operands {
                    return Err(InvariantError::RegionArity {
                        op: name(),
                        expected: operands,
                        actual: args,
                    });
                }
                let Some(yield_op) = self.yield_op(region) else {
                    return Err(InvariantError::MissingTerminator { op: name() });
                };
                let expected = operands - attrs.num_inputs;
                let actual = self.ops[yield_op].operands.len();
                if actual != expected {
                    return Err(InvariantError::YieldArity {
                        op: name(),
                        expected,
                        actual,
                    });
                }
            }
        }
        if let Some(reassociation) = operation.kind.reassociation() {
            let src = self.value_type(operation.operands[0]).rank();
            let result = self.value_type(operation.results[0]).rank();
            let (collapsed, expanded) = match operation.kind {
                OpKind::ExpandShape { .. } => (src, result),
                _ => (result, src),
            };
            if !crate::is_valid_reassociation(reassociation, collapsed, expanded) {
                return Err(InvariantError::Reassociation {
                    reassociation: reassociation.to_vec(),
                    collapsed,
                    expanded,
                });
            }
        }
        Ok(())
    }
}
