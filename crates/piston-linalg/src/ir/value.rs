use derive_new::new;
use slotmap::new_key_type;

use crate::{HashMap, Type};

new_key_type! {
    /// Unique identifier for an operation in a [`Graph`](crate::Graph).
    pub struct OpId;
    /// Unique identifier for an SSA value.
    pub struct ValueId;
    /// Unique identifier for a block.
    pub struct BlockId;
}

/// Where an SSA value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    OpResult { op: OpId, index: usize },
    BlockArg { block: BlockId, index: usize },
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
}

/// One use of a value: operand `index` of `op`.
///
/// As a fusion edge, `op` is the consumer and `index` the operand reading the
/// producer's result.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpOperand {
    pub op: OpId,
    pub index: usize,
}

/// Value substitution table used while cloning.
#[derive(Debug, Default, Clone)]
pub struct IrMapping {
    values: HashMap<ValueId, ValueId>,
}

impl IrMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, from: ValueId, to: ValueId) {
        self.values.insert(from, to);
    }

    pub fn map_all(&mut self, from: &[ValueId], to: &[ValueId]) {
        debug_assert_eq!(from.len(), to.len());
        for (&f, &t) in from.iter().zip(to) {
            self.map(f, t);
        }
    }

    pub fn lookup(&self, value: ValueId) -> Option<ValueId> {
        self.values.get(&value).copied()
    }

    pub fn lookup_or_default(&self, value: ValueId) -> ValueId {
        self.lookup(value).unwrap_or(value)
    }

    pub fn contains(&self, value: ValueId) -> bool {
        self.values.contains_key(&value)
    }
}
