//! Capability queries shared by every structured op (generic, fill, copy,
//! transpose).

use crate::{
    concat_affine_maps, inverse_permutation, AffineMap, BlockId, Graph, IteratorType, MixedSize,
    OpId, OpKind, Range, Rewriter, StructuredAttrs, ValueId,
};

impl Graph {
    pub fn structured(&self, op: OpId) -> Option<&StructuredAttrs> {
        self.op(op).structured()
    }

    pub fn is_structured(&self, op: OpId) -> bool {
        self.structured(op).is_some()
    }

    pub fn is_generic(&self, op: OpId) -> bool {
        self.kind(op).is_generic()
    }

    /// Ops without structured attributes have no loops, maps or DPS
    /// operands; the accessors below report them as empty.
    pub fn num_loops(&self, op: OpId) -> usize {
        self.structured(op).map_or(0, StructuredAttrs::num_loops)
    }

    pub fn iterator_types(&self, op: OpId) -> &[IteratorType] {
        self.structured(op)
            .map_or(&[][..], |attrs| &attrs.iterator_types[..])
    }

    pub fn indexing_maps(&self, op: OpId) -> &[AffineMap] {
        self.structured(op)
            .map_or(&[][..], |attrs| &attrs.indexing_maps[..])
    }

    pub fn num_inputs(&self, op: OpId) -> usize {
        self.structured(op).map_or(0, |attrs| attrs.num_inputs)
    }

    pub fn inputs(&self, op: OpId) -> &[ValueId] {
        match self.structured(op) {
            Some(attrs) => &self.op(op).operands[..attrs.num_inputs],
            None => &[],
        }
    }

    pub fn inits(&self, op: OpId) -> &[ValueId] {
        match self.structured(op) {
            Some(attrs) => &self.op(op).operands[attrs.num_inputs..],
            None => &[],
        }
    }

    pub fn is_dps_input(&self, op: OpId, operand: usize) -> bool {
        operand < self.num_inputs(op)
    }

    pub fn matching_indexing_map(&self, op: OpId, operand: usize) -> &AffineMap {
        &self.indexing_maps(op)[operand]
    }

    /// Operand index of the init tied to result `result`.
    pub fn init_for_result(&self, op: OpId, result: usize) -> usize {
        self.num_inputs(op) + result
    }

    pub fn indexing_map_matching_result(&self, op: OpId, result: usize) -> &AffineMap {
        self.matching_indexing_map(op, self.init_for_result(op, result))
    }

    /// Result tied to the init at `operand`, if the op produces one.
    pub fn tied_result(&self, op: OpId, operand: usize) -> Option<ValueId> {
        let result = operand.checked_sub(self.num_inputs(op))?;
        self.op(op).results.get(result).copied()
    }

    /// Every shaped operand is a tensor.
    pub fn has_pure_tensor_semantics(&self, op: OpId) -> bool {
        self.op(op)
            .operands
            .iter()
            .all(|&v| !self.value_type(v).is_buffer())
    }

    /// Every shaped operand is a buffer.
    pub fn has_pure_buffer_semantics(&self, op: OpId) -> bool {
        self.op(op)
            .operands
            .iter()
            .all(|&v| !self.value_type(v).is_tensor())
    }

    pub fn body_block(&self, op: OpId) -> Option<BlockId> {
        self.op(op).region
    }

    /// Whether the payload reads the element of `operand`.
    pub fn payload_uses_value_from_operand(&self, op: OpId, operand: usize) -> bool {
        match self.kind(op) {
            OpKind::Generic(_) => self
                .body_block(op)
                .map(|block| !self.use_empty(self.block(block).args[operand]))
                .unwrap_or(false),
            OpKind::Fill(_) | OpKind::Copy(_) | OpKind::Transpose { .. } => operand == 0,
            _ => false,
        }
    }

    /// The payload reads loop indices.
    pub fn has_index_semantics(&self, op: OpId) -> bool {
        self.body_block(op)
            .map(|block| {
                self.block(block)
                    .ops
                    .iter()
                    .any(|&o| matches!(self.kind(o), OpKind::Index { .. }))
            })
            .unwrap_or(false)
    }

    /// Inverse of the concatenated indexing maps: from flattened operand dims
    /// to loops. `None` when some loop is not the bare image of an operand
    /// dim.
    pub fn shapes_to_loops_map(&self, op: OpId) -> Option<AffineMap> {
        let concat = concat_affine_maps(self.indexing_maps(op))?;
        inverse_permutation(self.ctx(), &concat)
    }

    /// For every loop, the operand and dim whose extent defines it.
    pub fn loop_to_operand_dim(&self, op: OpId) -> Option<Vec<(ValueId, usize)>> {
        let shapes_to_loops = self.shapes_to_loops_map(op)?;
        let mut flat = Vec::new();
        for &operand in &self.op(op).operands {
            for dim in 0..self.value_type(operand).rank() {
                flat.push((operand, dim));
            }
        }
        (0..shapes_to_loops.num_results())
            .map(|loop_dim| {
                shapes_to_loops
                    .dim_position(self.ctx(), loop_dim)
                    .map(|p| flat[p])
            })
            .collect()
    }

    /// Loop extents known without materializing anything.
    pub fn static_loop_ranges(&self, op: OpId) -> Option<Vec<Option<usize>>> {
        let sources = self.loop_to_operand_dim(op)?;
        Some(
            sources
                .into_iter()
                .map(|(value, dim)| {
                    self.value_type(value)
                        .shape()
                        .and_then(|s| s[dim].as_static())
                })
                .collect(),
        )
    }
}

impl Rewriter<'_> {
    /// Loop ranges of a structured op, creating `dim` ops at the insertion
    /// point for dynamic extents.
    pub fn create_loop_ranges(&mut self, op: OpId) -> Option<Vec<Range>> {
        let sources = self.graph().loop_to_operand_dim(op)?;
        Some(
            sources
                .into_iter()
                .map(|(value, dim)| Range {
                    offset: MixedSize::Static(0),
                    size: self.mixed_size(value, dim),
                    stride: MixedSize::Static(1),
                })
                .collect(),
        )
    }
}
