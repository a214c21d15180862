use crate::{
    collapsed_shape, AffineMap, ArithOp, BlockId, ConstantValue, DimSize, ElemType, InsertionPoint,
    IteratorType, MixedSize, OpId, OpKind, ReassociationIndices, Rewriter, RVec, Shape,
    StructuredAttrs, Type, ValueId,
};

impl Rewriter<'_> {
    fn create_value(&mut self, kind: OpKind, operands: Vec<ValueId>, ty: Type) -> ValueId {
        let op = self.create(kind, operands, vec![ty]);
        self.graph().op(op).result(0)
    }

    pub fn constant_index(&mut self, value: i64) -> ValueId {
        self.create_value(
            OpKind::Constant(ConstantValue::Scalar(value as f64)),
            vec![],
            Type::index(),
        )
    }

    pub fn constant(&mut self, value: f64, elem: ElemType) -> ValueId {
        self.create_value(
            OpKind::Constant(ConstantValue::Scalar(elem.normalize(value))),
            vec![],
            Type::Scalar(elem),
        )
    }

    pub fn splat(&mut self, value: f64, ty: Type) -> ValueId {
        let value = ty.elem().normalize(value);
        self.create_value(OpKind::Constant(ConstantValue::Splat(value)), vec![], ty)
    }

    pub fn dense(&mut self, values: Vec<f64>, ty: Type) -> ValueId {
        debug_assert_eq!(ty.shape().and_then(|s| s.numel()), Some(values.len()));
        self.create_value(OpKind::Constant(ConstantValue::Dense(values)), vec![], ty)
    }

    pub fn arith(&mut self, op: ArithOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.graph().value_type(lhs).clone();
        self.create_value(OpKind::Arith(op), vec![lhs, rhs], ty)
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.arith(ArithOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.arith(ArithOp::Mul, lhs, rhs)
    }

    /// Converts a scalar to `elem`; a no-op when the type already matches.
    pub fn cast(&mut self, value: ValueId, elem: ElemType) -> ValueId {
        if self.graph().value_type(value).elem() == elem {
            return value;
        }
        self.create_value(OpKind::Cast, vec![value], Type::Scalar(elem))
    }

    pub fn index(&mut self, dim: usize) -> ValueId {
        self.create_value(OpKind::Index { dim }, vec![], Type::index())
    }

    /// Applies a single-result map to index values. Bare dims and constants
    /// fold away.
    pub fn affine_apply(&mut self, map: AffineMap, dims: &[ValueId]) -> ValueId {
        debug_assert_eq!(map.num_results(), 1);
        debug_assert_eq!(map.num_dims(), dims.len());
        let ctx = self.ctx();
        let expr = map.result(0);
        if let Some(d) = ctx.as_dim(expr) {
            return dims[d];
        }
        if let Some(c) = ctx.as_constant(expr) {
            return self.constant_index(c);
        }
        self.create_value(OpKind::AffineApply(map), dims.to_vec(), Type::index())
    }

    pub fn dim(&mut self, src: ValueId, index: usize) -> ValueId {
        self.create_value(OpKind::Dim { index }, vec![src], Type::index())
    }

    /// Static extent of `src`'s dim, or a `dim` op reading it.
    pub fn mixed_size(&mut self, src: ValueId, index: usize) -> MixedSize {
        let size = self
            .graph()
            .value_type(src)
            .shape()
            .map(|s| s[index])
            .unwrap_or(DimSize::Static(1));
        match size {
            DimSize::Static(s) => MixedSize::Static(s as i64),
            DimSize::Dynamic => MixedSize::Value(self.dim(src, index)),
        }
    }

    pub fn mixed_sizes(&mut self, src: ValueId) -> Vec<MixedSize> {
        let rank = self.graph().value_type(src).rank();
        (0..rank).map(|d| self.mixed_size(src, d)).collect()
    }

    pub fn materialize(&mut self, size: MixedSize) -> ValueId {
        match size {
            MixedSize::Static(s) => self.constant_index(s),
            MixedSize::Value(v) => v,
        }
    }

    pub fn yield_values(&mut self, values: Vec<ValueId>) -> OpId {
        self.create(OpKind::Yield, values, vec![])
    }

    pub fn ret(&mut self, values: Vec<ValueId>) -> OpId {
        self.create(OpKind::Return, values, vec![])
    }

    pub fn opaque(&mut self, name: &str, operands: Vec<ValueId>, result_types: Vec<Type>) -> OpId {
        self.create(
            OpKind::Opaque {
                name: name.to_string(),
            },
            operands,
            result_types,
        )
    }

    pub fn empty(&mut self, sizes: &[MixedSize], elem: ElemType) -> ValueId {
        let shape = sizes.iter().map(|s| s.to_dim_size()).collect::<Shape>();
        let dynamic = dynamic_values(sizes);
        self.create_value(OpKind::Empty, dynamic, Type::tensor(shape, elem))
    }

    /// `output_shape` lists every result extent; dynamic ones become operands.
    pub fn expand_shape(
        &mut self,
        result_ty: Type,
        src: ValueId,
        reassociation: Vec<ReassociationIndices>,
        output_shape: &[MixedSize],
    ) -> ValueId {
        debug_assert_eq!(result_ty.rank(), output_shape.len());
        let dims = result_ty.shape().cloned().unwrap_or_default();
        let mut operands = vec![src];
        for (&size, dim) in output_shape.iter().zip(dims.iter()) {
            if dim.is_dynamic() {
                let value = self.materialize(size);
                operands.push(value);
            }
        }
        self.create_value(OpKind::ExpandShape { reassociation }, operands, result_ty)
    }

    pub fn collapse_shape(
        &mut self,
        src: ValueId,
        reassociation: Vec<ReassociationIndices>,
    ) -> ValueId {
        let src_ty = self.graph().value_type(src).clone();
        let shape = src_ty
            .shape()
            .map(|s| collapsed_shape(s, &reassociation))
            .unwrap_or_default();
        self.collapse_shape_to(src_ty.with_shape(shape), src, reassociation)
    }

    pub fn collapse_shape_to(
        &mut self,
        result_ty: Type,
        src: ValueId,
        reassociation: Vec<ReassociationIndices>,
    ) -> ValueId {
        self.create_value(OpKind::CollapseShape { reassociation }, vec![src], result_ty)
    }

    pub fn pad(
        &mut self,
        src: ValueId,
        low: RVec<usize>,
        high: RVec<usize>,
        pad_value: ValueId,
    ) -> ValueId {
        let src_ty = self.graph().value_type(src).clone();
        let shape = src_ty
            .shape()
            .map(|s| {
                s.iter()
                    .enumerate()
                    .map(|(d, size)| match size {
                        DimSize::Static(n) => DimSize::Static(n + low[d] + high[d]),
                        DimSize::Dynamic => DimSize::Dynamic,
                    })
                    .collect::<Shape>()
            })
            .unwrap_or_default();
        self.create_value(
            OpKind::Pad { low, high },
            vec![src, pad_value],
            src_ty.with_shape(shape),
        )
    }

    pub fn extract_slice(
        &mut self,
        src: ValueId,
        offsets: RVec<usize>,
        sizes: &[MixedSize],
    ) -> ValueId {
        let src_ty = self.graph().value_type(src).clone();
        let shape = sizes.iter().map(|s| s.to_dim_size()).collect::<Shape>();
        let mut operands = vec![src];
        operands.extend(dynamic_values(sizes));
        self.create_value(
            OpKind::ExtractSlice { offsets },
            operands,
            src_ty.with_shape(shape),
        )
    }

    pub fn insert_slice(&mut self, src: ValueId, dest: ValueId, offsets: RVec<usize>) -> ValueId {
        let ty = self.graph().value_type(dest).clone();
        self.create_value(OpKind::InsertSlice { offsets }, vec![src, dest], ty)
    }

    fn result_types_of(&self, inits: &[ValueId]) -> Vec<Type> {
        inits
            .iter()
            .map(|&v| self.graph().value_type(v).clone())
            .filter(Type::is_tensor)
            .collect()
    }

    pub fn fill(&mut self, value: ValueId, init: ValueId) -> OpId {
        let ctx = self.ctx();
        let rank = self.graph().value_type(init).rank();
        let attrs = StructuredAttrs {
            indexing_maps: vec![AffineMap::empty(rank), AffineMap::identity(&ctx, rank)],
            iterator_types: rvec![IteratorType::Parallel; rank],
            num_inputs: 1,
        };
        let result_types = self.result_types_of(&[init]);
        self.create(OpKind::Fill(attrs), vec![value, init], result_types)
    }

    pub fn copy(&mut self, input: ValueId, init: ValueId) -> OpId {
        let ctx = self.ctx();
        let rank = self.graph().value_type(init).rank();
        let identity = AffineMap::identity(&ctx, rank);
        let attrs = StructuredAttrs {
            indexing_maps: vec![identity.clone(), identity],
            iterator_types: rvec![IteratorType::Parallel; rank],
            num_inputs: 1,
        };
        let result_types = self.result_types_of(&[init]);
        self.create(OpKind::Copy(attrs), vec![input, init], result_types)
    }

    /// Result dim `i` reads input dim `permutation[i]`.
    pub fn transpose(&mut self, input: ValueId, init: ValueId, permutation: RVec<usize>) -> OpId {
        let ctx = self.ctx();
        let rank = permutation.len();
        let inverse = crate::invert_permutation_vector(&permutation);
        let attrs = StructuredAttrs {
            indexing_maps: vec![
                AffineMap::permutation(&ctx, &inverse),
                AffineMap::identity(&ctx, rank),
            ],
            iterator_types: rvec![IteratorType::Parallel; rank],
            num_inputs: 1,
        };
        let result_types = self.result_types_of(&[init]);
        self.create(
            OpKind::Transpose { attrs, permutation },
            vec![input, init],
            result_types,
        )
    }

    /// A generic op with an empty, argument-less body block.
    pub fn generic_without_body(
        &mut self,
        inputs: &[ValueId],
        inits: &[ValueId],
        indexing_maps: Vec<AffineMap>,
        iterator_types: RVec<IteratorType>,
    ) -> (OpId, BlockId) {
        let attrs = StructuredAttrs {
            indexing_maps,
            iterator_types,
            num_inputs: inputs.len(),
        };
        let operands = inputs.iter().chain(inits).copied().collect::<Vec<_>>();
        let result_types = self.result_types_of(inits);
        self.create_with_region(OpKind::Generic(attrs), operands, result_types)
    }

    /// Builds a generic op whose body receives one scalar argument per
    /// operand and yields what `body` returns.
    pub fn generic(
        &mut self,
        inputs: &[ValueId],
        inits: &[ValueId],
        indexing_maps: Vec<AffineMap>,
        iterator_types: RVec<IteratorType>,
        body: impl FnOnce(&mut Self, &[ValueId]) -> Vec<ValueId>,
    ) -> OpId {
        let (op, block) = self.generic_without_body(inputs, inits, indexing_maps, iterator_types);
        let operands = self.graph().op(op).operands.clone();
        let args = operands
            .into_iter()
            .map(|v| {
                let elem = self.graph().value_type(v).elem();
                self.add_block_argument(block, Type::Scalar(elem))
            })
            .collect::<Vec<_>>();
        let saved = self.insertion_point();
        self.set_insertion_point(InsertionPoint::End(block));
        let yielded = body(self, &args);
        self.yield_values(yielded);
        self.set_insertion_point(saved);
        op
    }
}

fn dynamic_values(sizes: &[MixedSize]) -> Vec<ValueId> {
    sizes
        .iter()
        .filter_map(|s| match s {
            MixedSize::Value(v) => Some(*v),
            MixedSize::Static(_) => None,
        })
        .collect()
}
