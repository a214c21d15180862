//! Reference evaluator for a [`Graph`].
//!
//! Slow on purpose: every structured op is run as a scalar loop nest over its
//! indexing maps. Tests compare a graph before and after rewriting on the
//! same inputs to check that the rewrite kept its meaning; the constant
//! folder runs single ops through [`evaluate_detached`].

use anyhow::{anyhow, bail, ensure, Context};
use ndarray::{ArrayD, Dimension, IxDyn};

use crate::{
    BlockId, ConstantValue, DimSize, Graph, HashMap, HashSet, OpId, OpKind, ReassociationIndices,
    Type, ValueId,
};

/// A runtime value: a scalar or a dense row-major tensor. Every element type
/// is carried as `f64`, rounded to what the IR type can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Scalar(f64),
    Tensor(ArrayD<f64>),
}

impl HostValue {
    pub fn as_scalar(&self) -> anyhow::Result<f64> {
        match self {
            HostValue::Scalar(v) => Ok(*v),
            HostValue::Tensor(t) => Err(anyhow!("expected a scalar, found shape {:?}", t.shape())),
        }
    }

    pub fn as_tensor(&self) -> anyhow::Result<&ArrayD<f64>> {
        match self {
            HostValue::Tensor(t) => Ok(t),
            HostValue::Scalar(v) => Err(anyhow!("expected a tensor, found scalar {v}")),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            HostValue::Scalar(_) => &[],
            HostValue::Tensor(t) => t.shape(),
        }
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Scalar(value)
    }
}

impl From<ArrayD<f64>> for HostValue {
    fn from(value: ArrayD<f64>) -> Self {
        HostValue::Tensor(value)
    }
}

#[derive(Default)]
struct CloseStats {
    total_error: f64,
    max_abs_error: f64,
    max_abs_error_idxs: Option<Vec<usize>>,
    element_count: usize,
    fail_count: usize,
    atol: f64,
    rtol: f64,
}

impl CloseStats {
    fn new(atol: f64, rtol: f64) -> Self {
        Self {
            atol,
            rtol,
            ..Default::default()
        }
    }

    fn update(&mut self, a: f64, b: f64, index: &[usize]) {
        let abs_diff = (a - b).abs();
        self.total_error += abs_diff;
        self.element_count += 1;
        if abs_diff > self.max_abs_error {
            self.max_abs_error = abs_diff;
            self.max_abs_error_idxs = Some(index.to_vec());
        }
        if !self.is_close(a, b, abs_diff) {
            self.fail_count += 1;
        }
    }

    fn avg_error(&self) -> f64 {
        self.total_error / self.element_count.max(1) as f64
    }

    fn is_close(&self, a: f64, b: f64, abs_diff: f64) -> bool {
        (a.is_nan() && b.is_nan())
            || (a.is_infinite() && b.is_infinite() && a.signum() == b.signum())
            || abs_diff <= self.atol + self.rtol * b.abs()
    }
}

/// Elementwise `|a - b| <= atol + rtol * |b|`, with matching NaNs and
/// infinities counted as close.
pub fn all_close(a: &HostValue, b: &HostValue, atol: f64, rtol: f64) -> anyhow::Result<()> {
    let mut stats = CloseStats::new(atol, rtol);
    match (a, b) {
        (HostValue::Scalar(x), HostValue::Scalar(y)) => stats.update(*x, *y, &[]),
        (HostValue::Tensor(x), HostValue::Tensor(y)) => {
            ensure!(
                x.shape() == y.shape(),
                "Shape mismatch {:?} != {:?}",
                x.shape(),
                y.shape()
            );
            for (idx, &value) in x.indexed_iter() {
                stats.update(value, y[&idx], idx.slice());
            }
        }
        _ => bail!("cannot compare a scalar with a tensor"),
    }
    if stats.fail_count > 0 {
        bail!(
            "{} samples not close - AVGE={} MAE={} at {:?}",
            stats.fail_count,
            stats.avg_error(),
            stats.max_abs_error,
            stats.max_abs_error_idxs
        );
    }
    log::trace!(
        "all close - AVGE={} MAE={}",
        stats.avg_error(),
        stats.max_abs_error
    );
    Ok(())
}

/// Runs the top-level block of `graph` on `args` (one per block argument)
/// and returns the values passed to `return`.
///
/// Buffers are not supported: their in-place semantics would need an
/// aliasing model.
pub fn evaluate(graph: &Graph, args: &[HostValue]) -> anyhow::Result<Vec<HostValue>> {
    let body = graph.block(graph.body());
    ensure!(
        body.args.len() == args.len(),
        "expected {} arguments, got {}",
        body.args.len(),
        args.len()
    );
    let mut env = HashMap::default();
    for (&arg, value) in body.args.iter().zip(args) {
        check_matches_type(graph.value_type(arg), value)
            .with_context(|| format!("argument {arg:?}"))?;
        env.insert(arg, value.clone());
    }

    for &op in &body.ops {
        let operation = graph.op(op);
        if let OpKind::Return = operation.kind {
            return operation
                .operands
                .iter()
                .map(|&v| lookup(&env, v).cloned())
                .collect();
        }
        let results =
            evaluate_op(graph, op, &env).with_context(|| format!("evaluating {op:?}"))?;
        ensure!(
            results.len() == operation.results.len(),
            "{} produced {} values for {} results",
            operation.name(),
            results.len(),
            operation.results.len()
        );
        for (&result, value) in operation.results.iter().zip(results) {
            env.insert(result, value);
        }
    }
    bail!("top-level block has no return")
}

type Env = HashMap<ValueId, HostValue>;

/// Evaluates `op` alone. Every operand, and every outer value its payload
/// reads, must come from an op without operands (a constant or a static
/// `empty`); anything reaching a function argument is an error.
pub fn evaluate_detached(graph: &Graph, op: OpId) -> anyhow::Result<Vec<HostValue>> {
    let mut needed = graph.op(op).operands.clone();
    if let Some(block) = graph.body_block(op) {
        let block = graph.block(block);
        let mut local = block.args.iter().copied().collect::<HashSet<_>>();
        for &inner in &block.ops {
            let inner = graph.op(inner);
            needed.extend(inner.operands.iter().filter(|v| !local.contains(v)));
            local.extend(inner.results.iter().copied());
        }
    }

    let mut env = Env::default();
    for value in needed {
        if env.contains_key(&value) {
            continue;
        }
        let producer = graph
            .defining_op(value)
            .ok_or_else(|| anyhow!("{value:?} is a block argument"))?;
        let operation = graph.op(producer);
        ensure!(
            operation.operands.is_empty(),
            "{} {producer:?} has operands",
            operation.name()
        );
        let results = evaluate_op(graph, producer, &env)?;
        env.extend(operation.results.iter().copied().zip(results));
    }
    evaluate_op(graph, op, &env).with_context(|| format!("evaluating {op:?}"))
}


fn lookup(env: &Env, value: ValueId) -> anyhow::Result<&HostValue> {
    env.get(&value)
        .ok_or_else(|| anyhow!("{value:?} used before it was computed"))
}

fn check_matches_type(ty: &Type, value: &HostValue) -> anyhow::Result<()> {
    match (ty, value) {
        (Type::Scalar(_), HostValue::Scalar(_)) => Ok(()),
        (Type::Tensor(t), HostValue::Tensor(array)) => {
            ensure!(
                t.shape.rank() == array.ndim()
                    && t.shape.iter().zip(array.shape()).all(|(d, &n)| match d {
                        DimSize::Static(s) => s == n,
                        DimSize::Dynamic => true,
                    }),
                "value of shape {:?} does not fit {ty}",
                array.shape()
            );
            Ok(())
        }
        (Type::Buffer(_), _) => bail!("buffers are not supported by the interpreter"),
        _ => bail!("value does not fit {ty}"),
    }
}

/// Extents of a shaped `ty`, taking dynamic dims from `dynamic` in order.
fn concrete_shape(ty: &Type, dynamic: &[ValueId], env: &Env) -> anyhow::Result<Vec<usize>> {
    let shape = ty.shape().ok_or_else(|| anyhow!("{ty} is not shaped"))?;
    let mut sizes = dynamic.iter();
    shape
        .iter()
        .map(|dim| -> anyhow::Result<usize> {
            match dim {
                DimSize::Static(s) => Ok(s),
                DimSize::Dynamic => {
                    let value = sizes
                        .next()
                        .ok_or_else(|| anyhow!("missing size operand for {ty}"))?;
                    Ok(lookup(env, *value)?.as_scalar()? as usize)
                }
            }
        })
        .collect()
}

fn reshape(src: &ArrayD<f64>, shape: &[usize]) -> anyhow::Result<ArrayD<f64>> {
    ArrayD::from_shape_vec(IxDyn(shape), src.iter().copied().collect())
        .with_context(|| format!("cannot reshape {:?} to {shape:?}", src.shape()))
}

fn collapsed_extents(src: &[usize], reassociation: &[ReassociationIndices]) -> Vec<usize> {
    reassociation
        .iter()
        .map(|group| group.iter().map(|&d| src[d]).product())
        .collect()
}

fn offset_index(index: &[usize], offsets: &[usize]) -> Vec<usize> {
    index.iter().zip(offsets).map(|(i, o)| i + o).collect()
}

fn evaluate_op(graph: &Graph, op: OpId, env: &Env) -> anyhow::Result<Vec<HostValue>> {
    let operation = graph.op(op);
    let operand = |i: usize| lookup(env, operation.operands[i]);
    let result_ty = |i: usize| graph.value_type(operation.result(i));

    let value = match &operation.kind {
        OpKind::Generic(_) | OpKind::Fill(_) | OpKind::Copy(_) | OpKind::Transpose { .. } => {
            return evaluate_structured(graph, op, env);
        }
        OpKind::Constant(constant) => {
            let ty = result_ty(0);
            let elem = ty.elem();
            match constant {
                ConstantValue::Scalar(v) => HostValue::Scalar(elem.normalize(*v)),
                ConstantValue::Splat(v) => {
                    let shape = concrete_shape(ty, &[], env)?;
                    HostValue::Tensor(ArrayD::from_elem(IxDyn(&shape), elem.normalize(*v)))
                }
                ConstantValue::Dense(values) => {
                    let shape = concrete_shape(ty, &[], env)?;
                    let values = values.iter().map(|&v| elem.normalize(v)).collect();
                    HostValue::Tensor(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
                }
            }
        }
        OpKind::Arith(arith) => {
            let (lhs, rhs) = (operand(0)?.as_scalar()?, operand(1)?.as_scalar()?);
            HostValue::Scalar(result_ty(0).elem().normalize(arith.apply(lhs, rhs)))
        }
        OpKind::Cast => HostValue::Scalar(result_ty(0).elem().normalize(operand(0)?.as_scalar()?)),
        OpKind::AffineApply(map) => {
            let dims = (0..operation.operands.len())
                .map(|i| -> anyhow::Result<i64> { Ok(operand(i)?.as_scalar()? as i64) })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let results = map.eval(graph.ctx(), &dims);
            let value = results
                .first()
                .ok_or_else(|| anyhow!("affine_apply with an empty map"))?;
            HostValue::Scalar(*value as f64)
        }
        OpKind::Dim { index } => {
            let shape = operand(0)?.shape();
            let extent = shape
                .get(*index)
                .ok_or_else(|| anyhow!("dim {index} out of range for {shape:?}"))?;
            HostValue::Scalar(*extent as f64)
        }
        OpKind::Empty => {
            let shape = concrete_shape(result_ty(0), &operation.operands, env)?;
            HostValue::Tensor(ArrayD::zeros(IxDyn(&shape)))
        }
        OpKind::ExpandShape { .. } => {
            let shape = concrete_shape(result_ty(0), &operation.operands[1..], env)?;
            HostValue::Tensor(reshape(operand(0)?.as_tensor()?, &shape)?)
        }
        OpKind::CollapseShape { reassociation } => {
            let src = operand(0)?.as_tensor()?;
            let shape = collapsed_extents(src.shape(), reassociation);
            HostValue::Tensor(reshape(src, &shape)?)
        }
        OpKind::Pad { low, high } => {
            let src = operand(0)?.as_tensor()?;
            let pad_value = operand(1)?.as_scalar()?;
            let shape = src
                .shape()
                .iter()
                .enumerate()
                .map(|(d, n)| n + low[d] + high[d])
                .collect::<Vec<_>>();
            let mut padded = ArrayD::from_elem(IxDyn(&shape), pad_value);
            for (idx, &v) in src.indexed_iter() {
                padded[IxDyn(&offset_index(idx.slice(), low))] = v;
            }
            HostValue::Tensor(padded)
        }
        OpKind::ExtractSlice { offsets } => {
            let src = operand(0)?.as_tensor()?;
            let shape = concrete_shape(result_ty(0), &operation.operands[1..], env)?;
            for (d, (&size, &offset)) in shape.iter().zip(offsets).enumerate() {
                ensure!(
                    offset + size <= src.shape()[d],
                    "slice {offset}..{} out of bounds for dim {d} of {:?}",
                    offset + size,
                    src.shape()
                );
            }
            HostValue::Tensor(ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
                src[IxDyn(&offset_index(idx.slice(), offsets))]
            }))
        }
        OpKind::InsertSlice { offsets } => {
            let src = operand(0)?.as_tensor()?;
            let mut dest = operand(1)?.as_tensor()?.clone();
            for (d, (&size, &offset)) in src.shape().iter().zip(offsets).enumerate() {
                ensure!(
                    offset + size <= dest.shape()[d],
                    "insertion out of bounds along dim {d}"
                );
            }
            for (idx, &v) in src.indexed_iter() {
                dest[IxDyn(&offset_index(idx.slice(), offsets))] = v;
            }
            HostValue::Tensor(dest)
        }
        OpKind::Opaque { name } => bail!("cannot evaluate opaque op `{name}`"),
        OpKind::Index { .. } | OpKind::Yield | OpKind::Return => {
            bail!("{} is not valid at the top level", operation.name())
        }
    };
    Ok(vec![value])
}

/// Runs the loop nest of a structured op over the extents its operands
/// imply, reading and writing elements through the indexing maps.
fn evaluate_structured(graph: &Graph, op: OpId, env: &Env) -> anyhow::Result<Vec<HostValue>> {
    let ctx = graph.ctx();
    let operation = graph.op(op);
    let maps = graph.indexing_maps(op);
    let num_inputs = graph.num_inputs(op);

    let operands = operation
        .operands
        .iter()
        .map(|&v| {
            ensure!(
                !graph.value_type(v).is_buffer(),
                "buffers are not supported by the interpreter"
            );
            lookup(env, v)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let extents = graph
        .loop_to_operand_dim(op)
        .ok_or_else(|| anyhow!("loop bounds of {} are not computable", operation.name()))?
        .into_iter()
        .map(|(value, dim)| -> anyhow::Result<usize> {
            let position = operation
                .operands
                .iter()
                .position(|&o| o == value)
                .ok_or_else(|| anyhow!("loop bound from a foreign value"))?;
            Ok(operands[position].shape()[dim])
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut outputs = operands[num_inputs..]
        .iter()
        .map(|v| v.as_tensor().cloned())
        .collect::<anyhow::Result<Vec<_>>>()?;
    let output_elems = operation.operands[num_inputs..]
        .iter()
        .map(|&v| graph.value_type(v).elem())
        .collect::<Vec<_>>();

    for ivs in ndarray::indices(IxDyn(&extents)) {
        let ivs = ivs.slice();
        let point = ivs.iter().map(|&i| i as i64).collect::<Vec<_>>();
        let element_index = |map_index: usize| {
            maps[map_index]
                .eval(ctx, &point)
                .into_iter()
                .map(|i| i as usize)
                .collect::<Vec<_>>()
        };

        let mut args = Vec::with_capacity(operands.len());
        for (index, value) in operands.iter().enumerate() {
            let element = match (index < num_inputs, value) {
                (true, HostValue::Scalar(v)) => *v,
                (true, HostValue::Tensor(t)) => *t
                    .get(IxDyn(&element_index(index)))
                    .ok_or_else(|| anyhow!("input {index} read out of bounds at {ivs:?}"))?,
                (false, _) => {
                    let output = &outputs[index - num_inputs];
                    *output
                        .get(IxDyn(&element_index(index)))
                        .ok_or_else(|| anyhow!("init {index} read out of bounds at {ivs:?}"))?
                }
            };
            args.push(element);
        }

        let yielded = match &operation.kind {
            OpKind::Generic(_) => {
                let block = graph
                    .body_block(op)
                    .ok_or_else(|| anyhow!("generic op without a payload"))?;
                evaluate_payload(graph, block, &args, ivs, env)?
            }
            // Fill, copy and transpose all forward their single input.
            _ => vec![args[0]],
        };
        ensure!(
            yielded.len() == outputs.len(),
            "payload yields {} values for {} inits",
            yielded.len(),
            outputs.len()
        );
        for (number, value) in yielded.into_iter().enumerate() {
            let index = element_index(num_inputs + number);
            let slot = outputs[number]
                .get_mut(IxDyn(&index))
                .ok_or_else(|| anyhow!("result {number} written out of bounds at {ivs:?}"))?;
            *slot = output_elems[number].normalize(value);
        }
    }
    Ok(outputs.into_iter().map(HostValue::Tensor).collect())
}

fn evaluate_payload(
    graph: &Graph,
    block: BlockId,
    args: &[f64],
    ivs: &[usize],
    env: &Env,
) -> anyhow::Result<Vec<f64>> {
    let block = graph.block(block);
    let mut local: HashMap<ValueId, f64> =
        block.args.iter().copied().zip(args.iter().copied()).collect();
    let get = |local: &HashMap<ValueId, f64>, value: ValueId| -> anyhow::Result<f64> {
        match local.get(&value) {
            Some(&v) => Ok(v),
            None => lookup(env, value)?.as_scalar(),
        }
    };

    for &op in &block.ops {
        let operation = graph.op(op);
        let result_elem = operation
            .results
            .first()
            .map(|&r| graph.value_type(r).elem());
        let value = match &operation.kind {
            OpKind::Yield => {
                return operation
                    .operands
                    .iter()
                    .map(|&v| get(&local, v))
                    .collect();
            }
            OpKind::Index { dim } => *ivs
                .get(*dim)
                .ok_or_else(|| anyhow!("index {dim} outside the loop nest"))?
                as f64,
            OpKind::Arith(arith) => {
                let lhs = get(&local, operation.operands[0])?;
                let rhs = get(&local, operation.operands[1])?;
                arith.apply(lhs, rhs)
            }
            OpKind::Cast => get(&local, operation.operands[0])?,
            OpKind::Constant(ConstantValue::Scalar(v)) => *v,
            OpKind::AffineApply(map) => {
                let dims = operation
                    .operands
                    .iter()
                    .map(|&v| -> anyhow::Result<i64> { Ok(get(&local, v)? as i64) })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                let result = map
                    .eval(graph.ctx(), &dims)
                    .first()
                    .copied()
                    .ok_or_else(|| anyhow!("affine_apply with an empty map"))?;
                result as f64
            }
            other => bail!("{} cannot appear in a payload", other.name()),
        };
        let value = result_elem.map_or(value, |elem| elem.normalize(value));
        local.insert(operation.result(0), value);
    }
    bail!("payload has no terminator")
}
