use std::fmt;

use crate::{BlockId, ConstantValue, Graph, HashMap, OpId, OpKind, ValueId};

struct Printer<'a> {
    graph: &'a Graph,
    names: HashMap<ValueId, usize>,
}

impl<'a> Printer<'a> {
    fn name(&mut self, value: ValueId) -> String {
        let next = self.names.len();
        let id = *self.names.entry(value).or_insert(next);
        format!("%{id}")
    }

    fn names(&mut self, values: &[ValueId]) -> String {
        values
            .iter()
            .map(|&v| self.name(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn block(&mut self, f: &mut fmt::Formatter<'_>, block: BlockId, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let args = self.graph.block(block).args.clone();
        if !args.is_empty() {
            let typed = args
                .iter()
                .map(|&a| format!("{}: {}", self.name(a), self.graph.value_type(a)))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "{indent}^bb({typed}):")?;
        }
        for &op in &self.graph.block(block).ops {
            self.op(f, op, depth + 1)?;
        }
        Ok(())
    }

    fn op(&mut self, f: &mut fmt::Formatter<'_>, op: OpId, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let operation = self.graph.op(op);
        let ctx = self.graph.ctx();
        write!(f, "{indent}")?;
        if !operation.results.is_empty() {
            let results = self.names(&operation.results);
            write!(f, "{results} = ")?;
        }
        write!(f, "{}", operation.name())?;
        match &operation.kind {
            OpKind::Constant(ConstantValue::Scalar(v)) => write!(f, " {v}")?,
            OpKind::Constant(ConstantValue::Splat(v)) => write!(f, " splat({v})")?,
            OpKind::Constant(ConstantValue::Dense(vs)) => write!(f, " dense{vs:?}")?,
            OpKind::Index { dim } | OpKind::Dim { index: dim } => write!(f, " {dim}")?,
            OpKind::ExpandShape { reassociation } | OpKind::CollapseShape { reassociation } => {
                write!(f, " {reassociation:?}")?
            }
            OpKind::Pad { low, high } => write!(f, " low{low:?} high{high:?}")?,
            OpKind::ExtractSlice { offsets } | OpKind::InsertSlice { offsets } => {
                write!(f, " offsets{offsets:?}")?
            }
            OpKind::Transpose { permutation, .. } => write!(f, " {permutation:?}")?,
            OpKind::AffineApply(map) => write!(f, " {}", map.display(ctx))?,
            _ => {}
        }
        if let Some(attrs) = operation.structured() {
            let maps = attrs
                .indexing_maps
                .iter()
                .map(|m| m.display(ctx).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let iterators = attrs
                .iterator_types
                .iter()
                .map(|it| it.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let (ins, outs) = operation.operands.split_at(attrs.num_inputs);
            let ins = self.names(ins);
            let outs = self.names(outs);
            write!(f, " {{maps = [{maps}], iterators = [{iterators}]}} ins({ins}) outs({outs})")?;
        } else if !operation.operands.is_empty() {
            let operands = self.names(&operation.operands);
            write!(f, " {operands}")?;
        }
        if !operation.results.is_empty() {
            let types = operation
                .results
                .iter()
                .map(|&r| self.graph.value_type(r).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " : {types}")?;
        }
        match operation.region {
            Some(region) => {
                writeln!(f, " {{")?;
                self.block(f, region, depth)?;
                writeln!(f, "{indent}}}")
            }
            None => writeln!(f),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer {
            graph: self,
            names: HashMap::default(),
        };
        writeln!(f, "func {{")?;
        printer.block(f, self.body(), 0)?;
        writeln!(f, "}}")
    }
}
