use std::cell::RefCell;
use std::fmt;

use crate::HashMap;

/// Handle to an interned affine expression.
///
/// Handles are only meaningful together with the [`AffineContext`] that
/// created them. Two handles from the same context compare equal iff the
/// expressions are structurally identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AffineExpr(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AffineExprKind {
    Dim(usize),
    Symbol(usize),
    Constant(i64),
    Add(AffineExpr, AffineExpr),
    Mul(AffineExpr, AffineExpr),
    Mod(AffineExpr, AffineExpr),
    FloorDiv(AffineExpr, AffineExpr),
    CeilDiv(AffineExpr, AffineExpr),
}

impl AffineExprKind {
    fn operator(&self) -> Option<&'static str> {
        match self {
            AffineExprKind::Add(..) => Some("+"),
            AffineExprKind::Mul(..) => Some("*"),
            AffineExprKind::Mod(..) => Some("mod"),
            AffineExprKind::FloorDiv(..) => Some("floordiv"),
            AffineExprKind::CeilDiv(..) => Some("ceildiv"),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Interner {
    exprs: Vec<AffineExprKind>,
    lookup: HashMap<AffineExprKind, AffineExpr>,
}

/// Arena owning every affine expression of one compilation unit.
///
/// The context is append-only; it is shared by reference (usually through the
/// owning [`Graph`](crate::Graph)) and never stored in global state.
#[derive(Debug, Default)]
pub struct AffineContext {
    inner: RefCell<Interner>,
}

pub(crate) fn floor_div(lhs: i64, rhs: i64) -> i64 {
    let q = lhs / rhs;
    if lhs % rhs != 0 && ((lhs < 0) != (rhs < 0)) {
        q - 1
    } else {
        q
    }
}

pub(crate) fn ceil_div(lhs: i64, rhs: i64) -> i64 {
    -floor_div(-lhs, rhs)
}

pub(crate) fn modulo(lhs: i64, rhs: i64) -> i64 {
    lhs - rhs * floor_div(lhs, rhs)
}

impl AffineContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&self, kind: AffineExprKind) -> AffineExpr {
        let mut inner = self.inner.borrow_mut();
        if let Some(&expr) = inner.lookup.get(&kind) {
            return expr;
        }
        let expr = AffineExpr(inner.exprs.len() as u32);
        inner.exprs.push(kind);
        inner.lookup.insert(kind, expr);
        expr
    }

    pub fn kind(&self, expr: AffineExpr) -> AffineExprKind {
        self.inner.borrow().exprs[expr.0 as usize]
    }

    /// Number of distinct expressions interned so far.
    pub fn len(&self) -> usize {
        self.inner.borrow().exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self, position: usize) -> AffineExpr {
        self.intern(AffineExprKind::Dim(position))
    }

    pub fn symbol(&self, position: usize) -> AffineExpr {
        self.intern(AffineExprKind::Symbol(position))
    }

    pub fn constant(&self, value: i64) -> AffineExpr {
        self.intern(AffineExprKind::Constant(value))
    }

    pub fn as_dim(&self, expr: AffineExpr) -> Option<usize> {
        match self.kind(expr) {
            AffineExprKind::Dim(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_constant(&self, expr: AffineExpr) -> Option<i64> {
        match self.kind(expr) {
            AffineExprKind::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn add(&self, lhs: AffineExpr, rhs: AffineExpr) -> AffineExpr {
        match (self.as_constant(lhs), self.as_constant(rhs)) {
            (Some(a), Some(b)) => self.constant(a + b),
            (Some(0), None) => rhs,
            (None, Some(0)) => lhs,
            // Constants are kept on the right.
            (Some(_), None) => self.intern(AffineExprKind::Add(rhs, lhs)),
            _ => self.intern(AffineExprKind::Add(lhs, rhs)),
        }
    }

    pub fn sub(&self, lhs: AffineExpr, rhs: AffineExpr) -> AffineExpr {
        let neg = self.mul(rhs, self.constant(-1));
        self.add(lhs, neg)
    }

    pub fn mul(&self, lhs: AffineExpr, rhs: AffineExpr) -> AffineExpr {
        match (self.as_constant(lhs), self.as_constant(rhs)) {
            (Some(a), Some(b)) => self.constant(a * b),
            (Some(0), None) | (None, Some(0)) => self.constant(0),
            (Some(1), None) => rhs,
            (None, Some(1)) => lhs,
            (Some(_), None) => self.intern(AffineExprKind::Mul(rhs, lhs)),
            _ => self.intern(AffineExprKind::Mul(lhs, rhs)),
        }
    }

    pub fn modulo(&self, lhs: AffineExpr, rhs: AffineExpr) -> AffineExpr {
        match (self.as_constant(lhs), self.as_constant(rhs)) {
            (Some(a), Some(b)) if b != 0 => self.constant(modulo(a, b)),
            (_, Some(1)) => self.constant(0),
            _ => self.intern(AffineExprKind::Mod(lhs, rhs)),
        }
    }

    pub fn floor_div(&self, lhs: AffineExpr, rhs: AffineExpr) -> AffineExpr {
        match (self.as_constant(lhs), self.as_constant(rhs)) {
            (Some(a), Some(b)) if b != 0 => self.constant(floor_div(a, b)),
            (_, Some(1)) => lhs,
            _ => self.intern(AffineExprKind::FloorDiv(lhs, rhs)),
        }
    }

    pub fn ceil_div(&self, lhs: AffineExpr, rhs: AffineExpr) -> AffineExpr {
        match (self.as_constant(lhs), self.as_constant(rhs)) {
            (Some(a), Some(b)) if b != 0 => self.constant(ceil_div(a, b)),
            (_, Some(1)) => lhs,
            _ => self.intern(AffineExprKind::CeilDiv(lhs, rhs)),
        }
    }

    /// Rebuilds `expr` with every `d_i` replaced by `dims[i]` and every `s_i`
    /// by `symbols[i]`.
    pub fn replace_dims_and_symbols(
        &self,
        expr: AffineExpr,
        dims: &[AffineExpr],
        symbols: &[AffineExpr],
    ) -> AffineExpr {
        match self.kind(expr) {
            AffineExprKind::Dim(d) => dims[d],
            AffineExprKind::Symbol(s) => symbols[s],
            AffineExprKind::Constant(_) => expr,
            AffineExprKind::Add(l, r) => {
                let (l, r) = self.replace_pair(l, r, dims, symbols);
                self.add(l, r)
            }
            AffineExprKind::Mul(l, r) => {
                let (l, r) = self.replace_pair(l, r, dims, symbols);
                self.mul(l, r)
            }
            AffineExprKind::Mod(l, r) => {
                let (l, r) = self.replace_pair(l, r, dims, symbols);
                self.modulo(l, r)
            }
            AffineExprKind::FloorDiv(l, r) => {
                let (l, r) = self.replace_pair(l, r, dims, symbols);
                self.floor_div(l, r)
            }
            AffineExprKind::CeilDiv(l, r) => {
                let (l, r) = self.replace_pair(l, r, dims, symbols);
                self.ceil_div(l, r)
            }
        }
    }

    fn replace_pair(
        &self,
        lhs: AffineExpr,
        rhs: AffineExpr,
        dims: &[AffineExpr],
        symbols: &[AffineExpr],
    ) -> (AffineExpr, AffineExpr) {
        (
            self.replace_dims_and_symbols(lhs, dims, symbols),
            self.replace_dims_and_symbols(rhs, dims, symbols),
        )
    }

    /// Calls `f` for every dim occurrence in `expr`.
    pub fn walk_dims(&self, expr: AffineExpr, f: &mut impl FnMut(usize)) {
        match self.kind(expr) {
            AffineExprKind::Dim(d) => f(d),
            AffineExprKind::Symbol(_) | AffineExprKind::Constant(_) => {}
            AffineExprKind::Add(l, r)
            | AffineExprKind::Mul(l, r)
            | AffineExprKind::Mod(l, r)
            | AffineExprKind::FloorDiv(l, r)
            | AffineExprKind::CeilDiv(l, r) => {
                self.walk_dims(l, f);
                self.walk_dims(r, f);
            }
        }
    }

    pub fn eval(&self, expr: AffineExpr, dims: &[i64], symbols: &[i64]) -> i64 {
        match self.kind(expr) {
            AffineExprKind::Dim(d) => dims[d],
            AffineExprKind::Symbol(s) => symbols[s],
            AffineExprKind::Constant(c) => c,
            AffineExprKind::Add(l, r) => self.eval(l, dims, symbols) + self.eval(r, dims, symbols),
            AffineExprKind::Mul(l, r) => self.eval(l, dims, symbols) * self.eval(r, dims, symbols),
            AffineExprKind::Mod(l, r) => {
                modulo(self.eval(l, dims, symbols), self.eval(r, dims, symbols))
            }
            AffineExprKind::FloorDiv(l, r) => {
                floor_div(self.eval(l, dims, symbols), self.eval(r, dims, symbols))
            }
            AffineExprKind::CeilDiv(l, r) => {
                ceil_div(self.eval(l, dims, symbols), self.eval(r, dims, symbols))
            }
        }
    }

    pub fn display(&self, expr: AffineExpr) -> DisplayExpr<'_> {
        DisplayExpr { ctx: self, expr }
    }
}

pub struct DisplayExpr<'a> {
    ctx: &'a AffineContext,
    expr: AffineExpr,
}

impl fmt::Display for DisplayExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.ctx.kind(self.expr);
        match kind {
            AffineExprKind::Dim(d) => write!(f, "d{d}"),
            AffineExprKind::Symbol(s) => write!(f, "s{s}"),
            AffineExprKind::Constant(c) => write!(f, "{c}"),
            AffineExprKind::Add(l, r)
            | AffineExprKind::Mul(l, r)
            | AffineExprKind::Mod(l, r)
            | AffineExprKind::FloorDiv(l, r)
            | AffineExprKind::CeilDiv(l, r) => {
                let op = kind.operator().unwrap_or("?");
                write!(
                    f,
                    "({} {op} {})",
                    self.ctx.display(l),
                    self.ctx.display(r)
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let ctx = AffineContext::new();
        let a = ctx.add(ctx.dim(0), ctx.dim(1));
        let b = ctx.add(ctx.dim(0), ctx.dim(1));
        assert_eq!(a, b);
        assert_ne!(a, ctx.add(ctx.dim(1), ctx.dim(0)));
    }

    #[test]
    fn constant_folding() {
        let ctx = AffineContext::new();
        let d0 = ctx.dim(0);
        assert_eq!(ctx.add(d0, ctx.constant(0)), d0);
        assert_eq!(ctx.mul(ctx.constant(1), d0), d0);
        assert_eq!(ctx.mul(d0, ctx.constant(0)), ctx.constant(0));
        assert_eq!(
            ctx.floor_div(ctx.constant(-7), ctx.constant(2)),
            ctx.constant(-4)
        );
        assert_eq!(ctx.modulo(ctx.constant(-7), ctx.constant(2)), ctx.constant(1));
        assert_eq!(ctx.ceil_div(ctx.constant(7), ctx.constant(2)), ctx.constant(4));
    }

    #[test]
    fn replace_and_eval() {
        let ctx = AffineContext::new();
        // d0 * 4 + d1
        let e = ctx.add(ctx.mul(ctx.dim(0), ctx.constant(4)), ctx.dim(1));
        assert_eq!(ctx.eval(e, &[2, 3], &[]), 11);
        let swapped = ctx.replace_dims_and_symbols(e, &[ctx.dim(1), ctx.dim(0)], &[]);
        assert_eq!(ctx.eval(swapped, &[2, 3], &[]), 14);
        assert_eq!(ctx.display(e).to_string(), "((d0 * 4) + d1)");
    }
}
