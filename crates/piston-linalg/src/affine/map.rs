use std::collections::BTreeSet;
use std::fmt;

use super::{AffineContext, AffineExpr};
use crate::RVec;

/// A multi-result affine function `(d0, .., dn)[s0, .., sk] -> (e0, .., em)`.
///
/// Maps are plain values; their result expressions live in an
/// [`AffineContext`] which every structural query takes by reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffineMap {
    num_dims: usize,
    num_symbols: usize,
    results: RVec<AffineExpr>,
}

impl AffineMap {
    pub fn new(num_dims: usize, num_symbols: usize, results: impl Into<RVec<AffineExpr>>) -> Self {
        Self {
            num_dims,
            num_symbols,
            results: results.into(),
        }
    }

    /// A map over `num_dims` dims with no results, e.g. the map of a scalar
    /// operand.
    pub fn empty(num_dims: usize) -> Self {
        Self::new(num_dims, 0, RVec::new())
    }

    pub fn identity(ctx: &AffineContext, num_dims: usize) -> Self {
        let results = (0..num_dims).map(|d| ctx.dim(d)).collect::<RVec<_>>();
        Self::new(num_dims, 0, results)
    }

    /// `(d0, .., dn) -> (d_perm[0], .., d_perm[n])`.
    pub fn permutation(ctx: &AffineContext, permutation: &[usize]) -> Self {
        debug_assert!(is_permutation_vector(permutation));
        Self::from_dims(ctx, permutation.len(), permutation)
    }

    /// A map over `num_dims` dims whose results are the listed dims.
    pub fn from_dims(ctx: &AffineContext, num_dims: usize, dims: &[usize]) -> Self {
        let results = dims.iter().map(|&d| ctx.dim(d)).collect::<RVec<_>>();
        Self::new(num_dims, 0, results)
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn num_symbols(&self) -> usize {
        self.num_symbols
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    pub fn results(&self) -> &[AffineExpr] {
        &self.results
    }

    pub fn result(&self, idx: usize) -> AffineExpr {
        self.results[idx]
    }

    /// True for the 0-d map `() -> ()`.
    pub fn is_empty(&self) -> bool {
        self.num_dims == 0 && self.num_symbols == 0 && self.results.is_empty()
    }

    /// The dim named by result `idx`, if that result is a bare dim.
    pub fn dim_position(&self, ctx: &AffineContext, idx: usize) -> Option<usize> {
        ctx.as_dim(self.results[idx])
    }

    pub fn is_projected_permutation(&self, ctx: &AffineContext) -> bool {
        if self.num_symbols > 0 || self.results.len() > self.num_dims {
            return false;
        }
        let mut seen = vec![false; self.num_dims];
        for &expr in &self.results {
            match ctx.as_dim(expr) {
                Some(d) if !seen[d] => seen[d] = true,
                _ => return false,
            }
        }
        true
    }

    pub fn is_permutation(&self, ctx: &AffineContext) -> bool {
        self.num_dims == self.results.len() && self.is_projected_permutation(ctx)
    }

    pub fn is_identity(&self, ctx: &AffineContext) -> bool {
        self.num_dims == self.results.len()
            && self
                .results
                .iter()
                .enumerate()
                .all(|(i, &e)| ctx.as_dim(e) == Some(i))
    }

    /// `self ∘ other`: the dims of `self` are replaced by the results of
    /// `other`. The composed map ranges over `other`'s dims; symbols of
    /// `other` come first, followed by the symbols of `self`.
    pub fn compose(&self, ctx: &AffineContext, other: &AffineMap) -> AffineMap {
        debug_assert_eq!(
            self.num_dims,
            other.num_results(),
            "composing maps with mismatched arity"
        );
        let symbols = (0..self.num_symbols)
            .map(|s| ctx.symbol(other.num_symbols + s))
            .collect::<Vec<_>>();
        let results = self
            .results
            .iter()
            .map(|&e| ctx.replace_dims_and_symbols(e, &other.results, &symbols))
            .collect::<RVec<_>>();
        AffineMap::new(other.num_dims, other.num_symbols + self.num_symbols, results)
    }

    /// Keeps only the results at `positions`, in that order.
    pub fn sub_map(&self, positions: &[usize]) -> AffineMap {
        let results = positions
            .iter()
            .map(|&p| self.results[p])
            .collect::<RVec<_>>();
        AffineMap::new(self.num_dims, self.num_symbols, results)
    }

    pub fn referenced_dims(&self, ctx: &AffineContext) -> BTreeSet<usize> {
        let mut dims = BTreeSet::new();
        for &e in &self.results {
            ctx.walk_dims(e, &mut |d| {
                dims.insert(d);
            });
        }
        dims
    }

    /// For a projected permutation, picks `values[d]` for every result `d`.
    pub fn apply_permutation<T: Clone>(&self, ctx: &AffineContext, values: &[T]) -> Vec<T> {
        debug_assert!(self.is_projected_permutation(ctx));
        self.results
            .iter()
            .filter_map(|&e| ctx.as_dim(e))
            .map(|d| values[d].clone())
            .collect()
    }

    pub fn eval(&self, ctx: &AffineContext, dims: &[i64]) -> Vec<i64> {
        self.results.iter().map(|&e| ctx.eval(e, dims, &[])).collect()
    }

    pub fn display<'a>(&'a self, ctx: &'a AffineContext) -> DisplayMap<'a> {
        DisplayMap { ctx, map: self }
    }
}

pub struct DisplayMap<'a> {
    ctx: &'a AffineContext,
    map: &'a AffineMap,
}

impl fmt::Display for DisplayMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = (0..self.map.num_dims)
            .map(|d| format!("d{d}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "({dims})")?;
        if self.map.num_symbols > 0 {
            let syms = (0..self.map.num_symbols)
                .map(|s| format!("s{s}"))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "[{syms}]")?;
        }
        let results = self
            .map
            .results
            .iter()
            .map(|&e| self.ctx.display(e).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, " -> ({results})")
    }
}

/// Inverts the "shapes to loops" direction of `map`.
///
/// For every dim the first result naming it is selected; the returned map
/// goes from the `num_results` results back to the `num_dims` dims. Returns
/// `None` when some dim is never named by a bare-dim result. The 0-d map is
/// its own inverse.
pub fn inverse_permutation(ctx: &AffineContext, map: &AffineMap) -> Option<AffineMap> {
    if map.is_empty() {
        return Some(map.clone());
    }
    debug_assert_eq!(map.num_symbols, 0, "inverting a map with symbols");
    let mut first_use = vec![None; map.num_dims];
    for (i, &e) in map.results.iter().enumerate() {
        if let Some(d) = ctx.as_dim(e) {
            if first_use[d].is_none() {
                first_use[d] = Some(i);
            }
        }
    }
    let results = first_use
        .into_iter()
        .map(|pos| pos.map(|p| ctx.dim(p)))
        .collect::<Option<RVec<_>>>()?;
    Some(AffineMap::new(map.num_results(), 0, results))
}

/// Concatenates the results of `maps`. The result ranges over the largest
/// domain among them. `None` for an empty list.
pub fn concat_affine_maps(maps: &[AffineMap]) -> Option<AffineMap> {
    if maps.is_empty() {
        return None;
    }
    let num_dims = maps.iter().map(|m| m.num_dims).max().unwrap_or(0);
    let num_symbols = maps.iter().map(|m| m.num_symbols).max().unwrap_or(0);
    let results = maps
        .iter()
        .flat_map(|m| m.results.iter().copied())
        .collect::<RVec<_>>();
    Some(AffineMap::new(num_dims, num_symbols, results))
}

pub fn is_permutation_vector(permutation: &[usize]) -> bool {
    let mut seen = vec![false; permutation.len()];
    for &p in permutation {
        if p >= permutation.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

pub fn invert_permutation_vector(permutation: &[usize]) -> RVec<usize> {
    debug_assert!(is_permutation_vector(permutation));
    let mut inverse = smallvec::smallvec![0; permutation.len()];
    for (i, &p) in permutation.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}
