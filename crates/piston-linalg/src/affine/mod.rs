//! Affine index-map algebra.
//!
//! Expressions are interned in an [`AffineContext`]; [`AffineMap`] values
//! reference them by handle. Everything the fusion transforms need lives
//! here: composition, inversion, concatenation and permutation tests.

mod expr;
mod map;

pub use expr::*;
pub use map::*;
