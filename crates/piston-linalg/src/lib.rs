//! # Structured-op fusion
//!
//! Elementwise fusion, reshape folding and iteration-space collapsing for a
//! small tensor IR whose structured operations (generic, fill, copy,
//! transpose) describe their operand accesses with affine index maps.
//!
//! ## Overview
//!
//! - [`affine`](crate::AffineMap) - interned affine expressions and maps
//! - [`Graph`] / [`Rewriter`] - the IR arena and its transactional editor
//! - [`fusion`] - producer/consumer fusion, reshape expansion and collapsing,
//!   and the point-wise cleanups that make more fusion possible
//! - [`PatternSet`] / [`apply_patterns_greedily`] - the fixpoint driver
//! - [`interp`] - a reference evaluator used to check that rewrites preserve
//!   semantics, and by the constant folder

macro_rules! rvec {
    ($($x:tt)*) => {
        smallvec::smallvec![$($x)*]
    };
}

mod affine;
mod config;
mod error;
pub mod fusion;
pub mod interp;
mod ir;
mod pattern;
mod reassociation;

pub use affine::*;
pub use config::*;
pub use error::*;
pub use ir::*;
pub use pattern::*;
pub use reassociation::*;

pub type RVec<T> = smallvec::SmallVec<[T; 4]>;

pub type HashMap<K, V> =
    std::collections::HashMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
pub type HashSet<K> =
    std::collections::HashSet<K, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
