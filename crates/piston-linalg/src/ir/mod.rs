//! The host IR: a single-function SSA graph of structured tensor ops.

mod builders;
mod graph;
mod op;
mod printer;
mod rewriter;
mod structured;
mod types;
mod value;

pub use graph::*;
pub use op::*;
pub use rewriter::*;
pub use types::*;
pub use value::*;
