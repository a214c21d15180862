use derive_new::new;
use serde::{Deserialize, Serialize};

/// Which rewrites [`ElementwiseFusionPass`](crate::fusion::ElementwiseFusionPass)
/// registers, and how long it may run.
#[derive(new, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub max_iterations: usize,
    /// Fuse producers whose results have more than one use, keeping the
    /// producer alive for the other users.
    pub fuse_multi_use_producers: bool,
    pub fold_reshapes_by_expansion: bool,
    pub fold_reshapes_by_collapsing: bool,
    pub fuse_pad_with_producer: bool,
    /// Inline scalar and splat constants into consumers, and fold fills.
    pub fold_constants: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self::new(10, false, true, false, false, true)
    }
}

impl FusionConfig {
    pub fn greedy(&self) -> GreedyRewriteConfig {
        GreedyRewriteConfig::new(self.max_iterations, true)
    }
}

#[derive(new, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreedyRewriteConfig {
    /// Upper bound on full sweeps over the top-level ops.
    pub max_iterations: usize,
    /// Erase unused side-effect-free ops after every sweep.
    pub erase_dead_ops: bool,
}

impl Default for GreedyRewriteConfig {
    fn default() -> Self {
        Self::new(10, true)
    }
}
