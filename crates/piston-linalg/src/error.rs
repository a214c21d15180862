use std::borrow::Cow;

use crate::{OpId, ReassociationIndices, ValueId};

/// Why a rewrite did not happen.
///
/// Match failures are the normal "not applicable" outcome of a pattern; the
/// driver rolls back whatever the attempt created and moves on.
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("Match failure on {op:?}: {reason}")]
    MatchFailure {
        op: OpId,
        reason: Cow<'static, str>,
    },
    #[error("Pattern not applicable.")]
    NotApplicable,
    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

impl FusionError {
    pub fn is_match_failure(&self) -> bool {
        matches!(
            self,
            FusionError::MatchFailure { .. } | FusionError::NotApplicable
        )
    }
}

pub type FusionResult<T> = Result<T, FusionError>;

/// Structural violations reported by [`Graph::verify`](crate::Graph::verify).
#[derive(Debug, thiserror::Error)]
pub enum InvariantError {
    #[error("{op} expects {expected} operands, found {actual}.")]
    OperandCount {
        op: String,
        expected: usize,
        actual: usize,
    },
    #[error("{op} has {maps} indexing maps for {operands} operands.")]
    IndexingMapCount {
        op: String,
        maps: usize,
        operands: usize,
    },
    #[error("Indexing map {index} of {op} ranges over {actual} dims, expected {expected}.")]
    MapArity {
        op: String,
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Indexing map {index} of {op} has {actual} results for an operand of rank {expected}.")]
    MapRank {
        op: String,
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Region of {op} has {actual} arguments, expected {expected}.")]
    RegionArity {
        op: String,
        expected: usize,
        actual: usize,
    },
    #[error("Block of {op} does not end in a terminator.")]
    MissingTerminator { op: String },
    #[error("Terminator of {op} yields {actual} values, expected {expected}.")]
    YieldArity {
        op: String,
        expected: usize,
        actual: usize,
    },
    #[error("{op} uses {value:?} which is not visible at that point.")]
    UseBeforeDef { op: String, value: ValueId },
    #[error("Invalid reassociation {reassociation:?} between ranks {collapsed} and {expanded}.")]
    Reassociation {
        reassociation: Vec<ReassociationIndices>,
        collapsed: usize,
        expanded: usize,
    },
}
