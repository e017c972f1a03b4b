//! Fatal escape analysis failures
//!
//! Forced materialization is the fallback for everything the analysis cannot
//! prove; the variants here are the conditions that mean the analysis's model
//! of the graph is inconsistent. They abort the compilation and are never
//! retried.

use crate::error_codes;
use crate::ir::{BlockId, CfgError, GraphError, NodeId, VirtualObjectId};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeAnalysisError {
    /// Predecessors of a merge disagree on an object's lock count
    LockCountMismatch {
        merge: BlockId,
        object: VirtualObjectId,
    },

    /// Monitor exit on a virtual object whose lock count is already zero
    MonitorUnderflow {
        node: NodeId,
        object: VirtualObjectId,
    },

    /// A deferred field patch refers to an object that was never materialized
    UnresolvedMaterializationCycle { object: VirtualObjectId },

    /// Loop processing did not reach a fixpoint
    LoopIterationLimit { header: BlockId, attempts: usize },

    /// Every block left on the worklist waits for a state that never arrives
    BlockScheduleStuck { pending: Vec<BlockId> },

    /// A loop back edge or exit produced no state
    MissingLoopState { header: BlockId, block: BlockId },

    /// The control flow does not have the shape the iterator needs
    UnsupportedControlFlow(CfgError),

    /// Applying a recorded edit failed
    Graph(GraphError),

    /// Any other inconsistency between graph and analysis state
    InvalidGraph(String),
}

impl EscapeAnalysisError {
    /// Registered error code of this failure.
    pub fn code(&self) -> u16 {
        match self {
            EscapeAnalysisError::LockCountMismatch { .. } => error_codes::LOCK_COUNT_MISMATCH,
            EscapeAnalysisError::MonitorUnderflow { .. } => error_codes::MONITOR_UNDERFLOW,
            EscapeAnalysisError::UnresolvedMaterializationCycle { .. } => {
                error_codes::UNRESOLVED_MATERIALIZATION_CYCLE
            }
            EscapeAnalysisError::LoopIterationLimit { .. } => error_codes::LOOP_ITERATION_LIMIT,
            EscapeAnalysisError::BlockScheduleStuck { .. } => error_codes::BLOCK_SCHEDULE_STUCK,
            EscapeAnalysisError::MissingLoopState { .. } => error_codes::MISSING_LOOP_STATE,
            EscapeAnalysisError::UnsupportedControlFlow(_) => error_codes::CFG_UNSUPPORTED,
            EscapeAnalysisError::Graph(_) => error_codes::GRAPH_MUTATION_FAILED,
            EscapeAnalysisError::InvalidGraph(_) => error_codes::INVALID_GRAPH,
        }
    }
}

impl fmt::Display for EscapeAnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", error_codes::format_error_code(self.code()))?;
        match self {
            EscapeAnalysisError::LockCountMismatch { merge, object } => {
                write!(f, "lock count of {} differs between predecessors of {}", object, merge)
            }
            EscapeAnalysisError::MonitorUnderflow { node, object } => {
                write!(f, "{} releases {} which holds no lock", node, object)
            }
            EscapeAnalysisError::UnresolvedMaterializationCycle { object } => {
                write!(f, "materialization cycle through {} left unresolved", object)
            }
            EscapeAnalysisError::LoopIterationLimit { header, attempts } => {
                write!(f, "loop at {} did not converge after {} attempts", header, attempts)
            }
            EscapeAnalysisError::BlockScheduleStuck { pending } => {
                write!(f, "no block ready among {:?}", pending)
            }
            EscapeAnalysisError::MissingLoopState { header, block } => {
                write!(f, "loop at {} produced no state for {}", header, block)
            }
            EscapeAnalysisError::UnsupportedControlFlow(err) => write!(f, "{}", err),
            EscapeAnalysisError::Graph(err) => write!(f, "{}", err),
            EscapeAnalysisError::InvalidGraph(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for EscapeAnalysisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EscapeAnalysisError::UnsupportedControlFlow(err) => Some(err),
            EscapeAnalysisError::Graph(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CfgError> for EscapeAnalysisError {
    fn from(err: CfgError) -> Self {
        EscapeAnalysisError::UnsupportedControlFlow(err)
    }
}

impl From<GraphError> for EscapeAnalysisError {
    fn from(err: GraphError) -> Self {
        EscapeAnalysisError::Graph(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = EscapeAnalysisError::LoopIterationLimit {
            header: BlockId::new(2),
            attempts: 10,
        };
        assert_eq!(
            err.to_string(),
            "E9104: loop at bb2 did not converge after 10 attempts"
        );
    }

    #[test]
    fn test_codes_are_registered() {
        let errors = [
            EscapeAnalysisError::InvalidGraph("x".into()),
            EscapeAnalysisError::BlockScheduleStuck { pending: vec![] },
            EscapeAnalysisError::from(CfgError::MissingEntryBlock),
            EscapeAnalysisError::from(GraphError::MissingNode(NodeId::new(1))),
        ];
        for err in &errors {
            assert!(error_codes::is_registered(err.code()));
        }
    }
}
