//! Graph Validation
//!
//! Structural checks run after a pass has mutated a graph: references must
//! point to live nodes, schedules must agree with node block assignments,
//! and phis must have one input per predecessor.

use super::{BlockId, Graph, NodeId, NodeKind};
use std::fmt;

/// Types of validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// A live node refers to a removed node
    DanglingReference { node: NodeId, missing: NodeId },

    /// A block schedule lists a removed node
    ScheduledMissingNode { block: BlockId, node: NodeId },

    /// A scheduled node claims a different block
    BlockMismatch { node: NodeId, block: BlockId },

    /// Phi input count differs from the predecessor count
    PhiArity { phi: NodeId, expected: usize, found: usize },

    /// A control transfer node is not last in its block
    MisplacedControlTransfer { block: BlockId, node: NodeId },
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationErrorKind::DanglingReference { node, missing } => {
                write!(f, "{} references removed node {}", node, missing)
            }
            ValidationErrorKind::ScheduledMissingNode { block, node } => {
                write!(f, "{} schedules removed node {}", block, node)
            }
            ValidationErrorKind::BlockMismatch { node, block } => {
                write!(f, "{} is scheduled in {} but claims another block", node, block)
            }
            ValidationErrorKind::PhiArity {
                phi,
                expected,
                found,
            } => write!(f, "phi {} has {} inputs, expected {}", phi, found, expected),
            ValidationErrorKind::MisplacedControlTransfer { block, node } => {
                write!(f, "{} in {} is not the last node", node, block)
            }
        }
    }
}

/// Check the structural invariants of `graph`.
pub fn validate_graph(graph: &Graph) -> Result<(), Vec<ValidationErrorKind>> {
    let mut errors = Vec::new();

    for (id, node) in graph.live_nodes() {
        for referenced in node.references() {
            if !graph.contains(referenced) {
                errors.push(ValidationErrorKind::DanglingReference {
                    node: id,
                    missing: referenced,
                });
            }
        }
    }

    for block in graph.blocks() {
        for (index, &node_id) in block.nodes.iter().enumerate() {
            let Some(node) = graph.node(node_id) else {
                errors.push(ValidationErrorKind::ScheduledMissingNode {
                    block: block.id,
                    node: node_id,
                });
                continue;
            };
            if node.block != Some(block.id) {
                errors.push(ValidationErrorKind::BlockMismatch {
                    node: node_id,
                    block: block.id,
                });
            }
            if node.kind.is_control_transfer() && index + 1 != block.nodes.len() {
                errors.push(ValidationErrorKind::MisplacedControlTransfer {
                    block: block.id,
                    node: node_id,
                });
            }
        }

        for &phi in &block.phis {
            match graph.node(phi) {
                Some(node) if matches!(node.kind, NodeKind::Phi { .. }) => {
                    if node.inputs.len() != block.predecessors.len() {
                        errors.push(ValidationErrorKind::PhiArity {
                            phi,
                            expected: block.predecessors.len(),
                            found: node.inputs.len(),
                        });
                    }
                }
                _ => errors.push(ValidationErrorKind::ScheduledMissingNode {
                    block: block.id,
                    node: phi,
                }),
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
