//! Partial escape analysis and scalar replacement
//!
//! Allocations that do not escape on a control-flow path are replaced by
//! their field values on that path. An allocation is only performed for real
//! ("materialized") where the object escapes, which may be on some branches
//! and not others.
//!
//! The pass is split into:
//! - [`block_iterator`]: generic, reentrant walk over blocks, merges and loops
//! - [`state`]: the abstract per-path state of virtual objects
//! - [`effects`]: deferred graph edits with checkpoint/backtrack
//! - [`context`], [`virtualize`], [`merge`], [`loops`]: the transfer functions
//! - [`phase`]: entry points that run the analysis and apply its results

pub mod block_iterator;
pub mod closure;
pub mod config;
pub mod context;
pub mod effects;
pub mod error;
pub mod loops;
pub mod merge;
pub mod phase;
pub mod state;
pub mod stats;
pub mod virtualize;

pub use block_iterator::{BlockIteratorClosure, ControlEdge, LoopInfo, MergeableBlockState};
pub use closure::PartialEscapeClosure;
pub use config::EscapeAnalysisConfig;
pub use effects::{Checkpoint, Effect, EffectList};
pub use error::EscapeAnalysisError;
pub use phase::{EscapeAnalysisReport, PartialEscapePhase};
pub use state::{BlockState, ObjectContents, ObjectState, VirtualObjectDescriptor};
pub use stats::EscapeAnalysisStats;
pub use virtualize::{classify, NodeCategory};
