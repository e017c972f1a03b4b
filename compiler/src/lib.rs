//! Partial escape analysis for a block-structured JIT graph IR
//!
//! - [`ir`]: the graph, its builder, control-flow metadata and generic passes
//! - [`ea`]: the partial escape analysis itself
//! - [`error_codes`]: stable codes for fatal optimizer errors
//! - [`logging`]: `env_logger` setup for binaries and tests

pub mod ea;
pub mod error_codes;
pub mod ir;
pub mod logging;

pub use ea::{EscapeAnalysisConfig, EscapeAnalysisError, EscapeAnalysisReport, PartialEscapePhase};
