//! Error codes of fatal optimizer failures
//!
//! Every fatal condition the optimizer can report carries a stable code so
//! compilation failures can be matched in logs and bug reports.
//!
//! - E5000-E5999: the input graph has a shape the pass does not accept
//! - E9000-E9999: internal inconsistencies of the analysis
//!
//! Within each range the hundreds digit selects the pass; 1 is the partial
//! escape analysis.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    pub code: u16,
    pub category: &'static str,
    pub description: &'static str,
    pub help: Option<&'static str>,
}

impl ErrorCode {
    /// "E9101" style rendering
    pub fn format_code(&self) -> String {
        format_error_code(self.code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.format_code(), self.category, self.description)?;
        if let Some(help) = self.help {
            write!(f, " (help: {})", help)?;
        }
        Ok(())
    }
}

pub const CFG_UNSUPPORTED: u16 = 5101;
pub const GRAPH_MUTATION_FAILED: u16 = 5102;
pub const LOCK_COUNT_MISMATCH: u16 = 9101;
pub const MONITOR_UNDERFLOW: u16 = 9102;
pub const UNRESOLVED_MATERIALIZATION_CYCLE: u16 = 9103;
pub const LOOP_ITERATION_LIMIT: u16 = 9104;
pub const BLOCK_SCHEDULE_STUCK: u16 = 9105;
pub const MISSING_LOOP_STATE: u16 = 9106;
pub const INVALID_GRAPH: u16 = 9107;
pub const UNKNOWN: u16 = 9999;

const fn code(
    code: u16,
    category: &'static str,
    description: &'static str,
    help: Option<&'static str>,
) -> ErrorCode {
    ErrorCode {
        code,
        category,
        description,
        help,
    }
}

/// Every registered code, sorted by number.
pub static ERROR_CODES: &[ErrorCode] = &[
    code(
        CFG_UNSUPPORTED,
        "Graph shape",
        "Control flow shape not supported by escape analysis",
        Some("split critical edges and loop exits before running the pass"),
    ),
    code(
        GRAPH_MUTATION_FAILED,
        "Graph shape",
        "Applying a recorded graph edit failed",
        None,
    ),
    code(
        LOCK_COUNT_MISMATCH,
        "Internal",
        "Virtual object lock counts disagree at a merge",
        None,
    ),
    code(
        MONITOR_UNDERFLOW,
        "Internal",
        "Monitor exit on a virtual object that holds no lock",
        None,
    ),
    code(
        UNRESOLVED_MATERIALIZATION_CYCLE,
        "Internal",
        "Materialization cycle could not be resolved",
        None,
    ),
    code(
        LOOP_ITERATION_LIMIT,
        "Internal",
        "Loop state did not converge within the iteration limit",
        Some("raise max_loop_iterations or report the graph that triggers it"),
    ),
    code(
        BLOCK_SCHEDULE_STUCK,
        "Internal",
        "No block on the worklist can be processed",
        None,
    ),
    code(
        MISSING_LOOP_STATE,
        "Internal",
        "Loop back edge or exit was never reached",
        None,
    ),
    code(
        INVALID_GRAPH,
        "Internal",
        "Graph is inconsistent with the analysis state",
        None,
    ),
    code(UNKNOWN, "Internal", "Unknown error", None),
];

pub fn lookup(code: u16) -> Option<&'static ErrorCode> {
    ERROR_CODES
        .binary_search_by_key(&code, |c| c.code)
        .ok()
        .map(|index| &ERROR_CODES[index])
}

/// Look up a code written as "E9101".
pub fn lookup_str(code: &str) -> Option<&'static ErrorCode> {
    parse_error_code(code).and_then(lookup)
}

pub fn is_registered(code: u16) -> bool {
    lookup(code).is_some()
}

/// Registered codes in `start..=end`.
pub fn codes_in_range(start: u16, end: u16) -> impl Iterator<Item = &'static ErrorCode> {
    ERROR_CODES
        .iter()
        .filter(move |c| (start..=end).contains(&c.code))
}

pub fn format_error_code(code: u16) -> String {
    format!("E{:04}", code)
}

pub fn parse_error_code(code: &str) -> Option<u16> {
    code.strip_prefix('E')?.parse::<u16>().ok()
}
