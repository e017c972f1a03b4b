//! Logging setup for the optimizer
//!
//! The passes log through the `log` facade; binaries and tests pick an
//! `env_logger` backend here. Levels are used as follows:
//!
//! - `warn!` - suspicious graphs the pass still handled (dangling obsolete nodes)
//! - `debug!` - per-graph and per-loop summaries
//! - `trace!` - every node visit, merge round and recorded effect
//!
//! Set `RUST_LOG` to control logging at runtime, optionally per module:
//!
//! ```bash
//! RUST_LOG=pea_compiler::ea=debug cargo test
//! RUST_LOG=pea_compiler::ea::effects=trace cargo bench
//! ```

use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Filter that shows the recorded effect lists of the escape analysis.
pub const EFFECT_TRACE_FILTER: &str = "warn,pea_compiler::ea::effects=trace";

/// Builder with the optimizer's record format and nothing enabled yet.
fn builder() -> Builder {
    let mut builder = Builder::new();
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{:5}] {} - {}",
            record.level(),
            record.module_path().unwrap_or("?"),
            record.args()
        )
    });
    builder
}

/// Warn level. Later calls to any `init*` function are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| builder().filter_level(level).init());
}

/// Initialize from `env_logger` directives such as [`EFFECT_TRACE_FILTER`].
pub fn init_with_filters(filters: &str) {
    INIT.call_once(|| builder().parse_filters(filters).init());
}

/// Initialize from `RUST_LOG`, defaulting to Warn.
pub fn init_from_env() {
    INIT.call_once(|| {
        builder()
            .parse_env(Env::default().default_filter_or("warn"))
            .init()
    });
}

/// Captured output for tests, quiet unless `RUST_LOG` says otherwise.
/// Safe to call from every test.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .parse_env("RUST_LOG")
        .is_test(true)
        .try_init();
}

/// Whether one of the non-test `init*` functions ran.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
