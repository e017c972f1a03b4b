//! Escape analysis configuration
//!
//! Defaults can be overridden from the environment or from the
//! `[escape_analysis]` table of a TOML file:
//!
//! ```toml
//! [escape_analysis]
//! max_loop_iterations = 16
//! trace_effects = true
//! ```

use serde::{Deserialize, Serialize};

/// Tuning knobs of the partial escape analysis
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EscapeAnalysisConfig {
    /// Run the analysis at all
    pub enabled: bool,

    /// Attempts per loop before giving up with a fatal error
    pub max_loop_iterations: usize,

    /// Longest array allocation that is virtualized
    pub max_virtual_array_length: usize,

    /// Largest class layout that is virtualized
    pub max_virtual_fields: usize,

    /// Log the recorded effects before applying them
    pub trace_effects: bool,
}

impl Default for EscapeAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_loop_iterations: 10,
            max_virtual_array_length: 32,
            max_virtual_fields: 64,
            trace_effects: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    escape_analysis: EscapeAnalysisConfig,
}

impl EscapeAnalysisConfig {
    /// Development preset: effect tracing on
    pub fn development() -> Self {
        Self {
            trace_effects: true,
            ..Self::default()
        }
    }

    /// Release preset
    pub fn release() -> Self {
        Self::default()
    }

    /// Apply `PEA_DISABLE`, `PEA_MAX_LOOP_ITERATIONS` and `PEA_TRACE_EFFECTS`.
    pub fn with_env_overrides(mut self) -> Self {
        if std::env::var("PEA_DISABLE").is_ok() {
            self.enabled = false;
        }
        if let Some(limit) = std::env::var("PEA_MAX_LOOP_ITERATIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.max_loop_iterations = limit;
        }
        if std::env::var("PEA_TRACE_EFFECTS").is_ok() {
            self.trace_effects = true;
        }
        self
    }

    /// Parse the `[escape_analysis]` table of a TOML document. Missing keys
    /// keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| format!("Failed to parse escape analysis config: {}", e))?;
        Ok(file.escape_analysis)
    }
}
