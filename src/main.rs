//! pea - run the partial escape analysis on sample graphs
//!
//! # Usage
//!
//! ```bash
//! # List the built-in sample graphs
//! pea list
//!
//! # Analyze a sample and apply the result
//! pea run counter-loop
//!
//! # Show the recorded effects, as JSON
//! pea run cycle --effects --format json
//!
//! # Use settings from a config file
//! pea run point-merge --config pea.toml
//!
//! # Print the effective configuration
//! pea config --config pea.toml
//! ```

mod samples;

use clap::{Parser, Subcommand, ValueEnum};
use pea_compiler::ea::{EscapeAnalysisConfig, EscapeAnalysisStats};
use pea_compiler::ir::validation::validate_graph;
use pea_compiler::{logging, PartialEscapePhase};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "pea")]
#[command(version = "0.1.0")]
#[command(about = "Partial escape analysis on sample graphs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a sample graph
    Run {
        /// Name of the sample (see `pea list`)
        sample: String,

        /// TOML file with an [escape_analysis] table
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the recorded effects
        #[arg(long)]
        effects: bool,

        /// Only analyze, leave the graph unchanged
        #[arg(long)]
        dry_run: bool,

        /// Log every recorded effect
        #[arg(long)]
        trace: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List the sample graphs
    List,

    /// Print the effective configuration
    Config {
        /// TOML file with an [escape_analysis] table
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    sample: &'a str,
    nodes_before: usize,
    nodes_after: usize,
    unclassified_usage: bool,
    stats: &'a EscapeAnalysisStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    effects: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            sample,
            config,
            effects,
            dry_run,
            trace,
            format,
        } => run_sample(&sample, config.as_deref(), effects, dry_run, trace, format),
        Commands::List => {
            list_samples();
            Ok(())
        }
        Commands::Config { config } => show_config(config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<EscapeAnalysisConfig, String> {
    let config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            EscapeAnalysisConfig::from_toml_str(&content)?
        }
        None => EscapeAnalysisConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn run_sample(
    name: &str,
    config: Option<&Path>,
    show_effects: bool,
    dry_run: bool,
    trace: bool,
    format: OutputFormat,
) -> Result<(), String> {
    let mut config = load_config(config)?;
    if trace {
        config.trace_effects = true;
        logging::init_with_filters(logging::EFFECT_TRACE_FILTER);
    } else {
        logging::init_from_env();
    }

    let sample = samples::find(name).ok_or_else(|| format!("Unknown sample '{}', see `pea list`", name))?;
    let mut graph = sample.build()?;
    let nodes_before = graph.node_count();

    let phase = PartialEscapePhase::new(config);
    let report = if dry_run {
        phase.analyze(&graph)
    } else {
        phase.run(&mut graph)
    }
    .map_err(|e| e.to_string())?;

    if let Err(errors) = validate_graph(&graph) {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(format!("Graph invalid after analysis: {}", messages.join("; ")));
    }

    let output = RunOutput {
        sample: sample.name,
        nodes_before,
        nodes_after: graph.node_count(),
        unclassified_usage: report.unclassified_usage,
        stats: &report.stats,
        effects: if show_effects {
            report.effects.iter().map(|e| e.to_string()).collect()
        } else {
            Vec::new()
        },
    };

    match format {
        OutputFormat::Text => {
            println!("{}: {}", output.sample, output.stats);
            println!("  nodes: {} -> {}", output.nodes_before, output.nodes_after);
            if output.unclassified_usage {
                println!("  note: a node without an escape rule forced a materialization");
            }
            for effect in &output.effects {
                println!("  {}", effect);
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&output)
                .map_err(|e| format!("Failed to serialize report: {}", e))?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn list_samples() {
    for sample in samples::SAMPLES {
        println!("{:<14} {}", sample.name, sample.description);
    }
}

fn show_config(path: Option<&Path>) -> Result<(), String> {
    let config = load_config(path)?;
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    println!("{}", json);
    Ok(())
}
