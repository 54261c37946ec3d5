//! CLI entrypoint for poolguard trace tooling.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

/// Trace replay and log tooling for poolguard.
#[derive(Debug, Parser)]
#[command(name = "poolguard-harness")]
#[command(about = "Replay pool operation traces against the poolguard runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a JSON trace on a fresh runtime and print the summary.
    Replay {
        /// Trace JSON path.
        #[arg(long)]
        trace: PathBuf,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Output path for the summary JSON (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Exit with an error when the replay reported any fault.
        #[arg(long)]
        fail_on_fault: bool,
    },
    /// Emit the violation taxonomy as JSON.
    Taxonomy {
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn write_output(output: Option<&Path>, body: &str) -> std::io::Result<()> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, body)?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{body}"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            trace,
            log,
            output,
            fail_on_fault,
        } => {
            eprintln!("Replaying {}", trace.display());
            let summary = poolguard_harness::replay_file(&trace, log.as_deref())?;
            eprintln!(
                "{}: {}/{} ops, {} warnings, {} faults{}",
                summary.name,
                summary.ops_executed,
                summary.ops_total,
                summary.warnings,
                summary.faults,
                if summary.terminated { ", terminated" } else { "" },
            );
            write_output(output.as_deref(), &serde_json::to_string_pretty(&summary)?)?;
            if fail_on_fault && summary.faults > 0 {
                return Err(format!("replay reported {} faults", summary.faults).into());
            }
        }
        Command::Taxonomy { output } => {
            let body = serde_json::to_string_pretty(&poolguard_harness::taxonomy())?;
            write_output(output.as_deref(), &body)?;
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = poolguard_harness::structured_log::validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!("{} invalid fields in {lines} lines", errors.len()).into());
            }
            eprintln!("{lines} lines valid");
        }
    }

    Ok(())
}
