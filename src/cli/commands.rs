//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cirrus - declarative resource reconciliation.
#[derive(Parser, Debug)]
#[command(name = "cirrus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the stack file.
    #[arg(short, long, global = true, env = "CIRRUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stack.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack file.
    Validate {
        /// Show warnings as well as errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what an apply would change.
    Plan,

    /// Converge infrastructure on the stack file.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum concurrent provider calls.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Serve every resource type with the in-memory provider.
        #[arg(long)]
        simulate: bool,
    },

    /// Delete every recorded resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Serve every resource type with the in-memory provider.
        #[arg(long)]
        simulate: bool,
    },

    /// Compare recorded state with providers and the stack file.
    Drift {
        /// Serve every resource type with the in-memory provider.
        #[arg(long)]
        simulate: bool,
    },

    /// Show exported outputs from the recorded state.
    Outputs,

    /// Manage the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },

    /// Forget unfinished operations left by an interrupted run.
    ClearPending {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "cirrus",
            "--output",
            "json",
            "apply",
            "--yes",
            "--concurrency",
            "8",
            "--simulate",
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Apply {
                yes: true,
                concurrency: Some(8),
                simulate: true
            }
        ));
    }

    #[test]
    fn test_state_subcommands() {
        let cli = Cli::try_parse_from(["cirrus", "state", "clear-pending", "-y"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::ClearPending { yes: true }
            }
        ));

        let cli = Cli::try_parse_from(["cirrus", "--verbose", "state", "unlock", "--force"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { lock_id: None, force: true }
            }
        ));
    }
}
