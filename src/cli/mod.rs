//! CLI module for the bundletest harness
//!
//! ## Commands
//!
//! - `run [PATH]` - Discover and run conformance cases
//! - `check <FILE>` - Parse a bundle-script file and print diagnostics
//!
//! ## Modules
//!
//! - `commands` - Command implementations
//! - `reporter` - Case reporting (dots / verbose lines, failure section, summary)
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;
pub mod reporter;

use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    /// Create a new CLI error with a message and exit code.
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Conformance-testing harness for module bundlers
#[derive(Parser, Debug)]
#[command(name = "bundletest")]
#[command(version = VERSION)]
#[command(about = "Conformance-testing harness for module bundlers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover and run cases
    Run {
        /// Suite root or a single case directory
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,
        /// Only run cases whose name contains this text
        #[arg(short = 'k', value_name = "FILTER")]
        filter: Option<String>,
        /// Cases to run concurrently
        #[arg(short = 'j', long = "jobs", value_name = "JOBS")]
        jobs: Option<usize>,
        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
        /// Overwrite stored snapshots instead of comparing
        #[arg(long = "update-snapshots")]
        update_snapshots: bool,
        /// External bundler command (default: the built-in script bundler)
        #[arg(long = "builder-cmd", value_name = "CMD")]
        builder_cmd: Option<String>,
        /// Harness configuration file (default: PATH/bundletest.toml)
        #[arg(long = "config", value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Parse a bundle-script file and print diagnostics
    Check {
        /// File to parse
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
pub fn run() {
    let cli = Cli::parse();

    match execute(cli) {
        Ok(exit_code) => {
            if exit_code.0 != 0 {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute the CLI command and return result.
fn execute(cli: Cli) -> CliResult<ExitCode> {
    match cli.command {
        Command::Run {
            path,
            filter,
            jobs,
            verbose,
            update_snapshots,
            builder_cmd,
            config,
        } => commands::run_cases(&commands::RunOptions {
            path,
            filter,
            jobs,
            verbose,
            update_snapshots,
            builder_cmd,
            config,
        }),
        Command::Check { file } => commands::check_file(&file),
    }
}

// ============================================================================
// Tests
// ============================================================================
