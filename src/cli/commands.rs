//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bundletest_script::ast::Item;
use bundletest_script::diagnostics;

use super::reporter::{CaseReporter, ConsoleReporter};
use super::{CliError, CliResult, ExitCode};
use crate::builder::{Builder, CommandBuilder, ScriptBundler};
use crate::case::discover_cases;
use crate::config::HarnessConfig;
use crate::driver::{run_suite, CaseDriver};

/// Options of `bundletest run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub path: PathBuf,
    pub filter: Option<String>,
    pub jobs: Option<usize>,
    pub verbose: bool,
    pub update_snapshots: bool,
    pub builder_cmd: Option<String>,
    pub config: Option<PathBuf>,
}

/// Resolve the harness configuration: file, then environment, then flags.
pub fn load_config(options: &RunOptions) -> CliResult<HarnessConfig> {
    let config = match &options.config {
        Some(path) => HarnessConfig::from_file(path),
        None => HarnessConfig::discover(&options.path),
    }
    .map_err(|e| CliError::failure(format!("Error: {}", e)))?;
    let mut config = config
        .apply_env(std::env::vars())
        .map_err(|e| CliError::failure(format!("Error: {}", e)))?;
    if let Some(jobs) = options.jobs {
        config = config.with_jobs(jobs.max(1));
    }
    if options.update_snapshots {
        config = config.with_update_snapshots(true);
    }
    Ok(config)
}

fn make_builder(command: Option<&str>, config: &HarnessConfig) -> CliResult<Arc<dyn Builder>> {
    let Some(command) = command else {
        return Ok(Arc::new(ScriptBundler));
    };
    let mut words = command.split_whitespace().map(str::to_string);
    let Some(program) = words.next() else {
        return Err(CliError::failure("Error: --builder-cmd requires a command"));
    };
    Ok(Arc::new(
        CommandBuilder::new(program, words.collect()).with_timeout(config.build_timeout),
    ))
}

/// Discover and run every case under `options.path`.
pub fn run_cases(options: &RunOptions) -> CliResult<ExitCode> {
    let config = load_config(options)?;
    let builder = make_builder(options.builder_cmd.as_deref(), &config)?;
    tracing::debug!(builder = builder.name(), jobs = config.jobs, "configuration resolved");

    let cases = discover_cases(&options.path, options.filter.as_deref())
        .map_err(|e| CliError::failure(format!("Error: {}", e)))?;
    let mut reporter = ConsoleReporter::new(options.verbose);
    reporter.on_discovery_complete(cases.len());
    if cases.is_empty() {
        return Err(CliError::failure(format!(
            "No cases found in '{}'\nA case is a directory with case.toml, index.js or a 0/ step directory",
            options.path.display()
        )));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::failure(format!("Error starting runtime: {}", e)))?;
    let driver = Arc::new(CaseDriver::new(config, builder));
    let summary = runtime
        .block_on(run_suite(driver, cases, |report| reporter.on_case_complete(report)))
        .map_err(|e| CliError::failure(format!("Error: {}", e)))?;
    reporter.on_run_complete(&summary);

    Ok(if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Parse a bundle-script file and print its diagnostics.
pub fn check_file(file_path: &Path) -> CliResult<ExitCode> {
    let name = file_path.to_string_lossy();
    let source = fs::read_to_string(file_path)
        .map_err(|e| CliError::failure(format!("Error reading '{}': {}", name, e)))?;
    match bundletest_script::parse_source(&source) {
        Ok(program) => {
            let modules: Vec<&str> = program
                .items
                .iter()
                .filter_map(|item| match &item.node {
                    Item::Define(m) | Item::Register(m) => Some(m.id.as_str()),
                    _ => None,
                })
                .collect();
            println!("✓ {} parsed ({} item(s))", name, program.items.len());
            for id in modules {
                println!("  module {}", id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => {
            let mut msg = String::new();
            for err in &errors {
                msg.push_str(&diagnostics::format_error(&name, &source, err));
            }
            Err(CliError::failure(msg.trim_end()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_check_file_reports_syntax_errors() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.js");
        fs::write(&good, "define \"./a.js\" {\nlet a = 1;\n}\nentry \"./a.js\";\n").unwrap();
        assert_eq!(check_file(&good).unwrap(), ExitCode::SUCCESS);

        let bad = dir.path().join("bad.js");
        fs::write(&bad, "let b = ;\n").unwrap();
        let err = check_file(&bad).unwrap_err();
        assert_eq!(err.exit_code, ExitCode::FAILURE);
        assert!(err.message.contains("bad.js:1:9"));
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bundletest.toml"), "jobs = 8\n").unwrap();
        let options = RunOptions {
            path: dir.path().to_path_buf(),
            jobs: Some(2),
            update_snapshots: true,
            ..RunOptions::default()
        };
        let config = load_config(&options).unwrap();
        assert_eq!(config.jobs, 2);
        assert!(config.update_snapshots);
    }

    #[test]
    fn test_builder_cmd_selects_command_builder() {
        let config = HarnessConfig::default();
        assert_eq!(make_builder(None, &config).unwrap().name(), "script");
        assert_eq!(
            make_builder(Some("node bundle.js --hot"), &config).unwrap().name(),
            "command"
        );
        assert!(make_builder(Some("   "), &config).is_err());
    }
}
