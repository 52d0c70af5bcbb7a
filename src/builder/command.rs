//! `CommandBuilder`: runs an external bundler as a child process.
//!
//! The process receives its request through environment variables and reports back by writing `stats.json` into
//! the output directory:
//!
//! ```json
//! { "hash": "...", "entry_files": ["main.js"], "errors": [], "warnings": [], "chunks": [], "modules": [] }
//! ```
//!
//! A process that exits unsuccessfully without writing stats counts as a crash.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::{
    collect_files, BuildDiagnostic, BuildFailure, BuildRequest, BuildResult, BuildSession, BuildStats, Builder,
    ChunkStats, EmittedFile, FingerprintWatcher, ModuleStats, WatchOptions,
};

pub const STATS_FILE: &str = "stats.json";

/// An external bundler invocation: `program args...`, run in the project root.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBuilder {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Builder for CommandBuilder {
    fn name(&self) -> &str {
        "command"
    }

    fn start(&self, request: BuildRequest) -> Result<Box<dyn BuildSession>, BuildFailure> {
        let watcher = FingerprintWatcher::new(&request.project_root)?;
        Ok(Box::new(CommandSession {
            builder: self.clone(),
            request,
            compilation: 0,
            watcher,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct StatsFile {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    entry_files: Vec<String>,
    #[serde(default)]
    errors: Vec<ReportedDiagnostic>,
    #[serde(default)]
    warnings: Vec<ReportedDiagnostic>,
    #[serde(default)]
    chunks: Vec<ChunkStats>,
    #[serde(default)]
    modules: Vec<ModuleStats>,
    #[serde(default)]
    time_ms: u64,
}

/// Diagnostics may be plain strings or located objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReportedDiagnostic {
    Message(String),
    Located {
        message: String,
        file: Option<String>,
        line: Option<usize>,
        column: Option<usize>,
    },
}

impl ReportedDiagnostic {
    fn into_diagnostic(self, warning: bool) -> BuildDiagnostic {
        let (message, file, line, column) = match self {
            ReportedDiagnostic::Message(message) => (message, None, None, None),
            ReportedDiagnostic::Located {
                message,
                file,
                line,
                column,
            } => (message, file, line, column),
        };
        let mut d = if warning {
            BuildDiagnostic::warning(message)
        } else {
            BuildDiagnostic::error(message)
        };
        d.file = file;
        d.line = line;
        d.column = column;
        d
    }
}

struct CommandSession {
    builder: CommandBuilder,
    request: BuildRequest,
    compilation: usize,
    watcher: FingerprintWatcher,
}

impl CommandSession {
    fn run_process(&self) -> Result<(bool, String), BuildFailure> {
        let config = serde_json::to_string(&self.request.config).map_err(|e| BuildFailure::Crashed {
            message: format!("serializing builder config: {}", e),
        })?;
        let mut child = Command::new(&self.builder.program)
            .args(&self.builder.args)
            .current_dir(&self.request.project_root)
            .env("BUNDLETEST_PROJECT_ROOT", &self.request.project_root)
            .env("BUNDLETEST_OUTPUT_DIR", &self.request.output_dir)
            .env("BUNDLETEST_CACHE_DIR", &self.request.cache_dir)
            .env("BUNDLETEST_CONFIG", config)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildFailure::io(format!("spawning {}", self.builder.program.display()), &e))?;

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= self.builder.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BuildFailure::Timeout {
                        elapsed: start.elapsed(),
                    });
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => return Err(BuildFailure::io("waiting for builder", &e)),
            }
        };
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        Ok((status.success(), stderr))
    }
}

impl BuildSession for CommandSession {
    fn request(&self) -> &BuildRequest {
        &self.request
    }

    #[tracing::instrument(skip_all, fields(program = %self.builder.program.display()))]
    fn build(&mut self) -> Result<BuildResult, BuildFailure> {
        self.watcher.mark()?;
        let out = &self.request.output_dir;
        fs::create_dir_all(out).map_err(|e| BuildFailure::io("creating output directory", &e))?;
        let stats_path = out.join(STATS_FILE);
        let _ = fs::remove_file(&stats_path);

        let (success, stderr) = self.run_process()?;
        let stats_text = match fs::read_to_string(&stats_path) {
            Ok(text) => text,
            Err(_) if !success => {
                return Err(BuildFailure::Crashed {
                    message: stderr.trim().to_string(),
                })
            }
            Err(e) => return Err(BuildFailure::io(format!("reading {}", stats_path.display()), &e)),
        };
        let stats: StatsFile = serde_json::from_str(&stats_text).map_err(|e| BuildFailure::Crashed {
            message: format!("invalid {}: {}", STATS_FILE, e),
        })?;

        let mut names = Vec::new();
        collect_files(out, out, &mut names)?;
        names.sort();
        let mut files = Vec::new();
        for name in names.into_iter().filter(|n| n != STATS_FILE) {
            let content = fs::read_to_string(out.join(&name)).unwrap_or_default();
            files.push(EmittedFile { name, content });
        }

        let compilation = self.compilation;
        self.compilation += 1;
        Ok(BuildResult {
            output_dir: out.clone(),
            files,
            entry_files: stats.entry_files,
            stats: BuildStats {
                hash: stats.hash,
                time_ms: stats.time_ms,
                chunks: stats.chunks,
                modules: stats.modules,
            },
            errors: stats.errors.into_iter().map(|d| d.into_diagnostic(false)).collect(),
            warnings: stats.warnings.into_iter().map(|d| d.into_diagnostic(true)).collect(),
            compilation,
        })
    }

    fn next_rebuild(&mut self, watch: &WatchOptions) -> Result<BuildResult, BuildFailure> {
        self.watcher.wait_for_change(watch)?;
        self.build()
    }
}
