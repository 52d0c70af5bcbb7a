//! The builder contract.
//!
//! A [`Builder`] starts a [`BuildSession`] for one case configuration; the session compiles the project on demand
//! and, in watch mode, blocks until the working copy changed and settled. The harness never looks inside the
//! bundler: everything it checks comes back as a [`BuildResult`].
//!
//! ## Modules
//!
//! - `reference` - `ScriptBundler`, the in-process reference builder for bundle-script projects
//! - `command` - `CommandBuilder`, which drives an external bundler process

pub mod command;
pub mod reference;

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{DefaultHasher, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;

pub use command::CommandBuilder;
pub use reference::ScriptBundler;

use crate::sandbox::ModuleFormat;

/// How emitted module ids are derived from source paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleIds {
    /// Project-relative path, e.g. `./lib/value.js`.
    #[default]
    Named,
    /// Short digest of the named id.
    Hashed,
    /// Sequential integers kept stable across builds through a records file.
    Numeric,
}

/// One builder configuration of a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// Label used in reports and snapshot paths.
    pub name: String,
    /// Entry source, relative to the project root.
    pub entry: String,
    pub module_ids: ModuleIds,
    /// Output file name template: `[name]`, `[contenthash]`, `[hash]`.
    pub filename: String,
    pub format: ModuleFormat,
    /// Emit hot-update manifests and chunks.
    pub hot: bool,
    /// Extra options passed through to external builders untouched.
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            entry: "./index.js".to_string(),
            module_ids: ModuleIds::Named,
            filename: "[name].js".to_string(),
            format: ModuleFormat::Define,
            hot: false,
            options: BTreeMap::new(),
        }
    }
}

/// Where a session reads and writes.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub project_root: PathBuf,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub config: BuilderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// An error or warning reported by the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDiagnostic {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    pub severity: Severity,
}

impl BuildDiagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            line: None,
            column: None,
            severity: Severity::Error,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(message)
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: usize, column: usize) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for BuildDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line, self.column) {
            (Some(file), Some(line), Some(col)) => write!(f, "{}:{}:{}: {}", file, line, col, self.message),
            (Some(file), _, _) => write!(f, "{}: {}", file, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkStats {
    pub name: String,
    pub files: Vec<String>,
    /// Emitted module ids.
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleStats {
    pub id: String,
    /// Project-relative source path.
    pub name: String,
    pub size: usize,
}

/// The statistics object a builder reports with each compilation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildStats {
    pub hash: String,
    pub time_ms: u64,
    pub chunks: Vec<ChunkStats>,
    pub modules: Vec<ModuleStats>,
}

/// Everything one compilation produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildResult {
    pub output_dir: PathBuf,
    pub files: Vec<EmittedFile>,
    /// Files the sandbox loads, in order.
    pub entry_files: Vec<String>,
    pub stats: BuildStats,
    pub errors: Vec<BuildDiagnostic>,
    pub warnings: Vec<BuildDiagnostic>,
    /// Monotonic per session, starting at 0.
    pub compilation: usize,
}

impl BuildResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn file(&self, name: &str) -> Option<&EmittedFile> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// The builder could not produce a [`BuildResult`] at all.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BuildFailure {
    #[error("builder did not finish within {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("builder crashed: {message}")]
    Crashed { message: String },

    #[error("{context}: {message}")]
    Io { context: String, message: String },

    #[error("builder rejected the compilation:\n{}", render(.diagnostics))]
    Rejected { diagnostics: Vec<BuildDiagnostic> },
}

impl BuildFailure {
    pub fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
        BuildFailure::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

fn render(diagnostics: &[BuildDiagnostic]) -> String {
    diagnostics.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
}

/// Watch-mode timing, from `HarnessConfig`.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// How long the tree must stay unchanged before a rebuild starts.
    pub debounce: Duration,
    pub poll_interval: Duration,
    /// Upper bound on waiting for a change to appear.
    pub timeout: Duration,
}

pub trait Builder: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, request: BuildRequest) -> Result<Box<dyn BuildSession>, BuildFailure>;
}

pub trait BuildSession: Send {
    fn request(&self) -> &BuildRequest;

    fn project_root(&self) -> &Path {
        &self.request().project_root
    }

    /// Compile the current state of the project.
    fn build(&mut self) -> Result<BuildResult, BuildFailure>;

    /// Block until the project changed and stayed unchanged for the debounce, then rebuild.
    fn next_rebuild(&mut self, watch: &WatchOptions) -> Result<BuildResult, BuildFailure>;
}

/// Polling fingerprint watcher over a project tree.
#[derive(Debug, Clone)]
pub struct FingerprintWatcher {
    root: PathBuf,
    last: u64,
}

impl FingerprintWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BuildFailure> {
        let root = root.into();
        let last = fingerprint(&root)?;
        Ok(Self { root, last })
    }

    /// Record the current tree as seen.
    pub fn mark(&mut self) -> Result<(), BuildFailure> {
        self.last = fingerprint(&self.root)?;
        Ok(())
    }

    /// Wait for a change, then for the tree to stay stable for `debounce`.
    #[tracing::instrument(skip_all, fields(root = %self.root.display()))]
    pub fn wait_for_change(&mut self, watch: &WatchOptions) -> Result<(), BuildFailure> {
        let start = Instant::now();
        let mut current = fingerprint(&self.root)?;
        while current == self.last {
            if start.elapsed() >= watch.timeout {
                return Err(BuildFailure::Timeout {
                    elapsed: start.elapsed(),
                });
            }
            std::thread::sleep(watch.poll_interval);
            current = fingerprint(&self.root)?;
        }
        let mut stable_since = Instant::now();
        while stable_since.elapsed() < watch.debounce {
            if start.elapsed() >= watch.timeout {
                return Err(BuildFailure::Timeout {
                    elapsed: start.elapsed(),
                });
            }
            std::thread::sleep(watch.poll_interval.min(watch.debounce));
            let next = fingerprint(&self.root)?;
            if next != current {
                current = next;
                stable_since = Instant::now();
            }
        }
        tracing::debug!(waited_ms = start.elapsed().as_millis() as u64, "change settled");
        self.last = current;
        Ok(())
    }
}

/// Hash of every file path and content under `root`, in path order.
pub fn fingerprint(root: &Path) -> Result<u64, BuildFailure> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();
    let mut hasher = DefaultHasher::new();
    for rel in files {
        let bytes = std::fs::read(root.join(&rel)).map_err(|e| BuildFailure::io(format!("reading {}", rel), &e))?;
        hasher.write(rel.as_bytes());
        hasher.write_u8(0);
        hasher.write(&bytes);
    }
    Ok(hasher.finish())
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for &b in digest.iter() {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// Project-relative paths (with `/` separators) of every file under `dir`.
pub(crate) fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), BuildFailure> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| BuildFailure::io(format!("listing {}", dir.display()), &e))?;
    for entry in entries {
        let entry = entry.map_err(|e| BuildFailure::io(format!("listing {}", dir.display()), &e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
            out.push(rel.join("/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let d = BuildDiagnostic::error("Module not found").at("./index.js", 3, 8);
        assert_eq!(d.to_string(), "./index.js:3:8: Module not found");
        assert_eq!(BuildDiagnostic::warning("careful").to_string(), "careful");
    }

    #[test]
    fn test_builder_config_defaults_from_toml() {
        let config: BuilderConfig = toml::from_str("name = \"ids\"\nmodule_ids = \"numeric\"\n").unwrap();
        assert_eq!(config.name, "ids");
        assert_eq!(config.module_ids, ModuleIds::Numeric);
        assert_eq!(config.entry, "./index.js");
        assert_eq!(config.format, ModuleFormat::Define);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/a.js"), "1").unwrap();
        let first = fingerprint(dir.path()).unwrap();
        assert_eq!(first, fingerprint(dir.path()).unwrap());
        std::fs::write(dir.path().join("lib/a.js"), "2").unwrap();
        assert_ne!(first, fingerprint(dir.path()).unwrap());
    }

    #[test]
    fn test_watcher_times_out_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "1").unwrap();
        let mut watcher = FingerprintWatcher::new(dir.path()).unwrap();
        let watch = WatchOptions {
            debounce: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        };
        assert!(matches!(
            watcher.wait_for_change(&watch),
            Err(BuildFailure::Timeout { .. })
        ));
        std::fs::write(dir.path().join("a.js"), "2").unwrap();
        assert!(watcher.wait_for_change(&watch).is_ok());
    }
}
