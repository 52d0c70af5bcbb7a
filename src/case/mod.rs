//! Cases and steps.
//!
//! A [`Case`] is built once by [`discovery`] from a fixture directory and never changes afterwards. Its optional
//! `case.toml` carries everything that is not a source file:
//!
//! ```toml
//! kind = "hot"            # single | watch | hot
//! document = "html"       # none | html
//! format = "register"     # overrides every configuration's format
//! snapshot = true
//! parity = "structural"   # structural | exact
//! shared_cache = "ids"
//!
//! [globals]
//! FEATURE = true
//!
//! [[config]]
//! name = "named"
//! module_ids = "named"
//!
//! [steps.1]
//! errors = ["Module not found"]
//! ```
//!
//! ## Modules
//!
//! - `discovery` - finds case directories and turns them into [`Case`] values
//! - `workspace` - the per-configuration working copy a case mutates step by step

pub mod discovery;
pub mod workspace;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::builder::{BuildResult, BuilderConfig};
use crate::sandbox::{DocumentType, ExecutionOutcome, ModuleFormat, RunMode};
use crate::snapshot::ParityMode;

pub use discovery::{discover_cases, load_case};
pub use workspace::Workspace;

pub const CASE_FILE: &str = "case.toml";
pub const SNAPSHOT_DIR: &str = "__snapshots__";
/// File content that removes the file in a step.
pub const DELETE_MARKER: &str = "DELETE";

/// One change to the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Write { path: String, content: String },
    Remove { path: String },
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            FileChange::Write { path, .. } | FileChange::Remove { path } => path,
        }
    }
}

/// Diagnostics a step expects, as substrings; an empty list means "none".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepExpectation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl StepExpectation {
    pub fn expects_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// What a custom assertion callback sees.
pub struct StepContext<'a> {
    pub case: &'a str,
    pub config: &'a str,
    pub step: usize,
    pub build: &'a BuildResult,
    pub outcome: Option<&'a ExecutionOutcome>,
}

pub type StepAssertion = Arc<dyn Fn(&StepContext<'_>) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct Step {
    pub index: usize,
    /// Changes relative to the previous step; step 0 carries the initial tree.
    pub delta: Vec<FileChange>,
    pub expect: StepExpectation,
    pub assertion: Option<StepAssertion>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("index", &self.index)
            .field("delta", &self.delta)
            .field("expect", &self.expect)
            .field("assertion", &self.assertion.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Case {
    /// Path relative to the suite root, `/`-separated.
    pub name: String,
    pub dir: PathBuf,
    pub kind: RunMode,
    pub document: DocumentType,
    pub globals: BTreeMap<String, serde_json::Value>,
    pub configs: Vec<BuilderConfig>,
    pub steps: Vec<Step>,
    pub snapshot: bool,
    pub parity: Option<ParityMode>,
    pub shared_cache: Option<String>,
}

impl Case {
    /// Attach a host-side assertion to step `index`.
    pub fn with_assertion<F>(mut self, index: usize, assertion: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        if let Some(step) = self.steps.iter_mut().find(|s| s.index == index) {
            step.assertion = Some(Arc::new(assertion));
        }
        self
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_DIR)
    }
}

/// On-disk shape of `case.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CaseMeta {
    pub kind: RunMode,
    pub document: DocumentType,
    pub format: Option<ModuleFormat>,
    pub entry: Option<String>,
    pub globals: BTreeMap<String, serde_json::Value>,
    pub snapshot: bool,
    pub parity: Option<ParityMode>,
    pub shared_cache: Option<String>,
    pub config: Vec<BuilderConfig>,
    pub steps: BTreeMap<String, StepExpectation>,
}

impl CaseMeta {
    /// Builder configurations with case-level overrides applied; one default configuration when none is listed.
    pub fn configs(&self) -> Vec<BuilderConfig> {
        let mut configs = if self.config.is_empty() {
            vec![BuilderConfig::default()]
        } else {
            self.config.clone()
        };
        for config in &mut configs {
            if let Some(format) = self.format {
                config.format = format;
            }
            if let Some(entry) = &self.entry {
                config.entry = entry.clone();
            }
            config.hot = self.kind == RunMode::Hot;
        }
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModuleIds;

    #[test]
    fn test_case_meta_from_toml() {
        let meta: CaseMeta = toml::from_str(
            r#"
kind = "hot"
format = "register"
parity = "exact"

[globals]
FLAG = true

[[config]]
name = "a"

[[config]]
name = "b"
module_ids = "hashed"

[steps.1]
errors = ["Module not found"]
"#,
        )
        .unwrap();
        assert_eq!(meta.kind, RunMode::Hot);
        assert_eq!(meta.parity, Some(ParityMode::Exact));
        assert_eq!(meta.globals["FLAG"], serde_json::json!(true));
        assert_eq!(meta.steps["1"].errors, vec!["Module not found"]);
        let configs = meta.configs();
        assert_eq!(configs.len(), 2);
        assert!(configs.iter().all(|c| c.hot && c.format == ModuleFormat::Register));
        assert_eq!(configs[1].module_ids, ModuleIds::Hashed);
    }

    #[test]
    fn test_unknown_case_key_is_rejected() {
        assert!(toml::from_str::<CaseMeta>("kinds = \"hot\"\n").is_err());
    }

    #[test]
    fn test_default_meta_has_one_config() {
        let configs = CaseMeta::default().configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "default");
        assert!(!configs[0].hot);
    }
}
