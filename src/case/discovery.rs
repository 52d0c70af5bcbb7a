//! Fixture discovery.
//!
//! A directory is a case when it holds a `case.toml`, an `index.js`, or a `0/` step directory. Steps come either
//! from numbered subdirectories (`0/`, `1/`, ...) or from `---` separator lines inside the case's files; a file
//! version whose content is `DELETE` removes the file from that step on.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{Case, CaseMeta, FileChange, Step, CASE_FILE, DELETE_MARKER, SNAPSHOT_DIR};
use crate::builder::collect_files;
use crate::error::HarnessError;

/// Separator line between inline step versions of a file.
const STEP_SEPARATOR: &str = "---";

/// Every case under `root` whose name contains `filter`, sorted by name.
#[tracing::instrument(skip_all, fields(root = %root.display()))]
pub fn discover_cases(root: &Path, filter: Option<&str>) -> Result<Vec<Case>, HarnessError> {
    let mut dirs = Vec::new();
    find_case_dirs(root, &mut dirs)?;
    let mut cases = Vec::new();
    for dir in dirs {
        let name = case_name(root, &dir);
        if filter.is_some_and(|f| !name.contains(f)) {
            continue;
        }
        cases.push(load_case(&name, &dir)?);
    }
    cases.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::debug!(cases = cases.len(), "discovered cases");
    Ok(cases)
}

fn is_case_dir(dir: &Path) -> bool {
    dir.join(CASE_FILE).is_file() || dir.join("index.js").is_file() || dir.join("0").is_dir()
}

fn find_case_dirs(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<(), HarnessError> {
    if is_case_dir(dir) {
        out.push(dir.to_path_buf());
        return Ok(());
    }
    let entries = fs::read_dir(dir).map_err(|e| HarnessError::io(format!("listing {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| HarnessError::io(format!("listing {}", dir.display()), e))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if path.is_dir() && !hidden && entry.file_name() != SNAPSHOT_DIR {
            find_case_dirs(&path, out)?;
        }
    }
    Ok(())
}

fn case_name(root: &Path, dir: &Path) -> String {
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    if parts.is_empty() {
        dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    } else {
        parts.join("/")
    }
}

/// Build one case from its directory.
pub fn load_case(name: &str, dir: &Path) -> Result<Case, HarnessError> {
    let meta_path = dir.join(CASE_FILE);
    let meta: CaseMeta = if meta_path.is_file() {
        let text = fs::read_to_string(&meta_path)
            .map_err(|e| HarnessError::io(format!("reading {}", meta_path.display()), e))?;
        toml::from_str(&text).map_err(|e| HarnessError::usage(format!("{}: {}", meta_path.display(), e)))?
    } else {
        CaseMeta::default()
    };

    let deltas = if dir.join("0").is_dir() {
        numbered_steps(dir)?
    } else {
        inline_steps(dir)?
    };
    let mut expectations = BTreeMap::new();
    for (key, expect) in &meta.steps {
        let index: usize = key
            .parse()
            .map_err(|_| HarnessError::usage(format!("{}: step key '{}' is not an index", name, key)))?;
        if index >= deltas.len() {
            return Err(HarnessError::usage(format!(
                "{}: expectations for step {} but the case has {} step(s)",
                name,
                index,
                deltas.len()
            )));
        }
        expectations.insert(index, expect.clone());
    }

    let steps = deltas
        .into_iter()
        .enumerate()
        .map(|(index, delta)| Step {
            index,
            delta,
            expect: expectations.remove(&index).unwrap_or_default(),
            assertion: None,
        })
        .collect();
    Ok(Case {
        name: name.to_string(),
        dir: dir.to_path_buf(),
        kind: meta.kind,
        document: meta.document,
        globals: meta.globals.clone(),
        configs: meta.configs(),
        steps,
        snapshot: meta.snapshot,
        parity: meta.parity,
        shared_cache: meta.shared_cache.clone(),
    })
}

fn read_file(path: &Path) -> Result<String, HarnessError> {
    fs::read_to_string(path).map_err(|e| HarnessError::io(format!("reading {}", path.display()), e))
}

fn is_delete(content: &str) -> bool {
    content.trim_end() == DELETE_MARKER
}

fn list(dir: &Path) -> Result<Vec<String>, HarnessError> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files).map_err(|e| HarnessError::usage(e.to_string()))?;
    files.sort();
    Ok(files)
}

fn numbered_steps(dir: &Path) -> Result<Vec<Vec<FileChange>>, HarnessError> {
    let mut deltas = Vec::new();
    while dir.join(deltas.len().to_string()).is_dir() {
        let step_dir = dir.join(deltas.len().to_string());
        let mut delta = Vec::new();
        for path in list(&step_dir)? {
            let content = read_file(&step_dir.join(&path))?;
            delta.push(if is_delete(&content) {
                FileChange::Remove { path }
            } else {
                FileChange::Write { path, content }
            });
        }
        deltas.push(delta);
    }
    Ok(deltas)
}

fn inline_steps(dir: &Path) -> Result<Vec<Vec<FileChange>>, HarnessError> {
    let mut versions: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in list(dir)? {
        if path == CASE_FILE || path.starts_with(&format!("{}/", SNAPSHOT_DIR)) {
            continue;
        }
        let content = read_file(&dir.join(&path))?;
        versions.insert(path, split_versions(&content));
    }
    let count = versions.values().map(Vec::len).max().unwrap_or(1);

    let mut deltas = Vec::with_capacity(count);
    for step in 0..count {
        let mut delta = Vec::new();
        for (path, parts) in &versions {
            let Some(content) = parts.get(step) else {
                continue;
            };
            let change = if is_delete(content) {
                if step == 0 {
                    continue;
                }
                FileChange::Remove { path: path.clone() }
            } else if step > 0 && parts.get(step - 1) == Some(content) {
                continue;
            } else {
                FileChange::Write {
                    path: path.clone(),
                    content: content.clone(),
                }
            };
            delta.push(change);
        }
        deltas.push(delta);
    }
    Ok(deltas)
}

/// Split a file into its per-step versions at `---` lines.
fn split_versions(content: &str) -> Vec<String> {
    let mut parts = vec![String::new()];
    for line in content.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == STEP_SEPARATOR {
            parts.push(String::new());
        } else if let Some(last) = parts.last_mut() {
            last.push_str(line);
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::RunMode;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_split_versions() {
        assert_eq!(split_versions("a;\n---\nb;\n---\nDELETE\n"), vec!["a;\n", "b;\n", "DELETE\n"]);
        assert_eq!(split_versions("only;\n"), vec!["only;\n"]);
    }

    #[test]
    fn test_inline_steps_only_carry_changes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.js", "import v from \"./v\";\n");
        write(dir.path(), "v.js", "export default 1;\n---\nexport default 2;\n---\nexport default 2;\n");
        write(dir.path(), "gone.js", "let g = 1;\n---\nDELETE\n");
        let case = load_case("inline", dir.path()).unwrap();
        assert_eq!(case.steps.len(), 3);
        assert_eq!(case.steps[0].delta.len(), 3);
        assert_eq!(
            case.steps[1].delta,
            vec![
                FileChange::Remove {
                    path: "gone.js".to_string()
                },
                FileChange::Write {
                    path: "v.js".to_string(),
                    content: "export default 2;\n".to_string()
                },
            ]
        );
        assert!(case.steps[2].delta.is_empty());
    }

    #[test]
    fn test_numbered_steps_and_expectations() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "case.toml", "kind = \"watch\"\n[steps.1]\nerrors = [\"Module not found\"]\n");
        write(dir.path(), "0/index.js", "require(\"./a\");\n");
        write(dir.path(), "0/a.js", "module.exports = 1;\n");
        write(dir.path(), "1/a.js", "DELETE\n");
        let case = load_case("numbered", dir.path()).unwrap();
        assert_eq!(case.kind, RunMode::Watch);
        assert_eq!(case.steps.len(), 2);
        assert_eq!(
            case.steps[1].delta,
            vec![FileChange::Remove {
                path: "a.js".to_string()
            }]
        );
        assert!(case.steps[1].expect.expects_errors());
        assert!(!case.steps[0].expect.expects_errors());
    }

    #[test]
    fn test_expectation_for_missing_step_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "case.toml", "[steps.3]\nwarnings = [\"x\"]\n");
        write(dir.path(), "index.js", "let a = 1;\n");
        let err = load_case("bad", dir.path()).unwrap_err();
        assert_eq!(err.kind(), bundletest_core::FailureKind::HarnessUsageError);
    }

    #[test]
    fn test_discovery_nests_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "hot/accept/index.js", "let a = 1;\n");
        write(dir.path(), "hot/accept/__snapshots__/default/step-0.snap", "{}");
        write(dir.path(), "single/basic/index.js", "let a = 1;\n");
        let all = discover_cases(dir.path(), None).unwrap();
        let names: Vec<&str> = all.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["hot/accept", "single/basic"]);
        let filtered = discover_cases(dir.path(), Some("basic")).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].steps[0].delta.len(), 1);
    }
}
