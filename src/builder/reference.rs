//! `ScriptBundler`: the in-process reference builder.
//!
//! Bundles a bundle-script project into one `main` chunk. Each source module becomes a `define` (or `register`)
//! item whose import, `require` and hot-dependency specifiers are rewritten to emitted module ids. Errored
//! compilations emit nothing; hot-update manifests are always relative to the last successful compilation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::time::Instant;

use bundletest_script::ast::{ImportClause, Item, Program, Statement};
use bundletest_script::diagnostics::line_col;
use bundletest_script::specifiers::{self, SpecifierRef};
use serde::{Deserialize, Serialize};

use super::{
    sha256_hex, BuildDiagnostic, BuildFailure, BuildRequest, BuildResult, BuildSession, BuildStats, Builder,
    ChunkStats, EmittedFile, FingerprintWatcher, ModuleIds, ModuleStats, WatchOptions,
};
use crate::sandbox::ModuleFormat;

const CHUNK_NAME: &str = "main";
const RECORDS_FILE: &str = "records.json";

/// The reference builder for bundle-script projects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptBundler;

impl Builder for ScriptBundler {
    fn name(&self) -> &str {
        "script"
    }

    fn start(&self, request: BuildRequest) -> Result<Box<dyn BuildSession>, BuildFailure> {
        Ok(Box::new(ScriptSession::new(request)?))
    }
}

/// The last successful compilation, kept for hot-update diffs.
#[derive(Debug, Clone)]
struct Emitted {
    hash: String,
    /// Module id -> emitted item text.
    items: BTreeMap<String, String>,
}

/// Numeric module ids persisted in the cache directory.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Records {
    modules: BTreeMap<String, u64>,
    next: u64,
}

struct SourceModule {
    /// `./`-prefixed project-relative path.
    name: String,
    text: String,
    program: Program,
    /// Specifier value -> resolved module name.
    resolved: BTreeMap<String, String>,
}

pub struct ScriptSession {
    request: BuildRequest,
    compilation: usize,
    watcher: FingerprintWatcher,
    last_success: Option<Emitted>,
}

impl ScriptSession {
    pub fn new(request: BuildRequest) -> Result<Self, BuildFailure> {
        let watcher = FingerprintWatcher::new(&request.project_root)?;
        Ok(Self {
            request,
            compilation: 0,
            watcher,
            last_success: None,
        })
    }

    /// Walk the import graph from the entry, collecting modules and diagnostics.
    fn collect_graph(&self, errors: &mut Vec<BuildDiagnostic>) -> BTreeMap<String, SourceModule> {
        let root = &self.request.project_root;
        let mut modules = BTreeMap::new();
        let entry = self.request.config.entry.clone();
        let Some(entry_name) = resolve(root, "./", &entry) else {
            errors.push(BuildDiagnostic::error(format!(
                "Entry module not found: Error: Can't resolve '{}' in '.'",
                entry
            )));
            return modules;
        };

        let mut queue = VecDeque::from([entry_name]);
        let mut seen = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let text = match fs::read_to_string(root.join(name.trim_start_matches("./"))) {
                Ok(text) => text,
                Err(err) => {
                    errors.push(BuildDiagnostic::error(format!("Module build failed: {}", err)).at(&name, 1, 1));
                    continue;
                }
            };
            let program = match bundletest_script::parse_source(&text) {
                Ok(program) => program,
                Err(parse_errors) => {
                    for err in parse_errors {
                        let (line, col) = line_col(&text, err.span.start);
                        errors.push(
                            BuildDiagnostic::error(format!("Module parse failed: {}", err.message)).at(&name, line, col),
                        );
                    }
                    continue;
                }
            };
            let mut resolved = BTreeMap::new();
            for spec in specifiers::collect(&program) {
                match resolve(root, &name, &spec.value) {
                    Some(target) => {
                        queue.push_back(target.clone());
                        resolved.insert(spec.value.clone(), target);
                    }
                    None => {
                        let (line, col) = line_col(&text, spec.span.start);
                        errors.push(
                            BuildDiagnostic::error(format!(
                                "Module not found: Error: Can't resolve '{}' in '{}'",
                                spec.value,
                                parent_dir(&name)
                            ))
                            .at(&name, line, col),
                        );
                    }
                }
            }
            modules.insert(
                name.clone(),
                SourceModule {
                    name,
                    text,
                    program,
                    resolved,
                },
            );
        }
        modules
    }

    fn assign_ids(&self, names: &[String]) -> Result<BTreeMap<String, String>, BuildFailure> {
        match self.request.config.module_ids {
            ModuleIds::Named => Ok(names.iter().map(|n| (n.clone(), n.clone())).collect()),
            ModuleIds::Hashed => Ok(names
                .iter()
                .map(|n| (n.clone(), sha256_hex(n.as_bytes()).chars().take(8).collect()))
                .collect()),
            ModuleIds::Numeric => {
                let path = self.request.cache_dir.join(RECORDS_FILE);
                let mut records: Records = fs::read_to_string(&path)
                    .ok()
                    .and_then(|text| serde_json::from_str(&text).ok())
                    .unwrap_or_default();
                let mut ids = BTreeMap::new();
                for name in names {
                    let id = match records.modules.get(name) {
                        Some(id) => *id,
                        None => {
                            let id = records.next;
                            records.next += 1;
                            records.modules.insert(name.clone(), id);
                            id
                        }
                    };
                    ids.insert(name.clone(), id.to_string());
                }
                fs::create_dir_all(&self.request.cache_dir)
                    .map_err(|e| BuildFailure::io("creating cache directory", &e))?;
                let text = serde_json::to_string_pretty(&records).map_err(|e| BuildFailure::Io {
                    context: "serializing records".to_string(),
                    message: e.to_string(),
                })?;
                fs::write(&path, text).map_err(|e| BuildFailure::io(format!("writing {}", path.display()), &e))?;
                Ok(ids)
            }
        }
    }

    /// Emitted item text for one module.
    fn emit_item(&self, module: &SourceModule, ids: &BTreeMap<String, String>) -> String {
        let id_of = |spec: &str| module.resolved.get(spec).and_then(|name| ids.get(name));
        let mut text = module.text.clone();
        let mut refs: Vec<SpecifierRef> = specifiers::collect(&module.program);
        refs.sort_by_key(|r| std::cmp::Reverse(r.span.start));
        for spec in &refs {
            if let Some(id) = id_of(&spec.value) {
                text.replace_range(spec.span.start..spec.span.end, &format!("\"{}\"", id));
            }
        }
        let id = ids.get(&module.name).cloned().unwrap_or_else(|| module.name.clone());
        match self.request.config.format {
            ModuleFormat::Define => format!("define \"{}\" {{\n{}\n}}\n", id, text.trim_end()),
            ModuleFormat::Register => {
                let mut deps: Vec<String> = Vec::new();
                for item in &module.program.items {
                    if let Item::Statement(stmt) = &item.node {
                        if let Statement::Import(decl) = &stmt.node {
                            if let Some(dep) = id_of(&decl.source) {
                                if !deps.contains(dep) {
                                    deps.push(dep.clone());
                                }
                            }
                        }
                    }
                }
                let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
                format!("register \"{}\" [{}] {{\n{}\n}}\n", id, deps.join(", "), text.trim_end())
            }
        }
    }

    fn write(&self, name: &str, content: &str) -> Result<EmittedFile, BuildFailure> {
        let path = self.request.output_dir.join(name);
        fs::write(&path, content).map_err(|e| BuildFailure::io(format!("writing {}", path.display()), &e))?;
        Ok(EmittedFile {
            name: name.to_string(),
            content: content.to_string(),
        })
    }
}

impl BuildSession for ScriptSession {
    fn request(&self) -> &BuildRequest {
        &self.request
    }

    #[tracing::instrument(skip_all, fields(config = %self.request.config.name, compilation = self.compilation))]
    fn build(&mut self) -> Result<BuildResult, BuildFailure> {
        let start = Instant::now();
        self.watcher.mark()?;
        let compilation = self.compilation;
        self.compilation += 1;

        let mut errors = Vec::new();
        let modules = self.collect_graph(&mut errors);
        let warnings = missing_export_warnings(&modules);
        let mut result = BuildResult {
            output_dir: self.request.output_dir.clone(),
            errors,
            warnings,
            compilation,
            ..BuildResult::default()
        };
        if result.has_errors() {
            tracing::debug!(errors = result.errors.len(), "compilation failed; nothing emitted");
            result.stats.time_ms = start.elapsed().as_millis() as u64;
            return Ok(result);
        }

        let names: Vec<String> = modules.keys().cloned().collect();
        let ids = self.assign_ids(&names)?;
        let mut items = BTreeMap::new();
        for module in modules.values() {
            let id = ids.get(&module.name).cloned().unwrap_or_else(|| module.name.clone());
            items.insert(id, self.emit_item(module, &ids));
        }
        let entry_id = resolve(&self.request.project_root, "./", &self.request.config.entry)
            .and_then(|name| ids.get(&name).cloned())
            .unwrap_or_default();

        let mut chunk: String = items.values().map(String::as_str).collect();
        chunk.push_str(&format!("entry \"{}\";\n", entry_id));
        let digest = sha256_hex(chunk.as_bytes());
        let hash: String = digest.chars().take(20).collect();
        let contenthash: String = digest.chars().take(8).collect();
        let filename = self
            .request
            .config
            .filename
            .replace("[name]", CHUNK_NAME)
            .replace("[contenthash]", &contenthash)
            .replace("[hash]", &hash);

        fs::create_dir_all(&self.request.output_dir)
            .map_err(|e| BuildFailure::io("creating output directory", &e))?;
        result.files.push(self.write(&filename, &chunk)?);
        result.entry_files.push(filename.clone());

        if self.request.config.hot {
            if let Some(last) = &self.last_success {
                let changed: Vec<&String> = items
                    .iter()
                    .filter(|(id, text)| last.items.get(*id) != Some(*text))
                    .map(|(_, text)| text)
                    .collect();
                let removed: Vec<&String> = last.items.keys().filter(|id| !items.contains_key(*id)).collect();
                if !changed.is_empty() || !removed.is_empty() {
                    let chunks: Vec<&str> = if changed.is_empty() { vec![] } else { vec![CHUNK_NAME] };
                    let manifest = serde_json::json!({ "h": hash, "c": chunks, "r": [], "m": removed });
                    result
                        .files
                        .push(self.write(&format!("{}.hot-update.json", last.hash), &manifest.to_string())?);
                    if !changed.is_empty() {
                        let update: String = changed.iter().map(|s| s.as_str()).collect();
                        result
                            .files
                            .push(self.write(&format!("{}.{}.hot-update.js", CHUNK_NAME, last.hash), &update)?);
                    }
                }
            }
        }

        result.stats = BuildStats {
            hash: hash.clone(),
            time_ms: start.elapsed().as_millis() as u64,
            chunks: vec![ChunkStats {
                name: CHUNK_NAME.to_string(),
                files: vec![filename],
                modules: items.keys().cloned().collect(),
            }],
            modules: modules
                .values()
                .map(|m| ModuleStats {
                    id: ids.get(&m.name).cloned().unwrap_or_default(),
                    name: m.name.clone(),
                    size: m.text.len(),
                })
                .collect(),
        };
        self.last_success = Some(Emitted { hash, items });
        Ok(result)
    }

    fn next_rebuild(&mut self, watch: &WatchOptions) -> Result<BuildResult, BuildFailure> {
        self.watcher.wait_for_change(watch)?;
        self.build()
    }
}

/// Resolve a relative specifier against the module `from`, trying `x`, `x.js` and `x/index.js`.
fn resolve(root: &Path, from: &str, spec: &str) -> Option<String> {
    if !(spec.starts_with("./") || spec.starts_with("../")) {
        return None;
    }
    let mut parts: Vec<&str> = from.trim_start_matches("./").split('/').collect();
    parts.pop();
    for segment in spec.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    let base = parts.join("/");
    [base.clone(), format!("{}.js", base), format!("{}/index.js", base)]
        .into_iter()
        .find(|candidate| !candidate.is_empty() && root.join(candidate).is_file())
        .map(|found| format!("./{}", found))
}

fn parent_dir(name: &str) -> &str {
    match name.rfind('/') {
        Some(0) | None => ".",
        Some(i) => &name[..i],
    }
}

/// Named and default imports of ESM modules that do not export the imported name.
fn missing_export_warnings(modules: &BTreeMap<String, SourceModule>) -> Vec<BuildDiagnostic> {
    let mut warnings = Vec::new();
    for module in modules.values() {
        for item in &module.program.items {
            let Item::Statement(stmt) = &item.node else {
                continue;
            };
            let Statement::Import(decl) = &stmt.node else {
                continue;
            };
            let Some(target) = module.resolved.get(&decl.source).and_then(|t| modules.get(t)) else {
                continue;
            };
            if !specifiers::uses_module_syntax(&target.program) {
                continue;
            }
            let exported = specifiers::exported_names(&target.program);
            let wanted: Vec<(&str, &str)> = match &decl.clause {
                ImportClause::Default(local) => vec![("default", local.as_str())],
                ImportClause::Named(specs) => specs.iter().map(|s| (s.imported.as_str(), s.local.as_str())).collect(),
                ImportClause::Namespace(_) | ImportClause::SideEffect => Vec::new(),
            };
            for (imported, local) in wanted {
                if exported.contains(imported) {
                    continue;
                }
                let (line, col) = line_col(&module.text, stmt.span.start);
                warnings.push(
                    BuildDiagnostic::warning(format!(
                        "export '{}' (imported as '{}') was not found in '{}'",
                        imported, local, decl.source
                    ))
                    .at(&module.name, line, col),
                );
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuilderConfig;

    struct Project {
        dir: tempfile::TempDir,
    }

    impl Project {
        fn new(files: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("src")).unwrap();
            let project = Self { dir };
            for (name, text) in files {
                project.write(name, text);
            }
            project
        }

        fn write(&self, name: &str, text: &str) {
            let path = self.dir.path().join("src").join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }

        fn session(&self, config: BuilderConfig) -> ScriptSession {
            ScriptSession::new(BuildRequest {
                project_root: self.dir.path().join("src"),
                output_dir: self.dir.path().join("out"),
                cache_dir: self.dir.path().join("cache"),
                config,
            })
            .unwrap()
        }
    }

    #[test]
    fn test_emits_define_chunk_with_rewritten_ids() {
        let project = Project::new(&[
            ("index.js", "import value from \"./lib/value\";\nexpect(value).toBe(1);\n"),
            ("lib/value.js", "export default 1;\n"),
        ]);
        let result = project.session(BuilderConfig::default()).build().unwrap();
        assert!(result.errors.is_empty());
        assert_eq!(result.entry_files, vec!["main.js"]);
        let chunk = &result.files[0].content;
        assert!(chunk.contains("define \"./index.js\" {"));
        assert!(chunk.contains("import value from \"./lib/value.js\";"));
        assert!(chunk.ends_with("entry \"./index.js\";\n"));
        assert!(bundletest_script::parse_source(chunk).is_ok());
        assert_eq!(result.stats.chunks[0].modules, vec!["./index.js", "./lib/value.js"]);
    }

    #[test]
    fn test_missing_module_is_located_error_and_nothing_is_emitted() {
        let project = Project::new(&[("index.js", "let a = 1;\nimport b from \"./missing\";\n")]);
        let result = project.session(BuilderConfig::default()).build().unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.errors[0].to_string(),
            "./index.js:2:15: Module not found: Error: Can't resolve './missing' in '.'"
        );
        assert!(result.files.is_empty());
        assert!(!project.dir.path().join("out/main.js").exists());
    }

    #[test]
    fn test_missing_export_warning() {
        let project = Project::new(&[
            ("index.js", "import { nope as n } from \"./a\";\n"),
            ("a.js", "export let yes = 1;\n"),
        ]);
        let result = project.session(BuilderConfig::default()).build().unwrap();
        assert!(result.errors.is_empty());
        assert_eq!(
            result.warnings[0].message,
            "export 'nope' (imported as 'n') was not found in './a'"
        );
    }

    #[test]
    fn test_numeric_ids_survive_sessions() {
        let project = Project::new(&[("index.js", "require(\"./b\");\n"), ("b.js", "module.exports = 2;\n")]);
        let config = BuilderConfig {
            module_ids: ModuleIds::Numeric,
            ..BuilderConfig::default()
        };
        let first = project.session(config.clone()).build().unwrap();
        assert_eq!(first.stats.chunks[0].modules, vec!["0", "1"]);
        project.write("a.js", "module.exports = 1;\n");
        project.write("index.js", "require(\"./a\");\nrequire(\"./b\");\n");
        let second = project.session(config).build().unwrap();
        let ids: BTreeMap<_, _> = second.stats.modules.iter().map(|m| (m.name.as_str(), m.id.as_str())).collect();
        assert_eq!(ids["./b.js"], "0");
        assert_eq!(ids["./index.js"], "1");
        assert_eq!(ids["./a.js"], "2");
    }

    #[test]
    fn test_hot_updates_are_relative_to_last_success() {
        let project = Project::new(&[
            ("index.js", "import v from \"./value\";\nmodule.hot.accept(\"./value\");\n"),
            ("value.js", "export default 1;\n"),
        ]);
        let mut session = project.session(BuilderConfig {
            hot: true,
            ..BuilderConfig::default()
        });
        let first = session.build().unwrap();
        let first_hash = first.stats.hash.clone();

        project.write("value.js", "export default ;\n");
        let broken = session.build().unwrap();
        assert!(broken.has_errors());

        project.write("value.js", "export default 3;\n");
        let fixed = session.build().unwrap();
        assert_eq!(fixed.compilation, 2);
        let manifest = fixed.file(&format!("{}.hot-update.json", first_hash)).unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&manifest.content).unwrap();
        assert_eq!(manifest["h"], serde_json::json!(fixed.stats.hash));
        assert_eq!(manifest["c"], serde_json::json!(["main"]));
        let update = fixed.file(&format!("main.{}.hot-update.js", first_hash)).unwrap();
        assert!(update.content.contains("define \"./value.js\""));
        assert!(!update.content.contains("./index.js\" {"));
    }

    #[test]
    fn test_filename_template_and_register_format() {
        let project = Project::new(&[("index.js", "import \"./dep\";\n"), ("dep.js", "export let x = 1;\n")]);
        let result = project
            .session(BuilderConfig {
                filename: "[name].[contenthash].js".to_string(),
                format: ModuleFormat::Register,
                ..BuilderConfig::default()
            })
            .build()
            .unwrap();
        let name = &result.entry_files[0];
        assert!(name.starts_with("main.") && name.ends_with(".js") && name.len() == "main.".len() + 8 + 3);
        assert!(result.files[0].content.contains("register \"./index.js\" [\"./dep.js\"] {"));
    }
}
