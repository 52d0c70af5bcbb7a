//! Snapshot capture, comparison and storage.
//!
//! A [`Snapshot`] is the order-stable, normalized summary of one [`BuildResult`]. Normalization removes everything
//! that legitimately differs between two correct builds:
//!
//! - the absolute output directory becomes `<output>`
//! - hex runs of eight or more characters (build hashes, content hashes) become `[hash]`, in file names and contents
//! - module ids become the module's source name, wherever the chunk uses a string as a module id
//! - build time is dropped
//!
//! Stored snapshots live at `<case>/__snapshots__/<config>/step-<n>.snap` as pretty JSON and are compared
//! byte-for-byte; a mismatch is reported as a structural [`Diff`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use bundletest_core::lang::keywords::KeywordId;
use bundletest_core::lang::punctuation::PunctuationId;
use bundletest_script::lexer::{Token, TokenKind};
use serde::{Deserialize, Serialize};

use crate::builder::{sha256_hex, BuildResult};
use crate::error::HarnessError;

const HASH_PLACEHOLDER: &str = "[hash]";
const OUTPUT_PLACEHOLDER: &str = "<output>";
const MIN_HASH_LEN: usize = 8;

/// How strictly two configurations' outputs must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityMode {
    /// Same chunks with the same normalized sizes and module sets.
    #[default]
    Structural,
    /// Structural, plus identical normalized content.
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFact {
    pub name: String,
    pub size: usize,
    /// Digest of the normalized content.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFact {
    pub name: String,
    pub files: Vec<String>,
    /// Source names of the chunk's modules.
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub files: Vec<FileFact>,
    pub chunks: Vec<ChunkFact>,
    pub modules: Vec<String>,
    pub errors: usize,
    pub warnings: Vec<String>,
}

impl Snapshot {
    #[tracing::instrument(skip_all, fields(compilation = build.compilation))]
    pub fn capture(build: &BuildResult) -> Snapshot {
        let normalizer = Normalizer::new(build);
        let mut files: Vec<FileFact> = build
            .files
            .iter()
            .map(|file| {
                let content = normalizer.content(&file.content);
                FileFact {
                    name: normalizer.file_name(&file.name),
                    size: content.len(),
                    hash: sha256_hex(content.as_bytes()).chars().take(16).collect(),
                }
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name).then(a.hash.cmp(&b.hash)));

        let mut chunks: Vec<ChunkFact> = build
            .stats
            .chunks
            .iter()
            .map(|chunk| {
                let mut files: Vec<String> = chunk.files.iter().map(|f| normalizer.file_name(f)).collect();
                files.sort();
                let mut modules: Vec<String> = chunk.modules.iter().map(|id| normalizer.module_name(id)).collect();
                modules.sort();
                ChunkFact {
                    name: chunk.name.clone(),
                    files,
                    modules,
                }
            })
            .collect();
        chunks.sort_by(|a, b| a.name.cmp(&b.name));

        let modules: BTreeSet<String> = build.stats.modules.iter().map(|m| m.name.clone()).collect();
        let mut warnings: Vec<String> = build.warnings.iter().map(|w| normalizer.content(&w.to_string())).collect();
        warnings.sort();

        Snapshot {
            files,
            chunks,
            modules: modules.into_iter().collect(),
            errors: build.errors.len(),
            warnings,
        }
    }

    /// Pretty JSON with a trailing newline, as stored on disk.
    pub fn render(&self) -> String {
        let mut text = serde_json::to_string_pretty(self).unwrap_or_default();
        text.push('\n');
        text
    }

    pub fn parse(text: &str) -> Result<Snapshot, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The part of the snapshot a parity check compares.
    ///
    /// Structural parity pairs a chunk's files by extension and size order, so differently named outputs still
    /// line up; exact parity keys them by normalized name and also compares content digests.
    fn parity_view(&self, mode: ParityMode) -> serde_json::Value {
        let chunks: Vec<serde_json::Value> = self
            .chunks
            .iter()
            .map(|chunk| {
                let mut facts: Vec<&FileFact> = chunk
                    .files
                    .iter()
                    .filter_map(|name| self.files.iter().find(|f| &f.name == name))
                    .collect();
                let files: Vec<serde_json::Value> = match mode {
                    ParityMode::Structural => {
                        facts.sort_by(|a, b| extension(&a.name).cmp(extension(&b.name)).then(a.size.cmp(&b.size)));
                        let mut seen: HashMap<&str, usize> = HashMap::new();
                        facts
                            .iter()
                            .map(|f| {
                                let ext = extension(&f.name);
                                let n = seen.entry(ext).or_default();
                                let key = format!("{}#{}", ext, n);
                                *n += 1;
                                serde_json::json!({ "name": key, "size": f.size })
                            })
                            .collect()
                    }
                    ParityMode::Exact => facts
                        .iter()
                        .map(|f| serde_json::json!({ "name": f.name, "size": f.size, "hash": f.hash }))
                        .collect(),
                };
                serde_json::json!({ "name": chunk.name, "files": files, "modules": chunk.modules })
            })
            .collect();
        serde_json::json!({ "chunks": chunks, "modules": self.modules })
    }
}

fn extension(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

struct Normalizer {
    output_dir: String,
    /// Module id -> source name, for ids that differ from their name.
    ids: HashMap<String, String>,
}

impl Normalizer {
    fn new(build: &BuildResult) -> Self {
        let ids = build
            .stats
            .modules
            .iter()
            .filter(|m| m.id != m.name)
            .map(|m| (m.id.clone(), m.name.clone()))
            .collect();
        Self {
            output_dir: build.output_dir.display().to_string(),
            ids,
        }
    }

    fn module_name(&self, id: &str) -> String {
        self.ids.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    fn file_name(&self, name: &str) -> String {
        normalize_hashes(name)
    }

    fn content(&self, text: &str) -> String {
        let text = if self.output_dir.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.output_dir, OUTPUT_PLACEHOLDER)
        };
        let text = if self.ids.is_empty() {
            text
        } else {
            self.map_module_ids(&text)
        };
        normalize_hashes(&text)
    }

    /// Rewrite string literals the chunk uses as module ids. Text that is not bundle script is left alone.
    fn map_module_ids(&self, text: &str) -> String {
        let Ok(tokens) = bundletest_script::lexer::lex(text) else {
            return text.to_string();
        };
        let mut out = text.to_string();
        for index in module_id_literals(&tokens).into_iter().rev() {
            let TokenKind::String(id) = &tokens[index].kind else {
                continue;
            };
            if let Some(name) = self.ids.get(id) {
                let at = tokens[index].span;
                out.replace_range(at.start..at.end, &format!("\"{}\"", name));
            }
        }
        out
    }
}

/// Indices of string tokens in module-id position: item heads (`define`, `register`, `entry`), register and AMD
/// dependency lists, import sources and the arguments of `require`, `accept` and `decline`.
fn module_id_literals(tokens: &[Token]) -> Vec<usize> {
    let keyword = |i: usize, ids: &[KeywordId]| matches!(&tokens[i].kind, TokenKind::Keyword(k) if ids.contains(k));
    let punct = |i: usize, p: PunctuationId| tokens[i].kind == TokenKind::Punctuation(p);
    let callee = |i: usize| matches!(&tokens[i].kind, TokenKind::Ident(name) if ID_CALLEES.contains(&name.as_str()));

    let mut found = Vec::new();
    let mut in_list = false;
    for i in 0..tokens.len() {
        match &tokens[i].kind {
            TokenKind::String(_) => {
                let heads = [KeywordId::Define, KeywordId::Register, KeywordId::Entry, KeywordId::Import, KeywordId::From];
                let after_head = i > 0 && keyword(i - 1, &heads);
                let call_arg = i > 1 && punct(i - 1, PunctuationId::LParen) && callee(i - 2);
                if in_list || after_head || call_arg {
                    found.push(i);
                }
            }
            TokenKind::Punctuation(PunctuationId::LBracket) => {
                let register_deps = i > 1 && keyword(i - 2, &[KeywordId::Register]);
                let callee_list = i > 1 && punct(i - 1, PunctuationId::LParen) && callee(i - 2);
                let amd_deps = i > 1 && punct(i - 1, PunctuationId::LParen) && keyword(i - 2, &[KeywordId::Define]);
                in_list = register_deps || callee_list || amd_deps;
            }
            TokenKind::Punctuation(PunctuationId::RBracket) => in_list = false,
            _ => {}
        }
    }
    found
}

/// Calls whose string arguments are module ids.
const ID_CALLEES: &[&str] = &["require", "accept", "decline"];

/// Replace standalone hex runs of at least eight characters that contain a digit.
pub fn normalize_hashes(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut copied = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_hexdigit() || (i > 0 && is_word_byte(bytes[i - 1])) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
            i += 1;
        }
        let run = &bytes[start..i];
        let bounded = i == bytes.len() || !is_word_byte(bytes[i]);
        if bounded && run.len() >= MIN_HASH_LEN && run.iter().any(u8::is_ascii_digit) {
            out.push_str(&text[copied..start]);
            out.push_str(HASH_PLACEHOLDER);
            copied = i;
        }
    }
    out.push_str(&text[copied..]);
    out
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// One differing leaf of two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// Structural difference between two snapshots; empty when they agree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            if let Some(expected) = &entry.expected {
                writeln!(f, "- {}: {}", entry.path, expected)?;
            }
            if let Some(actual) = &entry.actual {
                writeln!(f, "+ {}: {}", entry.path, actual)?;
            }
        }
        Ok(())
    }
}

/// Leaf-by-leaf comparison of `expected` against `actual`.
pub fn compare(expected: &Snapshot, actual: &Snapshot) -> Diff {
    diff_values(
        &serde_json::to_value(expected).unwrap_or_default(),
        &serde_json::to_value(actual).unwrap_or_default(),
    )
}

/// Compare two configurations' snapshots under `mode`.
pub fn compare_parity(left: &Snapshot, right: &Snapshot, mode: ParityMode) -> Diff {
    diff_values(&left.parity_view(mode), &right.parity_view(mode))
}

fn diff_values(expected: &serde_json::Value, actual: &serde_json::Value) -> Diff {
    let mut left = BTreeMap::new();
    let mut right = BTreeMap::new();
    flatten("", expected, &mut left);
    flatten("", actual, &mut right);
    let paths: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
    let entries = paths
        .into_iter()
        .filter_map(|path| {
            let (l, r) = (left.get(path), right.get(path));
            (l != r).then(|| DiffEntry {
                path: path.clone(),
                expected: l.cloned(),
                actual: r.cloned(),
            })
        })
        .collect();
    Diff { entries }
}

/// Flatten JSON into `path -> leaf`. Array elements carrying a `name` are keyed by it, so reordering or inserting
/// a file shows up as one entry instead of a shifted tail.
fn flatten(path: &str, value: &serde_json::Value, out: &mut BTreeMap<String, String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                flatten(&child_path, child, out);
            }
        }
        serde_json::Value::Array(items) if items.is_empty() => {
            out.insert(path.to_string(), "[]".to_string());
        }
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let key = match item.get("name").and_then(serde_json::Value::as_str) {
                    Some(name) => name.to_string(),
                    None => i.to_string(),
                };
                flatten(&format!("{}[{}]", path, key), item, out);
            }
        }
        leaf => {
            out.insert(path.to_string(), leaf.to_string());
        }
    }
}

/// Result of checking a snapshot against its stored expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Matched,
    /// No expectation existed; the snapshot was written.
    Recorded,
    /// Update mode overwrote a differing expectation.
    Updated,
}

pub fn snapshot_path(snapshot_dir: &Path, config: &str, step: usize) -> PathBuf {
    snapshot_dir.join(config).join(format!("step-{}.snap", step))
}

/// Compare `actual` with the stored snapshot at `path`, recording or updating it as needed.
pub fn check_stored(path: &Path, actual: &Snapshot, update: bool) -> Result<SnapshotStatus, HarnessError> {
    let rendered = actual.render();
    let stored = match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(HarnessError::io(format!("reading {}", path.display()), e)),
    };
    let status = match &stored {
        Some(text) if *text == rendered => return Ok(SnapshotStatus::Matched),
        Some(text) if !update => {
            let expected = Snapshot::parse(text).unwrap_or_default();
            let mut diff = compare(&expected, actual);
            if diff.is_empty() {
                // Same facts, different bytes (hand-edited formatting).
                diff.entries.push(DiffEntry {
                    path: "<file>".to_string(),
                    expected: Some("stored formatting".to_string()),
                    actual: Some("canonical formatting".to_string()),
                });
            }
            return Err(HarnessError::SnapshotMismatch {
                path: path.to_path_buf(),
                diff,
            });
        }
        Some(_) => SnapshotStatus::Updated,
        None => SnapshotStatus::Recorded,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| HarnessError::io(format!("creating {}", parent.display()), e))?;
    }
    std::fs::write(path, rendered).map_err(|e| HarnessError::io(format!("writing {}", path.display()), e))?;
    tracing::debug!(path = %path.display(), ?status, "snapshot written");
    Ok(status)
}
