//! Property-based tests for snapshot capture
//!
//! These tests use proptest to check that a captured snapshot only depends on what a build
//! produced, never on where it was written or which ids and hashes the builder happened to pick.

use std::path::PathBuf;

use bundletest::builder::{BuildResult, BuildStats, ChunkStats, EmittedFile, ModuleStats};
use bundletest::snapshot::{compare, compare_parity, normalize_hashes, ParityMode, Snapshot};
use proptest::prelude::*;

/// A two-module build as a bundler would report it.
fn build(output_dir: &str, hash: &str, index_id: &str, dep_id: &str) -> BuildResult {
    let file = format!("main.{}.js", &hash[..8]);
    let content = format!(
        "// emitted into {}\ndefine \"{}\" {{\nrequire(\"{}\");\n}}\ndefine \"{}\" {{\nmodule.exports = 1;\n}}\nentry \"{}\";\n",
        output_dir, index_id, dep_id, dep_id, index_id
    );
    BuildResult {
        output_dir: PathBuf::from(output_dir),
        files: vec![EmittedFile {
            name: file.clone(),
            content,
        }],
        entry_files: vec![file.clone()],
        stats: BuildStats {
            hash: hash.to_string(),
            time_ms: 3,
            chunks: vec![ChunkStats {
                name: "main".to_string(),
                files: vec![file],
                modules: vec![index_id.to_string(), dep_id.to_string()],
            }],
            modules: vec![
                ModuleStats {
                    id: index_id.to_string(),
                    name: "./index.js".to_string(),
                    size: 20,
                },
                ModuleStats {
                    id: dep_id.to_string(),
                    name: "./dep.js".to_string(),
                    size: 18,
                },
            ],
        },
        ..BuildResult::default()
    }
}

/// Hex digests that start and end with a digit, so any prefix still normalizes.
fn digest() -> impl Strategy<Value = String> {
    "[0-9][0-9a-f]{18}[0-9]"
}

/// Pairs of distinct numeric module ids.
fn numeric_ids() -> impl Strategy<Value = (String, String)> {
    (0u32..500, 500u32..1000).prop_map(|(a, b)| (a.to_string(), b.to_string()))
}

// =============================================================================
// Capture Properties
// =============================================================================

proptest! {
    /// Property: output location, build hash and module ids never leak into the snapshot
    #[test]
    fn capture_ignores_location_hash_and_ids(
        dir in "/tmp/[a-z]{1,10}/out",
        hash in digest(),
        (index_id, dep_id) in numeric_ids(),
    ) {
        let baseline = Snapshot::capture(&build("/work/out", "0123456789abcdef0123", "./index.js", "./dep.js"));
        let other = Snapshot::capture(&build(&dir, &hash, &index_id, &dep_id));
        prop_assert_eq!(&other, &baseline);
        prop_assert!(compare(&baseline, &other).is_empty());
        prop_assert!(compare_parity(&baseline, &other, ParityMode::Exact).is_empty());
    }

    /// Property: capture is deterministic
    #[test]
    fn capture_is_deterministic(hash in digest(), (index_id, dep_id) in numeric_ids()) {
        let result = build("/work/out", &hash, &index_id, &dep_id);
        prop_assert_eq!(Snapshot::capture(&result).render(), Snapshot::capture(&result).render());
    }
}

// =============================================================================
// Hash Normalization Properties
// =============================================================================

proptest! {
    /// Property: normalizing twice is the same as normalizing once
    #[test]
    fn normalize_hashes_is_idempotent(text in "[0-9a-fA-Fxz_.\\-\\[\\] \n]{0,80}") {
        let once = normalize_hashes(&text);
        prop_assert_eq!(normalize_hashes(&once), once);
    }

    /// Property: a standalone digest is always replaced, wherever it sits
    #[test]
    fn standalone_digest_is_replaced(prefix in "[a-z./ ]{0,10}", hash in digest()) {
        let text = format!("{} {}.js", prefix, hash);
        let normalized = normalize_hashes(&text);
        prop_assert_eq!(normalized, format!("{} [hash].js", prefix));
    }

    /// Property: text without long hex runs passes through untouched
    #[test]
    fn short_hex_runs_are_kept(text in "[0-9a-f]{0,7}( [g-z]{1,5} [0-9a-f]{0,7}){0,4}") {
        prop_assert_eq!(normalize_hashes(&text), text);
    }
}
