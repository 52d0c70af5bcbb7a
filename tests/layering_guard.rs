//! Layering guardrails for the vocabulary crate.
//!
//! `bundletest_core` is shared by the script frontend and the harness, so it must stay dependency-free.
//! These tests scan its `Cargo.toml` and fail if a `[dependencies]` table grows an entry, and make sure the
//! script frontend does not reach up into the harness.

fn dependency_names(manifest: &str) -> Vec<String> {
    let mut in_dependencies = false;
    let mut names = Vec::new();

    for raw_line in manifest.lines() {
        let line = raw_line.trim();
        // Track when we enter/exit the `[dependencies]` table.
        if line.starts_with('[') {
            in_dependencies = line == "[dependencies]";
            continue;
        }
        if !in_dependencies || line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_no_comment = line.split('#').next().unwrap_or("").trim();
        if let Some((name, _)) = line_no_comment.split_once('=') {
            names.push(name.trim().to_string());
        }
    }
    names
}

#[test]
fn core_crate_has_no_dependencies() {
    let manifest = include_str!("../crates/bundletest_core/Cargo.toml");
    let deps = dependency_names(manifest);
    assert!(deps.is_empty(), "bundletest_core must not depend on anything, found {:?}", deps);
}

#[test]
fn script_frontend_does_not_depend_on_harness() {
    let manifest = include_str!("../crates/bundletest_script/Cargo.toml");
    let deps = dependency_names(manifest);
    assert!(deps.contains(&"bundletest_core".to_string()));
    assert!(
        !deps.iter().any(|d| d == "bundletest"),
        "the script frontend must stay below the harness: {:?}",
        deps
    );
}
