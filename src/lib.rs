#![forbid(unsafe_code)]
//! bundletest: a conformance-testing harness for module bundlers.
//!
//! A case is a small source project plus a scripted sequence of edits. The harness builds it with a [`Builder`],
//! loads the emitted program into an isolated [`Sandbox`], drives rebuilds and hot updates step by step, and checks
//! the program's own assertions, the builder's diagnostics and stored snapshots along the way.
//!
//! ## Layout
//!
//! - [`sandbox`] - interpreter and host runtime for emitted bundle-script programs
//! - [`loader`] - declarative registration format with live bindings
//! - [`hmr`] - hot-update protocol client
//! - [`builder`] - builder contract, reference bundler, external command builder
//! - [`case`] - fixture discovery and working copies
//! - [`driver`] - per-case step scheduler and concurrent suite runner
//! - [`snapshot`] - normalized build snapshots, diffs and parity
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` and `driver` modules
//!   enforce `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! - **Fixture code**: a fixture that loops or floods the timer queue is stopped by fuel and budgets, never by a
//!   panic.
//!
//! [`Builder`]: builder::Builder
//! [`Sandbox`]: sandbox::Sandbox

pub mod builder;
pub mod case;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod hmr;
pub mod loader;
pub mod sandbox;
pub mod snapshot;

pub use builder::{BuildResult, Builder, CommandBuilder, ScriptBundler};
pub use case::{discover_cases, Case};
pub use config::HarnessConfig;
pub use driver::{run_suite, CaseDriver, CaseReport};
pub use error::{HarnessError, HarnessResult};
pub use sandbox::{Sandbox, SandboxOptions};
pub use snapshot::{Diff, Snapshot};
