//! Concurrent suite runner.
//!
//! Cases run in parallel up to `HarnessConfig::jobs`. A case's sandbox is single-threaded, so every case runs on a
//! blocking thread that drives its own future with the runtime handle. Cases declaring the same `shared_cache`
//! group share one cache directory and take turns through the group's mutex.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};

use super::{failure_of, CaseDriver, CaseReport};
use crate::case::Case;
use crate::error::HarnessError;

#[derive(Debug, Clone)]
pub struct SuiteSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration: Duration,
    /// Sorted by case name.
    pub reports: Vec<CaseReport>,
}

impl SuiteSummary {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Run `cases`, calling `on_report` as each one finishes.
#[tracing::instrument(skip_all, fields(cases = cases.len()))]
pub async fn run_suite<F>(driver: Arc<CaseDriver>, cases: Vec<Case>, mut on_report: F) -> Result<SuiteSummary, HarnessError>
where
    F: FnMut(&CaseReport),
{
    let start = Instant::now();
    let total = cases.len();
    let jobs = driver.config().jobs.max(1);
    let semaphore = Arc::new(Semaphore::new(jobs));

    // Keeps the temporary cache root alive until every case finished.
    let (_cache_guard, cache_root): (Option<tempfile::TempDir>, PathBuf) = match &driver.config().work_root {
        Some(root) => (None, root.join("cache")),
        None => {
            let dir = tempfile::Builder::new()
                .prefix("bundletest-cache-")
                .tempdir()
                .map_err(|e| HarnessError::io("creating shared cache root", e))?;
            let path = dir.path().to_path_buf();
            (Some(dir), path)
        }
    };
    let mut groups: HashMap<String, Arc<Mutex<()>>> = HashMap::new();

    let handle = tokio::runtime::Handle::current();
    let mut set = JoinSet::new();
    for case in cases {
        let group = case
            .shared_cache
            .as_ref()
            .map(|name| (Arc::clone(groups.entry(name.clone()).or_default()), cache_root.join(name)));
        let semaphore = Arc::clone(&semaphore);
        let driver = Arc::clone(&driver);
        let handle = handle.clone();
        set.spawn(async move {
            let name = case.name.clone();
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return crashed_report(name, "the suite stopped before the case started".to_string());
            };
            let (_lock, cache) = match group {
                Some((lock, dir)) => (Some(lock.lock_owned().await), Some(dir)),
                None => (None, None),
            };
            match tokio::task::spawn_blocking(move || handle.block_on(driver.run_case(&case, cache))).await {
                Ok(report) => report,
                Err(err) => crashed_report(name, panic_message(err)),
            }
        });
    }

    let mut reports = Vec::with_capacity(total);
    while let Some(joined) = set.join_next().await {
        let report = match joined {
            Ok(report) => report,
            Err(err) => crashed_report("<unnamed>".to_string(), panic_message(err)),
        };
        on_report(&report);
        reports.push(report);
    }
    reports.sort_by(|a, b| a.name.cmp(&b.name));

    let passed = reports.iter().filter(|r| r.passed()).count();
    tracing::debug!(total, passed, "suite finished");
    Ok(SuiteSummary {
        total,
        passed,
        failed: total - passed,
        duration: start.elapsed(),
        reports,
    })
}

/// Report for a case whose thread died; its siblings keep running.
fn crashed_report(name: String, message: String) -> CaseReport {
    tracing::error!(case = %name, %message, "case crashed");
    let err = HarnessError::UncaughtException {
        message: format!("harness crashed while running the case: {}", message),
        asynchronous: false,
    };
    CaseReport {
        name,
        configs: Vec::new(),
        failures: vec![failure_of("-", 0, &err)],
        duration: Duration::ZERO,
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildFailure, BuildRequest, BuildSession, Builder, ScriptBundler};
    use crate::case::discover_cases;
    use crate::config::HarnessConfig;
    use bundletest_core::FailureKind;
    use std::fs;

    fn write(root: &std::path::Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_suite_runs_cases_concurrently_and_reports_each() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/index.js", "expect(1).toBe(1);\n");
        write(dir.path(), "b/index.js", "expect(1).toBe(2);\n");
        write(dir.path(), "c/case.toml", "shared_cache = \"ids\"\n[[config]]\nname = \"n\"\nmodule_ids = \"numeric\"\n");
        write(dir.path(), "c/index.js", "let a = 1;\n");
        write(dir.path(), "d/case.toml", "shared_cache = \"ids\"\n[[config]]\nname = \"n\"\nmodule_ids = \"numeric\"\n");
        write(dir.path(), "d/index.js", "let b = 1;\n");
        let cases = discover_cases(dir.path(), None).unwrap();

        let driver = Arc::new(CaseDriver::new(
            HarnessConfig::default().with_jobs(2),
            Arc::new(ScriptBundler),
        ));
        let mut seen = Vec::new();
        let summary = run_suite(driver, cases, |report| seen.push(report.name.clone()))
            .await
            .unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.failed, 1);
        assert!(!summary.success());
        assert_eq!(seen.len(), 4);
        let names: Vec<&str> = summary.reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert!(!summary.reports[1].passed());
    }

    /// Delegates to the reference bundler, except for configurations named "explode".
    struct ExplodingBuilder;

    impl Builder for ExplodingBuilder {
        fn name(&self) -> &str {
            "exploding"
        }

        fn start(&self, request: BuildRequest) -> Result<Box<dyn BuildSession>, BuildFailure> {
            if request.config.name == "explode" {
                panic!("builder blew up");
            }
            ScriptBundler.start(request)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashing_case_does_not_take_down_siblings() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "boom/case.toml", "[[config]]\nname = \"explode\"\n");
        write(dir.path(), "boom/index.js", "expect(1).toBe(1);\n");
        write(dir.path(), "ok/index.js", "expect(1).toBe(1);\n");
        let cases = discover_cases(dir.path(), None).unwrap();

        let driver = Arc::new(CaseDriver::new(HarnessConfig::default().with_jobs(2), Arc::new(ExplodingBuilder)));
        let mut seen = Vec::new();
        let summary = run_suite(driver, cases, |report| seen.push(report.name.clone()))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["boom", "ok"]);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed, 1);
        let boom = &summary.reports[0];
        assert_eq!(boom.failures[0].kind, FailureKind::UncaughtException);
        assert!(boom.failures[0].message.contains("builder blew up"), "{}", boom.failures[0].message);
        assert!(summary.reports[1].passed());
    }
}
