//! Case reporting.

use std::io::{self, Write};

use crate::driver::{CaseFailure, CaseReport, SuiteSummary};

/// Trait for reporting suite progress.
///
/// Implement this trait to customize output (JSON, TAP, etc.)
pub trait CaseReporter {
    /// Called once discovery finished
    fn on_discovery_complete(&mut self, _case_count: usize) {}

    /// Called when a case finished, in completion order
    fn on_case_complete(&mut self, report: &CaseReport);

    /// Called when all cases have completed
    fn on_run_complete(&mut self, summary: &SuiteSummary);
}

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

/// Default console reporter: dots, or one line per case when verbose.
pub struct ConsoleReporter<W: Write = io::Stderr> {
    out: W,
    pub verbose: bool,
    color: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            out: io::stderr(),
            verbose,
            color: true,
        }
    }
}

impl<W: Write> ConsoleReporter<W> {
    /// Report into `out` without colors.
    pub fn with_writer(out: W, verbose: bool) -> Self {
        Self {
            out,
            verbose,
            color: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.color {
            format!("{}{}{}", color, text, RESET)
        } else {
            text.to_string()
        }
    }

    fn write_failure(&mut self, case: &str, failure: &CaseFailure) {
        let heading = if failure.kind.is_tooling() {
            self.paint(YELLOW, "HARNESS MISUSE")
        } else {
            self.paint(RED, "FAILED")
        };
        let _ = writeln!(
            self.out,
            "{} {} [{}] step {}: {}",
            heading,
            case,
            failure.config,
            failure.step,
            failure.kind.as_str()
        );
        for line in failure.message.lines() {
            let _ = writeln!(self.out, "    {}", line);
        }
        if let Some(code) = &failure.code {
            let _ = writeln!(self.out, "    code: {}", code);
        }
        if let Some(help) = &failure.help {
            let _ = writeln!(self.out, "    help: {}", help);
        }
    }
}

impl<W: Write> CaseReporter for ConsoleReporter<W> {
    fn on_discovery_complete(&mut self, case_count: usize) {
        if case_count == 0 {
            let _ = writeln!(self.out, "No cases collected");
        }
    }

    fn on_case_complete(&mut self, report: &CaseReport) {
        let status = match (report.passed(), self.verbose) {
            (true, true) => format!("{} ({}ms)", self.paint(GREEN, "PASSED"), report.duration.as_millis()),
            (true, false) => self.paint(GREEN, "."),
            (false, true) => format!("{} ({}ms)", self.paint(RED, "FAILED"), report.duration.as_millis()),
            (false, false) => self.paint(RED, "F"),
        };
        if self.verbose {
            let _ = writeln!(self.out, "{} ... {}", report.name, status);
        } else {
            let _ = write!(self.out, "{}", status);
        }
    }

    fn on_run_complete(&mut self, summary: &SuiteSummary) {
        if !self.verbose {
            let _ = writeln!(self.out);
        }
        let failed: Vec<&CaseReport> = summary.reports.iter().filter(|r| !r.passed()).collect();
        if !failed.is_empty() {
            let _ = writeln!(self.out);
            for report in failed {
                for failure in &report.failures {
                    self.write_failure(&report.name, failure);
                }
            }
        }
        let _ = writeln!(self.out);

        let mut parts = Vec::new();
        if summary.passed > 0 {
            parts.push(self.paint(GREEN, &format!("{} passed", summary.passed)));
        }
        if summary.failed > 0 {
            parts.push(self.paint(RED, &format!("{} failed", summary.failed)));
        }
        if parts.is_empty() {
            parts.push("no cases".to_string());
        }
        let _ = writeln!(
            self.out,
            "====== {} in {:.2}s ======",
            parts.join(", "),
            summary.duration.as_secs_f64()
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::driver::ConfigReport;
    use bundletest_core::FailureKind;
    use std::time::Duration;

    fn report(name: &str, failures: Vec<CaseFailure>) -> CaseReport {
        CaseReport {
            name: name.to_string(),
            configs: vec![ConfigReport {
                name: "default".to_string(),
                steps_passed: 1,
                failure: failures.first().cloned(),
            }],
            failures,
            duration: Duration::from_millis(3),
        }
    }

    fn summary() -> SuiteSummary {
        let reports = vec![
            report("hot/accept", vec![]),
            report(
                "hot/decline",
                vec![CaseFailure {
                    config: "default".to_string(),
                    step: 1,
                    kind: FailureKind::UpdateFailed,
                    message: "hot update failed: Aborted because of self decline: ./a.js".to_string(),
                    code: Some("bundletest::update_failed".to_string()),
                    help: None,
                }],
            ),
            report(
                "watch/await",
                vec![CaseFailure {
                    config: "default".to_string(),
                    step: 2,
                    kind: FailureKind::HarnessUsageError,
                    message: "harness misuse: fixture still awaits an update after the last step".to_string(),
                    code: Some("bundletest::harness_usage".to_string()),
                    help: Some("every awaited NEXT_HMR() needs a later step".to_string()),
                }],
            ),
        ];
        SuiteSummary {
            total: 3,
            passed: 1,
            failed: 2,
            duration: Duration::ZERO,
            reports,
        }
    }

    #[test]
    fn test_console_report_dots() {
        let summary = summary();
        let mut reporter = ConsoleReporter::with_writer(Vec::new(), false);
        for r in &summary.reports {
            reporter.on_case_complete(r);
        }
        reporter.on_run_complete(&summary);
        let output = String::from_utf8(reporter.into_inner()).unwrap();
        insta::assert_snapshot!(output);
    }

    #[test]
    fn test_console_report_verbose_lines() {
        let summary = summary();
        let mut reporter = ConsoleReporter::with_writer(Vec::new(), true);
        reporter.on_case_complete(&summary.reports[0]);
        reporter.on_case_complete(&summary.reports[1]);
        let output = String::from_utf8(reporter.into_inner()).unwrap();
        assert_eq!(output, "hot/accept ... PASSED (3ms)\nhot/decline ... FAILED (3ms)\n");
    }
}
