//! Sandboxed test execution for merged modules
//!
//! The reward logic only sees the [`Executor`] trait. [`PythonExecutor`] is
//! the process-isolated implementation: one temp directory per call and one
//! interpreter process per test case, each under a wall-clock timeout. A
//! crash, exception or timeout only ever fails the test it happened in.

use crate::attribution::discover_tests;
use crate::python;
use crate::util::{run_command_with_input, tail_chars, DEFAULT_OUTPUT_LIMIT};
use anyhow::{Context, Result};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

const HARNESS_SOURCE: &str = include_str!("harness.py");
const RESULT_MARKER: &str = "__SPLICE_RESULT__";
const MESSAGE_MAX_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub syntax_ok: bool,
    pub passed: usize,
    pub total: usize,
    pub details: BTreeMap<String, TestOutcome>,
    /// Failure/error diagnostics, keyed like `details`
    #[serde(default)]
    pub messages: BTreeMap<String, String>,
    /// Set when the module or test suite blew up before any test could run
    #[serde(default)]
    pub collection_error: Option<String>,
    #[serde(default)]
    pub timed_out: Vec<String>,
}

impl TestRunResult {
    /// Every test recorded failed with the same diagnostic.
    pub fn syntax_failure(test_ids: &[String], diagnostic: &str) -> Self {
        Self::from_outcomes(
            false,
            test_ids
                .iter()
                .map(|id| TestCaseReport::failed(id, TestOutcome::Fail, diagnostic))
                .collect(),
        )
    }

    /// Module compiled but the suite could not be collected.
    pub fn collection_failure(test_ids: &[String], diagnostic: &str) -> Self {
        let mut result = Self::from_outcomes(
            true,
            test_ids
                .iter()
                .map(|id| TestCaseReport::failed(id, TestOutcome::Error, diagnostic))
                .collect(),
        );
        result.collection_error = Some(tail_chars(diagnostic, MESSAGE_MAX_CHARS));
        result
    }

    pub fn from_outcomes(syntax_ok: bool, reports: Vec<TestCaseReport>) -> Self {
        let mut result = Self {
            syntax_ok,
            ..Self::default()
        };
        for report in reports {
            if report.outcome == TestOutcome::Pass {
                result.passed += 1;
            } else if !report.message.is_empty() {
                result.messages.insert(report.id.clone(), report.message);
            }
            if report.timed_out {
                result.timed_out.push(report.id.clone());
            }
            result.details.insert(report.id, report.outcome);
        }
        result.total = result.details.len();
        result
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }

    pub fn all_passed(&self) -> bool {
        self.syntax_ok && self.total > 0 && self.passed == self.total
    }

    pub fn outcome(&self, test_id: &str) -> Option<TestOutcome> {
        self.details.get(test_id).copied()
    }
}

/// Outcome of a single test case before aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseReport {
    pub id: String,
    pub outcome: TestOutcome,
    pub message: String,
    pub timed_out: bool,
}

impl TestCaseReport {
    pub fn passed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            outcome: TestOutcome::Pass,
            message: String::new(),
            timed_out: false,
        }
    }

    pub fn failed(id: &str, outcome: TestOutcome, message: &str) -> Self {
        Self {
            id: id.to_string(),
            outcome,
            message: tail_chars(message, MESSAGE_MAX_CHARS),
            timed_out: false,
        }
    }

    fn timed_out(id: &str, timeout: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::failed(
                id,
                TestOutcome::Error,
                &format!("timed out after {}s", timeout.as_secs_f64()),
            )
        }
    }
}

/// Runs a merged module against a test suite in isolation.
pub trait Executor: Send + Sync {
    fn run(&self, module_source: &str, test_source: &str, timeout: Duration) -> TestRunResult;
}

/// Executes tests with a local Python interpreter, one process per test.
#[derive(Debug, Clone)]
pub struct PythonExecutor {
    python: String,
}

impl Default for PythonExecutor {
    fn default() -> Self {
        Self::new("python3")
    }
}

impl PythonExecutor {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    fn prepare_workspace(module_source: &str, test_source: &str) -> Result<tempfile::TempDir> {
        let dir = tempfile::Builder::new()
            .prefix("splice-sandbox-")
            .tempdir()
            .context("Failed to create sandbox directory")?;
        std::fs::write(dir.path().join("solution.py"), module_source)
            .context("Failed to write solution.py")?;
        std::fs::write(dir.path().join("tests.py"), test_source)
            .context("Failed to write tests.py")?;
        std::fs::write(dir.path().join("harness.py"), HARNESS_SOURCE)
            .context("Failed to write harness.py")?;
        Ok(dir)
    }

    fn invoke(&self, dir: &Path, args: &[&str], timeout: Duration) -> HarnessReply {
        let mut command = Command::new(&self.python);
        command
            .current_dir(dir)
            .args(["-I", "-B", "harness.py"])
            .args(args);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        // Fresh token per process so output printed by the module under test
        // can never pass for the harness result.
        let token = format!("{:032x}", rand::thread_rng().gen::<u128>());
        let input = format!("{}\n", token);

        let output = match run_command_with_input(
            &mut command,
            Some(input.as_bytes()),
            timeout,
            DEFAULT_OUTPUT_LIMIT,
        ) {
            Ok(output) => output,
            Err(error) => return HarnessReply::Crashed(error),
        };
        if output.timed_out {
            return HarnessReply::TimedOut;
        }
        if output.truncated {
            return HarnessReply::Crashed(format!(
                "output exceeded {} bytes",
                DEFAULT_OUTPUT_LIMIT
            ));
        }
        let exit_code = output.status.and_then(|s| s.code());
        match parse_harness_output(&output.stdout, &token) {
            Some(payload) if output.success() => HarnessReply::Payload(payload),
            Some(_) => HarnessReply::Crashed(format!(
                "harness exited abnormally (exit {:?}): {}",
                exit_code,
                tail_chars(output.stderr.trim(), MESSAGE_MAX_CHARS)
            )),
            None => HarnessReply::Crashed(format!(
                "harness produced no result (exit {:?}): {}",
                exit_code,
                tail_chars(output.stderr.trim(), MESSAGE_MAX_CHARS)
            )),
        }
    }

    fn run_case(&self, dir: &Path, test_id: &str, timeout: Duration) -> TestCaseReport {
        match self.invoke(dir, &["run", test_id], timeout) {
            HarnessReply::Payload(payload) => {
                if let Some(error) = payload.collection_error.or(payload.error) {
                    return TestCaseReport::failed(test_id, TestOutcome::Error, &error);
                }
                match payload.outcome {
                    Some(TestOutcome::Pass) => TestCaseReport::passed(test_id),
                    Some(outcome) => {
                        TestCaseReport::failed(test_id, outcome, &payload.message.unwrap_or_default())
                    }
                    None => TestCaseReport::failed(test_id, TestOutcome::Error, "missing outcome"),
                }
            }
            HarnessReply::TimedOut => TestCaseReport::timed_out(test_id, timeout),
            HarnessReply::Crashed(message) => {
                TestCaseReport::failed(test_id, TestOutcome::Error, &message)
            }
        }
    }
}

impl Executor for PythonExecutor {
    fn run(&self, module_source: &str, test_source: &str, timeout: Duration) -> TestRunResult {
        let static_ids = discover_tests(test_source);

        if !python::parses_cleanly(module_source) {
            return TestRunResult::syntax_failure(&static_ids, "syntax error: merged module does not parse");
        }

        let workspace = match Self::prepare_workspace(module_source, test_source) {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(error = %err, "sandbox workspace setup failed");
                return TestRunResult::collection_failure(&static_ids, &format!("{:#}", err));
            }
        };
        let dir = workspace.path();

        let test_ids = match self.invoke(dir, &["collect"], timeout) {
            HarnessReply::Payload(payload) if !payload.syntax_ok => {
                let detail = payload.error.unwrap_or_default();
                return TestRunResult::syntax_failure(
                    &static_ids,
                    &format!("syntax error: {}", detail.trim()),
                );
            }
            HarnessReply::Payload(HarnessPayload {
                collection_error: Some(error),
                ..
            }) => return TestRunResult::collection_failure(&static_ids, &error),
            HarnessReply::Payload(payload) => payload.tests.unwrap_or_default(),
            HarnessReply::TimedOut => {
                return TestRunResult::collection_failure(
                    &static_ids,
                    &format!("timed out after {}s while loading module", timeout.as_secs_f64()),
                )
            }
            HarnessReply::Crashed(message) => {
                tracing::warn!(%message, "sandbox collection crashed");
                return TestRunResult::collection_failure(&static_ids, &message);
            }
        };

        let reports: Vec<TestCaseReport> = test_ids
            .par_iter()
            .map(|id| self.run_case(dir, id, timeout))
            .collect();

        TestRunResult::from_outcomes(true, reports)
    }
}

/// Run `test_source` against `module_source` with the default interpreter.
pub fn run_tests(module_source: &str, test_source: &str, timeout_secs: u64) -> TestRunResult {
    PythonExecutor::default().run(
        module_source,
        test_source,
        Duration::from_secs(timeout_secs.max(1)),
    )
}

#[derive(Debug)]
enum HarnessReply {
    Payload(HarnessPayload),
    TimedOut,
    Crashed(String),
}

#[derive(Debug, Deserialize)]
struct HarnessPayload {
    #[serde(default = "default_true")]
    syntax_ok: bool,
    error: Option<String>,
    collection_error: Option<String>,
    tests: Option<Vec<String>>,
    outcome: Option<TestOutcome>,
    message: Option<String>,
}

fn default_true() -> bool {
    true
}

/// The single marker line carrying `token`, decoded. Zero or several such
/// lines mean the run cannot be trusted.
fn parse_harness_output(stdout: &str, token: &str) -> Option<HarnessPayload> {
    let prefix = format!("{}{}:", RESULT_MARKER, token);
    let mut lines = stdout.lines().filter_map(|line| line.strip_prefix(prefix.as_str()));
    let json = lines.next()?;
    if lines.next().is_some() {
        return None;
    }
    serde_json::from_str(json).ok()
}
