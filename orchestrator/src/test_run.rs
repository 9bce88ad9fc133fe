// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running a [TestPlan]: one worker per executor, each running its tests in
//! order.

use crate::context::{MetadataError, OrchestrationContext};
use crate::executor::{ExecError, RemoteCommand};
use crate::target::{DirectoryError, Target};
use crate::test_plan::{Assignment, TestPlan};
use camino::{Utf8Path, Utf8PathBuf};
use fan_out::{FanOut, WorkerFailure};
use slog::{error, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why an executor stopped before running all of its tests.
#[derive(Debug, Error)]
pub enum TestRunError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("test {test} could not be run")]
    Exec {
        test: String,
        #[source]
        err: ExecError,
    },
    #[error("test {test} failed and fail-fast is set")]
    FailFast { test: String },
    #[error("executor worker failed: {0}")]
    Worker(String),
}

/// The outcome of one executor's share of a run.
#[derive(Debug)]
pub struct ExecutorRun {
    pub executor: String,
    pub planned: Vec<String>,
    pub passed: Vec<(String, Duration)>,
    pub failed: Vec<(String, Duration)>,
    /// Set when the executor stopped early.
    pub error: Option<TestRunError>,
    pub duration: Duration,
}

impl ExecutorRun {
    fn new(assignment: &Assignment) -> Self {
        ExecutorRun {
            executor: assignment.executor.clone(),
            planned: assignment.tests.clone(),
            passed: Vec::new(),
            failed: Vec::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// Planned tests that were never attempted.
    pub fn skipped(&self) -> Vec<&str> {
        self.planned
            .iter()
            .filter(|test| {
                !self.passed.iter().any(|(t, _)| t == *test)
                    && !self.failed.iter().any(|(t, _)| t == *test)
            })
            .map(String::as_str)
            .collect()
    }

    pub fn return_code(&self) -> i32 {
        if self.failed.is_empty() && self.error.is_none() {
            0
        } else {
            1
        }
    }
}

/// The outcome of a whole run.
#[derive(Debug)]
pub struct RunSummary {
    pub executors: Vec<ExecutorRun>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn return_code(&self) -> i32 {
        if self.executors.iter().all(|run| run.return_code() == 0) {
            0
        } else {
            1
        }
    }

    /// Every failed test, in executor order.
    pub fn failed_tests(&self) -> Vec<String> {
        self.executors
            .iter()
            .flat_map(|run| run.failed.iter().map(|(test, _)| test.clone()))
            .collect()
    }

    /// Every planned test that did not pass, failed or never attempted, in
    /// executor order and in each executor's planned order.
    pub fn unpassed_tests(&self) -> Vec<String> {
        self.executors
            .iter()
            .flat_map(|run| {
                run.planned
                    .iter()
                    .filter(|test| !run.passed.iter().any(|(t, _)| t == *test))
                    .cloned()
            })
            .collect()
    }

    /// Writes the report to `<output_dir>/<job_name>-summary.txt`.
    pub async fn write_report(
        &self,
        output_dir: &Utf8Path,
        job_name: &str,
    ) -> std::io::Result<Utf8PathBuf> {
        fs_err::tokio::create_dir_all(output_dir).await?;
        let path = output_dir.join(format!("{job_name}-summary.txt"));
        fs_err::tokio::write(&path, self.to_string()).await?;
        Ok(path)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for run in &self.executors {
            writeln!(f, "==== {} ====", run.executor)?;
            writeln!(f, "passed tests:")?;
            for (test, duration) in &run.passed {
                writeln!(f, "    {test} ({duration:.2?})")?;
            }
            writeln!(f, "skipped tests:")?;
            for test in run.skipped() {
                writeln!(f, "    {test}")?;
            }
            writeln!(f, "failed tests:")?;
            for (test, duration) in &run.failed {
                writeln!(f, "    {test} ({duration:.2?})")?;
            }
            if let Some(error) = &run.error {
                writeln!(f, "stopped early: {error}")?;
            }
            writeln!(f, "return code: {}", run.return_code())?;
            writeln!(f, "elapsed time: {:.2?}", run.duration)?;
            writeln!(f)?;
        }
        writeln!(f, "==== summary ====")?;
        let failed = self.failed_tests();
        if failed.is_empty() {
            writeln!(f, "failed tests: none")?;
        } else {
            writeln!(f, "failed tests: {}", failed.join(" "))?;
        }
        writeln!(f, "return code: {}", self.return_code())?;
        write!(f, "elapsed time: {:.2?}", self.duration)
    }
}

fn test_command(
    ctx: &OrchestrationContext,
    python: &str,
    test: &str,
    options: &[String],
) -> RemoteCommand {
    let mut args = vec![
        python.to_string(),
        ctx.config.service.test_script.clone(),
        "--xml_output".to_string(),
        "--run_s".to_string(),
        test.to_string(),
    ];
    args.extend(options.iter().cloned());
    ctx.service_command(shell_words::join(args))
}

async fn run_tests(
    ctx: &OrchestrationContext,
    log: &Logger,
    executor: &Target,
    plan: &TestPlan,
    run: &mut ExecutorRun,
) -> Result<(), TestRunError> {
    let python = ctx.python_for(executor).await?;
    let planned = run.planned.clone();
    for test in &planned {
        let command = test_command(ctx, python, test, &plan.options);
        info!(log, "running test"; "test" => test);
        let start = Instant::now();
        let result = ctx.executor.run(executor, &command).await;
        let elapsed = start.elapsed();
        match result {
            Ok(0) => {
                info!(
                    log,
                    "test passed";
                    "test" => test,
                    "elapsed" => ?elapsed,
                );
                run.passed.push((test.clone(), elapsed));
            }
            Ok(exit_code) => {
                warn!(
                    log,
                    "test failed";
                    "test" => test,
                    "exit_code" => exit_code,
                    "elapsed" => ?elapsed,
                );
                run.failed.push((test.clone(), elapsed));
                if plan.fail_fast {
                    return Err(TestRunError::FailFast { test: test.clone() });
                }
            }
            Err(err) => {
                run.failed.push((test.clone(), elapsed));
                return Err(TestRunError::Exec { test: test.clone(), err });
            }
        }
    }
    Ok(())
}

async fn run_executor(
    ctx: Arc<OrchestrationContext>,
    plan: Arc<TestPlan>,
    assignment: Assignment,
) -> Result<ExecutorRun, TestRunError> {
    let log = ctx.log.new(o!("executor" => assignment.executor.clone()));
    let mut run = ExecutorRun::new(&assignment);
    let start = Instant::now();
    let result = match ctx.target(&assignment.executor).await {
        Ok(executor) => run_tests(&ctx, &log, &executor, &plan, &mut run).await,
        Err(err) => Err(err.into()),
    };
    run.duration = start.elapsed();
    if let Err(err) = result {
        error!(log, "executor stopped early"; "error" => %err);
        run.error = Some(err);
    }
    info!(
        log,
        "executor finished";
        "passed" => run.passed.len(),
        "failed" => run.failed.len(),
        "skipped" => run.skipped().len(),
    );
    Ok(run)
}

/// Runs `plan`, waiting for every executor to finish.
///
/// Fail-fast stops only the executor whose test failed; the others run their
/// whole assignment. A report is produced even when executors fail.
pub async fn run_plan(
    ctx: &Arc<OrchestrationContext>,
    plan: TestPlan,
) -> RunSummary {
    info!(
        ctx.log,
        "running tests";
        "tests" => plan.test_count(),
        "executors" => plan.assignments.len(),
        "fail_fast" => plan.fail_fast,
    );
    let start = Instant::now();
    let plan = Arc::new(plan);
    let mut workers: FanOut<String, ExecutorRun, TestRunError> =
        FanOut::new_with_parallelism(plan.assignments.len());
    for assignment in &plan.assignments {
        workers.spawn(
            assignment.executor.clone(),
            run_executor(
                Arc::clone(ctx),
                Arc::clone(&plan),
                assignment.clone(),
            ),
        );
    }

    let mut runs: BTreeMap<String, ExecutorRun> = BTreeMap::new();
    for (executor, outcome) in workers.join_all().await {
        let run = match outcome {
            Ok(run) => run,
            Err(failure) => {
                let assignment = plan
                    .assignments
                    .iter()
                    .find(|a| a.executor == executor)
                    .cloned()
                    .unwrap_or(Assignment {
                        executor: executor.clone(),
                        tests: Vec::new(),
                    });
                let mut run = ExecutorRun::new(&assignment);
                run.error = Some(match failure {
                    WorkerFailure::Failed(err) => err,
                    other => TestRunError::Worker(other.to_string()),
                });
                run
            }
        };
        runs.insert(executor, run);
    }

    // Report executors in plan order, not completion order.
    let executors = plan
        .assignments
        .iter()
        .filter_map(|a| runs.remove(&a.executor))
        .collect();
    RunSummary { executors, duration: start.elapsed() }
}
