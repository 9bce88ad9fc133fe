// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-running failed tests until the failures stop changing.

use crate::test_run::RunSummary;
use slog::{info, warn, Logger};
use std::collections::BTreeSet;
use std::future::Future;

/// Every run made by [run_until_stuck], oldest first.
#[derive(Debug)]
pub struct RetryOutcome {
    pub attempts: Vec<RunSummary>,
}

impl RetryOutcome {
    pub fn last(&self) -> Option<&RunSummary> {
        self.attempts.last()
    }

    /// The return code of the final attempt.
    pub fn return_code(&self) -> i32 {
        self.last().map_or(0, RunSummary::return_code)
    }
}

/// Runs `tests`, then keeps re-running only the tests that did not pass.
///
/// A test that did not pass either failed or was never attempted because its
/// executor stopped early; both kinds are carried into the next attempt.
///
/// `run` is handed the tests for one attempt. An error from it ends the loop
/// and is returned as is.
///
/// An attempt whose unpassed tests are identical to the previous attempt's
/// counts as "stuck"; an attempt with a different set resets that count.
/// Retrying stops once the run passes, once `max_stuck` consecutive stuck
/// attempts have been made, or immediately after the first failure when
/// `fail_fast` is set.
pub async fn run_until_stuck<F, Fut, E>(
    log: &Logger,
    tests: Vec<String>,
    max_stuck: u32,
    fail_fast: bool,
    mut run: F,
) -> Result<RetryOutcome, E>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<RunSummary, E>>,
{
    let mut attempts = Vec::new();
    let mut pending = tests;
    let mut previous_failures: Option<BTreeSet<String>> = None;
    let mut stuck = 0;

    loop {
        info!(
            log,
            "starting test attempt";
            "attempt" => attempts.len() + 1,
            "tests" => pending.len(),
        );
        let summary = run(pending.clone()).await?;
        let failed = summary.unpassed_tests();
        let return_code = summary.return_code();
        attempts.push(summary);

        if return_code == 0 {
            break;
        }
        if fail_fast {
            info!(log, "not retrying because fail-fast is set");
            break;
        }

        let failures: BTreeSet<String> = failed.iter().cloned().collect();
        if previous_failures.as_ref() == Some(&failures) {
            stuck += 1;
        } else {
            stuck = 0;
        }
        if stuck >= max_stuck || failures.is_empty() {
            warn!(
                log,
                "giving up on failing tests";
                "remaining" => failed.len(),
                "stuck_attempts" => stuck,
            );
            break;
        }

        previous_failures = Some(failures);
        pending = failed;
    }
    Ok(RetryOutcome { attempts })
}
