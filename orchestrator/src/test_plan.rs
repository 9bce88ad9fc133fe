// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assigning tests to executors.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TestPlanError {
    #[error("a test plan needs at least one executor")]
    NoExecutors,
}

/// Splits `items` into `buckets` sequences: item `i` goes to bucket
/// `i % buckets`, so every bucket keeps the input's relative order.
pub fn partition<T: Clone>(items: &[T], buckets: usize) -> Vec<Vec<T>> {
    let mut partitions = vec![Vec::new(); buckets];
    if buckets == 0 {
        return partitions;
    }
    for (i, item) in items.iter().enumerate() {
        partitions[i % buckets].push(item.clone());
    }
    partitions
}

/// The tests one executor will run, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub executor: String,
    pub tests: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestPlan {
    pub assignments: Vec<Assignment>,
    /// Stop an executor at its first failing test.
    pub fail_fast: bool,
    /// Extra arguments passed to every test invocation.
    pub options: Vec<String>,
}

impl TestPlan {
    /// Deals `tests` out to `executors` round-robin by list position.
    pub fn round_robin(
        tests: &[String],
        executors: &[String],
        fail_fast: bool,
        options: Vec<String>,
    ) -> Result<TestPlan, TestPlanError> {
        if executors.is_empty() {
            return Err(TestPlanError::NoExecutors);
        }
        let assignments = executors
            .iter()
            .cloned()
            .zip(partition(tests, executors.len()))
            .map(|(executor, tests)| Assignment { executor, tests })
            .collect();
        Ok(TestPlan { assignments, fail_fast, options })
    }

    pub fn test_count(&self) -> usize {
        self.assignments.iter().map(|a| a.tests.len()).sum()
    }
}
