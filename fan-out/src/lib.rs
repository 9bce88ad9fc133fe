// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keyed fan-out of fallible work with a join-and-aggregate step.
//!
//! Every orchestration phase that runs "one worker per X" (consumers in a
//! zone, zones in a multi-zone setup or a federation clique, executors in a
//! test run) has the same shape: launch everything, never abort a sibling
//! because one worker failed, and report every failure once all workers have
//! been joined. [FanOut] captures that shape. Each worker is spawned on a
//! distinct tokio task under a key identifying the unit of work, and the
//! aggregate error at the join point carries the key and error of every
//! worker that failed.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};

/// The default number of workers allowed to run at once.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// A set of keyed, fallible tokio tasks which execute in parallel, up to a
/// maximum amount of parallelism.
///
/// Tasks beyond the parallelism limit are spawned immediately but wait for a
/// permit before they start executing their future.
pub struct FanOut<K, T, E> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<Result<T, E>>,
    keys: HashMap<Id, K>,
    launched: usize,
}

impl<K, T, E> Default for FanOut<K, T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        FanOut::new()
    }
}

impl<K, T, E> FanOut<K, T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a new [FanOut] allowing [DEFAULT_MAX_PARALLELISM] workers to
    /// run at once.
    pub fn new() -> Self {
        Self::new_with_parallelism(DEFAULT_MAX_PARALLELISM)
    }

    /// Creates a new [FanOut] allowing `max_parallelism` workers to run at
    /// once. A limit of zero is treated as one.
    pub fn new_with_parallelism(max_parallelism: usize) -> Self {
        let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1)));
        FanOut {
            semaphore,
            set: JoinSet::new(),
            keys: HashMap::new(),
            launched: 0,
        }
    }

    /// Spawns `work` under `key`.
    pub fn spawn<F>(&mut self, key: K, work: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let handle = self.set.spawn(async move {
            // Hold onto the permit until the work finishes executing.
            let permit =
                semaphore.acquire_owned().await.expect("semaphore acquire");
            let output = work.await;
            drop(permit);
            output
        });
        self.keys.insert(handle.id(), key);
        self.launched += 1;
    }

    /// Waits for the next worker to finish and returns its key and outcome.
    pub async fn join_next(
        &mut self,
    ) -> Option<(K, Result<T, WorkerFailure<E>>)> {
        let joined = self.set.join_next_with_id().await?;
        let (id, outcome) = match joined {
            Ok((id, Ok(value))) => (id, Ok(value)),
            Ok((id, Err(err))) => (id, Err(WorkerFailure::Failed(err))),
            Err(err) => (err.id(), Err(WorkerFailure::from_join_error(err))),
        };
        let key = self
            .keys
            .remove(&id)
            .expect("every spawned task has a registered key");
        Some((key, outcome))
    }

    /// Waits for every worker and returns each outcome in completion order.
    pub async fn join_all(mut self) -> Vec<(K, Result<T, WorkerFailure<E>>)> {
        let mut outcomes = Vec::with_capacity(self.launched);
        while let Some(outcome) = self.join_next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Waits for every worker. Succeeds with every worker's output if all of
    /// them succeeded; otherwise returns the key and failure of each worker
    /// that did not.
    pub async fn join_all_then_aggregate(
        self,
    ) -> Result<Vec<(K, T)>, FanOutError<K, E>> {
        let attempted = self.launched;
        let mut successes = Vec::with_capacity(attempted);
        let mut failures = Vec::new();
        for (key, outcome) in self.join_all().await {
            match outcome {
                Ok(value) => successes.push((key, value)),
                Err(failure) => failures.push((key, failure)),
            }
        }
        if failures.is_empty() {
            Ok(successes)
        } else {
            Err(FanOutError { attempted, failures })
        }
    }
}

/// Why one worker in a [FanOut] did not produce a value.
#[derive(Debug)]
pub enum WorkerFailure<E> {
    /// The worker ran to completion and returned an error.
    Failed(E),
    /// The worker panicked; the payload is included when it was a string.
    Panicked(String),
    /// The worker's task was cancelled before completing.
    Cancelled,
}

impl<E> WorkerFailure<E> {
    fn from_join_error(err: JoinError) -> Self {
        if err.is_cancelled() {
            return WorkerFailure::Cancelled;
        }
        let payload = err.into_panic();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("<non-string panic payload>")
        };
        WorkerFailure::Panicked(message)
    }

    /// Returns the worker's own error, if it returned one.
    pub fn as_failed(&self) -> Option<&E> {
        match self {
            WorkerFailure::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for WorkerFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFailure::Failed(err) => write!(f, "{err}"),
            WorkerFailure::Panicked(msg) => write!(f, "panicked: {msg}"),
            WorkerFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<E> std::error::Error for WorkerFailure<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerFailure::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// The aggregate failure of a [FanOut]: at least one worker failed.
#[derive(Debug)]
pub struct FanOutError<K, E> {
    /// Number of workers launched, including those that succeeded.
    pub attempted: usize,
    /// Every failed worker, in completion order.
    pub failures: Vec<(K, WorkerFailure<E>)>,
}

impl<K, E> FanOutError<K, E> {
    /// The keys of every failed worker.
    pub fn failed_keys(&self) -> impl Iterator<Item = &K> {
        self.failures.iter().map(|(key, _)| key)
    }
}

impl<K: fmt::Display, E: fmt::Display> fmt::Display for FanOutError<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} workers failed",
            self.failures.len(),
            self.attempted
        )?;
        for (i, (key, failure)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{key} ({failure})")?;
        }
        Ok(())
    }
}

impl<K, E> std::error::Error for FanOutError<K, E>
where
    K: fmt::Debug + fmt::Display,
    E: std::error::Error + 'static,
{
}
