// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestration of multi-container test environments for the catalog
//! service.
//!
//! A run derives a set of zones from the targets of a compose project
//! ([topology]), drives each zone through its setup pipeline ([setup],
//! [zones]), optionally federates the zones with each other ([federation]),
//! and then distributes a test workload across per-zone executors
//! ([test_plan], [test_run], [retry]). Targets are reached through the
//! [TargetDirectory], [Executor] and [FileTransfer] collaborators, for which
//! [docker] provides the production implementation.

pub mod config;
pub mod context;
pub mod database;
pub mod docker;
pub mod executor;
pub mod federation;
pub mod logs;
pub mod retry;
pub mod setup;
pub mod target;
pub mod test_plan;
pub mod test_run;
pub mod topology;
pub mod transfer;
pub mod zones;

#[cfg(test)]
mod fake;

pub use config::Config;
pub use context::{Collaborators, OrchestrationContext};
pub use executor::Executor;
pub use target::{ComposeProject, Role, Target, TargetDirectory};
pub use transfer::{FileTransfer, RemoteJson};
