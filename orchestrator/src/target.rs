// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Targets: the addressable places commands run and files move to and from.

use crate::config::ProjectConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;

/// What a target does within its zone.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Database,
    Provider,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Database => "database",
            Role::Provider => "provider",
            Role::Consumer => "consumer",
        };
        write!(f, "{s}")
    }
}

/// A live target as reported by the [TargetDirectory].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Unique identity (the container name).
    pub name: String,
    pub role: Role,
    /// 1-indexed instance number within the role.
    pub instance: u32,
    /// Image the target was created from, e.g. `postgres:14`.
    pub image: String,
}

impl Target {
    /// Hostname other targets use to reach this one.
    pub fn hostname(&self) -> &str {
        &self.name
    }

    /// The normalized repository of this target's image.
    pub fn image_repo(&self) -> String {
        normalize_image_repo(&self.image)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Reduces an image reference to its bare repository name: registry, path,
/// tag and digest are dropped and the result is lower-cased.
///
/// `docker.io/library/Postgres:14` and `postgres@sha256:...` both normalize
/// to `postgres`.
pub fn normalize_image_repo(image: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_segment =
        without_digest.rsplit('/').next().unwrap_or(without_digest);
    let repo = last_segment.split(':').next().unwrap_or(last_segment);
    repo.to_ascii_lowercase()
}

/// Naming rules for the compose project whose containers are the targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposeProject {
    pub name: String,
    pub services: ProjectConfig,
}

impl ComposeProject {
    pub fn new(name: impl Into<String>, services: ProjectConfig) -> Self {
        ComposeProject { name: name.into(), services }
    }

    pub fn service_for(&self, role: Role) -> &str {
        match role {
            Role::Database => &self.services.database_service,
            Role::Provider => &self.services.provider_service,
            Role::Consumer => &self.services.consumer_service,
        }
    }

    pub fn role_of_service(&self, service: &str) -> Option<Role> {
        [Role::Database, Role::Provider, Role::Consumer]
            .into_iter()
            .find(|role| self.service_for(*role) == service)
    }

    /// Container name of the given role's `instance`-th target.
    pub fn container_name(&self, role: Role, instance: u32) -> String {
        format!("{}-{}-{}", self.name, self.service_for(role), instance)
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("target \"{name}\" not found")]
    NotFound { name: String },
    #[error("failed to query targets: {message}")]
    Query { message: String },
}

/// Name-to-target lookups against the container runtime.
///
/// Read-only from the orchestrator's perspective: targets are created and
/// destroyed elsewhere.
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    async fn get(&self, name: &str) -> Result<Target, DirectoryError>;

    /// Lists live targets, optionally only those with the given role.
    async fn list(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<Target>, DirectoryError>;
}

/// Values memoized per target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    ServiceVersion,
}

/// Write-once memoization of per-target metadata for one orchestration run.
///
/// Entries are populated lazily and never invalidated; that is only valid
/// because a target's identity and the values derived from it do not change
/// while the run is alive. Concurrent first lookups of the same entry share
/// one initialization.
#[derive(Debug, Default)]
pub struct TargetMetadataCache {
    entries: Mutex<HashMap<(String, MetadataKey), Arc<OnceCell<String>>>>,
}

impl TargetMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `(target, key)`, running `init` to
    /// populate it if this is the first successful lookup.
    pub async fn get_or_try_init<F, Fut, E>(
        &self,
        target: &str,
        key: MetadataKey,
        init: F,
    ) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock().unwrap();
            entries.entry((target.to_string(), key)).or_default().clone()
        };
        cell.get_or_try_init(init).await.cloned()
    }
}
