// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State shared by every worker of one orchestration run.

use crate::config::Config;
use crate::database::DatabaseRegistry;
use crate::executor::{Executor, RemoteCommand};
use crate::target::{
    ComposeProject, DirectoryError, MetadataKey, Target, TargetDirectory,
    TargetMetadataCache,
};
use crate::transfer::{FileTransfer, RemoteJson, TransferError};
use semver::Version;
use slog::Logger;
use std::sync::Arc;
use thiserror::Error;

/// First service release whose entry points require Python 3.
const PYTHON3_CUTOFF: Version = Version::new(4, 3, 0);

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read metadata from {target}")]
    Transfer {
        target: String,
        #[source]
        err: TransferError,
    },
    #[error("\"{path}\" on {target} has no string field \"{field}\"")]
    MissingField { target: String, path: String, field: &'static str },
    #[error("{target} reports an invalid service version \"{version}\"")]
    InvalidVersion {
        target: String,
        version: String,
        #[source]
        err: semver::Error,
    },
}

/// The external systems an orchestration run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn TargetDirectory>,
    pub executor: Arc<dyn Executor>,
    pub transfer: Arc<dyn FileTransfer>,
    pub json: Arc<dyn RemoteJson>,
}

/// Everything one orchestration run needs, shared across workers behind an
/// `Arc`.
///
/// The metadata cache lives here so that its lifetime is exactly that of the
/// run.
pub struct OrchestrationContext {
    pub log: Logger,
    pub project: ComposeProject,
    pub config: Config,
    pub directory: Arc<dyn TargetDirectory>,
    pub executor: Arc<dyn Executor>,
    pub transfer: Arc<dyn FileTransfer>,
    pub json: Arc<dyn RemoteJson>,
    pub databases: DatabaseRegistry,
    pub metadata: TargetMetadataCache,
    /// Whether long-running service commands forward their output to the log.
    pub stream_output: bool,
}

impl OrchestrationContext {
    pub fn new(
        log: Logger,
        project: ComposeProject,
        config: Config,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators { directory, executor, transfer, json } =
            collaborators;
        OrchestrationContext {
            log,
            project,
            config,
            directory,
            executor,
            transfer,
            json,
            databases: DatabaseRegistry::with_defaults(),
            metadata: TargetMetadataCache::new(),
            stream_output: false,
        }
    }

    pub fn with_stream_output(mut self, stream_output: bool) -> Self {
        self.stream_output = stream_output;
        self
    }

    pub async fn target(&self, name: &str) -> Result<Target, DirectoryError> {
        self.directory.get(name).await
    }

    /// A command run as the service account in its working directory.
    pub fn service_command(&self, command: impl Into<String>) -> RemoteCommand {
        RemoteCommand::new(command)
            .user(&self.config.service.user)
            .workdir(&self.config.service.working_directory)
            .stream_output(self.stream_output)
    }

    async fn read_string_field(
        &self,
        target: &Target,
        path: &str,
        field: &'static str,
    ) -> Result<String, MetadataError> {
        let document =
            self.json.read_json(target, path).await.map_err(|err| {
                MetadataError::Transfer { target: target.name.clone(), err }
            })?;
        document
            .get(field)
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| MetadataError::MissingField {
                target: target.name.clone(),
                path: path.to_string(),
                field,
            })
    }

    /// The service version installed on `target`, read once per run.
    pub async fn service_version(
        &self,
        target: &Target,
    ) -> Result<Version, MetadataError> {
        let version = self
            .metadata
            .get_or_try_init(&target.name, MetadataKey::ServiceVersion, || {
                self.read_string_field(
                    target,
                    &self.config.service.version_file,
                    "irods_version",
                )
            })
            .await?;
        Version::parse(&version).map_err(|err| MetadataError::InvalidVersion {
            target: target.name.clone(),
            version,
            err,
        })
    }

    /// The interpreter the service's scripts on `target` expect.
    pub async fn python_for(
        &self,
        target: &Target,
    ) -> Result<&'static str, MetadataError> {
        let version = self.service_version(target).await?;
        Ok(if version >= PYTHON3_CUTOFF { "python3" } else { "python" })
    }
}
