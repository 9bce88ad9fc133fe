// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands on targets.

use crate::target::Target;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// A command line to run on a target, with the identity and working
/// directory it should run under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Shell command line, interpreted by `bash -c` on the target.
    pub command: String,
    /// User to run as; `None` runs as the target's default user.
    pub user: Option<String>,
    /// Working directory; `None` uses the target's default.
    pub workdir: Option<String>,
    /// Forward the command's output into the log as it is produced.
    pub stream_output: bool,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        RemoteCommand {
            command: command.into(),
            user: None,
            workdir: None,
            stream_output: false,
        }
    }

    /// Builds a command line from individual arguments, quoting each one.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(shell_words::join(args))
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn stream_output(mut self, stream_output: bool) -> Self {
        self.stream_output = stream_output;
        self
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "[{user}] ")?;
        }
        if let Some(workdir) = &self.workdir {
            write!(f, "(in {workdir}) ")?;
        }
        write!(f, "{}", self.command)
    }
}

/// Exit code and captured standard output of a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
}

/// A command could not be run to completion on its target.
///
/// This is distinct from a command that ran and exited nonzero.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("target {target} is unreachable: {message}")]
    Unreachable { target: String, message: String },
    #[error("I/O error running `{command}` on {target}")]
    Io {
        target: String,
        command: String,
        #[source]
        err: std::io::Error,
    },
    #[error("`{command}` on {target} was terminated by a signal")]
    Terminated { target: String, command: String },
}

/// Runs one command against one target.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` and returns its exit code.
    async fn run(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<i32, ExecError>;

    /// Runs `command` and returns its exit code along with its standard
    /// output.
    async fn output(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ExecError>;
}

/// A command either could not run or ran and failed.
#[derive(Debug, Error)]
pub enum RemoteCommandError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("`{command}` on {target} exited with {exit_code}")]
    Failed { target: String, command: String, exit_code: i32 },
}

/// Runs `command` on `target`, treating a nonzero exit code as an error.
pub async fn ensure_success(
    executor: &dyn Executor,
    target: &Target,
    command: &RemoteCommand,
) -> Result<(), RemoteCommandError> {
    let exit_code = executor.run(target, command).await?;
    if exit_code == 0 {
        Ok(())
    } else {
        Err(RemoteCommandError::Failed {
            target: target.name.clone(),
            command: command.to_string(),
            exit_code,
        })
    }
}
