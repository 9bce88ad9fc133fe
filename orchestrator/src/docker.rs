// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Targets backed by the containers of a compose project, driven through the
//! `docker` CLI.

use crate::executor::{CommandOutput, ExecError, Executor, RemoteCommand};
use crate::target::{
    ComposeProject, DirectoryError, Role, Target, TargetDirectory,
};
use crate::transfer::{FileTransfer, TransferError};
use async_trait::async_trait;
use camino::Utf8Path;
use slog::{debug, info, Logger};
use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

const PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "com.docker.compose.service";
const NUMBER_LABEL: &str = "com.docker.compose.container-number";

/// Exit codes `docker exec` uses for its own failures, as opposed to those of
/// the command it runs.
const DOCKER_EXIT_CODES: std::ops::RangeInclusive<i32> = 125..=127;

/// Whether a failed `docker exec` was refused by docker itself (for example
/// because the container is gone or stopped) rather than run in the target.
fn is_docker_failure(exit_code: i32, stderr: &str) -> bool {
    DOCKER_EXIT_CODES.contains(&exit_code)
        && (stderr.starts_with("Error response from daemon:")
            || stderr.starts_with("Error: No such container"))
}

/// Wrapper for `tokio::process::Command` where the builder methods take and
/// return `self`.
struct Command {
    inner: tokio::process::Command,
    stdin: Option<Stdio>,
    stdout: Option<Stdio>,
}

/// What a finished process left behind. `stdout` is empty when it was
/// redirected elsewhere.
struct Finished {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Finished {
    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

impl Command {
    fn new(program: impl AsRef<OsStr>) -> Command {
        Command {
            inner: tokio::process::Command::new(program),
            stdin: None,
            stdout: None,
        }
    }

    fn arg(mut self, arg: impl AsRef<OsStr>) -> Command {
        self.inner.arg(arg);
        self
    }

    fn args(
        mut self,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    ) -> Command {
        self.inner.args(args);
        self
    }

    fn stdin(mut self, stdin: impl Into<Stdio>) -> Command {
        self.stdin = Some(stdin.into());
        self
    }

    fn stdout(mut self, stdout: impl Into<Stdio>) -> Command {
        self.stdout = Some(stdout.into());
        self
    }

    /// Runs the command to completion, collecting whatever output was not
    /// redirected. With `stream` set, each line is also logged as it arrives,
    /// prefixed with `prefix`.
    async fn finish(
        mut self,
        log: &Logger,
        prefix: &str,
        stream: bool,
    ) -> io::Result<Finished> {
        let description = self.to_string();
        self.inner
            .stdin(self.stdin.take().unwrap_or_else(Stdio::null))
            .stdout(self.stdout.take().unwrap_or_else(Stdio::piped))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(log, "running: {}", description);
        let start = Instant::now();
        let mut child = self.inner.spawn()?;

        let stream_log = stream.then(|| log.clone());
        let stdout = child.stdout.take().map(|out| {
            spawn_reader(stream_log.clone(), prefix.to_string(), out)
        });
        let stderr = child
            .stderr
            .take()
            .map(|err| spawn_reader(stream_log, prefix.to_string(), err));

        let status = child.wait().await?;
        debug!(
            log,
            "process exited with {} ({:?})",
            status,
            Instant::now().saturating_duration_since(start)
        );
        Ok(Finished {
            status,
            stdout: join_reader(stdout).await?,
            stderr: join_reader(stderr).await?,
        })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let command = self.inner.as_std();
        write!(
            f,
            "{}",
            shell_words::quote(&command.get_program().to_string_lossy())
        )?;
        for arg in command.get_args() {
            write!(f, " {}", shell_words::quote(&arg.to_string_lossy()))?;
        }
        Ok(())
    }
}

fn spawn_reader(
    log: Option<Logger>,
    prefix: String,
    reader: impl AsyncRead + Send + Unpin + 'static,
) -> tokio::task::JoinHandle<io::Result<Vec<u8>>> {
    let mut reader = BufReader::new(reader);
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            // We have no control over the output of the commands we run, so
            // read until a newline without relying on valid UTF-8.
            let size = reader.read_until(b'\n', &mut line).await?;
            if size == 0 {
                return Ok(collected);
            }
            if let Some(log) = &log {
                info!(
                    log,
                    "{}{}",
                    prefix,
                    String::from_utf8_lossy(&line).trim_end()
                );
            }
            collected.extend_from_slice(&line);
        }
    })
}

async fn join_reader(
    handle: Option<tokio::task::JoinHandle<io::Result<Vec<u8>>>>,
) -> io::Result<Vec<u8>> {
    match handle {
        Some(handle) => handle.await.map_err(io::Error::other)?,
        None => Ok(Vec::new()),
    }
}

/// Parses one line of the `docker ps` format used by [DockerCli::list].
fn parse_ps_line(project: &ComposeProject, line: &str) -> Option<Target> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim();
    let image = fields.next()?.trim();
    let service = fields.next()?.trim();
    let instance = fields.next()?.trim().parse().ok()?;
    let role = project.role_of_service(service)?;
    Some(Target {
        name: name.to_string(),
        role,
        instance,
        image: image.to_string(),
    })
}

/// The `docker` CLI as the target directory, executor and file transfer for
/// one compose project.
pub struct DockerCli {
    log: Logger,
    project: ComposeProject,
    program: String,
}

impl DockerCli {
    pub fn new(log: Logger, project: ComposeProject) -> Self {
        Self::with_program(log, project, "docker")
    }

    /// Like [DockerCli::new], running `program` in place of `docker`.
    pub fn with_program(
        log: Logger,
        project: ComposeProject,
        program: impl Into<String>,
    ) -> Self {
        DockerCli { log, project, program: program.into() }
    }

    fn docker(&self) -> Command {
        Command::new(&self.program)
    }

    fn exec_command(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Command {
        let mut docker = self.docker().arg("exec");
        if let Some(user) = &command.user {
            docker = docker.arg("-u").arg(user);
        }
        if let Some(workdir) = &command.workdir {
            docker = docker.arg("-w").arg(workdir);
        }
        docker.arg(&target.name).args(["bash", "-c"]).arg(&command.command)
    }

    async fn exec(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ExecError> {
        let prefix = format!("[{}] ", target.name);
        let finished = self
            .exec_command(target, command)
            .finish(&self.log, &prefix, command.stream_output)
            .await
            .map_err(|err| ExecError::Io {
                target: target.name.clone(),
                command: command.to_string(),
                err,
            })?;

        let Some(exit_code) = finished.status.code() else {
            return Err(ExecError::Terminated {
                target: target.name.clone(),
                command: command.to_string(),
            });
        };
        let stderr = finished.stderr();
        if is_docker_failure(exit_code, &stderr) {
            return Err(ExecError::Unreachable {
                target: target.name.clone(),
                message: stderr,
            });
        }
        if exit_code != 0 && !stderr.is_empty() {
            debug!(
                self.log,
                "command failed";
                "target" => &target.name,
                "exit_code" => exit_code,
                "stderr" => &stderr,
            );
        }
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&finished.stdout).into_owned(),
        })
    }

    fn runtime_error(target: &Target, finished: &Finished) -> TransferError {
        TransferError::Runtime {
            target: target.name.clone(),
            message: format!("{}: {}", finished.status, finished.stderr()),
        }
    }
}

#[async_trait]
impl TargetDirectory for DockerCli {
    async fn get(&self, name: &str) -> Result<Target, DirectoryError> {
        self.list(None)
            .await?
            .into_iter()
            .find(|target| target.name == name)
            .ok_or_else(|| DirectoryError::NotFound { name: name.to_string() })
    }

    async fn list(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<Target>, DirectoryError> {
        let format = format!(
            "{{{{.Names}}}}\t{{{{.Image}}}}\t\
             {{{{.Label \"{SERVICE_LABEL}\"}}}}\t\
             {{{{.Label \"{NUMBER_LABEL}\"}}}}"
        );
        let finished = self
            .docker()
            .arg("ps")
            .arg("--filter")
            .arg(format!("label={PROJECT_LABEL}={}", self.project.name))
            .arg("--format")
            .arg(format)
            .finish(&self.log, "", false)
            .await
            .map_err(|err| DirectoryError::Query { message: err.to_string() })?;
        if !finished.status.success() {
            return Err(DirectoryError::Query { message: finished.stderr() });
        }

        let stdout = String::from_utf8_lossy(&finished.stdout);
        let mut targets: Vec<Target> = stdout
            .lines()
            .filter_map(|line| parse_ps_line(&self.project, line))
            .filter(|target| role.map_or(true, |role| target.role == role))
            .collect();
        targets.sort_by(|a, b| (a.role, a.instance).cmp(&(b.role, b.instance)));
        Ok(targets)
    }
}

#[async_trait]
impl Executor for DockerCli {
    async fn run(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<i32, ExecError> {
        self.exec(target, command).await.map(|output| output.exit_code)
    }

    async fn output(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ExecError> {
        self.exec(target, command).await
    }
}

#[async_trait]
impl FileTransfer for DockerCli {
    async fn copy_in_as_archive(
        &self,
        target: &Target,
        local_archive: &Utf8Path,
        remote_dir: &str,
    ) -> Result<String, TransferError> {
        let mkdir = RemoteCommand::from_args(["mkdir", "-p", remote_dir])
            .user("root");
        let exit_code = self.run(target, &mkdir).await.map_err(|err| {
            TransferError::Runtime {
                target: target.name.clone(),
                message: err.to_string(),
            }
        })?;
        if exit_code != 0 {
            return Err(TransferError::Runtime {
                target: target.name.clone(),
                message: format!("could not create {remote_dir}"),
            });
        }

        let archive = std::fs::File::open(local_archive).map_err(|err| {
            TransferError::Io { path: local_archive.to_owned(), err }
        })?;
        let finished = self
            .docker()
            .arg("cp")
            .arg("-")
            .arg(format!("{}:{remote_dir}", target.name))
            .stdin(archive)
            .finish(&self.log, "", false)
            .await
            .map_err(|err| TransferError::Io {
                path: local_archive.to_owned(),
                err,
            })?;
        if !finished.status.success() {
            return Err(Self::runtime_error(target, &finished));
        }
        Ok(remote_dir.to_string())
    }

    async fn fetch_archive(
        &self,
        target: &Target,
        remote_path: &str,
        archive_path: &Utf8Path,
    ) -> Result<(), TransferError> {
        let io_err =
            |err| TransferError::Io { path: archive_path.to_owned(), err };
        let archive = std::fs::File::create(archive_path).map_err(io_err)?;
        let finished = self
            .docker()
            .arg("cp")
            .arg(format!("{}:{remote_path}", target.name))
            .arg("-")
            .stdout(archive)
            .finish(&self.log, "", false)
            .await
            .map_err(io_err)?;
        if !finished.status.success() {
            return Err(Self::runtime_error(target, &finished));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ProjectConfig;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use catalog_test_utils::dev::test_setup_log;
    use std::os::unix::fs::PermissionsExt;

    fn project() -> ComposeProject {
        ComposeProject::new("proj", ProjectConfig::default())
    }

    fn provider() -> Target {
        Target {
            name: "proj-catalog-service-provider-1".to_string(),
            role: Role::Provider,
            instance: 1,
            image: "catalog-provider".to_string(),
        }
    }

    #[test]
    fn test_parse_ps_line() {
        let project = project();
        assert_eq!(
            parse_ps_line(
                &project,
                "proj-catalog-service-consumer-3\tcatalog-consumer:4.3.1\t\
                 catalog-service-consumer\t3"
            ),
            Some(Target {
                name: "proj-catalog-service-consumer-3".to_string(),
                role: Role::Consumer,
                instance: 3,
                image: "catalog-consumer:4.3.1".to_string(),
            })
        );
        // Services outside the known roles are ignored.
        assert_eq!(
            parse_ps_line(&project, "proj-proxy-1\tnginx\tproxy\t1"),
            None
        );
        assert_eq!(
            parse_ps_line(&project, "proj-catalog-1\tpostgres:14\tcatalog\tx"),
            None
        );
        assert_eq!(parse_ps_line(&project, "truncated"), None);
    }

    #[test]
    fn test_docker_failures_are_told_apart_from_command_failures() {
        assert!(is_docker_failure(
            125,
            "Error response from daemon: container abc is not running"
        ));
        assert!(is_docker_failure(125, "Error: No such container: abc"));
        // The command itself failed and happened to mention a container.
        assert!(!is_docker_failure(
            1,
            "AssertionError: resource server is not running"
        ));
        assert!(!is_docker_failure(127, "bash: iadmin: command not found"));
        assert!(!is_docker_failure(
            1,
            "Error response from daemon: container abc is not running"
        ));
    }

    /// Writes an executable script standing in for `docker` that prints
    /// `stderr` and exits with `exit_code`.
    fn stub_docker(
        dir: &Utf8TempDir,
        exit_code: i32,
        stderr: &str,
    ) -> String {
        let path = dir.path().join("docker");
        let script = format!(
            "#!/bin/sh\nprintf '%s\\n' {} >&2\nexit {exit_code}\n",
            shell_words::quote(stderr)
        );
        fs_err::write(&path, script).unwrap();
        let mode = std::fs::Permissions::from_mode(0o755);
        fs_err::set_permissions(&path, mode).unwrap();
        path.into_string()
    }

    #[tokio::test]
    async fn test_exec_exit_codes() {
        let logctx = test_setup_log("test_exec_exit_codes");
        let target = provider();
        let command = RemoteCommand::new("python3 run_tests.py");

        let dir = Utf8TempDir::new().unwrap();
        let program = stub_docker(
            &dir,
            1,
            "AssertionError: resource server is not running",
        );
        let docker =
            DockerCli::with_program(logctx.log.clone(), project(), program);
        assert_eq!(docker.run(&target, &command).await.unwrap(), 1);

        let dir = Utf8TempDir::new().unwrap();
        let program = stub_docker(
            &dir,
            125,
            "Error response from daemon: container \
             proj-catalog-service-provider-1 is not running",
        );
        let docker =
            DockerCli::with_program(logctx.log.clone(), project(), program);
        assert_matches!(
            docker.run(&target, &command).await,
            Err(ExecError::Unreachable { ref target, .. })
                if target == "proj-catalog-service-provider-1"
        );
        logctx.cleanup_successful();
    }

    #[test]
    fn test_exec_command_line() {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let docker = DockerCli::new(log, project());
        let target = provider();
        let command = RemoteCommand::new("./irodsctl restart")
            .user("irods")
            .workdir("/var/lib/irods");
        assert_eq!(
            docker.exec_command(&target, &command).to_string(),
            "docker exec -u irods -w /var/lib/irods \
             proj-catalog-service-provider-1 bash -c './irodsctl restart'"
        );
    }
}
