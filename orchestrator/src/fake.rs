// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators for unit tests.

use crate::config::{Config, ProjectConfig, ServiceConfig};
use crate::context::{Collaborators, OrchestrationContext};
use crate::executor::{CommandOutput, ExecError, Executor, RemoteCommand};
use crate::target::{
    ComposeProject, DirectoryError, Role, Target, TargetDirectory,
};
use crate::transfer::{FileTransfer, RemoteJson, TransferError};
use async_trait::async_trait;
use camino::Utf8Path;
use catalog_test_utils::dev::archive::{
    write_directory_archive, write_file_archive,
};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const PROJECT: &str = "proj";
pub const PROVIDER_IMAGE: &str = "catalog-provider:latest";
pub const CONSUMER_IMAGE: &str = "catalog-consumer:latest";

pub fn project() -> ComposeProject {
    ComposeProject::new(PROJECT, ProjectConfig::default())
}

pub struct FakeDirectory {
    targets: Vec<Target>,
    lists: AtomicUsize,
}

impl FakeDirectory {
    pub fn new(targets: Vec<Target>) -> Self {
        FakeDirectory { targets, lists: AtomicUsize::new(0) }
    }

    /// Number of `list` calls made so far.
    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// `zones` database and provider targets plus `consumers` consumers.
    pub fn cluster(
        project: &ComposeProject,
        database_image: &str,
        zones: u32,
        consumers: u32,
    ) -> Self {
        let mut targets = Vec::new();
        let mut add = |role, instance, image: &str| {
            targets.push(Target {
                name: project.container_name(role, instance),
                role,
                instance,
                image: image.to_string(),
            })
        };
        for instance in 1..=zones {
            add(Role::Database, instance, database_image);
            add(Role::Provider, instance, PROVIDER_IMAGE);
        }
        for instance in 1..=consumers {
            add(Role::Consumer, instance, CONSUMER_IMAGE);
        }
        FakeDirectory::new(targets)
    }
}

#[async_trait]
impl TargetDirectory for FakeDirectory {
    async fn get(&self, name: &str) -> Result<Target, DirectoryError> {
        self.targets
            .iter()
            .find(|target| target.name == name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound { name: name.to_string() })
    }

    async fn list(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<Target>, DirectoryError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .targets
            .iter()
            .filter(|target| role.map_or(true, |role| target.role == role))
            .cloned()
            .collect())
    }
}

/// One recorded [Executor] call.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub target: String,
    pub command: String,
    pub user: Option<String>,
    pub workdir: Option<String>,
}

type Handler = Box<
    dyn Fn(&Target, &RemoteCommand) -> Result<CommandOutput, ExecError>
        + Send
        + Sync,
>;

/// An [Executor] whose results come from a handler closure, recording every
/// invocation.
pub struct FakeExecutor {
    handler: Handler,
    invocations: Mutex<Vec<Invocation>>,
}

pub fn exit(exit_code: i32) -> Result<CommandOutput, ExecError> {
    Ok(CommandOutput { exit_code, stdout: String::new() })
}

impl FakeExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Target, &RemoteCommand) -> Result<CommandOutput, ExecError>
            + Send
            + Sync
            + 'static,
    {
        FakeExecutor {
            handler: Box::new(handler),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_, _| exit(0))
    }

    /// Commands containing `pattern` exit with `exit_code`; all others
    /// succeed.
    pub fn failing_when(pattern: &str, exit_code: i32) -> Self {
        let pattern = pattern.to_string();
        Self::new(move |_, command| {
            if command.command.contains(&pattern) {
                exit(exit_code)
            } else {
                exit(0)
            }
        })
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocations_on(&self, target: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|invocation| invocation.target == target)
            .collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|invocation| invocation.command.contains(pattern))
            .count()
    }

    fn call(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ExecError> {
        self.invocations.lock().unwrap().push(Invocation {
            target: target.name.clone(),
            command: command.command.clone(),
            user: command.user.clone(),
            workdir: command.workdir.clone(),
        });
        (self.handler)(target, command)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn run(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<i32, ExecError> {
        self.call(target, command).map(|output| output.exit_code)
    }

    async fn output(
        &self,
        target: &Target,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ExecError> {
        self.call(target, command)
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    databases: BTreeSet<String>,
    users: BTreeSet<String>,
}

/// A PostgreSQL server that understands the statements and probes the
/// `postgres` strategy issues.
#[derive(Clone, Default)]
pub struct FakeCatalogDatabase {
    state: Arc<Mutex<CatalogState>>,
}

fn statement_subject(statement: &str, prefix: &str) -> Option<String> {
    let rest = statement.strip_prefix(prefix)?.trim_start();
    let rest = rest.strip_prefix("IF EXISTS").unwrap_or(rest).trim_start();
    let word = rest.split(|c: char| c.is_whitespace() || c == ';').next()?;
    Some(word.trim_matches('"').to_string())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter().find_map(|arg| arg.strip_prefix(flag).map(str::to_string))
}

impl FakeCatalogDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains(name)
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.state.lock().unwrap().users.contains(name)
    }

    pub fn executor(&self) -> FakeExecutor {
        let database = self.clone();
        FakeExecutor::new(move |_, command| {
            let args =
                shell_words::split(&command.command).unwrap_or_default();
            exit(database.interpret(&args))
        })
    }

    fn interpret(&self, args: &[String]) -> i32 {
        let mut state = self.state.lock().unwrap();
        if let Some(probe) = flag_value(args, "--command=") {
            assert_eq!(probe, "SELECT 1");
            let database_ok = flag_value(args, "--dbname=").map_or(
                true,
                |name| name == "postgres" || state.databases.contains(&name),
            );
            let user_ok = flag_value(args, "--username=")
                .map_or(true, |name| state.users.contains(&name));
            return if database_ok && user_ok { 0 } else { 2 };
        }

        let Some(position) = args.iter().position(|arg| arg == "--command")
        else {
            return 0;
        };
        let statement = &args[position + 1];
        let changed = if let Some(name) =
            statement_subject(statement, "CREATE DATABASE")
        {
            state.databases.insert(name)
        } else if let Some(name) = statement_subject(statement, "DROP DATABASE")
        {
            state.databases.remove(&name);
            true
        } else if let Some(name) = statement_subject(statement, "CREATE USER") {
            state.users.insert(name)
        } else if let Some(name) = statement_subject(statement, "DROP USER") {
            state.users.remove(&name);
            true
        } else {
            true
        };
        // Creating something that already exists is an error, as in psql.
        if changed {
            0
        } else {
            1
        }
    }
}

/// Per-target zone catalogs that understand `iadmin lz` and `iadmin mkzone`,
/// refusing to register the same zone twice.
#[derive(Clone, Default)]
pub struct FakeZoneCatalog {
    zones: Arc<Mutex<BTreeMap<String, BTreeSet<String>>>>,
}

impl FakeZoneCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zones_on(&self, target: &str) -> BTreeSet<String> {
        self.zones.lock().unwrap().get(target).cloned().unwrap_or_default()
    }

    pub fn executor(&self) -> FakeExecutor {
        let catalog = self.clone();
        FakeExecutor::new(move |target, command| {
            let args =
                shell_words::split(&command.command).unwrap_or_default();
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let mut zones = catalog.zones.lock().unwrap();
            let known = zones.entry(target.name.clone()).or_default();
            match args.as_slice() {
                ["iadmin", "lz"] => {
                    let stdout =
                        known.iter().map(|zone| format!("{zone}\n")).collect();
                    Ok(CommandOutput { exit_code: 0, stdout })
                }
                ["iadmin", "mkzone", zone, ..] => {
                    exit(if known.insert(zone.to_string()) { 0 } else { 3 })
                }
                _ => exit(0),
            }
        })
    }
}

/// A [FileTransfer] over an in-memory map of `(target, path)` to contents.
#[derive(Default)]
pub struct FakeTransfer {
    files: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    unreachable: Mutex<BTreeSet<String>>,
    fetches: AtomicUsize,
}

impl FakeTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, target: &str, path: &str, contents: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert((target.to_string(), path.to_string()), contents.to_vec());
    }

    pub fn stored(&self, target: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&(target.to_string(), path.to_string()))
            .cloned()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Makes every transfer involving `target` fail.
    pub fn set_unreachable(&self, target: &str) {
        self.unreachable.lock().unwrap().insert(target.to_string());
    }

    fn check_reachable(&self, target: &Target) -> Result<(), TransferError> {
        if self.unreachable.lock().unwrap().contains(&target.name) {
            return Err(TransferError::Runtime {
                target: target.name.clone(),
                message: "no such container".to_string(),
            });
        }
        Ok(())
    }
}

fn fixture_error(target: &Target, err: anyhow::Error) -> TransferError {
    TransferError::Runtime {
        target: target.name.clone(),
        message: format!("{err:#}"),
    }
}

#[async_trait]
impl FileTransfer for FakeTransfer {
    async fn copy_in_as_archive(
        &self,
        target: &Target,
        local_archive: &Utf8Path,
        remote_dir: &str,
    ) -> Result<String, TransferError> {
        self.check_reachable(target)?;
        let io_err =
            |err| TransferError::Io { path: local_archive.to_owned(), err };
        let file = fs_err::File::open(local_archive).map_err(io_err)?;
        let mut archive = tar::Archive::new(file);
        let remote_dir = remote_dir.trim_end_matches('/');
        for entry in archive.entries().map_err(io_err)? {
            let mut entry = entry.map_err(io_err)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(io_err)?.display().to_string();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).map_err(io_err)?;
            let remote_path = format!("{remote_dir}/{path}");
            self.insert(&target.name, &remote_path, &contents);
        }
        Ok(remote_dir.to_string())
    }

    async fn fetch_archive(
        &self,
        target: &Target,
        remote_path: &str,
        archive_path: &Utf8Path,
    ) -> Result<(), TransferError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(target)?;
        let remote_path = remote_path.trim_end_matches('/');
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path);

        if let Some(contents) = self.stored(&target.name, remote_path) {
            return write_file_archive(archive_path, name, &contents)
                .map_err(|err| fixture_error(target, err));
        }

        let prefix = format!("{remote_path}/");
        let files: Vec<(String, Vec<u8>)> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, path), _)| {
                *t == target.name && path.starts_with(&prefix)
            })
            .map(|((_, path), contents)| {
                (path[prefix.len()..].to_string(), contents.clone())
            })
            .collect();
        if files.is_empty() {
            return Err(TransferError::Runtime {
                target: target.name.clone(),
                message: format!("no such file or directory: {remote_path}"),
            });
        }
        let entries: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(path, contents)| (path.as_str(), contents.as_slice()))
            .collect();
        write_directory_archive(archive_path, name, &entries)
            .map_err(|err| fixture_error(target, err))
    }
}

/// A [RemoteJson] holding documents in memory, with per-path defaults that
/// every target starts out with.
#[derive(Default)]
pub struct FakeJson {
    defaults: BTreeMap<String, serde_json::Value>,
    documents: Mutex<BTreeMap<(String, String), serde_json::Value>>,
    reads: AtomicUsize,
}

impl FakeJson {
    /// Every target reports `version` and a server configuration for
    /// `tempZone` with no federation entries.
    pub fn for_service(service: &ServiceConfig, version: &str) -> Self {
        let mut defaults = BTreeMap::new();
        defaults.insert(
            service.version_file.clone(),
            serde_json::json!({ "irods_version": version }),
        );
        defaults.insert(
            service.server_config_path.clone(),
            serde_json::json!({ "zone_name": "tempZone", "federation": [] }),
        );
        FakeJson { defaults, ..Default::default() }
    }

    pub fn set(&self, target: &str, path: &str, value: serde_json::Value) {
        self.documents
            .lock()
            .unwrap()
            .insert((target.to_string(), path.to_string()), value);
    }

    /// The document currently at `path` on `target`, if it was written or
    /// has a default.
    pub fn document(
        &self,
        target: &str,
        path: &str,
    ) -> Option<serde_json::Value> {
        self.documents
            .lock()
            .unwrap()
            .get(&(target.to_string(), path.to_string()))
            .or_else(|| self.defaults.get(path))
            .cloned()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteJson for FakeJson {
    async fn read_json(
        &self,
        target: &Target,
        path: &str,
    ) -> Result<serde_json::Value, TransferError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.document(&target.name, path).ok_or_else(|| {
            TransferError::Runtime {
                target: target.name.clone(),
                message: format!("no such file: {path}"),
            }
        })
    }

    async fn write_json(
        &self,
        target: &Target,
        path: &str,
        value: &serde_json::Value,
    ) -> Result<(), TransferError> {
        self.set(&target.name, path, value.clone());
        Ok(())
    }
}

/// A fake compose project: `zones` providers and databases plus `consumers`
/// consumers, with every collaborator faked.
pub struct FakeCluster {
    pub directory: Arc<FakeDirectory>,
    pub executor: Arc<FakeExecutor>,
    pub transfer: Arc<FakeTransfer>,
    pub json: Arc<FakeJson>,
}

impl FakeCluster {
    pub fn new(zones: u32, consumers: u32, executor: FakeExecutor) -> Self {
        FakeCluster {
            directory: Arc::new(FakeDirectory::cluster(
                &project(),
                "postgres:14",
                zones,
                consumers,
            )),
            executor: Arc::new(executor),
            transfer: Arc::new(FakeTransfer::new()),
            json: Arc::new(FakeJson::for_service(
                &ServiceConfig::default(),
                "4.3.1",
            )),
        }
    }

    /// Default configuration, except that database readiness is polled
    /// without delay.
    pub fn config() -> Config {
        let mut config = Config::default();
        config.database.ready_delay_secs = 0;
        config
    }

    pub fn context(&self, log: &Logger) -> Arc<OrchestrationContext> {
        self.context_with_config(log, Self::config())
    }

    pub fn context_with_config(
        &self,
        log: &Logger,
        config: Config,
    ) -> Arc<OrchestrationContext> {
        let collaborators = Collaborators {
            directory: self.directory.clone(),
            executor: self.executor.clone(),
            transfer: self.transfer.clone(),
            json: self.json.clone(),
        };
        Arc::new(OrchestrationContext::new(
            log.clone(),
            project(),
            config,
            collaborators,
        ))
    }
}
