// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-engine catalog database setup.
//!
//! Each supported database family implements [DatabaseStrategy]. The family
//! used for a zone is chosen by looking up the normalized image repository of
//! the zone's database target in a [DatabaseRegistry].

mod mysql;
mod postgres;

pub use mysql::MySql;
pub use postgres::Postgres;

use crate::config::DatabaseConfig;
use crate::executor::{ExecError, Executor, RemoteCommand};
use crate::target::Target;
use crate::transfer::{FileTransfer, TransferError};
use async_trait::async_trait;
use slog::{info, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(
        "unsupported database image repository \"{repo}\" (supported: {})",
        .supported.join(", ")
    )]
    Unsupported { repo: String, supported: Vec<String> },
    #[error("failed to {operation} on {target}")]
    Exec {
        operation: String,
        target: String,
        #[source]
        err: ExecError,
    },
    #[error("failed to {operation}: exited with {exit_code}")]
    Failed { operation: String, exit_code: i32 },
    #[error(
        "database family {family} needs an ODBC driver archive, but none is \
         configured"
    )]
    MissingDriverArchive { family: &'static str },
    #[error("failed to copy the ODBC driver into {target}")]
    DriverTransfer {
        target: String,
        #[source]
        err: TransferError,
    },
}

/// Everything a strategy needs to act on one zone's database.
#[derive(Clone)]
pub struct StrategyDeps {
    pub log: Logger,
    pub executor: Arc<dyn Executor>,
    pub transfer: Arc<dyn FileTransfer>,
    pub database: Target,
    pub config: DatabaseConfig,
}

impl StrategyDeps {
    /// Runs `command` on the database target, mapping transport failures to
    /// [DatabaseError::Exec].
    pub(crate) async fn run_on_database(
        &self,
        operation: &str,
        command: RemoteCommand,
    ) -> Result<i32, DatabaseError> {
        self.executor.run(&self.database, &command).await.map_err(|err| {
            DatabaseError::Exec {
                operation: operation.to_string(),
                target: self.database.name.clone(),
                err,
            }
        })
    }
}

/// The operations the setup pipeline needs from a database family.
///
/// Implementors supply the engine-specific statements and probes; the
/// create operations' "force recreate" and "create if absent" semantics are
/// shared.
#[async_trait]
pub trait DatabaseStrategy: Send + Sync {
    fn family(&self) -> &'static str;

    fn default_port(&self) -> u16;

    /// Name of the ODBC driver the service should use.
    fn odbc_driver(&self) -> &'static str;

    /// Runs one SQL statement as the engine's administrative account.
    async fn execute_sql(&self, statement: &str) -> Result<i32, DatabaseError>;

    /// Whether a connection succeeds, either as `user` (with its password) or
    /// as the administrative account, optionally to `database`.
    async fn can_connect(
        &self,
        user: Option<(&str, &str)>,
        database: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    fn create_database_sql(&self, name: &str) -> String;
    fn create_user_sql(&self, name: &str, password: &str) -> String;
    fn grant_privileges_sql(&self, database: &str, user: &str) -> Vec<String>;
    fn drop_database_sql(&self, name: &str) -> String;
    fn drop_user_sql(&self, name: &str) -> String;

    /// Makes the engine reachable from the service on `provider`.
    async fn install_provider_driver(
        &self,
        provider: &Target,
    ) -> Result<(), DatabaseError>;

    async fn database_exists(&self, name: &str) -> Result<bool, DatabaseError> {
        self.can_connect(None, Some(name)).await
    }

    async fn user_exists(
        &self,
        name: &str,
        password: &str,
    ) -> Result<bool, DatabaseError> {
        self.can_connect(Some((name, password)), None).await
    }

    async fn drop_database(&self, name: &str) -> Result<i32, DatabaseError> {
        self.execute_sql(&self.drop_database_sql(name)).await
    }

    async fn drop_user(&self, name: &str) -> Result<i32, DatabaseError> {
        self.execute_sql(&self.drop_user_sql(name)).await
    }

    async fn create_database(
        &self,
        name: &str,
        force_recreate: bool,
    ) -> Result<i32, DatabaseError> {
        if force_recreate {
            let exit_code = self.drop_database(name).await?;
            if exit_code != 0 {
                return Ok(exit_code);
            }
        } else if self.database_exists(name).await? {
            return Ok(0);
        }
        self.execute_sql(&self.create_database_sql(name)).await
    }

    async fn create_user(
        &self,
        name: &str,
        password: &str,
        force_recreate: bool,
    ) -> Result<i32, DatabaseError> {
        if force_recreate {
            let exit_code = self.drop_user(name).await?;
            if exit_code != 0 {
                return Ok(exit_code);
            }
        } else if self.user_exists(name, password).await? {
            return Ok(0);
        }
        self.execute_sql(&self.create_user_sql(name, password)).await
    }

    async fn grant_privileges(
        &self,
        database: &str,
        user: &str,
    ) -> Result<i32, DatabaseError> {
        for statement in self.grant_privileges_sql(database, user) {
            let exit_code = self.execute_sql(&statement).await?;
            if exit_code != 0 {
                return Ok(exit_code);
            }
        }
        Ok(0)
    }
}

type Constructor = fn(StrategyDeps) -> Box<dyn DatabaseStrategy>;

/// Maps normalized database image repositories to strategy constructors.
#[derive(Clone, Default)]
pub struct DatabaseRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every family this crate knows about.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("postgres", |deps| Box::new(Postgres::new(deps)));
        registry.register("mysql", |deps| Box::new(MySql::new(deps)));
        registry.register("mariadb", |deps| Box::new(MySql::new(deps)));
        registry
    }

    pub fn register(&mut self, repo: &str, constructor: Constructor) {
        self.constructors.insert(repo.to_ascii_lowercase(), constructor);
    }

    pub fn supported(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    /// Builds the strategy matching `deps.database`'s image.
    pub fn build(
        &self,
        deps: StrategyDeps,
    ) -> Result<Box<dyn DatabaseStrategy>, DatabaseError> {
        let repo = deps.database.image_repo();
        let constructor = self.constructors.get(&repo).ok_or_else(|| {
            DatabaseError::Unsupported { repo, supported: self.supported() }
        })?;
        Ok(constructor(deps))
    }
}

fn check(operation: &str, exit_code: i32) -> Result<(), DatabaseError> {
    if exit_code == 0 {
        Ok(())
    } else {
        Err(DatabaseError::Failed {
            operation: operation.to_string(),
            exit_code,
        })
    }
}

/// Creates the catalog database and its application user and grants the user
/// access.
///
/// Without `force_recreate`, an existing database or user is left alone and
/// counts as success.
pub async fn setup_catalog(
    log: &Logger,
    strategy: &dyn DatabaseStrategy,
    config: &DatabaseConfig,
    force_recreate: bool,
) -> Result<(), DatabaseError> {
    info!(
        log,
        "setting up catalog database";
        "family" => strategy.family(),
        "database" => &config.catalog_name,
        "force_recreate" => force_recreate,
    );
    let name = &config.catalog_name;
    check(
        &format!("create database {name}"),
        strategy.create_database(name, force_recreate).await?,
    )?;
    check(
        &format!("create user {}", config.user),
        strategy
            .create_user(&config.user, &config.password, force_recreate)
            .await?,
    )?;
    check(
        &format!("grant privileges on {name} to {}", config.user),
        strategy.grant_privileges(name, &config.user).await?,
    )?;
    Ok(())
}
