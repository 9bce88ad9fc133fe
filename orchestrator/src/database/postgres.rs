// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{DatabaseError, DatabaseStrategy, StrategyDeps};
use crate::executor::RemoteCommand;
use crate::target::Target;
use async_trait::async_trait;
use slog::{debug, o};

const ADMIN_USER: &str = "postgres";
const MAINTENANCE_DATABASE: &str = "postgres";

/// PostgreSQL, driven through `psql` as the `postgres` superuser.
///
/// The PostgreSQL ODBC driver ships with the service packages, so the provider
/// needs no extra preparation.
pub struct Postgres {
    deps: StrategyDeps,
}

impl Postgres {
    pub fn new(deps: StrategyDeps) -> Self {
        let log = deps.log.new(o!("database_family" => "postgres"));
        Postgres { deps: StrategyDeps { log, ..deps } }
    }
}

#[async_trait]
impl DatabaseStrategy for Postgres {
    fn family(&self) -> &'static str {
        "postgres"
    }

    fn default_port(&self) -> u16 {
        5432
    }

    fn odbc_driver(&self) -> &'static str {
        "PostgreSQL ANSI"
    }

    async fn execute_sql(&self, statement: &str) -> Result<i32, DatabaseError> {
        debug!(self.deps.log, "executing SQL"; "statement" => statement);
        let command =
            RemoteCommand::from_args(["psql", "--command", statement])
                .user(ADMIN_USER);
        self.deps.run_on_database("execute SQL", command).await
    }

    async fn can_connect(
        &self,
        user: Option<(&str, &str)>,
        database: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let dbname = format!(
            "--dbname={}",
            database.unwrap_or(MAINTENANCE_DATABASE)
        );
        let command = match user {
            Some((name, password)) => RemoteCommand::from_args([
                "env".to_string(),
                format!("PGPASSWORD={password}"),
                "psql".to_string(),
                "--host=localhost".to_string(),
                format!("--username={name}"),
                dbname,
                "--command=SELECT 1".to_string(),
            ]),
            None => RemoteCommand::from_args([
                "psql".to_string(),
                dbname,
                "--command=SELECT 1".to_string(),
            ])
            .user(ADMIN_USER),
        };
        let exit_code =
            self.deps.run_on_database("probe connection", command).await?;
        Ok(exit_code == 0)
    }

    fn create_database_sql(&self, name: &str) -> String {
        format!("CREATE DATABASE \"{name}\";")
    }

    fn create_user_sql(&self, name: &str, password: &str) -> String {
        format!("CREATE USER {name} WITH PASSWORD '{password}';")
    }

    fn grant_privileges_sql(&self, database: &str, user: &str) -> Vec<String> {
        // Since PostgreSQL 15 the public schema is only writable by the
        // database owner.
        vec![
            format!(
                "GRANT ALL PRIVILEGES ON DATABASE \"{database}\" TO {user};"
            ),
            format!("ALTER DATABASE \"{database}\" OWNER TO {user};"),
        ]
    }

    fn drop_database_sql(&self, name: &str) -> String {
        format!("DROP DATABASE IF EXISTS \"{name}\";")
    }

    fn drop_user_sql(&self, name: &str) -> String {
        format!("DROP USER IF EXISTS {name};")
    }

    async fn install_provider_driver(
        &self,
        provider: &Target,
    ) -> Result<(), DatabaseError> {
        debug!(
            self.deps.log,
            "no ODBC driver preparation needed";
            "provider" => &provider.name,
        );
        Ok(())
    }
}
