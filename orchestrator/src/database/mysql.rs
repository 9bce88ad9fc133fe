// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{DatabaseError, DatabaseStrategy, StrategyDeps};
use crate::executor::RemoteCommand;
use crate::target::Target;
use async_trait::async_trait;
use slog::{debug, info, o};

const ADMIN_USER: &str = "root";
const DRIVER_NAME: &str = "MySQL ANSI";
const DRIVER_DIRECTORY: &str = "/opt/catalog-odbc";
const DRIVER_TEMPLATE: &str = "/tmp/catalog-odbcinst.ini";

/// MySQL and MariaDB, driven through the `mysql` client as `root`.
///
/// The service packages do not ship a driver for this family, so the provider
/// is given the configured ODBC driver archive and the driver is registered
/// with `odbcinst`.
pub struct MySql {
    deps: StrategyDeps,
}

impl MySql {
    pub fn new(deps: StrategyDeps) -> Self {
        let log = deps.log.new(o!("database_family" => "mysql"));
        MySql { deps: StrategyDeps { log, ..deps } }
    }

    fn client_args(
        &self,
        user: &str,
        password: &str,
        database: Option<&str>,
        statement: &str,
    ) -> RemoteCommand {
        let mut args = vec![
            "mysql".to_string(),
            format!("--user={user}"),
            format!("--password={password}"),
        ];
        if let Some(database) = database {
            args.push(format!("--database={database}"));
        }
        args.push(format!("--execute={statement}"));
        RemoteCommand::from_args(args)
    }

    fn registration_command(&self) -> String {
        format!(
            "printf '[{DRIVER_NAME}]\\nDriver=%s\\n' \
             \"$(find {DRIVER_DIRECTORY} -name 'libmyodbc*a.so' | head -n 1)\" \
             > {DRIVER_TEMPLATE} && odbcinst -i -d -f {DRIVER_TEMPLATE}"
        )
    }
}

#[async_trait]
impl DatabaseStrategy for MySql {
    fn family(&self) -> &'static str {
        "mysql"
    }

    fn default_port(&self) -> u16 {
        3306
    }

    fn odbc_driver(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn execute_sql(&self, statement: &str) -> Result<i32, DatabaseError> {
        debug!(self.deps.log, "executing SQL"; "statement" => statement);
        let command = self.client_args(
            ADMIN_USER,
            &self.deps.config.admin_password,
            None,
            statement,
        );
        self.deps.run_on_database("execute SQL", command).await
    }

    async fn can_connect(
        &self,
        user: Option<(&str, &str)>,
        database: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let (name, password) = user
            .unwrap_or((ADMIN_USER, self.deps.config.admin_password.as_str()));
        let command = self.client_args(name, password, database, "SELECT 1");
        let exit_code =
            self.deps.run_on_database("probe connection", command).await?;
        Ok(exit_code == 0)
    }

    fn create_database_sql(&self, name: &str) -> String {
        format!("CREATE DATABASE `{name}`;")
    }

    fn create_user_sql(&self, name: &str, password: &str) -> String {
        format!("CREATE USER '{name}'@'%' IDENTIFIED BY '{password}';")
    }

    fn grant_privileges_sql(&self, database: &str, user: &str) -> Vec<String> {
        vec![
            format!("GRANT ALL PRIVILEGES ON `{database}`.* TO '{user}'@'%';"),
            "FLUSH PRIVILEGES;".to_string(),
        ]
    }

    fn drop_database_sql(&self, name: &str) -> String {
        format!("DROP DATABASE IF EXISTS `{name}`;")
    }

    fn drop_user_sql(&self, name: &str) -> String {
        format!("DROP USER IF EXISTS '{name}'@'%';")
    }

    async fn install_provider_driver(
        &self,
        provider: &Target,
    ) -> Result<(), DatabaseError> {
        let archive = self.deps.config.odbc_driver_archive.as_ref().ok_or(
            DatabaseError::MissingDriverArchive { family: self.family() },
        )?;
        info!(
            self.deps.log,
            "installing ODBC driver";
            "provider" => &provider.name,
            "archive" => %archive,
        );
        self.deps
            .transfer
            .copy_in_as_archive(provider, archive, DRIVER_DIRECTORY)
            .await
            .map_err(|err| DatabaseError::DriverTransfer {
                target: provider.name.clone(),
                err,
            })?;

        let command =
            RemoteCommand::new(self.registration_command()).user("root");
        let exit_code = self
            .deps
            .executor
            .run(provider, &command)
            .await
            .map_err(|err| DatabaseError::Exec {
                operation: "register ODBC driver".to_string(),
                target: provider.name.clone(),
                err,
            })?;
        if exit_code != 0 {
            return Err(DatabaseError::Failed {
                operation: format!("register ODBC driver on {provider}"),
                exit_code,
            });
        }
        Ok(())
    }
}
