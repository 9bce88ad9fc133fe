// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bringing one zone from "containers exist" to "ready for test traffic".
//!
//! The phases run strictly in order and the pipeline stops at the first
//! phase that fails:
//!
//! 1. wait until the database accepts connections from the provider
//! 2. create the catalog database, its user and their grants
//! 3. prepare and set up the provider
//! 4. set up every consumer concurrently, pointed at the provider

use crate::config::Config;
use crate::context::{MetadataError, OrchestrationContext};
use crate::database::{
    setup_catalog, DatabaseError, DatabaseStrategy, StrategyDeps,
};
use crate::executor::{ensure_success, RemoteCommand, RemoteCommandError};
use crate::target::{DirectoryError, Role, Target};
use crate::topology::ZoneInfo;
use crate::transfer::TransferError;
use fan_out::{FanOut, FanOutError};
use serde::Serialize;
use slog::{debug, error, info, o, warn, Logger};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupPhase {
    WaitForDatabase,
    Catalog,
    Provider,
    Consumers,
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetupPhase::WaitForDatabase => "wait_for_database",
            SetupPhase::Catalog => "catalog",
            SetupPhase::Provider => "provider",
            SetupPhase::Consumers => "consumers",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(
        "database for zone {zone} was not reachable after {attempts} attempts"
    )]
    DatabaseNotReady { zone: String, attempts: u32 },
    #[error("catalog database setup failed for zone {zone}")]
    Catalog {
        zone: String,
        #[source]
        err: DatabaseError,
    },
    #[error("failed to prepare the database driver on {target}")]
    Driver {
        target: String,
        #[source]
        err: DatabaseError,
    },
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("failed to write the setup input to {target}")]
    SetupInput {
        target: String,
        #[source]
        err: TransferError,
    },
    #[error("service setup on {target} failed")]
    Service {
        target: String,
        #[source]
        err: RemoteCommandError,
    },
    #[error("consumer setup failed for zone {zone}")]
    Consumers {
        zone: String,
        #[source]
        err: FanOutError<String, SetupError>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostSystemInformation {
    pub service_account_user_name: String,
    pub service_account_group_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatabaseConnection {
    pub technology: String,
    pub odbc_driver: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerSetup {
    pub catalog_provider_hosts: Vec<String>,
    pub catalog_service_role: Role,
    pub zone_name: String,
    pub zone_key: String,
    pub zone_port: u16,
    pub negotiation_key: String,
    pub default_resource_directory: String,
    pub default_resource_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConnection>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceAccountEnvironment {
    pub irods_host: String,
    pub irods_port: u16,
    pub irods_user_name: String,
    pub irods_zone_name: String,
    pub irods_default_resource: String,
}

/// The document handed to the service's setup entry point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SetupInput {
    pub admin_password: String,
    pub host_system_information: HostSystemInformation,
    pub server_config: ServerSetup,
    pub service_account_environment: ServiceAccountEnvironment,
}

impl SetupInput {
    fn new(
        config: &Config,
        zone: &ZoneInfo,
        host: &str,
        provider_host: &str,
        role: Role,
        database: Option<DatabaseConnection>,
    ) -> Self {
        let service = &config.service;
        SetupInput {
            admin_password: service.admin_password.clone(),
            host_system_information: HostSystemInformation {
                service_account_user_name: service.user.clone(),
                service_account_group_name: service.user.clone(),
            },
            server_config: ServerSetup {
                catalog_provider_hosts: vec![provider_host.to_string()],
                catalog_service_role: role,
                zone_name: zone.zone_name.clone(),
                zone_key: zone.zone_key.clone(),
                zone_port: zone.zone_port,
                negotiation_key: zone.negotiation_key.clone(),
                default_resource_directory: service
                    .default_resource_directory
                    .clone(),
                default_resource_name: service.default_resource_name.clone(),
                database,
            },
            service_account_environment: ServiceAccountEnvironment {
                irods_host: host.to_string(),
                irods_port: zone.zone_port,
                irods_user_name: service.admin_user.clone(),
                irods_zone_name: zone.zone_name.clone(),
                irods_default_resource: service.default_resource_name.clone(),
            },
        }
    }

    pub fn provider(
        config: &Config,
        zone: &ZoneInfo,
        provider: &Target,
        database: &Target,
        strategy: &dyn DatabaseStrategy,
    ) -> Self {
        let connection = DatabaseConnection {
            technology: strategy.family().to_string(),
            odbc_driver: strategy.odbc_driver().to_string(),
            host: database.hostname().to_string(),
            port: strategy.default_port(),
            name: config.database.catalog_name.clone(),
            username: config.database.user.clone(),
            password: config.database.password.clone(),
        };
        Self::new(
            config,
            zone,
            provider.hostname(),
            provider.hostname(),
            Role::Provider,
            Some(connection),
        )
    }

    pub fn consumer(
        config: &Config,
        zone: &ZoneInfo,
        consumer: &Target,
        provider_host: &str,
    ) -> Self {
        Self::new(
            config,
            zone,
            consumer.hostname(),
            provider_host,
            Role::Consumer,
            None,
        )
    }
}

/// Runs every setup phase for `zone`.
pub async fn setup_zone(
    ctx: Arc<OrchestrationContext>,
    zone: ZoneInfo,
) -> Result<(), SetupError> {
    let log = ctx.log.new(o!("zone" => zone.zone_name.clone()));
    let database = ctx.target(&zone.database_target(&ctx.project)).await?;
    let provider = ctx.target(&zone.provider_target(&ctx.project)).await?;
    let strategy = ctx
        .databases
        .build(StrategyDeps {
            log: log.clone(),
            executor: ctx.executor.clone(),
            transfer: ctx.transfer.clone(),
            database: database.clone(),
            config: ctx.config.database.clone(),
        })
        .map_err(|err| SetupError::Catalog {
            zone: zone.zone_name.clone(),
            err,
        })?;

    let phase_log =
        log.new(o!("phase" => SetupPhase::WaitForDatabase.to_string()));
    wait_for_database(
        &ctx,
        &phase_log,
        &zone,
        &provider,
        &database,
        strategy.default_port(),
    )
    .await?;

    let phase_log = log.new(o!("phase" => SetupPhase::Catalog.to_string()));
    setup_catalog(
        &phase_log,
        strategy.as_ref(),
        &ctx.config.database,
        ctx.config.database.force_recreate,
    )
    .await
    .map_err(|err| SetupError::Catalog { zone: zone.zone_name.clone(), err })?;

    let phase_log = log.new(o!(
        "phase" => SetupPhase::Provider.to_string(),
        "target" => provider.name.clone(),
    ));
    info!(phase_log, "setting up provider");
    strategy.install_provider_driver(&provider).await.map_err(|err| {
        SetupError::Driver { target: provider.name.clone(), err }
    })?;
    let input = SetupInput::provider(
        &ctx.config,
        &zone,
        &provider,
        &database,
        strategy.as_ref(),
    );
    setup_service_node(&ctx, &phase_log, &provider, &input).await?;

    let phase_log = log.new(o!("phase" => SetupPhase::Consumers.to_string()));
    setup_consumers(&ctx, &phase_log, &zone, provider.hostname()).await?;

    info!(log, "zone is ready");
    Ok(())
}

/// Polls the database's port from the provider until it accepts a
/// connection or the configured number of attempts is used up.
async fn wait_for_database(
    ctx: &OrchestrationContext,
    log: &Logger,
    zone: &ZoneInfo,
    provider: &Target,
    database: &Target,
    port: u16,
) -> Result<(), SetupError> {
    let probe = RemoteCommand::new(format!(
        "exec 3<>/dev/tcp/{}/{port}",
        database.hostname()
    ));
    let attempts = ctx.config.database.ready_retries.max(1);
    let delay = Duration::from_secs(ctx.config.database.ready_delay_secs);
    info!(
        log,
        "waiting for database";
        "database" => &database.name,
        "port" => port,
        "attempts" => attempts,
    );

    for attempt in 1..=attempts {
        match ctx.executor.run(provider, &probe).await {
            Ok(0) => {
                info!(log, "database is accepting connections");
                return Ok(());
            }
            Ok(exit_code) => debug!(
                log,
                "database not ready";
                "attempt" => attempt,
                "exit_code" => exit_code,
            ),
            Err(err) => debug!(
                log,
                "database probe could not run";
                "attempt" => attempt,
                "error" => %err,
            ),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(SetupError::DatabaseNotReady { zone: zone.zone_name.clone(), attempts })
}

/// Stops the service, writes `input` and runs the service's setup entry point
/// against it, then restarts the service.
///
/// A failed stop is only logged since the service may never have been
/// started.
async fn setup_service_node(
    ctx: &OrchestrationContext,
    log: &Logger,
    target: &Target,
    input: &SetupInput,
) -> Result<(), SetupError> {
    let service = &ctx.config.service;
    let stop = ctx.service_command(format!("{} stop", service.control_script));
    match ctx.executor.run(target, &stop).await {
        Ok(0) => debug!(log, "stopped service before setup"),
        Ok(exit_code) => warn!(
            log,
            "failed to stop service before setup";
            "exit_code" => exit_code,
        ),
        Err(err) => warn!(
            log,
            "failed to stop service before setup";
            "error" => %err,
        ),
    }

    let input_path = &service.setup_input_path;
    let document = serde_json::to_value(input).map_err(|err| {
        SetupError::SetupInput {
            target: target.name.clone(),
            err: TransferError::Json {
                target: target.name.clone(),
                path: input_path.clone(),
                err,
            },
        }
    })?;
    ctx.json.write_json(target, input_path, &document).await.map_err(
        |err| SetupError::SetupInput { target: target.name.clone(), err },
    )?;

    let python = ctx.python_for(target).await?;
    let input_flag = format!("--json_configuration_file={input_path}");
    let setup = RemoteCommand::from_args([
        python,
        service.setup_script.as_str(),
        input_flag.as_str(),
    ])
    .user("root")
    .stream_output(ctx.stream_output);
    info!(log, "running service setup"; "command" => %setup);
    ensure_success(ctx.executor.as_ref(), target, &setup)
        .await
        .map_err(|err| SetupError::Service {
            target: target.name.clone(),
            err,
        })?;

    let restart =
        ctx.service_command(format!("{} restart", service.control_script));
    ensure_success(ctx.executor.as_ref(), target, &restart)
        .await
        .map_err(|err| SetupError::Service { target: target.name.clone(), err })
}

/// Sets up every consumer of `zone` at once. Every consumer is attempted even
/// if others fail.
async fn setup_consumers(
    ctx: &Arc<OrchestrationContext>,
    log: &Logger,
    zone: &ZoneInfo,
    provider_host: &str,
) -> Result<(), SetupError> {
    let consumers = zone.consumer_targets(&ctx.project);
    if consumers.is_empty() {
        debug!(log, "zone has no consumers");
        return Ok(());
    }

    let mut workers: FanOut<String, (), SetupError> =
        FanOut::new_with_parallelism(consumers.len());
    for name in consumers {
        let ctx = Arc::clone(ctx);
        let log = log.new(o!("target" => name.clone()));
        let zone = zone.clone();
        let provider_host = provider_host.to_string();
        workers.spawn(name.clone(), async move {
            let consumer = ctx.target(&name).await?;
            info!(log, "setting up consumer");
            let input = SetupInput::consumer(
                &ctx.config,
                &zone,
                &consumer,
                &provider_host,
            );
            setup_service_node(&ctx, &log, &consumer, &input).await
        });
    }

    match workers.join_all_then_aggregate().await {
        Ok(_) => Ok(()),
        Err(err) => {
            for (target, failure) in &err.failures {
                error!(
                    log,
                    "consumer setup failed";
                    "target" => target,
                    "error" => %failure,
                );
            }
            Err(SetupError::Consumers { zone: zone.zone_name.clone(), err })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::CommandOutput;
    use crate::fake::{
        exit, project, FakeCluster, FakeDirectory, FakeExecutor,
    };
    use crate::topology::{derive_zones, DEFAULT_ZONE_PORT};
    use assert_matches::assert_matches;
    use catalog_test_utils::dev::test_setup_log;

    async fn zones(
        cluster: &FakeCluster,
        names: &[&str],
        n: u32,
    ) -> Vec<ZoneInfo> {
        let log = slog::Logger::root(slog::Discard, o!());
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        derive_zones(
            &log,
            cluster.directory.as_ref(),
            &names,
            n,
            DEFAULT_ZONE_PORT,
            &Default::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let logctx = test_setup_log("test_phases_run_in_order");
        let cluster = FakeCluster::new(1, 2, FakeExecutor::succeeding());
        let ctx = cluster.context(&logctx.log);
        let zone = zones(&cluster, &["tempZone"], 2).await.remove(0);

        setup_zone(ctx.clone(), zone).await.unwrap();

        let provider = "proj-catalog-service-provider-1";
        let invocations = cluster.executor.invocations();
        assert!(invocations[0].command.starts_with("exec 3<>/dev/tcp/"));
        assert_eq!(invocations[0].target, provider);
        assert_eq!(invocations[1].target, "proj-catalog-1");

        let provider_commands: Vec<String> = cluster
            .executor
            .invocations_on(provider)
            .into_iter()
            .map(|i| i.command)
            .collect();
        assert_eq!(provider_commands.len(), 4);
        assert_eq!(
            provider_commands[0],
            "exec 3<>/dev/tcp/proj-catalog-1/5432"
        );
        assert_eq!(provider_commands[1], "./irodsctl stop");
        assert_eq!(
            shell_words::split(&provider_commands[2]).unwrap(),
            vec![
                "python3",
                "/var/lib/irods/scripts/setup_irods.py",
                "--json_configuration_file=/tmp/catalog_setup_input.json",
            ]
        );
        assert_eq!(provider_commands[3], "./irodsctl restart");

        // Consumers come after the provider has been restarted.
        let restart_index = invocations
            .iter()
            .position(|i| i.target == provider && i.command.contains("restart"))
            .unwrap();
        let first_consumer = invocations
            .iter()
            .position(|i| i.target.contains("consumer"))
            .unwrap();
        assert!(restart_index < first_consumer);

        let input_path = &ctx.config.service.setup_input_path;
        let provider_input =
            cluster.json.document(provider, input_path).unwrap();
        assert_eq!(
            provider_input["server_config"]["catalog_service_role"],
            "provider"
        );
        assert_eq!(
            provider_input["server_config"]["database"]["host"],
            "proj-catalog-1"
        );
        let consumer_input = cluster
            .json
            .document("proj-catalog-service-consumer-2", input_path)
            .unwrap();
        assert_eq!(
            consumer_input["server_config"]["catalog_service_role"],
            "consumer"
        );
        assert_eq!(
            consumer_input["server_config"]["catalog_provider_hosts"][0],
            provider
        );
        assert!(consumer_input["server_config"].get("database").is_none());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_consumer_failure_does_not_stop_siblings() {
        let logctx =
            test_setup_log("test_consumer_failure_does_not_stop_siblings");
        let executor = FakeExecutor::new(|target, command| {
            if target.name.ends_with("consumer-2")
                && command.command.contains("setup_irods.py")
            {
                exit(1)
            } else {
                exit(0)
            }
        });
        let cluster = FakeCluster::new(1, 3, executor);
        let ctx = cluster.context(&logctx.log);
        let zone = zones(&cluster, &["tempZone"], 3).await.remove(0);

        let err = setup_zone(ctx, zone).await.unwrap_err();
        let (zone, err) = match err {
            SetupError::Consumers { zone, err } => (zone, err),
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(zone, "tempZone");
        assert_eq!(err.attempted, 3);
        assert_eq!(
            err.failed_keys().collect::<Vec<_>>(),
            vec!["proj-catalog-service-consumer-2"]
        );
        assert_matches!(
            err.failures[0].1.as_failed(),
            Some(SetupError::Service {
                err: RemoteCommandError::Failed { exit_code: 1, .. },
                ..
            })
        );
        assert!(err.to_string().starts_with("1 of 3 workers failed"));

        let attempted_consumers = cluster
            .executor
            .invocations()
            .iter()
            .filter(|i| {
                i.target.contains("consumer")
                    && i.command.contains("setup_irods.py")
            })
            .count();
        assert_eq!(attempted_consumers, 3);
        // The healthy consumers went on to restart.
        assert_eq!(
            cluster.executor.count_matching("irodsctl restart"),
            3
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_database_that_never_comes_up() {
        let logctx = test_setup_log("test_database_that_never_comes_up");
        let cluster =
            FakeCluster::new(1, 1, FakeExecutor::failing_when("/dev/tcp", 1));
        let mut config = FakeCluster::config();
        config.database.ready_retries = 3;
        let ctx = cluster.context_with_config(&logctx.log, config);
        let zone = zones(&cluster, &["tempZone"], 1).await.remove(0);

        let err = setup_zone(ctx, zone).await.unwrap_err();
        assert_matches!(err, SetupError::DatabaseNotReady { attempts: 3, .. });
        assert_eq!(cluster.executor.invocations().len(), 3);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unreachable_database_is_retried() {
        let logctx = test_setup_log("test_unreachable_database_is_retried");
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let executor = FakeExecutor::new(move |target, command| {
            if command.command.contains("/dev/tcp")
                && attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                    == 0
            {
                return Err(crate::executor::ExecError::Unreachable {
                    target: target.name.clone(),
                    message: "container restarting".to_string(),
                });
            }
            Ok(CommandOutput { exit_code: 0, stdout: String::new() })
        });
        let cluster = FakeCluster::new(1, 0, executor);
        let ctx = cluster.context(&logctx.log);
        let zone = zones(&cluster, &["tempZone"], 0).await.remove(0);

        setup_zone(ctx, zone).await.unwrap();
        assert_eq!(cluster.executor.count_matching("/dev/tcp"), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unsupported_database_is_fatal() {
        let logctx = test_setup_log("test_unsupported_database_is_fatal");
        let cluster = FakeCluster {
            directory: Arc::new(FakeDirectory::cluster(
                &project(),
                "oracle/database:19",
                1,
                0,
            )),
            ..FakeCluster::new(1, 0, FakeExecutor::succeeding())
        };
        let ctx = cluster.context(&logctx.log);
        let zone = zones(&cluster, &["tempZone"], 0).await.remove(0);

        let err = setup_zone(ctx, zone).await.unwrap_err();
        assert_matches!(
            err,
            SetupError::Catalog { err: DatabaseError::Unsupported { .. }, .. }
        );
        assert!(cluster.executor.invocations().is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_stop_failure_is_tolerated_restart_failure_is_not() {
        let logctx = test_setup_log(
            "test_stop_failure_is_tolerated_restart_failure_is_not",
        );
        let cluster = FakeCluster::new(
            1,
            0,
            FakeExecutor::failing_when("irodsctl stop", 3),
        );
        let zone = zones(&cluster, &["tempZone"], 0).await.remove(0);
        setup_zone(cluster.context(&logctx.log), zone.clone()).await.unwrap();

        let cluster = FakeCluster::new(
            1,
            0,
            FakeExecutor::failing_when("irodsctl restart", 1),
        );
        let err =
            setup_zone(cluster.context(&logctx.log), zone).await.unwrap_err();
        assert_matches!(
            err,
            SetupError::Service {
                err: RemoteCommandError::Failed { exit_code: 1, .. },
                ..
            }
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failed_setup_entry_point_stops_pipeline() {
        let logctx =
            test_setup_log("test_failed_setup_entry_point_stops_pipeline");
        let cluster = FakeCluster::new(
            1,
            2,
            FakeExecutor::failing_when("setup_irods.py", 2),
        );
        let ctx = cluster.context(&logctx.log);
        let zone = zones(&cluster, &["tempZone"], 2).await.remove(0);

        let err = setup_zone(ctx, zone).await.unwrap_err();
        assert_matches!(err, SetupError::Service { ref target, .. }
            if target == "proj-catalog-service-provider-1");
        assert_eq!(cluster.executor.count_matching("irodsctl restart"), 0);
        assert!(cluster
            .executor
            .invocations()
            .iter()
            .all(|i| !i.target.contains("consumer")));
        logctx.cleanup_successful();
    }
}
