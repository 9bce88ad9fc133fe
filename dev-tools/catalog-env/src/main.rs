// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand up catalog service zones in a running compose project and run the
//! service's test suite against them.

use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use catalog_orchestrator::docker::DockerCli;
use catalog_orchestrator::federation::form_federation_clique;
use catalog_orchestrator::logs::collect_logs;
use catalog_orchestrator::retry::run_until_stuck;
use catalog_orchestrator::test_plan::{TestPlan, TestPlanError};
use catalog_orchestrator::test_run::run_plan;
use catalog_orchestrator::topology::{derive_zones, ZoneInfo};
use catalog_orchestrator::transfer::FileTransferJson;
use catalog_orchestrator::zones::setup_zones;
use catalog_orchestrator::{
    Collaborators, ComposeProject, Config, OrchestrationContext, Role,
};
use clap::{Args, Parser, Subcommand};
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog::{error, info, warn};
use slog_term::FullFormat;
use slog_term::TermDecorator;

/// Zone name used for the independent zones that back test executors.
const TEST_ZONE_NAME: &str = "tempZone";

#[tokio::main]
async fn main() -> Result<()> {
    let app = CatalogEnvApp::parse();
    let code = app.exec().await?;
    std::process::exit(code);
}

/// Set up and test catalog service zones in a compose project
#[derive(Debug, Parser)]
#[clap(version)]
struct CatalogEnvApp {
    /// TOML configuration file (defaults apply when omitted)
    #[clap(long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Directory holding the compose project
    #[clap(long, global = true, default_value = ".")]
    project_directory: Utf8PathBuf,

    /// Compose project name (default: the project directory's name)
    #[clap(long, global = true)]
    project_name: Option<String>,

    /// Log at debug level and stream service command output
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Directory for logs, reports and collected service logs
    #[clap(long, global = true, default_value = "catalog-env-output")]
    output_directory: Utf8PathBuf,

    /// Name used for report files
    #[clap(long, global = true, default_value = "catalog-env")]
    job_name: String,

    #[clap(subcommand)]
    command: CatalogEnvCmd,
}

#[derive(Debug, Subcommand)]
enum CatalogEnvCmd {
    /// Configure the catalog database and service nodes of one or more zones
    Setup(SetupArgs),
    /// Run tests across independent zones, retrying failures
    Test(TestArgs),
}

#[derive(Debug, Args)]
struct SetupArgs {
    /// Names of the zones to set up, one per provider instance
    #[clap(long, num_args = 1.., default_value = TEST_ZONE_NAME)]
    zones: Vec<String>,

    /// Number of consumers to attach to each zone
    #[clap(long, default_value_t = 0)]
    consumers_per_zone: u32,

    /// Drop and recreate the catalog database and user
    #[clap(long)]
    force_recreate: bool,

    /// Federate every zone with every other zone once setup completes
    #[clap(long)]
    federate: bool,

    /// Write federation entries into consumer configuration as well
    #[clap(long, requires = "federate")]
    include_consumers: bool,
}

#[derive(Debug, Args)]
struct TestArgs {
    /// Tests to run
    #[clap(long, num_args = 1.., conflicts_with = "test_list_file")]
    tests: Vec<String>,

    /// File listing one test per line (blank lines and `#` comments are
    /// ignored)
    #[clap(long)]
    test_list_file: Option<Utf8PathBuf>,

    /// Number of zones to run tests on concurrently
    #[clap(long, default_value_t = 1)]
    concurrent_test_executor_count: u32,

    /// Number of consumers to attach to each test zone
    #[clap(long, default_value_t = 0)]
    consumers_per_zone: u32,

    /// Use zones that have already been set up
    #[clap(long)]
    skip_setup: bool,

    /// Stop an executor at its first failed test and do not retry
    #[clap(long)]
    fail_fast: bool,

    /// Give up after this many consecutive attempts with identical failures
    /// (overrides the configuration file)
    #[clap(long)]
    retries_when_stuck: Option<u32>,

    /// Extra option passed to every test invocation (repeatable)
    #[clap(long = "test-option", allow_hyphen_values = true)]
    test_options: Vec<String>,
}

impl CatalogEnvApp {
    /// Runs the selected command, returning the process exit code.
    async fn exec(self) -> Result<i32> {
        let log = setup_log(&self.output_directory, self.verbose)?;
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        let project_name = match &self.project_name {
            Some(name) => name.clone(),
            None => project_name_for(&self.project_directory)?,
        };
        info!(
            log,
            "starting";
            "project" => &project_name,
            "output_dir" => %self.output_directory,
        );

        match &self.command {
            CatalogEnvCmd::Setup(args) => {
                config.database.force_recreate |= args.force_recreate;
                config.federation.include_consumers |= args.include_consumers;
            }
            CatalogEnvCmd::Test(args) => {
                if let Some(retries) = args.retries_when_stuck {
                    config.tests.retries_when_stuck = retries;
                }
                config.tests.options.extend(args.test_options.iter().cloned());
            }
        }

        let project =
            ComposeProject::new(project_name, config.project.clone());
        let docker = Arc::new(DockerCli::new(log.clone(), project.clone()));
        let collaborators = Collaborators {
            directory: docker.clone(),
            executor: docker.clone(),
            transfer: docker.clone(),
            json: Arc::new(FileTransferJson::new(docker)),
        };
        let ctx = OrchestrationContext::new(
            log.clone(),
            project,
            config,
            collaborators,
        )
        .with_stream_output(self.verbose);
        let ctx = Arc::new(ctx);

        let result = match &self.command {
            CatalogEnvCmd::Setup(args) => args.exec(&ctx).await.map(|()| 0),
            CatalogEnvCmd::Test(args) => {
                args.exec(&ctx, &self.output_directory, &self.job_name).await
            }
        };

        // Collected whatever the outcome. A collection failure never masks
        // the command's result.
        match collect_logs(&ctx, &self.output_directory).await {
            Ok(collected) => info!(
                log,
                "collected service logs";
                "targets" => collected.len(),
            ),
            Err(err) => {
                warn!(log, "failed to collect service logs"; "error" => %err);
            }
        }

        match result {
            Ok(code) => {
                info!(log, "finished"; "return_code" => code);
                Ok(code)
            }
            Err(err) => {
                error!(log, "failed"; "error" => format!("{err:#}"));
                Err(err)
            }
        }
    }
}

impl SetupArgs {
    async fn exec(&self, ctx: &Arc<OrchestrationContext>) -> Result<()> {
        let zones = derive(ctx, &self.zones, self.consumers_per_zone).await?;
        setup_zones(ctx, &zones).await.context("zone setup failed")?;
        if self.federate {
            form_federation_clique(ctx, &zones)
                .await
                .context("federation failed")?;
        }
        Ok(())
    }
}

impl TestArgs {
    async fn exec(
        &self,
        ctx: &Arc<OrchestrationContext>,
        output_dir: &Utf8Path,
        job_name: &str,
    ) -> Result<i32> {
        let tests = self.tests()?;
        if tests.is_empty() {
            bail!("no tests were given");
        }

        let count = self.concurrent_test_executor_count.max(1);
        if !self.skip_setup {
            let names = vec![TEST_ZONE_NAME.to_string(); count as usize];
            let zones = derive(ctx, &names, self.consumers_per_zone).await?;
            setup_zones(ctx, &zones).await.context("zone setup failed")?;
        }

        // Each zone's provider runs that zone's share of the tests.
        let executors: Vec<String> = (1..=count)
            .map(|i| ctx.project.container_name(Role::Provider, i))
            .collect();
        let fail_fast = self.fail_fast;
        let options = ctx.config.tests.options.clone();
        let outcome = run_until_stuck(
            &ctx.log,
            tests,
            ctx.config.tests.retries_when_stuck,
            fail_fast,
            |tests| {
                let ctx = Arc::clone(ctx);
                let executors = executors.clone();
                let options = options.clone();
                async move {
                    let plan = TestPlan::round_robin(
                        &tests, &executors, fail_fast, options,
                    )?;
                    Ok::<_, TestPlanError>(run_plan(&ctx, plan).await)
                }
            },
        )
        .await?;

        if let Some(summary) = outcome.last() {
            println!("{summary}");
            let report = summary
                .write_report(output_dir, job_name)
                .await
                .context("failed to write test report")?;
            info!(
                ctx.log,
                "wrote test report";
                "path" => %report,
                "attempts" => outcome.attempts.len(),
            );
        }
        Ok(outcome.return_code())
    }

    fn tests(&self) -> Result<Vec<String>> {
        let Some(path) = &self.test_list_file else {
            return Ok(self.tests.clone());
        };
        let contents = fs_err::read_to_string(path)?;
        Ok(parse_test_list(&contents))
    }
}

async fn derive(
    ctx: &OrchestrationContext,
    names: &[String],
    consumers_per_zone: u32,
) -> Result<Vec<ZoneInfo>> {
    let zones = derive_zones(
        &ctx.log,
        ctx.directory.as_ref(),
        names,
        consumers_per_zone,
        ctx.config.zones.port,
        &ctx.config.zones.negotiation_key,
    )
    .await
    .context("failed to derive zones")?;
    Ok(zones)
}

fn parse_test_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// The compose project name that `docker compose` would pick for `dir`.
fn project_name_for(dir: &Utf8Path) -> Result<String> {
    let dir = dir
        .canonicalize_utf8()
        .with_context(|| format!("failed to resolve {dir}"))?;
    let Some(base) = dir.file_name() else {
        bail!("cannot derive a project name from {dir}; pass --project-name");
    };
    Ok(normalize_project_name(base))
}

fn normalize_project_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Logs to the terminal and, as bunyan JSON, to `<output_dir>/catalog-env.log`.
fn setup_log(output_dir: &Utf8Path, verbose: bool) -> Result<Logger> {
    fs_err::create_dir_all(output_dir)?;
    let file = fs_err::File::create(output_dir.join("catalog-env.log"))?;
    let file_drain = slog_bunyan::with_name("catalog-env", file).build().fuse();

    let decorator = TermDecorator::new().build();
    let term_drain = FullFormat::new(decorator).build().fuse();

    let level = if verbose { Level::Debug } else { Level::Info };
    let drain = slog::Duplicate::new(term_drain, file_drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(level).fuse();
    Ok(Logger::root(drain, slog::o!()))
}
