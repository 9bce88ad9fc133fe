// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Federating zones into a clique in which every zone trusts every other.
//!
//! Federation may only start once every zone has been set up: registering a
//! remote zone needs a live provider to administer.

use crate::context::OrchestrationContext;
use crate::executor::{ensure_success, RemoteCommandError};
use crate::target::{ComposeProject, DirectoryError, Role, Target};
use crate::topology::{derive_key, ZoneInfo};
use crate::transfer::TransferError;
use fan_out::{FanOut, FanOutError};
use serde::Serialize;
use slog::{debug, error, info, o, Logger};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("zone name \"{zone}\" appears more than once")]
    DuplicateZoneName { zone: String },
    #[error("failed to access the server configuration of {target}")]
    Config {
        target: String,
        #[source]
        err: TransferError,
    },
    #[error("server configuration of {target} is malformed: {reason}")]
    MalformedConfig { target: String, reason: &'static str },
    #[error("failed to list the zones known to zone {local_zone}")]
    ZoneListing {
        local_zone: String,
        #[source]
        err: RemoteCommandError,
    },
    #[error("failed to register zone {remote_zone} with zone {local_zone}")]
    Registration {
        local_zone: String,
        remote_zone: String,
        #[source]
        err: RemoteCommandError,
    },
    #[error("failed to federate zones")]
    Clique(#[source] FanOutError<String, FederationError>),
}

/// The negotiation key two zones share, independent of which one asks.
///
/// Each name is length-prefixed so that no two distinct pairs hash the same
/// input.
pub fn edge_negotiation_key(a: &str, b: &str) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    derive_key(format!("{}:{low}{}:{high}", low.len(), high.len()).as_bytes())
}

/// "`local_zone` accepts `remote_zone`."
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FederationEdge {
    pub local_zone: String,
    pub remote_zone: String,
    pub negotiation_key: String,
    pub remote_provider_host: String,
    pub remote_zone_key: String,
    pub remote_zone_port: u16,
}

/// One element of a server configuration's `federation` array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct FederationEntry<'a> {
    catalog_provider_hosts: Vec<&'a str>,
    negotiation_key: &'a str,
    zone_key: &'a str,
    zone_name: &'a str,
    zone_port: u16,
}

impl FederationEdge {
    pub fn between(
        local: &ZoneInfo,
        remote: &ZoneInfo,
        project: &ComposeProject,
    ) -> Self {
        FederationEdge {
            local_zone: local.zone_name.clone(),
            remote_zone: remote.zone_name.clone(),
            negotiation_key: edge_negotiation_key(
                &local.zone_name,
                &remote.zone_name,
            ),
            remote_provider_host: remote.provider_target(project),
            remote_zone_key: remote.zone_key.clone(),
            remote_zone_port: remote.zone_port,
        }
    }

    pub fn to_config_entry(&self) -> serde_json::Value {
        let entry = FederationEntry {
            catalog_provider_hosts: vec![&self.remote_provider_host],
            negotiation_key: &self.negotiation_key,
            zone_key: &self.remote_zone_key,
            zone_name: &self.remote_zone,
            zone_port: self.remote_zone_port,
        };
        serde_json::json!(entry)
    }

    fn mkzone_args(&self) -> [String; 5] {
        [
            "iadmin".to_string(),
            "mkzone".to_string(),
            self.remote_zone.clone(),
            "remote".to_string(),
            format!("{}:{}", self.remote_provider_host, self.remote_zone_port),
        ]
    }
}

/// Adds or replaces the entry for `entry`'s zone in `config`'s federation
/// array, creating the array if needed.
fn upsert_federation_entry(
    target: &Target,
    config: &mut serde_json::Value,
    entry: serde_json::Value,
) -> Result<(), FederationError> {
    let malformed = |reason| FederationError::MalformedConfig {
        target: target.name.clone(),
        reason,
    };
    let object =
        config.as_object_mut().ok_or_else(|| malformed("not an object"))?;
    let entries = object
        .entry("federation")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| malformed("\"federation\" is not an array"))?;

    match entries
        .iter()
        .position(|existing| existing["zone_name"] == entry["zone_name"])
    {
        Some(index) => entries[index] = entry,
        None => entries.push(entry),
    }
    Ok(())
}

/// The names of every zone `provider`'s catalog already knows about.
async fn known_zones(
    ctx: &OrchestrationContext,
    local_zone: &str,
    provider: &Target,
) -> Result<BTreeSet<String>, FederationError> {
    let command = ctx.service_command("iadmin lz");
    let listing_error = |err| FederationError::ZoneListing {
        local_zone: local_zone.to_string(),
        err,
    };
    let output = ctx
        .executor
        .output(provider, &command)
        .await
        .map_err(|err| listing_error(RemoteCommandError::Exec(err)))?;
    if output.exit_code != 0 {
        return Err(listing_error(RemoteCommandError::Failed {
            target: provider.name.clone(),
            command: command.to_string(),
            exit_code: output.exit_code,
        }));
    }
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Registers `edge`'s remote zone with the provider, unless the provider
/// already knows a zone of that name.
async fn register_remote_zone(
    ctx: &OrchestrationContext,
    log: &Logger,
    provider: &Target,
    known: &BTreeSet<String>,
    edge: &FederationEdge,
) -> Result<(), FederationError> {
    if known.contains(&edge.remote_zone) {
        debug!(
            log,
            "remote zone already registered";
            "remote_zone" => &edge.remote_zone,
        );
        return Ok(());
    }
    let command = ctx.service_command(shell_words::join(edge.mkzone_args()));
    info!(log, "registering remote zone"; "remote_zone" => &edge.remote_zone);
    ensure_success(ctx.executor.as_ref(), provider, &command).await.map_err(
        |err| FederationError::Registration {
            local_zone: edge.local_zone.clone(),
            remote_zone: edge.remote_zone.clone(),
            err,
        },
    )
}

/// Makes `local` trust every other zone in `all_zones`.
///
/// Every node of `local` that is visited (the provider, then the consumers if
/// configured) gets one federation entry per other zone. Remote zones are
/// registered administratively only while visiting the provider, and only if
/// the provider does not know them yet, so federating again is safe.
pub async fn federate_zone(
    ctx: &OrchestrationContext,
    local: &ZoneInfo,
    all_zones: &[ZoneInfo],
) -> Result<(), FederationError> {
    let log = ctx.log.new(o!("zone" => local.zone_name.clone()));
    let names = if ctx.config.federation.include_consumers {
        local.service_targets(&ctx.project)
    } else {
        vec![local.provider_target(&ctx.project)]
    };
    let mut nodes = Vec::with_capacity(names.len());
    for name in &names {
        nodes.push(ctx.target(name).await?);
    }

    let config_path = &ctx.config.service.server_config_path;
    for node in nodes {
        let node_log = log.new(o!("target" => node.name.clone()));
        let mut config =
            ctx.json.read_json(&node, config_path).await.map_err(|err| {
                FederationError::Config { target: node.name.clone(), err }
            })?;

        let known = if node.role == Role::Provider {
            Some(known_zones(ctx, &local.zone_name, &node).await?)
        } else {
            None
        };
        let remotes =
            all_zones.iter().filter(|z| z.zone_name != local.zone_name);
        for remote in remotes {
            let edge = FederationEdge::between(local, remote, &ctx.project);
            if let Some(known) = &known {
                register_remote_zone(ctx, &node_log, &node, known, &edge)
                    .await?;
            }
            let entry = edge.to_config_entry();
            upsert_federation_entry(&node, &mut config, entry)?;
        }

        ctx.json.write_json(&node, config_path, &config).await.map_err(
            |err| FederationError::Config { target: node.name.clone(), err },
        )?;
        debug!(node_log, "wrote federation configuration");
    }
    Ok(())
}

/// Federates every zone with every other zone, one worker per zone.
///
/// Zone names must be unique. Each worker only touches its own zone's nodes.
pub async fn form_federation_clique(
    ctx: &Arc<OrchestrationContext>,
    zones: &[ZoneInfo],
) -> Result<(), FederationError> {
    let mut seen = BTreeSet::new();
    for zone in zones {
        if !seen.insert(zone.zone_name.as_str()) {
            return Err(FederationError::DuplicateZoneName {
                zone: zone.zone_name.clone(),
            });
        }
    }

    info!(ctx.log, "forming federation clique"; "zones" => zones.len());
    let all_zones: Arc<[ZoneInfo]> = zones.into();
    let mut workers: FanOut<String, (), FederationError> =
        FanOut::new_with_parallelism(zones.len());
    for zone in zones {
        let ctx = Arc::clone(ctx);
        let all_zones = Arc::clone(&all_zones);
        let local = zone.clone();
        workers.spawn(zone.zone_name.clone(), async move {
            federate_zone(&ctx, &local, &all_zones).await
        });
    }

    match workers.join_all_then_aggregate().await {
        Ok(_) => Ok(()),
        Err(err) => {
            for (zone, failure) in &err.failures {
                error!(
                    ctx.log,
                    "federation failed";
                    "zone" => zone,
                    "error" => %failure,
                );
            }
            Err(FederationError::Clique(err))
        }
    }
}
