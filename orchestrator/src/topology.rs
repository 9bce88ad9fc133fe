// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zone topology: which targets make up each independently-keyed zone.
//!
//! Zone `i` (0-indexed) uses database and provider instance `i + 1`, and the
//! consumers whose instance numbers fall in `(i * n, (i + 1) * n]` for `n`
//! consumers per zone.

use crate::target::{ComposeProject, DirectoryError, Role, TargetDirectory};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use slog::{warn, Logger};
use std::collections::BTreeSet;
use thiserror::Error;

pub const DEFAULT_ZONE_PORT: u16 = 1247;

/// Required length, in bytes, of a negotiation key.
pub const NEGOTIATION_KEY_LEN: usize = 32;

const DEFAULT_NEGOTIATION_KEY: &str = "32_byte_server_negotiation_key__";

/// How each zone's negotiation key is produced.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "generator", rename_all = "snake_case")]
pub enum NegotiationKeyGenerator {
    /// The same key for every zone.
    Constant { key: String },
    /// A key derived from the zone name, distinct per zone.
    DerivedFromZoneName,
}

impl Default for NegotiationKeyGenerator {
    fn default() -> Self {
        NegotiationKeyGenerator::Constant {
            key: DEFAULT_NEGOTIATION_KEY.to_string(),
        }
    }
}

impl NegotiationKeyGenerator {
    pub fn generate(&self, zone_name: &str) -> String {
        match self {
            NegotiationKeyGenerator::Constant { key } => key.clone(),
            NegotiationKeyGenerator::DerivedFromZoneName => {
                derive_key(zone_name.as_bytes())
            }
        }
    }
}

/// Hex-encoded SHA-256 of `input`, truncated to [NEGOTIATION_KEY_LEN]
/// characters.
pub(crate) fn derive_key(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut key = hex::encode(digest);
    key.truncate(NEGOTIATION_KEY_LEN);
    key
}

pub fn zone_key_for(zone_name: &str) -> String {
    format!("ZONE_KEY_FOR_{zone_name}")
}

/// One independently-keyed deployment unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ZoneInfo {
    pub zone_name: String,
    pub zone_key: String,
    pub negotiation_key: String,
    pub zone_port: u16,
    pub database_instance: u32,
    pub provider_instance: u32,
    pub consumer_instances: BTreeSet<u32>,
}

impl ZoneInfo {
    pub fn database_target(&self, project: &ComposeProject) -> String {
        project.container_name(Role::Database, self.database_instance)
    }

    pub fn provider_target(&self, project: &ComposeProject) -> String {
        project.container_name(Role::Provider, self.provider_instance)
    }

    pub fn consumer_targets(&self, project: &ComposeProject) -> Vec<String> {
        self.consumer_instances
            .iter()
            .map(|instance| project.container_name(Role::Consumer, *instance))
            .collect()
    }

    /// The provider followed by every consumer.
    pub fn service_targets(&self, project: &ComposeProject) -> Vec<String> {
        std::iter::once(self.provider_target(project))
            .chain(self.consumer_targets(project))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(
        "negotiation key for zone {zone} is {len} bytes; it must be exactly \
         {NEGOTIATION_KEY_LEN}"
    )]
    InvalidNegotiationKey { zone: String, len: usize },
    #[error("zone names must not be empty")]
    EmptyZoneName,
}

/// Derives one [ZoneInfo] per name in `zone_names` from the consumers that
/// are currently running.
///
/// Empty zone names are rejected before the directory is consulted. Repeated
/// names are allowed: independent zones may share a name as long as they are
/// never federated with each other.
///
/// A zone that ends up with fewer consumers than requested is logged, not
/// rejected, so that later phases can report on a partial topology.
pub async fn derive_zones(
    log: &Logger,
    directory: &dyn TargetDirectory,
    zone_names: &[String],
    consumers_per_zone: u32,
    zone_port: u16,
    keys: &NegotiationKeyGenerator,
) -> Result<Vec<ZoneInfo>, TopologyError> {
    if zone_names.iter().any(|name| name.is_empty()) {
        return Err(TopologyError::EmptyZoneName);
    }
    let running: BTreeSet<u32> = directory
        .list(Some(Role::Consumer))
        .await?
        .into_iter()
        .map(|target| target.instance)
        .collect();

    let mut zones = Vec::with_capacity(zone_names.len());
    for (ordinal, zone_name) in (0u32..).zip(zone_names) {
        let consumer_instances =
            consumers_for_zone(ordinal, consumers_per_zone, &running);
        if consumer_instances.len() != consumers_per_zone as usize {
            warn!(
                log,
                "zone has fewer consumers than requested";
                "zone" => zone_name,
                "requested" => consumers_per_zone,
                "found" => consumer_instances.len(),
            );
        }

        let negotiation_key = keys.generate(zone_name);
        if negotiation_key.len() != NEGOTIATION_KEY_LEN {
            return Err(TopologyError::InvalidNegotiationKey {
                zone: zone_name.clone(),
                len: negotiation_key.len(),
            });
        }

        zones.push(ZoneInfo {
            zone_name: zone_name.clone(),
            zone_key: zone_key_for(zone_name),
            negotiation_key,
            zone_port,
            database_instance: ordinal + 1,
            provider_instance: ordinal + 1,
            consumer_instances,
        });
    }
    Ok(zones)
}

/// The running consumer instances belonging to zone `ordinal`.
fn consumers_for_zone(
    ordinal: u32,
    consumers_per_zone: u32,
    running: &BTreeSet<u32>,
) -> BTreeSet<u32> {
    let per_zone = u64::from(consumers_per_zone);
    let low = u64::from(ordinal) * per_zone;
    let high = low + per_zone;
    running
        .iter()
        .copied()
        .filter(|instance| {
            let instance = u64::from(*instance);
            instance > low && instance <= high
        })
        .collect()
}
