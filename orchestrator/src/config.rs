// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the test environment's configuration file
//!
//! Every section has defaults matching the stock container images, so an
//! empty file (or no file at all) is a valid configuration.

use crate::topology::NegotiationKeyGenerator;
use crate::topology::DEFAULT_ZONE_PORT;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for one orchestration run
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Names of the compose services backing each role.
    pub project: ProjectConfig,
    /// Where the catalog service lives inside its containers.
    pub service: ServiceConfig,
    /// Catalog database settings.
    pub database: DatabaseConfig,
    /// Zone-wide settings shared by every derived zone.
    pub zones: ZonesConfig,
    /// Federation behavior.
    pub federation: FederationConfig,
    /// Test execution settings.
    pub tests: TestsConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub database_service: String,
    pub provider_service: String,
    pub consumer_service: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        ProjectConfig {
            database_service: "catalog".to_string(),
            provider_service: "catalog-service-provider".to_string(),
            consumer_service: "catalog-service-consumer".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Operating identity the service (and its tests) run as.
    pub user: String,
    pub working_directory: String,
    pub server_config_path: String,
    pub version_file: String,
    pub setup_script: String,
    /// Service control entry point, relative to `working_directory`.
    pub control_script: String,
    pub test_script: String,
    pub log_directory: String,
    /// Where the generated setup input is written on each node.
    pub setup_input_path: String,
    pub admin_user: String,
    pub admin_password: String,
    pub default_resource_directory: String,
    pub default_resource_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            user: "irods".to_string(),
            working_directory: "/var/lib/irods".to_string(),
            server_config_path: "/etc/irods/server_config.json".to_string(),
            version_file: "/var/lib/irods/version.json".to_string(),
            setup_script: "/var/lib/irods/scripts/setup_irods.py".to_string(),
            control_script: "./irodsctl".to_string(),
            test_script: "/var/lib/irods/scripts/run_tests.py".to_string(),
            log_directory: "/var/lib/irods/log".to_string(),
            setup_input_path: "/tmp/catalog_setup_input.json".to_string(),
            admin_user: "rods".to_string(),
            admin_password: "rods".to_string(),
            default_resource_directory: "/var/lib/irods/Vault".to_string(),
            default_resource_name: "demoResc".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub catalog_name: String,
    pub user: String,
    pub password: String,
    /// Password of the database engine's administrative account.
    pub admin_password: String,
    /// Drop and recreate the catalog database and user instead of reusing
    /// existing ones.
    pub force_recreate: bool,
    /// How many times to probe the database before giving up.
    pub ready_retries: u32,
    /// Seconds to wait between probes.
    pub ready_delay_secs: u64,
    /// Archive holding an ODBC driver and its `odbcinst.ini`, for database
    /// families whose driver is not part of the service image.
    pub odbc_driver_archive: Option<Utf8PathBuf>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            catalog_name: "ICAT".to_string(),
            user: "irods".to_string(),
            password: "testpassword".to_string(),
            admin_password: "testpassword".to_string(),
            force_recreate: false,
            ready_retries: 60,
            ready_delay_secs: 1,
            odbc_driver_archive: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ZonesConfig {
    pub port: u16,
    pub negotiation_key: NegotiationKeyGenerator,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        ZonesConfig {
            port: DEFAULT_ZONE_PORT,
            negotiation_key: NegotiationKeyGenerator::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Also write federation entries into every consumer's configuration.
    pub include_consumers: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct TestsConfig {
    /// How many consecutive attempts may fail with an identical set of
    /// failed tests before the retry driver gives up.
    pub retries_when_stuck: u32,
    /// Options passed through to every test invocation.
    pub options: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.database.ready_retries, 60);
        assert_eq!(config.zones.port, 1247);
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [database]
            catalog_name = "CATALOG"
            force_recreate = true

            [zones.negotiation_key]
            generator = "derived_from_zone_name"

            [federation]
            include_consumers = true
            "#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.database.catalog_name, "CATALOG");
        assert!(config.database.force_recreate);
        assert_eq!(config.database.user, "irods");
        assert_eq!(
            config.zones.negotiation_key,
            NegotiationKeyGenerator::DerivedFromZoneName
        );
        assert!(config.federation.include_consumers);
        assert_eq!(config.service, ServiceConfig::default());
    }

    #[test]
    fn test_load_errors_name_the_path() {
        let dir = Utf8TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = Config::from_file(&missing).unwrap_err();
        assert_matches!(
            err,
            LoadError::Io { ref path, .. } if *path == missing
        );

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[database\n").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert_matches!(err, LoadError::Parse { .. });
        assert!(err.to_string().contains("bad.toml"));
    }
}
