// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a host agent
//! configuration

use crate::worker_pool::WorkerPoolConfig;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use cowvm_common::api::HostName;
use dropshot::{ConfigLogging, ConfigLoggingLevel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Which hypervisor driver the agent uses, and how to reach it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HypervisorConfig {
    Libvirt {
        vmsctl_path: Utf8PathBuf,
        /// Where instance working directories and fetched templates live.
        instances_path: Utf8PathBuf,
        #[serde(default)]
        connection_url: Option<String>,
    },
    ApiManaged {
        vmsctl_path: Utf8PathBuf,
        connection_url: String,
    },
    Sim,
}

/// Configuration for a host agent
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// The host this agent serves.
    pub host: HostName,
    /// Service topic this agent consumes.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    pub hypervisor: HypervisorConfig,
    /// Whether blessed artifacts are uploaded to the artifact store rather
    /// than left as local files.
    #[serde(default)]
    pub use_artifact_store: bool,
    /// Address advertised in migration transfer endpoints. Defaults to the
    /// name of the interface that routes to the destination.
    #[serde(default)]
    pub outgoing_migration_address: Option<String>,
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    #[serde(default = "default_reconcile_period_secs")]
    pub reconcile_period_secs: u64,
    /// Bound on the destination's launch during a migration.
    #[serde(default = "default_migration_launch_timeout_secs")]
    pub migration_launch_timeout_secs: u64,
    /// Skip network allocation when launching.
    #[serde(default)]
    pub stub_network: bool,
}

fn default_topic() -> String {
    cowvm_common::DEFAULT_TOPIC.to_string()
}

fn default_reconcile_period_secs() -> u64 {
    60
}

fn default_migration_launch_timeout_secs() -> u64 {
    1800
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

    /// A configuration for an agent driving the simulated hypervisor.
    pub fn sim(host: HostName) -> Config {
        Config {
            host,
            topic: default_topic(),
            log: ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            },
            hypervisor: HypervisorConfig::Sim,
            use_artifact_store: false,
            outgoing_migration_address: None,
            worker_pool: WorkerPoolConfig::default(),
            reconcile_period_secs: default_reconcile_period_secs(),
            migration_launch_timeout_secs:
                default_migration_launch_timeout_secs(),
            stub_network: false,
        }
    }

    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_secs)
    }

    pub fn migration_launch_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_launch_timeout_secs)
    }
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

    fn write_config(contents: &str) -> (camino_tempfile::Utf8TempDir, Utf8PathBuf) {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_minimal_config() {
        let (_dir, path) = write_config(
            r#"
            host = "h1"

            [log]
            mode = "stderr-terminal"
            level = "info"

            [hypervisor]
            kind = "sim"
            "#,
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.host, HostName::from("h1"));
        assert_eq!(config.topic, "cowvm");
        assert_eq!(config.hypervisor, HypervisorConfig::Sim);
        assert_eq!(config.migration_launch_timeout(), Duration::from_secs(1800));
        assert_eq!(config.worker_pool, WorkerPoolConfig::default());
        assert!(!config.use_artifact_store);
    }

    #[test]
    fn test_libvirt_config() {
        let (_dir, path) = write_config(
            r#"
            host = "h2"
            topic = "cowvm-test"
            use_artifact_store = true
            outgoing_migration_address = "10.0.0.2"
            reconcile_period_secs = 5

            [log]
            mode = "stderr-terminal"
            level = "debug"

            [hypervisor]
            kind = "libvirt"
            vmsctl_path = "/usr/bin/vmsctl"
            instances_path = "/var/lib/instances"

            [worker_pool]
            workers = 2
            queue_depth = 4
            "#,
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config.hypervisor,
            HypervisorConfig::Libvirt {
                vmsctl_path: "/usr/bin/vmsctl".into(),
                instances_path: "/var/lib/instances".into(),
                connection_url: None,
            }
        );
        assert_eq!(config.outgoing_migration_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(config.reconcile_period(), Duration::from_secs(5));
        assert_eq!(config.worker_pool.workers, 2);
    }

    #[test]
    fn test_unsupported_hypervisor() {
        let (_dir, path) = write_config(
            r#"
            host = "h1"

            [log]
            mode = "stderr-terminal"
            level = "info"

            [hypervisor]
            kind = "xen"
            "#,
        );
        assert!(matches!(
            Config::from_file(&path),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file(Utf8Path::new("/nonexistent/config.toml")),
            Err(LoadError::Io { .. })
        ));
    }
}
