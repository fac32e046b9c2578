// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a controller
//! configuration

use camino::Utf8Path;
use camino::Utf8PathBuf;
use cowvm_common::api::HostName;
use cowvm_host_agent::hypervisor::SimOperation;
use dropshot::{ConfigDropshot, ConfigLogging};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the request gateway and the simulated deployment it
/// runs against
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Dropshot configuration for the API server
    pub dropshot: ConfigDropshot,
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    /// Service topic the host agents consume.
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct QuotaConfig {
    /// Live instances a single project may own.
    pub max_instances_per_project: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        QuotaConfig { max_instances_per_project: 10 }
    }
}

/// The hosts started in-process by `cowvm-sim`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct SimConfig {
    #[serde(default = "default_sim_hosts")]
    pub hosts: Vec<HostName>,
    #[serde(default)]
    pub use_artifact_store: bool,
    #[serde(default = "default_reconcile_period_secs")]
    pub reconcile_period_secs: u64,
    /// How long every simulated launch takes.
    #[serde(default)]
    pub launch_delay_ms: u64,
    /// Hypervisor operations that fail on every simulated host.
    #[serde(default)]
    pub failing_operations: Vec<SimOperation>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            hosts: default_sim_hosts(),
            use_artifact_store: false,
            reconcile_period_secs: default_reconcile_period_secs(),
            launch_delay_ms: 0,
            failing_operations: Vec::new(),
        }
    }
}

fn default_topic() -> String {
    cowvm_common::DEFAULT_TOPIC.to_string()
}

fn default_sim_hosts() -> Vec<HostName> {
    vec![HostName::from("sim-host-1"), HostName::from("sim-host-2")]
}

fn default_reconcile_period_secs() -> u64 {
    60
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
