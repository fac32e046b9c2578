// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrapper around the `vmsctl` command, which drives copy-on-write VM
//! operations against the local hypervisor.

use super::{BlessOutcome, Error, HypervisorKind};
use crate::exec::{command_to_string, execute_async, ExecutionError};
use camino::{Utf8Path, Utf8PathBuf};
use cowvm_common::api::TransferEndpoint;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use slog::{debug, o, Logger};
use std::collections::BTreeMap;
use std::process::Output;

/// What `vmsctl bless` prints on success.
#[derive(Debug, Deserialize)]
struct BlessOutput {
    name: String,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    files: Vec<String>,
}

/// A memory server reported by `vmsctl probe`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct MemoryServer {
    pub pid: u32,
    /// The address the server streams from, if it is a transfer source.
    #[serde(default)]
    pub network: Option<String>,
}

pub struct VmsCtl {
    log: Logger,
    path: Utf8PathBuf,
    kind: HypervisorKind,
    connection_url: Option<String>,
}

impl VmsCtl {
    pub fn new(
        log: &Logger,
        path: Utf8PathBuf,
        kind: HypervisorKind,
        connection_url: Option<String>,
    ) -> VmsCtl {
        VmsCtl {
            log: log.new(o!("component" => "VmsCtl", "hypervisor" => kind.to_string())),
            path,
            kind,
            connection_url,
        }
    }

    fn command(&self, args: &[String]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(self.path.as_std_path());
        cmd.arg("--hypervisor").arg(self.kind.to_string());
        if let Some(url) = &self.connection_url {
            cmd.arg("--connection").arg(url);
        }
        cmd.args(args);
        cmd
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ExecutionError> {
        let mut cmd = self.command(&args);
        let command = command_to_string(cmd.as_std());
        debug!(self.log, "running"; "command" => &command);
        let result = execute_async(&mut cmd).await;
        debug!(self.log, "finished";
            "command" => &command,
            "success" => result.is_ok(),
        );
        result
    }

    async fn run_json<T: DeserializeOwned>(
        &self,
        args: Vec<String>,
    ) -> Result<T, ExecutionError> {
        let command = args.join(" ");
        let output = self.run(args).await?;
        serde_json::from_slice(&output.stdout).map_err(|err| {
            ExecutionError::ParseFailure { command, message: err.to_string() }
        })
    }

    pub async fn bless(
        &self,
        source_name: &str,
        new_name: &str,
        transfer: Option<&TransferEndpoint>,
    ) -> Result<BlessOutcome, Error> {
        let mut args =
            vec![String::from("bless"), source_name.into(), new_name.into()];
        if let Some(transfer) = transfer {
            args.extend([
                String::from("--mem-url"),
                transfer.to_string(),
                String::from("--migration"),
            ]);
        }
        let output: BlessOutput = self.run_json(args).await?;
        Ok(BlessOutcome {
            name: output.name,
            transfer: output.network.map(TransferEndpoint::from),
            artifacts: output.files,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn launch(
        &self,
        source_name: &str,
        new_name: &str,
        target_pages: u64,
        path: Option<&Utf8Path>,
        transfer: Option<&TransferEndpoint>,
        guest: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let mut args = vec![
            String::from("launch"),
            source_name.into(),
            new_name.into(),
            target_pages.to_string(),
        ];
        if let Some(path) = path {
            args.extend([String::from("--path"), path.to_string()]);
        }
        if let Some(transfer) = transfer {
            args.extend([
                String::from("--mem-url"),
                transfer.to_string(),
                String::from("--migration"),
            ]);
        }
        for (key, value) in guest {
            args.extend([String::from("--param"), format!("{key}={value}")]);
        }
        self.run(args).await?;
        Ok(())
    }

    pub async fn discard(
        &self,
        instance_name: &str,
        transfer: Option<&TransferEndpoint>,
    ) -> Result<(), Error> {
        let mut args = vec![String::from("discard"), instance_name.into()];
        if let Some(transfer) = transfer {
            args.extend([String::from("--mem-url"), transfer.to_string()]);
        }
        self.run(args).await?;
        Ok(())
    }

    /// Unplugs every interface, then plugs one per entry of `mac_table`.
    pub async fn replug(
        &self,
        instance_name: &str,
        mac_table: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let mut args = vec![
            String::from("replug"),
            instance_name.into(),
            String::from("--unplug-first"),
        ];
        for (index, mac) in mac_table {
            args.extend([String::from("--mac"), format!("{index}={mac}")]);
        }
        self.run(args).await?;
        Ok(())
    }

    pub async fn export(
        &self,
        instance_name: &str,
        archive: &Utf8Path,
        path: Option<&Utf8Path>,
    ) -> Result<(), Error> {
        let mut args = vec![
            String::from("export"),
            instance_name.into(),
            archive.to_string(),
        ];
        if let Some(path) = path {
            args.extend([String::from("--path"), path.to_string()]);
        }
        self.run(args).await?;
        Ok(())
    }

    pub async fn import(
        &self,
        instance_name: &str,
        archive: &Utf8Path,
    ) -> Result<(), Error> {
        self.run(vec![
            String::from("import"),
            instance_name.into(),
            archive.to_string(),
        ])
        .await?;
        Ok(())
    }

    pub async fn memory_servers(&self) -> Result<Vec<MemoryServer>, Error> {
        Ok(self.run_json(vec![String::from("probe")]).await?)
    }

    pub async fn kill_memory_server(&self, pid: u32) -> Result<(), Error> {
        self.run(vec![
            String::from("kill"),
            pid.to_string(),
            String::from("--timeout"),
            String::from("1"),
        ])
        .await?;
        Ok(())
    }
}
