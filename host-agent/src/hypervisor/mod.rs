// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor driver: the component that actually freezes, clones and
//! tears down virtual machines.
//!
//! Each lifecycle step hands the driver an immutable context describing the
//! instance and what is being asked of it, and gets back an explicit result.
//! The driver variant is chosen once at startup from configuration.

mod api_managed;
mod libvirt;
mod sim;
mod vmsctl;

pub use api_managed::ApiManagedHypervisor;
pub use libvirt::LibvirtHypervisor;
pub use sim::{SimCall, SimHypervisor, SimOperation};
pub use vmsctl::VmsCtl;

use crate::config::HypervisorConfig;
use crate::exec::ExecutionError;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cowvm_common::api::{InstanceRecord, TransferEndpoint};
use cowvm_common::services::{ArtifactStore, NetworkInfo};
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Exec(#[from] ExecutionError),

    #[error("{message} \"{path}\": {err}")]
    Io {
        message: String,
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("artifact store: {0}")]
    Artifact(#[from] cowvm_common::api::Error),

    #[error("simulated failure in {0}")]
    Injected(SimOperation),
}

impl Error {
    pub(crate) fn io(
        message: &str,
        path: &Utf8Path,
        err: std::io::Error,
    ) -> Error {
        Error::Io { message: message.to_string(), path: path.to_owned(), err }
    }
}

impl From<Error> for cowvm_common::api::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Artifact(err) => err.internal_context("hypervisor"),
            other => cowvm_common::api::Error::internal_error(&format!(
                "hypervisor: {}",
                other
            )),
        }
    }
}

/// Which driver variant to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HypervisorKind {
    Libvirt,
    ApiManaged,
    Sim,
}

/// Freeze `source_name` into the template described by `instance`.
#[derive(Clone, Copy, Debug)]
pub struct BlessContext<'a> {
    pub source_name: &'a str,
    pub instance: &'a InstanceRecord,
    /// Set for the in-place bless that starts a migration.
    pub transfer: Option<&'a TransferEndpoint>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlessOutcome {
    pub name: String,
    /// Where the frozen state is being served from, for a migration bless.
    pub transfer: Option<TransferEndpoint>,
    /// References to the template files produced.
    pub artifacts: Vec<String>,
}

/// Materialize `instance` from the template `source_name`.
#[derive(Clone, Copy, Debug)]
pub struct LaunchContext<'a> {
    pub source_name: &'a str,
    pub instance: &'a InstanceRecord,
    /// Memory target in pages; zero means none.
    pub target_pages: u64,
    pub network: &'a NetworkInfo,
    /// Set when receiving a migrating instance.
    pub transfer: Option<&'a TransferEndpoint>,
    /// Template artifacts recorded by bless.
    pub images: &'a [String],
    /// Whether `images` are artifact ids to fetch from the artifact store.
    pub fetch_artifacts: bool,
    pub guest: &'a BTreeMap<String, String>,
}

impl LaunchContext<'_> {
    pub fn is_migration(&self) -> bool {
        self.transfer.is_some()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DiscardContext<'a> {
    pub instance_name: &'a str,
    pub transfer: Option<&'a TransferEndpoint>,
}

/// The source side of a migration, before and after the transfer.
#[derive(Clone, Copy, Debug)]
pub struct MigrationContext<'a> {
    pub instance: &'a InstanceRecord,
    pub network: &'a NetworkInfo,
    pub transfer: &'a TransferEndpoint,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn kind(&self) -> HypervisorKind;

    async fn bless(&self, ctx: &BlessContext<'_>)
        -> Result<BlessOutcome, Error>;

    /// Reads a template file produced by bless, for upload.
    async fn artifact_contents(&self, reference: &str)
        -> Result<Vec<u8>, Error>;

    /// Removes local template files once they have been uploaded.
    async fn bless_cleanup(&self, artifacts: &[String]) -> Result<(), Error>;

    async fn launch(&self, ctx: &LaunchContext<'_>) -> Result<(), Error>;

    async fn discard(&self, ctx: &DiscardContext<'_>) -> Result<(), Error>;

    /// Replaces the network interfaces of a running instance.
    async fn replug(
        &self,
        instance_name: &str,
        mac_table: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    async fn pre_migration(&self, ctx: &MigrationContext<'_>)
        -> Result<(), Error>;

    async fn post_migration(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<(), Error>;

    /// Writes the template `instance_name` into `archive`.
    async fn export(
        &self,
        instance_name: &str,
        archive: &Utf8Path,
    ) -> Result<(), Error>;

    /// Installs the template in `archive` as `instance_name`.
    async fn import(
        &self,
        instance_name: &str,
        archive: &Utf8Path,
    ) -> Result<(), Error>;
}

/// Builds the configured driver variant.
pub fn from_config(
    log: &Logger,
    config: &HypervisorConfig,
    artifacts: Arc<dyn ArtifactStore>,
) -> Arc<dyn Hypervisor> {
    match config {
        HypervisorConfig::Libvirt {
            vmsctl_path,
            instances_path,
            connection_url,
        } => Arc::new(LibvirtHypervisor::new(
            log,
            VmsCtl::new(
                log,
                vmsctl_path.clone(),
                HypervisorKind::Libvirt,
                connection_url.clone(),
            ),
            instances_path.clone(),
            artifacts,
        )),
        HypervisorConfig::ApiManaged { vmsctl_path, connection_url } => {
            Arc::new(ApiManagedHypervisor::new(VmsCtl::new(
                log,
                vmsctl_path.clone(),
                HypervisorKind::ApiManaged,
                Some(connection_url.clone()),
            )))
        }
        HypervisorConfig::Sim => {
            Arc::new(SimHypervisor::new(log).with_artifact_store(artifacts))
        }
    }
}
