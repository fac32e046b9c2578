// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for hosts where instances run under libvirt

use super::{
    BlessContext, BlessOutcome, DiscardContext, Error, Hypervisor,
    HypervisorKind, LaunchContext, MigrationContext, VmsCtl,
};
use crate::exec::execute_async;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cowvm_common::api::ArtifactId;
use cowvm_common::services::ArtifactStore;
use slog::{debug, o, warn, Logger};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

/// Permissions given to template files so the hypervisor user can read them.
const BLESSED_FILE_MODE: u32 = 0o644;

pub struct LibvirtHypervisor {
    log: Logger,
    vmsctl: VmsCtl,
    instances_path: Utf8PathBuf,
    artifacts: Arc<dyn ArtifactStore>,
}

impl LibvirtHypervisor {
    pub fn new(
        log: &Logger,
        vmsctl: VmsCtl,
        instances_path: Utf8PathBuf,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> LibvirtHypervisor {
        LibvirtHypervisor {
            log: log.new(o!("component" => "LibvirtHypervisor")),
            vmsctl,
            instances_path,
            artifacts,
        }
    }

    fn base_path(&self) -> Utf8PathBuf {
        self.instances_path.join("_base")
    }

    /// Fetches template artifacts into the shared base directory.
    ///
    /// Files already present are reused, except for a migration, where the
    /// descriptor may have changed since it was last fetched.
    async fn fetch_artifacts(
        &self,
        ctx: &LaunchContext<'_>,
    ) -> Result<Utf8PathBuf, Error> {
        let base = self.base_path();
        tokio::fs::create_dir_all(&base).await.map_err(|err| {
            Error::io("failed to create base directory", &base, err)
        })?;

        for image in ctx.images {
            let id: ArtifactId = image.parse().map_err(|_| {
                cowvm_common::api::Error::internal_error(&format!(
                    "malformed artifact reference {:?}",
                    image
                ))
            })?;
            let record = self.artifacts.show(id).await?;
            let target = base.join(&record.name);
            if !ctx.is_migration() && target.exists() {
                continue;
            }
            debug!(self.log, "downloading artifact";
                "artifact_id" => %id,
                "target" => %target,
            );
            let contents = self.artifacts.download(id).await?;
            install_atomically(&base, &target, contents).await?;
        }
        Ok(base)
    }
}

/// Writes `contents` to a temporary file in `dir` and renames it into place,
/// so that `target` never appears partially written.
async fn install_atomically(
    dir: &Utf8Path,
    target: &Utf8Path,
    contents: Vec<u8>,
) -> Result<(), Error> {
    let temp = camino_tempfile::NamedUtf8TempFile::new_in(dir).map_err(
        |err| Error::io("failed to create temporary file", dir, err),
    )?;
    tokio::fs::write(temp.path(), contents).await.map_err(|err| {
        Error::io("failed to write artifact", temp.path(), err)
    })?;
    std::fs::set_permissions(
        temp.path(),
        std::fs::Permissions::from_mode(BLESSED_FILE_MODE),
    )
    .map_err(|err| {
        Error::io("failed to set permissions on", temp.path(), err)
    })?;
    temp.persist(target).map_err(|err| {
        Error::io("failed to install artifact", target, err.error)
    })?;
    Ok(())
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    fn kind(&self) -> HypervisorKind {
        HypervisorKind::Libvirt
    }

    async fn bless(
        &self,
        ctx: &BlessContext<'_>,
    ) -> Result<BlessOutcome, Error> {
        let outcome = self
            .vmsctl
            .bless(ctx.source_name, &ctx.instance.name(), ctx.transfer)
            .await?;
        for file in &outcome.artifacts {
            if let Err(err) = std::fs::set_permissions(
                file,
                std::fs::Permissions::from_mode(BLESSED_FILE_MODE),
            ) {
                warn!(self.log, "failed to make blessed file readable";
                    "file" => file,
                    "error" => %err,
                );
            }
        }
        Ok(outcome)
    }

    async fn artifact_contents(
        &self,
        reference: &str,
    ) -> Result<Vec<u8>, Error> {
        tokio::fs::read(reference).await.map_err(|err| {
            Error::io("failed to read blessed file", Utf8Path::new(reference), err)
        })
    }

    async fn bless_cleanup(&self, artifacts: &[String]) -> Result<(), Error> {
        for file in artifacts {
            match tokio::fs::remove_file(file).await {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => {
                    return Err(Error::io(
                        "failed to remove blessed file",
                        Utf8Path::new(file),
                        err,
                    ))
                }
            }
        }
        Ok(())
    }

    async fn launch(&self, ctx: &LaunchContext<'_>) -> Result<(), Error> {
        let name = ctx.instance.name();
        let working_dir = self.instances_path.join(&name);
        tokio::fs::create_dir_all(&working_dir).await.map_err(|err| {
            Error::io("failed to create instance directory", &working_dir, err)
        })?;

        let path = if ctx.fetch_artifacts {
            Some(self.fetch_artifacts(ctx).await?)
        } else {
            None
        };

        self.vmsctl
            .launch(
                ctx.source_name,
                &name,
                ctx.target_pages,
                path.as_deref(),
                ctx.transfer,
                ctx.guest,
            )
            .await
    }

    async fn discard(&self, ctx: &DiscardContext<'_>) -> Result<(), Error> {
        self.vmsctl.discard(ctx.instance_name, ctx.transfer).await
    }

    async fn replug(
        &self,
        instance_name: &str,
        mac_table: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.vmsctl.replug(instance_name, mac_table).await
    }

    async fn pre_migration(
        &self,
        _ctx: &MigrationContext<'_>,
    ) -> Result<(), Error> {
        // There is no way to flush only this instance's files.
        let mut cmd = tokio::process::Command::new("sync");
        execute_async(&mut cmd).await?;
        Ok(())
    }

    async fn post_migration(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<(), Error> {
        // The domain is already gone, so find the memory servers by the
        // endpoint they were serving rather than by process.
        for server in self.vmsctl.memory_servers().await? {
            let serving_transfer = server
                .network
                .as_deref()
                .is_some_and(|network| ctx.transfer.as_str().contains(network));
            if !serving_transfer {
                continue;
            }
            if let Err(err) = self.vmsctl.kill_memory_server(server.pid).await
            {
                warn!(self.log, "failed to stop memory server";
                    "pid" => server.pid,
                    "error" => %err,
                );
            }
        }
        Ok(())
    }

    async fn export(
        &self,
        instance_name: &str,
        archive: &Utf8Path,
    ) -> Result<(), Error> {
        self.vmsctl.export(instance_name, archive, None).await
    }

    async fn import(
        &self,
        instance_name: &str,
        archive: &Utf8Path,
    ) -> Result<(), Error> {
        self.vmsctl.import(instance_name, archive).await
    }
}
