// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for hypervisors managed through a remote management API.
//!
//! The management stack owns disk files and interfaces, so there is nothing to
//! fetch before a launch and nothing to flush before a migration. Launched
//! instances come up with the template's interfaces and must be replugged
//! with their own.

use super::{
    BlessContext, BlessOutcome, DiscardContext, Error, Hypervisor,
    HypervisorKind, LaunchContext, MigrationContext, VmsCtl,
};
use async_trait::async_trait;
use camino::Utf8Path;
use std::collections::BTreeMap;

pub struct ApiManagedHypervisor {
    vmsctl: VmsCtl,
}

impl ApiManagedHypervisor {
    pub fn new(vmsctl: VmsCtl) -> ApiManagedHypervisor {
        ApiManagedHypervisor { vmsctl }
    }
}

#[async_trait]
impl Hypervisor for ApiManagedHypervisor {
    fn kind(&self) -> HypervisorKind {
        HypervisorKind::ApiManaged
    }

    async fn bless(
        &self,
        ctx: &BlessContext<'_>,
    ) -> Result<BlessOutcome, Error> {
        self.vmsctl
            .bless(ctx.source_name, &ctx.instance.name(), ctx.transfer)
            .await
    }

    async fn artifact_contents(
        &self,
        reference: &str,
    ) -> Result<Vec<u8>, Error> {
        tokio::fs::read(reference).await.map_err(|err| {
            Error::io("failed to read blessed file", Utf8Path::new(reference), err)
        })
    }

    async fn bless_cleanup(&self, _artifacts: &[String]) -> Result<(), Error> {
        Ok(())
    }

    async fn launch(&self, ctx: &LaunchContext<'_>) -> Result<(), Error> {
        let name = ctx.instance.name();
        self.vmsctl
            .launch(
                ctx.source_name,
                &name,
                ctx.target_pages,
                None,
                ctx.transfer,
                ctx.guest,
            )
            .await?;
        if !ctx.network.is_empty() {
            self.vmsctl.replug(&name, &ctx.network.mac_table()).await?;
        }
        Ok(())
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
        Ok(())
    }

    async fn post_migration(
        &self,
        _ctx: &MigrationContext<'_>,
    ) -> Result<(), Error> {
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
