// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A driver with no external effects, for tests and the simulated deployment

use super::{
    BlessContext, BlessOutcome, DiscardContext, Error, Hypervisor,
    HypervisorKind, LaunchContext, MigrationContext,
};
use async_trait::async_trait;
use camino::Utf8Path;
use cowvm_common::api::ArtifactId;
use cowvm_common::services::ArtifactStore;
use serde::{Deserialize, Serialize};
use slog::{debug, o, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The driver operations that can be made to fail.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SimOperation {
    Bless,
    Launch,
    Discard,
    Replug,
    PreMigration,
    PostMigration,
    Export,
    Import,
}

/// One call made against the driver, whether or not it succeeded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimCall {
    pub operation: SimOperation,
    pub instance_name: String,
}

/// What an export archive holds: the template files by reference.
#[derive(Deserialize, Serialize)]
struct SimArchive {
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<SimCall>,
    fail_next: BTreeSet<SimOperation>,
    failing: BTreeSet<SimOperation>,
    /// Template files produced by bless, by reference.
    files: BTreeMap<String, Vec<u8>>,
    running: BTreeSet<String>,
}

pub struct SimHypervisor {
    log: Logger,
    inner: Mutex<Inner>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    launch_delay: Duration,
}

impl SimHypervisor {
    pub fn new(log: &Logger) -> SimHypervisor {
        SimHypervisor {
            log: log.new(o!("component" => "SimHypervisor")),
            inner: Mutex::new(Inner::default()),
            artifacts: None,
            launch_delay: Duration::ZERO,
        }
    }

    /// Makes launches fetch their template artifacts from `artifacts`.
    pub fn with_artifact_store(
        mut self,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> SimHypervisor {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> SimHypervisor {
        self.launch_delay = delay;
        self
    }

    /// Makes the next call of `operation` fail.
    pub fn fail_next(&self, operation: SimOperation) {
        self.inner.lock().unwrap().fail_next.insert(operation);
    }

    /// Makes every call of `operation` fail until cleared.
    pub fn set_failing(&self, operation: SimOperation, failing: bool) {
        let mut inner = self.inner.lock().unwrap();
        if failing {
            inner.failing.insert(operation);
        } else {
            inner.failing.remove(&operation);
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn is_running(&self, instance_name: &str) -> bool {
        self.inner.lock().unwrap().running.contains(instance_name)
    }

    /// Records the call and reports whether it should fail.
    fn begin(
        &self,
        operation: SimOperation,
        instance_name: &str,
    ) -> Result<(), Error> {
        debug!(self.log, "driver call";
            "operation" => %operation,
            "instance" => instance_name,
        );
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(SimCall {
            operation,
            instance_name: instance_name.to_string(),
        });
        if inner.fail_next.remove(&operation)
            || inner.failing.contains(&operation)
        {
            return Err(Error::Injected(operation));
        }
        Ok(())
    }

    fn template_files(name: &str) -> [String; 2] {
        [format!("{name}/disk"), format!("{name}/memory")]
    }
}

#[async_trait]
impl Hypervisor for SimHypervisor {
    fn kind(&self) -> HypervisorKind {
        HypervisorKind::Sim
    }

    async fn bless(
        &self,
        ctx: &BlessContext<'_>,
    ) -> Result<BlessOutcome, Error> {
        let name = ctx.instance.name();
        self.begin(SimOperation::Bless, &name)?;
        let artifacts = Self::template_files(&name);
        let mut inner = self.inner.lock().unwrap();
        for file in &artifacts {
            let contents = format!("{} of {}", file, ctx.source_name);
            inner.files.insert(file.clone(), contents.into_bytes());
        }
        if ctx.transfer.is_some() {
            inner.running.remove(ctx.source_name);
        }
        Ok(BlessOutcome {
            name,
            transfer: ctx.transfer.cloned(),
            artifacts: artifacts.to_vec(),
        })
    }

    async fn artifact_contents(
        &self,
        reference: &str,
    ) -> Result<Vec<u8>, Error> {
        self.inner.lock().unwrap().files.get(reference).cloned().ok_or_else(
            || {
                Error::io(
                    "no such blessed file",
                    Utf8Path::new(reference),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                )
            },
        )
    }

    async fn bless_cleanup(&self, artifacts: &[String]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        for file in artifacts {
            inner.files.remove(file);
        }
        Ok(())
    }

    async fn launch(&self, ctx: &LaunchContext<'_>) -> Result<(), Error> {
        let name = ctx.instance.name();
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        self.begin(SimOperation::Launch, &name)?;
        if ctx.fetch_artifacts {
            if let Some(store) = &self.artifacts {
                for image in ctx.images {
                    let id: ArtifactId = image.parse().map_err(|_| {
                        cowvm_common::api::Error::internal_error(&format!(
                            "malformed artifact reference {:?}",
                            image
                        ))
                    })?;
                    store.download(id).await?;
                }
            }
        }
        self.inner.lock().unwrap().running.insert(name);
        Ok(())
    }

    async fn discard(&self, ctx: &DiscardContext<'_>) -> Result<(), Error> {
        self.begin(SimOperation::Discard, ctx.instance_name)?;
        let prefix = format!("{}/", ctx.instance_name);
        let mut inner = self.inner.lock().unwrap();
        inner.files.retain(|file, _| !file.starts_with(&prefix));
        inner.running.remove(ctx.instance_name);
        Ok(())
    }

    async fn replug(
        &self,
        instance_name: &str,
        _mac_table: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.begin(SimOperation::Replug, instance_name)
    }

    async fn pre_migration(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<(), Error> {
        self.begin(SimOperation::PreMigration, &ctx.instance.name())
    }

    async fn post_migration(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<(), Error> {
        self.begin(SimOperation::PostMigration, &ctx.instance.name())
    }

    async fn export(
        &self,
        instance_name: &str,
        archive: &Utf8Path,
    ) -> Result<(), Error> {
        self.begin(SimOperation::Export, instance_name)?;
        let prefix = format!("{instance_name}/");
        let files = self
            .inner
            .lock()
            .unwrap()
            .files
            .iter()
            .filter(|(file, _)| file.starts_with(&prefix))
            .map(|(file, contents)| {
                (file[prefix.len()..].to_string(), contents.clone())
            })
            .collect();
        let contents = serde_json::to_vec(&SimArchive { files })
            .map_err(cowvm_common::api::Error::from)?;
        tokio::fs::write(archive, contents)
            .await
            .map_err(|err| Error::io("failed to write archive", archive, err))
    }

    async fn import(
        &self,
        instance_name: &str,
        archive: &Utf8Path,
    ) -> Result<(), Error> {
        self.begin(SimOperation::Import, instance_name)?;
        let contents = tokio::fs::read(archive)
            .await
            .map_err(|err| Error::io("failed to read archive", archive, err))?;
        let archive: SimArchive = serde_json::from_slice(&contents)
            .map_err(cowvm_common::api::Error::from)?;
        let mut inner = self.inner.lock().unwrap();
        for (file, contents) in archive.files {
            inner.files.insert(format!("{instance_name}/{file}"), contents);
        }
        Ok(())
    }
}
