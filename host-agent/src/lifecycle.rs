// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lifecycle engine: the host-side half of bless, launch, discard,
//! export and import.
//!
//! Requests arrive here only after the controller has checked their
//! preconditions and created any new record. Failures of the long-running
//! steps are recorded by moving the record to `ERROR`; the caller learns about
//! them only by reading the record back.

use crate::config::Config;
use crate::hypervisor::{
    BlessContext, DiscardContext, Hypervisor, LaunchContext,
};
use crate::memory;
use crate::migration::MigrationTracker;
use crate::route::RouteResolver;
use crate::worker_pool::WorkerPool;
use camino::Utf8Path;
use cowvm_common::api::{
    ArtifactId, Error, HostName, InstanceMetadata, InstanceRecord,
    InstanceUpdate, LaunchParams, TaskState, TransferEndpoint, VmState,
};
use cowvm_common::backoff::{collaborator_policy, retry_retryable};
use cowvm_common::dispatch::Dispatcher;
use cowvm_common::services::{
    ArtifactStore, InstanceStore, NetworkInfo, NetworkService, Transport,
};
use slog::{error, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How long an artifact upload keeps retrying transient failures.
const ARTIFACT_UPLOAD_MAX_ELAPSED: Duration = Duration::from_secs(60);

pub const EVENT_BLESS: &str = "cowvm.instance.bless";
pub const EVENT_LAUNCH: &str = "cowvm.instance.launch";
pub const EVENT_DISCARD: &str = "cowvm.instance.discard";

/// The collaborators a host agent consumes.
#[derive(Clone)]
pub struct AgentServices {
    pub store: Arc<dyn InstanceStore>,
    pub network: Arc<dyn NetworkService>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub transport: Arc<dyn Transport>,
}

pub struct LifecycleEngine {
    pub(crate) log: Logger,
    pub(crate) host: HostName,
    pub(crate) use_artifact_store: bool,
    stub_network: bool,
    pub(crate) outgoing_migration_address: Option<String>,
    pub(crate) migration_launch_timeout: Duration,
    pub(crate) store: Arc<dyn InstanceStore>,
    pub(crate) network: Arc<dyn NetworkService>,
    artifacts: Arc<dyn ArtifactStore>,
    pub(crate) hypervisor: Arc<dyn Hypervisor>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) routes: Arc<dyn RouteResolver>,
    pub(crate) migrations: Arc<MigrationTracker>,
    workers: WorkerPool,
}

impl LifecycleEngine {
    /// Must be called from within a tokio runtime, since the launch worker
    /// pool starts immediately.
    pub fn new(
        log: &Logger,
        config: &Config,
        services: AgentServices,
        hypervisor: Arc<dyn Hypervisor>,
        routes: Arc<dyn RouteResolver>,
    ) -> LifecycleEngine {
        let log = log.new(o!(
            "component" => "LifecycleEngine",
            "host" => config.host.to_string(),
        ));
        let dispatcher =
            Dispatcher::new(&log, config.topic.clone(), services.transport);
        let migrations = Arc::new(MigrationTracker::new(
            &log,
            Arc::clone(&services.store),
        ));
        let workers = WorkerPool::new(&log, &config.worker_pool);
        LifecycleEngine {
            log,
            host: config.host.clone(),
            use_artifact_store: config.use_artifact_store,
            stub_network: config.stub_network,
            outgoing_migration_address: config
                .outgoing_migration_address
                .clone(),
            migration_launch_timeout: config.migration_launch_timeout(),
            store: services.store,
            network: services.network,
            artifacts: services.artifacts,
            hypervisor,
            dispatcher,
            routes,
            migrations,
            workers,
        }
    }

    pub fn host(&self) -> &HostName {
        &self.host
    }

    pub fn migrations(&self) -> &Arc<MigrationTracker> {
        &self.migrations
    }

    pub(crate) fn instance_log(&self, instance_id: Uuid) -> Logger {
        self.log.new(o!("instance_id" => instance_id.to_string()))
    }

    /// Usage notification for billing and auditing consumers.
    fn notify(&self, event_type: &str, instance: &InstanceRecord) {
        info!(self.log, "instance event";
            "event_type" => event_type,
            "instance_id" => %instance.id,
            "project_id" => %instance.project_id,
            "display_name" => &instance.spec.display_name,
        );
    }

    /// Moves `instance_id` to `ERROR`. Failing to do so is only logged, since
    /// this already runs on a failure path.
    pub(crate) async fn mark_error(&self, log: &Logger, instance_id: Uuid) {
        let update =
            InstanceUpdate::new().vm_state(VmState::Error).task_state(None);
        if let Err(err) = self.store.instance_update(instance_id, update).await
        {
            error!(log, "failed to move instance to error state";
                "error" => %err,
            );
        }
    }

    /// Handles a `Bless` request for the template record `instance_id`.
    pub async fn bless(&self, instance_id: Uuid) -> Result<(), Error> {
        let instance = self.store.instance_get(instance_id).await?;
        let source_id = instance.metadata.blessed_from().ok_or_else(|| {
            Error::invalid_request(&format!(
                "Instance {} was not created by bless",
                instance_id
            ))
        })?;
        if instance.metadata.blessed_flag() {
            return Err(Error::invalid_request(&format!(
                "Instance {} is already blessed",
                instance_id
            )));
        }
        let source = self.store.instance_get(source_id).await?;
        if source.metadata.is_blessed() || source.metadata.is_launched() {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not an original instance. Cannot bless it",
                source_id
            )));
        }
        if source.vm_state != VmState::Active {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not active. Cannot bless a non-active \
                 instance",
                source_id
            )));
        }

        let update =
            InstanceUpdate::new().task_state(Some(TaskState::Blessing));
        let instance = self.store.instance_update(instance_id, update).await?;
        // The outcome is in the record; the failure has been logged.
        let _ = self.bless_instance(&instance, &source.name(), None).await;
        Ok(())
    }

    /// Freezes `source_name` into the template `instance`.
    ///
    /// With a transfer endpoint this is the in-place bless that starts a
    /// migration: the record keeps its state and is not tagged blessed, and
    /// the endpoint the frozen state is served from is returned. On failure
    /// the record is moved to `ERROR`.
    pub(crate) async fn bless_instance(
        &self,
        instance: &InstanceRecord,
        source_name: &str,
        transfer: Option<&TransferEndpoint>,
    ) -> Result<Option<TransferEndpoint>, Error> {
        let log = self.instance_log(instance.id);
        let result = self.try_bless(&log, instance, source_name, transfer).await;
        if let Err(err) = &result {
            error!(log, "bless failed";
                "source" => source_name,
                "error" => %err,
            );
            self.mark_error(&log, instance.id).await;
        }
        result
    }

    async fn try_bless(
        &self,
        log: &Logger,
        instance: &InstanceRecord,
        source_name: &str,
        transfer: Option<&TransferEndpoint>,
    ) -> Result<Option<TransferEndpoint>, Error> {
        let migration = transfer.is_some();
        let ctx = BlessContext { source_name, instance, transfer };
        let outcome = self.hypervisor.bless(&ctx).await?;

        if !migration {
            self.notify(EVENT_BLESS, instance);
            let update = InstanceUpdate::new()
                .vm_state(VmState::Active)
                .task_state(None)
                .host(Some(self.host.clone()))
                .launched_now();
            self.store.instance_update(instance.id, update).await?;
        }

        let images = if self.use_artifact_store {
            self.upload_artifacts(log, instance, &outcome.artifacts).await?
        } else {
            outcome.artifacts.clone()
        };

        let mut metadata = InstanceMetadata::new();
        metadata.set_images(&images);
        if !migration {
            metadata.set_blessed(true);
        }
        self.store.metadata_update(instance.id, metadata, false).await?;
        Ok(outcome.transfer)
    }

    /// Moves the files produced by bless into the artifact store, returning
    /// the ids that replace them as the template's images.
    async fn upload_artifacts(
        &self,
        log: &Logger,
        instance: &InstanceRecord,
        files: &[String],
    ) -> Result<Vec<String>, Error> {
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let contents = self.hypervisor.artifact_contents(file).await?;
            let name = Utf8Path::new(file).file_name().unwrap_or(file);
            let id = self.artifacts.create(name, Some(instance.id)).await?;
            retry_retryable(
                log,
                "artifact upload",
                collaborator_policy(ARTIFACT_UPLOAD_MAX_ELAPSED),
                || self.artifacts.upload(id, contents.clone()),
            )
            .await?;
            ids.push(id.to_string());
        }
        self.hypervisor.bless_cleanup(files).await?;
        Ok(ids)
    }

    /// Handles a `Launch` request.
    ///
    /// Without a transfer endpoint the record is marked as building on this
    /// host and the launch continues on the worker pool; the returned record
    /// is still `BUILDING`. With one, this is the receiving side of a
    /// migration and returns only once the instance runs here.
    pub async fn launch(
        self: &Arc<Self>,
        instance_id: Uuid,
        params: LaunchParams,
        transfer: Option<TransferEndpoint>,
    ) -> Result<InstanceRecord, Error> {
        if let Some(transfer) = transfer {
            return self.launch_migration(instance_id, &transfer).await;
        }

        let instance = self.store.instance_get(instance_id).await?;
        self.launch_source(&instance).await?;
        let update = InstanceUpdate::new()
            .vm_state(VmState::Building)
            .task_state(Some(TaskState::Networking))
            .host(Some(self.host.clone()));
        let instance = self.store.instance_update(instance_id, update).await?;

        let engine = Arc::clone(self);
        if let Err(err) = self.workers.submit(async move {
            engine.run_launch(instance_id, params).await;
        }) {
            let log = self.instance_log(instance_id);
            error!(log, "could not queue launch"; "error" => %err);
            self.mark_error(&log, instance_id).await;
            return Err(err.into());
        }
        Ok(instance)
    }

    async fn run_launch(&self, instance_id: Uuid, params: LaunchParams) {
        let log = self.instance_log(instance_id);
        if let Err(err) = self.try_launch(&log, instance_id, &params).await {
            error!(log, "launch failed"; "error" => %err);
            self.mark_error(&log, instance_id).await;
        }
    }

    async fn try_launch(
        &self,
        log: &Logger,
        instance_id: Uuid,
        params: &LaunchParams,
    ) -> Result<(), Error> {
        let instance = self.store.instance_get(instance_id).await?;
        let source = self.launch_source(&instance).await?;

        // Interfaces allocated before a later failure are not released.
        let network = if self.stub_network {
            NetworkInfo::default()
        } else {
            self.network.allocate_for_instance(instance_id, &self.host).await?
        };

        let update = InstanceUpdate::new()
            .vm_state(VmState::Building)
            .task_state(Some(TaskState::Spawning));
        let instance = self.store.instance_update(instance_id, update).await?;

        let target_pages = self.target_pages(log, params);
        let images = source.metadata.images();
        let source_name = source.name();
        self.network.plug_instance(&self.host, instance_id).await?;
        let ctx = LaunchContext {
            source_name: &source_name,
            instance: &instance,
            target_pages,
            network: &network,
            transfer: None,
            images: &images,
            fetch_artifacts: self.use_artifact_store,
            guest: &params.guest,
        };
        self.hypervisor.launch(&ctx).await?;
        self.notify(EVENT_LAUNCH, &instance);

        let update = InstanceUpdate::new()
            .vm_state(VmState::Active)
            .task_state(None)
            .host(Some(self.host.clone()))
            .launched_now();
        self.store.instance_update(instance_id, update).await?;
        Ok(())
    }

    /// The template `instance` is launched from, which must be blessed.
    async fn launch_source(
        &self,
        instance: &InstanceRecord,
    ) -> Result<InstanceRecord, Error> {
        let source_id = instance.metadata.launched_from().ok_or_else(|| {
            Error::invalid_request(&format!(
                "Instance {} was not created by launch",
                instance.id
            ))
        })?;
        let source = self.store.instance_get(source_id).await?;
        if !source.metadata.is_blessed() {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not blessed. Cannot launch an instance that \
                 is not blessed",
                source_id
            )));
        }
        Ok(source)
    }

    /// Receives a migrating instance from `transfer`.
    ///
    /// The record stays `MIGRATING`: whoever drives the migration promotes
    /// it once the move is complete.
    pub(crate) async fn launch_migration(
        &self,
        instance_id: Uuid,
        transfer: &TransferEndpoint,
    ) -> Result<InstanceRecord, Error> {
        let log = self.instance_log(instance_id);
        self.migrations.track_incoming(instance_id).await;
        let result = self.try_launch_migration(instance_id, transfer).await;
        if let Err(err) = &result {
            error!(log, "migration launch failed";
                "transfer" => %transfer,
                "error" => %err,
            );
            self.mark_error(&log, instance_id).await;
        }
        result
    }

    async fn try_launch_migration(
        &self,
        instance_id: Uuid,
        transfer: &TransferEndpoint,
    ) -> Result<InstanceRecord, Error> {
        let network =
            self.network.get_instance_network_info(instance_id).await?;
        let update = InstanceUpdate::new()
            .vm_state(VmState::Migrating)
            .task_state(Some(TaskState::Spawning))
            .host(Some(self.host.clone()));
        let instance = self.store.instance_update(instance_id, update).await?;

        let images = instance.metadata.images();
        let guest = BTreeMap::new();
        let name = instance.name();
        self.network.plug_instance(&self.host, instance_id).await?;
        let ctx = LaunchContext {
            source_name: &name,
            instance: &instance,
            target_pages: 0,
            network: &network,
            transfer: Some(transfer),
            images: &images,
            fetch_artifacts: self.use_artifact_store,
            guest: &guest,
        };
        self.hypervisor.launch(&ctx).await?;
        Ok(instance)
    }

    /// Memory target in pages. An unparseable target means none.
    fn target_pages(&self, log: &Logger, params: &LaunchParams) -> u64 {
        let Some(target) = &params.target else {
            return 0;
        };
        match memory::target_pages(target) {
            Ok(pages) => pages,
            Err(err) => {
                warn!(log, "ignoring launch memory target"; "error" => %err);
                0
            }
        }
    }

    /// Handles a `Discard` request: retires the template and its record.
    pub async fn discard(&self, instance_id: Uuid) -> Result<(), Error> {
        let log = self.instance_log(instance_id);
        let instance = self.store.instance_get(instance_id).await?;
        let images = instance.metadata.images();

        let name = instance.name();
        self.hypervisor
            .discard(&DiscardContext { instance_name: &name, transfer: None })
            .await?;
        if self.use_artifact_store {
            for image in &images {
                self.delete_artifact(&log, image).await?;
            }
        }

        let mut metadata = InstanceMetadata::new();
        metadata.set_blessed(false);
        self.store.metadata_update(instance_id, metadata, false).await?;
        let update = InstanceUpdate::new()
            .vm_state(VmState::Deleted)
            .task_state(None)
            .terminated_now();
        self.store.instance_update(instance_id, update).await?;
        self.store.instance_destroy(instance_id).await?;
        self.notify(EVENT_DISCARD, &instance);
        Ok(())
    }

    async fn delete_artifact(
        &self,
        log: &Logger,
        image: &str,
    ) -> Result<(), Error> {
        let id: ArtifactId = image.parse().map_err(|_| {
            Error::internal_error(&format!(
                "malformed artifact reference {:?}",
                image
            ))
        })?;
        match self.artifacts.delete(id).await {
            Ok(()) => Ok(()),
            Err(Error::ObjectNotFound { .. }) => {
                warn!(log, "artifact already gone"; "artifact_id" => %id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Handles an `Export` request: writes the template into `artifact_id`.
    ///
    /// The record is `EXPORTING` for the duration. A failed export leaves
    /// the template as it was.
    pub async fn export(
        &self,
        instance_id: Uuid,
        artifact_id: ArtifactId,
    ) -> Result<(), Error> {
        let log = self.instance_log(instance_id);
        let update =
            InstanceUpdate::new().task_state(Some(TaskState::Exporting));
        let instance = self.store.instance_update(instance_id, update).await?;
        let result = self.try_export(&log, &instance, artifact_id).await;
        let update = InstanceUpdate::new().task_state(None);
        if let Err(err) = self.store.instance_update(instance_id, update).await
        {
            warn!(log, "failed to clear export task"; "error" => %err);
        }
        match &result {
            Ok(()) => {
                info!(log, "exported template"; "artifact_id" => %artifact_id);
            }
            Err(err) => {
                error!(log, "export failed";
                    "artifact_id" => %artifact_id,
                    "error" => %err,
                );
            }
        }
        result
    }

    async fn try_export(
        &self,
        log: &Logger,
        instance: &InstanceRecord,
        artifact_id: ArtifactId,
    ) -> Result<(), Error> {
        let archive = temp_archive()?;
        self.hypervisor.export(&instance.name(), archive.path()).await?;
        let contents = tokio::fs::read(archive.path()).await.map_err(|err| {
            Error::internal_error(&format!(
                "failed to read archive {}: {}",
                archive.path(),
                err
            ))
        })?;
        retry_retryable(
            log,
            "export upload",
            collaborator_policy(ARTIFACT_UPLOAD_MAX_ELAPSED),
            || self.artifacts.upload(artifact_id, contents.clone()),
        )
        .await
    }

    /// Handles an `Import` request: installs the template in `artifact_id`
    /// as `instance_id` on this host. A failed import moves the record to
    /// `ERROR`.
    pub async fn import(
        &self,
        instance_id: Uuid,
        artifact_id: ArtifactId,
    ) -> Result<(), Error> {
        let log = self.instance_log(instance_id);
        let update =
            InstanceUpdate::new().task_state(Some(TaskState::Importing));
        let instance = self.store.instance_update(instance_id, update).await?;
        if let Err(err) = self.try_import(&instance, artifact_id).await {
            error!(log, "import failed";
                "artifact_id" => %artifact_id,
                "error" => %err,
            );
            self.mark_error(&log, instance_id).await;
            return Err(err);
        }
        let update = InstanceUpdate::new()
            .host(Some(self.host.clone()))
            .task_state(None);
        self.store.instance_update(instance_id, update).await?;
        info!(log, "imported template"; "artifact_id" => %artifact_id);
        Ok(())
    }

    async fn try_import(
        &self,
        instance: &InstanceRecord,
        artifact_id: ArtifactId,
    ) -> Result<(), Error> {
        let contents = self.artifacts.download(artifact_id).await?;
        let archive = temp_archive()?;
        tokio::fs::write(archive.path(), contents).await.map_err(|err| {
            Error::internal_error(&format!(
                "failed to write archive {}: {}",
                archive.path(),
                err
            ))
        })?;
        self.hypervisor.import(&instance.name(), archive.path()).await.map_err(Error::from)
    }

    /// Plugs host networking for an instance this host is about to receive.
    pub async fn prepare_network(&self, instance_id: Uuid) -> Result<(), Error> {
        self.network.plug_instance(&self.host, instance_id).await
    }

    /// Unplugs host networking for an instance on this host.
    pub async fn release_network(&self, instance_id: Uuid) -> Result<(), Error> {
        self.network.unplug_instance(&self.host, instance_id).await
    }
}

/// An empty temporary file, removed when dropped.
fn temp_archive() -> Result<camino_tempfile::NamedUtf8TempFile, Error> {
    camino_tempfile::NamedUtf8TempFile::new().map_err(|err| {
        Error::internal_error(&format!(
            "failed to create temporary archive: {}",
            err
        ))
    })
}
