// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Migration of a running instance to another host, built from an in-place
//! bless on the source and a launch from the transfer endpoint on the
//! destination.
//!
//! At most one migration of an instance runs at a time. The
//! [`MigrationTracker`] holds the in-memory table of outgoing migrations and
//! the persisted `migrating` tag together; a [`MigrationLock`] is the proof
//! that both were taken and gives them back when released or dropped.

use crate::hypervisor::{DiscardContext, MigrationContext};
use crate::lifecycle::LifecycleEngine;
use cowvm_common::api::{
    Error, HostName, HostRequest, InstanceFilter, InstanceRecord,
    InstanceUpdate, LaunchParams, TaskState, TransferEndpoint, VmState,
};
use cowvm_common::services::{InstanceStore, NetworkInfo};
use slog::{error, info, o, warn, Logger};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Bound on the network preparation and release calls to the destination.
const NETWORK_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Tracked {
    /// Instances this host is migrating away.
    outgoing: BTreeSet<Uuid>,
    /// Instances this host is receiving, including its own instances being
    /// relaunched by a rollback.
    incoming: BTreeSet<Uuid>,
}

/// What one reconciliation pass changed.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ReconcileSummary {
    /// Stuck records with no migration tag, moved back to `ACTIVE`.
    pub activated: Vec<Uuid>,
    /// Tagged records no migration on this host accounts for, moved to
    /// `ERROR`.
    pub failed: Vec<Uuid>,
    /// Finished incoming migrations no longer tracked.
    pub incoming_cleared: Vec<Uuid>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty()
            && self.failed.is_empty()
            && self.incoming_cleared.is_empty()
    }
}

/// The migrations in flight on this host.
///
/// Every change to the tables happens under one lock, which is also held
/// while reconciling so that a pass never sees a migration half-started.
pub struct MigrationTracker {
    log: Logger,
    store: Arc<dyn InstanceStore>,
    tracked: Mutex<Tracked>,
}

impl MigrationTracker {
    pub fn new(log: &Logger, store: Arc<dyn InstanceStore>) -> MigrationTracker {
        MigrationTracker {
            log: log.new(o!("component" => "MigrationTracker")),
            store,
            tracked: Mutex::new(Tracked::default()),
        }
    }

    /// Takes the migration lock of `instance_id`, which must already be
    /// `MIGRATING`.
    ///
    /// Fails without changing anything if the instance is already being
    /// migrated by this process, or carries the `migrating` tag because some
    /// other process is migrating it.
    pub async fn acquire(
        self: &Arc<Self>,
        instance_id: Uuid,
    ) -> Result<MigrationLock, Error> {
        let mut tracked = self.tracked.lock().await;
        let instance = self.store.instance_get(instance_id).await?;
        if instance.vm_state != VmState::Migrating {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not migrating",
                instance_id
            )));
        }
        if tracked.outgoing.contains(&instance_id)
            || instance.metadata.is_migrating()
        {
            return Err(Error::conflict(&format!(
                "Instance {} is already migrating",
                instance_id
            )));
        }

        let mut metadata = instance.metadata;
        metadata.set_migrating();
        self.store.metadata_update(instance_id, metadata, true).await?;
        tracked.outgoing.insert(instance_id);
        info!(self.log, "took migration lock"; "instance_id" => %instance_id);
        Ok(MigrationLock { tracker: Some(Arc::clone(self)), instance_id })
    }

    async fn release(&self, instance_id: Uuid) {
        let mut tracked = self.tracked.lock().await;
        match self.store.metadata_get(instance_id).await {
            Ok(mut metadata) if metadata.is_migrating() => {
                metadata.clear_migrating();
                if let Err(err) =
                    self.store.metadata_update(instance_id, metadata, true).await
                {
                    warn!(self.log, "failed to clear migration tag";
                        "instance_id" => %instance_id,
                        "error" => %err,
                    );
                }
            }
            Ok(_) => (),
            Err(err) => {
                warn!(self.log, "failed to read migration tag";
                    "instance_id" => %instance_id,
                    "error" => %err,
                );
            }
        }
        tracked.outgoing.remove(&instance_id);
        info!(self.log, "released migration lock";
            "instance_id" => %instance_id,
        );
    }

    /// Records that this host is receiving `instance_id`.
    pub async fn track_incoming(&self, instance_id: Uuid) {
        self.tracked.lock().await.incoming.insert(instance_id);
    }

    /// Stops tracking an incoming migration that its source rolled back.
    pub async fn forget_incoming(&self, instance_id: Uuid) {
        self.tracked.lock().await.incoming.remove(&instance_id);
    }

    pub async fn is_outgoing(&self, instance_id: Uuid) -> bool {
        self.tracked.lock().await.outgoing.contains(&instance_id)
    }

    pub async fn is_incoming(&self, instance_id: Uuid) -> bool {
        self.tracked.lock().await.incoming.contains(&instance_id)
    }

    /// Resolves `MIGRATING` records on `host` that no migration accounts
    /// for, then forgets incoming migrations that have finished.
    pub async fn reconcile(
        &self,
        host: &HostName,
    ) -> Result<ReconcileSummary, Error> {
        let mut tracked = self.tracked.lock().await;
        let mut summary = ReconcileSummary::default();

        let filter =
            InstanceFilter::on_host(host).with_vm_state(VmState::Migrating);
        for instance in self.store.instance_list(&filter).await? {
            if tracked.outgoing.contains(&instance.id) {
                continue;
            }
            let vm_state = if !instance.metadata.is_migrating() {
                // The migration never started, or its request was lost.
                VmState::Active
            } else if !tracked.incoming.contains(&instance.id) {
                VmState::Error
            } else {
                continue;
            };
            let log = self.log.new(o!("instance_id" => instance.id.to_string()));
            warn!(log, "resolving stuck migration"; "vm_state" => %vm_state);
            let update =
                InstanceUpdate::new().vm_state(vm_state).task_state(None);
            match self.store.instance_update(instance.id, update).await {
                Ok(_) if vm_state == VmState::Active => {
                    summary.activated.push(instance.id)
                }
                Ok(_) => summary.failed.push(instance.id),
                Err(err) => {
                    error!(log, "failed to resolve stuck migration";
                        "error" => %err,
                    );
                }
            }
        }

        let incoming: Vec<Uuid> = tracked.incoming.iter().copied().collect();
        for instance_id in incoming {
            let finished = match self.store.instance_get(instance_id).await {
                Ok(instance) => instance.vm_state != VmState::Migrating,
                Err(Error::ObjectNotFound { .. }) => true,
                Err(err) => {
                    warn!(self.log, "failed to check incoming migration";
                        "instance_id" => %instance_id,
                        "error" => %err,
                    );
                    false
                }
            };
            if finished {
                tracked.incoming.remove(&instance_id);
                summary.incoming_cleared.push(instance_id);
            }
        }

        Ok(summary)
    }
}

/// The migration lock of one instance.
///
/// [`MigrationLock::release`] gives the lock back. Dropping the lock without
/// releasing it schedules the release on the current runtime instead.
pub struct MigrationLock {
    tracker: Option<Arc<MigrationTracker>>,
    instance_id: Uuid,
}

impl MigrationLock {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub async fn release(mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.release(self.instance_id).await;
        }
    }
}

impl fmt::Debug for MigrationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationLock")
            .field("instance_id", &self.instance_id)
            .field("held", &self.tracker.is_some())
            .finish()
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        let Some(tracker) = self.tracker.take() else {
            return;
        };
        let instance_id = self.instance_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { tracker.release(instance_id).await });
            }
            Err(_) => {
                error!(tracker.log, "migration lock dropped outside a runtime";
                    "instance_id" => %instance_id,
                );
            }
        }
    }
}

impl LifecycleEngine {
    /// Drives the migration of `instance_id` from this host to `destination`.
    ///
    /// A failure after the bless is rolled back by relaunching the instance
    /// here from the same transfer endpoint; only a failed rollback is
    /// returned as an error, with the instance left in `ERROR`.
    pub async fn migrate(
        &self,
        instance_id: Uuid,
        destination: &HostName,
    ) -> Result<(), Error> {
        let log = self.instance_log(instance_id).new(o!(
            "destination" => destination.to_string(),
        ));
        let lock = self.migrations.acquire(instance_id).await?;
        let result = self.drive_migration(&log, instance_id, destination).await;
        lock.release().await;

        match self.store.instance_get(instance_id).await {
            Ok(instance) if instance.vm_state == VmState::Migrating => {
                let update = InstanceUpdate::new().vm_state(VmState::Active);
                if let Err(err) =
                    self.store.instance_update(instance_id, update).await
                {
                    error!(log, "failed to reactivate instance";
                        "error" => %err,
                    );
                }
            }
            Ok(_) => (),
            Err(err) => {
                warn!(log, "failed to read instance after migration";
                    "error" => %err,
                );
            }
        }
        result
    }

    async fn drive_migration(
        &self,
        log: &Logger,
        instance_id: Uuid,
        destination: &HostName,
    ) -> Result<(), Error> {
        let update =
            InstanceUpdate::new().task_state(Some(TaskState::Migrating));
        let instance = self.store.instance_update(instance_id, update).await?;

        let route = self.routes.resolve(destination).await?;
        let network =
            self.network.get_instance_network_info(instance_id).await?;
        self.dispatcher
            .call(
                Some(destination),
                HostRequest::PrepareNetwork { instance_id },
                NETWORK_CALL_TIMEOUT,
            )
            .await?;

        let address = self
            .outgoing_migration_address
            .clone()
            .unwrap_or(route.device);
        let endpoint = TransferEndpoint::mcdist(&address);
        let name = instance.name();
        let transfer =
            match self.bless_instance(&instance, &name, Some(&endpoint)).await {
                Ok(transfer) => transfer.unwrap_or(endpoint),
                Err(err) => {
                    // The bless left the instance in ERROR. Only the
                    // networking prepared on the destination needs undoing.
                    error!(log, "migration aborted"; "error" => %err);
                    self.release_destination(log, instance_id, destination)
                        .await;
                    return Ok(());
                }
            };
        info!(log, "instance frozen for migration"; "transfer" => %transfer);

        let mut progress = TransferProgress::Frozen;
        let result = self
            .transfer_out(
                &instance,
                &network,
                &transfer,
                destination,
                &mut progress,
            )
            .await;
        let Err(err) = result else {
            info!(log, "migration complete");
            return Ok(());
        };

        warn!(log, "migration failed; rolling back"; "error" => %err);
        match self
            .roll_back(
                log,
                &instance,
                &network,
                &transfer,
                destination,
                progress,
            )
            .await
        {
            Ok(()) => {
                info!(log, "migration rolled back");
                Ok(())
            }
            Err(rollback_err) => {
                error!(log, "migration rollback failed";
                    "error" => %rollback_err,
                    "migration_error" => %err,
                );
                self.mark_error(log, instance_id).await;
                Err(rollback_err)
            }
        }
    }

    /// The part of the migration that is undone on failure.
    async fn transfer_out(
        &self,
        instance: &InstanceRecord,
        network: &NetworkInfo,
        transfer: &TransferEndpoint,
        destination: &HostName,
        progress: &mut TransferProgress,
    ) -> Result<(), Error> {
        let ctx = MigrationContext { instance, network, transfer };
        self.hypervisor.pre_migration(&ctx).await?;
        self.dispatcher
            .call(
                Some(destination),
                HostRequest::Launch {
                    instance_id: instance.id,
                    params: LaunchParams::default(),
                    transfer: Some(transfer.clone()),
                },
                self.migration_launch_timeout,
            )
            .await?;
        *progress = TransferProgress::LaunchedRemotely;
        self.hypervisor.post_migration(&ctx).await?;
        self.release_network(instance.id).await?;

        // The destination brings multi-host networks up before this host
        // tears its side down.
        for net in network.multi_host_networks() {
            self.network.setup_network(destination, &net).await?;
            self.network.setup_network(&self.host, &net).await?;
        }

        let update = InstanceUpdate::new()
            .host(Some(destination.clone()))
            .task_state(None);
        self.store.instance_update(instance.id, update).await?;
        Ok(())
    }

    async fn roll_back(
        &self,
        log: &Logger,
        instance: &InstanceRecord,
        network: &NetworkInfo,
        transfer: &TransferEndpoint,
        destination: &HostName,
        progress: TransferProgress,
    ) -> Result<(), Error> {
        match progress {
            TransferProgress::Frozen => {
                self.release_destination(log, instance.id, destination).await;
            }
            // The instance must not keep running there once it is
            // relaunched here.
            TransferProgress::LaunchedRemotely => {
                self.dispatcher
                    .call(
                        Some(destination),
                        HostRequest::TeardownMigration {
                            instance_id: instance.id,
                            transfer: transfer.clone(),
                        },
                        NETWORK_CALL_TIMEOUT,
                    )
                    .await?;
            }
        }
        self.release_network(instance.id).await?;

        let ctx = MigrationContext { instance, network, transfer };
        self.hypervisor.post_migration(&ctx).await?;
        self.launch_migration(instance.id, transfer).await?;

        // A failed launch on the destination may already have marked the
        // record ERROR.
        let update = InstanceUpdate::new()
            .vm_state(VmState::Active)
            .host(Some(self.host.clone()))
            .task_state(None);
        self.store.instance_update(instance.id, update).await?;
        Ok(())
    }
}

impl LifecycleEngine {
    /// Unplugs the networking prepared on `destination`. A failure is only
    /// logged.
    async fn release_destination(
        &self,
        log: &Logger,
        instance_id: Uuid,
        destination: &HostName,
    ) {
        if let Err(err) = self
            .dispatcher
            .call(
                Some(destination),
                HostRequest::ReleaseNetwork { instance_id },
                NETWORK_CALL_TIMEOUT,
            )
            .await
        {
            warn!(log, "failed to release destination networking";
                "error" => %err,
            );
        }
    }

    /// Handles a `TeardownMigration` request: removes an instance this host
    /// received from `transfer` because its source is rolling the migration
    /// back.
    pub async fn teardown_migration(
        &self,
        instance_id: Uuid,
        transfer: &TransferEndpoint,
    ) -> Result<(), Error> {
        let log = self.instance_log(instance_id);
        let instance = self.store.instance_get(instance_id).await?;
        let name = instance.name();
        self.hypervisor
            .discard(&DiscardContext {
                instance_name: &name,
                transfer: Some(transfer),
            })
            .await?;
        self.network.unplug_instance(&self.host, instance_id).await?;
        self.migrations.forget_incoming(instance_id).await;
        info!(log, "removed instance of rolled back migration";
            "transfer" => %transfer,
        );
        Ok(())
    }
}

/// How far an outgoing transfer got before it failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TransferProgress {
    /// The instance is frozen here and nothing runs on the destination.
    Frozen,
    /// The destination runs the instance.
    LaunchedRemotely,
}
