// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request gateway
//!
//! Every lifecycle request is validated here against the instance's current
//! record. Any new record the operation needs is created here too, before the
//! request is handed to the host that carries it out. Hosts report the
//! outcome only through the record, so callers poll it.

use crate::config::QuotaConfig;
use cowvm_common::api::{
    CreateResult, DeleteResult, Error, HostName, HostRequest,
    InstanceCreate, InstanceFilter, InstanceMetadata, InstanceRecord,
    InstanceSpec, InstanceUpdate, LaunchParams, ListResultVec,
    LookupResult, UpdateResult, VmState, TAG_BLESSED_FROM,
    TAG_LAST_CLONE_NUM, TAG_LAUNCHED_FROM,
};
use cowvm_common::dispatch::Dispatcher;
use cowvm_common::services::{
    ArtifactStore, HostRegistry, InstanceStore, Transport,
};
use cowvm_controller_api::{
    ExportedInstance, InstanceCreateParams, InstanceImportParams,
};
use rand::seq::SliceRandom;
use slog::{info, o, warn, Logger};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// The collaborators the gateway consumes.
#[derive(Clone)]
pub struct ControllerServices {
    pub store: Arc<dyn InstanceStore>,
    pub registry: Arc<dyn HostRegistry>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub transport: Arc<dyn Transport>,
}

pub struct Controller {
    log: Logger,
    topic: String,
    quota: QuotaConfig,
    store: Arc<dyn InstanceStore>,
    registry: Arc<dyn HostRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    dispatcher: Dispatcher,
    /// Held across the read-modify-write of a `last_clone_num` tag.
    clone_lock: Mutex<()>,
}

impl Controller {
    pub fn new(
        log: &Logger,
        topic: &str,
        quota: QuotaConfig,
        services: ControllerServices,
    ) -> Controller {
        let log = log.new(o!("component" => "Controller"));
        let dispatcher = Dispatcher::new(&log, topic, services.transport);
        Controller {
            log,
            topic: topic.to_string(),
            quota,
            store: services.store,
            registry: services.registry,
            artifacts: services.artifacts,
            dispatcher,
            clone_lock: Mutex::new(()),
        }
    }

    fn instance_log(&self, instance_id: Uuid) -> Logger {
        self.log.new(o!("instance_id" => instance_id.to_string()))
    }

    pub async fn instance_fetch(
        &self,
        instance_id: Uuid,
    ) -> LookupResult<InstanceRecord> {
        self.store.instance_get(instance_id).await
    }

    /// Records a plain running instance on a host running the service.
    pub async fn instance_create(
        &self,
        params: InstanceCreateParams,
    ) -> CreateResult<InstanceRecord> {
        let hosts = self.service_hosts().await?;
        let host = match params.target_host {
            Some(host) if hosts.contains(&host) => host,
            Some(_) => {
                return Err(Error::invalid_request(
                    "Only able to launch on hosts running the service",
                ))
            }
            None => hosts
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| {
                    Error::unavail("no host is running the service")
                })?,
        };
        self.check_quota(params.project_id).await?;

        let record = self
            .store
            .instance_create(InstanceCreate {
                project_id: params.project_id,
                spec: params.spec,
                security_groups: params.security_groups,
                vm_state: VmState::Active,
                host: Some(host.clone()),
                metadata: InstanceMetadata::new(),
            })
            .await?;
        info!(self.log, "created instance";
            "instance_id" => %record.id,
            "host" => %host,
        );
        self.store
            .instance_update(record.id, InstanceUpdate::new().launched_now())
            .await
    }

    /// Creates a template record for `instance_id` and asks the instance's
    /// host to freeze the instance into it.
    pub async fn instance_bless(
        &self,
        instance_id: Uuid,
    ) -> CreateResult<InstanceRecord> {
        let instance = self.store.instance_get(instance_id).await?;
        if instance.metadata.is_blessed() {
            return Err(Error::invalid_request(&format!(
                "Instance {} is already blessed. Cannot rebless an instance",
                instance_id
            )));
        }
        if instance.metadata.is_launched() {
            return Err(Error::invalid_request(&format!(
                "Instance {} has been launched. Cannot bless a launched \
                 instance",
                instance_id
            )));
        }
        if instance.vm_state != VmState::Active {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not active. Cannot bless a non-active \
                 instance",
                instance_id
            )));
        }

        let clone_num = self.next_clone_num(instance_id).await?;
        let metadata: InstanceMetadata =
            [(TAG_BLESSED_FROM, instance_id.to_string())].into_iter().collect();
        let template = self
            .store
            .instance_create(InstanceCreate::copy_of(
                &instance,
                &clone_num.to_string(),
                metadata,
            ))
            .await?;
        info!(self.instance_log(instance_id), "blessing instance";
            "template_id" => %template.id,
            "clone_num" => clone_num,
        );
        self.cast_or_fail(
            template.id,
            instance.host.as_ref(),
            HostRequest::Bless { instance_id: template.id },
        )
        .await?;
        Ok(template)
    }

    /// Retires a template once nothing is launched from it.
    pub async fn instance_discard(&self, instance_id: Uuid) -> DeleteResult {
        let instance = self.store.instance_get(instance_id).await?;
        if !instance.metadata.is_blessed() {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not blessed. Cannot discard an instance that \
                 is not blessed",
                instance_id
            )));
        }
        let launched = self
            .store
            .instance_list(&InstanceFilter::launched_from(instance_id))
            .await?;
        if !launched.is_empty() {
            return Err(Error::invalid_request(&format!(
                "Instance {} still has {} launched instances. Cannot discard \
                 a blessed instance with launched instances",
                instance_id,
                launched.len()
            )));
        }
        self.dispatcher
            .cast_for_instance(
                &instance,
                None,
                HostRequest::Discard { instance_id },
            )
            .await
    }

    /// Creates a new instance from a template and hands it to a host to
    /// start. The returned record is still `BUILDING`.
    pub async fn instance_launch(
        &self,
        instance_id: Uuid,
        params: LaunchParams,
    ) -> CreateResult<InstanceRecord> {
        let template = self.store.instance_get(instance_id).await?;
        self.check_quota(template.project_id).await?;
        if !template.metadata.is_blessed() {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not blessed. Cannot launch an instance that \
                 is not blessed",
                instance_id
            )));
        }
        if let Some(host) = &params.target_host {
            if !self.service_hosts().await?.contains(host) {
                return Err(Error::invalid_request(
                    "Only able to launch on hosts running the service",
                ));
            }
        }

        let metadata: InstanceMetadata =
            [(TAG_LAUNCHED_FROM, instance_id.to_string())].into_iter().collect();
        let instance = self
            .store
            .instance_create(InstanceCreate::copy_of(
                &template, "clone", metadata,
            ))
            .await?;
        info!(self.instance_log(instance_id), "launching from template";
            "launched_id" => %instance.id,
            "target_host" => ?params.target_host,
        );
        let target_host = params.target_host.clone();
        self.cast_or_fail(
            instance.id,
            target_host.as_ref(),
            HostRequest::Launch {
                instance_id: instance.id,
                params,
                transfer: None,
            },
        )
        .await?;
        Ok(instance)
    }

    /// Marks the instance as migrating and asks its host to move it to
    /// `dest`, or to a random eligible host.
    pub async fn instance_migrate(
        &self,
        instance_id: Uuid,
        dest: Option<HostName>,
    ) -> UpdateResult<InstanceRecord> {
        let instance = self.store.instance_get(instance_id).await?;
        if instance.vm_state == VmState::Migrating {
            return Err(Error::conflict(&format!(
                "Instance {} is already migrating",
                instance_id
            )));
        }
        if instance.vm_state != VmState::Active {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not active. Cannot migrate a non-active \
                 instance",
                instance_id
            )));
        }
        let source = instance.host.clone().ok_or_else(|| {
            Error::invalid_request(&format!(
                "Instance {} is not running on any host",
                instance_id
            ))
        })?;
        let destination = self.select_destination(&source, dest).await?;

        let instance = self
            .store
            .instance_update(
                instance_id,
                InstanceUpdate::new().vm_state(VmState::Migrating),
            )
            .await?;
        let log = self.instance_log(instance_id);
        info!(log, "migrating instance";
            "source" => %source,
            "destination" => %destination,
        );
        let request = HostRequest::Migrate { instance_id, destination };
        if let Err(err) = self.dispatcher.cast(Some(&source), request).await {
            warn!(log, "could not reach source host"; "error" => %err);
            // Nothing has happened on the host yet.
            self.store
                .instance_update(
                    instance_id,
                    InstanceUpdate::new().vm_state(VmState::Active),
                )
                .await?;
            return Err(err);
        }
        Ok(instance)
    }

    pub async fn instance_list_launched(
        &self,
        instance_id: Uuid,
    ) -> ListResultVec<InstanceRecord> {
        self.store.instance_get(instance_id).await?;
        self.store
            .instance_list(&InstanceFilter::launched_from(instance_id))
            .await
    }

    pub async fn instance_list_blessed(
        &self,
        instance_id: Uuid,
    ) -> ListResultVec<InstanceRecord> {
        self.store.instance_get(instance_id).await?;
        self.store
            .instance_list(&InstanceFilter::blessed_from(instance_id))
            .await
    }

    /// Creates an artifact for the template and asks its host to fill it.
    pub async fn instance_export(
        &self,
        instance_id: Uuid,
    ) -> LookupResult<ExportedInstance> {
        let instance = self.store.instance_get(instance_id).await?;
        if !instance.metadata.is_blessed() {
            return Err(Error::invalid_request(&format!(
                "Instance {} is not blessed. Only blessed instances can be \
                 exported",
                instance_id
            )));
        }
        let artifact_id = self
            .artifacts
            .create(
                &format!("export of {}", instance.spec.display_name),
                Some(instance_id),
            )
            .await?;
        info!(self.instance_log(instance_id), "exporting template";
            "artifact_id" => %artifact_id,
        );
        self.dispatcher
            .cast_for_instance(
                &instance,
                None,
                HostRequest::Export { instance_id, artifact_id },
            )
            .await?;
        Ok(ExportedInstance { instance_data: instance.sanitized(), artifact_id })
    }

    /// Recreates an exported template. Any host may carry out the import;
    /// the one that does becomes the record's host.
    pub async fn instance_import(
        &self,
        params: InstanceImportParams,
    ) -> CreateResult<InstanceRecord> {
        self.check_quota(params.project_id).await?;
        let InstanceImportParams {
            project_id,
            instance_data,
            name,
            security_groups,
            artifact_id,
        } = params;
        let record = self
            .store
            .instance_create(InstanceCreate {
                project_id,
                spec: InstanceSpec {
                    display_name: name,
                    ..instance_data.spec
                },
                security_groups,
                vm_state: instance_data.vm_state,
                host: None,
                metadata: instance_data.metadata,
            })
            .await?;
        info!(self.instance_log(record.id), "importing template";
            "artifact_id" => %artifact_id,
        );
        self.cast_or_fail(
            record.id,
            None,
            HostRequest::Import { instance_id: record.id, artifact_id },
        )
        .await?;
        Ok(record)
    }

    async fn service_hosts(&self) -> ListResultVec<HostName> {
        self.registry.list_hosts(&self.topic).await
    }

    async fn select_destination(
        &self,
        source: &HostName,
        dest: Option<HostName>,
    ) -> LookupResult<HostName> {
        let candidates: Vec<HostName> = self
            .service_hosts()
            .await?
            .into_iter()
            .filter(|host| host != source)
            .collect();
        match dest {
            Some(dest) if &dest == source => Err(Error::invalid_request(
                "Unable to migrate to the same host",
            )),
            Some(dest) if !candidates.contains(&dest) => {
                Err(Error::invalid_request(&format!(
                    "Unable to migrate to host {}: not running the service",
                    dest
                )))
            }
            Some(dest) => Ok(dest),
            None => candidates
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| {
                    Error::unavail("no other host is running the service")
                }),
        }
    }

    async fn check_quota(&self, project_id: Uuid) -> Result<(), Error> {
        let filter = InstanceFilter {
            project_id: Some(project_id),
            ..InstanceFilter::default()
        };
        let used = self.store.instance_list(&filter).await?.len();
        let max = self.quota.max_instances_per_project;
        if used >= max {
            return Err(Error::insufficient_capacity(&format!(
                "Quota exceeded for instances: Requested 1, but already used \
                 {} of {} instances",
                used, max
            )));
        }
        Ok(())
    }

    /// Takes the next clone number recorded on `instance_id`.
    async fn next_clone_num(&self, instance_id: Uuid) -> Result<i64, Error> {
        let _guard = self.clone_lock.lock().await;
        let mut metadata = self.store.metadata_get(instance_id).await?;
        let clone_num = metadata.next_clone_num()?;
        let update: InstanceMetadata =
            [(TAG_LAST_CLONE_NUM, clone_num.to_string())].into_iter().collect();
        self.store.metadata_update(instance_id, update, false).await?;
        Ok(clone_num)
    }

    /// Delivers a request about a freshly created record, which is moved to
    /// `ERROR` if no host can take it.
    async fn cast_or_fail(
        &self,
        record_id: Uuid,
        host: Option<&HostName>,
        request: HostRequest,
    ) -> Result<(), Error> {
        let result = self.dispatcher.cast(host, request).await;
        if let Err(err) = &result {
            warn!(self.instance_log(record_id), "could not deliver request";
                "error" => %err,
            );
            self.store
                .instance_update(
                    record_id,
                    InstanceUpdate::new().vm_state(VmState::Error),
                )
                .await?;
        }
        result
    }
}
