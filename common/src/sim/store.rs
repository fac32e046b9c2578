// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{
    Error, Generation, InstanceCreate, InstanceFilter, InstanceMetadata,
    InstanceRecord, InstanceUpdate, ResourceType,
};
use crate::services::InstanceStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Instance records kept in memory.
#[derive(Default)]
pub struct SimInstanceStore {
    instances: Mutex<BTreeMap<Uuid, InstanceRecord>>,
}

impl SimInstanceStore {
    pub fn new() -> SimInstanceStore {
        SimInstanceStore::default()
    }

    /// Inserts a complete record, replacing any record with the same id.
    pub fn insert(&self, record: InstanceRecord) {
        self.instances.lock().unwrap().insert(record.id, record);
    }

    pub fn len(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn not_found(id: Uuid) -> Error {
        Error::not_found_by_id(ResourceType::Instance, &id)
    }
}

#[async_trait]
impl InstanceStore for SimInstanceStore {
    async fn instance_get(&self, id: Uuid) -> Result<InstanceRecord, Error> {
        self.instances
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(id))
    }

    async fn instance_create(
        &self,
        create: InstanceCreate,
    ) -> Result<InstanceRecord, Error> {
        let record = InstanceRecord {
            id: Uuid::new_v4(),
            project_id: create.project_id,
            spec: create.spec,
            security_groups: create.security_groups,
            vm_state: create.vm_state,
            task_state: None,
            host: create.host,
            metadata: create.metadata,
            generation: Generation::new(),
            time_created: Utc::now(),
            launched_at: None,
            terminated_at: None,
        };
        self.instances.lock().unwrap().insert(record.id, record.clone());
        Ok(record)
    }

    async fn instance_update(
        &self,
        id: Uuid,
        update: InstanceUpdate,
    ) -> Result<InstanceRecord, Error> {
        let mut instances = self.instances.lock().unwrap();
        let record =
            instances.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        update.apply(record);
        Ok(record.clone())
    }

    async fn instance_destroy(&self, id: Uuid) -> Result<(), Error> {
        self.instances
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn instance_list(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, Error> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn metadata_get(&self, id: Uuid) -> Result<InstanceMetadata, Error> {
        self.instance_get(id).await.map(|record| record.metadata)
    }

    async fn metadata_update(
        &self,
        id: Uuid,
        metadata: InstanceMetadata,
        replace: bool,
    ) -> Result<InstanceMetadata, Error> {
        let mut instances = self.instances.lock().unwrap();
        let record =
            instances.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if replace {
            record.metadata = metadata;
        } else {
            record.metadata.merge(metadata);
        }
        record.generation = record.generation.next();
        Ok(record.metadata.clone())
    }
}
