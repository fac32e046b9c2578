// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{
    Error, InstanceCreate, InstanceFilter, InstanceMetadata, InstanceRecord,
    InstanceUpdate,
};
use async_trait::async_trait;
use uuid::Uuid;

/// The persistent instance database.
///
/// Updates are last-writer-wins. The store bumps the record generation on every
/// write but never checks it.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn instance_get(&self, id: Uuid) -> Result<InstanceRecord, Error>;

    async fn instance_create(
        &self,
        create: InstanceCreate,
    ) -> Result<InstanceRecord, Error>;

    /// Applies `update` and returns the record as written.
    async fn instance_update(
        &self,
        id: Uuid,
        update: InstanceUpdate,
    ) -> Result<InstanceRecord, Error>;

    /// Removes the record entirely.
    async fn instance_destroy(&self, id: Uuid) -> Result<(), Error>;

    async fn instance_list(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, Error>;

    async fn metadata_get(&self, id: Uuid) -> Result<InstanceMetadata, Error>;

    /// Merges `metadata` into the record's tags, or replaces them entirely
    /// when `replace` is set. Returns the resulting tags.
    async fn metadata_update(
        &self,
        id: Uuid,
        metadata: InstanceMetadata,
        replace: bool,
    ) -> Result<InstanceMetadata, Error>;
}
