// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{ArtifactId, ArtifactRecord, Error};
use async_trait::async_trait;
use uuid::Uuid;

/// Central storage for blessed disk and memory artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Creates an empty artifact record.
    async fn create(
        &self,
        name: &str,
        instance_id: Option<Uuid>,
    ) -> Result<ArtifactId, Error>;

    async fn upload(&self, id: ArtifactId, contents: Vec<u8>)
        -> Result<(), Error>;

    async fn download(&self, id: ArtifactId) -> Result<Vec<u8>, Error>;

    async fn delete(&self, id: ArtifactId) -> Result<(), Error>;

    async fn show(&self, id: ArtifactId) -> Result<ArtifactRecord, Error>;
}
