// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{ArtifactId, ArtifactRecord, Error, ResourceType};
use crate::services::ArtifactStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

struct StoredArtifact {
    record: ArtifactRecord,
    contents: Option<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    artifacts: BTreeMap<ArtifactId, StoredArtifact>,
    /// Number of upcoming uploads that fail with a transient error.
    upload_failures: usize,
}

/// Artifact contents kept in memory.
#[derive(Default)]
pub struct SimArtifactStore {
    inner: Mutex<Inner>,
}

impl SimArtifactStore {
    pub fn new() -> SimArtifactStore {
        SimArtifactStore::default()
    }

    /// Makes the next `count` uploads fail as if the store were unavailable.
    pub fn fail_next_uploads(&self, count: usize) {
        self.inner.lock().unwrap().upload_failures = count;
    }

    pub fn ids(&self) -> Vec<ArtifactId> {
        self.inner.lock().unwrap().artifacts.keys().copied().collect()
    }

    fn not_found(id: ArtifactId) -> Error {
        Error::not_found_by_id(ResourceType::Artifact, &id.0)
    }
}

#[async_trait]
impl ArtifactStore for SimArtifactStore {
    async fn create(
        &self,
        name: &str,
        instance_id: Option<Uuid>,
    ) -> Result<ArtifactId, Error> {
        let id = ArtifactId::new();
        let record = ArtifactRecord {
            id,
            name: name.to_string(),
            instance_id,
            size: None,
        };
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .insert(id, StoredArtifact { record, contents: None });
        Ok(id)
    }

    async fn upload(
        &self,
        id: ArtifactId,
        contents: Vec<u8>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.upload_failures > 0 {
            inner.upload_failures -= 1;
            return Err(Error::unavail("simulated artifact store outage"));
        }
        let artifact =
            inner.artifacts.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        artifact.record.size = Some(contents.len() as u64);
        artifact.contents = Some(contents);
        Ok(())
    }

    async fn download(&self, id: ArtifactId) -> Result<Vec<u8>, Error> {
        let inner = self.inner.lock().unwrap();
        let artifact =
            inner.artifacts.get(&id).ok_or_else(|| Self::not_found(id))?;
        artifact.contents.clone().ok_or_else(|| {
            Error::invalid_request(&format!(
                "artifact {} has no uploaded contents",
                id
            ))
        })
    }

    async fn delete(&self, id: ArtifactId) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn show(&self, id: ArtifactId) -> Result<ArtifactRecord, Error> {
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .get(&id)
            .map(|artifact| artifact.record.clone())
            .ok_or_else(|| Self::not_found(id))
    }
}
