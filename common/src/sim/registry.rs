// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{Error, HostName};
use crate::services::HostRegistry;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// Tracks which hosts serve which topic.
#[derive(Default)]
pub struct SimHostRegistry {
    hosts: Mutex<BTreeMap<String, BTreeSet<HostName>>>,
}

impl SimHostRegistry {
    pub fn new() -> SimHostRegistry {
        SimHostRegistry::default()
    }

    pub fn add_host(&self, topic: &str, host: HostName) {
        self.hosts
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .insert(host);
    }

    pub fn remove_host(&self, topic: &str, host: &HostName) {
        if let Some(hosts) = self.hosts.lock().unwrap().get_mut(topic) {
            hosts.remove(host);
        }
    }
}

#[async_trait]
impl HostRegistry for SimHostRegistry {
    async fn list_hosts(&self, topic: &str) -> Result<Vec<HostName>, Error> {
        Ok(self
            .hosts
            .lock()
            .unwrap()
            .get(topic)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default())
    }
}
