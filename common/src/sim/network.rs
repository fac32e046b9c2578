// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{Error, HostName, ResourceType};
use crate::services::{NetworkInfo, NetworkRef, NetworkService, VirtualInterface};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use uuid::Uuid;

struct Inner {
    /// Networks every new instance is attached to, one interface each.
    networks: Vec<NetworkRef>,
    allocations: BTreeMap<Uuid, NetworkInfo>,
    plugged: BTreeSet<(HostName, Uuid)>,
    setup_calls: Vec<(HostName, NetworkRef)>,
    fail_allocations: bool,
    next_mac: u32,
}

/// Hands out interfaces on a fixed set of networks and records host-side
/// plumbing requests.
pub struct SimNetworkService {
    inner: Mutex<Inner>,
}

impl Default for SimNetworkService {
    fn default() -> Self {
        SimNetworkService::new(vec![NetworkRef {
            id: Uuid::new_v4(),
            label: String::from("public"),
            multi_host: true,
        }])
    }
}

impl SimNetworkService {
    pub fn new(networks: Vec<NetworkRef>) -> SimNetworkService {
        SimNetworkService {
            inner: Mutex::new(Inner {
                networks,
                allocations: BTreeMap::new(),
                plugged: BTreeSet::new(),
                setup_calls: Vec::new(),
                fail_allocations: false,
                next_mac: 1,
            }),
        }
    }

    pub fn set_fail_allocations(&self, fail: bool) {
        self.inner.lock().unwrap().fail_allocations = fail;
    }

    pub fn is_allocated(&self, instance_id: Uuid) -> bool {
        self.inner.lock().unwrap().allocations.contains_key(&instance_id)
    }

    pub fn is_plugged(&self, host: &HostName, instance_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .plugged
            .contains(&(host.clone(), instance_id))
    }

    /// Every `setup_network` request received so far, in order.
    pub fn setup_calls(&self) -> Vec<(HostName, NetworkRef)> {
        self.inner.lock().unwrap().setup_calls.clone()
    }
}

#[async_trait]
impl NetworkService for SimNetworkService {
    async fn allocate_for_instance(
        &self,
        instance_id: Uuid,
        _host: &HostName,
    ) -> Result<NetworkInfo, Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_allocations {
            return Err(Error::unavail("simulated network allocation failure"));
        }
        let mut vifs = Vec::with_capacity(inner.networks.len());
        for network in inner.networks.clone() {
            let n = inner.next_mac;
            inner.next_mac += 1;
            let mac = format!(
                "02:16:3e:{:02x}:{:02x}:{:02x}",
                (n >> 16) & 0xff,
                (n >> 8) & 0xff,
                n & 0xff
            );
            vifs.push(VirtualInterface { mac, network });
        }
        let info = NetworkInfo { vifs };
        inner.allocations.insert(instance_id, info.clone());
        Ok(info)
    }

    async fn get_instance_network_info(
        &self,
        instance_id: Uuid,
    ) -> Result<NetworkInfo, Error> {
        // Instances launched without networking have no interfaces.
        Ok(self
            .inner
            .lock()
            .unwrap()
            .allocations
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn setup_network(
        &self,
        host: &HostName,
        network: &NetworkRef,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.networks.iter().any(|n| n.id == network.id) {
            return Err(Error::not_found_by_id(
                ResourceType::Network,
                &network.id,
            ));
        }
        inner.setup_calls.push((host.clone(), network.clone()));
        Ok(())
    }

    async fn plug_instance(
        &self,
        host: &HostName,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        self.inner.lock().unwrap().plugged.insert((host.clone(), instance_id));
        Ok(())
    }

    async fn unplug_instance(
        &self,
        host: &HostName,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .plugged
            .remove(&(host.clone(), instance_id));
        Ok(())
    }
}
