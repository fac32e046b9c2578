// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{Error, HostName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A network an instance is attached to.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct NetworkRef {
    pub id: Uuid,
    pub label: String,
    /// Multi-host networks are served by every host and must be reconfigured
    /// on both ends when an instance moves.
    pub multi_host: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VirtualInterface {
    pub mac: String,
    pub network: NetworkRef,
}

/// The virtual interfaces of an instance, in attachment order.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkInfo {
    pub vifs: Vec<VirtualInterface>,
}

impl NetworkInfo {
    pub fn is_empty(&self) -> bool {
        self.vifs.is_empty()
    }

    /// Interface index to MAC address, e.g. `{"0": mac0, "1": mac1}`.
    pub fn mac_table(&self) -> BTreeMap<String, String> {
        self.vifs
            .iter()
            .enumerate()
            .map(|(i, vif)| (i.to_string(), vif.mac.clone()))
            .collect()
    }

    /// The distinct multi-host networks attached, in attachment order.
    pub fn multi_host_networks(&self) -> Vec<NetworkRef> {
        let mut networks: Vec<NetworkRef> = Vec::new();
        for vif in self.vifs.iter().filter(|v| v.network.multi_host) {
            if !networks.iter().any(|n| n.id == vif.network.id) {
                networks.push(vif.network.clone());
            }
        }
        networks
    }
}

/// The network-configuration service.
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Allocates interfaces for a freshly created instance.
    async fn allocate_for_instance(
        &self,
        instance_id: Uuid,
        host: &HostName,
    ) -> Result<NetworkInfo, Error>;

    async fn get_instance_network_info(
        &self,
        instance_id: Uuid,
    ) -> Result<NetworkInfo, Error>;

    /// Asks `host` to (re)configure `network`.
    async fn setup_network(
        &self,
        host: &HostName,
        network: &NetworkRef,
    ) -> Result<(), Error>;

    /// Sets up host-side networking for the instance on `host`.
    async fn plug_instance(
        &self,
        host: &HostName,
        instance_id: Uuid,
    ) -> Result<(), Error>;

    /// Tears down host-side networking for the instance on `host`.
    async fn unplug_instance(
        &self,
        host: &HostName,
        instance_id: Uuid,
    ) -> Result<(), Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn vif(mac: &str, network: &NetworkRef) -> VirtualInterface {
        VirtualInterface { mac: mac.to_string(), network: network.clone() }
    }

    #[test]
    fn test_network_info_views() {
        let shared = NetworkRef {
            id: Uuid::new_v4(),
            label: String::from("shared"),
            multi_host: true,
        };
        let private = NetworkRef {
            id: Uuid::new_v4(),
            label: String::from("private"),
            multi_host: false,
        };
        let info = NetworkInfo {
            vifs: vec![
                vif("aa:00", &shared),
                vif("aa:01", &private),
                vif("aa:02", &shared),
            ],
        };

        let macs = info.mac_table();
        assert_eq!(macs.len(), 3);
        assert_eq!(macs["0"], "aa:00");
        assert_eq!(macs["2"], "aa:02");

        assert_eq!(info.multi_host_networks(), vec![shared]);
    }
}
