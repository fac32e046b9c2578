// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A complete deployment in one process: simulated collaborators and one
//! host agent per configured host, all sharing an in-process transport

use crate::app::ControllerServices;
use crate::config::SimConfig;
use cowvm_common::api::HostName;
use cowvm_common::sim::{
    SimArtifactStore, SimHostRegistry, SimInstanceStore, SimNetworkService,
    SimTransport,
};
use cowvm_host_agent::hypervisor::SimHypervisor;
use cowvm_host_agent::route::{StaticRouteResolver, LOOPBACK_DEVICE};
use cowvm_host_agent::{AgentServices, Server, StartError};
use slog::{info, o, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A running simulated host.
pub struct SimHost {
    pub server: Server,
    pub hypervisor: Arc<SimHypervisor>,
}

pub struct SimDeployment {
    pub store: Arc<SimInstanceStore>,
    pub network: Arc<SimNetworkService>,
    pub artifacts: Arc<SimArtifactStore>,
    pub registry: Arc<SimHostRegistry>,
    pub transport: Arc<SimTransport>,
    hosts: BTreeMap<HostName, SimHost>,
}

impl SimDeployment {
    pub fn start(
        log: &Logger,
        topic: &str,
        config: &SimConfig,
    ) -> Result<SimDeployment, StartError> {
        let log = log.new(o!("component" => "SimDeployment"));
        let store = Arc::new(SimInstanceStore::new());
        let network = Arc::new(SimNetworkService::default());
        let artifacts = Arc::new(SimArtifactStore::new());
        let registry = Arc::new(SimHostRegistry::new());
        let transport = Arc::new(SimTransport::new(&log));
        let services = AgentServices {
            store: store.clone(),
            network: network.clone(),
            artifacts: artifacts.clone(),
            transport: transport.clone(),
        };

        let mut hosts = BTreeMap::new();
        for name in &config.hosts {
            let routes = Arc::new(StaticRouteResolver::new());
            for other in &config.hosts {
                let device =
                    if other == name { LOOPBACK_DEVICE } else { "sim0" };
                routes.insert(other.clone(), device);
            }

            let mut agent_config =
                cowvm_host_agent::Config::sim(name.clone());
            agent_config.topic = topic.to_string();
            agent_config.use_artifact_store = config.use_artifact_store;
            agent_config.reconcile_period_secs = config.reconcile_period_secs;
            agent_config.outgoing_migration_address = Some(name.to_string());

            let hypervisor = Arc::new(
                SimHypervisor::new(&log)
                    .with_artifact_store(artifacts.clone())
                    .with_launch_delay(Duration::from_millis(
                        config.launch_delay_ms,
                    )),
            );
            for operation in &config.failing_operations {
                hypervisor.set_failing(*operation, true);
            }

            let server = Server::start_with_hypervisor(
                &log,
                &agent_config,
                services.clone(),
                hypervisor.clone(),
                routes,
            )?;
            transport.register(topic, name.clone(), server.handler());
            registry.add_host(topic, name.clone());
            info!(log, "started simulated host"; "host" => %name);
            hosts.insert(name.clone(), SimHost { server, hypervisor });
        }

        Ok(SimDeployment {
            store,
            network,
            artifacts,
            registry,
            transport,
            hosts,
        })
    }

    /// The collaborators the gateway needs to talk to this deployment.
    pub fn controller_services(&self) -> ControllerServices {
        ControllerServices {
            store: self.store.clone(),
            registry: self.registry.clone(),
            artifacts: self.artifacts.clone(),
            transport: self.transport.clone(),
        }
    }

    pub fn host(&self, name: &HostName) -> Option<&SimHost> {
        self.hosts.get(name)
    }

    pub fn host_names(&self) -> impl Iterator<Item = &HostName> {
        self.hosts.keys()
    }
}
