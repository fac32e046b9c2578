// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A set of hosts wired together over the simulated collaborators

use crate::agent::HostAgent;
use crate::config::Config;
use crate::hypervisor::SimHypervisor;
use crate::lifecycle::{AgentServices, LifecycleEngine};
use crate::route::{StaticRouteResolver, LOOPBACK_DEVICE};
use cowvm_common::api::{
    HostName, InstanceCreate, InstanceMetadata, InstanceRecord, InstanceSpec,
    InstanceUpdate, VmState,
};
use cowvm_common::services::{InstanceStore, NetworkService};
use cowvm_common::sim::{
    SimArtifactStore, SimInstanceStore, SimNetworkService, SimTransport,
};
use cowvm_test_utils::dev::poll::{wait_for_condition, CondCheckError};
use slog::Logger;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub(crate) struct TestHost {
    pub name: HostName,
    pub engine: Arc<LifecycleEngine>,
    pub hypervisor: Arc<SimHypervisor>,
}

pub(crate) struct TestWorld {
    log: Logger,
    pub store: Arc<SimInstanceStore>,
    pub network: Arc<SimNetworkService>,
    pub artifacts: Arc<SimArtifactStore>,
    pub transport: Arc<SimTransport>,
    resolvers: Mutex<Vec<(HostName, Arc<StaticRouteResolver>)>>,
}

impl TestWorld {
    pub fn new(log: &Logger) -> TestWorld {
        TestWorld {
            log: log.clone(),
            store: Arc::new(SimInstanceStore::new()),
            network: Arc::new(SimNetworkService::default()),
            artifacts: Arc::new(SimArtifactStore::new()),
            transport: Arc::new(SimTransport::new(log)),
            resolvers: Mutex::new(Vec::new()),
        }
    }

    pub fn services(&self) -> AgentServices {
        AgentServices {
            store: self.store.clone(),
            network: self.network.clone(),
            artifacts: self.artifacts.clone(),
            transport: self.transport.clone(),
        }
    }

    /// Adds a host agent, without a reconciler, that reaches every other
    /// host over `eth0`.
    pub async fn host(&self, name: &str) -> TestHost {
        self.host_with_config(Config::sim(HostName::from(name))).await
    }

    pub async fn host_with_config(&self, config: Config) -> TestHost {
        let name = config.host.clone();
        let resolver = Arc::new(StaticRouteResolver::new());
        resolver.insert(name.clone(), LOOPBACK_DEVICE);
        {
            let mut resolvers = self.resolvers.lock().unwrap();
            for (other, other_resolver) in resolvers.iter() {
                other_resolver.insert(name.clone(), "eth0");
                resolver.insert(other.clone(), "eth0");
            }
            resolvers.push((name.clone(), resolver.clone()));
        }

        let hypervisor = Arc::new(
            SimHypervisor::new(&self.log)
                .with_artifact_store(self.artifacts.clone()),
        );
        let engine = Arc::new(LifecycleEngine::new(
            &self.log,
            &config,
            self.services(),
            hypervisor.clone(),
            resolver,
        ));
        let agent = Arc::new(HostAgent::new(&self.log, engine.clone()));
        self.transport.register(&config.topic, name.clone(), agent);
        TestHost { name, engine, hypervisor }
    }

    /// Creates an active instance with networking on `host`.
    pub async fn active_instance(&self, host: &TestHost) -> InstanceRecord {
        self.instance_with(host, InstanceMetadata::new()).await
    }

    pub async fn instance_with(
        &self,
        host: &TestHost,
        metadata: InstanceMetadata,
    ) -> InstanceRecord {
        let record = self
            .store
            .instance_create(InstanceCreate {
                project_id: Uuid::new_v4(),
                spec: InstanceSpec {
                    display_name: String::from("web"),
                    ..InstanceSpec::default()
                },
                security_groups: Vec::new(),
                vm_state: VmState::Active,
                host: Some(host.name.clone()),
                metadata,
            })
            .await
            .unwrap();
        self.network
            .allocate_for_instance(record.id, &host.name)
            .await
            .unwrap();
        record
    }

    /// Creates an instance on `host` that is `MIGRATING` with no tag.
    pub async fn migrating_instance(&self, host: &TestHost) -> Uuid {
        let instance = self.active_instance(host).await;
        self.set_vm_state(instance.id, VmState::Migrating).await;
        instance.id
    }

    pub async fn set_vm_state(&self, id: Uuid, vm_state: VmState) {
        self.store
            .instance_update(id, InstanceUpdate::new().vm_state(vm_state))
            .await
            .unwrap();
    }

    pub async fn metadata(&self, id: Uuid) -> InstanceMetadata {
        self.store.metadata_get(id).await.unwrap()
    }

    pub async fn vm_state(&self, id: Uuid) -> VmState {
        self.store.instance_get(id).await.unwrap().vm_state
    }

    /// Waits for `cond` to hold, failing the test after ten seconds.
    pub async fn wait_for<F, Fut>(&self, mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        wait_for_condition::<_, (), _, _>(
            || {
                let check = cond();
                async move {
                    if check.await {
                        Ok(())
                    } else {
                        Err(CondCheckError::NotYet)
                    }
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();
    }

    /// Waits for instance `id` to reach `vm_state`.
    pub async fn wait_for_state(&self, id: Uuid, vm_state: VmState) {
        self.wait_for(|| async move { self.vm_state(id).await == vm_state })
            .await;
    }
}
