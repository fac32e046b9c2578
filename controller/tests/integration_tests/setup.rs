// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A gateway in front of a simulated deployment, for scenario tests

use cowvm_common::api::{
    Error, HostName, InstanceRecord, InstanceSpec, LifecycleState,
};
use cowvm_common::services::NetworkService;
use cowvm_controller::sim::{SimDeployment, SimHost};
use cowvm_controller::{Controller, QuotaConfig, SimConfig};
use cowvm_controller_api::InstanceCreateParams;
use cowvm_test_utils::dev::poll::{wait_for_condition, CondCheckError};
use cowvm_test_utils::dev::{test_setup_log, LogContext};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_secs(20);

pub const TOPIC: &str = "cowvm";

pub struct TestContext {
    pub logctx: LogContext,
    pub deployment: SimDeployment,
    pub controller: Arc<Controller>,
    pub project_id: Uuid,
}

/// Two hosts, `h1` and `h2`, that only reconcile when asked to.
pub fn sim_config() -> SimConfig {
    SimConfig {
        hosts: vec![HostName::from("h1"), HostName::from("h2")],
        reconcile_period_secs: 3600,
        ..SimConfig::default()
    }
}

impl TestContext {
    pub fn new(test_name: &str) -> TestContext {
        TestContext::with_config(test_name, sim_config(), QuotaConfig::default())
    }

    pub fn with_config(
        test_name: &str,
        sim: SimConfig,
        quota: QuotaConfig,
    ) -> TestContext {
        let logctx = test_setup_log(test_name);
        let deployment =
            SimDeployment::start(&logctx.log, TOPIC, &sim).unwrap();
        let controller = Arc::new(Controller::new(
            &logctx.log,
            TOPIC,
            quota,
            deployment.controller_services(),
        ));
        TestContext {
            logctx,
            deployment,
            controller,
            project_id: Uuid::new_v4(),
        }
    }

    pub fn host(&self, name: &str) -> &SimHost {
        self.deployment.host(&HostName::from(name)).unwrap()
    }

    /// Creates a running instance with networking on `host`.
    pub async fn create_instance(&self, host: &str) -> InstanceRecord {
        let host = HostName::from(host);
        let record = self
            .controller
            .instance_create(InstanceCreateParams {
                project_id: self.project_id,
                spec: InstanceSpec {
                    display_name: String::from("web"),
                    memory_mb: 512,
                    vcpus: 1,
                    ..InstanceSpec::default()
                },
                security_groups: vec![String::from("default")],
                target_host: Some(host.clone()),
            })
            .await
            .unwrap();
        self.deployment
            .network
            .allocate_for_instance(record.id, &host)
            .await
            .unwrap();
        record
    }

    pub async fn fetch(&self, id: Uuid) -> InstanceRecord {
        self.controller.instance_fetch(id).await.unwrap()
    }

    /// Waits for the record of `id` to satisfy `pred` and returns it.
    pub async fn wait_for_record<F>(&self, id: Uuid, pred: F) -> InstanceRecord
    where
        F: Fn(&InstanceRecord) -> bool,
    {
        let controller = &self.controller;
        let pred = &pred;
        wait_for_condition(
            move || async move {
                match controller.instance_fetch(id).await {
                    Ok(record) if pred(&record) => Ok(record),
                    Ok(_) => Err(CondCheckError::NotYet),
                    Err(err) => Err(CondCheckError::Failed(err)),
                }
            },
            &POLL_INTERVAL,
            &POLL_MAX,
        )
        .await
        .unwrap()
    }

    pub async fn wait_until_blessed(&self, id: Uuid) -> InstanceRecord {
        self.wait_for_record(id, |record| {
            record.lifecycle_state() == LifecycleState::Blessed
        })
        .await
    }

    /// Waits for the record of `id` to be removed.
    pub async fn wait_until_gone(&self, id: Uuid) {
        let controller = &self.controller;
        wait_for_condition::<_, Error, _, _>(
            move || async move {
                match controller.instance_fetch(id).await {
                    Err(Error::ObjectNotFound { .. }) => Ok(()),
                    Err(err) => Err(CondCheckError::Failed(err)),
                    Ok(_) => Err(CondCheckError::NotYet),
                }
            },
            &POLL_INTERVAL,
            &POLL_MAX,
        )
        .await
        .unwrap();
    }

    /// Waits for an arbitrary condition.
    pub async fn wait_for<F, Fut>(&self, mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
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
            &POLL_INTERVAL,
            &POLL_MAX,
        )
        .await
        .unwrap();
    }

    pub fn teardown(self) {
        self.logctx.cleanup_successful();
    }
}
