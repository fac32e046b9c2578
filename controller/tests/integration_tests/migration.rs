// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Migration between simulated hosts, including rollback and reconciliation

use super::setup::{sim_config, TestContext, TOPIC};
use cowvm_common::api::{
    Error, HostName, HostRequest, InstanceMetadata, InstanceUpdate, VmState,
};
use cowvm_common::services::{InstanceStore, Queue, Transport};
use cowvm_controller::{QuotaConfig, SimConfig};
use cowvm_host_agent::hypervisor::SimOperation;
use std::time::Duration;

#[tokio::test]
async fn test_migrate() {
    let ctx = TestContext::new("test_migrate");
    let instance = ctx.create_instance("h1").await;

    let record = ctx
        .controller
        .instance_migrate(instance.id, Some(HostName::from("h2")))
        .await
        .unwrap();
    assert_eq!(record.vm_state, VmState::Migrating);

    let record = ctx
        .wait_for_record(instance.id, |r| r.vm_state == VmState::Active)
        .await;
    assert_eq!(record.host, Some(HostName::from("h2")));
    assert_eq!(record.task_state, None);
    assert!(!record.metadata.is_migrating());
    assert!(ctx.host("h2").hypervisor.is_running(&record.name()));
    assert!(!ctx.host("h1").hypervisor.is_running(&record.name()));
    assert!(ctx.deployment.network.is_plugged(&HostName::from("h2"), record.id));
    assert!(!ctx.deployment.network.is_plugged(&HostName::from("h1"), record.id));

    // The destination brings the network up before the source tears its
    // side down.
    let setups: Vec<HostName> = ctx
        .deployment
        .network
        .setup_calls()
        .into_iter()
        .map(|(host, _)| host)
        .collect();
    assert_eq!(setups, vec![HostName::from("h2"), HostName::from("h1")]);

    let tracker = ctx.host("h1").server.engine().migrations();
    assert!(!tracker.is_outgoing(instance.id).await);

    ctx.teardown();
}

#[tokio::test]
async fn test_migrate_rolls_back_failed_launch() {
    let ctx = TestContext::new("test_migrate_rolls_back_failed_launch");
    let instance = ctx.create_instance("h1").await;

    ctx.host("h2").hypervisor.fail_next(SimOperation::Launch);
    ctx.controller
        .instance_migrate(instance.id, Some(HostName::from("h2")))
        .await
        .unwrap();

    let record = ctx
        .wait_for_record(instance.id, |r| {
            r.vm_state == VmState::Active && !r.metadata.is_migrating()
        })
        .await;
    assert_eq!(record.host, Some(HostName::from("h1")));
    assert_eq!(record.task_state, None);
    assert!(!record.metadata.is_migrating());
    assert!(ctx.host("h1").hypervisor.is_running(&record.name()));
    assert!(!ctx.host("h2").hypervisor.is_running(&record.name()));
    assert!(!ctx.deployment.network.is_plugged(&HostName::from("h2"), record.id));
    assert!(ctx.deployment.network.setup_calls().is_empty());

    // The lock is free again, so the instance can be moved once more.
    let tracker = ctx.host("h1").server.engine().migrations();
    assert!(!tracker.is_outgoing(instance.id).await);
    ctx.controller
        .instance_migrate(instance.id, Some(HostName::from("h2")))
        .await
        .unwrap();
    let record = ctx
        .wait_for_record(instance.id, |r| {
            r.vm_state == VmState::Active
                && r.host == Some(HostName::from("h2"))
        })
        .await;
    assert_eq!(record.task_state, None);

    ctx.teardown();
}

#[tokio::test]
async fn test_failed_rollback_leaves_error() {
    let ctx = TestContext::new("test_failed_rollback_leaves_error");
    let instance = ctx.create_instance("h1").await;

    ctx.host("h2").hypervisor.fail_next(SimOperation::Launch);
    ctx.host("h1").hypervisor.set_failing(SimOperation::Launch, true);
    ctx.controller
        .instance_migrate(instance.id, Some(HostName::from("h2")))
        .await
        .unwrap();

    let record = ctx
        .wait_for_record(instance.id, |r| {
            r.vm_state == VmState::Error && !r.metadata.is_migrating()
        })
        .await;
    assert!(!record.metadata.is_migrating());
    assert!(!ctx.host("h1").hypervisor.is_running(&record.name()));

    ctx.teardown();
}

#[tokio::test]
async fn test_migrate_destination_validation() {
    let ctx = TestContext::new("test_migrate_destination_validation");
    let instance = ctx.create_instance("h1").await;

    for dest in ["h1", "h3"] {
        let err = ctx
            .controller
            .instance_migrate(instance.id, Some(HostName::from(dest)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }), "{err}");
    }
    let record = ctx.fetch(instance.id).await;
    assert_eq!(record.vm_state, VmState::Active);
    assert_eq!(record.host, Some(HostName::from("h1")));
    assert!(ctx.host("h1").hypervisor.calls().is_empty());

    // Without a destination, the only other host is picked.
    ctx.controller.instance_migrate(instance.id, None).await.unwrap();
    let record = ctx
        .wait_for_record(instance.id, |r| r.vm_state == VmState::Active)
        .await;
    assert_eq!(record.host, Some(HostName::from("h2")));

    ctx.teardown();
}

#[tokio::test]
async fn test_migrate_with_single_host() {
    let ctx = TestContext::with_config(
        "test_migrate_with_single_host",
        SimConfig { hosts: vec![HostName::from("h1")], ..sim_config() },
        QuotaConfig::default(),
    );
    let instance = ctx.create_instance("h1").await;
    let err =
        ctx.controller.instance_migrate(instance.id, None).await.unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable { .. }), "{err}");
    assert_eq!(ctx.fetch(instance.id).await.vm_state, VmState::Active);
    ctx.teardown();
}

#[tokio::test]
async fn test_concurrent_migrations_are_rejected() {
    let ctx = TestContext::with_config(
        "test_concurrent_migrations_are_rejected",
        SimConfig { launch_delay_ms: 500, ..sim_config() },
        QuotaConfig::default(),
    );
    let instance = ctx.create_instance("h1").await;
    let h1 = HostName::from("h1");
    let h2 = HostName::from("h2");

    ctx.controller
        .instance_migrate(instance.id, Some(h2.clone()))
        .await
        .unwrap();
    let err = ctx
        .controller
        .instance_migrate(instance.id, Some(h2.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "{err}");

    // A request that reaches the host directly finds the lock held.
    let tracker = ctx.host("h1").server.engine().migrations().clone();
    let id = instance.id;
    ctx.wait_for(|| {
        let tracker = tracker.clone();
        async move { tracker.is_outgoing(id).await }
    })
    .await;
    let err = ctx
        .deployment
        .transport
        .call(
            &Queue::Host { topic: TOPIC.to_string(), host: h1.clone() },
            HostRequest::Migrate { instance_id: id, destination: h2.clone() },
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "{err}");

    let record = ctx
        .wait_for_record(id, |r| r.vm_state == VmState::Active)
        .await;
    assert_eq!(record.host, Some(h2));

    ctx.teardown();
}

#[tokio::test]
async fn test_reconcile_after_restart() {
    let ctx = TestContext::new("test_reconcile_after_restart");
    let store = &ctx.deployment.store;

    // A migration request that never reached the host.
    let lost = ctx.create_instance("h1").await;
    store
        .instance_update(
            lost.id,
            InstanceUpdate::new().vm_state(VmState::Migrating),
        )
        .await
        .unwrap();

    // A migration that was under way when the host went away.
    let interrupted = ctx.create_instance("h1").await;
    store
        .instance_update(
            interrupted.id,
            InstanceUpdate::new().vm_state(VmState::Migrating),
        )
        .await
        .unwrap();
    let mut tag = InstanceMetadata::new();
    tag.set_migrating();
    store.metadata_update(interrupted.id, tag, false).await.unwrap();

    // Let the pass run at startup finish before asking for another.
    let reconciler = ctx.host("h1").server.reconciler();
    reconciler.wait_for_iteration(1).await;
    let iteration = reconciler.status().iteration;
    reconciler.activate();
    reconciler.wait_for_iteration(iteration + 1).await;

    assert_eq!(ctx.fetch(lost.id).await.vm_state, VmState::Active);
    assert_eq!(ctx.fetch(interrupted.id).await.vm_state, VmState::Error);

    ctx.teardown();
}
