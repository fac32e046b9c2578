// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bless, launch, discard, export and import through the gateway

use super::setup::{sim_config, TestContext};
use cowvm_common::api::{
    Error, HostName, LaunchParams, LifecycleState, VmState,
    TAG_LAST_CLONE_NUM,
};
use cowvm_common::services::{ArtifactStore, InstanceStore};
use cowvm_controller::QuotaConfig;
use cowvm_controller_api::InstanceImportParams;
use cowvm_host_agent::hypervisor::Hypervisor;
use std::collections::BTreeSet;
use tokio::task::JoinSet;
use uuid::Uuid;

#[tokio::test]
async fn test_bless_running_instance() {
    let ctx = TestContext::new("test_bless_running_instance");
    let source = ctx.create_instance("h1").await;

    let template = ctx.controller.instance_bless(source.id).await.unwrap();
    assert_ne!(template.id, source.id);
    assert_eq!(template.vm_state, VmState::Building);
    assert_eq!(template.metadata.blessed_from(), Some(source.id));
    assert_eq!(template.spec.display_name, "web-0");
    assert_eq!(template.project_id, source.project_id);

    let template = ctx.wait_until_blessed(template.id).await;
    assert_eq!(template.vm_state, VmState::Active);
    assert_eq!(template.host, Some(HostName::from("h1")));
    assert!(template.metadata.blessed_flag());
    assert_eq!(template.metadata.images().len(), 2);

    // The running instance only gains its clone counter.
    let after = ctx.fetch(source.id).await;
    assert_eq!(after.vm_state, VmState::Active);
    assert_eq!(after.host, source.host);
    assert_eq!(after.lifecycle_state(), LifecycleState::Active);
    assert_eq!(after.metadata.get(TAG_LAST_CLONE_NUM), Some("0"));

    let blessed =
        ctx.controller.instance_list_blessed(source.id).await.unwrap();
    assert_eq!(blessed.len(), 1);
    assert_eq!(blessed[0].id, template.id);

    ctx.teardown();
}

#[tokio::test]
async fn test_bless_preconditions() {
    let ctx = TestContext::new("test_bless_preconditions");
    let source = ctx.create_instance("h1").await;
    let template = ctx.controller.instance_bless(source.id).await.unwrap();
    ctx.wait_until_blessed(template.id).await;

    let err = ctx.controller.instance_bless(template.id).await.unwrap_err();
    assert!(err.to_string().contains("Cannot rebless"), "{err}");

    let launched = ctx
        .controller
        .instance_launch(template.id, LaunchParams::default())
        .await
        .unwrap();
    let err = ctx.controller.instance_bless(launched.id).await.unwrap_err();
    assert!(
        err.to_string().contains("Cannot bless a launched instance"),
        "{err}"
    );

    let other = ctx.create_instance("h2").await;
    ctx.deployment
        .store
        .instance_update(
            other.id,
            cowvm_common::api::InstanceUpdate::new().vm_state(VmState::Error),
        )
        .await
        .unwrap();
    let err = ctx.controller.instance_bless(other.id).await.unwrap_err();
    assert!(
        err.to_string().contains("Cannot bless a non-active instance"),
        "{err}"
    );

    // None of the rejected requests created a record.
    let blessed = ctx.controller.instance_list_blessed(other.id).await.unwrap();
    assert!(blessed.is_empty());

    ctx.teardown();
}

#[tokio::test]
async fn test_launch_and_discard_round_trip() {
    let ctx = TestContext::new("test_launch_and_discard_round_trip");
    let source = ctx.create_instance("h1").await;
    let template = ctx.controller.instance_bless(source.id).await.unwrap();
    ctx.wait_until_blessed(template.id).await;

    let err = ctx
        .controller
        .instance_launch(source.id, LaunchParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }), "{err}");

    let params = LaunchParams {
        target: Some(String::from("256mb")),
        target_host: Some(HostName::from("h2")),
        ..LaunchParams::default()
    };
    let launched =
        ctx.controller.instance_launch(template.id, params).await.unwrap();
    assert_eq!(launched.vm_state, VmState::Building);
    assert_eq!(launched.metadata.launched_from(), Some(template.id));
    assert_eq!(launched.spec.display_name, "web-0-clone");

    let launched = ctx
        .wait_for_record(launched.id, |r| r.vm_state == VmState::Active)
        .await;
    assert_eq!(launched.host, Some(HostName::from("h2")));
    assert_eq!(launched.task_state, None);
    assert!(ctx.host("h2").hypervisor.is_running(&launched.name()));

    let children =
        ctx.controller.instance_list_launched(template.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, launched.id);

    let err = ctx.controller.instance_discard(template.id).await.unwrap_err();
    assert!(err.to_string().contains("launched instances"), "{err}");
    assert_eq!(
        ctx.fetch(template.id).await.lifecycle_state(),
        LifecycleState::Blessed
    );

    ctx.deployment.store.instance_destroy(launched.id).await.unwrap();
    ctx.controller.instance_discard(template.id).await.unwrap();
    ctx.wait_until_gone(template.id).await;

    // Only blessed instances can be discarded.
    let err = ctx.controller.instance_discard(source.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }), "{err}");

    ctx.teardown();
}

#[tokio::test]
async fn test_launch_failure_is_recorded() {
    let ctx = TestContext::new("test_launch_failure_is_recorded");
    let source = ctx.create_instance("h1").await;
    let template = ctx.controller.instance_bless(source.id).await.unwrap();
    ctx.wait_until_blessed(template.id).await;

    ctx.deployment.network.set_fail_allocations(true);
    let params = LaunchParams {
        target_host: Some(HostName::from("h1")),
        ..LaunchParams::default()
    };
    // The request itself is accepted.
    let launched =
        ctx.controller.instance_launch(template.id, params).await.unwrap();
    let launched = ctx
        .wait_for_record(launched.id, |r| r.vm_state == VmState::Error)
        .await;
    assert_eq!(launched.task_state, None);
    assert_eq!(launched.host, Some(HostName::from("h1")));
    // Interfaces are not released, but none were handed out here.
    assert!(!ctx.deployment.network.is_allocated(launched.id));

    ctx.teardown();
}

#[tokio::test]
async fn test_clone_numbers_are_unique() {
    let ctx = TestContext::new("test_clone_numbers_are_unique");
    let source = ctx.create_instance("h1").await;

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let controller = ctx.controller.clone();
        let id = source.id;
        tasks.spawn(async move { controller.instance_bless(id).await });
    }
    let mut suffixes = BTreeSet::new();
    while let Some(result) = tasks.join_next().await {
        let template = result.unwrap().unwrap();
        let suffix = template
            .spec
            .display_name
            .strip_prefix("web-")
            .unwrap()
            .parse::<i64>()
            .unwrap();
        assert!(suffixes.insert(suffix), "duplicate clone number {suffix}");
    }
    assert_eq!(suffixes, (0..8).collect::<BTreeSet<i64>>());
    assert_eq!(
        ctx.fetch(source.id).await.metadata.get(TAG_LAST_CLONE_NUM),
        Some("7")
    );

    ctx.teardown();
}

#[tokio::test]
async fn test_launch_over_quota() {
    let ctx = TestContext::with_config(
        "test_launch_over_quota",
        sim_config(),
        QuotaConfig { max_instances_per_project: 2 },
    );
    let source = ctx.create_instance("h1").await;
    let template = ctx.controller.instance_bless(source.id).await.unwrap();
    ctx.wait_until_blessed(template.id).await;

    let err = ctx
        .controller
        .instance_launch(template.id, LaunchParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientCapacity { .. }), "{err}");
    assert!(ctx
        .controller
        .instance_list_launched(template.id)
        .await
        .unwrap()
        .is_empty());

    ctx.teardown();
}

#[tokio::test]
async fn test_export_and_import() {
    let ctx = TestContext::new("test_export_and_import");
    let source = ctx.create_instance("h1").await;
    let template = ctx.controller.instance_bless(source.id).await.unwrap();
    ctx.wait_until_blessed(template.id).await;

    let err = ctx.controller.instance_export(source.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }), "{err}");

    let exported = ctx.controller.instance_export(template.id).await.unwrap();
    assert_eq!(exported.instance_data.spec.display_name, "web-0");
    assert!(!exported.instance_data.spec.locked);
    assert!(exported.instance_data.metadata.blessed_flag());

    let artifacts = ctx.deployment.artifacts.clone();
    let artifact_id = exported.artifact_id;
    ctx.wait_for(|| {
        let artifacts = artifacts.clone();
        async move {
            artifacts
                .show(artifact_id)
                .await
                .map(|artifact| artifact.size.is_some())
                .unwrap_or(false)
        }
    })
    .await;

    let imported = ctx
        .controller
        .instance_import(InstanceImportParams {
            project_id: Uuid::new_v4(),
            instance_data: exported.instance_data,
            name: String::from("restored"),
            security_groups: vec![String::from("default")],
            artifact_id,
        })
        .await
        .unwrap();
    assert_eq!(imported.spec.display_name, "restored");
    assert_eq!(imported.host, None);
    assert_eq!(imported.lifecycle_state(), LifecycleState::Blessed);

    let imported =
        ctx.wait_for_record(imported.id, |r| r.host.is_some()).await;
    let host = imported.host.clone().unwrap();
    let disk = format!("{}/disk", imported.name());
    ctx.deployment
        .host(&host)
        .unwrap()
        .hypervisor
        .artifact_contents(&disk)
        .await
        .unwrap();

    ctx.teardown();
}

#[tokio::test]
async fn test_unknown_instance() {
    let ctx = TestContext::new("test_unknown_instance");
    let id = Uuid::new_v4();
    for err in [
        ctx.controller.instance_bless(id).await.unwrap_err(),
        ctx.controller.instance_migrate(id, None).await.unwrap_err(),
        ctx.controller.instance_list_launched(id).await.map(|_| ()).unwrap_err(),
    ] {
        assert!(matches!(err, Error::ObjectNotFound { .. }), "{err}");
    }
    ctx.teardown();
}
