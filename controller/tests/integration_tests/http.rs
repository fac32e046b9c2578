// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The gateway's HTTP interface

use super::setup::{sim_config, TOPIC};
use cowvm_common::api::{Error, HostName, InstanceSpec, LifecycleState};
use cowvm_controller::{Config, QuotaConfig, SimServer};
use cowvm_controller_api::{InstanceCreateParams, InstanceView};
use cowvm_test_utils::dev::poll::{wait_for_condition, CondCheckError};
use cowvm_test_utils::dev::test_setup_log;
use dropshot::test_util::{object_get, objects_post, ClientTestContext};
use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, Method};
use http::StatusCode;
use std::time::Duration;
use uuid::Uuid;

fn server_config() -> Config {
    Config {
        dropshot: ConfigDropshot {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..ConfigDropshot::default()
        },
        log: ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info },
        topic: TOPIC.to_string(),
        quota: QuotaConfig::default(),
        sim: sim_config(),
    }
}

#[tokio::test]
async fn test_instance_endpoints() {
    let logctx = test_setup_log("test_instance_endpoints");
    let server = SimServer::start(&server_config(), &logctx.log).await.unwrap();
    let client = ClientTestContext::new(
        server.http_server.local_addr(),
        logctx.log.clone(),
    );

    let source: InstanceView = objects_post(
        &client,
        "/instances",
        &InstanceCreateParams {
            project_id: Uuid::new_v4(),
            spec: InstanceSpec {
                display_name: String::from("db"),
                memory_mb: 1024,
                vcpus: 2,
                ..InstanceSpec::default()
            },
            security_groups: Vec::new(),
            target_host: Some(HostName::from("h2")),
        },
    )
    .await;
    assert_eq!(source.lifecycle_state, LifecycleState::Active);
    assert_eq!(source.record.host, Some(HostName::from("h2")));
    let source_path = format!("/instances/{}", source.record.id);

    let fetched: InstanceView = object_get(&client, &source_path).await;
    assert_eq!(fetched.record.id, source.record.id);
    assert_eq!(fetched.record.spec.display_name, "db");

    let mut response = client
        .make_request_no_body(
            Method::POST,
            &format!("{source_path}/bless"),
            StatusCode::CREATED,
        )
        .await
        .unwrap();
    let template: InstanceView =
        dropshot::test_util::read_json(&mut response).await;
    assert_eq!(template.lifecycle_state, LifecycleState::Building);
    assert_eq!(template.record.spec.display_name, "db-0");

    let controller = &server.controller;
    let template_id = template.record.id;
    wait_for_condition::<_, Error, _, _>(
        || async move {
            match controller.instance_fetch(template_id).await {
                Ok(record)
                    if record.lifecycle_state() == LifecycleState::Blessed =>
                {
                    Ok(())
                }
                Ok(_) => Err(CondCheckError::NotYet),
                Err(err) => Err(CondCheckError::Failed(err)),
            }
        },
        &Duration::from_millis(10),
        &Duration::from_secs(20),
    )
    .await
    .unwrap();

    let template_path = format!("/instances/{template_id}");
    let template: InstanceView = object_get(&client, &template_path).await;
    assert_eq!(template.lifecycle_state, LifecycleState::Blessed);

    let blessed: Vec<InstanceView> =
        object_get(&client, &format!("{source_path}/blessed")).await;
    assert_eq!(blessed.len(), 1);
    assert_eq!(blessed[0].record.id, template_id);
    let launched: Vec<InstanceView> =
        object_get(&client, &format!("{template_path}/launched")).await;
    assert!(launched.is_empty());

    // Only templates can be discarded.
    let error = client
        .make_request_error(
            Method::POST,
            &format!("{source_path}/discard"),
            StatusCode::BAD_REQUEST,
        )
        .await;
    assert_eq!(error.error_code.as_deref(), Some("InvalidRequest"));

    client
        .make_request_no_body(
            Method::POST,
            &format!("{template_path}/discard"),
            StatusCode::NO_CONTENT,
        )
        .await
        .unwrap();
    wait_for_condition::<_, Error, _, _>(
        || async move {
            match controller.instance_fetch(template_id).await {
                Err(Error::ObjectNotFound { .. }) => Ok(()),
                Err(err) => Err(CondCheckError::Failed(err)),
                Ok(_) => Err(CondCheckError::NotYet),
            }
        },
        &Duration::from_millis(10),
        &Duration::from_secs(20),
    )
    .await
    .unwrap();

    let error = client
        .make_request_error(
            Method::GET,
            &format!("/instances/{}", Uuid::new_v4()),
            StatusCode::NOT_FOUND,
        )
        .await;
    assert_eq!(error.error_code.as_deref(), Some("ObjectNotFound"));

    server.close().await.unwrap();
    logctx.cleanup_successful();
}
