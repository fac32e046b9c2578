// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The consuming end of this host's queue

use crate::lifecycle::LifecycleEngine;
use async_trait::async_trait;
use cowvm_common::api::{Error, HostRequest, HostResponse};
use cowvm_common::services::RequestHandler;
use slog::{debug, o, warn, Logger};
use std::sync::Arc;

/// Routes each request delivered to this host to the lifecycle engine.
pub struct HostAgent {
    log: Logger,
    engine: Arc<LifecycleEngine>,
}

impl HostAgent {
    pub fn new(log: &Logger, engine: Arc<LifecycleEngine>) -> HostAgent {
        HostAgent {
            log: log.new(o!(
                "component" => "HostAgent",
                "host" => engine.host().to_string(),
            )),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<LifecycleEngine> {
        &self.engine
    }
}

#[async_trait]
impl RequestHandler for HostAgent {
    async fn handle(&self, request: HostRequest) -> Result<HostResponse, Error> {
        let log = self.log.new(o!(
            "method" => request.to_string(),
            "instance_id" => request.instance_id().to_string(),
        ));
        debug!(log, "handling request");
        let result = match request {
            HostRequest::Bless { instance_id } => {
                self.engine.bless(instance_id).await.map(|()| HostResponse::Ack)
            }
            HostRequest::Discard { instance_id } => self
                .engine
                .discard(instance_id)
                .await
                .map(|()| HostResponse::Ack),
            HostRequest::Launch { instance_id, params, transfer } => self
                .engine
                .launch(instance_id, params, transfer)
                .await
                .map(HostResponse::Instance),
            HostRequest::Migrate { instance_id, destination } => self
                .engine
                .migrate(instance_id, &destination)
                .await
                .map(|()| HostResponse::Ack),
            HostRequest::Export { instance_id, artifact_id } => self
                .engine
                .export(instance_id, artifact_id)
                .await
                .map(|()| HostResponse::Ack),
            HostRequest::Import { instance_id, artifact_id } => self
                .engine
                .import(instance_id, artifact_id)
                .await
                .map(|()| HostResponse::Ack),
            HostRequest::PrepareNetwork { instance_id } => self
                .engine
                .prepare_network(instance_id)
                .await
                .map(|()| HostResponse::Ack),
            HostRequest::ReleaseNetwork { instance_id } => self
                .engine
                .release_network(instance_id)
                .await
                .map(|()| HostResponse::Ack),
            HostRequest::TeardownMigration { instance_id, transfer } => self
                .engine
                .teardown_migration(instance_id, &transfer)
                .await
                .map(|()| HostResponse::Ack),
        };
        if let Err(err) = &result {
            warn!(log, "request failed"; "error" => %err);
        }
        result
    }
}
