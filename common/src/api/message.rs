// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages exchanged between the controller and host agents.

use super::{ArtifactId, HostName, InstanceRecord, LaunchParams, TransferEndpoint};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A lifecycle request delivered to a host agent.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, strum::Display)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HostRequest {
    /// Bless the template record `instance_id`, whose `blessed_from` tag
    /// names the running instance to freeze.
    Bless { instance_id: Uuid },
    Discard { instance_id: Uuid },
    /// Launch `instance_id`. With a transfer endpoint this is the receiving
    /// side of a migration and completes only once the instance runs here.
    Launch {
        instance_id: Uuid,
        params: LaunchParams,
        transfer: Option<TransferEndpoint>,
    },
    Migrate { instance_id: Uuid, destination: HostName },
    Export { instance_id: Uuid, artifact_id: ArtifactId },
    Import { instance_id: Uuid, artifact_id: ArtifactId },
    /// Plug networking for an instance about to be received by this host.
    PrepareNetwork { instance_id: Uuid },
    /// Unplug networking for an instance on this host.
    ReleaseNetwork { instance_id: Uuid },
    /// Remove an instance this host received from `transfer` whose source
    /// is rolling the migration back.
    TeardownMigration { instance_id: Uuid, transfer: TransferEndpoint },
}

impl HostRequest {
    pub fn instance_id(&self) -> Uuid {
        match self {
            HostRequest::Bless { instance_id }
            | HostRequest::Discard { instance_id }
            | HostRequest::Launch { instance_id, .. }
            | HostRequest::Migrate { instance_id, .. }
            | HostRequest::Export { instance_id, .. }
            | HostRequest::Import { instance_id, .. }
            | HostRequest::PrepareNetwork { instance_id }
            | HostRequest::ReleaseNetwork { instance_id }
            | HostRequest::TeardownMigration { instance_id, .. } => {
                *instance_id
            }
        }
    }
}

/// What a host agent answers to a blocking call.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HostResponse {
    Ack,
    Instance(InstanceRecord),
}
