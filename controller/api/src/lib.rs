// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use cowvm_common::api::{
    ArtifactId, HostName, InstanceData, InstanceRecord, InstanceSpec,
    LaunchParams, LifecycleState,
};
use dropshot::{
    HttpError, HttpResponseCreated, HttpResponseOk,
    HttpResponseUpdatedNoContent, Path, RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[dropshot::api_description]
pub trait ControllerApi {
    type Context;

    /// Create a plain running instance on a host running the service.
    #[endpoint {
        method = POST,
        path = "/instances",
    }]
    async fn instance_create(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<InstanceCreateParams>,
    ) -> Result<HttpResponseCreated<InstanceView>, HttpError>;

    /// Fetch the current state of an instance.
    #[endpoint {
        method = GET,
        path = "/instances/{instance_id}",
    }]
    async fn instance_view(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseOk<InstanceView>, HttpError>;

    /// Freeze a running instance into a new template.
    ///
    /// Returns the template record, which stays `building` until the
    /// instance's host has finished.
    #[endpoint {
        method = POST,
        path = "/instances/{instance_id}/bless",
    }]
    async fn instance_bless(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseCreated<InstanceView>, HttpError>;

    /// Retire a template that no launched instance refers to.
    #[endpoint {
        method = POST,
        path = "/instances/{instance_id}/discard",
    }]
    async fn instance_discard(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Launch a new instance from a template.
    #[endpoint {
        method = POST,
        path = "/instances/{instance_id}/launch",
    }]
    async fn instance_launch(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
        body: TypedBody<LaunchParams>,
    ) -> Result<HttpResponseCreated<InstanceView>, HttpError>;

    /// Move a running instance to another host.
    #[endpoint {
        method = POST,
        path = "/instances/{instance_id}/migrate",
    }]
    async fn instance_migrate(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
        body: TypedBody<InstanceMigrateParams>,
    ) -> Result<HttpResponseOk<InstanceView>, HttpError>;

    /// List the instances launched from a template.
    #[endpoint {
        method = GET,
        path = "/instances/{instance_id}/launched",
    }]
    async fn instance_list_launched(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseOk<Vec<InstanceView>>, HttpError>;

    /// List the templates blessed from an instance.
    #[endpoint {
        method = GET,
        path = "/instances/{instance_id}/blessed",
    }]
    async fn instance_list_blessed(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseOk<Vec<InstanceView>>, HttpError>;

    /// Export a template into a new artifact.
    #[endpoint {
        method = POST,
        path = "/instances/{instance_id}/export",
    }]
    async fn instance_export(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseOk<ExportedInstance>, HttpError>;

    /// Recreate a template from an earlier export.
    #[endpoint {
        method = POST,
        path = "/import",
    }]
    async fn instance_import(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<InstanceImportParams>,
    ) -> Result<HttpResponseCreated<InstanceView>, HttpError>;
}

#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, Serialize)]
pub struct InstancePathParam {
    pub instance_id: Uuid,
}

/// An instance record together with the lifecycle state derived from it.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct InstanceView {
    pub lifecycle_state: LifecycleState,
    #[serde(flatten)]
    pub record: InstanceRecord,
}

impl From<InstanceRecord> for InstanceView {
    fn from(record: InstanceRecord) -> InstanceView {
        InstanceView { lifecycle_state: record.lifecycle_state(), record }
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct InstanceCreateParams {
    pub project_id: Uuid,
    #[serde(flatten)]
    pub spec: InstanceSpec,
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Host to boot on; a random host running the service when unset.
    #[serde(default)]
    pub target_host: Option<HostName>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct InstanceMigrateParams {
    /// Destination host; a random eligible host when unset.
    #[serde(default)]
    pub dest: Option<HostName>,
}

/// What an export hands back: the portable record and the artifact the
/// host is writing the template into.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ExportedInstance {
    pub instance_data: InstanceData,
    pub artifact_id: ArtifactId,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct InstanceImportParams {
    pub project_id: Uuid,
    pub instance_data: InstanceData,
    /// Display name of the recreated template.
    pub name: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
    pub artifact_id: ArtifactId,
}
