// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoint functions for the request gateway

use crate::ServerContext;
use cowvm_common::api::LaunchParams;
use cowvm_controller_api::*;
use dropshot::ApiDescription;
use dropshot::HttpError;
use dropshot::HttpResponseCreated;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::Path;
use dropshot::RequestContext;
use dropshot::TypedBody;
use std::sync::Arc;

type ControllerApiDescription = ApiDescription<Arc<ServerContext>>;

/// Returns a description of the controller API
pub fn api() -> ControllerApiDescription {
    controller_api_mod::api_description::<ControllerImpl>()
        .expect("registered entrypoints")
}

enum ControllerImpl {}

impl ControllerApi for ControllerImpl {
    type Context = Arc<ServerContext>;

    async fn instance_create(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<InstanceCreateParams>,
    ) -> Result<HttpResponseCreated<InstanceView>, HttpError> {
        let controller = &rqctx.context().controller;
        let record = controller.instance_create(body.into_inner()).await?;
        Ok(HttpResponseCreated(record.into()))
    }

    async fn instance_view(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseOk<InstanceView>, HttpError> {
        let controller = &rqctx.context().controller;
        let path = path_params.into_inner();
        let record = controller.instance_fetch(path.instance_id).await?;
        Ok(HttpResponseOk(record.into()))
    }

    async fn instance_bless(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseCreated<InstanceView>, HttpError> {
        let controller = &rqctx.context().controller;
        let path = path_params.into_inner();
        let template = controller.instance_bless(path.instance_id).await?;
        Ok(HttpResponseCreated(template.into()))
    }

    async fn instance_discard(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let controller = &rqctx.context().controller;
        let path = path_params.into_inner();
        controller.instance_discard(path.instance_id).await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn instance_launch(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
        body: TypedBody<LaunchParams>,
    ) -> Result<HttpResponseCreated<InstanceView>, HttpError> {
        let controller = &rqctx.context().controller;
        let path = path_params.into_inner();
        let record = controller
            .instance_launch(path.instance_id, body.into_inner())
            .await?;
        Ok(HttpResponseCreated(record.into()))
    }

    async fn instance_migrate(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
        body: TypedBody<InstanceMigrateParams>,
    ) -> Result<HttpResponseOk<InstanceView>, HttpError> {
        let controller = &rqctx.context().controller;
        let path = path_params.into_inner();
        let record = controller
            .instance_migrate(path.instance_id, body.into_inner().dest)
            .await?;
        Ok(HttpResponseOk(record.into()))
    }

    async fn instance_list_launched(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseOk<Vec<InstanceView>>, HttpError> {
        let controller = &rqctx.context().controller;
        let path = path_params.into_inner();
        let records =
            controller.instance_list_launched(path.instance_id).await?;
        Ok(HttpResponseOk(records.into_iter().map(InstanceView::from).collect()))
    }

    async fn instance_list_blessed(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseOk<Vec<InstanceView>>, HttpError> {
        let controller = &rqctx.context().controller;
        let path = path_params.into_inner();
        let records =
            controller.instance_list_blessed(path.instance_id).await?;
        Ok(HttpResponseOk(records.into_iter().map(InstanceView::from).collect()))
    }

    async fn instance_export(
        rqctx: RequestContext<Self::Context>,
        path_params: Path<InstancePathParam>,
    ) -> Result<HttpResponseOk<ExportedInstance>, HttpError> {
        let controller = &rqctx.context().controller;
        let path = path_params.into_inner();
        let exported = controller.instance_export(path.instance_id).await?;
        Ok(HttpResponseOk(exported))
    }

    async fn instance_import(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<InstanceImportParams>,
    ) -> Result<HttpResponseCreated<InstanceView>, HttpError> {
        let controller = &rqctx.context().controller;
        let record = controller.instance_import(body.into_inner()).await?;
        Ok(HttpResponseCreated(record.into()))
    }
}

