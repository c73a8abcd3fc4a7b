//! `POST /v1/controller/publish` and `POST /v1/controller/unpublish`.

use std::sync::Arc;

use rocket::serde::json::{json, Json, Value};
use rocket::{post, State};

use crate::arbiter::{Arbiter, PublishRequest};
use crate::config::ArbiterConfig;
use crate::params::parse_migration_timeout_seconds;
use crate::types::{NodeId, ProvisionContext, VolumeId};

use super::dto::{ControllerPublishRequestDto, ControllerUnpublishRequestDto};
use super::{error_response, ApiResult};

#[post("/v1/controller/publish", format = "json", data = "<request>")]
pub async fn controller_publish(
    arbiter: &State<Arc<Arbiter>>,
    config: &State<Arc<ArbiterConfig>>,
    request: Json<ControllerPublishRequestDto>,
) -> ApiResult<Value> {
    let request = request.into_inner();
    let migration_timeout_secs = parse_migration_timeout_seconds(
        request.provision_context.migration_timeout_seconds.as_deref(),
        config.inner().as_ref(),
    );

    let publish_request = PublishRequest {
        volume_id: VolumeId::from(request.volume_id),
        node_id: NodeId::from(request.node_id),
        access_mode: request.access_mode,
        provision_context: ProvisionContext {
            fabric: request.provision_context.fabric(),
            fs_type: request.provision_context.fs_type,
            migration_timeout_secs,
        },
    };

    match arbiter.controller_publish_volume(publish_request).await {
        Ok(publish_context) => Ok(Json(json!({ "publish_context": publish_context.0 }))),
        Err(e) => Err(error_response(e)),
    }
}

#[post("/v1/controller/unpublish", format = "json", data = "<request>")]
pub async fn controller_unpublish(
    arbiter: &State<Arc<Arbiter>>,
    request: Json<ControllerUnpublishRequestDto>,
) -> ApiResult<Value> {
    let request = request.into_inner();
    match arbiter
        .controller_unpublish_volume(VolumeId::from(request.volume_id), NodeId::from(request.node_id))
        .await
    {
        Ok(()) => Ok(Json(json!({ "status": "ok" }))),
        Err(e) => Err(error_response(e)),
    }
}
