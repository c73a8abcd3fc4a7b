//! `POST /v1/node/stage` and `POST /v1/node/unstage`: the node-local half
//! of attach/detach, consulted after the controller side has already
//! granted or revoked a publish. Outside the arbiter's hard problem, but
//! exposed here so the crate is a runnable end-to-end service.

use std::sync::Arc;

use rocket::serde::json::{json, Json, Value};
use rocket::{post, State};

use crate::errors::ArbiterError;
use crate::fabric::{teardown, FabricClient};
use crate::interlock::DeviceBusyInterlock;
use crate::staging::StagingClient;
use crate::types::VolumeId;

use super::dto::{NodeStageRequestDto, NodeUnstageRequestDto};
use super::{error_response, ApiResult};

/// Bundles the node-local collaborators the stage/unstage handlers need,
/// analogous to the `Arbiter` bundling the controller-side ones.
pub struct NodeService {
    pub staging: Arc<dyn StagingClient>,
    pub fabric: Arc<dyn FabricClient>,
    pub interlock: Arc<DeviceBusyInterlock>,
}

#[post("/v1/node/stage", format = "json", data = "<request>")]
pub async fn node_stage(
    node: &State<Arc<NodeService>>,
    request: Json<NodeStageRequestDto>,
) -> ApiResult<Value> {
    let request = request.into_inner();
    let endpoint = request.fabric();

    let device_path = match node.fabric.connect(&endpoint).await {
        Ok(path) => path,
        Err(e) => return Err(error_response(e)),
    };
    match node
        .staging
        .mount(&device_path, &request.mount_path, &request.fs_type)
        .await
    {
        Ok(()) => Ok(Json(json!({ "device_path": device_path }))),
        Err(e) => Err(error_response(e)),
    }
}

#[post("/v1/node/unstage", format = "json", data = "<request>")]
pub async fn node_unstage(
    node: &State<Arc<NodeService>>,
    request: Json<NodeUnstageRequestDto>,
) -> ApiResult<Value> {
    let request = request.into_inner();
    let endpoint = request.fabric();

    let result: Result<(), ArbiterError> = teardown(
        node.staging.as_ref(),
        node.fabric.as_ref(),
        &node.interlock,
        &VolumeId::from(request.volume_id.clone()),
        &endpoint,
        &request.mount_path,
    )
    .await;

    match result {
        Ok(()) => Ok(Json(json!({ "status": "ok" }))),
        Err(e) => Err(error_response(e)),
    }
}
