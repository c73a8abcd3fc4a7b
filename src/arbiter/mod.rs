//! The Arbiter: the publish/unpublish core that decides accept/reject/
//! handoff for attach/detach requests. This module only wires the
//! collaborators together; the decision logic lives in `publish` and
//! `unpublish`.

mod publish;
mod unpublish;

pub use publish::{PublishRequest, PublishRequestValidationError};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ArbiterConfig;
use crate::errors::ArbiterResult;
use crate::events::EventSink;
use crate::lock_registry::VolumeLockRegistry;
use crate::orchestrator_client::OrchestratorClient;
use crate::remote_store_client::RemoteStoreClient;
use crate::state_store::AttachmentStateStore;
use crate::types::{NodeId, PublishContext, VolumeId};

pub struct Arbiter {
    pub(crate) config: Arc<ArbiterConfig>,
    pub(crate) locks: Arc<VolumeLockRegistry>,
    pub(crate) store: Arc<AttachmentStateStore>,
    pub(crate) orchestrator: Arc<dyn OrchestratorClient>,
    pub(crate) remote_store: Arc<dyn RemoteStoreClient>,
    pub(crate) events: Arc<dyn EventSink>,
}

impl Arbiter {
    pub fn new(
        config: Arc<ArbiterConfig>,
        locks: Arc<VolumeLockRegistry>,
        store: Arc<AttachmentStateStore>,
        orchestrator: Arc<dyn OrchestratorClient>,
        remote_store: Arc<dyn RemoteStoreClient>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            locks,
            store,
            orchestrator,
            remote_store,
            events,
        }
    }

    pub async fn controller_publish_volume(
        &self,
        request: PublishRequest,
    ) -> ArbiterResult<PublishContext> {
        self.controller_publish_volume_at(request, Utc::now()).await
    }

    pub async fn controller_publish_volume_at(
        &self,
        request: PublishRequest,
        now: DateTime<Utc>,
    ) -> ArbiterResult<PublishContext> {
        publish::publish(self, request, now).await
    }

    pub async fn controller_unpublish_volume(
        &self,
        volume_id: VolumeId,
        node_id: NodeId,
    ) -> ArbiterResult<()> {
        self.controller_unpublish_volume_at(volume_id, node_id, Utc::now())
            .await
    }

    pub async fn controller_unpublish_volume_at(
        &self,
        volume_id: VolumeId,
        node_id: NodeId,
        now: DateTime<Utc>,
    ) -> ArbiterResult<()> {
        unpublish::unpublish(self, volume_id, node_id, now).await
    }

    pub fn store(&self) -> &Arc<AttachmentStateStore> {
        &self.store
    }
}
