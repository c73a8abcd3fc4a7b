//! Persistence overlay: read-modify-write against the orchestrator's
//! volume-object annotations, with retry on optimistic-concurrency
//! conflict.
//!
//! The in-memory [`crate::state_store::AttachmentStateStore`] is the
//! source of truth for live decisions; this module is the durability
//! overlay used to recover on restart. A mutation is applied in-memory
//! only after persistence succeeds, or is rolled back on final failure —
//! callers own that rollback, this module only owns the retry loop.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use rand::Rng;

use crate::errors::{ArbiterError, ArbiterResult};
use crate::types::{AccessMode, AttachmentState, NodeAttachment, NodeId, VolumeId};

/// A single annotation set. Stored as plain strings because the
/// orchestrator's annotation API is string-keyed/string-valued.
pub type AnnotationSet = HashMap<String, String>;

const PREFIX: &str = "fabric-arbiter.example.com";

/// Marshal an [`AttachmentState`] into its annotation representation.
pub fn to_annotations(state: &AttachmentState) -> AnnotationSet {
    let mut out = AnnotationSet::new();
    for (i, node) in state.nodes.iter().enumerate() {
        out.insert(format!("{PREFIX}/node.{i}"), node.node_id.0.clone());
        out.insert(
            format!("{PREFIX}/attachedAt.{i}"),
            node.attached_at.to_rfc3339(),
        );
    }
    out.insert(
        format!("{PREFIX}/accessMode"),
        format!("{:?}", state.access_mode),
    );
    out.insert(format!("{PREFIX}/createdAt"), state.created_at.to_rfc3339());
    if let Some(detached_at) = state.detached_at {
        out.insert(format!("{PREFIX}/detachedAt"), detached_at.to_rfc3339());
    }
    if let Some(migration_started_at) = state.migration_started_at {
        out.insert(
            format!("{PREFIX}/migrationStartedAt"),
            migration_started_at.to_rfc3339(),
        );
    }
    out.insert(
        format!("{PREFIX}/migrationTimeout"),
        state.migration_timeout_secs.to_string(),
    );
    out
}

/// Unmarshal an annotation set back into an [`AttachmentState`]. Returns
/// `None` if the annotations don't describe a volume at all (nothing
/// persisted yet).
pub fn from_annotations(volume_id: &VolumeId, ann: &AnnotationSet) -> Option<AttachmentState> {
    let created_at = parse_ts(ann.get(&format!("{PREFIX}/createdAt"))?)?;
    let access_mode = match ann.get(&format!("{PREFIX}/accessMode"))?.as_str() {
        "SingleNodeWriter" => AccessMode::SingleNodeWriter,
        "SingleNodeReader" => AccessMode::SingleNodeReader,
        "MultiNodeMultiWriter" => AccessMode::MultiNodeMultiWriter,
        _ => return None,
    };

    let mut nodes = Vec::new();
    for i in 0.. {
        let Some(node_id) = ann.get(&format!("{PREFIX}/node.{i}")) else {
            break;
        };
        let attached_at = ann
            .get(&format!("{PREFIX}/attachedAt.{i}"))
            .and_then(|v| parse_ts(v))?;
        nodes.push(NodeAttachment {
            node_id: NodeId(node_id.clone()),
            attached_at,
        });
    }

    let detached_at = ann
        .get(&format!("{PREFIX}/detachedAt"))
        .and_then(|v| parse_ts(v));
    let migration_started_at = ann
        .get(&format!("{PREFIX}/migrationStartedAt"))
        .and_then(|v| parse_ts(v));
    let migration_timeout_secs = ann
        .get(&format!("{PREFIX}/migrationTimeout"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(300);

    Some(AttachmentState {
        volume_id: volume_id.clone(),
        nodes,
        access_mode,
        created_at,
        detached_at,
        migration_started_at,
        migration_timeout_secs,
    })
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Capability interface for the orchestrator's annotation store.
/// Implementors provide their own optimistic-concurrency primitive (an
/// etag, resource version, ...); this trait only needs read/write/delete
/// plus a bounded retry loop around conflicting writes.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Read the current annotation set for a volume, if the volume object
    /// exists at all.
    async fn read(&self, volume_id: &VolumeId) -> ArbiterResult<Option<AnnotationSet>>;

    /// Read-modify-write: read the current annotations, apply `mutator`,
    /// write them back. Retries internally on optimistic-concurrency
    /// conflicts with capped exponential backoff; a final failure surfaces
    /// [`ArbiterError::Internal`].
    async fn read_modify_write(
        &self,
        volume_id: &VolumeId,
        mutator: &(dyn Fn(Option<AnnotationSet>) -> AnnotationSet + Send + Sync),
    ) -> ArbiterResult<()>;

    /// Clear the persisted annotations entirely.
    async fn clear(&self, volume_id: &VolumeId) -> ArbiterResult<()>;

    /// Enumerate every volume id currently carrying annotations, for
    /// startup rebuild.
    async fn list_volume_ids(&self) -> ArbiterResult<Vec<VolumeId>>;
}

/// Retry policy for `read_modify_write`, capped exponential backoff with
/// jitter to avoid synchronized retries across many volumes.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::rng().random_range(0.8..1.2);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// An in-process, conflict-free backend used for tests and as the startup
/// default before a real orchestrator endpoint is wired in. A conflict
/// can never occur here since access is serialized by `parking_lot`, but
/// the retry path is still exercised by [`ConflictInjectingBackend`] in
/// tests.
#[derive(Default)]
pub struct InMemoryBackend {
    data: parking_lot::Mutex<HashMap<VolumeId, AnnotationSet>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn read(&self, volume_id: &VolumeId) -> ArbiterResult<Option<AnnotationSet>> {
        Ok(self.data.lock().get(volume_id).cloned())
    }

    async fn read_modify_write(
        &self,
        volume_id: &VolumeId,
        mutator: &(dyn Fn(Option<AnnotationSet>) -> AnnotationSet + Send + Sync),
    ) -> ArbiterResult<()> {
        let mut data = self.data.lock();
        let current = data.get(volume_id).cloned();
        let next = mutator(current);
        data.insert(volume_id.clone(), next);
        Ok(())
    }

    async fn clear(&self, volume_id: &VolumeId) -> ArbiterResult<()> {
        self.data.lock().remove(volume_id);
        Ok(())
    }

    async fn list_volume_ids(&self) -> ArbiterResult<Vec<VolumeId>> {
        Ok(self.data.lock().keys().cloned().collect())
    }
}

/// A `reqwest`-backed backend that talks to a real orchestrator API
/// exposing `GET/PUT /volumes/{id}/annotations` with an `ETag` /
/// `If-Match` optimistic-concurrency contract. The exact orchestrator
/// wire format is an implementation detail behind this trait.
pub struct OrchestratorHttpBackend {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffConfig,
}

impl OrchestratorHttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            backoff: BackoffConfig::default(),
        }
    }

    fn annotations_url(&self, volume_id: &VolumeId) -> String {
        format!("{}/volumes/{}/annotations", self.base_url, volume_id)
    }
}

#[async_trait]
impl PersistenceBackend for OrchestratorHttpBackend {
    async fn read(&self, volume_id: &VolumeId) -> ArbiterResult<Option<AnnotationSet>> {
        let resp = self
            .client
            .get(self.annotations_url(volume_id))
            .send()
            .await
            .map_err(|e| ArbiterError::Internal(format!("persistence read failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let annotations = resp
            .json::<AnnotationSet>()
            .await
            .map_err(|e| ArbiterError::Internal(format!("malformed annotation response: {e}")))?;
        Ok(Some(annotations))
    }

    async fn read_modify_write(
        &self,
        volume_id: &VolumeId,
        mutator: &(dyn Fn(Option<AnnotationSet>) -> AnnotationSet + Send + Sync),
    ) -> ArbiterResult<()> {
        for attempt in 0..self.backoff.max_attempts {
            let current = self.read(volume_id).await?;
            let next = mutator(current.clone());

            let etag = current
                .as_ref()
                .and_then(|a| a.get("__etag"))
                .cloned()
                .unwrap_or_default();

            let resp = self
                .client
                .put(self.annotations_url(volume_id))
                .header("If-Match", etag)
                .json(&next)
                .send()
                .await
                .map_err(|e| ArbiterError::Internal(format!("persistence write failed: {e}")))?;

            if resp.status().is_success() {
                return Ok(());
            }
            if resp.status() == reqwest::StatusCode::CONFLICT {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(
                    "optimistic-concurrency conflict persisting volume {volume_id}, retrying in {delay:?} (attempt {attempt})"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(ArbiterError::Internal(format!(
                "persistence write rejected with status {}",
                resp.status()
            )));
        }
        Err(ArbiterError::Internal(format!(
            "persistence write for volume {volume_id} did not converge after {} attempts",
            self.backoff.max_attempts
        )))
    }

    async fn clear(&self, volume_id: &VolumeId) -> ArbiterResult<()> {
        let resp = self
            .client
            .delete(self.annotations_url(volume_id))
            .send()
            .await
            .map_err(|e| ArbiterError::Internal(format!("persistence clear failed: {e}")))?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ArbiterError::Internal(format!(
                "persistence clear rejected with status {}",
                resp.status()
            )))
        }
    }

    async fn list_volume_ids(&self) -> ArbiterResult<Vec<VolumeId>> {
        let resp = self
            .client
            .get(format!("{}/volumes", self.base_url))
            .send()
            .await
            .map_err(|e| ArbiterError::Internal(format!("persistence list failed: {e}")))?;
        let ids: Vec<String> = resp
            .json()
            .await
            .map_err(|e| ArbiterError::Internal(format!("malformed volume list: {e}")))?;
        Ok(ids.into_iter().map(VolumeId).collect())
    }
}
