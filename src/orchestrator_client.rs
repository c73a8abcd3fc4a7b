//! Orchestrator existence checks: "does this node still exist". Modeled
//! as an `async_trait` capability interface so the arbiter's decision
//! logic stays independent of a swappable cloud/test implementation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::{ArbiterError, ArbiterResult};
use crate::types::NodeId;

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Returns whether `node_id` still exists as an orchestrator-known
    /// node. Must fail closed (`Err`) rather than guess on transport
    /// errors — publish's self-heal path treats a failure here as
    /// `Internal`, never as "node is gone".
    async fn node_exists(&self, node_id: &NodeId) -> ArbiterResult<bool>;
}

/// A fake orchestrator used by tests and local tooling: nodes are
/// "alive" unless explicitly marked deleted.
#[derive(Default)]
pub struct FakeOrchestratorClient {
    deleted: RwLock<HashSet<NodeId>>,
    fail_next: RwLock<bool>,
}

impl FakeOrchestratorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_deleted(&self, node_id: &NodeId) {
        self.deleted.write().insert(node_id.clone());
    }

    pub fn mark_alive(&self, node_id: &NodeId) {
        self.deleted.write().remove(node_id);
    }

    /// Causes the next `node_exists` call to fail with `Internal`,
    /// simulating an orchestrator API outage for the fail-closed tests.
    pub fn fail_next_check(&self) {
        *self.fail_next.write() = true;
    }
}

#[async_trait]
impl OrchestratorClient for FakeOrchestratorClient {
    async fn node_exists(&self, node_id: &NodeId) -> ArbiterResult<bool> {
        if std::mem::take(&mut *self.fail_next.write()) {
            return Err(ArbiterError::Internal(
                "simulated orchestrator API outage".to_string(),
            ));
        }
        Ok(!self.deleted.read().contains(node_id))
    }
}

pub fn fake() -> Arc<dyn OrchestratorClient> {
    Arc::new(FakeOrchestratorClient::new())
}

/// A `reqwest`-backed client talking to the orchestrator's node API,
/// exposing `GET /nodes/{id}` with a 404 meaning "node does not exist".
/// Any other non-success status or transport failure is surfaced as
/// `Internal` rather than guessed at, matching [`OrchestratorClient`]'s
/// fail-closed contract.
pub struct HttpOrchestratorClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOrchestratorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn node_url(&self, node_id: &NodeId) -> String {
        format!("{}/nodes/{}", self.base_url, node_id)
    }
}

#[async_trait]
impl OrchestratorClient for HttpOrchestratorClient {
    async fn node_exists(&self, node_id: &NodeId) -> ArbiterResult<bool> {
        let resp = self
            .client
            .get(self.node_url(node_id))
            .send()
            .await
            .map_err(|e| ArbiterError::Internal(format!("orchestrator node lookup failed: {e}")))?;

        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(ArbiterError::Internal(format!(
                "orchestrator node lookup for {node_id} rejected with status {status}"
            ))),
        }
    }
}

pub fn http(base_url: impl Into<String>) -> Arc<dyn OrchestratorClient> {
    Arc::new(HttpOrchestratorClient::new(base_url))
}
