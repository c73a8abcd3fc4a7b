//! Attachment State Store: the authoritative in-memory map from volume
//! id to `AttachmentState`, with a persistence overlay used purely for
//! restart recovery.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, warn};
use parking_lot::RwLock;

use crate::errors::{ArbiterError, ArbiterResult};
use crate::persistence::{from_annotations, to_annotations, PersistenceBackend};
use crate::types::{AttachmentState, VolumeId};

/// The authoritative in-memory attachment map. Reads are lock-free
/// snapshots (`get`/`list` clone out of the map); every mutation is
/// expected to run under the caller's [`crate::lock_registry::VolumeLockRegistry`]
/// volume lock, which this store does not itself acquire — it only
/// guards its own map integrity.
pub struct AttachmentStateStore {
    states: RwLock<HashMap<VolumeId, AttachmentState>>,
    persistence: Arc<dyn PersistenceBackend>,
}

impl AttachmentStateStore {
    pub fn new(persistence: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            persistence,
        }
    }

    /// O(1) snapshot read.
    pub fn get(&self, volume_id: &VolumeId) -> Option<AttachmentState> {
        self.states.read().get(volume_id).cloned()
    }

    /// A consistent shallow copy of every tracked volume, for the
    /// reconciler.
    pub fn list(&self) -> Vec<AttachmentState> {
        self.states.read().values().cloned().collect()
    }

    /// Apply `mutator` to the current state (or `None` if absent),
    /// persist the result, and only then commit it in memory. On
    /// persistence failure the in-memory map is left untouched and the
    /// call fails with `Internal` — callers must not assume a partial
    /// mutation ever became visible.
    ///
    /// Must be called from inside the caller's volume lock.
    pub async fn upsert<F>(&self, volume_id: &VolumeId, mutator: F) -> ArbiterResult<AttachmentState>
    where
        F: FnOnce(Option<AttachmentState>) -> ArbiterResult<AttachmentState>,
    {
        let before = self.get(volume_id);
        let after = mutator(before)?;
        after
            .check_invariants()
            .map_err(ArbiterError::Internal)?;

        let to_persist = after.clone();
        let persist_result = self
            .persistence
            .read_modify_write(volume_id, &move |_current| to_annotations(&to_persist))
            .await;

        match persist_result {
            Ok(()) => {
                self.states.write().insert(volume_id.clone(), after.clone());
                Ok(after)
            }
            Err(e) => {
                error!("persistence failed for volume {volume_id}, rolling back in-memory mutation: {e}");
                Err(e)
            }
        }
    }

    /// Deletes the in-memory entry and clears the persisted annotation.
    /// Persistence failures here are logged, not surfaced: both the
    /// unpublish path and the reconciler treat this as best-effort and
    /// rely on the reconciler for eventual convergence.
    pub async fn remove(&self, volume_id: &VolumeId) {
        self.states.write().remove(volume_id);
        if let Err(e) = self.persistence.clear(volume_id).await {
            warn!("failed to clear persisted annotations for volume {volume_id}: {e}");
        }
    }

    /// Rebuilds in-memory state by enumerating the orchestrator's
    /// persisted volume annotations. Called once at arbiter startup.
    pub async fn rebuild_from_persistence(&self) -> ArbiterResult<usize> {
        let volume_ids = self.persistence.list_volume_ids().await?;
        let mut rebuilt = HashMap::new();
        for volume_id in volume_ids {
            match self.persistence.read(&volume_id).await {
                Ok(Some(annotations)) => {
                    if let Some(state) = from_annotations(&volume_id, &annotations) {
                        if state.check_invariants().is_ok() {
                            rebuilt.insert(volume_id, state);
                        } else {
                            warn!("skipping volume {volume_id} on restart: persisted state violates invariants");
                        }
                    } else {
                        warn!("skipping volume {volume_id} on restart: malformed annotations");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("failed to read persisted annotations for volume {volume_id} during restart: {e}");
                }
            }
        }
        let restored = rebuilt.len();
        *self.states.write() = rebuilt;
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryBackend;
    use crate::types::{AccessMode, NodeId};
    use chrono::Utc;

    fn store() -> AttachmentStateStore {
        AttachmentStateStore::new(Arc::new(InMemoryBackend::new()))
    }

    #[tokio::test]
    async fn upsert_creates_and_reads_back_state() {
        let store = store();
        let volume = VolumeId::from("v1");
        let now = Utc::now();

        let created = store
            .upsert(&volume, |existing| {
                assert!(existing.is_none());
                Ok(AttachmentState::single(
                    volume.clone(),
                    NodeId::from("n1"),
                    AccessMode::SingleNodeWriter,
                    300,
                    now,
                ))
            })
            .await
            .unwrap();

        assert_eq!(created.nodes.len(), 1);
        let fetched = store.get(&volume).unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn upsert_rejects_states_that_violate_invariants() {
        let store = store();
        let volume = VolumeId::from("v1");
        let now = Utc::now();

        let result = store
            .upsert(&volume, |_existing| {
                let mut state = AttachmentState::single(
                    volume.clone(),
                    NodeId::from("n1"),
                    AccessMode::SingleNodeWriter,
                    300,
                    now,
                );
                state.nodes.push(crate::types::NodeAttachment {
                    node_id: NodeId::from("n2"),
                    attached_at: now,
                });
                Ok(state)
            })
            .await;

        assert!(result.is_err());
        assert!(store.get(&volume).is_none());
    }

    #[tokio::test]
    async fn remove_clears_in_memory_and_persisted_state() {
        let store = store();
        let volume = VolumeId::from("v1");
        let now = Utc::now();
        store
            .upsert(&volume, |_| {
                Ok(AttachmentState::single(
                    volume.clone(),
                    NodeId::from("n1"),
                    AccessMode::SingleNodeWriter,
                    300,
                    now,
                ))
            })
            .await
            .unwrap();

        store.remove(&volume).await;
        assert!(store.get(&volume).is_none());
    }

    #[tokio::test]
    async fn rebuild_from_persistence_restores_prior_snapshot() {
        let backend = Arc::new(InMemoryBackend::new());
        let volume = VolumeId::from("v1");
        let now = Utc::now();

        {
            let store = AttachmentStateStore::new(backend.clone());
            store
                .upsert(&volume, |_| {
                    Ok(AttachmentState::single(
                        volume.clone(),
                        NodeId::from("n1"),
                        AccessMode::SingleNodeWriter,
                        300,
                        now,
                    ))
                })
                .await
                .unwrap();
        }

        let restarted = AttachmentStateStore::new(backend);
        let restored = restarted.rebuild_from_persistence().await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(restarted.get(&volume).unwrap().nodes[0].node_id, NodeId::from("n1"));
    }

    #[tokio::test]
    async fn list_returns_a_shallow_copy_of_every_volume() {
        let store = store();
        let now = Utc::now();
        for i in 0..3 {
            let volume = VolumeId::from(format!("v{i}"));
            store
                .upsert(&volume, |_| {
                    Ok(AttachmentState::single(
                        volume.clone(),
                        NodeId::from("n1"),
                        AccessMode::SingleNodeWriter,
                        300,
                        now,
                    ))
                })
                .await
                .unwrap();
        }
        assert_eq!(store.list().len(), 3);
    }
}
