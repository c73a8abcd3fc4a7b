//! `ControllerPublishVolume`: decides accept, reject, self-heal, or
//! migration-handoff for an attach request. Every branch runs inside the
//! volume's lock so the read-decide-write sequence is atomic with respect
//! to any concurrent publish/unpublish on the same volume.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::Arbiter;
use crate::errors::{ArbiterError, ArbiterResult};
use crate::events::Event;
use crate::types::{AccessMode, NodeAttachment, AttachmentState, NodeId, ProvisionContext, PublishContext, VolumeId};

/// A would-be attach, as built by the outward RPC adapter from a
/// `ControllerPublishVolumeRequest`.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub volume_id: VolumeId,
    pub node_id: NodeId,
    pub access_mode: AccessMode,
    pub provision_context: ProvisionContext,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishRequestValidationError {
    #[error("volume_id must not be empty")]
    EmptyVolumeId,
    #[error("node_id must not be empty")]
    EmptyNodeId,
}

impl From<PublishRequestValidationError> for ArbiterError {
    fn from(e: PublishRequestValidationError) -> Self {
        ArbiterError::InvalidArgument(e.to_string())
    }
}

impl PublishRequest {
    fn validate(&self) -> Result<(), PublishRequestValidationError> {
        if self.volume_id.0.trim().is_empty() {
            return Err(PublishRequestValidationError::EmptyVolumeId);
        }
        if self.node_id.0.trim().is_empty() {
            return Err(PublishRequestValidationError::EmptyNodeId);
        }
        Ok(())
    }
}

fn build_publish_context(provision_context: &ProvisionContext) -> PublishContext {
    PublishContext::new()
        .with("nvme_address", provision_context.fabric.nvme_address.clone())
        .with("nvme_port", provision_context.fabric.nvme_port.to_string())
        .with("nvme_nqn", provision_context.fabric.nvme_nqn.clone())
        .with("fs_type", provision_context.fs_type.clone())
        .with(
            "migration_timeout_seconds",
            provision_context.migration_timeout_secs.to_string(),
        )
}

pub(crate) async fn publish(
    arbiter: &Arbiter,
    request: PublishRequest,
    now: DateTime<Utc>,
) -> ArbiterResult<PublishContext> {
    request.validate()?;

    if !arbiter.remote_store.volume_exists(&request.volume_id).await? {
        return Err(ArbiterError::VolumeNotFound(request.volume_id));
    }

    let volume_id = request.volume_id.clone();
    arbiter
        .locks
        .try_with_volume_lock(&volume_id, || async { decide(arbiter, request, now).await })
        .await
}

async fn decide(
    arbiter: &Arbiter,
    request: PublishRequest,
    now: DateTime<Utc>,
) -> ArbiterResult<PublishContext> {
    let existing = arbiter.store.get(&request.volume_id);

    match existing {
        None => attach_fresh(arbiter, &request, now).await,
        Some(state) if state.is_empty() => attach_fresh(arbiter, &request, now).await,
        Some(state) if state.holds(&request.node_id) => {
            arbiter.events.record_metric("publish_idempotent");
            Ok(build_publish_context(&request.provision_context))
        }
        Some(state) if state.nodes.len() == 2 => reject_third_attach(arbiter, &request, &state, now),
        Some(state) => {
            if let Some((elapsed, bound)) = migration_timed_out(&state, now) {
                arbiter.events.record_metric("publish_migration_timed_out");
                return Err(ArbiterError::MigrationTimedOut {
                    volume: request.volume_id.clone(),
                    elapsed_secs: elapsed,
                    bound_secs: bound,
                });
            }
            handoff(arbiter, &request, state, now).await
        }
    }
}

/// Returns `Some((elapsed_secs, bound_secs))` when `state` is carrying a
/// migration that started more than `migration_timeout_secs` ago. A
/// timed-out migration is never extended by accepting a new attachment,
/// whether it currently holds one node or two.
fn migration_timed_out(state: &AttachmentState, now: DateTime<Utc>) -> Option<(i64, i64)> {
    let started = state.migration_started_at?;
    let elapsed = (now - started).num_seconds();
    let bound = state.migration_timeout_secs as i64;
    if elapsed > bound {
        Some((elapsed, bound))
    } else {
        None
    }
}

async fn attach_fresh(
    arbiter: &Arbiter,
    request: &PublishRequest,
    now: DateTime<Utc>,
) -> ArbiterResult<PublishContext> {
    let state = AttachmentState::single(
        request.volume_id.clone(),
        request.node_id.clone(),
        request.access_mode,
        request.provision_context.migration_timeout_secs,
        now,
    );
    arbiter.store.upsert(&request.volume_id, |_| Ok(state)).await?;
    arbiter.events.record_metric("publish_granted");
    Ok(build_publish_context(&request.provision_context))
}

fn reject_third_attach(
    arbiter: &Arbiter,
    request: &PublishRequest,
    state: &AttachmentState,
    now: DateTime<Utc>,
) -> ArbiterResult<PublishContext> {
    if let Some((elapsed, bound)) = migration_timed_out(state, now) {
        arbiter.events.record_metric("publish_migration_timed_out");
        return Err(ArbiterError::MigrationTimedOut {
            volume: request.volume_id.clone(),
            elapsed_secs: elapsed,
            bound_secs: bound,
        });
    }
    arbiter.events.record_metric("publish_migration_limit_exceeded");
    Err(ArbiterError::MigrationLimitExceeded {
        volume: request.volume_id.clone(),
    })
}

async fn handoff(
    arbiter: &Arbiter,
    request: &PublishRequest,
    state: AttachmentState,
    now: DateTime<Utc>,
) -> ArbiterResult<PublishContext> {
    let holder = state
        .primary()
        .expect("single-node state has a primary")
        .node_id
        .clone();

    let wants_migration = request.access_mode.is_migratable()
        && state.access_mode == AccessMode::MultiNodeMultiWriter
        && request.access_mode == AccessMode::MultiNodeMultiWriter;

    if wants_migration {
        return start_migration(arbiter, request, state, now).await;
    }

    match arbiter.orchestrator.node_exists(&holder).await {
        Err(e) => Err(e),
        Ok(true) => {
            arbiter.events.emit(Event::AttachmentConflict {
                volume_id: request.volume_id.clone(),
                requested_node: request.node_id.clone(),
                holding_node: holder.clone(),
            });
            arbiter.events.record_metric("publish_conflict");
            Err(ArbiterError::AttachmentConflict {
                volume: request.volume_id.clone(),
                holder,
                requester: request.node_id.clone(),
            })
        }
        Ok(false) => self_heal(arbiter, request, holder, now).await,
    }
}

async fn start_migration(
    arbiter: &Arbiter,
    request: &PublishRequest,
    mut state: AttachmentState,
    now: DateTime<Utc>,
) -> ArbiterResult<PublishContext> {
    state.nodes.push(NodeAttachment {
        node_id: request.node_id.clone(),
        attached_at: now,
    });
    state.migration_started_at = Some(now);
    state.migration_timeout_secs = request.provision_context.migration_timeout_secs;

    arbiter
        .store
        .upsert(&request.volume_id, |_| Ok(state))
        .await?;
    arbiter.events.record_metric("publish_migration_started");
    Ok(build_publish_context(&request.provision_context))
}

async fn self_heal(
    arbiter: &Arbiter,
    request: &PublishRequest,
    stale_holder: NodeId,
    now: DateTime<Utc>,
) -> ArbiterResult<PublishContext> {
    let state = AttachmentState::single(
        request.volume_id.clone(),
        request.node_id.clone(),
        request.access_mode,
        request.provision_context.migration_timeout_secs,
        now,
    );
    arbiter.store.upsert(&request.volume_id, |_| Ok(state)).await?;
    arbiter.events.emit(Event::StaleAttachmentCleared {
        volume_id: request.volume_id.clone(),
        cleared_node: stale_holder,
    });
    arbiter.events.record_metric("publish_self_healed");
    Ok(build_publish_context(&request.provision_context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArbiterConfig;
    use crate::events::RecordingEventSink;
    use crate::lock_registry::VolumeLockRegistry;
    use crate::orchestrator_client::FakeOrchestratorClient;
    use crate::persistence::InMemoryBackend;
    use crate::remote_store_client::FakeRemoteStoreClient;
    use crate::state_store::AttachmentStateStore;
    use crate::types::FabricEndpoint;
    use std::sync::Arc;

    fn provision_context(migration_timeout_secs: u32) -> ProvisionContext {
        ProvisionContext {
            fabric: FabricEndpoint {
                nvme_address: "10.0.0.1".to_string(),
                nvme_port: 4420,
                nvme_nqn: "nqn.2023-01.io.example:vol1".to_string(),
            },
            fs_type: "ext4".to_string(),
            migration_timeout_secs,
        }
    }

    struct Harness {
        arbiter: Arbiter,
        orchestrator: Arc<FakeOrchestratorClient>,
        remote_store: Arc<FakeRemoteStoreClient>,
        events: Arc<RecordingEventSink>,
    }

    fn harness_with_remote_store(remote_store: FakeRemoteStoreClient) -> Harness {
        let orchestrator = Arc::new(FakeOrchestratorClient::new());
        let remote_store = Arc::new(remote_store);
        let events = Arc::new(RecordingEventSink::new());
        let arbiter = Arbiter::new(
            Arc::new(ArbiterConfig::default()),
            Arc::new(VolumeLockRegistry::new()),
            Arc::new(AttachmentStateStore::new(Arc::new(InMemoryBackend::new()))),
            orchestrator.clone(),
            remote_store.clone(),
            events.clone(),
        );
        Harness {
            arbiter,
            orchestrator,
            remote_store,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with_remote_store(FakeRemoteStoreClient::permissive())
    }

    #[tokio::test]
    async fn fresh_attach_is_granted() {
        let h = harness();
        let request = PublishRequest {
            volume_id: VolumeId::from("v1"),
            node_id: NodeId::from("n1"),
            access_mode: AccessMode::SingleNodeWriter,
            provision_context: provision_context(300),
        };
        let ctx = h.arbiter.controller_publish_volume(request).await.unwrap();
        assert_eq!(ctx.get("nvme_address"), Some("10.0.0.1"));
        assert_eq!(h.events.metric_count("publish_granted"), 1);

        let state = h.arbiter.store().get(&VolumeId::from("v1")).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].node_id, NodeId::from("n1"));
    }

    #[tokio::test]
    async fn repeated_publish_from_the_same_node_is_idempotent() {
        let h = harness();
        let request = |n: &str| PublishRequest {
            volume_id: VolumeId::from("v1"),
            node_id: NodeId::from(n),
            access_mode: AccessMode::SingleNodeWriter,
            provision_context: provision_context(300),
        };
        h.arbiter
            .controller_publish_volume(request("n1"))
            .await
            .unwrap();
        h.arbiter
            .controller_publish_volume(request("n1"))
            .await
            .unwrap();

        assert_eq!(h.events.metric_count("publish_idempotent"), 1);
        assert_eq!(
            h.arbiter.store().get(&VolumeId::from("v1")).unwrap().nodes.len(),
            1
        );
    }

    #[tokio::test]
    async fn different_node_conflicts_when_holder_is_alive() {
        let h = harness();
        h.arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: VolumeId::from("v1"),
                node_id: NodeId::from("n1"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await
            .unwrap();

        let result = h
            .arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: VolumeId::from("v1"),
                node_id: NodeId::from("n2"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await;

        assert!(matches!(result, Err(ArbiterError::AttachmentConflict { .. })));
        assert_eq!(h.events.metric_count("publish_conflict"), 1);
        assert_eq!(h.events.events().len(), 1);
    }

    #[tokio::test]
    async fn different_node_self_heals_when_holder_is_deleted() {
        let h = harness();
        h.arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: VolumeId::from("v1"),
                node_id: NodeId::from("n1"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await
            .unwrap();
        h.orchestrator.mark_deleted(&NodeId::from("n1"));

        let ctx = h
            .arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: VolumeId::from("v1"),
                node_id: NodeId::from("n2"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await
            .unwrap();

        assert!(ctx.get("nvme_address").is_some());
        assert_eq!(h.events.metric_count("publish_self_healed"), 1);
        let state = h.arbiter.store().get(&VolumeId::from("v1")).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].node_id, NodeId::from("n2"));
    }

    #[tokio::test]
    async fn conflict_check_fails_closed_on_orchestrator_outage() {
        let h = harness();
        h.arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: VolumeId::from("v1"),
                node_id: NodeId::from("n1"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await
            .unwrap();
        h.orchestrator.fail_next_check();

        let result = h
            .arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: VolumeId::from("v1"),
                node_id: NodeId::from("n2"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await;
        assert!(matches!(result, Err(ArbiterError::Internal(_))));
        // the stale holder is untouched, since we failed closed.
        let state = h.arbiter.store().get(&VolumeId::from("v1")).unwrap();
        assert_eq!(state.nodes[0].node_id, NodeId::from("n1"));
    }

    #[tokio::test]
    async fn rwx_volume_allows_a_bounded_migration_window() {
        let h = harness();
        let request = |n: &str| PublishRequest {
            volume_id: VolumeId::from("v1"),
            node_id: NodeId::from(n),
            access_mode: AccessMode::MultiNodeMultiWriter,
            provision_context: provision_context(300),
        };
        h.arbiter.controller_publish_volume(request("n1")).await.unwrap();
        h.arbiter.controller_publish_volume(request("n2")).await.unwrap();

        let state = h.arbiter.store().get(&VolumeId::from("v1")).unwrap();
        assert_eq!(state.nodes.len(), 2);
        assert!(state.migration_started_at.is_some());
        assert_eq!(h.events.metric_count("publish_migration_started"), 1);
    }

    #[tokio::test]
    async fn a_third_node_is_rejected_once_a_migration_is_in_flight() {
        let h = harness();
        let request = |n: &str| PublishRequest {
            volume_id: VolumeId::from("v1"),
            node_id: NodeId::from(n),
            access_mode: AccessMode::MultiNodeMultiWriter,
            provision_context: provision_context(300),
        };
        h.arbiter.controller_publish_volume(request("n1")).await.unwrap();
        h.arbiter.controller_publish_volume(request("n2")).await.unwrap();

        let result = h.arbiter.controller_publish_volume(request("n3")).await;
        assert!(matches!(
            result,
            Err(ArbiterError::MigrationLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn a_migration_past_its_bound_reports_timed_out_instead_of_limit_exceeded() {
        let h = harness();
        let now = Utc::now();
        h.arbiter
            .controller_publish_volume_at(
                PublishRequest {
                    volume_id: VolumeId::from("v1"),
                    node_id: NodeId::from("n1"),
                    access_mode: AccessMode::MultiNodeMultiWriter,
                    provision_context: provision_context(60),
                },
                now,
            )
            .await
            .unwrap();
        h.arbiter
            .controller_publish_volume_at(
                PublishRequest {
                    volume_id: VolumeId::from("v1"),
                    node_id: NodeId::from("n2"),
                    access_mode: AccessMode::MultiNodeMultiWriter,
                    provision_context: provision_context(60),
                },
                now,
            )
            .await
            .unwrap();

        let later = now + chrono::Duration::seconds(120);
        let result = h
            .arbiter
            .controller_publish_volume_at(
                PublishRequest {
                    volume_id: VolumeId::from("v1"),
                    node_id: NodeId::from("n3"),
                    access_mode: AccessMode::MultiNodeMultiWriter,
                    provision_context: provision_context(60),
                },
                later,
            )
            .await;
        assert!(matches!(
            result,
            Err(ArbiterError::MigrationTimedOut { .. })
        ));
    }

    #[tokio::test]
    async fn a_single_node_with_a_stale_migration_start_is_rejected_as_timed_out() {
        let h = harness();
        let now = Utc::now();
        h.arbiter
            .controller_publish_volume_at(
                PublishRequest {
                    volume_id: VolumeId::from("v1"),
                    node_id: NodeId::from("n1"),
                    access_mode: AccessMode::SingleNodeWriter,
                    provision_context: provision_context(60),
                },
                now,
            )
            .await
            .unwrap();
        // Simulate a migration record that never got cleaned up: one node
        // still attached, but `migration_started_at` is long past its bound.
        h.arbiter
            .store()
            .upsert(&VolumeId::from("v1"), |existing| {
                let mut state = existing.unwrap();
                state.migration_started_at = Some(now - chrono::Duration::seconds(120));
                Ok(state)
            })
            .await
            .unwrap();

        let result = h
            .arbiter
            .controller_publish_volume_at(
                PublishRequest {
                    volume_id: VolumeId::from("v1"),
                    node_id: NodeId::from("n2"),
                    access_mode: AccessMode::SingleNodeWriter,
                    provision_context: provision_context(60),
                },
                now,
            )
            .await;

        assert!(matches!(result, Err(ArbiterError::MigrationTimedOut { .. })));
        let state = h.arbiter.store().get(&VolumeId::from("v1")).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].node_id, NodeId::from("n1"));
    }

    #[tokio::test]
    async fn concurrent_publishes_on_the_same_volume_abort_instead_of_queuing() {
        let h = harness();
        let volume = VolumeId::from("v1");

        let locks = h.arbiter.locks.clone();
        let held = tokio::spawn({
            let locks = locks.clone();
            let volume = volume.clone();
            async move {
                locks
                    .with_volume_lock(&volume, || async {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let result = h
            .arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: volume.clone(),
                node_id: NodeId::from("n1"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await;
        assert!(matches!(result, Err(ArbiterError::Aborted(_))));
        held.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn publish_against_an_unknown_volume_is_not_found() {
        let h = harness_with_remote_store(FakeRemoteStoreClient::strict());
        let result = h
            .arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: VolumeId::from("ghost"),
                node_id: NodeId::from("n1"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await;
        assert!(matches!(result, Err(ArbiterError::VolumeNotFound(_))));
    }

    #[tokio::test]
    async fn empty_volume_id_is_rejected_before_touching_the_remote_store() {
        let h = harness_with_remote_store(FakeRemoteStoreClient::strict());
        let result = h
            .arbiter
            .controller_publish_volume(PublishRequest {
                volume_id: VolumeId::from(""),
                node_id: NodeId::from("n1"),
                access_mode: AccessMode::SingleNodeWriter,
                provision_context: provision_context(300),
            })
            .await;
        assert!(matches!(result, Err(ArbiterError::InvalidArgument(_))));
    }
}
