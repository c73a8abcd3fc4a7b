//! `ControllerUnpublishVolume`: removes a node's hold on a volume.
//! Dropping the second node of a migration promotes the survivor with a
//! fresh `attached_at`; dropping the last node records `detached_at` so
//! the reconciler knows when the grace period started.

use chrono::{DateTime, Utc};

use super::Arbiter;
use crate::errors::ArbiterResult;
use crate::types::{NodeId, VolumeId};

pub(crate) async fn unpublish(
    arbiter: &Arbiter,
    volume_id: VolumeId,
    node_id: NodeId,
    now: DateTime<Utc>,
) -> ArbiterResult<()> {
    arbiter
        .locks
        .try_with_volume_lock(&volume_id, || async { decide(arbiter, &volume_id, &node_id, now).await })
        .await
}

async fn decide(
    arbiter: &Arbiter,
    volume_id: &VolumeId,
    node_id: &NodeId,
    now: DateTime<Utc>,
) -> ArbiterResult<()> {
    let Some(state) = arbiter.store.get(volume_id) else {
        // Already gone: unpublish is idempotent.
        return Ok(());
    };

    if !state.holds(node_id) {
        return Ok(());
    }

    if state.is_empty() {
        return Ok(());
    }

    arbiter
        .store
        .upsert(volume_id, |existing| {
            let mut state = existing.expect("checked present above");
            state.nodes.retain(|n| &n.node_id != node_id);

            match state.nodes.len() {
                2 => unreachable!("removing one node cannot leave two behind"),
                1 => {
                    // A migration just resolved: the survivor becomes the
                    // sole holder from this moment, not from whenever the
                    // migration originally started.
                    state.nodes[0].attached_at = now;
                    state.migration_started_at = None;
                }
                0 => {
                    state.detached_at = Some(now);
                }
                _ => {}
            }
            Ok(state)
        })
        .await?;

    Ok(())
}
