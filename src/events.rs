//! Event/metric hooks. The arbiter and reconciler call these on every state
//! transition; the sink decides how to surface them (attached to the
//! volume-claim object, a metrics registry, ...).

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{NodeId, VolumeId};

/// The fixed event vocabulary the arbiter emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A publish was rejected because a different node already holds the
    /// volume and that node is still alive.
    AttachmentConflict {
        volume_id: VolumeId,
        requested_node: NodeId,
        holding_node: NodeId,
    },
    /// A stale attachment was self-healed after its owning node was
    /// found to no longer exist.
    StaleAttachmentCleared {
        volume_id: VolumeId,
        cleared_node: NodeId,
    },
    /// A migration window expired and the secondary was cleared.
    MigrationTimeout {
        volume_id: VolumeId,
        cleared_node: NodeId,
        elapsed_secs: i64,
        bound_secs: i64,
    },
    /// A node-side teardown was refused because the device was still in
    /// use.
    DeviceBusy {
        volume_id: VolumeId,
        processes: Vec<String>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::AttachmentConflict { .. } => "AttachmentConflict",
            Event::StaleAttachmentCleared { .. } => "StaleAttachmentCleared",
            Event::MigrationTimeout { .. } => "MigrationTimeout",
            Event::DeviceBusy { .. } => "DeviceBusy",
        }
    }

    pub fn volume_id(&self) -> &VolumeId {
        match self {
            Event::AttachmentConflict { volume_id, .. }
            | Event::StaleAttachmentCleared { volume_id, .. }
            | Event::MigrationTimeout { volume_id, .. }
            | Event::DeviceBusy { volume_id, .. } => volume_id,
        }
    }
}

/// Where events and metric increments go. Implementors attach events to
/// the orchestrator's volume-claim object and/or push to a metrics
/// registry; neither is this crate's concern.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
    fn record_metric(&self, name: &'static str);
}

/// An event with a correlation id, as recorded by [`RecordingEventSink`]
/// for tests and local tooling.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub id: Uuid,
    pub event: Event,
}

/// Logs every event via `log::info!` and also keeps an in-memory record,
/// used by tests to assert on emitted events and by local tooling as the
/// default sink before a real orchestrator event API is wired in.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
    metrics: Mutex<std::collections::HashMap<&'static str, u64>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn metric_count(&self, name: &'static str) -> u64 {
        *self.metrics.lock().get(name).unwrap_or(&0)
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: Event) {
        info!(
            "event={} volume={}",
            event.name(),
            event.volume_id()
        );
        self.events.lock().push(RecordedEvent {
            id: Uuid::new_v4(),
            event,
        });
    }

    fn record_metric(&self, name: &'static str) {
        *self.metrics.lock().entry(name).or_insert(0) += 1;
    }
}

pub fn recording() -> Arc<dyn EventSink> {
    Arc::new(RecordingEventSink::new())
}
