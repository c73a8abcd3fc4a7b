//! The data model: `AttachmentState`, `NodeAttachment`, access modes, and
//! the publish context returned to nodes.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, orchestrator-assigned volume identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        VolumeId(s.to_string())
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        VolumeId(s)
    }
}

/// Opaque, orchestrator-assigned node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// Access mode requested for a volume capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReader,
    MultiNodeMultiWriter,
}

impl AccessMode {
    pub fn is_migratable(&self) -> bool {
        matches!(self, AccessMode::MultiNodeMultiWriter)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::SingleNodeWriter => "SingleNodeWriter",
            AccessMode::SingleNodeReader => "SingleNodeReader",
            AccessMode::MultiNodeMultiWriter => "MultiNodeMultiWriter",
        };
        write!(f, "{s}")
    }
}

/// One node's binding to a volume. Owned by composition inside
/// `AttachmentState`; destroyed with it or when removed from `nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttachment {
    pub node_id: NodeId,
    pub attached_at: DateTime<Utc>,
}

/// Fabric/filesystem parameters returned to the node on a successful
/// attach. Keys are a fixed recognized snake_case set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishContext(pub HashMap<String, String>);

impl PublishContext {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Fabric endpoint parameters passed through unchanged from provisioning
/// into the publish context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricEndpoint {
    pub nvme_address: String,
    pub nvme_port: u16,
    pub nvme_nqn: String,
}

/// Per-volume provisioning context: whatever was supplied at
/// `CreateVolume`/provision time and carried through to every later
/// publish of that volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionContext {
    pub fabric: FabricEndpoint,
    pub fs_type: String,
    /// Parsed, clamped migration timeout, already validated.
    pub migration_timeout_secs: u32,
}

/// Authoritative per-volume attachment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentState {
    pub volume_id: VolumeId,
    pub nodes: Vec<NodeAttachment>,
    pub access_mode: AccessMode,
    pub created_at: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
    pub migration_started_at: Option<DateTime<Utc>>,
    pub migration_timeout_secs: u32,
}

impl AttachmentState {
    /// A brand-new state with a single node attached.
    pub fn single(
        volume_id: VolumeId,
        node_id: NodeId,
        access_mode: AccessMode,
        migration_timeout_secs: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            volume_id,
            nodes: vec![NodeAttachment {
                node_id,
                attached_at: now,
            }],
            access_mode,
            created_at: now,
            detached_at: None,
            migration_started_at: None,
            migration_timeout_secs,
        }
    }

    pub fn holds(&self, node_id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.node_id == node_id)
    }

    pub fn primary(&self) -> Option<&NodeAttachment> {
        self.nodes.first()
    }

    pub fn is_migrating(&self) -> bool {
        self.nodes.len() == 2
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Checked invariant assertions; used by tests and defensively by the
    /// store after every mutation.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.nodes.len() > 2 {
            return Err(format!("volume {} has {} nodes (max 2)", self.volume_id, self.nodes.len()));
        }
        if self.nodes.len() == 2 && self.access_mode != AccessMode::MultiNodeMultiWriter {
            return Err(format!(
                "volume {} has two nodes but access mode {} is not MultiNodeMultiWriter",
                self.volume_id, self.access_mode
            ));
        }
        if self.nodes.len() == 2 && self.migration_started_at.is_none() {
            return Err(format!(
                "volume {} has two nodes but no migration_started_at",
                self.volume_id
            ));
        }
        if self.nodes.len() == 1 && self.migration_started_at.is_some() {
            return Err(format!(
                "volume {} has one node but migration_started_at is set",
                self.volume_id
            ));
        }
        if self.detached_at.is_some() && !self.nodes.is_empty() {
            return Err(format!(
                "volume {} has detached_at set but {} nodes still attached",
                self.volume_id,
                self.nodes.len()
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for n in &self.nodes {
            if !seen.insert(&n.node_id) {
                return Err(format!(
                    "volume {} has duplicate node {}",
                    self.volume_id, n.node_id
                ));
            }
        }
        Ok(())
    }
}
