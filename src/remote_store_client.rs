//! Remote-storage control client. The arbiter only needs one fact from
//! it: whether a volume exists in the backing remote store, consulted at
//! the top of publish.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::ArbiterResult;
use crate::types::VolumeId;

#[async_trait]
pub trait RemoteStoreClient: Send + Sync {
    async fn volume_exists(&self, volume_id: &VolumeId) -> ArbiterResult<bool>;
}

/// A fake remote store where every volume exists unless explicitly
/// removed — used by tests and local tooling. The real client would
/// create/delete backing files and toggle fabric export; that lifecycle
/// is out of this crate's scope.
#[derive(Default)]
pub struct FakeRemoteStoreClient {
    known_volumes: RwLock<HashSet<VolumeId>>,
    all_volumes_exist_by_default: bool,
}

impl FakeRemoteStoreClient {
    /// Every volume ever asked about exists, unless removed. Matches the
    /// common test fixture where volumes are provisioned ahead of time.
    pub fn permissive() -> Self {
        Self {
            known_volumes: RwLock::new(HashSet::new()),
            all_volumes_exist_by_default: true,
        }
    }

    /// Only volumes explicitly registered exist; everything else is
    /// `NotFound`.
    pub fn strict() -> Self {
        Self {
            known_volumes: RwLock::new(HashSet::new()),
            all_volumes_exist_by_default: false,
        }
    }

    pub fn register(&self, volume_id: &VolumeId) {
        self.known_volumes.write().insert(volume_id.clone());
    }

    pub fn deregister(&self, volume_id: &VolumeId) {
        self.known_volumes.write().remove(volume_id);
    }
}

#[async_trait]
impl RemoteStoreClient for FakeRemoteStoreClient {
    async fn volume_exists(&self, volume_id: &VolumeId) -> ArbiterResult<bool> {
        if self.known_volumes.read().contains(volume_id) {
            return Ok(true);
        }
        Ok(self.all_volumes_exist_by_default)
    }
}

pub fn permissive() -> Arc<dyn RemoteStoreClient> {
    Arc::new(FakeRemoteStoreClient::permissive())
}
