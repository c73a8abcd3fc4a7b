//! Node staging (mount/unmount) interface. The actual filesystem
//! mount/format machinery is out of this crate's scope; this trait
//! exists only so [`crate::fabric::teardown`] has something to call.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::ArbiterResult;

#[async_trait]
pub trait StagingClient: Send + Sync {
    /// Mounts the device at `device_path` onto `mount_path` with `fs_type`.
    async fn mount(&self, device_path: &str, mount_path: &str, fs_type: &str) -> ArbiterResult<()>;

    /// Unmounts `mount_path`. Idempotent: unmounting an already-unmounted
    /// path succeeds.
    async fn unmount(&self, mount_path: &str) -> ArbiterResult<()>;
}

/// A `StagingClient` for hosts with no mount/format tooling wired in yet;
/// every call fails with `Internal` since the staging layer itself is out
/// of this crate's scope.
pub struct UnimplementedStagingClient;

#[async_trait]
impl StagingClient for UnimplementedStagingClient {
    async fn mount(&self, device_path: &str, mount_path: &str, _fs_type: &str) -> ArbiterResult<()> {
        Err(crate::errors::ArbiterError::Internal(format!(
            "no staging backend configured to mount {device_path} at {mount_path}"
        )))
    }

    async fn unmount(&self, mount_path: &str) -> ArbiterResult<()> {
        Err(crate::errors::ArbiterError::Internal(format!(
            "no staging backend configured to unmount {mount_path}"
        )))
    }
}

/// Records calls for assertions in [`crate::fabric`]'s tests.
#[derive(Default)]
pub struct FakeStagingClient {
    mounted: Mutex<Vec<(String, String, String)>>,
    unmounted: Mutex<Vec<String>>,
}

impl FakeStagingClient {
    pub fn unmounted_paths(&self) -> Vec<String> {
        self.unmounted.lock().clone()
    }
}

#[async_trait]
impl StagingClient for FakeStagingClient {
    async fn mount(&self, device_path: &str, mount_path: &str, fs_type: &str) -> ArbiterResult<()> {
        self.mounted
            .lock()
            .push((device_path.to_string(), mount_path.to_string(), fs_type.to_string()));
        Ok(())
    }

    async fn unmount(&self, mount_path: &str) -> ArbiterResult<()> {
        self.unmounted.lock().push(mount_path.to_string());
        Ok(())
    }
}
