//! Fabric connection management and the node-side teardown policy:
//! unmount, resolve the local device path, run the device-busy interlock,
//! then disconnect the fabric session — refusing to disconnect anything
//! the arbiter didn't establish itself.

use async_trait::async_trait;
use log::{info, warn};

use crate::errors::ArbiterResult;
use crate::interlock::DeviceBusyInterlock;
use crate::staging::StagingClient;
use crate::types::{FabricEndpoint, VolumeId};

/// Identifies fabric sessions this arbiter is allowed to tear down. Mirrors
/// the `nvme_nqn` values this process itself used to connect, so a node
/// controller sharing a host with unrelated NVMe-oF consumers never
/// disconnects a session it didn't establish.
pub const MANAGED_NQN_PREFIX: &str = "nqn.";

#[async_trait]
pub trait FabricClient: Send + Sync {
    /// Establishes a fabric session and returns the local block device path.
    async fn connect(&self, endpoint: &FabricEndpoint) -> ArbiterResult<String>;

    /// Resolves the local device path for an endpoint without establishing
    /// a new connection. `Ok(None)` means "not connected", which node
    /// teardown treats as success.
    async fn resolve_device_path(&self, endpoint: &FabricEndpoint) -> ArbiterResult<Option<String>>;

    /// Tears down a previously established fabric session.
    async fn disconnect(&self, endpoint: &FabricEndpoint) -> ArbiterResult<()>;
}

/// Runs the full node-side teardown sequence for one volume's fabric
/// session: unmount, resolve the device, interlock, disconnect. Any step
/// short-circuiting with "already gone" is treated as success, matching
/// `NodeUnstageVolume`'s idempotence requirement.
/// A `FabricClient` for hosts with no NVMe-oF initiator tooling wired in
/// yet. Every call fails with `Internal`, clearly distinguishing "no fabric
/// backend configured" from an actual connect/disconnect failure, since the
/// transport layer itself is out of this crate's scope.
pub struct UnimplementedFabricClient;

#[async_trait]
impl FabricClient for UnimplementedFabricClient {
    async fn connect(&self, endpoint: &FabricEndpoint) -> ArbiterResult<String> {
        Err(crate::errors::ArbiterError::Internal(format!(
            "no fabric backend configured to connect to {}",
            endpoint.nvme_nqn
        )))
    }

    async fn resolve_device_path(&self, endpoint: &FabricEndpoint) -> ArbiterResult<Option<String>> {
        Err(crate::errors::ArbiterError::Internal(format!(
            "no fabric backend configured to resolve {}",
            endpoint.nvme_nqn
        )))
    }

    async fn disconnect(&self, endpoint: &FabricEndpoint) -> ArbiterResult<()> {
        Err(crate::errors::ArbiterError::Internal(format!(
            "no fabric backend configured to disconnect {}",
            endpoint.nvme_nqn
        )))
    }
}

pub async fn teardown(
    staging: &dyn StagingClient,
    fabric: &dyn FabricClient,
    interlock: &DeviceBusyInterlock,
    volume_id: &VolumeId,
    endpoint: &FabricEndpoint,
    mount_path: &str,
) -> ArbiterResult<()> {
    staging.unmount(mount_path).await?;

    let Some(device_path) = fabric.resolve_device_path(endpoint).await? else {
        info!("fabric endpoint {} already disconnected", endpoint.nvme_nqn);
        return Ok(());
    };

    interlock.wait_until_free(volume_id, &device_path).await?;

    if !endpoint.nvme_nqn.starts_with(MANAGED_NQN_PREFIX) {
        warn!(
            "refusing to disconnect fabric session with unrecognized nqn {}",
            endpoint.nvme_nqn
        );
        return Ok(());
    }

    fabric.disconnect(endpoint).await
}
