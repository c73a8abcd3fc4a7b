//! Wire-format request bodies for the outward JSON surface. Kept separate
//! from `crate::types` so the internal domain types never have to carry
//! `#[serde(rename)]` noise for the wire format or accept raw, unparsed
//! strings like `migration_timeout_seconds`.

use serde::Deserialize;

use crate::types::{AccessMode, FabricEndpoint};

#[derive(Debug, Deserialize)]
pub struct ProvisionContextDto {
    pub nvme_address: String,
    pub nvme_port: u16,
    pub nvme_nqn: String,
    pub fs_type: String,
    /// Raw, unvalidated provisioning parameter; parsed and clamped by
    /// [`crate::params::parse_migration_timeout_seconds`].
    pub migration_timeout_seconds: Option<String>,
}

impl ProvisionContextDto {
    pub fn fabric(&self) -> FabricEndpoint {
        FabricEndpoint {
            nvme_address: self.nvme_address.clone(),
            nvme_port: self.nvme_port,
            nvme_nqn: self.nvme_nqn.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ControllerPublishRequestDto {
    pub volume_id: String,
    pub node_id: String,
    pub access_mode: AccessMode,
    pub provision_context: ProvisionContextDto,
}

#[derive(Debug, Deserialize)]
pub struct ControllerUnpublishRequestDto {
    pub volume_id: String,
    pub node_id: String,
}

#[derive(Debug, Deserialize)]
pub struct NodeStageRequestDto {
    pub volume_id: String,
    pub mount_path: String,
    pub fs_type: String,
    pub nvme_address: String,
    pub nvme_port: u16,
    pub nvme_nqn: String,
}

impl NodeStageRequestDto {
    pub fn fabric(&self) -> FabricEndpoint {
        FabricEndpoint {
            nvme_address: self.nvme_address.clone(),
            nvme_port: self.nvme_port,
            nvme_nqn: self.nvme_nqn.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NodeUnstageRequestDto {
    pub volume_id: String,
    pub mount_path: String,
    pub nvme_address: String,
    pub nvme_port: u16,
    pub nvme_nqn: String,
}

impl NodeUnstageRequestDto {
    pub fn fabric(&self) -> FabricEndpoint {
        FabricEndpoint {
            nvme_address: self.nvme_address.clone(),
            nvme_port: self.nvme_port,
            nvme_nqn: self.nvme_nqn.clone(),
        }
    }
}
