//! Hypervisor access for vmtraffic.
//!
//! The collector only sees the hypervisor through two traits:
//! [ConnectionRegistry] (which endpoints exist and what runs on them) and
//! [CounterSource] (cumulative network counters of one guest).
//! [registry::ProxmoxRegistry] implements both over the Proxmox VE HTTP API,
//! [mock::MockHypervisor] implements both in memory.
#[cfg(feature = "http")]
pub mod http;
pub mod mock;
#[cfg(feature = "http")]
pub mod registry;


use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw numeric fields of a guest status, keyed by field name.
pub type CounterMap = HashMap<String, i64>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: Box<str>,
    pub status: ConnectionStatus,
}

impl ConnectionInfo {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Guest type, which selects the API path counters are read from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    Qemu,
    Lxc,
}

impl VmKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Lxc => "lxc",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "qemu" => Some(Self::Qemu),
            "lxc" => Some(Self::Lxc),
            _ => None,
        }
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One guest of a connection inventory.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct VmInfo {
    pub node: Box<str>,
    pub vmid: u32,
    pub name: Box<str>,
    pub kind: VmKind,
    pub status: Box<str>,
}

impl VmInfo {
    pub fn is_running(&self) -> bool {
        self.status.as_ref() == "running"
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown connection `{0}`")]
    UnknownConnection(Box<str>),

    /// Connection down, credentials rejected, guest gone...
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The hypervisor answered, but without usable data.
    #[error("malformed response: {0}")]
    DataMissing(String),
}

impl SourceError {
    pub fn is_data_missing(&self) -> bool {
        matches!(self, Self::DataMissing(_))
    }
}

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Every registered connection and its current status.
    async fn list_connections(&self) -> Result<Vec<ConnectionInfo>, SourceError>;

    /// Guest inventory of a connection.
    async fn list_vms(&self, connection_id: &str) -> Result<Vec<VmInfo>, SourceError>;
}

#[async_trait]
pub trait CounterSource: Send + Sync {
    /// Read the cumulative counters of a guest.
    async fn read_counters(
        &self,
        connection_id: &str,
        node: &str,
        vmid: u32,
        kind: VmKind,
    ) -> Result<CounterMap, SourceError>;
}
