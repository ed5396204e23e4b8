//! Registry of Proxmox VE connections.
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    http::ProxmoxClient, ConnectionInfo, ConnectionRegistry, ConnectionStatus, CounterMap,
    CounterSource, SourceError, VmInfo, VmKind,
};

/// Set of Proxmox endpoints with their last known status.
///
/// Status is only changed by [ProxmoxRegistry::refresh]; a failed counter
/// read never marks a connection as down.
#[derive(Debug, Default)]
pub struct ProxmoxRegistry {
    clients: DashMap<Box<str>, Arc<ProxmoxClient>>,
    status: DashMap<Box<str>, ConnectionStatus>,
}

impl ProxmoxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one with the same id.
    pub fn add(&self, client: ProxmoxClient) {
        let id: Box<str> = client.id().into();

        self.status.insert(id.clone(), ConnectionStatus::Disconnected);
        self.clients.insert(id, Arc::new(client));
    }

    /// Forget a connection. Stored traffic data is not touched.
    pub fn remove(&self, id: &str) -> bool {
        self.status.remove(id);
        self.clients.remove(id).is_some()
    }

    fn client(&self, id: &str) -> Result<Arc<ProxmoxClient>, SourceError> {
        self.clients
            .get(id)
            .map(|client| Arc::clone(client.value()))
            .ok_or_else(|| SourceError::UnknownConnection(id.into()))
    }

    /// Probe every connection and update its status.
    pub async fn refresh(&self) {
        let clients: Vec<Arc<ProxmoxClient>> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let probes = clients.iter().map(|client| async move {
            let status = match client.version().await {
                Ok(version) => {
                    tracing::debug!("{}: Proxmox VE {version}", client.id());
                    ConnectionStatus::Connected
                }
                Err(SourceError::Timeout(_) | SourceError::Unavailable(_)) => {
                    ConnectionStatus::Disconnected
                }
                Err(e) => {
                    tracing::warn!("{}: unexpected probe response: {e}", client.id());
                    ConnectionStatus::Error
                }
            };

            (client.id(), status)
        });

        for (id, status) in futures::future::join_all(probes).await {
            if let Some(mut entry) = self.status.get_mut(id) {
                if *entry != status {
                    tracing::info!("Connection {id} is now {status:?}");
                }

                *entry = status;
            }
        }
    }
}

#[async_trait]
impl ConnectionRegistry for ProxmoxRegistry {
    async fn list_connections(&self) -> Result<Vec<ConnectionInfo>, SourceError> {
        let mut connections: Vec<ConnectionInfo> = self
            .status
            .iter()
            .map(|entry| ConnectionInfo {
                id: entry.key().clone(),
                status: *entry.value(),
            })
            .collect();

        connections.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(connections)
    }

    async fn list_vms(&self, connection_id: &str) -> Result<Vec<VmInfo>, SourceError> {
        self.client(connection_id)?.list_vms().await
    }
}

#[async_trait]
impl CounterSource for ProxmoxRegistry {
    async fn read_counters(
        &self,
        connection_id: &str,
        node: &str,
        vmid: u32,
        kind: VmKind,
    ) -> Result<CounterMap, SourceError> {
        self.client(connection_id)?
            .read_counters(node, vmid, kind)
            .await
    }
}
