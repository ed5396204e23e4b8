//! A fake hypervisor.
//!
//! Holds inventories and counters in memory, and can be told to fail or slow
//! down reads.
use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::{
    ConnectionInfo, ConnectionRegistry, ConnectionStatus, CounterMap, CounterSource, SourceError,
    VmInfo, VmKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockFailure {
    Unavailable,
    Timeout,
    Malformed,
}

type CounterSlot = (Box<str>, Box<str>, u32);

#[derive(Debug, Default)]
pub struct MockHypervisor {
    connections: DashMap<Box<str>, ConnectionStatus>,
    inventories: DashMap<Box<str>, Vec<VmInfo>>,
    broken_inventories: DashSet<Box<str>>,
    counters: DashMap<CounterSlot, Result<CounterMap, MockFailure>>,
    read_delay_ms: AtomicU64,

    reads: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

fn slot(connection_id: &str, node: &str, vmid: u32) -> CounterSlot {
    (connection_id.into(), node.into(), vmid)
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, id: &str, status: ConnectionStatus) {
        self.connections.insert(id.into(), status);
        self.inventories.entry(id.into()).or_default();
    }

    pub fn set_status(&self, id: &str, status: ConnectionStatus) {
        self.connections.insert(id.into(), status);
    }

    pub fn remove_connection(&self, id: &str) {
        self.connections.remove(id);
        self.inventories.remove(id);
        self.counters.retain(|(connection, _, _), _| connection.as_ref() != id);
    }

    /// Add a running guest to a connection inventory.
    pub fn add_vm(&self, connection_id: &str, node: &str, vmid: u32, name: &str) {
        self.add_vm_info(
            connection_id,
            VmInfo {
                node: node.into(),
                vmid,
                name: name.into(),
                kind: VmKind::Qemu,
                status: "running".into(),
            },
        );
    }

    pub fn add_vm_info(&self, connection_id: &str, vm: VmInfo) {
        let mut inventory = self.inventories.entry(connection_id.into()).or_default();

        inventory.retain(|other| !(other.node == vm.node && other.vmid == vm.vmid));
        inventory.push(vm);
    }

    pub fn remove_vm(&self, connection_id: &str, node: &str, vmid: u32) {
        if let Some(mut inventory) = self.inventories.get_mut(connection_id) {
            inventory.retain(|vm| !(vm.node.as_ref() == node && vm.vmid == vmid));
        }

        self.counters.remove(&slot(connection_id, node, vmid));
    }

    /// Make `list_vms` fail for a connection.
    pub fn break_inventory(&self, connection_id: &str, broken: bool) {
        if broken {
            self.broken_inventories.insert(connection_id.into());
        } else {
            self.broken_inventories.remove(connection_id);
        }
    }

    pub fn set_counters(&self, connection_id: &str, node: &str, vmid: u32, counters: CounterMap) {
        self.counters
            .insert(slot(connection_id, node, vmid), Ok(counters));
    }

    /// Shorthand for a single interface guest.
    pub fn set_traffic(&self, connection_id: &str, node: &str, vmid: u32, netin: i64, netout: i64) {
        self.set_counters(
            connection_id,
            node,
            vmid,
            CounterMap::from([("netin".into(), netin), ("netout".into(), netout)]),
        );
    }

    pub fn fail_reads(&self, connection_id: &str, node: &str, vmid: u32, failure: MockFailure) {
        self.counters
            .insert(slot(connection_id, node, vmid), Err(failure));
    }

    /// Delay applied to every counter read.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Highest number of counter reads observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionRegistry for MockHypervisor {
    async fn list_connections(&self) -> Result<Vec<ConnectionInfo>, SourceError> {
        let mut connections: Vec<ConnectionInfo> = self
            .connections
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
        if self.broken_inventories.contains(connection_id) {
            return Err(SourceError::Unavailable(format!(
                "{connection_id}: inventory unavailable"
            )));
        }

        self.inventories
            .get(connection_id)
            .map(|inventory| inventory.clone())
            .ok_or_else(|| SourceError::UnknownConnection(connection_id.into()))
    }
}

#[async_trait]
impl CounterSource for MockHypervisor {
    async fn read_counters(
        &self,
        connection_id: &str,
        node: &str,
        vmid: u32,
        _kind: VmKind,
    ) -> Result<CounterMap, SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let result = match self.counters.get(&slot(connection_id, node, vmid)) {
            None => Err(SourceError::Unavailable(format!(
                "{connection_id}/{node}/{vmid}: no such guest"
            ))),
            Some(entry) => match entry.value() {
                Ok(counters) => Ok(counters.clone()),
                Err(MockFailure::Unavailable) => {
                    Err(SourceError::Unavailable("authentication expired".into()))
                }
                Err(MockFailure::Timeout) => Err(SourceError::Timeout(Duration::from_secs(20))),
                Err(MockFailure::Malformed) => Ok(CounterMap::from([("cpu".into(), 1)])),
            },
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        result
    }
}
