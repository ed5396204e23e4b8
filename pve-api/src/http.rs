//! Proxmox VE HTTP client.
use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{CounterMap, SourceError, VmInfo, VmKind};

const API_PREFIX: &str = "/api2/json";

/// Connection parameters of a Proxmox VE endpoint, using API token authentication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxmoxConnection {
    pub id: Box<str>,
    /// Base URL, e.g. `https://pve1.example.org:8006`.
    pub url: String,
    /// `user@realm!tokenid`
    pub token_id: String,
    pub token_secret: String,
    /// Accept self-signed certificates.
    #[serde(default)]
    pub insecure: bool,
}

/// Proxmox wraps every payload into `{"data": ...}`.
#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct VersionInfo {
    version: String,
}

#[derive(Deserialize)]
struct ClusterResource {
    #[serde(rename = "type")]
    kind: String,
    node: Option<String>,
    vmid: Option<u32>,
    name: Option<String>,
    status: Option<String>,
    #[serde(default)]
    template: u8,
}

impl ClusterResource {
    fn into_vm_info(self) -> Option<VmInfo> {
        let kind = VmKind::parse(&self.kind)?;

        if self.template != 0 {
            return None;
        }

        let vmid = self.vmid?;

        Some(VmInfo {
            node: self.node?.into(),
            vmid,
            name: self.name.unwrap_or_else(|| format!("{kind}-{vmid}")).into(),
            kind,
            status: self.status.unwrap_or_default().into(),
        })
    }
}

#[derive(Debug)]
pub struct ProxmoxClient {
    connection: ProxmoxConnection,
    client: Client,
    timeout: Duration,
}

impl ProxmoxClient {
    pub fn new(connection: ProxmoxConnection, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(concat!("vmtraffic/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .danger_accept_invalid_certs(connection.insecure)
            .build()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        Ok(Self {
            connection,
            client,
            timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.connection.id
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{API_PREFIX}{path}",
            self.connection.url.trim_end_matches('/')
        )
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let authorization = format!(
            "PVEAPIToken={}={}",
            self.connection.token_id, self.connection.token_secret
        );

        let response = self
            .client
            .get(self.endpoint(path))
            .header(header::AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout(self.timeout)
                } else {
                    SourceError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::Unavailable(format!(
                "{}: authentication rejected ({status})",
                self.connection.id
            )));
        }

        if !status.is_success() {
            return Err(SourceError::Unavailable(format!("{path}: HTTP {status}")));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| SourceError::DataMissing(format!("{path}: {e}")))?;

        envelope
            .data
            .ok_or_else(|| SourceError::DataMissing(format!("{path}: empty data")))
    }

    /// Probe the endpoint, returns the Proxmox VE version.
    pub async fn version(&self) -> Result<String, SourceError> {
        let info: VersionInfo = self.get("/version").await?;

        Ok(info.version)
    }

    /// Cluster-wide guest inventory, templates excluded.
    pub async fn list_vms(&self) -> Result<Vec<VmInfo>, SourceError> {
        let resources: Vec<ClusterResource> = self.get("/cluster/resources?type=vm").await?;

        Ok(resources
            .into_iter()
            .filter_map(ClusterResource::into_vm_info)
            .collect())
    }

    /// Integer-valued fields of the guest current status (`netin`, `netout`, ...).
    pub async fn read_counters(
        &self,
        node: &str,
        vmid: u32,
        kind: VmKind,
    ) -> Result<CounterMap, SourceError> {
        let status: serde_json::Map<String, serde_json::Value> = self
            .get(&format!("/nodes/{node}/{kind}/{vmid}/status/current"))
            .await?;

        Ok(status
            .into_iter()
            .filter_map(|(name, value)| integer_value(&value).map(|value| (name, value)))
            .collect())
    }
}

/// Some counters are serialized as floats (`1.0e9`), accept them when integral.
fn integer_value(value: &serde_json::Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
            .map(|f| f as i64)
    })
}
