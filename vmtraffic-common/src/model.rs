//! Traffic data structures shared by the collector, the storage backends and the query side.
use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timekey::Granularity;

/// Identity of a guest on one hypervisor connection.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct VmIdentity {
    pub connection_id: Box<str>,
    pub node: Box<str>,
    pub vmid: u32,
}

impl VmIdentity {
    pub fn new(connection_id: &str, node: &str, vmid: u32) -> Self {
        Self {
            connection_id: connection_id.into(),
            node: node.into(),
            vmid,
        }
    }

    /// Stable composite key (`connection-node-vmid`).
    pub fn vm_key(&self) -> VmKey {
        VmKey(format!("{}-{}-{}", self.connection_id, self.node, self.vmid).into())
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.connection_id, self.node, self.vmid)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmKey(Box<str>);

impl VmKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VmKey {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for VmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cumulative netin/netout reading, as reported by the hypervisor.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CounterReading {
    pub netin: u64,
    pub netout: u64,
}

impl CounterReading {
    pub const fn new(netin: u64, netout: u64) -> Self {
        Self { netin, netout }
    }

    pub const fn total(&self) -> u64 {
        self.netin.saturating_add(self.netout)
    }
}

/// Latest absolute counters of a VM, used as the baseline of the next delta.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CurrentSample {
    pub identity: VmIdentity,
    pub netin: u64,
    pub netout: u64,
    pub total: u64,
    pub timestamp: DateTime<Utc>,
}

impl CurrentSample {
    pub fn new(identity: VmIdentity, reading: CounterReading, timestamp: DateTime<Utc>) -> Self {
        Self {
            identity,
            netin: reading.netin,
            netout: reading.netout,
            total: reading.total(),
            timestamp,
        }
    }

    pub fn vm_key(&self) -> VmKey {
        self.identity.vm_key()
    }

    pub fn reading(&self) -> CounterReading {
        CounterReading::new(self.netin, self.netout)
    }
}

/// Non-negative usage between two consecutive readings.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TrafficDelta {
    pub netin: u64,
    pub netout: u64,
    pub total: u64,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl TrafficDelta {
    pub fn new(netin: u64, netout: u64, duration: Duration) -> Self {
        Self {
            netin,
            netout,
            total: netin.saturating_add(netout),
            duration,
        }
    }

    pub fn zero(duration: Duration) -> Self {
        Self::new(0, 0, duration)
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0
    }
}

/// A fixed time-window accumulator (one hour or one day) for a VM.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TrafficBucket {
    pub identity: VmIdentity,
    pub granularity: Granularity,
    /// `YYYY-MM-DD-HH` for hours, `YYYY-MM-DD` for days.
    pub key: Box<str>,
    pub netin: u64,
    pub netout: u64,
    pub total: u64,
    pub collections: u64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl TrafficBucket {
    /// Bucket seeded by a first delta.
    pub fn seeded(
        identity: VmIdentity,
        granularity: Granularity,
        key: &str,
        delta: &TrafficDelta,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            granularity,
            key: key.into(),
            netin: delta.netin,
            netout: delta.netout,
            total: delta.total,
            collections: 1,
            start_time: now,
            last_update: now,
        }
    }

    /// Zero-valued placeholder, used to keep histories continuous.
    pub fn empty(identity: VmIdentity, granularity: Granularity, key: &str) -> Self {
        let start_time = granularity.start_of_key(key).unwrap_or_default();

        Self {
            identity,
            granularity,
            key: key.into(),
            netin: 0,
            netout: 0,
            total: 0,
            collections: 0,
            start_time,
            last_update: start_time,
        }
    }

    /// Add a delta to this bucket. Only storage backends holding an exclusive
    /// lock on the bucket may call this.
    pub fn accumulate(&mut self, delta: &TrafficDelta, now: DateTime<Utc>) {
        self.netin = self.netin.saturating_add(delta.netin);
        self.netout = self.netout.saturating_add(delta.netout);
        self.total = self.netin.saturating_add(self.netout);
        self.collections += 1;
        self.last_update = now;
    }

    pub fn vm_key(&self) -> VmKey {
        self.identity.vm_key()
    }
}

/// Ordering used by "every VM for one time key" listings:
/// total descending, then vm key ascending.
pub fn sort_by_usage(buckets: &mut [TrafficBucket]) {
    buckets.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.vm_key().cmp(&b.vm_key())));
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;

        Ok(Duration::try_from_secs_f64(secs).unwrap_or_default())
    }
}
