//! Turning successive cumulative readings into usage deltas.
//!
//! Hypervisor counters are cumulative and reset to zero whenever the guest is
//! restarted or migrated. Any decrease is taken as a new baseline: the field
//! contributes nothing for that tick, and the next delta is computed from the
//! lowered value.
//!
//! A counter wrapping at a smaller modulus looks exactly like a reset and is
//! handled the same way (the wrapped interval is not counted).
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::model::{CounterReading, CurrentSample, TrafficDelta};

pub const NETIN_PREFIX: &str = "netin";
pub const NETOUT_PREFIX: &str = "netout";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CounterError {
    #[error("no `{0}*` counter reported")]
    Missing(&'static str),
    #[error("counter `{0}` has invalid value {1}")]
    Invalid(Box<str>, i64),
}

/// Sum every `netin*` and `netout*` field of a raw counter map.
///
/// A guest with several interfaces reports one field per interface, all of
/// them are added together.
pub fn sum_counters<'a, I>(counters: I) -> Result<CounterReading, CounterError>
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    let mut netin = None::<u64>;
    let mut netout = None::<u64>;

    for (name, value) in counters {
        let slot = if name.starts_with(NETOUT_PREFIX) {
            &mut netout
        } else if name.starts_with(NETIN_PREFIX) {
            &mut netin
        } else {
            continue;
        };

        let value = u64::try_from(value).map_err(|_| CounterError::Invalid(name.into(), value))?;
        *slot = Some(slot.unwrap_or(0).saturating_add(value));
    }

    Ok(CounterReading {
        netin: netin.ok_or(CounterError::Missing(NETIN_PREFIX))?,
        netout: netout.ok_or(CounterError::Missing(NETOUT_PREFIX))?,
    })
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeltaKind {
    /// First observation of a VM, only seeds the baseline.
    Seeded,
    /// Counters moved forward (or stayed still).
    Increment,
    /// At least one counter went backwards.
    Reset,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ComputedDelta {
    pub delta: TrafficDelta,
    pub kind: DeltaKind,
    /// Timestamp to store with the new baseline, always later than the previous one.
    pub timestamp: DateTime<Utc>,
}

/// Field-wise `max(0, current - previous)`.
pub fn clamped_delta(previous: CounterReading, current: CounterReading) -> (u64, u64) {
    (
        current.netin.saturating_sub(previous.netin),
        current.netout.saturating_sub(previous.netout),
    )
}

/// Compute the delta between the stored baseline (if any) and a new reading.
pub fn compute_delta(
    previous: Option<&CurrentSample>,
    current: CounterReading,
    now: DateTime<Utc>,
) -> ComputedDelta {
    let Some(previous) = previous else {
        return ComputedDelta {
            delta: TrafficDelta::zero(std::time::Duration::ZERO),
            kind: DeltaKind::Seeded,
            timestamp: now,
        };
    };

    // Keep per-VM timestamps strictly increasing even if the clock stepped back.
    let timestamp = now.max(previous.timestamp + Duration::milliseconds(1));
    let duration = (timestamp - previous.timestamp).to_std().unwrap_or_default();

    let before = previous.reading();
    let (netin, netout) = clamped_delta(before, current);

    let kind = if current.netin < before.netin || current.netout < before.netout {
        DeltaKind::Reset
    } else {
        DeltaKind::Increment
    };

    ComputedDelta {
        delta: TrafficDelta::new(netin, netout, duration),
        kind,
        timestamp,
    }
}
