//! Data model, time key and delta tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use maplit::hashmap;

use crate::{
    delta::{compute_delta, sum_counters, CounterError, DeltaKind},
    model::{sort_by_usage, CounterReading, CurrentSample, TrafficBucket, TrafficDelta, VmIdentity},
    timekey::{self, Granularity},
};

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn web01() -> VmIdentity {
    VmIdentity::new("pve1", "node1", 101)
}

#[test]
fn vm_key_joins_identity() {
    assert_eq!(web01().vm_key().as_str(), "pve1-node1-101");
}

#[test]
fn keys_are_floored_and_zero_padded() {
    let now = at(2024, 3, 7, 9, 59, 59);

    assert_eq!(timekey::hour_key(now), "2024-03-07-09");
    assert_eq!(timekey::day_key(now), "2024-03-07");
    assert_eq!(Granularity::Hour.floor(now), at(2024, 3, 7, 9, 0, 0));
    assert_eq!(Granularity::Day.floor(now), at(2024, 3, 7, 0, 0, 0));
}

#[test]
fn keys_parse_back() {
    assert_eq!(
        Granularity::Hour.start_of_key("2024-03-07-09"),
        Some(at(2024, 3, 7, 9, 0, 0))
    );
    assert_eq!(
        Granularity::Day.start_of_key("2024-03-07"),
        Some(at(2024, 3, 7, 0, 0, 0))
    );

    assert!(!Granularity::Hour.is_valid_key("2024-03-07"));
    assert!(!Granularity::Hour.is_valid_key("2024-03-07-24"));
    assert!(!Granularity::Hour.is_valid_key("2024-03-07-9"));
    assert!(!Granularity::Day.is_valid_key("2024-3-7"));
    assert!(!Granularity::Day.is_valid_key("2024-03-07-09"));
}

#[test]
fn hours_ending_at_crosses_midnight() {
    let keys: Vec<String> = timekey::hours_ending_at(at(2024, 3, 7, 1, 30, 0), 3)
        .unwrap()
        .collect();

    assert_eq!(keys, ["2024-03-06-23", "2024-03-07-00", "2024-03-07-01"]);

    let day = timekey::hours_ending_at(at(2024, 3, 7, 1, 30, 0), 24).unwrap();
    assert_eq!(day.len(), 24);
    assert_eq!(day.first_key().as_deref(), Some("2024-03-06-02"));
    assert_eq!(day.last_key().as_deref(), Some("2024-03-07-01"));

    let none = timekey::hours_ending_at(at(2024, 3, 7, 1, 30, 0), 0).unwrap();
    assert_eq!((none.first_key(), none.last_key()), (None, None));
}

#[test]
fn huge_hour_counts_are_lazy_or_rejected() {
    let now = at(2024, 3, 7, 1, 30, 0);

    assert!(timekey::hours_ending_at(now, 3_000_000_000).is_none());
    assert!(timekey::hours_ending_at(now, usize::MAX).is_none());

    let mut keys = timekey::hours_ending_at(now, 1_000_000_000).unwrap();
    assert_eq!(keys.len(), 1_000_000_000);
    assert_eq!(keys.last_key().as_deref(), Some("2024-03-07-01"));

    keys.next().unwrap();
    assert_eq!(keys.len(), 999_999_999);
}

#[test]
fn seconds_into_hour_is_never_zero() {
    assert_eq!(timekey::seconds_into_hour(at(2024, 3, 7, 1, 0, 0)), 1);
    assert_eq!(timekey::seconds_into_hour(at(2024, 3, 7, 1, 10, 0)), 600);
}

#[test]
fn retention_cutoff_keys() {
    let (hour, day) = timekey::retention_cutoff(at(2024, 3, 31, 12, 0, 0), 30);

    assert_eq!(hour, "2024-03-01-12");
    assert_eq!(day, "2024-03-01");
}

#[test]
fn sum_counters_adds_every_interface() {
    let counters = hashmap! {
        "netin" => 1000i64,
        "netin_net1" => 24,
        "netout" => 500,
        "netout_net1" => 6,
        "diskread" => 99999,
    };

    assert_eq!(
        sum_counters(counters.into_iter()),
        Ok(CounterReading::new(1024, 506))
    );
}

#[test]
fn sum_counters_reports_missing_and_invalid() {
    assert_eq!(
        sum_counters(hashmap! { "netin" => 1i64 }.into_iter()),
        Err(CounterError::Missing("netout"))
    );
    assert_eq!(
        sum_counters(hashmap! { "cpu" => 1i64 }.into_iter()),
        Err(CounterError::Missing("netin"))
    );
    assert_eq!(
        sum_counters(hashmap! { "netin" => -1i64, "netout" => 0 }.into_iter()),
        Err(CounterError::Invalid("netin".into(), -1))
    );
}

#[test]
fn first_observation_seeds() {
    let computed = compute_delta(None, CounterReading::new(1000, 500), at(2024, 3, 7, 9, 0, 0));

    assert_eq!(computed.kind, DeltaKind::Seeded);
    assert!(computed.delta.is_zero());
}

#[test]
fn monotonic_counters_yield_difference() {
    let t0 = at(2024, 3, 7, 9, 0, 0);
    let previous = CurrentSample::new(web01(), CounterReading::new(1000, 500), t0);

    let computed = compute_delta(
        Some(&previous),
        CounterReading::new(1500, 800),
        t0 + Duration::seconds(30),
    );

    assert_eq!(computed.kind, DeltaKind::Increment);
    assert_eq!(
        computed.delta,
        TrafficDelta::new(500, 300, std::time::Duration::from_secs(30))
    );
    assert_eq!(computed.delta.total, 800);
}

#[test]
fn decrease_is_a_reset_with_zero_delta() {
    let t0 = at(2024, 3, 7, 9, 0, 0);
    let previous = CurrentSample::new(web01(), CounterReading::new(1500, 800), t0);

    let computed = compute_delta(
        Some(&previous),
        CounterReading::new(100, 50),
        t0 + Duration::seconds(30),
    );

    assert_eq!(computed.kind, DeltaKind::Reset);
    assert!(computed.delta.is_zero());

    // Next delta is relative to the lowered reading.
    let baseline = CurrentSample::new(web01(), CounterReading::new(100, 50), computed.timestamp);
    let next = compute_delta(
        Some(&baseline),
        CounterReading::new(300, 120),
        t0 + Duration::seconds(60),
    );

    assert_eq!((next.delta.netin, next.delta.netout, next.delta.total), (200, 70, 270));
}

#[test]
fn timestamps_strictly_increase() {
    let t0 = at(2024, 3, 7, 9, 0, 0);
    let previous = CurrentSample::new(web01(), CounterReading::new(1, 1), t0);

    // Clock went backwards.
    let computed = compute_delta(Some(&previous), CounterReading::new(2, 2), t0 - Duration::seconds(5));

    assert!(computed.timestamp > t0);
}

#[test]
fn bucket_accumulates_without_deduplication() {
    let now = at(2024, 3, 7, 9, 0, 0);
    let delta = TrafficDelta::new(10, 5, std::time::Duration::from_secs(30));

    let mut bucket = TrafficBucket::seeded(web01(), Granularity::Hour, "2024-03-07-09", &delta, now);
    bucket.accumulate(&delta, now + Duration::seconds(30));

    assert_eq!(bucket.collections, 2);
    assert_eq!(bucket.total, 2 * delta.total);
    assert_eq!(bucket.total, bucket.netin + bucket.netout);
    assert_eq!(bucket.start_time, now);
    assert_eq!(bucket.last_update, now + Duration::seconds(30));
}

#[test]
fn empty_bucket_starts_at_window() {
    let bucket = TrafficBucket::empty(web01(), Granularity::Hour, "2024-03-07-09");

    assert_eq!(bucket.total, 0);
    assert_eq!(bucket.collections, 0);
    assert_eq!(bucket.start_time, at(2024, 3, 7, 9, 0, 0));
}

#[test]
fn usage_sort_breaks_ties_by_key() {
    let now = at(2024, 3, 7, 9, 0, 0);
    let make = |vmid, total| {
        TrafficBucket::seeded(
            VmIdentity::new("pve1", "node1", vmid),
            Granularity::Day,
            "2024-03-07",
            &TrafficDelta::new(total, 0, std::time::Duration::ZERO),
            now,
        )
    };

    let mut buckets = vec![make(102, 5), make(103, 50), make(101, 5)];
    sort_by_usage(&mut buckets);

    let order: Vec<u32> = buckets.iter().map(|b| b.identity.vmid).collect();
    assert_eq!(order, [103, 101, 102]);
}
