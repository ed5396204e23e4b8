//! Per-VM network traffic aggregation.
//!
//! Cumulative hypervisor counters are polled by [collector::SampleCollector],
//! turned into deltas against the baseline of [snapshot::CurrentSnapshotStore]
//! and rolled into hour and day buckets by [aggregator::BucketAggregator].
//! [service::CollectorService] drives polling and retention;
//! [query::QueryFacade] serves the stored data.
pub mod aggregator;
pub mod collector;
pub mod config;
pub mod query;
pub mod retention;
pub mod service;
pub mod snapshot;
pub mod store;
