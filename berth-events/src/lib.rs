//! Event distribution and metric streaming.
//!
//! Hosts the process-wide event bus, the hypervisor event collector that
//! feeds it, the periodic metric sampler, and the docker stats converter
//! consuming the metric stream.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod bus;
pub mod collector;
pub mod metrics;
pub mod stats;

pub use bus::{BusEvent, ContainerEvent, EventBus, EventRecord, Topic};
pub use collector::{spawn_collector, EVENT_PAGE_SIZE};
pub use metrics::{
    spawn_sampler, CpuUsage, MetricsCollector, SubscriptionId, VmMetrics, SAMPLE_INTERVAL,
    SUBSCRIBER_SEND_TIMEOUT,
};
pub use stats::{StatsConverter, StatsEntry, StatsError};
