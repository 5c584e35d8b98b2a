//! Metric sampling and streaming.
//!
//! A single sampler task wakes every 20 seconds and, when at least one
//! subscriber exists, issues one batched perf query for every subscribed
//! VM. Results fan out to per-subscriber channels with a short send
//! timeout so one stalled consumer cannot hold up the rest of the sample.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_core::VmRef;
use berth_driver::{DriverError, InfraDriver, MetricSeries};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Interval between perf queries.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(20);

/// How long a sample waits on one subscriber's channel before skipping it.
pub const SUBSCRIBER_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Counters requested from the perf manager.
pub const COUNTERS: [&str; 2] = [CPU_COUNTER, MEM_COUNTER];

const CPU_COUNTER: &str = "cpu.usagemhz.average";
const MEM_COUNTER: &str = "mem.active.average";

const CHANNEL_CAPACITY: usize = 8;

/// One vCPU's usage within a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuUsage {
    pub id: i32,
    pub mhz: i64,
}

/// One VM's converted sample.
#[derive(Debug, Clone, Serialize)]
pub struct VmMetrics {
    pub vm: VmRef,
    /// Per-vCPU usage, sorted by CPU id.
    pub cpus: Vec<CpuUsage>,
    pub active_memory_bytes: i64,
    pub sampled_at: DateTime<Utc>,
    pub interval_secs: u32,
}

impl VmMetrics {
    /// Per-sample CPU usage averaged across vCPUs.
    #[must_use]
    pub fn average_mhz(&self) -> i64 {
        if self.cpus.is_empty() {
            return 0;
        }
        let total: i64 = self.cpus.iter().map(|c| c.mhz).sum();
        total / self.cpus.len() as i64
    }
}

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    vm: VmRef,
    seq: u64,
}

#[derive(Default)]
struct Publisher {
    senders: HashMap<u64, mpsc::Sender<VmMetrics>>,
}

/// Fans perf samples out to per-VM subscribers.
pub struct MetricsCollector {
    driver: Arc<dyn InfraDriver>,
    subs: Mutex<HashMap<VmRef, Publisher>>,
    next_seq: AtomicU64,
}

impl MetricsCollector {
    #[must_use]
    pub fn new(driver: Arc<dyn InfraDriver>) -> Self {
        Self {
            driver,
            subs: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<VmRef, Publisher>> {
        match self.subs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a subscriber for `vm`'s samples.
    pub fn subscribe(&self, vm: &VmRef) -> (SubscriptionId, mpsc::Receiver<VmMetrics>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.lock().entry(vm.clone()).or_default().senders.insert(seq, tx);
        tracing::debug!(vm = %vm, seq, "metrics subscribe");
        (
            SubscriptionId {
                vm: vm.clone(),
                seq,
            },
            rx,
        )
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) {
        let mut subs = self.lock();
        if let Some(publisher) = subs.get_mut(&id.vm) {
            publisher.senders.remove(&id.seq);
            if publisher.senders.is_empty() {
                subs.remove(&id.vm);
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, vm: &VmRef) -> usize {
        self.lock().get(vm).map_or(0, |p| p.senders.len())
    }

    /// One-shot sample of a single VM, outside the periodic stream.
    ///
    /// # Errors
    /// Propagates the driver error; returns `NotFound` via the driver if
    /// the VM is gone.
    pub async fn sample(&self, vm: &VmRef) -> Result<Option<VmMetrics>, DriverError> {
        let series = self
            .driver
            .perf_sample(
                std::slice::from_ref(vm),
                &COUNTERS,
                1,
                SAMPLE_INTERVAL.as_secs() as u32,
            )
            .await?;
        Ok(convert(series).remove(vm))
    }

    async fn sample_and_publish(&self) {
        let vms: Vec<VmRef> = self.lock().keys().cloned().collect();
        if vms.is_empty() {
            return;
        }
        let series = match self
            .driver
            .perf_sample(&vms, &COUNTERS, 1, SAMPLE_INTERVAL.as_secs() as u32)
            .await
        {
            Ok(series) => series,
            Err(e) => {
                tracing::warn!(error = %e, "perf sample failed");
                return;
            }
        };
        for (vm, metrics) in convert(series) {
            self.publish(&vm, metrics).await;
        }
    }

    async fn publish(&self, vm: &VmRef, metrics: VmMetrics) {
        let senders: Vec<(u64, mpsc::Sender<VmMetrics>)> = {
            let subs = self.lock();
            let Some(publisher) = subs.get(vm) else {
                return;
            };
            publisher
                .senders
                .iter()
                .map(|(&seq, tx)| (seq, tx.clone()))
                .collect()
        };

        let mut closed = Vec::new();
        for (seq, tx) in senders {
            match tx.send_timeout(metrics.clone(), SUBSCRIBER_SEND_TIMEOUT).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    // Slow consumer: it just misses this sample.
                    tracing::debug!(vm = %vm, seq, "metrics subscriber too slow, skipping");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    closed.push(seq);
                }
            }
        }

        if !closed.is_empty() {
            let mut subs = self.lock();
            if let Some(publisher) = subs.get_mut(vm) {
                for seq in closed {
                    publisher.senders.remove(&seq);
                }
                if publisher.senders.is_empty() {
                    subs.remove(vm);
                }
            }
        }
    }
}

/// Spawns the periodic sampler. Runs until aborted.
pub fn spawn_sampler(collector: Arc<MetricsCollector>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so subscribers see
        // samples on the steady cadence.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            collector.sample_and_publish().await;
        }
    })
}

/// Groups raw perf series into per-VM metrics. Aggregate CPU entries
/// (empty instance) are discarded; per-CPU instances parse to ids.
fn convert(series: Vec<MetricSeries>) -> HashMap<VmRef, VmMetrics> {
    let mut out: HashMap<VmRef, VmMetrics> = HashMap::new();
    for s in series {
        let (Some(&value), Some(&timestamp)) = (s.values.last(), s.timestamps.last()) else {
            continue;
        };
        let entry = out.entry(s.vm.clone()).or_insert_with(|| VmMetrics {
            vm: s.vm.clone(),
            cpus: Vec::new(),
            active_memory_bytes: 0,
            sampled_at: timestamp,
            interval_secs: s.interval_secs,
        });
        entry.sampled_at = timestamp;
        match s.counter.as_str() {
            CPU_COUNTER => {
                if s.instance.is_empty() {
                    continue;
                }
                let Ok(id) = s.instance.parse::<i32>() else {
                    tracing::debug!(instance = %s.instance, "unparseable cpu instance");
                    continue;
                };
                entry.cpus.push(CpuUsage { id, mhz: value });
            }
            MEM_COUNTER => {
                // Reported in KB.
                entry.active_memory_bytes = value * 1024;
            }
            _ => {}
        }
    }
    for metrics in out.values_mut() {
        metrics.cpus.sort_by_key(|c| c.id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_driver::sim::SimDriver;
    use berth_driver::PowerState;

    fn setup() -> (Arc<SimDriver>, Arc<MetricsCollector>, VmRef) {
        let sim = Arc::new(SimDriver::new());
        let vm = sim.seed_vm("a", PowerState::PoweredOn, Default::default());
        sim.set_perf_profile(&vm, vec![100, 300], 2048);
        let collector = Arc::new(MetricsCollector::new(
            Arc::clone(&sim) as Arc<dyn InfraDriver>
        ));
        (sim, collector, vm)
    }

    #[tokio::test]
    async fn one_shot_sample_discards_aggregate_cpu_entry() {
        let (_sim, collector, vm) = setup();
        let metrics = collector.sample(&vm).await.expect("sample").expect("metrics");
        assert_eq!(metrics.cpus.len(), 2, "aggregate entry must be dropped");
        assert_eq!(metrics.cpus[0], CpuUsage { id: 0, mhz: 100 });
        assert_eq!(metrics.cpus[1], CpuUsage { id: 1, mhz: 300 });
        assert_eq!(metrics.active_memory_bytes, 2048 * 1024);
        assert_eq!(metrics.average_mhz(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_delivers_on_cadence() {
        let (_sim, collector, vm) = setup();
        let (_id, mut rx) = collector.subscribe(&vm);
        let handle = spawn_sampler(Arc::clone(&collector));
        let metrics = rx.recv().await.expect("sample delivered");
        assert_eq!(metrics.vm, vm);
        handle.abort();
    }

    #[tokio::test]
    async fn closed_receiver_is_evicted_and_empty_publisher_dropped() {
        let (_sim, collector, vm) = setup();
        let (_id, rx) = collector.subscribe(&vm);
        assert_eq!(collector.subscriber_count(&vm), 1);
        drop(rx);
        let metrics = collector.sample(&vm).await.expect("sample").expect("metrics");
        collector.publish(&vm, metrics).await;
        assert_eq!(collector.subscriber_count(&vm), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_subscriber_misses_sample_but_stays() {
        let (_sim, collector, vm) = setup();
        let (_id, mut rx) = collector.subscribe(&vm);
        let metrics = collector.sample(&vm).await.expect("sample").expect("metrics");
        // Fill the channel so the next send times out.
        for _ in 0..CHANNEL_CAPACITY {
            collector.publish(&vm, metrics.clone()).await;
        }
        collector.publish(&vm, metrics.clone()).await;
        assert_eq!(collector.subscriber_count(&vm), 1);
        // The buffered samples are still there to drain.
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_drops_empty_publisher() {
        let (_sim, collector, vm) = setup();
        let (id, _rx) = collector.subscribe(&vm);
        collector.unsubscribe(&id);
        assert_eq!(collector.subscriber_count(&vm), 0);
    }
}
