//! Hypervisor event collection.
//!
//! Polls the driver's paged event API, filters to the kinds the core
//! reacts to, and republishes on the bus oldest-first. The cursor only
//! advances past events that were published, so a poll error is retried
//! from the same position without losing events.

use std::sync::Arc;
use std::time::Duration;

use berth_driver::{InfraDriver, VmEventKind};
use tokio::task::JoinHandle;

use crate::bus::{BusEvent, EventBus, Topic};

/// Events per page requested from the driver.
pub const EVENT_PAGE_SIZE: u32 = 25;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn relevant(kind: VmEventKind) -> bool {
    matches!(
        kind,
        VmEventKind::PoweredOn
            | VmEventKind::PoweredOff
            | VmEventKind::Suspended
            | VmEventKind::Removed
            | VmEventKind::Migrated
            | VmEventKind::Relocated
            | VmEventKind::HostEnteringMaintenance
            | VmEventKind::HostEnteredMaintenance
            | VmEventKind::HostExitMaintenance
    )
}

/// Spawns the collector task. `start_after` is the last event key already
/// processed; pass 0 on a fresh start.
///
/// The task runs until aborted via the returned handle.
pub fn spawn_collector(
    driver: Arc<dyn InfraDriver>,
    bus: Arc<EventBus>,
    start_after: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_key = start_after;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match driver.next_events(last_key, EVENT_PAGE_SIZE).await {
                Ok(page) => {
                    for event in page {
                        // Dedup: pages can overlap after a retry.
                        if event.key <= last_key {
                            continue;
                        }
                        last_key = event.key;
                        if relevant(event.kind) {
                            tracing::debug!(
                                vm = %event.vm,
                                kind = %event.kind,
                                key = event.key,
                                "vm event"
                            );
                            bus.publish(Topic::VmEvents, &BusEvent::Vm(event));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, last_key, "event poll failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_driver::sim::SimDriver;
    use std::sync::Mutex;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn collector_publishes_relevant_events_in_order() {
        let sim = Arc::new(SimDriver::new());
        let vm = sim.seed_vm("a", berth_driver::PowerState::PoweredOff, Default::default());
        let bus = Arc::new(EventBus::new());

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(Topic::VmEvents, "test", move |e| {
                if let BusEvent::Vm(e) = e {
                    seen.lock().expect("lock").push(e.kind);
                }
            });
        }

        let handle = spawn_collector(Arc::clone(&sim) as Arc<dyn InfraDriver>, Arc::clone(&bus), 0);

        sim.emit(&vm, VmEventKind::PoweredOn);
        sim.emit(&vm, VmEventKind::Reconfigured);
        sim.emit(&vm, VmEventKind::PoweredOff);

        wait_for(|| seen.lock().expect("lock").len() >= 2).await;
        handle.abort();

        let kinds = seen.lock().expect("lock").clone();
        assert_eq!(kinds, vec![VmEventKind::PoweredOn, VmEventKind::PoweredOff]);
    }

    #[tokio::test]
    async fn collector_resumes_after_start_key() {
        let sim = Arc::new(SimDriver::new());
        let vm = sim.seed_vm("a", berth_driver::PowerState::PoweredOff, Default::default());
        sim.emit(&vm, VmEventKind::PoweredOn);
        let already_processed = sim.next_events(0, 25).await.expect("events")[0].key;
        sim.emit(&vm, VmEventKind::PoweredOff);

        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(Topic::VmEvents, "test", move |e| {
                if let BusEvent::Vm(e) = e {
                    seen.lock().expect("lock").push(e.kind);
                }
            });
        }

        let handle = spawn_collector(
            Arc::clone(&sim) as Arc<dyn InfraDriver>,
            Arc::clone(&bus),
            already_processed,
        );
        wait_for(|| !seen.lock().expect("lock").is_empty()).await;
        handle.abort();

        assert_eq!(*seen.lock().expect("lock"), vec![VmEventKind::PoweredOff]);
    }
}
