//! Event-driven cache updates.
//!
//! VM events from the bus are queued onto a dedicated task (bus callbacks
//! must not block) and applied to the cache one at a time, which keeps
//! per-VM ordering. Every applied event is republished as a
//! container-level event for API subscribers.

use std::sync::Arc;

use berth_core::{PowerEvent, State};
use berth_driver::{DriverError, InfraDriver, VmEvent};
use berth_events::{BusEvent, ContainerEvent, EventBus, Topic};
use berth_extraconfig::MigrationManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::ContainerCache;
use crate::container::Container;

/// Bus subscription id used by the cache pipeline.
pub const CACHE_SUBSCRIBER: &str = "container-cache";

/// Subscribes the cache to VM events and spawns the applier task.
///
/// The subscription starts suspended; call
/// `bus.resume(Topic::VmEvents, CACHE_SUBSCRIBER)` once the initial cache
/// sync completes so buffered events replay into a populated cache.
pub fn start_event_pipeline(
    cache: Arc<ContainerCache>,
    driver: Arc<dyn InfraDriver>,
    migrator: Arc<MigrationManager>,
    bus: Arc<EventBus>,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(Topic::VmEvents, CACHE_SUBSCRIBER, move |event| {
        if let BusEvent::Vm(event) = event {
            let _ = tx.send(event);
        }
    });
    bus.suspend(Topic::VmEvents, CACHE_SUBSCRIBER);

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            apply_vm_event(&cache, &driver, &migrator, &bus, event).await;
        }
    })
}

/// Applies one VM event to the cache.
pub async fn apply_vm_event(
    cache: &ContainerCache,
    driver: &Arc<dyn InfraDriver>,
    migrator: &MigrationManager,
    bus: &EventBus,
    event: VmEvent,
) {
    let Some(container) = cache.get_by_ref(&event.vm) else {
        return;
    };

    let mut evicted = false;
    {
        let mut inner = container.lock().await;

        // A container under repair ignores events entirely; in
        // particular a removed event must not evict it.
        if inner.state == State::Fixing {
            tracing::debug!(container = %container.id, kind = %event.kind, "event suppressed during repair");
            return;
        }

        if let Some(power_event) = event.kind.power_event() {
            let current = inner.state;
            let next = current.evented(power_event);
            if next != current {
                if matches!(next, State::Running | State::Stopped | State::Suspended) {
                    if let Err(e) = container.refresh(&mut inner, driver, migrator).await {
                        tracing::warn!(container = %container.id, error = %e, "event refresh failed");
                    }
                }
                if next == State::Stopped {
                    container.close_followers(&mut inner);
                }
                container.set_state(&mut inner, next);
            }
            if power_event == PowerEvent::Removed {
                evicted = true;
            }
        }
    }

    if evicted {
        cache.remove(&container).await;
    }

    bus.publish(
        Topic::ContainerEvents,
        &BusEvent::Container(ContainerEvent {
            id: container.id.clone(),
            vm: Some(event.vm.clone()),
            event: event.kind.to_string(),
            created: event.created,
        }),
    );
}

/// Repair path for a VM that faulted into an invalid state: mark the
/// container `Fixing`, invoke the driver's repair primitive, restore the
/// prior state, and hand the original fault back so the caller can retry.
pub async fn repair_and_return(
    container: &Arc<Container>,
    driver: &Arc<dyn InfraDriver>,
    original: DriverError,
) -> berth_core::CoreError {
    let (vm, prior) = {
        let mut inner = container.lock().await;
        let Some(vm) = inner.vm.clone() else {
            return original.into();
        };
        let prior = inner.state;
        inner.prior_state = Some(prior);
        container.set_state(&mut inner, State::Fixing);
        (vm, prior)
    };

    match driver.repair_vm(&vm).await {
        Ok(()) => {
            tracing::info!(container = %container.id, "vm repaired");
            let mut inner = container.lock().await;
            inner.exec_config.diagnostics.resurrections += 1;
            inner.prior_state = None;
            container.set_state(&mut inner, prior);
        }
        Err(e) => {
            tracing::warn!(container = %container.id, error = %e, "vm repair failed");
            let mut inner = container.lock().await;
            inner.prior_state = None;
            container.set_state(&mut inner, prior);
        }
    }

    original.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{ContainerId, ExecConfig, VmRef};
    use berth_driver::sim::SimDriver;
    use berth_driver::{PowerState, VmEventKind};
    use chrono::Utc;

    struct Fixture {
        cache: Arc<ContainerCache>,
        driver: Arc<dyn InfraDriver>,
        sim: Arc<SimDriver>,
        migrator: Arc<MigrationManager>,
        bus: Arc<EventBus>,
        container: Arc<Container>,
        vm: VmRef,
    }

    async fn fixture(initial: State) -> Fixture {
        let sim = Arc::new(SimDriver::new());
        let vm = sim.seed_vm("web", PowerState::PoweredOn, Default::default());
        let cache = Arc::new(ContainerCache::new());
        let container = Container::new(
            ContainerId::from("cafe0001".to_owned()),
            ExecConfig::new("cafe0001", "web"),
            initial,
        );
        container.lock().await.vm = Some(vm.clone());
        cache.put(Arc::clone(&container)).await;
        Fixture {
            cache,
            driver: Arc::clone(&sim) as Arc<dyn InfraDriver>,
            sim,
            migrator: Arc::new(MigrationManager::new()),
            bus: Arc::new(EventBus::new()),
            container,
            vm,
        }
    }

    fn vm_event(vm: &VmRef, kind: VmEventKind) -> VmEvent {
        VmEvent {
            key: 1,
            vm: vm.clone(),
            kind,
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn powered_off_event_moves_running_to_stopped() {
        let f = fixture(State::Running).await;
        apply_vm_event(
            &f.cache,
            &f.driver,
            &f.migrator,
            &f.bus,
            vm_event(&f.vm, VmEventKind::PoweredOff),
        )
        .await;
        assert_eq!(f.container.state(), State::Stopped);
    }

    #[tokio::test]
    async fn powered_off_event_suppressed_while_stopping() {
        let f = fixture(State::Stopping).await;
        apply_vm_event(
            &f.cache,
            &f.driver,
            &f.migrator,
            &f.bus,
            vm_event(&f.vm, VmEventKind::PoweredOff),
        )
        .await;
        assert_eq!(f.container.state(), State::Stopping);
    }

    #[tokio::test]
    async fn removed_event_evicts_container() {
        let f = fixture(State::Stopped).await;
        apply_vm_event(
            &f.cache,
            &f.driver,
            &f.migrator,
            &f.bus,
            vm_event(&f.vm, VmEventKind::Removed),
        )
        .await;
        assert_eq!(f.container.state(), State::Removed);
        assert!(f.cache.get(&f.container.id).is_none());
        assert!(f.cache.get_by_ref(&f.vm).is_none());
    }

    #[tokio::test]
    async fn removed_event_ignored_while_fixing() {
        let f = fixture(State::Fixing).await;
        apply_vm_event(
            &f.cache,
            &f.driver,
            &f.migrator,
            &f.bus,
            vm_event(&f.vm, VmEventKind::Removed),
        )
        .await;
        assert_eq!(f.container.state(), State::Fixing);
        assert!(f.cache.get(&f.container.id).is_some(), "entry must stay cached");
    }

    #[tokio::test]
    async fn stopped_transition_closes_followers() {
        let f = fixture(State::Running).await;
        let closer = berth_driver::LogCloser::new();
        f.container.lock().await.log_followers.push(closer.clone());
        apply_vm_event(
            &f.cache,
            &f.driver,
            &f.migrator,
            &f.bus,
            vm_event(&f.vm, VmEventKind::PoweredOff),
        )
        .await;
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn applied_events_republish_as_container_events() {
        let f = fixture(State::Running).await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            f.bus.subscribe(Topic::ContainerEvents, "test", move |e| {
                if let BusEvent::Container(c) = e {
                    seen.lock().expect("lock").push(c.event);
                }
            });
        }
        apply_vm_event(
            &f.cache,
            &f.driver,
            &f.migrator,
            &f.bus,
            vm_event(&f.vm, VmEventKind::PoweredOff),
        )
        .await;
        assert_eq!(*seen.lock().expect("lock"), vec!["powered off"]);
    }

    #[tokio::test]
    async fn repair_restores_prior_state_and_returns_original_fault() {
        let f = fixture(State::Running).await;
        let fault = DriverError::VmConfigFault {
            message_keys: vec!["msg.invalid.state".to_owned()],
        };
        let err = repair_and_return(&f.container, &f.driver, fault).await;
        assert!(matches!(
            err,
            berth_core::CoreError::InfrastructureFault(_)
        ));
        assert_eq!(f.container.state(), State::Running);
        assert_eq!(f.sim.repairs(&f.vm), 1);
        let inner = f.container.lock().await;
        assert_eq!(inner.exec_config.diagnostics.resurrections, 1);
    }
}
