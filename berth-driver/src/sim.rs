//! In-memory driver simulator.
//!
//! Backs the test suites: tracks VM state, bumps change versions on
//! reconfigure, emits lifecycle events with monotonic keys, and lets
//! tests inject faults per operation and shape guest behavior.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::VmRef;
use chrono::Utc;
use tokio::sync::{mpsc, Notify};

use crate::error::{DriverError, PowerState};
use crate::{
    GuestAuth, InfraDriver, LogCloser, LogStream, MetricSeries, VmConfigInfo, VmCreateSpec,
    VmEvent, VmEventKind, VmProperties, VmReconfigSpec, VmRuntimeInfo,
};

const SESSIONS_PREFIX: &str = "guestinfo.vice..sessions|";
const STARTED_SUFFIX: &str = ".started";

#[derive(Debug, Clone)]
struct SimVm {
    name: String,
    num_cpus: u32,
    memory_mb: u64,
    power: PowerState,
    change_version: u64,
    extra_config: BTreeMap<String, String>,
    log_lines: Vec<String>,
    repairs: u32,
    /// Per-CPU Mhz values reported by perf queries.
    cpu_mhz: Vec<i64>,
    /// Active memory in KB reported by perf queries.
    active_kb: i64,
}

#[derive(Default)]
struct SimState {
    vms: HashMap<VmRef, SimVm>,
    events: Vec<VmEvent>,
    faults: HashMap<&'static str, VecDeque<DriverError>>,
    /// Pending "kill" deliveries to swallow before honoring one.
    ignore_kills: u32,
}

/// Tunable guest behavior.
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// Write every session's started marker when a VM powers on.
    pub auto_start_sessions: bool,
    /// Delay between a honored kill signal and the power-off it causes.
    pub kill_delay: Duration,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            auto_start_sessions: true,
            kill_delay: Duration::from_millis(10),
        }
    }
}

/// An in-memory [`InfraDriver`].
pub struct SimDriver {
    state: Arc<Mutex<SimState>>,
    changed: Arc<Notify>,
    next_vm: AtomicU64,
    next_event_key: Arc<AtomicU64>,
    behavior: SimBehavior,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::with_behavior(SimBehavior::default())
    }

    #[must_use]
    pub fn with_behavior(behavior: SimBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            changed: Arc::new(Notify::new()),
            next_vm: AtomicU64::new(1),
            next_event_key: Arc::new(AtomicU64::new(1)),
            behavior,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queues `err` to be returned by the next call to `op`.
    pub fn inject_fault(&self, op: &'static str, err: DriverError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Swallow the next `n` kill deliveries without powering off.
    pub fn ignore_next_kills(&self, n: u32) {
        self.lock().ignore_kills = n;
    }

    fn take_fault(&self, op: &'static str) -> Option<DriverError> {
        self.lock().faults.get_mut(op).and_then(VecDeque::pop_front)
    }

    /// Simulates the guest writing an extra-config key.
    pub fn guest_write(&self, vm: &VmRef, key: &str, value: &str) {
        if let Some(v) = self.lock().vms.get_mut(vm) {
            v.extra_config.insert(key.to_owned(), value.to_owned());
        }
        self.changed.notify_waiters();
    }

    /// Seeds log content served by [`InfraDriver::open_log`].
    pub fn set_log_lines(&self, vm: &VmRef, lines: Vec<String>) {
        if let Some(v) = self.lock().vms.get_mut(vm) {
            v.log_lines = lines;
        }
    }

    /// Shapes the perf series reported for `vm`.
    pub fn set_perf_profile(&self, vm: &VmRef, cpu_mhz: Vec<i64>, active_kb: i64) {
        if let Some(v) = self.lock().vms.get_mut(vm) {
            v.cpu_mhz = cpu_mhz;
            v.active_kb = active_kb;
        }
    }

    /// Registers a pre-existing VM, as found during startup sync.
    pub fn seed_vm(
        &self,
        name: &str,
        power: PowerState,
        extra_config: BTreeMap<String, String>,
    ) -> VmRef {
        let vm = VmRef::from(format!("vm-{}", self.next_vm.fetch_add(1, Ordering::SeqCst)));
        self.lock().vms.insert(
            vm.clone(),
            SimVm {
                name: name.to_owned(),
                num_cpus: 1,
                memory_mb: 512,
                power,
                change_version: 1,
                extra_config,
                log_lines: Vec::new(),
                repairs: 0,
                cpu_mhz: vec![200],
                active_kb: 1024,
            },
        );
        vm
    }

    #[must_use]
    pub fn power_state(&self, vm: &VmRef) -> Option<PowerState> {
        self.lock().vms.get(vm).map(|v| v.power)
    }

    #[must_use]
    pub fn repairs(&self, vm: &VmRef) -> u32 {
        self.lock().vms.get(vm).map_or(0, |v| v.repairs)
    }

    #[must_use]
    pub fn extra_config(&self, vm: &VmRef) -> BTreeMap<String, String> {
        self.lock()
            .vms
            .get(vm)
            .map(|v| v.extra_config.clone())
            .unwrap_or_default()
    }

    /// Emits a lifecycle event, as the hypervisor would.
    pub fn emit(&self, vm: &VmRef, kind: VmEventKind) {
        let key = self.next_event_key.fetch_add(1, Ordering::SeqCst);
        self.lock().events.push(VmEvent {
            key,
            vm: vm.clone(),
            kind,
            created: Utc::now(),
        });
        self.changed.notify_waiters();
    }

    fn set_power(&self, vm: &VmRef, power: PowerState, kind: VmEventKind) {
        if let Some(v) = self.lock().vms.get_mut(vm) {
            v.power = power;
        }
        self.emit(vm, kind);
    }

    fn mark_sessions_started(&self, vm: &VmRef) {
        let mut state = self.lock();
        if let Some(v) = state.vms.get_mut(vm) {
            let started: Vec<String> = v
                .extra_config
                .keys()
                .filter(|k| k.starts_with(SESSIONS_PREFIX) && k.ends_with(STARTED_SUFFIX))
                .cloned()
                .collect();
            for key in started {
                v.extra_config.insert(key, "true".to_owned());
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }

    fn properties_of(vm: &SimVm) -> VmProperties {
        VmProperties {
            config: VmConfigInfo {
                name: vm.name.clone(),
                change_version: vm.change_version.to_string(),
                num_cpus: vm.num_cpus,
                memory_mb: vm.memory_mb,
                extra_config: vm.extra_config.clone(),
            },
            runtime: VmRuntimeInfo {
                power_state: vm.power,
                host: "sim-host".to_owned(),
            },
        }
    }
}

#[async_trait]
impl InfraDriver for SimDriver {
    async fn create_vm(&self, spec: &VmCreateSpec) -> Result<VmRef, DriverError> {
        if let Some(err) = self.take_fault("create_vm") {
            return Err(err);
        }
        let vm = VmRef::from(format!("vm-{}", self.next_vm.fetch_add(1, Ordering::SeqCst)));
        self.lock().vms.insert(
            vm.clone(),
            SimVm {
                name: spec.name.clone(),
                num_cpus: spec.num_cpus.max(1),
                memory_mb: spec.memory_mb.max(1),
                power: PowerState::PoweredOff,
                change_version: 1,
                extra_config: spec.extra_config.clone(),
                log_lines: Vec::new(),
                repairs: 0,
                cpu_mhz: vec![200; spec.num_cpus.max(1) as usize],
                active_kb: 1024,
            },
        );
        tracing::debug!(vm = %vm, name = %spec.name, "created vm");
        Ok(vm)
    }

    async fn reconfigure_vm(&self, vm: &VmRef, spec: VmReconfigSpec) -> Result<(), DriverError> {
        if let Some(err) = self.take_fault("reconfigure_vm") {
            return Err(err);
        }
        {
            let mut state = self.lock();
            let v = state
                .vms
                .get_mut(vm)
                .ok_or_else(|| DriverError::NotFound(vm.to_string()))?;
            if let Some(expected) = &spec.change_version {
                if *expected != v.change_version.to_string() {
                    return Err(DriverError::ConcurrentAccess {
                        change_version: v.change_version.to_string(),
                    });
                }
            }
            if let Some(name) = spec.name {
                v.name = name;
            }
            for (k, val) in spec.extra_config {
                v.extra_config.insert(k, val);
            }
            v.change_version += 1;
        }
        self.emit(vm, VmEventKind::Reconfigured);
        Ok(())
    }

    async fn power_on(&self, vm: &VmRef) -> Result<(), DriverError> {
        if let Some(err) = self.take_fault("power_on") {
            return Err(err);
        }
        let existing = self
            .power_state(vm)
            .ok_or_else(|| DriverError::NotFound(vm.to_string()))?;
        if existing == PowerState::PoweredOn {
            return Err(DriverError::InvalidPowerState { existing });
        }
        self.set_power(vm, PowerState::PoweredOn, VmEventKind::PoweredOn);
        if self.behavior.auto_start_sessions {
            self.mark_sessions_started(vm);
        }
        Ok(())
    }

    async fn power_off(&self, vm: &VmRef) -> Result<(), DriverError> {
        if let Some(err) = self.take_fault("power_off") {
            return Err(err);
        }
        let existing = self
            .power_state(vm)
            .ok_or_else(|| DriverError::NotFound(vm.to_string()))?;
        if existing == PowerState::PoweredOff {
            return Err(DriverError::InvalidPowerState { existing });
        }
        self.set_power(vm, PowerState::PoweredOff, VmEventKind::PoweredOff);
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<(), DriverError> {
        if let Some(err) = self.take_fault("destroy_vm") {
            return Err(err);
        }
        if self.lock().vms.remove(vm).is_none() {
            return Err(DriverError::NotFound(vm.to_string()));
        }
        self.emit(vm, VmEventKind::Removed);
        Ok(())
    }

    async fn start_guest_program(
        &self,
        vm: &VmRef,
        program: &str,
        args: &[String],
        _auth: &GuestAuth,
    ) -> Result<(), DriverError> {
        if let Some(err) = self.take_fault("start_guest_program") {
            return Err(err);
        }
        if self.power_state(vm) != Some(PowerState::PoweredOn) {
            return Err(DriverError::InvalidPowerState {
                existing: PowerState::PoweredOff,
            });
        }
        tracing::debug!(vm = %vm, program, ?args, "guest program");
        if program == "kill" {
            {
                let mut state = self.lock();
                if state.ignore_kills > 0 {
                    state.ignore_kills -= 1;
                    return Ok(());
                }
            }
            let state = Arc::clone(&self.state);
            let changed = Arc::clone(&self.changed);
            let key_source = Arc::clone(&self.next_event_key);
            let vm = vm.clone();
            let delay = self.behavior.kill_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut guard = match state.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(v) = guard.vms.get_mut(&vm) {
                    if v.power == PowerState::PoweredOn {
                        v.power = PowerState::PoweredOff;
                        let key = key_source.fetch_add(1, Ordering::SeqCst);
                        guard.events.push(VmEvent {
                            key,
                            vm: vm.clone(),
                            kind: VmEventKind::PoweredOff,
                            created: Utc::now(),
                        });
                    }
                }
                drop(guard);
                changed.notify_waiters();
            });
        }
        Ok(())
    }

    async fn wait_for_power_state(
        &self,
        vm: &VmRef,
        desired: PowerState,
    ) -> Result<(), DriverError> {
        loop {
            let notified = self.changed.notified();
            match self.power_state(vm) {
                None => return Err(DriverError::NotFound(vm.to_string())),
                Some(p) if p == desired => return Ok(()),
                Some(_) => notified.await,
            }
        }
    }

    async fn wait_for_extra_config_key(
        &self,
        vm: &VmRef,
        key: &str,
    ) -> Result<String, DriverError> {
        loop {
            let notified = self.changed.notified();
            {
                let state = self.lock();
                let v = state
                    .vms
                    .get(vm)
                    .ok_or_else(|| DriverError::NotFound(vm.to_string()))?;
                if let Some(value) = v.extra_config.get(key) {
                    if !value.is_empty() && value != "<nil>" {
                        return Ok(value.clone());
                    }
                }
            }
            notified.await;
        }
    }

    async fn properties(&self, vm: &VmRef) -> Result<VmProperties, DriverError> {
        if let Some(err) = self.take_fault("properties") {
            return Err(err);
        }
        self.lock()
            .vms
            .get(vm)
            .map(Self::properties_of)
            .ok_or_else(|| DriverError::NotFound(vm.to_string()))
    }

    async fn list_vms(&self) -> Result<Vec<(VmRef, VmProperties)>, DriverError> {
        let state = self.lock();
        let mut out: Vec<(VmRef, VmProperties)> = state
            .vms
            .iter()
            .map(|(vm, v)| (vm.clone(), Self::properties_of(v)))
            .collect();
        out.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        Ok(out)
    }

    async fn next_events(
        &self,
        after_key: u64,
        page_size: u32,
    ) -> Result<Vec<VmEvent>, DriverError> {
        let state = self.lock();
        Ok(state
            .events
            .iter()
            .filter(|e| e.key > after_key)
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn perf_sample(
        &self,
        vms: &[VmRef],
        counters: &[&str],
        _max_samples: u32,
        interval_secs: u32,
    ) -> Result<Vec<MetricSeries>, DriverError> {
        if let Some(err) = self.take_fault("perf_sample") {
            return Err(err);
        }
        let now = Utc::now();
        let state = self.lock();
        let mut out = Vec::new();
        for vm in vms {
            let Some(v) = state.vms.get(vm) else { continue };
            for counter in counters {
                match *counter {
                    "cpu.usagemhz.average" => {
                        // The aggregate entry has an empty instance id;
                        // consumers are expected to discard it.
                        out.push(MetricSeries {
                            vm: vm.clone(),
                            counter: (*counter).to_owned(),
                            instance: String::new(),
                            interval_secs,
                            timestamps: vec![now],
                            values: vec![v.cpu_mhz.iter().sum()],
                        });
                        for (cpu, &mhz) in v.cpu_mhz.iter().enumerate() {
                            out.push(MetricSeries {
                                vm: vm.clone(),
                                counter: (*counter).to_owned(),
                                instance: cpu.to_string(),
                                interval_secs,
                                timestamps: vec![now],
                                values: vec![mhz],
                            });
                        }
                    }
                    "mem.active.average" => {
                        out.push(MetricSeries {
                            vm: vm.clone(),
                            counter: (*counter).to_owned(),
                            instance: String::new(),
                            interval_secs,
                            timestamps: vec![now],
                            values: vec![v.active_kb],
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(out)
    }

    async fn open_log(
        &self,
        vm: &VmRef,
        file: &str,
        tail: Option<usize>,
        follow: bool,
    ) -> Result<LogStream, DriverError> {
        let lines = {
            let state = self.lock();
            let v = state
                .vms
                .get(vm)
                .ok_or_else(|| DriverError::NotFound(vm.to_string()))?;
            v.log_lines.clone()
        };
        tracing::debug!(vm = %vm, file, follow, "open log");

        let (tx, rx) = mpsc::channel(16);
        let closer = LogCloser::new();
        let producer_closer = closer.clone();
        tokio::spawn(async move {
            let start = tail.map_or(0, |n| lines.len().saturating_sub(n));
            for line in &lines[start..] {
                let mut chunk = line.clone().into_bytes();
                chunk.push(b'\n');
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            if follow {
                // Hold the channel open until the consumer closes it.
                producer_closer.closed().await;
            }
        });

        Ok(LogStream { rx, closer })
    }

    async fn repair_vm(&self, vm: &VmRef) -> Result<(), DriverError> {
        if let Some(err) = self.take_fault("repair_vm") {
            return Err(err);
        }
        let mut state = self.lock();
        let v = state
            .vms
            .get_mut(vm)
            .ok_or_else(|| DriverError::NotFound(vm.to_string()))?;
        v.repairs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_spec(name: &str) -> VmCreateSpec {
        VmCreateSpec {
            name: name.to_owned(),
            num_cpus: 2,
            memory_mb: 512,
            ..VmCreateSpec::default()
        }
    }

    #[tokio::test]
    async fn reconfigure_bumps_change_version() {
        let sim = SimDriver::new();
        let vm = sim.create_vm(&vm_spec("a")).await.expect("create");
        let before = sim.properties(&vm).await.expect("props").config.change_version;
        sim.reconfigure_vm(&vm, VmReconfigSpec::default())
            .await
            .expect("reconfigure");
        let after = sim.properties(&vm).await.expect("props").config.change_version;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn stale_change_version_is_concurrent_access() {
        let sim = SimDriver::new();
        let vm = sim.create_vm(&vm_spec("a")).await.expect("create");
        sim.reconfigure_vm(&vm, VmReconfigSpec::default())
            .await
            .expect("first");
        let stale = VmReconfigSpec {
            change_version: Some("1".to_owned()),
            ..VmReconfigSpec::default()
        };
        match sim.reconfigure_vm(&vm, stale).await {
            Err(DriverError::ConcurrentAccess { .. }) => {}
            other => panic!("expected ConcurrentAccess, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn power_on_marks_sessions_started() {
        let sim = SimDriver::new();
        let mut spec = vm_spec("a");
        spec.extra_config.insert(
            "guestinfo.vice..sessions|s1.started".to_owned(),
            "<nil>".to_owned(),
        );
        let vm = sim.create_vm(&spec).await.expect("create");
        sim.power_on(&vm).await.expect("power on");
        let value = sim
            .wait_for_extra_config_key(&vm, "guestinfo.vice..sessions|s1.started")
            .await
            .expect("wait");
        assert_eq!(value, "true");
    }

    #[tokio::test]
    async fn kill_program_powers_off_after_delay() {
        let sim = SimDriver::new();
        let vm = sim.create_vm(&vm_spec("a")).await.expect("create");
        sim.power_on(&vm).await.expect("power on");
        sim.start_guest_program(&vm, "kill", &["TERM".to_owned()], &GuestAuth::default())
            .await
            .expect("kill");
        sim.wait_for_power_state(&vm, PowerState::PoweredOff)
            .await
            .expect("wait off");
        assert_eq!(sim.power_state(&vm), Some(PowerState::PoweredOff));
    }

    #[tokio::test]
    async fn ignored_kills_leave_vm_running() {
        let sim = SimDriver::new();
        let vm = sim.create_vm(&vm_spec("a")).await.expect("create");
        sim.power_on(&vm).await.expect("power on");
        sim.ignore_next_kills(1);
        sim.start_guest_program(&vm, "kill", &["TERM".to_owned()], &GuestAuth::default())
            .await
            .expect("kill");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sim.power_state(&vm), Some(PowerState::PoweredOn));
    }

    #[tokio::test]
    async fn events_page_after_key() {
        let sim = SimDriver::new();
        let vm = sim.create_vm(&vm_spec("a")).await.expect("create");
        sim.power_on(&vm).await.expect("on");
        sim.power_off(&vm).await.expect("off");
        let all = sim.next_events(0, 25).await.expect("events");
        assert_eq!(all.len(), 2);
        let rest = sim.next_events(all[0].key, 25).await.expect("events");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].kind, VmEventKind::PoweredOff);
    }

    #[tokio::test]
    async fn perf_sample_includes_aggregate_and_per_cpu() {
        let sim = SimDriver::new();
        let vm = sim.create_vm(&vm_spec("a")).await.expect("create");
        sim.set_perf_profile(&vm, vec![100, 300], 2048);
        let series = sim
            .perf_sample(
                &[vm.clone()],
                &["cpu.usagemhz.average", "mem.active.average"],
                1,
                20,
            )
            .await
            .expect("sample");
        let aggregate: Vec<_> = series
            .iter()
            .filter(|s| s.counter == "cpu.usagemhz.average" && s.instance.is_empty())
            .collect();
        assert_eq!(aggregate.len(), 1);
        assert_eq!(aggregate[0].values, vec![400]);
        let per_cpu = series
            .iter()
            .filter(|s| s.counter == "cpu.usagemhz.average" && !s.instance.is_empty())
            .count();
        assert_eq!(per_cpu, 2);
    }

    #[tokio::test]
    async fn log_tail_limits_replay() {
        let sim = SimDriver::new();
        let vm = sim.create_vm(&vm_spec("a")).await.expect("create");
        sim.set_log_lines(&vm, vec!["one".into(), "two".into(), "three".into()]);
        let mut stream = sim.open_log(&vm, "tether.debug", Some(2), false).await.expect("open");
        let mut got = Vec::new();
        while let Some(chunk) = stream.rx.recv().await {
            got.push(String::from_utf8_lossy(&chunk).trim().to_owned());
        }
        assert_eq!(got, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let sim = SimDriver::new();
        let vm = sim.create_vm(&vm_spec("a")).await.expect("create");
        sim.power_on(&vm).await.expect("on");
        sim.inject_fault(
            "power_off",
            DriverError::VmConfigFault {
                message_keys: vec![crate::VM_NOT_SUSPENDED_KEY.to_owned()],
            },
        );
        let first = sim.power_off(&vm).await;
        assert!(matches!(first, Err(DriverError::VmConfigFault { .. })));
        sim.power_off(&vm).await.expect("second attempt clean");
    }
}
