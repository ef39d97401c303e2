//! Scheduling loop tests against an in-memory platform.
//!
//! Every test drives `run_cycle_at` with explicit timestamps so cooldowns
//! can be crossed without sleeping.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Barrier, watch};

use memtide_controller::Controller;
use memtide_core::{ControllerConfig, Host, HostId, HostState, VirtualMachine, VmId};
use memtide_gateway::{
    CapacityProvisioner, GatewayError, GatewayFuture, Platform, RequestId, UnavailableProvisioner,
};
use memtide_state::{
    ControlSnapshot, HostControlState, StateStore, Timestamp, VmControlState,
};

const T0: Timestamp = 1_700_000_000_000;
const SECOND: u64 = 1000;

// ── Fakes ─────────────────────────────────────────────────────────

#[derive(Default)]
struct FakePlatform {
    vms: Mutex<Vec<VirtualMachine>>,
    hosts: Mutex<Vec<Host>>,
    resizes: Mutex<Vec<(VmId, u64)>>,
    migrations: Mutex<Vec<(VmId, HostId)>>,
    failing_resizes: Mutex<HashSet<VmId>>,
    listing_fails: AtomicBool,
    /// When set, `get_host` snapshots the host and then waits here (for at
    /// most `HOST_GATE_WAIT`) so concurrent lookups overlap.
    host_gate: Option<Barrier>,
}

const HOST_GATE_WAIT: Duration = Duration::from_millis(200);

impl FakePlatform {
    fn new(vms: Vec<VirtualMachine>, hosts: Vec<Host>) -> Arc<Self> {
        Arc::new(Self {
            vms: Mutex::new(vms),
            hosts: Mutex::new(hosts),
            ..Self::default()
        })
    }

    fn resizes(&self) -> Vec<(VmId, u64)> {
        self.resizes.lock().unwrap().clone()
    }

    fn migrations(&self) -> Vec<(VmId, HostId)> {
        self.migrations.lock().unwrap().clone()
    }

    fn add_host(&self, host: Host) {
        self.hosts.lock().unwrap().push(host);
    }

    fn remove_vm(&self, vm_id: VmId) {
        self.vms.lock().unwrap().retain(|vm| vm.id != vm_id);
    }

    fn host_with_residents(&self, host: &Host) -> Host {
        let mut host = host.clone();
        host.vm_ids = self
            .vms
            .lock()
            .unwrap()
            .iter()
            .filter(|vm| vm.host_id == host.id)
            .map(|vm| vm.id)
            .collect();
        host
    }
}

impl Platform for FakePlatform {
    fn list_vms(&self) -> GatewayFuture<'_, Vec<VirtualMachine>> {
        Box::pin(async move {
            if self.listing_fails.load(Ordering::SeqCst) {
                return Err(GatewayError::Unavailable("platform down".to_string()));
            }
            Ok(self.vms.lock().unwrap().clone())
        })
    }

    fn get_host(&self, host_id: HostId) -> GatewayFuture<'_, Host> {
        Box::pin(async move {
            let host = self.hosts.lock().unwrap().iter().find(|h| h.id == host_id).cloned();
            let host = host.map(|host| self.host_with_residents(&host));
            if let Some(gate) = &self.host_gate {
                let _ = tokio::time::timeout(HOST_GATE_WAIT, gate.wait()).await;
            }
            host.ok_or_else(|| GatewayError::NotFound(format!("host {host_id}")))
        })
    }

    fn list_hosts(&self) -> GatewayFuture<'_, Vec<Host>> {
        Box::pin(async move {
            let hosts = self.hosts.lock().unwrap().clone();
            Ok(hosts.iter().map(|h| self.host_with_residents(h)).collect())
        })
    }

    fn migrate(&self, vm_id: VmId, host_id: HostId) -> GatewayFuture<'_, bool> {
        Box::pin(async move {
            let mut vms = self.vms.lock().unwrap();
            let Some(vm) = vms.iter_mut().find(|vm| vm.id == vm_id) else {
                return Ok(false);
            };
            if vm.host_id == host_id {
                return Ok(false);
            }
            let memory = vm.allocated_memory;
            let source = vm.host_id;
            vm.host_id = host_id;

            for host in self.hosts.lock().unwrap().iter_mut() {
                if host.id == source {
                    host.free_memory += memory;
                } else if host.id == host_id {
                    host.free_memory = host.free_memory.saturating_sub(memory);
                }
            }
            self.migrations.lock().unwrap().push((vm_id, host_id));
            Ok(true)
        })
    }

    fn resize_running_vm<'a>(
        &'a self,
        vm_id: VmId,
        _host_name: &'a str,
        new_memory: u64,
    ) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            if self.failing_resizes.lock().unwrap().contains(&vm_id) {
                return Err(GatewayError::Command {
                    command: "setmem".to_string(),
                    status: Some(1),
                    stderr: "domain not found".to_string(),
                });
            }
            self.resizes.lock().unwrap().push((vm_id, new_memory));
            Ok(())
        })
    }
}

/// Brings up a fresh host on the platform when asked for capacity.
struct FakeProvisioner {
    platform: Arc<FakePlatform>,
    new_host: Host,
    requests: AtomicU32,
}

impl CapacityProvisioner for FakeProvisioner {
    fn request_capacity(&self, _cpus: f64, _memory: u64) -> GatewayFuture<'_, RequestId> {
        Box::pin(async move {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.platform.add_host(self.new_host.clone());
            Ok("req-1".to_string())
        })
    }

    fn poll_request<'a>(
        &'a self,
        _request_id: &'a RequestId,
        _timeout: Duration,
    ) -> GatewayFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }
}

// ── Helpers ───────────────────────────────────────────────────────

fn config() -> ControllerConfig {
    ControllerConfig {
        dry_run: false,
        system_memory_offset: 0,
        ..ControllerConfig::default()
    }
}

fn host(id: HostId, free: u64) -> Host {
    Host {
        id,
        name: format!("node-{id}"),
        state: HostState::Monitored,
        max_memory: 16_777_216,
        used_memory: 16_777_216 - free,
        free_memory: free,
        free_cpu: 400.0,
        vm_ids: Vec::new(),
    }
}

fn vm(id: VmId, host_id: HostId, allocated: u64, total: u64, free: u64) -> VirtualMachine {
    VirtualMachine::new(id, host_id, format!("node-{host_id}"), allocated)
        .with_telemetry(total, total, free, 0)
}

/// 10% free on 1,000,000 KiB: wants to grow to 1,285,714 under a 2,000,000 baseline.
fn growing_vm(id: VmId, host_id: HostId) -> VirtualMachine {
    vm(id, host_id, 2_000_000, 1_000_000, 100_000)
}

/// 60% free on 1,000,000 KiB: wants to shrink to 571,429.
fn shrinking_vm(id: VmId, host_id: HostId) -> VirtualMachine {
    vm(id, host_id, 1_048_576, 1_000_000, 600_000)
}

/// Exactly on target; never resized, a cheap migration victim.
fn idle_vm(id: VmId, host_id: HostId) -> VirtualMachine {
    vm(id, host_id, 512_000, 500_000, 150_000)
}

fn pressured_at(at: Timestamp, baseline: u64) -> VmControlState {
    VmControlState {
        last_adjusted_at: Some(at),
        baseline_memory: Some(baseline),
        memory_offset: Some(0),
        consecutive_starvation_count: 0,
    }
}

fn controller(
    platform: Arc<FakePlatform>,
    provisioner: Arc<dyn CapacityProvisioner>,
    config: ControllerConfig,
    store: StateStore,
) -> (Controller, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let controller = Controller::new(config, platform, provisioner, store, rx).unwrap();
    (controller, tx)
}

fn simple_controller(
    platform: Arc<FakePlatform>,
    config: ControllerConfig,
) -> (Controller, StateStore, watch::Sender<bool>) {
    let store = StateStore::open_in_memory().unwrap();
    let (controller, tx) =
        controller(platform, Arc::new(UnavailableProvisioner), config, store.clone());
    (controller, store, tx)
}

// ── Sizing through the loop ───────────────────────────────────────

#[tokio::test]
async fn first_pressure_waits_then_shrinks() {
    let platform = FakePlatform::new(vec![shrinking_vm(1, 0)], vec![host(0, 4_000_000)]);
    let (controller, store, _tx) = simple_controller(platform.clone(), config());

    let report = controller.run_cycle_at(T0).await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.resized, 0);
    let state = controller.state().vm(1).unwrap();
    assert_eq!(state.baseline_memory, Some(1_048_576));
    assert_eq!(state.last_adjusted_at, Some(T0));

    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();
    assert_eq!(report.resized, 1);
    assert_eq!(platform.resizes(), vec![(1, 571_429)]);

    // Telemetry has not caught up yet, but the VM is in cooldown.
    let report = controller.run_cycle_at(T0 + 15 * SECOND).await.unwrap();
    assert_eq!(report.resized, 0);
    assert_eq!(platform.resizes().len(), 1);

    let persisted = store.load().unwrap();
    assert_eq!(
        persisted.vms[&1].last_adjusted_at,
        Some(T0 + 10 * SECOND)
    );
}

#[tokio::test]
async fn growth_with_headroom_resizes_directly() {
    let platform = FakePlatform::new(vec![growing_vm(1, 0)], vec![host(0, 4_000_000)]);
    let (controller, _store, _tx) = simple_controller(platform.clone(), config());

    controller.run_cycle_at(T0).await.unwrap();
    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();

    assert_eq!(report.resized, 1);
    assert_eq!(platform.resizes(), vec![(1, 1_285_714)]);
    assert!(platform.migrations().is_empty());
}

#[tokio::test]
async fn dry_run_logs_but_still_stamps_the_vm() {
    let platform = FakePlatform::new(vec![shrinking_vm(1, 0)], vec![host(0, 4_000_000)]);
    let mut cfg = config();
    cfg.dry_run = true;
    let (controller, _store, _tx) = simple_controller(platform.clone(), cfg);

    controller.run_cycle_at(T0).await.unwrap();
    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();

    assert_eq!(report.resized, 1);
    assert!(platform.resizes().is_empty());
    assert_eq!(
        controller.state().vm(1).unwrap().last_adjusted_at,
        Some(T0 + 10 * SECOND)
    );
}

#[tokio::test]
async fn failed_resize_leaves_state_and_other_vms_alone() {
    let platform = FakePlatform::new(
        vec![shrinking_vm(1, 0), shrinking_vm(2, 0)],
        vec![host(0, 4_000_000)],
    );
    platform.failing_resizes.lock().unwrap().insert(1);
    let mut cfg = config();
    cfg.workers = 2;
    let (controller, _store, _tx) = simple_controller(platform.clone(), cfg);

    controller.run_cycle_at(T0).await.unwrap();
    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();

    assert_eq!(report.resized, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(platform.resizes(), vec![(2, 571_429)]);
    assert_eq!(controller.state().vm(1).unwrap().last_adjusted_at, Some(T0));
    assert_eq!(
        controller.state().vm(2).unwrap().last_adjusted_at,
        Some(T0 + 10 * SECOND)
    );
}

#[tokio::test]
async fn unmonitored_and_filtered_vms_are_skipped() {
    let mut other_user = shrinking_vm(2, 0);
    other_user.user_id = 9;
    let no_agent = VirtualMachine::new(3, 0, "node-0", 1_048_576);
    let platform = FakePlatform::new(
        vec![shrinking_vm(1, 0), other_user, no_agent],
        vec![host(0, 4_000_000)],
    );
    let mut cfg = config();
    cfg.user_filter = Some(0);
    let (controller, _store, _tx) = simple_controller(platform, cfg);

    let report = controller.run_cycle_at(T0).await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert!(controller.state().vm(1).is_some());
    assert!(controller.state().vm(2).is_none());
    assert!(controller.state().vm(3).is_none());
}

// ── Migration ─────────────────────────────────────────────────────

#[tokio::test]
async fn blocked_growth_without_victim_changes_nothing() {
    let platform = FakePlatform::new(
        vec![growing_vm(1, 0)],
        vec![host(0, 200_000), host(1, 8_000_000)],
    );
    let (controller, _store, _tx) = simple_controller(platform.clone(), config());

    controller.run_cycle_at(T0).await.unwrap();
    let before = controller.state().vm(1).unwrap();

    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();
    assert_eq!(report.declined, 1);
    assert!(platform.resizes().is_empty());
    assert!(platform.migrations().is_empty());
    assert_eq!(controller.state().vm(1).unwrap(), before);
    assert_eq!(
        controller.state().host(0),
        HostControlState::default()
    );
}

#[tokio::test]
async fn migration_frees_room_for_the_next_cycle() {
    let platform = FakePlatform::new(
        vec![growing_vm(1, 0), idle_vm(2, 0)],
        vec![host(0, 200_000), host(1, 8_000_000)],
    );
    let (controller, _store, _tx) = simple_controller(platform.clone(), config());

    controller.run_cycle_at(T0).await.unwrap();

    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();
    assert_eq!(report.migrations, 1);
    assert_eq!(platform.migrations(), vec![(2, 1)]);
    assert!(platform.resizes().is_empty());
    assert_eq!(
        controller.state().host(0).last_migration_at,
        Some(T0 + 10 * SECOND)
    );
    assert_eq!(controller.state().vm(1).unwrap().last_adjusted_at, Some(T0));

    let report = controller.run_cycle_at(T0 + 20 * SECOND).await.unwrap();
    assert_eq!(report.resized, 1);
    assert_eq!(platform.resizes(), vec![(1, 1_285_714)]);
}

#[tokio::test]
async fn host_in_migration_cooldown_is_left_alone() {
    let platform = FakePlatform::new(
        vec![growing_vm(1, 0), idle_vm(2, 0)],
        vec![host(0, 200_000), host(1, 8_000_000)],
    );
    let store = StateStore::open_in_memory().unwrap();
    let mut seeded = ControlSnapshot::default();
    seeded.vms.insert(1, pressured_at(T0, 2_000_000));
    seeded.hosts.insert(
        0,
        HostControlState {
            last_migration_at: Some(T0),
        },
    );
    store.save(&seeded).unwrap();
    let (controller, _tx) = controller(
        platform.clone(),
        Arc::new(UnavailableProvisioner),
        config(),
        store,
    );

    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();
    assert_eq!(report.declined, 1);
    assert!(platform.migrations().is_empty());

    let report = controller.run_cycle_at(T0 + 45 * SECOND).await.unwrap();
    assert_eq!(report.migrations, 1);
    assert_eq!(platform.migrations(), vec![(2, 1)]);
}

#[tokio::test]
async fn provisioner_is_asked_when_no_host_fits() {
    let platform = FakePlatform::new(
        vec![growing_vm(1, 0), idle_vm(2, 0)],
        vec![host(0, 200_000), host(1, 100_000)],
    );
    let provisioner = Arc::new(FakeProvisioner {
        platform: platform.clone(),
        new_host: host(7, 8_000_000),
        requests: AtomicU32::new(0),
    });
    let store = StateStore::open_in_memory().unwrap();
    let (controller, _tx) = controller(platform.clone(), provisioner.clone(), config(), store);

    controller.run_cycle_at(T0).await.unwrap();
    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();

    assert_eq!(report.migrations, 1);
    assert_eq!(provisioner.requests.load(Ordering::SeqCst), 1);
    assert_eq!(platform.migrations(), vec![(2, 7)]);
}

#[tokio::test]
async fn no_destination_without_provisioner() {
    let platform = FakePlatform::new(
        vec![growing_vm(1, 0), idle_vm(2, 0)],
        vec![host(0, 200_000), host(1, 100_000)],
    );
    let (controller, _store, _tx) = simple_controller(platform.clone(), config());

    controller.run_cycle_at(T0).await.unwrap();
    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();

    assert_eq!(report.declined, 1);
    assert!(platform.migrations().is_empty());
    assert_eq!(controller.state().host(0), HostControlState::default());
}

#[tokio::test]
async fn dry_run_never_migrates() {
    let platform = FakePlatform::new(
        vec![growing_vm(1, 0), idle_vm(2, 0)],
        vec![host(0, 200_000), host(1, 8_000_000)],
    );
    let mut cfg = config();
    cfg.dry_run = true;
    let (controller, _store, _tx) = simple_controller(platform.clone(), cfg);

    controller.run_cycle_at(T0).await.unwrap();
    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();

    assert_eq!(report.declined, 1);
    assert!(platform.migrations().is_empty());
    assert_eq!(controller.state().host(0).last_migration_at, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn growth_on_one_host_is_serialized() {
    // Both growing VMs look their host up at the same time unless the
    // second lookup waits for the first growth request to finish.
    let platform = Arc::new(FakePlatform {
        vms: Mutex::new(vec![growing_vm(1, 0), growing_vm(2, 0), idle_vm(3, 0)]),
        hosts: Mutex::new(vec![host(0, 200_000), host(1, 8_000_000)]),
        host_gate: Some(Barrier::new(2)),
        ..FakePlatform::default()
    });
    let store = StateStore::open_in_memory().unwrap();
    let mut seeded = ControlSnapshot::default();
    seeded.vms.insert(1, pressured_at(T0, 2_000_000));
    seeded.vms.insert(2, pressured_at(T0, 2_000_000));
    store.save(&seeded).unwrap();
    let mut cfg = config();
    cfg.workers = 4;
    let (controller, _tx) = controller(
        platform.clone(),
        Arc::new(UnavailableProvisioner),
        cfg,
        store,
    );

    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();

    // One worker evicts vm 3; the other then finds the freed room.
    assert_eq!(platform.migrations(), vec![(3, 1)]);
    assert_eq!(platform.resizes().len(), 1);
    assert_eq!(report.migrations, 1);
    assert_eq!(report.resized, 1);
    assert_eq!(report.declined, 0);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let platform = FakePlatform::new(vec![], vec![]);
    let mut cfg = config();
    cfg.workers = 0;
    let (_tx, rx) = watch::channel(false);

    let built = Controller::new(
        cfg,
        platform,
        Arc::new(UnavailableProvisioner),
        StateStore::open_in_memory().unwrap(),
        rx,
    );
    assert!(built.is_err());
}

// ── Persistence ───────────────────────────────────────────────────

#[tokio::test]
async fn departed_vms_are_pruned_from_the_store() {
    let platform = FakePlatform::new(
        vec![shrinking_vm(1, 0), shrinking_vm(2, 0)],
        vec![host(0, 4_000_000)],
    );
    let (controller, store, _tx) = simple_controller(platform.clone(), config());

    controller.run_cycle_at(T0).await.unwrap();
    assert_eq!(store.load().unwrap().vms.len(), 2);

    platform.remove_vm(2);
    let report = controller.run_cycle_at(T0 + SECOND).await.unwrap();
    assert_eq!(report.pruned, 1);

    let persisted = store.load().unwrap();
    assert!(persisted.vms.contains_key(&1));
    assert!(!persisted.vms.contains_key(&2));
}

#[tokio::test]
async fn listing_failure_skips_the_cycle() {
    let platform = FakePlatform::new(vec![shrinking_vm(1, 0)], vec![host(0, 4_000_000)]);
    let (controller, store, _tx) = simple_controller(platform.clone(), config());

    controller.run_cycle_at(T0).await.unwrap();
    platform.listing_fails.store(true, Ordering::SeqCst);

    assert!(controller.run_cycle_at(T0 + 10 * SECOND).await.is_err());
    assert!(controller.state().vm(1).is_some());
    assert_eq!(store.load().unwrap().vms.len(), 1);
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memtide.redb");
    let platform = FakePlatform::new(vec![shrinking_vm(1, 0)], vec![host(0, 4_000_000)]);

    {
        let store = StateStore::open(&path).unwrap();
        let (controller, _tx) = controller(
            platform.clone(),
            Arc::new(UnavailableProvisioner),
            config(),
            store,
        );
        controller.run_cycle_at(T0).await.unwrap();
    }

    let store = StateStore::open(&path).unwrap();
    let (controller, _tx) = controller(
        platform.clone(),
        Arc::new(UnavailableProvisioner),
        config(),
        store,
    );
    // The first pressure event was remembered, so this cycle resizes.
    let report = controller.run_cycle_at(T0 + 10 * SECOND).await.unwrap();
    assert_eq!(report.resized, 1);
}

#[tokio::test]
async fn run_stops_on_shutdown_and_saves() {
    let platform = FakePlatform::new(vec![shrinking_vm(1, 0)], vec![host(0, 4_000_000)]);
    let (controller, store, tx) = simple_controller(platform, config());

    let stop = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(controller.run(), stop);
    })
    .await
    .expect("controller did not stop");

    assert!(store.load().unwrap().vms.contains_key(&1));
}
