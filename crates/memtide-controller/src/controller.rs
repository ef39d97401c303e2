//! Controller — periodic evaluation of every monitored VM.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use memtide_core::{ConfigError, ControllerConfig, UserId, VirtualMachine};
use memtide_gateway::{CapacityProvisioner, Platform, with_timeout};
use memtide_sizing::SizingAction;
use memtide_state::{ControlState, StateStore, Timestamp, epoch_millis};

use crate::migration::{GrowthOutcome, MigrationPolicy, apply_resize};

/// VMs the controller should evaluate: those reporting usable telemetry,
/// restricted to one owner when `user_filter` is set.
pub fn monitored_vms(vms: &[VirtualMachine], user_filter: Option<UserId>) -> Vec<VirtualMachine> {
    vms.iter()
        .filter(|vm| vm.is_monitorable())
        .filter(|vm| user_filter.is_none_or(|user| vm.user_id == user))
        .cloned()
        .collect()
}

/// Tally of one scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// VMs dispatched to the worker pool.
    pub evaluated: usize,
    pub resized: usize,
    pub migrations: usize,
    /// Growth requests that ended without a resize or migration.
    pub declined: usize,
    /// Evaluations aborted by a gateway error or a panic.
    pub failed: usize,
    /// State entries dropped for VMs no longer on the platform.
    pub pruned: usize,
}

/// How a single VM evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmOutcome {
    Unchanged,
    Resized,
    Migrated,
    Declined,
    Failed,
}

impl CycleReport {
    fn record(&mut self, outcome: VmOutcome) {
        match outcome {
            VmOutcome::Unchanged => {}
            VmOutcome::Resized => self.resized += 1,
            VmOutcome::Migrated => self.migrations += 1,
            VmOutcome::Declined => self.declined += 1,
            VmOutcome::Failed => self.failed += 1,
        }
    }
}

/// State shared by the controller and its worker tasks.
struct Shared {
    platform: Arc<dyn Platform>,
    policy: MigrationPolicy,
    state: Arc<ControlState>,
    config: Arc<ControllerConfig>,
}

pub struct Controller {
    shared: Arc<Shared>,
    store: StateStore,
    shutdown: watch::Receiver<bool>,
}

impl Controller {
    /// Build a controller, restoring control state from `store`.
    ///
    /// Fails if `config` does not validate. A store that cannot be read
    /// yields empty state.
    pub fn new(
        config: ControllerConfig,
        platform: Arc<dyn Platform>,
        provisioner: Arc<dyn CapacityProvisioner>,
        store: StateStore,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let snapshot = store.load().unwrap_or_else(|e| {
            error!(error = %e, "failed to load controller state, starting empty");
            Default::default()
        });
        info!(
            vms = snapshot.vms.len(),
            hosts = snapshot.hosts.len(),
            "controller state restored"
        );

        let state = Arc::new(ControlState::from_snapshot(snapshot));
        let config = Arc::new(config);
        let policy = MigrationPolicy::new(
            platform.clone(),
            provisioner,
            state.clone(),
            config.clone(),
            shutdown.clone(),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                platform,
                policy,
                state,
                config,
            }),
            store,
            shutdown,
        })
    }

    /// Live control state.
    pub fn state(&self) -> &ControlState {
        &self.shared.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Run one scheduling cycle at the current time.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        self.run_cycle_at(epoch_millis()).await
    }

    /// Run one scheduling cycle, treating `now` as the current time.
    ///
    /// Fails only when the VM snapshot cannot be fetched; in that case
    /// nothing is evaluated, pruned or saved.
    pub async fn run_cycle_at(&self, now: Timestamp) -> anyhow::Result<CycleReport> {
        let shared = &self.shared;
        let vms = with_timeout(shared.config.gateway_timeout, shared.platform.list_vms())
            .await
            .context("failed to list VMs")?;
        let all_vms = Arc::new(vms);
        let monitored = monitored_vms(&all_vms, shared.config.user_filter);

        let mut report = CycleReport {
            evaluated: monitored.len(),
            ..CycleReport::default()
        };
        debug!(
            total = all_vms.len(),
            monitored = monitored.len(),
            "scheduling cycle started"
        );

        let permits = Arc::new(Semaphore::new(shared.config.workers));
        let mut tasks = JoinSet::new();
        for vm in monitored {
            let permit = permits.clone().acquire_owned().await?;
            let shared = shared.clone();
            let all_vms = all_vms.clone();
            tasks.spawn(async move {
                let _permit = permit;
                evaluate_vm(&shared, &vm, now, &all_vms).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(error = %e, "vm evaluation task failed");
                    report.record(VmOutcome::Failed);
                }
            }
        }

        let current: HashSet<_> = all_vms.iter().map(|vm| vm.id).collect();
        report.pruned = shared.state.prune(&current);
        self.persist();

        debug!(?report, "scheduling cycle finished");
        Ok(report)
    }

    /// Run cycles every `interval` until the shutdown signal fires, then
    /// save the state one last time.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.clone();
        let config = &self.shared.config;
        info!(
            interval_ms = config.interval.as_millis() as u64,
            workers = config.workers,
            dry_run = config.dry_run,
            "controller started"
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "scheduling cycle failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.persist();
        info!("controller stopped");
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.shared.state.snapshot()) {
            error!(error = %e, "failed to save controller state");
        }
    }
}

/// Evaluate one VM and apply the decision.
///
/// The VM's control-state changes are kept only when nothing had to be
/// done or the resize went through.
async fn evaluate_vm(
    shared: &Shared,
    vm: &VirtualMachine,
    now: Timestamp,
    all_vms: &[VirtualMachine],
) -> VmOutcome {
    let mut vm_state = shared.state.vm(vm.id).unwrap_or_default();
    let action = memtide_sizing::evaluate(vm, &mut vm_state, now, &shared.config);

    let outcome = match action {
        SizingAction::NoChange => VmOutcome::Unchanged,
        SizingAction::Resize(new_memory) => {
            match apply_resize(shared.platform.as_ref(), &shared.config, vm, new_memory).await {
                Ok(()) => VmOutcome::Resized,
                Err(e) => {
                    error!(vm_id = vm.id, new_memory, error = %e, "resize failed");
                    VmOutcome::Failed
                }
            }
        }
        SizingAction::RequestMigrationThenResize(new_memory) => {
            let current = vm
                .telemetry
                .map_or(0, |t| t.total_memory as i64 + vm_state.memory_offset.unwrap_or(0));
            let delta = (new_memory as i64 - current).max(0) as u64;

            match shared
                .policy
                .ensure_headroom_then_resize(vm, new_memory, delta, now, all_vms)
                .await
            {
                Ok(GrowthOutcome::Resized) => VmOutcome::Resized,
                Ok(GrowthOutcome::Migrated { .. }) => VmOutcome::Migrated,
                Ok(GrowthOutcome::Declined(reason)) => {
                    debug!(vm_id = vm.id, ?reason, "growth declined");
                    VmOutcome::Declined
                }
                Err(e) => {
                    error!(vm_id = vm.id, new_memory, error = %e, "growth failed");
                    VmOutcome::Failed
                }
            }
        }
    };

    match outcome {
        VmOutcome::Unchanged => shared.state.put_vm(vm.id, vm_state),
        VmOutcome::Resized => {
            vm_state.record_adjustment(now);
            shared.state.put_vm(vm.id, vm_state);
        }
        // Retried next cycle from the previous state.
        VmOutcome::Migrated | VmOutcome::Declined | VmOutcome::Failed => {}
    }
    outcome
}
