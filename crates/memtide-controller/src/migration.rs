//! Migration policy — makes room on a host before a VM grows.
//!
//! The host is re-read from the platform. If it can absorb the growth the
//! VM is resized directly. Otherwise the smallest other resident VM is
//! migrated to the roomiest host able to take it, asking the capacity
//! provisioner for a new host once if none can. A migration only frees
//! room for a later cycle: the growing VM is never resized in the same
//! call.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use memtide_core::{ControllerConfig, Host, HostId, VirtualMachine, VmId};
use memtide_gateway::{
    CapacityProvisioner, GatewayResult, Platform, provision_capacity, with_timeout,
};
use memtide_placement::{host_has_headroom, select_destination, select_victim};
use memtide_state::{ControlState, Timestamp};

/// Result of a growth request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthOutcome {
    /// The host had room and the VM was resized.
    Resized,
    /// A VM was moved off the host; the growth waits for the next cycle.
    Migrated { victim: VmId, destination: HostId },
    /// Nothing was done.
    Declined(DeclineReason),
}

impl GrowthOutcome {
    pub fn is_resized(&self) -> bool {
        matches!(self, GrowthOutcome::Resized)
    }
}

/// Why a growth request led to neither a resize nor a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    HostCooldown,
    NoVictim,
    NoDestination,
    MigrationRefused,
    DryRun,
}

/// Change a running VM's memory, or only log it in dry-run mode.
pub(crate) async fn apply_resize(
    platform: &dyn Platform,
    config: &ControllerConfig,
    vm: &VirtualMachine,
    new_memory: u64,
) -> GatewayResult<()> {
    if config.dry_run {
        info!(vm_id = vm.id, host = %vm.host_name, new_memory, "dry run: skipping resize");
        return Ok(());
    }
    with_timeout(
        config.gateway_timeout,
        platform.resize_running_vm(vm.id, &vm.host_name, new_memory),
    )
    .await?;
    info!(vm_id = vm.id, host = %vm.host_name, new_memory, "vm resized");
    Ok(())
}

pub struct MigrationPolicy {
    platform: Arc<dyn Platform>,
    provisioner: Arc<dyn CapacityProvisioner>,
    state: Arc<ControlState>,
    config: Arc<ControllerConfig>,
    shutdown: watch::Receiver<bool>,
    /// One lock per source host; held for a whole growth request.
    host_locks: DashMap<HostId, Arc<Mutex<()>>>,
}

impl MigrationPolicy {
    pub fn new(
        platform: Arc<dyn Platform>,
        provisioner: Arc<dyn CapacityProvisioner>,
        state: Arc<ControlState>,
        config: Arc<ControllerConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            platform,
            provisioner,
            state,
            config,
            shutdown,
            host_locks: DashMap::new(),
        }
    }

    fn host_lock(&self, host_id: HostId) -> Arc<Mutex<()>> {
        self.host_locks.entry(host_id).or_default().clone()
    }

    /// Grow `vm` to `new_memory` if its host can spare `delta`, otherwise
    /// try to evict another VM from the host.
    ///
    /// `all_vms` is the cycle's full platform snapshot, used to size
    /// victim candidates. Gateway errors are returned; policy failures are
    /// logged and reported as [`GrowthOutcome::Declined`].
    pub async fn ensure_headroom_then_resize(
        &self,
        vm: &VirtualMachine,
        new_memory: u64,
        delta: u64,
        now: Timestamp,
        all_vms: &[VirtualMachine],
    ) -> GatewayResult<GrowthOutcome> {
        let lock = self.host_lock(vm.host_id);
        let _guard = lock.lock().await;

        let host = with_timeout(self.config.gateway_timeout, self.platform.get_host(vm.host_id))
            .await?;

        if host_has_headroom(&host, delta, self.config.host_memory_margin) {
            debug!(vm_id = vm.id, host = %host.name, delta, "host has enough free memory");
            apply_resize(self.platform.as_ref(), &self.config, vm, new_memory).await?;
            return Ok(GrowthOutcome::Resized);
        }

        debug!(
            vm_id = vm.id,
            host = %host.name,
            free = host.free_memory,
            delta,
            "host lacks free memory, looking for a vm to migrate"
        );

        if self
            .state
            .host(host.id)
            .in_cooldown(now, self.config.migration_cooldown)
        {
            warn!(host = %host.name, "host in migration cooldown, growth postponed");
            return Ok(GrowthOutcome::Declined(DeclineReason::HostCooldown));
        }

        let Some(victim) = select_victim(&host, vm.id, all_vms) else {
            warn!(vm_id = vm.id, host = %host.name, "no vm to migrate, growth postponed");
            return Ok(GrowthOutcome::Declined(DeclineReason::NoVictim));
        };

        let Some(destination) = self.find_destination(&host, victim).await? else {
            warn!(
                victim = victim.id,
                memory = victim.memory_requirement(),
                "no host can receive the vm, growth postponed"
            );
            return Ok(GrowthOutcome::Declined(DeclineReason::NoDestination));
        };

        if self.config.dry_run {
            info!(
                victim = victim.id,
                from = %host.name,
                to = %destination.name,
                "dry run: skipping migration"
            );
            return Ok(GrowthOutcome::Declined(DeclineReason::DryRun));
        }

        let migrated = with_timeout(
            self.config.gateway_timeout,
            self.platform.migrate(victim.id, destination.id),
        )
        .await?;

        if migrated {
            self.state.record_migration(host.id, now);
            info!(
                victim = victim.id,
                from = %host.name,
                to = %destination.name,
                "vm migrated to free memory"
            );
            Ok(GrowthOutcome::Migrated {
                victim: victim.id,
                destination: destination.id,
            })
        } else {
            warn!(victim = victim.id, to = %destination.name, "platform refused migration");
            Ok(GrowthOutcome::Declined(DeclineReason::MigrationRefused))
        }
    }

    /// Best destination for `victim`, provisioning a new host once if
    /// nothing fits.
    async fn find_destination(
        &self,
        source: &Host,
        victim: &VirtualMachine,
    ) -> GatewayResult<Option<Host>> {
        let hosts = with_timeout(self.config.gateway_timeout, self.platform.list_hosts()).await?;
        if let Some(host) = select_destination(&hosts, source.id, victim) {
            return Ok(Some(host.clone()));
        }

        info!(
            victim = victim.id,
            cpus = victim.cpus,
            memory = victim.memory_requirement(),
            "no host fits, requesting more capacity"
        );
        let served = provision_capacity(
            self.provisioner.as_ref(),
            victim.cpus,
            victim.memory_requirement(),
            &self.config.provisioner,
            self.shutdown.clone(),
        )
        .await;
        if !served {
            return Ok(None);
        }

        let hosts = with_timeout(self.config.gateway_timeout, self.platform.list_hosts()).await?;
        Ok(select_destination(&hosts, source.id, victim).cloned())
    }
}
