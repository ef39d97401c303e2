//! Inventory types shared across memtide crates.
//!
//! `VirtualMachine` and `Host` are rebuilt from the platform every
//! scheduling cycle and never persisted. All memory figures are KiB.

use serde::{Deserialize, Serialize};

/// Platform identifier of a virtual machine.
pub type VmId = u64;

/// Platform identifier of a hypervisor host.
pub type HostId = u64;

/// Platform identifier of the user owning a VM.
pub type UserId = u64;

// ── Virtual machine ───────────────────────────────────────────────

/// Guest-side memory figures reported by the in-guest agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telemetry {
    /// Memory visible to the platform layer. Lags the guest figures.
    pub real_memory: u64,
    /// Total memory as reported by the guest OS.
    pub total_memory: u64,
    /// Free memory as reported by the guest OS, minus the system offset.
    pub free_memory: u64,
}

/// A running VM as seen in the current platform snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    pub id: VmId,
    pub user_id: UserId,
    pub host_id: HostId,
    pub host_name: String,
    /// Memory most recently granted by the platform.
    pub allocated_memory: u64,
    /// Virtual CPUs requested by the VM.
    pub cpus: f64,
    /// Absent when no in-guest agent reports.
    pub telemetry: Option<Telemetry>,
    /// Per-VM override of the starvation threshold.
    pub min_free_memory: Option<u64>,
    /// Per-VM override of the target free-memory percentage.
    pub overcommit_ratio: Option<f64>,
}

impl VirtualMachine {
    /// Create a VM with no telemetry and no overrides.
    pub fn new(id: VmId, host_id: HostId, host_name: impl Into<String>, allocated_memory: u64) -> Self {
        Self {
            id,
            user_id: 0,
            host_id,
            host_name: host_name.into(),
            allocated_memory,
            cpus: 1.0,
            telemetry: None,
            min_free_memory: None,
            overcommit_ratio: None,
        }
    }

    /// Attach guest-reported memory figures.
    ///
    /// `system_offset` is the memory the guest OS keeps for itself; it is
    /// subtracted from the reported free memory, which never goes below 0.
    pub fn with_telemetry(
        mut self,
        real_memory: u64,
        total_memory: u64,
        free_memory: u64,
        system_offset: u64,
    ) -> Self {
        self.telemetry = Some(Telemetry {
            real_memory,
            total_memory,
            free_memory: free_memory.saturating_sub(system_offset),
        });
        self
    }

    /// Whether the VM reports usable telemetry (non-zero free and total memory).
    pub fn is_monitorable(&self) -> bool {
        self.telemetry
            .is_some_and(|t| t.free_memory > 0 && t.total_memory > 0)
    }

    /// Memory a destination host must have free to receive this VM.
    ///
    /// Guest-reported total when monitored, the platform allocation otherwise.
    pub fn memory_requirement(&self) -> u64 {
        match self.telemetry {
            Some(t) if t.total_memory > 0 => t.total_memory,
            _ => self.allocated_memory,
        }
    }

    /// CPU requirement in the platform's percent-of-a-core unit.
    pub fn cpu_requirement(&self) -> f64 {
        self.cpus * 100.0
    }
}

// ── Host ──────────────────────────────────────────────────────────

/// Operational state reported by the platform for a host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Init,
    MonitoringMonitored,
    #[default]
    Monitored,
    Error,
    Disabled,
    MonitoringError,
    MonitoringInit,
    MonitoringDisabled,
}

impl HostState {
    /// Whether a host in this state may receive VMs.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            HostState::Error
                | HostState::Disabled
                | HostState::MonitoringError
                | HostState::MonitoringDisabled
        )
    }
}

/// A hypervisor host as seen in the current platform snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    #[serde(default)]
    pub state: HostState,
    pub max_memory: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    /// Idle CPU in percent-of-a-core (400 = four idle cores).
    pub free_cpu: f64,
    /// VMs currently resident on this host.
    #[serde(default)]
    pub vm_ids: Vec<VmId>,
}

impl Host {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
