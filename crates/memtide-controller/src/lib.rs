//! memtide-controller — the scheduling loop.
//!
//! Each cycle fetches the VM snapshot from the platform, filters it to VMs
//! with usable telemetry, fans the evaluations out over a bounded worker
//! pool, then prunes departed VMs and persists the control state.
//!
//! Growth that the VM's host cannot absorb goes through the
//! [`MigrationPolicy`], which may evict another VM from the host. Growth
//! decisions for VMs on the same host are serialized; everything else
//! runs in parallel.

pub mod controller;
pub mod migration;

pub use controller::{Controller, CycleReport, monitored_vms};
pub use migration::{DeclineReason, GrowthOutcome, MigrationPolicy};
