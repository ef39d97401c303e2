//! The platform capability the controller depends on.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use memtide_core::{Host, HostId, VirtualMachine, VmId};

use crate::error::{GatewayError, GatewayResult};

/// Boxed future returned by gateway calls.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send + 'a>>;

/// A cloud-management platform: inventory plus migrate/resize primitives.
///
/// Implementations should not retry; the controller retries by evaluating
/// again on the next cycle.
pub trait Platform: Send + Sync {
    /// Every VM the platform currently knows about.
    fn list_vms(&self) -> GatewayFuture<'_, Vec<VirtualMachine>>;

    /// Current figures for a single host.
    fn get_host(&self, host_id: HostId) -> GatewayFuture<'_, Host>;

    /// Every host the platform manages.
    fn list_hosts(&self) -> GatewayFuture<'_, Vec<Host>>;

    /// Live-migrate `vm_id` to `host_id`. `Ok(false)` when the platform
    /// refused the migration.
    fn migrate(&self, vm_id: VmId, host_id: HostId) -> GatewayFuture<'_, bool>;

    /// Change the memory of a running VM at the hypervisor level.
    fn resize_running_vm<'a>(
        &'a self,
        vm_id: VmId,
        host_name: &'a str,
        new_memory: u64,
    ) -> GatewayFuture<'a, ()>;
}

/// Bound a gateway call by `timeout`.
pub async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = GatewayResult<T>>,
) -> GatewayResult<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| GatewayError::Timeout(timeout))?
}
