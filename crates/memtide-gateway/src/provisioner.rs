//! Capacity provisioning — asking for more hosts when none can take a VM.
//!
//! A request is created once and then polled until it is served, the
//! overall deadline passes, or the controller is shutting down.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use memtide_core::ProvisionerConfig;

use crate::error::{GatewayError, GatewayResult};
use crate::platform::GatewayFuture;

/// Identifier of a pending capacity request.
pub type RequestId = String;

/// External service able to power on additional hosts.
pub trait CapacityProvisioner: Send + Sync {
    /// Ask for a host with at least `cpus` CPUs and `memory` KiB free.
    fn request_capacity(&self, cpus: f64, memory: u64) -> GatewayFuture<'_, RequestId>;

    /// Whether the request has been served. Waits at most `timeout`.
    fn poll_request<'a>(
        &'a self,
        request_id: &'a RequestId,
        timeout: Duration,
    ) -> GatewayFuture<'a, bool>;
}

/// Provisioner used when no provisioning service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProvisioner;

impl CapacityProvisioner for UnavailableProvisioner {
    fn request_capacity(&self, _cpus: f64, _memory: u64) -> GatewayFuture<'_, RequestId> {
        Box::pin(async {
            Err(GatewayError::Unavailable(
                "no capacity provisioner configured".to_string(),
            ))
        })
    }

    fn poll_request<'a>(
        &'a self,
        request_id: &'a RequestId,
        _timeout: Duration,
    ) -> GatewayFuture<'a, bool> {
        Box::pin(async move { Err(GatewayError::NotFound(request_id.clone())) })
    }
}

/// Why a provisioner call was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abandoned {
    Deadline,
    Shutdown,
}

/// Resolves once `shutdown` reads `true`. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Await one provisioner call, giving up at `deadline` or on shutdown.
async fn bounded<T>(
    call: GatewayFuture<'_, T>,
    deadline: Instant,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<GatewayResult<T>, Abandoned> {
    tokio::select! {
        result = tokio::time::timeout_at(deadline, call) => result.map_err(|_| Abandoned::Deadline),
        _ = shutdown_requested(shutdown) => Err(Abandoned::Shutdown),
    }
}

/// Request capacity for `cpus`/`memory` and wait until it is served.
///
/// Returns `true` once the provisioner reports the request served,
/// `false` if the request is rejected, the deadline passes, or `shutdown`
/// fires. The deadline covers the request itself and every poll, so a
/// provisioner that never answers cannot hold the caller past it. Poll
/// errors are logged and polling continues until the deadline.
pub async fn provision_capacity(
    provisioner: &dyn CapacityProvisioner,
    cpus: f64,
    memory: u64,
    config: &ProvisionerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> bool {
    let deadline = Instant::now() + config.request_timeout;

    let request_id = match bounded(
        provisioner.request_capacity(cpus, memory),
        deadline,
        &mut shutdown,
    )
    .await
    {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            warn!(cpus, memory, error = %e, "capacity request failed");
            return false;
        }
        Err(reason) => {
            warn!(cpus, memory, ?reason, "capacity request abandoned");
            return false;
        }
    };
    info!(%request_id, cpus, memory, "capacity requested");

    loop {
        if *shutdown.borrow() {
            debug!(%request_id, "abandoning capacity request on shutdown");
            return false;
        }

        match bounded(
            provisioner.poll_request(&request_id, config.poll_timeout),
            deadline,
            &mut shutdown,
        )
        .await
        {
            Ok(Ok(true)) => {
                info!(%request_id, "capacity request served");
                return true;
            }
            Ok(Ok(false)) => debug!(%request_id, "capacity request pending"),
            Ok(Err(e)) => warn!(%request_id, error = %e, "capacity poll failed"),
            Err(Abandoned::Shutdown) => {
                debug!(%request_id, "abandoning capacity request on shutdown");
                return false;
            }
            Err(Abandoned::Deadline) => {
                warn!(
                    %request_id,
                    timeout_secs = config.request_timeout.as_secs(),
                    "capacity poll did not answer before the deadline"
                );
                return false;
            }
        }

        if Instant::now() >= deadline {
            warn!(
                %request_id,
                timeout_secs = config.request_timeout.as_secs(),
                "capacity request not served in time"
            );
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_delay) => {}
            _ = shutdown_requested(&mut shutdown) => {
                debug!(%request_id, "abandoning capacity request on shutdown");
                return false;
            }
        }
    }
}
