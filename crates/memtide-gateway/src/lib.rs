//! memtide-gateway — the controller's view of the outside world.
//!
//! The controller never talks to a concrete cloud platform. It depends on
//! two capability traits:
//!
//! - **[`Platform`]** — VM/host inventory plus the migrate and resize
//!   primitives.
//! - **[`CapacityProvisioner`]** — asks an external service to bring more
//!   host capacity online and reports when the request is served.
//!
//! Both use boxed futures so they can be held as `Arc<dyn Trait>` and
//! swapped for fakes in tests.
//!
//! # Backends
//!
//! - [`InventoryPlatform`] reads a JSON inventory file and changes memory
//!   through a shell command template ([`CommandResizer`]).
//! - [`UnavailableProvisioner`] rejects every request, for deployments
//!   without a provisioning service.

pub mod error;
pub mod inventory;
pub mod platform;
pub mod provisioner;
pub mod resize;

pub use error::{GatewayError, GatewayResult};
pub use inventory::{Inventory, InventoryPlatform, InventoryVm};
pub use platform::{GatewayFuture, Platform, with_timeout};
pub use provisioner::{CapacityProvisioner, RequestId, UnavailableProvisioner, provision_capacity};
pub use resize::CommandResizer;
