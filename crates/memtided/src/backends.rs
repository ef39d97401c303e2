//! Backend resolution by name.

use std::sync::Arc;

use anyhow::bail;
use tracing::info;

use memtide_core::ControllerConfig;
use memtide_gateway::{
    CapacityProvisioner, CommandResizer, InventoryPlatform, Platform, UnavailableProvisioner,
};

/// Build the platform backend named in `[platform] backend`.
pub fn platform(config: &ControllerConfig) -> anyhow::Result<Arc<dyn Platform>> {
    match config.platform.backend.as_str() {
        "inventory" => {
            let resizer =
                CommandResizer::new(config.platform.resize_command.clone(), config.gateway_timeout);
            info!(path = ?config.platform.inventory_path, "using inventory platform");
            Ok(Arc::new(InventoryPlatform::new(
                config.platform.inventory_path.clone(),
                resizer,
                config.system_memory_offset,
            )))
        }
        other => bail!("unknown platform backend {other:?}"),
    }
}

/// Build the capacity provisioner named in `[provisioner] backend`.
pub fn provisioner(config: &ControllerConfig) -> anyhow::Result<Arc<dyn CapacityProvisioner>> {
    match config.provisioner.backend.as_str() {
        "none" => Ok(Arc::new(UnavailableProvisioner)),
        other => bail!("unknown provisioner backend {other:?}"),
    }
}
