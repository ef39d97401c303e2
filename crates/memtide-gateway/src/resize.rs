//! Hypervisor-level memory changes through a shell command template.

use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use memtide_core::VmId;

use crate::error::{GatewayError, GatewayResult};

/// Runs the configured resize command for a VM.
///
/// The template may reference `{hostname}`, `{vmid}` and `{newmemory}`.
#[derive(Debug, Clone)]
pub struct CommandResizer {
    template: String,
    timeout: Duration,
}

impl CommandResizer {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            template: template.into(),
            timeout,
        }
    }

    /// Expand the template for one VM.
    pub fn render(&self, host_name: &str, vm_id: VmId, new_memory: u64) -> String {
        self.template
            .replace("{hostname}", host_name)
            .replace("{vmid}", &vm_id.to_string())
            .replace("{newmemory}", &new_memory.to_string())
    }

    /// Run the command through `sh -c`, failing on a non-zero exit.
    pub async fn resize(&self, host_name: &str, vm_id: VmId, new_memory: u64) -> GatewayResult<()> {
        let command = self.render(host_name, vm_id, new_memory);
        debug!(vm_id, %command, "executing resize command");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(&command)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| GatewayError::Timeout(self.timeout))??;

        if output.status.success() {
            debug!(
                vm_id,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "resize command succeeded"
            );
            Ok(())
        } else {
            Err(GatewayError::Command {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
