//! redb table definitions for the controller state store.
//!
//! Keys are the platform's numeric identifiers; values are JSON.

use redb::TableDefinition;

/// Per-VM cooldown and backoff state keyed by VM id.
pub const VM_CONTROL: TableDefinition<u64, &[u8]> = TableDefinition::new("vm_control");

/// Per-host migration timestamps keyed by host id.
pub const HOST_CONTROL: TableDefinition<u64, &[u8]> = TableDefinition::new("host_control");
