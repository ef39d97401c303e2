//! memtide-placement — where memory for a growing VM comes from.
//!
//! This crate only decides. It checks whether a host can absorb a growth
//! request as is, and if not, which resident VM to evict and where to
//! send it. Performing the migration is `memtide-controller`'s job.
//!
//! # Components
//!
//! - **`victim`** — Host headroom check and victim selection
//! - **`ranking`** — Destination host ranking and selection
//!
//! Selection is first-fit over a deterministic order, not an optimal
//! packing: the smallest resident VM is evicted to the roomiest host that
//! can take it.

pub mod ranking;
pub mod victim;

pub use ranking::{rank_hosts, select_destination};
pub use victim::{host_has_headroom, select_victim};
