//! API Module
//!
//! Read-mostly REST surface for the daemon: health, metrics, inventory,
//! the audit trail, backups and on-demand monitor ticks. Storage mutations
//! stay on the command line where they can be confirmed.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
