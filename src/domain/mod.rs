//! Domain layer - resource model and port definitions
//!
//! This module defines the typed storage records and the backend trait
//! (port) that adapters implement, following hexagonal architecture
//! principles.

pub mod model;
pub mod ports;
pub mod units;

pub use model::*;
pub use ports::*;
pub use units::{format_bytes, parse_size};
