//! Volume Backend Adapters
//!
//! Provides adapters implementing [`VolumeBackend`]:
//! - LVM: drives the LVM2 command-line tools on the host
//! - Memory: in-process model used for tests, benches and rehearsals

pub mod lvm;
pub mod memory;

pub use lvm::*;
pub use memory::*;

use crate::domain::ports::{VolumeBackend, VolumeBackendRef};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Which backend adapter to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Lvm,
    Memory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Lvm => write!(f, "lvm"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lvm" | "lvm2" => Ok(BackendKind::Lvm),
            "memory" | "mock" => Ok(BackendKind::Memory),
            other => Err(Error::Configuration(format!(
                "unknown backend {:?}, use 'lvm' or 'memory'",
                other
            ))),
        }
    }
}

/// Combined backend configuration
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub lvm: LvmConfig,
}

/// Factory for creating volume backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend adapter by kind
    pub fn create(kind: BackendKind, config: BackendConfig) -> VolumeBackendRef {
        match kind {
            BackendKind::Lvm => Arc::new(LvmCliBackend::new(config.lvm)),
            BackendKind::Memory => Arc::new(InMemoryBackend::new()),
        }
    }

    /// Create a backend adapter by name
    pub fn create_by_name(name: &str, config: BackendConfig) -> Result<Arc<dyn VolumeBackend>> {
        Ok(Self::create(name.parse()?, config))
    }
}
