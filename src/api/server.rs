//! API Server
//!
//! Serves the REST router until the shutdown token fires.

use super::rest::{ApiState, RestRouter};
use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: ApiState) -> Self {
        Self { config, state }
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let app = RestRouter::new(self.state).build();

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", self.config.rest_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
    }
}
