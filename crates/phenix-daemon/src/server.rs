//! Server setup and lifecycle management

use crate::api::{create_router, AppState};
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use axum::Router;
use phenix_control::{ControlPlane, InMemoryConfigStore, Seed, SimulatedFabric};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// phenix daemon server
pub struct Server {
    config: DaemonConfig,
    plane: ControlPlane,
}

impl Server {
    /// Create a new server with the given configuration
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let seed = match &config.seed {
            Some(path) => {
                info!(path = %path.display(), "Loading seed");
                Seed::load(path)?
            }
            None => Seed::default(),
        };

        let store = InMemoryConfigStore::from_seed(&seed).await?;
        let fabric = SimulatedFabric::from_seed(&seed);

        let plane = ControlPlane::new(Arc::new(store), Arc::new(fabric), config.control_plane());

        Ok(Self { config, plane })
    }

    /// Router serving this server's control plane
    pub fn router(&self) -> Router {
        let state = AppState::new(self.plane.clone(), self.config.auth.enabled);
        create_router(state, self.config.server.enable_cors)
    }

    /// Run the server
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;
        let app = self.router();

        if !self.config.auth.enabled {
            warn!("Authentication disabled, every request runs as global-admin");
        }

        // Create listener
        let listener = TcpListener::bind(addr).await?;

        info!("phenix daemon listening on {}", addr);

        // Run server with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        info!("phenix daemon shutting down");

        Ok(())
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
