// src/server/mod.rs

//! The HTTP control surface operated by the supervisor and consumed by
//! `stewardctl` and by load balancers doing role-based health checks.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::Config;
use crate::core::dcs::DcsClient;
use crate::core::executor::AsyncExecutor;
use crate::core::ha::Ha;
use crate::core::postgres::DatabaseController;

pub mod api;

/// Everything the handlers need, shared by reference.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub dcs: Arc<dyn DcsClient>,
    pub db: Arc<dyn DatabaseController>,
    pub executor: Arc<AsyncExecutor>,
    pub ha: Arc<Ha>,
}

/// Runs the REST API until the shutdown channel fires.
pub async fn run(state: ApiState, listen: String, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = api::router(state);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind the REST API on {listen}: {e}");
            return;
        }
    };
    info!("REST API listening on http://{listen}");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("REST API shutting down.");
        })
        .await
    {
        error!("REST API server error: {e}");
    }
}
