pub mod admin;
pub mod health;
pub mod metrics;

use axum::{
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::metrics::Metrics;
use crate::routing::HandlerEnv;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub metrics: Metrics,
    pub handler_env: HandlerEnv,
    /// Bindings file re-read on reload
    pub bindings_path: Option<PathBuf>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/ready", get(health::ready))
        .route("/api/in-flight", get(health::in_flight))
        .route("/metrics", get(metrics::metrics))
        .route("/api/admin/reload", post(admin::reload))
        .with_state(state)
}
