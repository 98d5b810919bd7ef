use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use super::AppState;
use crate::inflight::InFlightRecord;

/// Health check endpoint handler
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "dispatch-rs",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn ready(State(state): State<Arc<AppState>>) -> Json<Value> {
    let table = state.dispatcher.routing().current();
    Json(json!({
        "status": "ready",
        "generation": table.generation(),
        "bindings": table.len(),
        "in_flight": state.dispatcher.in_flight().len()
    }))
}

pub async fn in_flight(State(state): State<Arc<AppState>>) -> Json<Vec<InFlightRecord>> {
    Json(state.dispatcher.in_flight())
}
