use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use super::AppState;
use crate::routing::ConfigSnapshot;

/// Re-read the bindings file and swap in a new routing generation.
///
/// A snapshot that fails validation leaves the current generation serving
/// and comes back as 422 with the reason.
pub async fn reload(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let Some(path) = state.bindings_path.clone() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "no bindings file configured"})),
        );
    };

    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Cannot read bindings file");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("cannot read {}: {e}", path.display())})),
            );
        }
    };

    let routing = state.dispatcher.routing().clone();
    let env = state.handler_env.clone();
    // Script loading and compilation are blocking
    let result = tokio::task::spawn_blocking(move || {
        let snapshot = ConfigSnapshot::from_json(&raw)?;
        routing.reload(&snapshot, &env)
    })
    .await;

    match result {
        Ok(Ok(table)) => {
            state.metrics.routing_generation.set(table.generation() as i64);
            (
                StatusCode::OK,
                Json(json!({
                    "generation": table.generation(),
                    "bindings": table.len()
                })),
            )
        }
        Ok(Err(e)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": e.to_string()})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("reload task failed: {e}")})),
        ),
    }
}
