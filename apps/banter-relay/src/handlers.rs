use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::pending::PendingView;
use crate::relay::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connected_users: usize,
    pub pending_offers: usize,
}

pub async fn health_check(State(state): State<RelayState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            connected_users: state.connected_users(),
            pending_offers: state.pending().len(),
        }),
    )
}

/// Diagnostic listing of open pending-connection records. Read-only; never
/// consulted for routing decisions.
pub async fn list_pending(State(state): State<RelayState>) -> Json<Vec<PendingView>> {
    Json(state.pending().snapshot())
}
