use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{IPCServer, SinceQuery};

/// GET /api/events?since=N - 이벤트 히스토리 폴링
pub async fn get_events(State(state): State<IPCServer>, Query(params): Query<SinceQuery>) -> impl IntoResponse {
    let events = state.supervisor.bus().events_since(params.since);
    let last_id = events.last().map(|e| e.id).or(params.since);
    Json(json!({
        "success": true,
        "events": events,
        "last_id": last_id,
    }))
}
