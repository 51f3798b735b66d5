use axum::extract::State;
use axum::Json;

use crate::orchestrator::Stats;
use crate::router::AppState;

pub async fn stats(State(state): State<AppState>) -> Json<Stats> {
    Json(state.orchestrator.stats().await)
}
