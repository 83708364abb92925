use axum::extract::State;
use serde_json::{Value, json};

use crate::db::{AppState, queries};
use crate::error::Result;
use crate::extractors::Json;
use crate::models::Plan;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Active plans in display order.
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<Plan>>> {
    let conn = state.db.get()?;
    Ok(Json(queries::list_active_plans(&conn)?))
}
