//! GET /health - 存活检查

use axum::{extract::State, response::Json};
use serde_json::{json, Value};

use crate::http::AppState;

/// 返回服务状态和已配置的计数存储层
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tiers": state.controller.store().tier_names(),
        "timestamp": state.controller.now(),
    }))
}
