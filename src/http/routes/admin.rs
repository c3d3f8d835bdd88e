//! 限流管理接口
//!
//! 统一使用 X-Service-Key 认证，同时受管理接口限流保护：
//! - `POST /api/admin/rate-limits/reset`    删除 `(identity, endpoint)` 的计数、违规和封禁
//! - `POST /api/admin/rate-limits/forgive`  匿名用户登录后清理其匿名身份的限流状态
//! - `GET  /api/admin/rate-limits/status`   只读查看 `(identity, endpoint)` 的当前状态

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    middleware::from_fn_with_state,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Result, ServerError};
use crate::http::middleware::admin::has_valid_service_key;
use crate::http::middleware::{admin_rate_limit, admin_sensitive_rate_limit};
use crate::http::AppState;
use crate::security::decision::AdmissionDecision;

pub fn create_route(state: AppState) -> Router<AppState> {
    let sensitive = Router::new()
        .route("/api/admin/rate-limits/reset", post(reset_rate_limit))
        .route("/api/admin/rate-limits/forgive", post(forgive_anonymous))
        .route_layer(from_fn_with_state(state.clone(), admin_sensitive_rate_limit));

    let general = Router::new()
        .route("/api/admin/rate-limits/status", get(rate_limit_status))
        .route_layer(from_fn_with_state(state, admin_rate_limit));

    sensitive.merge(general)
}

/// 校验 Service Key
fn verify_service_key(headers: &HeaderMap, state: &AppState) -> Result<()> {
    if state.admin.service_key.as_deref().map_or(true, str::is_empty) {
        warn!("管理接口未配置 service key");
        return Err(ServerError::Forbidden("管理接口未启用".to_string()));
    }
    if !has_valid_service_key(headers, &state.admin) {
        warn!("❌ 无效的 service key");
        return Err(ServerError::Unauthorized("无效的 service key".to_string()));
    }
    Ok(())
}

fn require_non_empty<'a>(value: &'a str, field: &str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ServerError::BadRequest(format!("{} 不能为空", field)));
    }
    Ok(value)
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub identity: String,
    pub endpoint: String,
}

/// POST /api/admin/rate-limits/reset
async fn reset_rate_limit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResetRequest>,
) -> Result<Json<Value>> {
    verify_service_key(&headers, &state)?;
    let identity = require_non_empty(&body.identity, "identity")?;
    let endpoint = require_non_empty(&body.endpoint, "endpoint")?;

    let removed = state.controller.reset(identity, endpoint).await;
    info!("🧹 管理重置: identity={}, endpoint={}, removed={}", identity, endpoint, removed);

    Ok(Json(json!({
        "success": true,
        "identity": identity,
        "endpoint": endpoint,
        "removed": removed,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgiveRequest {
    pub anonymous_id: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// POST /api/admin/rate-limits/forgive
async fn forgive_anonymous(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ForgiveRequest>,
) -> Result<Json<Value>> {
    verify_service_key(&headers, &state)?;
    let anonymous_id = require_non_empty(&body.anonymous_id, "anonymousId")?;
    if anonymous_id.starts_with("user:") {
        return Err(ServerError::BadRequest("anonymousId 不能是已认证身份".to_string()));
    }

    let endpoints: Vec<&str> = body.endpoints.iter().map(String::as_str).collect();
    let removed = state.controller.forgive_anonymous(anonymous_id, &endpoints).await;

    Ok(Json(json!({
        "success": true,
        "anonymousId": anonymous_id,
        "removed": removed,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub identity: String,
    pub endpoint: String,
    pub sub_resource: Option<String>,
}

/// GET /api/admin/rate-limits/status
async fn rate_limit_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<AdmissionDecision>> {
    verify_service_key(&headers, &state)?;
    let identity = require_non_empty(&query.identity, "identity")?;
    let endpoint = require_non_empty(&query.endpoint, "endpoint")?;

    let decision = state
        .controller
        .peek_identity(identity, endpoint, query.sub_resource.clone())
        .await;
    Ok(Json(decision))
}
