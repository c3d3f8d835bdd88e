//! 管理接口适配器
//!
//! 顺序：白名单放行（不计数）→ 角色检查（401 / 403，不计数）→ 按 `admin:*` 策略计数。
//! 携带有效 `X-Service-Key` 的后端调用视为满足角色要求。

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::auth::{caller_context, request_meta};
use super::rate_limit::admit;
use crate::config::AdminConfig;
use crate::http::AppState;
use crate::security::decision::{Rejection, RejectionCode};
use crate::security::policy::EndpointCategory;
use crate::security::rate_limiter::CheckOptions;

pub const SERVICE_KEY_HEADER: &str = "x-service-key";

pub async fn admin_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    guard(state, request, next, "general").await
}

/// 敏感管理操作（重置、清理等）
pub async fn admin_sensitive_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    guard(state, request, next, "sensitive").await
}

async fn guard(state: AppState, request: Request, next: Next, qualifier: &str) -> Response {
    let meta = request_meta(&request);
    if state.controller.is_allowlisted(&meta) {
        debug!("管理白名单放行: {} {}", request.method(), request.uri().path());
        let options = CheckOptions::new(EndpointCategory::Admin)
            .qualifier(qualifier)
            .admin_bypass(true);
        return admit(&state, request, next, options).await;
    }

    let caller = caller_context(&request);
    if let Some(role) = state.admin.required_role.as_deref() {
        if !has_valid_service_key(request.headers(), &state.admin) {
            if !caller.is_authenticated() {
                return Rejection::new(RejectionCode::AuthRequired).into_response();
            }
            if !caller.has_role(role) {
                warn!(
                    "❌ 管理接口权限不足: user={:?}, required_role={}",
                    caller.user_id, role
                );
                return Rejection::new(RejectionCode::InsufficientPermissions).into_response();
            }
        }
    }

    let mut options = CheckOptions::new(EndpointCategory::Admin).qualifier(qualifier);
    if let Some(user_id) = caller.user_id {
        options = options.caller(user_id);
    }
    admit(&state, request, next, options).await
}

/// 校验 `X-Service-Key`（未配置服务密钥时始终为 false）
pub fn has_valid_service_key(headers: &HeaderMap, admin: &AdminConfig) -> bool {
    let Some(expected) = admin.service_key.as_deref().filter(|k| !k.is_empty()) else {
        return false;
    };
    headers
        .get(SERVICE_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |provided| constant_time_eq(provided.as_bytes(), expected.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
