//! 通用 / 聊天限流适配器

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::auth::{caller_context, request_meta};
use crate::http::AppState;
use crate::security::policy::EndpointCategory;
use crate::security::rate_limiter::CheckOptions;

/// 聊天角色请求头：同一用户对不同角色分别计数
pub const SUB_RESOURCE_HEADER: &str = "x-character-id";

/// 执行准入检查；放行时继续处理并附加限流头，拒绝时直接返回结构化拒绝
///
/// 检查结果同时放入请求扩展，供后续处理器读取。
pub async fn admit(
    state: &AppState,
    mut request: Request,
    next: Next,
    options: CheckOptions,
) -> Response {
    let meta = request_meta(&request);
    let decision = state.controller.check(&meta, &options).await;

    if let Some(rejection) = decision.rejection() {
        return rejection.into_response();
    }

    request.extensions_mut().insert(decision.clone());
    let mut response = next.run(request).await;
    decision.apply_headers(response.headers_mut());
    response
}

pub async fn general_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_context(&request);
    let mut options =
        CheckOptions::new(EndpointCategory::General).tier(caller.effective_tier());
    if let Some(user_id) = caller.user_id {
        options = options.caller(user_id);
    }
    admit(&state, request, next, options).await
}

pub async fn chat_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_context(&request);
    let mut options = CheckOptions::new(EndpointCategory::Chat).tier(caller.effective_tier());
    if let Some(user_id) = caller.user_id {
        options = options.caller(user_id);
    }
    if let Some(character) = request
        .headers()
        .get(SUB_RESOURCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        options = options.sub_resource(character);
    }
    admit(&state, request, next, options).await
}
