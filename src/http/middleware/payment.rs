//! 支付接口适配器：风控前置检查，命中高风险直接 403 且不计数

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::auth::{caller_context, request_meta};
use super::rate_limit::admit;
use crate::http::AppState;
use crate::security::decision::Rejection;
use crate::security::policy::{endpoint_key, EndpointCategory};
use crate::security::rate_limiter::CheckOptions;

pub async fn payment_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let meta = request_meta(&request);
    let caller = caller_context(&request);
    let endpoint = endpoint_key(EndpointCategory::Payment, &state.payment_endpoint);
    let assessment = state.risk.assess(&meta);

    if state.risk.should_block(&assessment) {
        warn!(
            "🛡️ 支付请求被风控拦截: endpoint={}, user={:?}, score={}, signals={:?}",
            endpoint, caller.user_id, assessment.score, assessment.signals
        );
        crate::infra::metrics::record_security_block(&endpoint);
        return Rejection::security_block(assessment.score).into_response();
    }

    if state.risk.needs_review(&assessment) {
        warn!(
            "⚠️ 支付请求风险偏高，继续严格计数: endpoint={}, user={:?}, score={}, signals={:?}",
            endpoint, caller.user_id, assessment.score, assessment.signals
        );
    }

    let mut options =
        CheckOptions::new(EndpointCategory::Payment).qualifier(state.payment_endpoint.as_str());
    if let Some(user_id) = caller.user_id {
        options = options.caller(user_id);
    }
    admit(&state, request, next, options).await
}
