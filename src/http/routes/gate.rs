//! 网关前置鉴权端点（forward-auth）
//!
//! 上游网关在转发业务请求前先调用对应端点：204 放行，其余状态码原样返回给客户端。
//! 网关需要透传原始请求的 User-Agent / Referer / Origin / X-Forwarded-For 等请求头。

use axum::{
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{any, get},
    Router,
};

use crate::http::middleware::{
    admin_rate_limit, chat_rate_limit, general_rate_limit, payment_rate_limit,
};
use crate::http::AppState;

pub fn create_route(state: AppState) -> Router<AppState> {
    let general = Router::new()
        .route("/api/gate/general", get(admitted))
        .route_layer(from_fn_with_state(state.clone(), general_rate_limit));

    let chat = Router::new()
        .route("/api/gate/chat", get(admitted))
        .route_layer(from_fn_with_state(state.clone(), chat_rate_limit));

    let admin = Router::new()
        .route("/api/gate/admin", get(admitted))
        .route_layer(from_fn_with_state(state.clone(), admin_rate_limit));

    // 支付风控会区分请求方法，网关可以用原始方法调用
    let payment = Router::new()
        .route("/api/gate/payment", any(admitted))
        .route_layer(from_fn_with_state(state, payment_rate_limit));

    Router::new()
        .merge(general)
        .merge(chat)
        .merge(admin)
        .merge(payment)
}

async fn admitted() -> StatusCode {
    StatusCode::NO_CONTENT
}
