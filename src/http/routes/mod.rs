//! HTTP 路由模块
//!
//! 路由结构：
//! - `/api/admission/check`          - 准入检查（JSON）
//! - `/api/gate/{category}`          - 网关前置鉴权端点，放行时返回 204
//! - `/api/admin/rate-limits/*`      - 管理接口（X-Service-Key 认证）
//! - `/health`、`/metrics`

pub mod admin;
pub mod admission;
pub mod gate;
pub mod health;
pub mod metrics;

use axum::{routing::get, Router};

use crate::http::AppState;

/// 创建所有路由
pub fn create_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(admission::create_route())
        .merge(gate::create_route(state.clone()))
        .merge(admin::create_route(state))
}
