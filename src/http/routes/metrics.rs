//! GET /metrics - Prometheus 抓取端点

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::http::AppState;

/// 返回 Prometheus 文本格式指标；未初始化时返回 503。
///
/// 抓取前刷新进程内计数表的条目数，其余指标由各自的调用点实时更新。
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    crate::infra::metrics::record_local_entries(state.controller.store().local().len());

    match crate::infra::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}
