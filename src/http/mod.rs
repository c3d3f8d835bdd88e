//! HTTP 服务模块 - 使用 Axum 提供准入检查 API
//!
//! 功能包括：
//! - 准入检查接口（供无法直接嵌入库的服务调用）
//! - 网关前置鉴权端点（forward-auth）
//! - 管理接口：重置、查看限流状态
//! - 健康检查与 Prometheus 指标

pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{build_router, AdmissionHttpServer, AppState};
