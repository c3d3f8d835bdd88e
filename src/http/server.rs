//! HTTP 服务器 - 使用 Axum 提供准入检查服务

use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::{AdminConfig, ServerConfig};
use crate::http::middleware::gateway_context;
use crate::http::routes;
use crate::security::fraud::RiskAssessor;
use crate::security::rate_limiter::AdmissionController;

/// HTTP 服务共享状态
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AdmissionController>,
    pub risk: Arc<RiskAssessor>,
    pub admin: Arc<AdminConfig>,
    /// 支付网关使用的策略 qualifier（`payment:{payment_endpoint}`）
    pub payment_endpoint: String,
}

impl AppState {
    pub fn new(controller: Arc<AdmissionController>, config: &ServerConfig) -> Self {
        Self {
            controller,
            risk: Arc::new(RiskAssessor::new(&config.payment)),
            admin: Arc::new(config.admin.clone()),
            payment_endpoint: config.payment.endpoint.clone(),
        }
    }
}

/// 构建完整路由（网关上下文层包在最外面）
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes(state.clone()))
        .layer(middleware::from_fn(gateway_context))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 准入 HTTP 服务器
pub struct AdmissionHttpServer {
    state: AppState,
    bind_address: String,
}

impl AdmissionHttpServer {
    pub fn new(state: AppState, bind_address: String) -> Self {
        Self {
            state,
            bind_address,
        }
    }

    /// 启动 HTTP 服务器，直到收到 Ctrl-C
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = build_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        info!("🌐 准入服务启动在 {}", self.bind_address);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        info!("👋 准入服务已停止");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ 无法监听退出信号: {}", e);
        std::future::pending::<()>().await;
    }
    info!("🛑 收到退出信号，开始关闭");
}
