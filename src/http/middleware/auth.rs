//! 网关身份上下文
//!
//! 认证由上游网关完成，网关通过请求头传递已验证的调用方信息：
//! - `X-User-Id`    用户 ID（缺失即匿名）
//! - `X-User-Tier`  权益等级（anonymous / free / paid）
//! - `X-User-Roles` 逗号分隔的角色列表
//!
//! 本服务只应部署在网关之后，这些请求头不做二次校验。

use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use tracing::debug;

use crate::security::identity::RequestMeta;
use crate::security::policy::Tier;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";
pub const USER_ROLES_HEADER: &str = "x-user-roles";

/// 调用方上下文（请求扩展）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub user_id: Option<String>,
    pub tier: Option<Tier>,
    pub roles: Vec<String>,
}

impl CallerContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        Self {
            user_id: get(USER_ID_HEADER).map(str::to_string),
            tier: get(USER_TIER_HEADER).and_then(Tier::parse),
            roles: get(USER_ROLES_HEADER)
                .map(|roles| {
                    roles
                        .split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    /// 实际生效的等级：未登录一律 anonymous；已登录但网关未给出等级时视为 free
    pub fn effective_tier(&self) -> Tier {
        match (&self.user_id, self.tier) {
            (None, _) => Tier::Anonymous,
            (Some(_), Some(Tier::Anonymous)) | (Some(_), None) => Tier::Free,
            (Some(_), Some(tier)) => tier,
        }
    }
}

/// 网关上下文中间件：把请求头解析为 `CallerContext` 放入请求扩展
pub async fn gateway_context(mut request: Request, next: Next) -> Response {
    let context = CallerContext::from_headers(request.headers());
    debug!(
        "🔐 调用方: user={:?}, tier={:?}, roles={:?}",
        context.user_id, context.tier, context.roles
    );
    request.extensions_mut().insert(context);
    next.run(request).await
}

/// 读取调用方上下文（未经过网关中间件时为匿名）
pub fn caller_context(request: &Request) -> CallerContext {
    request
        .extensions()
        .get::<CallerContext>()
        .cloned()
        .unwrap_or_default()
}

/// 提取限流所需的请求元数据
pub fn request_meta(request: &Request) -> RequestMeta {
    let peer_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    RequestMeta::new(request.method().clone(), request.headers().clone(), peer_addr)
}
