//! POST /api/admission/check - 准入检查（JSON）
//!
//! 供无法直接嵌入库的服务调用。调用方可以在请求体里给出终端用户的网络来源
//! （`clientIp`）和匿名令牌（`anonymousId`）；未给出时使用本次请求自身的请求头和对端地址。
//!
//! 返回 `AdmissionDecision` JSON，并附带 `X-RateLimit-*` 头；拒绝时状态码为 429。

use std::net::IpAddr;

use axum::{
    extract::{FromRequest, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Deserialize;

use crate::error::{Result, ServerError};
use crate::http::middleware::request_meta;
use crate::http::AppState;
use crate::security::identity::{RequestMeta, ANONYMOUS_TOKEN_HEADER};
use crate::security::policy::{EndpointCategory, Tier};
use crate::security::rate_limiter::CheckOptions;

pub fn create_route() -> Router<AppState> {
    Router::new().route("/api/admission/check", post(check_admission))
}

/// 准入检查请求体
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionCheckRequest {
    pub endpoint_category: EndpointCategory,
    pub tier: Option<Tier>,
    pub qualifier: Option<String>,
    pub user_id: Option<String>,
    pub sub_resource: Option<String>,
    #[serde(default)]
    pub allow_admin_bypass: bool,
    #[serde(default)]
    pub read_only: bool,
    pub client_ip: Option<String>,
    pub anonymous_id: Option<String>,
}

impl AdmissionCheckRequest {
    fn options(&self) -> CheckOptions {
        let mut options = CheckOptions::new(self.endpoint_category)
            .admin_bypass(self.allow_admin_bypass)
            .read_only(self.read_only);
        if let Some(tier) = self.tier {
            options = options.tier(tier);
        }
        if let Some(q) = &self.qualifier {
            options = options.qualifier(q.as_str());
        }
        if let Some(user_id) = &self.user_id {
            options = options.caller(user_id.as_str());
        }
        if let Some(sub) = &self.sub_resource {
            options = options.sub_resource(sub.as_str());
        }
        options
    }

    /// 请求体给出的终端用户信息优先于本次请求自身
    fn meta(&self, mut meta: RequestMeta) -> Result<RequestMeta> {
        if let Some(ip) = &self.client_ip {
            let ip: IpAddr = ip
                .trim()
                .parse()
                .map_err(|_| ServerError::BadRequest(format!("clientIp 无效: {}", ip)))?;
            meta = RequestMeta::new(meta.method, HeaderMap::new(), Some(ip));
        }

        if let Some(token) = &self.anonymous_id {
            let value = HeaderValue::from_str(token)
                .map_err(|_| ServerError::BadRequest("anonymousId 无效".to_string()))?;
            meta.headers.insert(ANONYMOUS_TOKEN_HEADER, value);
        }

        Ok(meta)
    }
}

async fn check_admission(State(state): State<AppState>, request: Request) -> Result<Response> {
    let meta = request_meta(&request);
    let Json(body) = Json::<AdmissionCheckRequest>::from_request(request, &state)
        .await
        .map_err(|e| ServerError::BadRequest(e.body_text()))?;

    let meta = body.meta(meta)?;
    let decision = state.controller.check(&meta, &body.options()).await;

    let status = match decision.block_reason {
        Some(code) if !decision.allowed => code.status(),
        _ => StatusCode::OK,
    };
    let mut headers = HeaderMap::new();
    decision.apply_headers(&mut headers);

    Ok((status, headers, Json(decision)).into_response())
}
