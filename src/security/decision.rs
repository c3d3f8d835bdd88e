/// 准入结果与拒绝响应
///
/// 注意 `remaining` 是距离窗口重置的秒数，而剩余请求额度是 `limit - count`，
/// 两者都会写到响应头里：
/// - `X-RateLimit-Limit`      限额
/// - `X-RateLimit-Remaining`  剩余请求额度
/// - `X-RateLimit-Reset`      重置时间（Unix 秒）
/// - `X-RateLimit-Violations` 当前违规数
/// - `X-RateLimit-Blocked`    处于封禁时为 `true`
/// - `Retry-After`            拒绝时距离可重试的秒数
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_VIOLATIONS: &str = "x-ratelimit-violations";
pub const HEADER_BLOCKED: &str = "x-ratelimit-blocked";

/// 拒绝原因代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    RateLimitExceeded,
    TemporarilyBlocked,
    AuthRequired,
    InsufficientPermissions,
    SecurityBlock,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            RejectionCode::TemporarilyBlocked => "TEMPORARILY_BLOCKED",
            RejectionCode::AuthRequired => "AUTH_REQUIRED",
            RejectionCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            RejectionCode::SecurityBlock => "SECURITY_BLOCK",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RejectionCode::RateLimitExceeded | RejectionCode::TemporarilyBlocked => {
                StatusCode::TOO_MANY_REQUESTS
            }
            RejectionCode::AuthRequired => StatusCode::UNAUTHORIZED,
            RejectionCode::InsufficientPermissions | RejectionCode::SecurityBlock => {
                StatusCode::FORBIDDEN
            }
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RejectionCode::RateLimitExceeded => "Rate limit exceeded",
            RejectionCode::TemporarilyBlocked => "Temporarily blocked due to repeated violations",
            RejectionCode::AuthRequired => "Authentication required",
            RejectionCode::InsufficientPermissions => "Insufficient permissions",
            RejectionCode::SecurityBlock => "Request blocked by security checks",
        }
    }
}

/// 一次准入检查的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub count: u64,
    pub limit: u64,
    /// 距离重置的秒数（不是剩余请求数）
    pub remaining: u64,
    /// 重置时间（Unix 秒）；封禁时为封禁结束时间
    pub reset_time: i64,
    pub is_blocked: bool,
    pub violations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<RejectionCode>,
    pub endpoint: String,
    /// 窗口长度（秒）
    pub window: u64,
    /// 命中的计数存储层（redis / postgres / memory / bypass）
    pub store: String,
}

impl AdmissionDecision {
    /// 白名单放行：不计数
    pub fn bypass(endpoint: impl Into<String>, limit: u64, window: u64, now: i64) -> Self {
        Self {
            allowed: true,
            count: 0,
            limit,
            remaining: 0,
            reset_time: now,
            is_blocked: false,
            violations: 0,
            block_reason: None,
            endpoint: endpoint.into(),
            window,
            store: "bypass".to_string(),
        }
    }

    /// 剩余请求额度
    pub fn budget_remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }

    /// 拒绝时建议的重试等待秒数
    pub fn retry_after(&self) -> u64 {
        self.remaining.max(1)
    }

    /// 写入信息性响应头
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        insert_header(headers, HEADER_LIMIT, self.limit.to_string());
        insert_header(headers, HEADER_REMAINING, self.budget_remaining().to_string());
        insert_header(headers, HEADER_RESET, self.reset_time.to_string());
        insert_header(headers, HEADER_VIOLATIONS, self.violations.to_string());
        if self.is_blocked {
            insert_header(headers, HEADER_BLOCKED, "true".to_string());
        }
        if !self.allowed {
            insert_header(headers, "retry-after", self.retry_after().to_string());
        }
    }

    /// 拒绝时转换为结构化拒绝
    pub fn rejection(&self) -> Option<Rejection> {
        if self.allowed {
            return None;
        }
        let code = self.block_reason.unwrap_or(RejectionCode::RateLimitExceeded);
        Some(Rejection::with_decision(code, self.clone()))
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// 结构化拒绝（429 / 401 / 403）
#[derive(Debug, Clone)]
pub struct Rejection {
    pub code: RejectionCode,
    pub decision: Option<AdmissionDecision>,
    pub risk_score: Option<u32>,
}

impl Rejection {
    pub fn new(code: RejectionCode) -> Self {
        Self {
            code,
            decision: None,
            risk_score: None,
        }
    }

    pub fn with_decision(code: RejectionCode, decision: AdmissionDecision) -> Self {
        Self {
            code,
            decision: Some(decision),
            risk_score: None,
        }
    }

    pub fn security_block(risk_score: u32) -> Self {
        Self {
            code: RejectionCode::SecurityBlock,
            decision: None,
            risk_score: Some(risk_score),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    /// JSON 响应体
    pub fn body(&self) -> serde_json::Value {
        let mut body = json!({
            "error": self.code.message(),
            "code": self.code.as_str(),
        });

        if let (Some(d), Some(map)) = (&self.decision, body.as_object_mut()) {
            map.insert("limit".into(), json!(d.limit));
            map.insert("count".into(), json!(d.count));
            map.insert("remaining".into(), json!(d.remaining));
            map.insert("resetTime".into(), json!(d.reset_time));
            map.insert("violations".into(), json!(d.violations));
            map.insert("isBlocked".into(), json!(d.is_blocked));
            map.insert("window".into(), json!(d.window));
            map.insert("retryAfter".into(), json!(d.retry_after()));
        }
        if let (Some(score), Some(map)) = (self.risk_score, body.as_object_mut()) {
            map.insert("riskScore".into(), json!(score));
        }

        body
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        if let Some(decision) = &self.decision {
            decision.apply_headers(response.headers_mut());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denied() -> AdmissionDecision {
        AdmissionDecision {
            allowed: false,
            count: 6,
            limit: 5,
            remaining: 120,
            reset_time: 86_400,
            is_blocked: false,
            violations: 1,
            block_reason: Some(RejectionCode::RateLimitExceeded),
            endpoint: "chat:anonymous".to_string(),
            window: 86_400,
            store: "memory".to_string(),
        }
    }

    #[test]
    fn test_headers_expose_budget_and_reset() {
        let mut allowed = denied();
        allowed.allowed = true;
        allowed.count = 3;
        allowed.block_reason = None;

        let mut headers = HeaderMap::new();
        allowed.apply_headers(&mut headers);
        assert_eq!(headers[HEADER_LIMIT], "5");
        assert_eq!(headers[HEADER_REMAINING], "2");
        assert_eq!(headers[HEADER_RESET], "86400");
        assert_eq!(headers[HEADER_VIOLATIONS], "1");
        assert!(headers.get(HEADER_BLOCKED).is_none());
        assert!(headers.get("retry-after").is_none());
    }

    #[test]
    fn test_rejection_body() {
        let rejection = denied().rejection().unwrap();
        assert_eq!(rejection.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = rejection.body();
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["limit"], 5);
        assert_eq!(body["count"], 6);
        assert_eq!(body["retryAfter"], 120);
    }

    #[test]
    fn test_security_block_body() {
        let rejection = Rejection::security_block(85);
        assert_eq!(rejection.status(), StatusCode::FORBIDDEN);
        assert_eq!(rejection.body()["riskScore"], 85);
        assert!(rejection.body().get("limit").is_none());
    }

    #[test]
    fn test_blocked_response_headers() {
        let mut blocked = denied();
        blocked.is_blocked = true;
        blocked.block_reason = Some(RejectionCode::TemporarilyBlocked);
        let response = blocked.rejection().unwrap().into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[HEADER_BLOCKED], "true");
        assert_eq!(response.headers()["retry-after"], "120");
    }
}
