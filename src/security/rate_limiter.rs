/// 准入控制器
///
/// 每个受保护请求的唯一入口：
/// 1. 由 endpoint 类别 + 用户等级拼出 endpoint key，解析策略
/// 2. 推导调用方身份
/// 3. 生成固定窗口计数键，交给分层存储自增（或只读查看）
/// 4. 根据计数、违规数和封禁状态给出 `AdmissionDecision`
///
/// `check` 永不返回错误：存储层、策略来源的故障都在内部降级（fail open），
/// 只有超限和封禁会拒绝请求（fail closed）。
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::security::config_provider::{
    ConfigProvider, FallbackConfigProvider, RemoteConfigProvider, StaticConfigProvider,
};
use crate::security::decision::{AdmissionDecision, RejectionCode};
use crate::security::identity::{Identifier, RequestMeta};
use crate::security::policy::{endpoint_key, tiered_endpoint_key, EndpointCategory, Policy, Tier};
use crate::security::store::{
    build_counter_store, within_limit, CheckMode, TieredCounterStore, TieredSnapshot,
};
use crate::security::window::{Clock, SystemClock, WindowKey};

/// 匿名用户登录后需要清理的 endpoint
pub const ANONYMOUS_ENDPOINTS: [&str; 3] = ["general:anonymous", "chat:anonymous", "media:anonymous"];

/// 单次检查的选项
#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub endpoint_category: EndpointCategory,
    /// 用户等级（general / chat / media 使用）；缺省时按是否登录推导
    pub tier: Option<Tier>,
    /// 非分级类别的具体操作（如 `checkout`、`sensitive`）
    pub qualifier: Option<String>,
    /// 已认证用户 ID
    pub caller_identity: Option<String>,
    /// 子资源（如聊天角色），不同子资源分别计数
    pub sub_resource: Option<String>,
    /// 管理接口：来源在白名单内时不计数
    pub allow_admin_bypass: bool,
    /// 只读查看，不修改任何计数
    pub read_only: bool,
}

impl CheckOptions {
    pub fn new(endpoint_category: EndpointCategory) -> Self {
        Self {
            endpoint_category,
            tier: None,
            qualifier: None,
            caller_identity: None,
            sub_resource: None,
            allow_admin_bypass: false,
            read_only: false,
        }
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn caller(mut self, user_id: impl Into<String>) -> Self {
        self.caller_identity = Some(user_id.into());
        self
    }

    pub fn sub_resource(mut self, sub_resource: impl Into<String>) -> Self {
        self.sub_resource = Some(sub_resource.into());
        self
    }

    pub fn admin_bypass(mut self, allow: bool) -> Self {
        self.allow_admin_bypass = allow;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// 推导 endpoint key
    ///
    /// 显式 qualifier 优先；分级类别按等级拼接；其余类别使用各自的默认操作
    pub fn endpoint_key(&self) -> String {
        if let Some(q) = self.qualifier.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            return endpoint_key(self.endpoint_category, q);
        }

        if self.endpoint_category.is_tiered() {
            let tier = self
                .tier
                .unwrap_or_else(|| Tier::from_entitlement(self.caller_identity.is_some(), false));
            return tiered_endpoint_key(self.endpoint_category, tier);
        }

        let default_qualifier = match self.endpoint_category {
            EndpointCategory::Auth => "login",
            _ => "general",
        };
        endpoint_key(self.endpoint_category, default_qualifier)
    }
}

pub struct AdmissionController {
    policies: FallbackConfigProvider,
    identifier: Identifier,
    store: TieredCounterStore,
    clock: Arc<dyn Clock>,
    admin_allowlist: Vec<String>,
}

impl AdmissionController {
    pub fn new(
        policies: FallbackConfigProvider,
        identifier: Identifier,
        store: TieredCounterStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies,
            identifier,
            store,
            clock,
            admin_allowlist: Vec::new(),
        }
    }

    /// 管理接口白名单（网络来源，精确匹配）
    pub fn with_admin_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.admin_allowlist = allowlist
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    /// 按配置组装：远程策略来源、存储层、身份推导
    pub async fn from_config(config: &ServerConfig) -> Self {
        let static_table = StaticConfigProvider::new(config.policies.clone());

        let primary: Option<Arc<dyn ConfigProvider>> = match &config.remote_config {
            Some(settings) => match RemoteConfigProvider::new(settings) {
                Ok(provider) => {
                    info!("🌐 远程限流配置: {}", settings.url);
                    Some(Arc::new(provider))
                }
                Err(e) => {
                    warn!("⚠️ 远程限流配置不可用，只使用内置策略: {}", e);
                    None
                }
            },
            None => {
                info!("ℹ️ 未配置远程限流配置，使用内置策略");
                None
            }
        };

        let store = build_counter_store(config).await;

        Self::new(
            FallbackConfigProvider::new(primary, static_table),
            Identifier::new(config.limits.trust_proxy, config.limits.trusted_proxy_addrs()),
            store,
            Arc::new(SystemClock),
        )
        .with_admin_allowlist(config.admin.allowlist.clone())
    }

    pub fn store(&self) -> &TieredCounterStore {
        &self.store
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn policies(&self) -> &FallbackConfigProvider {
        &self.policies
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// 推导调用方身份
    pub fn identify(&self, request: &RequestMeta, user_id: Option<&str>) -> String {
        self.identifier.identify(request, user_id)
    }

    /// 请求来源是否在管理白名单内
    pub fn is_allowlisted(&self, request: &RequestMeta) -> bool {
        if self.admin_allowlist.is_empty() {
            return false;
        }
        self.identifier
            .network_origin(request)
            .map_or(false, |origin| self.admin_allowlist.iter().any(|a| *a == origin))
    }

    /// 解析策略（永不失败）
    pub async fn resolve_policy(&self, endpoint: &str) -> Policy {
        self.policies.resolve(endpoint).await
    }

    /// 准入检查
    pub async fn check(&self, request: &RequestMeta, options: &CheckOptions) -> AdmissionDecision {
        let now = self.clock.now();
        let endpoint = options.endpoint_key();
        let policy = self.policies.resolve(&endpoint).await;

        if options.allow_admin_bypass && self.is_allowlisted(request) {
            debug!("管理白名单放行: endpoint={}", endpoint);
            crate::infra::metrics::record_admission(&endpoint, "bypass", "bypass");
            return AdmissionDecision::bypass(endpoint, policy.requests, policy.window, now);
        }

        let identity = self
            .identifier
            .identify(request, options.caller_identity.as_deref());
        let mode = if options.read_only {
            CheckMode::Peek
        } else {
            CheckMode::Increment
        };

        self.decide(&identity, endpoint, policy, options.sub_resource.clone(), mode, now)
            .await
    }

    /// 只读查看：不修改计数、违规数和封禁
    pub async fn peek(&self, request: &RequestMeta, options: &CheckOptions) -> AdmissionDecision {
        let options = options.clone().read_only(true);
        self.check(request, &options).await
    }

    /// 按已知身份只读查看（管理接口使用）
    pub async fn peek_identity(
        &self,
        identity: &str,
        endpoint: &str,
        sub_resource: Option<String>,
    ) -> AdmissionDecision {
        let now = self.clock.now();
        let policy = self.policies.resolve(endpoint).await;
        self.decide(identity, endpoint.to_string(), policy, sub_resource, CheckMode::Peek, now)
            .await
    }

    async fn decide(
        &self,
        identity: &str,
        endpoint: String,
        policy: Policy,
        sub_resource: Option<String>,
        mode: CheckMode,
        now: i64,
    ) -> AdmissionDecision {
        let key = WindowKey::new(identity, endpoint.as_str(), sub_resource, policy.window, now);
        let TieredSnapshot { snapshot, tier } = self.store.check(&key, &policy, mode, now).await;

        let is_blocked = snapshot.is_blocked(now);
        let allowed = !is_blocked
            && match mode {
                CheckMode::Increment => within_limit(snapshot.count, &policy),
                // 查看时回答"下一个请求能否通过"
                CheckMode::Peek => snapshot.count < policy.requests,
            };

        let reset_time = match snapshot.blocked_until {
            Some(until) if is_blocked => until,
            _ => key.reset_at(),
        };

        let block_reason = match (allowed, is_blocked) {
            (true, _) => None,
            (false, true) => Some(RejectionCode::TemporarilyBlocked),
            (false, false) => Some(RejectionCode::RateLimitExceeded),
        };

        if mode == CheckMode::Increment {
            let outcome = match block_reason {
                None => "allowed",
                Some(RejectionCode::TemporarilyBlocked) => "blocked",
                Some(_) => "denied",
            };
            crate::infra::metrics::record_admission(&endpoint, outcome, tier);

            if allowed {
                debug!(
                    "✅ 准入通过: identity={}, endpoint={}, count={}/{}, tier={}",
                    identity, endpoint, snapshot.count, policy.requests, tier
                );
            } else {
                info!(
                    "⛔ 准入拒绝: identity={}, endpoint={}, count={}/{}, violations={}, blocked={}, tier={}",
                    identity, endpoint, snapshot.count, policy.requests, snapshot.violations, is_blocked, tier
                );
            }
        }

        AdmissionDecision {
            allowed,
            count: snapshot.count,
            limit: policy.requests,
            remaining: (reset_time - now).max(0) as u64,
            reset_time,
            is_blocked,
            violations: snapshot.violations,
            block_reason,
            endpoint,
            window: policy.window,
            store: tier.to_string(),
        }
    }

    /// 删除 `(identity, endpoint)` 在所有存储层中的计数、违规和封禁
    pub async fn reset(&self, identity: &str, endpoint: &str) -> u64 {
        self.store.reset(identity, endpoint).await
    }

    /// 匿名用户完成登录后清理其匿名身份下的限流状态
    ///
    /// `endpoints` 为空时清理 `ANONYMOUS_ENDPOINTS`。已认证身份不处理。
    pub async fn forgive_anonymous(&self, anonymous_identity: &str, endpoints: &[&str]) -> u64 {
        if anonymous_identity.starts_with("user:") {
            warn!("拒绝清理已认证身份: {}", anonymous_identity);
            return 0;
        }

        let endpoints: &[&str] = if endpoints.is_empty() {
            &ANONYMOUS_ENDPOINTS
        } else {
            endpoints
        };

        let mut removed = 0;
        for endpoint in endpoints {
            removed += self.store.reset(anonymous_identity, endpoint).await;
        }
        removed
    }

    /// 清理过期计数
    pub async fn sweep(&self) -> u64 {
        self.store.sweep(self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::window::ManualClock;
    use axum::http::{HeaderMap, HeaderValue, Method};

    fn controller(clock: Arc<ManualClock>) -> AdmissionController {
        AdmissionController::new(
            FallbackConfigProvider::static_only(StaticConfigProvider::default()),
            Identifier::default(),
            TieredCounterStore::local_only(),
            clock,
        )
    }

    fn request_from(ip: &'static str) -> RequestMeta {
        RequestMeta::new(Method::POST, HeaderMap::new(), Some(ip.parse().unwrap()))
    }

    #[test]
    fn test_endpoint_key_resolution() {
        assert_eq!(CheckOptions::new(EndpointCategory::Chat).endpoint_key(), "chat:anonymous");
        assert_eq!(
            CheckOptions::new(EndpointCategory::Chat).caller("42").endpoint_key(),
            "chat:free"
        );
        assert_eq!(
            CheckOptions::new(EndpointCategory::Chat)
                .caller("42")
                .tier(Tier::Paid)
                .endpoint_key(),
            "chat:paid"
        );
        assert_eq!(
            CheckOptions::new(EndpointCategory::General).tier(Tier::Paid).endpoint_key(),
            "general:authenticated"
        );
        assert_eq!(CheckOptions::new(EndpointCategory::Admin).endpoint_key(), "admin:general");
        assert_eq!(
            CheckOptions::new(EndpointCategory::Payment)
                .qualifier("checkout")
                .endpoint_key(),
            "payment:checkout"
        );
        assert_eq!(CheckOptions::new(EndpointCategory::Auth).endpoint_key(), "auth:login");
    }

    #[tokio::test]
    async fn test_remaining_is_seconds_until_reset() {
        let clock = Arc::new(ManualClock::new(1_000));
        let controller = controller(clock.clone());
        let options = CheckOptions::new(EndpointCategory::General).caller("7");

        let decision = controller.check(&request_from("10.0.0.1"), &options).await;
        assert!(decision.allowed);
        assert_eq!(decision.limit, 100);
        assert_eq!(decision.reset_time, 1_020);
        assert_eq!(decision.remaining, 20);
        assert_eq!(decision.store, "memory");
    }

    #[tokio::test]
    async fn test_admin_bypass_does_not_count() {
        let clock = Arc::new(ManualClock::new(0));
        let controller = controller(clock).with_admin_allowlist(vec!["10.1.1.1".to_string()]);
        let options = CheckOptions::new(EndpointCategory::Admin).admin_bypass(true);

        for _ in 0..100 {
            let decision = controller.check(&request_from("10.1.1.1"), &options).await;
            assert!(decision.allowed);
            assert_eq!(decision.store, "bypass");
        }

        let other = controller.check(&request_from("10.2.2.2"), &options).await;
        assert_eq!(other.count, 1);
    }

    #[tokio::test]
    async fn test_forwarded_header_cannot_claim_allowlist() {
        let clock = Arc::new(ManualClock::new(0));
        let controller = controller(clock).with_admin_allowlist(vec!["10.1.1.1".to_string()]);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1"));
        let forged = RequestMeta::new(Method::GET, headers, Some("198.51.100.7".parse().unwrap()));
        assert!(!controller.is_allowlisted(&forged));
        assert!(controller.is_allowlisted(&request_from("10.1.1.1")));
    }

    #[tokio::test]
    async fn test_forgive_anonymous_refuses_user_identity() {
        let clock = Arc::new(ManualClock::new(0));
        let controller = controller(clock);
        let options = CheckOptions::new(EndpointCategory::Chat).caller("9");
        controller.check(&request_from("10.0.0.9"), &options).await;

        assert_eq!(controller.forgive_anonymous("user:9", &[]).await, 0);
        let peek = controller.peek_identity("user:9", "chat:free", None).await;
        assert_eq!(peek.count, 1);
    }
}
