//! 限流策略来源
//!
//! 解析顺序：远程动态配置（`rateLimit:{endpoint}`）→ 内置策略表 → 兜底策略。
//! 远程配置的任何错误都只降级，不向调用方抛出。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::config::RemoteConfigSettings;
use crate::error::{Result, ServerError};
use crate::security::policy::{default_policy, Policy, BUILTIN_POLICIES};

/// 动态配置中限流条目的 key 前缀
pub const REMOTE_KEY_PREFIX: &str = "rateLimit:";

/// 策略来源接口
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// 查询 endpoint 的策略，`Ok(None)` 表示该来源没有这个条目
    async fn get_policy(&self, endpoint_key: &str) -> Result<Option<Policy>>;

    /// 来源名称（日志用）
    fn name(&self) -> &'static str;
}

/// 内置策略表（可被配置文件中的 `[policies."<key>"]` 覆盖）
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    table: HashMap<String, Policy>,
}

impl Default for StaticConfigProvider {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl StaticConfigProvider {
    pub fn new(overrides: HashMap<String, Policy>) -> Self {
        let mut table: HashMap<String, Policy> = BUILTIN_POLICIES
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        for (key, policy) in overrides {
            if policy.is_valid() {
                table.insert(key, policy);
            } else {
                warn!("⚠️ 忽略非法的策略覆盖: {} {:?}", key, policy);
            }
        }

        Self { table }
    }

    pub fn lookup(&self, endpoint_key: &str) -> Option<Policy> {
        self.table.get(endpoint_key).copied()
    }

    /// 已知的 endpoint key 列表
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.table.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn get_policy(&self, endpoint_key: &str) -> Result<Option<Policy>> {
        Ok(self.lookup(endpoint_key))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// 远程动态配置（Edge Config 风格的 KV 接口）
///
/// `GET {base_url}/item/rateLimit:{endpoint}`，返回 Policy JSON；404 表示无条目。
/// 成功结果（包括"无条目"）在本地短暂缓存，失败不缓存。
pub struct RemoteConfigProvider {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    cache: Cache<String, Option<Policy>>,
}

impl RemoteConfigProvider {
    pub fn new(settings: &RemoteConfigSettings) -> Result<Self> {
        let base_url = Url::parse(&settings.url).map_err(|e| {
            ServerError::Configuration(format!("Invalid remote config url {}: {}", settings.url, e))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| ServerError::Configuration(format!("Failed to build http client: {}", e)))?;

        let cache = Cache::builder()
            .max_capacity(1_000)
            .time_to_live(Duration::from_secs(settings.cache_ttl_secs))
            .build();

        Ok(Self {
            client,
            base_url,
            token: settings.token.clone(),
            cache,
        })
    }

    fn item_url(&self, endpoint_key: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ServerError::Configuration("remote config url cannot be a base".into()))?
            .pop_if_empty()
            .push("item")
            .push(&format!("{}{}", REMOTE_KEY_PREFIX, endpoint_key));
        Ok(url)
    }

    async fn fetch(&self, endpoint_key: &str) -> Result<Option<Policy>> {
        let url = self.item_url(endpoint_key)?;
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let policy: Policy = response.json().await?;
                if !policy.is_valid() {
                    return Err(ServerError::Configuration(format!(
                        "remote policy for {} is invalid: {:?}",
                        endpoint_key, policy
                    )));
                }
                Ok(Some(policy))
            }
            status => Err(ServerError::Network(format!(
                "remote config returned {} for {}",
                status, endpoint_key
            ))),
        }
    }
}

#[async_trait]
impl ConfigProvider for RemoteConfigProvider {
    async fn get_policy(&self, endpoint_key: &str) -> Result<Option<Policy>> {
        if let Some(cached) = self.cache.get(endpoint_key).await {
            return Ok(cached);
        }

        let fetched = self.fetch(endpoint_key).await?;
        self.cache.insert(endpoint_key.to_string(), fetched).await;
        Ok(fetched)
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// 组合来源：先问主来源，失败或无条目时使用内置表，最后使用兜底策略
pub struct FallbackConfigProvider {
    primary: Option<Arc<dyn ConfigProvider>>,
    fallback: StaticConfigProvider,
}

impl FallbackConfigProvider {
    pub fn new(primary: Option<Arc<dyn ConfigProvider>>, fallback: StaticConfigProvider) -> Self {
        Self { primary, fallback }
    }

    /// 只使用内置表
    pub fn static_only(fallback: StaticConfigProvider) -> Self {
        Self::new(None, fallback)
    }

    /// 解析策略，永不失败
    pub async fn resolve(&self, endpoint_key: &str) -> Policy {
        if let Some(primary) = &self.primary {
            match primary.get_policy(endpoint_key).await {
                Ok(Some(policy)) => return policy,
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        "{} 策略来源不可用，使用内置策略: endpoint={}, error={}",
                        primary.name(),
                        endpoint_key,
                        e
                    );
                    crate::infra::metrics::record_policy_fallback(primary.name());
                }
            }
        }

        self.fallback
            .lookup(endpoint_key)
            .unwrap_or_else(default_policy)
    }

    pub fn static_table(&self) -> &StaticConfigProvider {
        &self.fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenProvider;

    #[async_trait]
    impl ConfigProvider for BrokenProvider {
        async fn get_policy(&self, _endpoint_key: &str) -> Result<Option<Policy>> {
            Err(ServerError::Network("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    struct FixedProvider(Policy);

    #[async_trait]
    impl ConfigProvider for FixedProvider {
        async fn get_policy(&self, endpoint_key: &str) -> Result<Option<Policy>> {
            Ok((endpoint_key == "chat:paid").then_some(self.0))
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn test_remote_error_falls_back_to_builtin() {
        let provider = FallbackConfigProvider::new(
            Some(Arc::new(BrokenProvider)),
            StaticConfigProvider::default(),
        );
        let policy = provider.resolve("chat:anonymous").await;
        assert_eq!(policy, Policy::new(5, 86_400, 3, 3_600));
    }

    #[tokio::test]
    async fn test_remote_entry_wins() {
        let remote = Policy::new(7, 60, 1, 60);
        let provider = FallbackConfigProvider::new(
            Some(Arc::new(FixedProvider(remote))),
            StaticConfigProvider::default(),
        );
        assert_eq!(provider.resolve("chat:paid").await, remote);
        // 远程没有条目时走内置表
        assert_eq!(provider.resolve("chat:free").await.requests, 50);
    }

    #[tokio::test]
    async fn test_unknown_key_uses_default() {
        let provider = FallbackConfigProvider::static_only(StaticConfigProvider::default());
        assert_eq!(provider.resolve("nope:nothing").await, default_policy());
    }

    #[test]
    fn test_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("chat:paid".to_string(), Policy::new(9, 60, 1, 60));
        overrides.insert("chat:free".to_string(), Policy::new(9, 0, 1, 60));
        let provider = StaticConfigProvider::new(overrides);
        assert_eq!(provider.lookup("chat:paid"), Some(Policy::new(9, 60, 1, 60)));
        // window=0 的覆盖被忽略
        assert_eq!(provider.lookup("chat:free").map(|p| p.requests), Some(50));
    }

    #[test]
    fn test_item_url() {
        let provider = RemoteConfigProvider::new(&RemoteConfigSettings {
            url: "https://edge-config.example.com/ecfg_123/".to_string(),
            token: None,
            timeout_ms: 500,
            cache_ttl_secs: 10,
        })
        .unwrap();
        let url = provider.item_url("chat:paid").unwrap();
        assert_eq!(
            url.as_str(),
            "https://edge-config.example.com/ecfg_123/item/rateLimit:chat:paid"
        );
    }
}
