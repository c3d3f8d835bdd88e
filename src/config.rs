use std::collections::HashMap;
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::security::policy::Policy;

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP 监听地址
    pub host: String,
    /// HTTP 监听端口
    pub port: u16,
    /// PostgreSQL（第二层计数，可选）
    pub database: Option<DatabaseConfig>,
    /// Redis（第一层计数，可选）
    pub redis: Option<RedisConfig>,
    /// 远程动态限流配置（可选）
    pub remote_config: Option<RemoteConfigSettings>,
    /// 管理接口
    pub admin: AdminConfig,
    /// 支付风控
    pub payment: PaymentConfig,
    /// 限流通用设置
    pub limits: LimitsConfig,
    /// 内置策略覆盖（key 为 endpoint key，如 `chat:paid`）
    pub policies: HashMap<String, Policy>,
    /// 日志
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            database: None,
            redis: None,
            remote_config: None,
            admin: AdminConfig::default(),
            payment: PaymentConfig::default(),
            limits: LimitsConfig::default(),
            policies: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 监听地址 `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 文本加载配置（缺省字段使用默认值）
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).with_context(|| "配置文件格式错误")?;
        Ok(toml_config.into())
    }

    /// 从环境变量合并
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("ADMISSION_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("ADMISSION_PORT") {
            self.port = port.parse().unwrap_or(self.port);
        }
        if let Ok(level) = env::var("ADMISSION_LOG_LEVEL") {
            self.logging.level = Some(level);
        }

        if let Ok(db_url) = env::var("DATABASE_URL") {
            self.set_database_url(db_url);
        }
        if let Ok(redis_url) = env::var("REDIS_URL") {
            self.set_redis_url(redis_url);
        }

        if let Ok(url) = env::var("ADMISSION_REMOTE_CONFIG_URL") {
            self.set_remote_config_url(url);
        }
        if let Ok(token) = env::var("ADMISSION_REMOTE_CONFIG_TOKEN") {
            if let Some(remote) = &mut self.remote_config {
                remote.token = Some(token);
            }
        }

        if let Ok(key) = env::var("ADMISSION_SERVICE_KEY") {
            self.admin.service_key = Some(key);
        }
        if let Ok(allowlist) = env::var("ADMISSION_ADMIN_ALLOWLIST") {
            self.admin.allowlist = split_list(&allowlist);
        }
        if let Ok(trust) = env::var("ADMISSION_TRUST_PROXY") {
            self.limits.trust_proxy = trust.parse().unwrap_or(self.limits.trust_proxy);
        }
        if let Ok(proxies) = env::var("ADMISSION_TRUSTED_PROXIES") {
            self.limits.trusted_proxies = split_list(&proxies);
        }

        Ok(())
    }

    /// 从命令行参数合并
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(db_url) = &cli.database_url {
            self.set_database_url(db_url.clone());
        }
        if let Some(redis_url) = &cli.redis_url {
            self.set_redis_url(redis_url.clone());
        }
        if let Some(url) = &cli.remote_config_url {
            self.set_remote_config_url(url.clone());
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = Some(level);
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = match &cli.config_file {
            Some(config_file) if Path::new(config_file).exists() => {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            }
            Some(config_file) => {
                warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
            None if Path::new("config.toml").exists() => {
                info!("📄 从默认配置文件加载: config.toml");
                Self::from_toml_file("config.toml")?
            }
            None => Self::new(),
        };

        config.merge_from_env()?;
        config.merge_from_cli(cli);
        config.validate()?;

        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("端口不能为 0");
        }
        for (key, policy) in &self.policies {
            if !policy.is_valid() {
                bail!(
                    "策略 {} 无效: window 和 block_duration 必须在 1..={} 秒之间",
                    key,
                    crate::security::policy::MAX_POLICY_SECS
                );
            }
        }
        if self.payment.review_threshold > self.payment.block_threshold {
            bail!(
                "payment.review_threshold ({}) 不能大于 block_threshold ({})",
                self.payment.review_threshold,
                self.payment.block_threshold
            );
        }
        if self.limits.sweep_interval_secs == 0 {
            bail!("limits.sweep_interval_secs 必须大于 0");
        }
        for proxy in &self.limits.trusted_proxies {
            if proxy.parse::<IpAddr>().is_err() {
                bail!("limits.trusted_proxies 包含无效地址: {}", proxy);
            }
        }
        if self.limits.trust_proxy && self.limits.trusted_proxies.is_empty() {
            bail!("limits.trust_proxy 已开启，但未配置 limits.trusted_proxies");
        }
        Ok(())
    }

    /// 用于展示的副本：隐藏密钥和连接串中的密码
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if let Some(db) = &mut config.database {
            db.url = crate::infra::database::mask_database_url(&db.url);
        }
        if let Some(redis) = &mut config.redis {
            redis.url = crate::infra::database::mask_database_url(&redis.url);
        }
        if let Some(remote) = &mut config.remote_config {
            remote.token = remote.token.as_ref().map(|_| "***".to_string());
        }
        config.admin.service_key = config.admin.service_key.as_ref().map(|_| "***".to_string());
        config
    }

    fn set_database_url(&mut self, url: String) {
        match &mut self.database {
            Some(db) => db.url = url,
            None => self.database = Some(DatabaseConfig::with_url(url)),
        }
    }

    fn set_redis_url(&mut self, url: String) {
        match &mut self.redis {
            Some(redis) => redis.url = url,
            None => self.redis = Some(RedisConfig::with_url(url)),
        }
    }

    fn set_remote_config_url(&mut self, url: String) {
        match &mut self.remote_config {
            Some(remote) => remote.url = url,
            None => self.remote_config = Some(RemoteConfigSettings::with_url(url)),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 快速读取配置文件中的 [logging] 段（日志系统初始化早于完整配置加载）
pub fn load_early_logging_config(config_file: Option<&str>) -> LoggingConfig {
    let path = config_file.unwrap_or("config.toml");
    let Ok(content) = fs::read_to_string(path) else {
        return LoggingConfig::default();
    };

    #[derive(Deserialize)]
    struct EarlyConfig {
        logging: Option<LoggingConfig>,
    }

    toml::from_str::<EarlyConfig>(&content)
        .ok()
        .and_then(|c| c.logging)
        .unwrap_or_default()
}

/// PostgreSQL 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// 连接池上限
    pub max_connections: u32,
    /// 获取连接超时（毫秒）
    pub acquire_timeout_ms: u64,
    /// 单条语句超时（毫秒），超时即降级
    pub statement_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn with_url(url: String) -> Self {
        Self {
            url,
            max_connections: 10,
            acquire_timeout_ms: 500,
            statement_timeout_ms: 300,
        }
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 最小空闲连接
    pub min_idle: u32,
    /// 连接超时时间（秒）
    pub connection_timeout_secs: u64,
    /// 单条命令超时（毫秒）
    pub command_timeout_ms: u64,
    /// 空闲连接回收时间（秒）
    pub idle_timeout_secs: u64,
}

impl RedisConfig {
    pub fn with_url(url: String) -> Self {
        Self {
            url,
            pool_size: 16,
            min_idle: 0,
            connection_timeout_secs: 2,
            command_timeout_ms: 200,
            idle_timeout_secs: 300,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// 远程动态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfigSettings {
    /// 基础 URL，条目地址为 `{url}/item/rateLimit:{endpoint}`
    pub url: String,
    /// Bearer token
    pub token: Option<String>,
    /// 请求超时（毫秒）
    pub timeout_ms: u64,
    /// 本地缓存时间（秒）
    pub cache_ttl_secs: u64,
}

impl RemoteConfigSettings {
    pub fn with_url(url: String) -> Self {
        Self {
            url,
            token: None,
            timeout_ms: 300,
            cache_ttl_secs: 30,
        }
    }
}

/// 管理接口配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// 白名单网络来源：命中时不计数
    pub allowlist: Vec<String>,
    /// 需要的角色（为空则不检查）
    pub required_role: Option<String>,
    /// 管理重置接口的服务密钥（`X-Service-Key`）
    pub service_key: Option<String>,
}

/// 支付风控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// 允许的 Origin（为空则不检查）
    pub allowed_origins: Vec<String>,
    /// 风险分达到该值直接拦截
    pub block_threshold: u32,
    /// 风险分达到该值记录告警
    pub review_threshold: u32,
    /// 支付网关使用的策略（`payment:{endpoint}`）
    pub endpoint: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            block_threshold: 80,
            review_threshold: 50,
            endpoint: "checkout".to_string(),
        }
    }
}

/// 限流通用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// 过期计数清理间隔（秒）
    pub sweep_interval_secs: u64,
    /// 是否读取代理头（X-Forwarded-For 等），只对 `trusted_proxies` 发来的请求生效
    pub trust_proxy: bool,
    /// 可信反向代理地址
    pub trusted_proxies: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            trust_proxy: false,
            trusted_proxies: Vec::new(),
        }
    }
}

impl LimitsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// 解析后的可信代理地址（无效条目由 `validate` 拦截）
    pub fn trusted_proxy_addrs(&self) -> Vec<IpAddr> {
        self.trusted_proxies
            .iter()
            .filter_map(|p| p.trim().parse().ok())
            .collect()
    }
}

/// 日志配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

/// TOML 配置文件结构（用于反序列化）
#[derive(Debug, Deserialize)]
struct TomlConfig {
    server: Option<TomlServerConfig>,
    database: Option<TomlDatabaseConfig>,
    redis: Option<TomlRedisConfig>,
    remote_config: Option<TomlRemoteConfig>,
    admin: Option<TomlAdminConfig>,
    payment: Option<TomlPaymentConfig>,
    limits: Option<TomlLimitsConfig>,
    policies: Option<HashMap<String, TomlPolicy>>,
    logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
struct TomlServerConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct TomlDatabaseConfig {
    url: Option<String>,
    max_connections: Option<u32>,
    acquire_timeout_ms: Option<u64>,
    statement_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlRedisConfig {
    url: Option<String>,
    pool_size: Option<u32>,
    min_idle: Option<u32>,
    connection_timeout: Option<u64>,
    command_timeout_ms: Option<u64>,
    idle_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlRemoteConfig {
    url: Option<String>,
    token: Option<String>,
    timeout_ms: Option<u64>,
    cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlAdminConfig {
    allowlist: Option<Vec<String>>,
    required_role: Option<String>,
    service_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlPaymentConfig {
    allowed_origins: Option<Vec<String>>,
    block_threshold: Option<u32>,
    review_threshold: Option<u32>,
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlLimitsConfig {
    sweep_interval_secs: Option<u64>,
    trust_proxy: Option<bool>,
    trusted_proxies: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TomlPolicy {
    requests: u64,
    window: u64,
    max_violations: u64,
    block_duration: u64,
}

impl From<TomlConfig> for ServerConfig {
    fn from(toml: TomlConfig) -> Self {
        let mut config = Self::default();

        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                config.host = host;
            }
            if let Some(port) = server.port {
                config.port = port;
            }
        }

        if let Some(db) = toml.database {
            if let Some(url) = db.url {
                let mut db_config = DatabaseConfig::with_url(url);
                if let Some(max) = db.max_connections {
                    db_config.max_connections = max;
                }
                if let Some(ms) = db.acquire_timeout_ms {
                    db_config.acquire_timeout_ms = ms;
                }
                if let Some(ms) = db.statement_timeout_ms {
                    db_config.statement_timeout_ms = ms;
                }
                config.database = Some(db_config);
            }
        }

        if let Some(redis) = toml.redis {
            if let Some(url) = redis.url {
                let mut redis_config = RedisConfig::with_url(url);
                if let Some(size) = redis.pool_size {
                    redis_config.pool_size = size;
                }
                if let Some(min_idle) = redis.min_idle {
                    redis_config.min_idle = min_idle;
                }
                if let Some(secs) = redis.connection_timeout {
                    redis_config.connection_timeout_secs = secs;
                }
                if let Some(ms) = redis.command_timeout_ms {
                    redis_config.command_timeout_ms = ms;
                }
                if let Some(secs) = redis.idle_timeout {
                    redis_config.idle_timeout_secs = secs;
                }
                config.redis = Some(redis_config);
            }
        }

        if let Some(remote) = toml.remote_config {
            if let Some(url) = remote.url {
                let mut settings = RemoteConfigSettings::with_url(url);
                settings.token = remote.token;
                if let Some(ms) = remote.timeout_ms {
                    settings.timeout_ms = ms;
                }
                if let Some(secs) = remote.cache_ttl_secs {
                    settings.cache_ttl_secs = secs;
                }
                config.remote_config = Some(settings);
            }
        }

        if let Some(admin) = toml.admin {
            if let Some(allowlist) = admin.allowlist {
                config.admin.allowlist = allowlist;
            }
            config.admin.required_role = admin.required_role;
            config.admin.service_key = admin.service_key;
        }

        if let Some(payment) = toml.payment {
            if let Some(origins) = payment.allowed_origins {
                config.payment.allowed_origins = origins;
            }
            if let Some(t) = payment.block_threshold {
                config.payment.block_threshold = t;
            }
            if let Some(t) = payment.review_threshold {
                config.payment.review_threshold = t;
            }
            if let Some(endpoint) = payment.endpoint {
                config.payment.endpoint = endpoint;
            }
        }

        if let Some(limits) = toml.limits {
            if let Some(secs) = limits.sweep_interval_secs {
                config.limits.sweep_interval_secs = secs;
            }
            if let Some(trust) = limits.trust_proxy {
                config.limits.trust_proxy = trust;
            }
            if let Some(proxies) = limits.trusted_proxies {
                config.limits.trusted_proxies = proxies;
            }
        }

        if let Some(policies) = toml.policies {
            config.policies = policies
                .into_iter()
                .map(|(key, p)| {
                    (
                        key,
                        Policy::new(p.requests, p.window, p.max_violations, p.block_duration),
                    )
                })
                .collect();
        }

        if let Some(logging) = toml.logging {
            config.logging = logging;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
port = 9191

[redis]
url = "redis://127.0.0.1:6379"
command_timeout_ms = 150

[admin]
allowlist = ["10.0.0.1"]
required_role = "admin"

[payment]
allowed_origins = ["https://app.privchat.dev"]
block_threshold = 90

[policies."chat:paid"]
requests = 2000
window = 86400
max_violations = 10
block_duration = 1800

[logging]
level = "debug"
format = "json"
"#;

    #[test]
    fn test_parse_sections() {
        let config = ServerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.port, 9191);
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.database.is_none());

        let redis = config.redis.as_ref().unwrap();
        assert_eq!(redis.command_timeout(), Duration::from_millis(150));
        assert_eq!(redis.pool_size, 16);

        assert_eq!(config.admin.allowlist, vec!["10.0.0.1".to_string()]);
        assert_eq!(config.payment.block_threshold, 90);
        assert_eq!(config.payment.review_threshold, 50);
        assert_eq!(config.policies["chat:paid"], Policy::new(2000, 86_400, 10, 1_800));
        assert_eq!(config.logging.format.as_deref(), Some("json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let config = ServerConfig::from_toml_str(
            r#"
[policies."chat:free"]
requests = 10
window = 0
max_violations = 1
block_duration = 60
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = ServerConfig::default();
        config.database = Some(DatabaseConfig::with_url(
            "postgres://admission:hunter2@db:5432/privchat".to_string(),
        ));
        config.admin.service_key = Some("secret".to_string());

        let shown = config.redacted();
        assert!(!shown.database.unwrap().url.contains("hunter2"));
        assert_eq!(shown.admin.service_key.as_deref(), Some("***"));
    }

    #[test]
    fn test_unbounded_block_duration_rejected() {
        let mut config = ServerConfig::default();
        config
            .policies
            .insert("chat:paid".to_string(), Policy::new(1, 60, 0, u64::MAX));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trusted_proxies() {
        let mut config = ServerConfig::default();
        assert!(!config.limits.trust_proxy);
        assert!(config.validate().is_ok());

        config.limits.trust_proxy = true;
        assert!(config.validate().is_err());

        config.limits.trusted_proxies = vec!["10.0.0.1".to_string(), "not-an-ip".to_string()];
        assert!(config.validate().is_err());

        config.limits.trusted_proxies = vec!["10.0.0.1".to_string(), "::1".to_string()];
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.trusted_proxy_addrs().len(), 2);

        let parsed = ServerConfig::from_toml_str(
            r#"
[limits]
trust_proxy = true
trusted_proxies = ["172.16.0.10"]
"#,
        )
        .unwrap();
        assert_eq!(parsed.limits.trusted_proxies, vec!["172.16.0.10".to_string()]);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" 10.0.0.1, ,10.0.0.2 "), vec!["10.0.0.1", "10.0.0.2"]);
    }
}
