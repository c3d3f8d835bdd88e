/// 三层计数存储
///
/// 1. Redis（共享、原子批处理）
/// 2. PostgreSQL（持久化兜底，存储过程原子自增，失败时手动读改写）
/// 3. 进程内（仅单进程正确，水平扩展部署下只是尽力而为）
///
/// `TieredCounterStore` 按顺序逐层尝试，第一层成功即返回；每层失败只记录日志并
/// 进入下一层，进程内存储作为最后一层永不失败。跨层没有顺序保证：故障切换可能
/// 让计数从 0 重新开始。
pub mod memory_store;
pub mod postgres_store;
pub mod redis_store;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::infra::{Database, RedisClient};
use crate::security::policy::Policy;
use crate::security::violation::is_block_active;
use crate::security::window::WindowKey;

pub use memory_store::MemoryCounterStore;
pub use postgres_store::PostgresCounterStore;
pub use redis_store::RedisCounterStore;

/// 检查模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// 计数 +1 并判定
    Increment,
    /// 只读，不修改任何状态
    Peek,
}

/// 一次检查后看到的计数状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub count: u64,
    pub violations: u64,
    pub blocked_until: Option<i64>,
}

impl CounterSnapshot {
    pub fn is_blocked(&self, now: i64) -> bool {
        is_block_active(self.blocked_until, now)
    }
}

/// 存储层错误（只在层内使用，永远不会传到准入调用方）
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<ServerError> for StoreError {
    fn from(err: ServerError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// 计数是否仍在限额内
pub fn within_limit(count: u64, policy: &Policy) -> bool {
    count <= policy.requests
}

/// 计数存储接口
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 存储层名称（日志、指标、响应元数据使用）
    fn name(&self) -> &'static str;

    /// 自增并判定，或只读查看
    async fn check(
        &self,
        key: &WindowKey,
        policy: &Policy,
        mode: CheckMode,
        now: i64,
    ) -> Result<CounterSnapshot, StoreError>;

    /// 删除 `(identity, endpoint)` 的全部计数、违规和封禁状态，返回删除条目数
    async fn reset(&self, identity: &str, endpoint: &str) -> Result<u64, StoreError>;

    /// 清理过期记录（TTL 自动过期的存储不需要实现）
    async fn sweep(&self, _now: i64) -> Result<u64, StoreError> {
        Ok(0)
    }

    /// 上报连接池指标（没有连接池的存储不需要实现）
    fn record_pool_metrics(&self) {}
}

/// 检查结果 + 命中的存储层
#[derive(Debug, Clone, Copy)]
pub struct TieredSnapshot {
    pub snapshot: CounterSnapshot,
    pub tier: &'static str,
}

/// 分层计数存储
pub struct TieredCounterStore {
    tiers: Vec<Arc<dyn CounterStore>>,
    local: Arc<MemoryCounterStore>,
}

impl TieredCounterStore {
    pub fn new(tiers: Vec<Arc<dyn CounterStore>>, local: Arc<MemoryCounterStore>) -> Self {
        Self { tiers, local }
    }

    /// 只有进程内存储（测试、单机开发）
    pub fn local_only() -> Self {
        Self::new(Vec::new(), Arc::new(MemoryCounterStore::new()))
    }

    /// 已配置的存储层名称（按尝试顺序）
    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers
            .iter()
            .map(|t| t.name())
            .chain(std::iter::once(self.local.name()))
            .collect()
    }

    pub fn local(&self) -> &Arc<MemoryCounterStore> {
        &self.local
    }

    /// 按顺序尝试每一层，第一层成功即返回
    pub async fn check(
        &self,
        key: &WindowKey,
        policy: &Policy,
        mode: CheckMode,
        now: i64,
    ) -> TieredSnapshot {
        for tier in &self.tiers {
            let started = Instant::now();
            match tier.check(key, policy, mode, now).await {
                Ok(snapshot) => {
                    crate::infra::metrics::record_store_duration(
                        tier.name(),
                        started.elapsed().as_secs_f64(),
                    );
                    return TieredSnapshot {
                        snapshot,
                        tier: tier.name(),
                    };
                }
                Err(e) => {
                    warn!(
                        "⚠️ 计数存储 {} 不可用，降级到下一层: key={}, error={}",
                        tier.name(),
                        key.counter_key(),
                        e
                    );
                    crate::infra::metrics::record_tier_failure(tier.name());
                }
            }
        }

        TieredSnapshot {
            snapshot: self.local.check_local(key, policy, mode, now),
            tier: self.local.name(),
        }
    }

    /// 在所有层上删除 `(identity, endpoint)` 的状态
    ///
    /// 某一层失败不影响其他层，返回成功删除的总条目数
    pub async fn reset(&self, identity: &str, endpoint: &str) -> u64 {
        let results = join_all(self.tiers.iter().map(|tier| async move {
            (tier.name(), tier.reset(identity, endpoint).await)
        }))
        .await;

        let mut removed = self.local.reset_local(identity, endpoint);
        for (name, result) in results {
            match result {
                Ok(n) => removed += n,
                Err(e) => warn!(
                    "⚠️ 重置计数失败: tier={}, identity={}, endpoint={}, error={}",
                    name, identity, endpoint, e
                ),
            }
        }

        info!(
            "🧹 已重置限流状态: identity={}, endpoint={}, removed={}",
            identity, endpoint, removed
        );
        removed
    }

    /// 清理所有层的过期记录
    pub async fn sweep(&self, now: i64) -> u64 {
        let mut total = 0;
        for tier in &self.tiers {
            tier.record_pool_metrics();
            match tier.sweep(now).await {
                Ok(n) => {
                    if n > 0 {
                        crate::infra::metrics::record_swept(tier.name(), n);
                    }
                    total += n;
                }
                Err(e) => debug!("清理过期计数失败: tier={}, error={}", tier.name(), e),
            }
        }

        let local = self.local.sweep_local(now);
        if local > 0 {
            crate::infra::metrics::record_swept(self.local.name(), local);
        }
        crate::infra::metrics::record_local_entries(self.local.len());
        total + local
    }
}

/// 根据配置组装存储层
///
/// Redis 未配置时直接从关系库开始；关系库未配置时只剩进程内存储。
pub async fn build_counter_store(config: &ServerConfig) -> TieredCounterStore {
    let mut tiers: Vec<Arc<dyn CounterStore>> = Vec::new();

    if let Some(redis_config) = &config.redis {
        match RedisClient::new(redis_config).await {
            Ok(client) => tiers.push(Arc::new(RedisCounterStore::new(Arc::new(client)))),
            Err(e) => warn!("⚠️ Redis 配置无效，跳过 Redis 计数层: {}", e),
        }
    } else {
        info!("ℹ️ 未配置 Redis，限流从关系库层开始");
    }

    if let Some(db_config) = &config.database {
        match Database::new(db_config).await {
            Ok(db) => tiers.push(Arc::new(PostgresCounterStore::new(
                db,
                db_config.statement_timeout(),
            ))),
            Err(e) => warn!("⚠️ 数据库配置无效，跳过关系库计数层: {}", e),
        }
    }

    if tiers.is_empty() {
        warn!("⚠️ 只有进程内计数可用：多实例部署下各实例独立计数，限流不准确");
    }

    let store = TieredCounterStore::new(tiers, Arc::new(MemoryCounterStore::new()));
    info!("📦 计数存储层: {:?}", store.tier_names());
    store
}
