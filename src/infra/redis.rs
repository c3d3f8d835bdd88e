// RedisClient - Redis客户端实现
// 基于 bb8-redis 连接池

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::FromRedisValue;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::ServerError;

/// SCAN 单批数量
const SCAN_BATCH: usize = 200;

/// Redis 客户端（基于连接池）
pub struct RedisClient {
    pool: Arc<Pool<RedisConnectionManager>>,
    /// 单条 Redis 命令的执行超时
    command_timeout: Duration,
}

impl RedisClient {
    /// 创建新的 Redis 客户端（从 RedisConfig 配置）
    ///
    /// 连接池惰性建立：Redis 暂时不可达时客户端仍然创建成功，
    /// 之后每次命令失败都会让限流降级到下一层存储。
    pub async fn new(config: &RedisConfig) -> Result<Self, ServerError> {
        let manager = RedisConnectionManager::new(config.url.clone()).map_err(|e| {
            ServerError::Configuration(format!("Failed to create Redis manager: {}", e))
        })?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build_unchecked(manager);

        let client = Self {
            pool: Arc::new(pool),
            command_timeout: config.command_timeout(),
        };

        match client.ping().await {
            Ok(()) => tracing::info!(
                "✅ Redis 连接池已创建 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms, idle_timeout={}s)",
                config.pool_size,
                config.min_idle,
                config.connection_timeout_secs,
                config.command_timeout_ms,
                config.idle_timeout_secs,
            ),
            Err(e) => tracing::warn!("⚠️ Redis 当前不可用，限流将降级到下一层存储: {}", e),
        }

        Ok(client)
    }

    /// 获取连接池状态（活跃连接数、空闲连接数）
    pub fn pool_state(&self) -> bb8::State {
        self.pool.state()
    }

    /// 从连接池获取连接
    async fn get_conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>, ServerError> {
        self.pool.get().await.map_err(|e| {
            ServerError::Cache(format!("Failed to get Redis connection: {}", e))
        })
    }

    /// 执行带超时的 Redis 操作
    async fn with_timeout<F, T>(&self, op: F) -> Result<T, ServerError>
    where
        F: std::future::Future<Output = Result<T, ServerError>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| {
                ServerError::Timeout(format!(
                    "Redis command timeout ({}ms)",
                    self.command_timeout.as_millis()
                ))
            })?
    }

    /// PING
    pub async fn ping(&self) -> Result<(), ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(|e| ServerError::Cache(format!("Redis ping failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// 执行单条命令
    pub async fn query_cmd<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            cmd.query_async(&mut *conn)
                .await
                .map_err(|e| ServerError::Cache(format!("Redis command failed: {}", e)))
        })
        .await
    }

    /// 执行 pipeline（`atomic()` 时包裹在 MULTI/EXEC 中）
    pub async fn query_pipeline<T: FromRedisValue>(
        &self,
        pipe: &redis::Pipeline,
    ) -> Result<T, ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            pipe.query_async(&mut *conn)
                .await
                .map_err(|e| ServerError::Cache(format!("Redis pipeline failed: {}", e)))
        })
        .await
    }

    /// SCAN MATCH pattern - 遍历匹配的 key（不阻塞 Redis，替代 KEYS）
    pub async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| ServerError::Cache(format!("Redis SCAN failed: {}", e)))?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(keys)
        })
        .await
    }

    /// DEL key [key ...]，返回删除数量
    pub async fn del_keys(&self, keys: &[String]) -> Result<u64, ServerError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query_cmd(redis::cmd("DEL").arg(keys)).await
    }
}
