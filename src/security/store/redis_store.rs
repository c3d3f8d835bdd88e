/// Redis 计数（第一层）
///
/// 自增、设置 TTL、读取违规数、读取封禁状态在同一个 MULTI/EXEC 批次里完成，
/// 对同一个 key 的其他 Redis 操作是原子的。
///
/// 拒绝时再执行一个批次累加违规数；超过阈值后用 `SET NX EX` 写入封禁。
/// 两个批次之间存在竞争窗口，并发下可能多记一次违规才生效封禁，可以接受。
use std::sync::Arc;

use async_trait::async_trait;

use super::{within_limit, CheckMode, CounterSnapshot, CounterStore, StoreError};
use crate::infra::RedisClient;
use crate::security::policy::Policy;
use crate::security::violation::{is_block_active, ViolationTracker};
use crate::security::window::{scope_key, WindowKey};

pub struct RedisCounterStore {
    client: Arc<RedisClient>,
}

impl RedisCounterStore {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<RedisClient> {
        &self.client
    }

    async fn peek(&self, key: &WindowKey) -> Result<CounterSnapshot, StoreError> {
        let mut pipe = redis::pipe();
        pipe.cmd("GET")
            .arg(key.counter_key())
            .cmd("GET")
            .arg(key.violations_key())
            .cmd("GET")
            .arg(key.block_key());

        let (count, violations, blocked_until): (Option<u64>, Option<u64>, Option<i64>) =
            self.client.query_pipeline(&pipe).await?;

        Ok(CounterSnapshot {
            count: count.unwrap_or(0),
            violations: violations.unwrap_or(0),
            blocked_until,
        })
    }

    async fn increment(
        &self,
        key: &WindowKey,
        policy: &Policy,
        now: i64,
    ) -> Result<CounterSnapshot, StoreError> {
        let pipe = increment_pipeline(key);
        let (count, violations, blocked_until): (u64, Option<u64>, Option<i64>) =
            self.client.query_pipeline(&pipe).await?;

        let violations = violations.unwrap_or(0);
        let blocked_until = blocked_until.filter(|until| is_block_active(Some(*until), now));
        if blocked_until.is_none() && within_limit(count, policy) {
            return Ok(CounterSnapshot {
                count,
                violations,
                blocked_until: None,
            });
        }

        let (violations, blocked_until) =
            self.record_violation(key, policy, now, blocked_until).await?;

        Ok(CounterSnapshot {
            count,
            violations,
            blocked_until,
        })
    }

    async fn record_violation(
        &self,
        key: &WindowKey,
        policy: &Policy,
        now: i64,
        active_block: Option<i64>,
    ) -> Result<(u64, Option<i64>), StoreError> {
        let violations_key = key.violations_key();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(&violations_key)
            .cmd("EXPIRE")
            .arg(&violations_key)
            .arg(policy.block_duration)
            .ignore();
        let (violations,): (u64,) = self.client.query_pipeline(&pipe).await?;

        let outcome = ViolationTracker::evaluate(
            violations.saturating_sub(1),
            false,
            policy,
            now,
            active_block,
        );

        if let (true, Some(until)) = (outcome.newly_blocked, outcome.blocked_until) {
            // NX：并发请求中只有第一个写入生效，不会延长已有封禁
            let _: Option<String> = self
                .client
                .query_cmd(
                    redis::cmd("SET")
                        .arg(key.block_key())
                        .arg(until)
                        .arg("NX")
                        .arg("EX")
                        .arg(policy.block_duration),
                )
                .await?;
            tracing::warn!(
                "🚫 临时封禁: scope={}, violations={}, until={}",
                key.scope_key(),
                violations,
                until
            );
            crate::infra::metrics::record_block(&key.endpoint);
        }

        Ok((violations, outcome.blocked_until))
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn check(
        &self,
        key: &WindowKey,
        policy: &Policy,
        mode: CheckMode,
        now: i64,
    ) -> Result<CounterSnapshot, StoreError> {
        match mode {
            CheckMode::Peek => self.peek(key).await,
            CheckMode::Increment => self.increment(key, policy, now).await,
        }
    }

    async fn reset(&self, identity: &str, endpoint: &str) -> Result<u64, StoreError> {
        let pattern = format!("{}:*", escape_glob(&scope_key(identity, endpoint)));
        let keys = self.client.scan_match(&pattern).await?;
        Ok(self.client.del_keys(&keys).await?)
    }

    fn record_pool_metrics(&self) {
        let state = self.client.pool_state();
        crate::infra::metrics::record_redis_pool(
            state.connections.saturating_sub(state.idle_connections),
            state.idle_connections,
        );
    }
}

/// 转义 Redis glob 元字符，避免身份里的 `*`、`?`、`[` 扩大匹配范围
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// 计数批次：`INCR` 后用 `EXPIREAT` 把过期时间固定在窗口结束时刻
///
/// 每次自增都会重写过期时间，但写入的是同一个绝对时间点，不会延长窗口。
fn increment_pipeline(key: &WindowKey) -> redis::Pipeline {
    let counter_key = key.counter_key();
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("INCR")
        .arg(&counter_key)
        .cmd("EXPIREAT")
        .arg(&counter_key)
        .arg(key.reset_at())
        .ignore()
        .cmd("GET")
        .arg(key.violations_key())
        .cmd("GET")
        .arg(key.block_key());
    pipe
}
