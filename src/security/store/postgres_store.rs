//! PostgreSQL 计数（第二层）
//!
//! Redis 未配置或出错时使用。计数行和状态行都存放在 `rate_limits` 表中：
//! - 计数行 `id = rl:{identity}:{endpoint}[:{sub}]:{bucket}`，`reset_time` 为窗口结束时间
//! - 状态行 `id = rl:{identity}:{endpoint}:state`，保存违规数和封禁，`reset_time` 为违规过期时间
//!
//! 自增优先调用存储过程 `increment_rate_limit`（单条 upsert，原子）。存储过程
//! 不可用时退回手动"先读后写"：并发下两个请求可能读到同一个值，导致少计数。
//! 这是这一层明确接受的弱保证。
//!
//! 过期行由 `sweep` 定期删除。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};

use super::{within_limit, CheckMode, CounterSnapshot, CounterStore, StoreError};
use crate::infra::Database;
use crate::security::policy::Policy;
use crate::security::violation::{is_block_active, ViolationTracker};
use crate::security::window::{scope_key, WindowKey};

/// 状态行
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
struct StateRow {
    violations: i64,
    reset_time: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

impl StateRow {
    fn live_violations(&self, now: i64) -> u64 {
        if self.reset_time.timestamp() > now {
            self.violations.max(0) as u64
        } else {
            0
        }
    }

    fn blocked_until(&self) -> Option<i64> {
        self.blocked_until.map(|t| t.timestamp())
    }
}

pub struct PostgresCounterStore {
    db: Database,
    statement_timeout: Duration,
}

impl PostgresCounterStore {
    pub fn new(db: Database, statement_timeout: Duration) -> Self {
        Self {
            db,
            statement_timeout,
        }
    }

    fn pool(&self) -> &PgPool {
        self.db.pool()
    }

    /// 每条语句独立超时，超时即视为这一层不可用
    async fn with_timeout<F, T>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::time::timeout(self.statement_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.statement_timeout.as_millis() as u64))?
            .map_err(StoreError::from)
    }

    async fn read_count(&self, key: &WindowKey, now: i64) -> Result<u64, StoreError> {
        let row: Option<(i64, DateTime<Utc>)> = self
            .with_timeout(
                sqlx::query_as("SELECT count, reset_time FROM rate_limits WHERE id = $1")
                    .bind(key.counter_key())
                    .fetch_optional(self.pool()),
            )
            .await?;

        Ok(row
            .filter(|(_, reset_time)| reset_time.timestamp() > now)
            .map_or(0, |(count, _)| count.max(0) as u64))
    }

    async fn read_state(&self, key: &WindowKey) -> Result<Option<StateRow>, StoreError> {
        self.with_timeout(
            sqlx::query_as::<_, StateRow>(
                "SELECT violations, reset_time, blocked_until FROM rate_limits WHERE id = $1",
            )
            .bind(key.state_key())
            .fetch_optional(self.pool()),
        )
        .await
    }

    /// 原子自增（存储过程），失败时退回手动读改写
    async fn increment_count(&self, key: &WindowKey, now: i64) -> Result<u64, StoreError> {
        let reset_time = to_datetime(key.reset_at());

        let atomic: Result<i64, StoreError> = self
            .with_timeout(
                sqlx::query_scalar("SELECT increment_rate_limit($1, $2, $3, $4, $5)")
                    .bind(key.counter_key())
                    .bind(&key.identity)
                    .bind(&key.endpoint)
                    .bind(key.sub_resource.as_deref())
                    .bind(reset_time)
                    .fetch_one(self.pool()),
            )
            .await;

        match atomic {
            Ok(count) => Ok(count.max(0) as u64),
            Err(e) => {
                debug!("increment_rate_limit 不可用，使用手动 upsert: {}", e);
                self.increment_count_manual(key, now, reset_time).await
            }
        }
    }

    /// 手动读改写：并发下可能少计数
    async fn increment_count_manual(
        &self,
        key: &WindowKey,
        now: i64,
        reset_time: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let next = self.read_count(key, now).await? + 1;

        self.with_timeout(
            sqlx::query(
                r#"
                INSERT INTO rate_limits (id, user_id, endpoint, "character", count, violations, reset_time)
                VALUES ($1, $2, $3, $4, $5, 0, $6)
                ON CONFLICT (id) DO UPDATE
                SET count = EXCLUDED.count,
                    reset_time = EXCLUDED.reset_time,
                    updated_at = NOW()
                "#,
            )
            .bind(key.counter_key())
            .bind(&key.identity)
            .bind(&key.endpoint)
            .bind(key.sub_resource.as_deref())
            .bind(next as i64)
            .bind(reset_time)
            .execute(self.pool()),
        )
        .await?;

        Ok(next)
    }

    /// 违规数 +1（存储过程），失败时退回手动读改写；返回 (违规数, 当前封禁)
    async fn increment_violations(
        &self,
        key: &WindowKey,
        policy: &Policy,
        now: i64,
    ) -> Result<(u64, Option<i64>), StoreError> {
        let expires_at = to_datetime(ViolationTracker::violations_expire_at(policy, now));

        let atomic: Result<(i64, Option<DateTime<Utc>>), StoreError> = self
            .with_timeout(
                sqlx::query_as(
                    "SELECT out_violations, out_blocked_until FROM record_rate_limit_violation($1, $2, $3, $4, $5)",
                )
                .bind(key.state_key())
                .bind(&key.identity)
                .bind(&key.endpoint)
                .bind(to_datetime(now))
                .bind(expires_at)
                .fetch_one(self.pool()),
            )
            .await;

        match atomic {
            Ok((violations, blocked_until)) => Ok((
                violations.max(0) as u64,
                blocked_until.map(|t| t.timestamp()),
            )),
            Err(e) => {
                debug!("record_rate_limit_violation 不可用，使用手动 upsert: {}", e);
                let prior = self.read_state(key).await?;
                let violations = prior.map_or(0, |s| s.live_violations(now)) + 1;
                let blocked_until = prior
                    .and_then(|s| s.blocked_until())
                    .filter(|until| is_block_active(Some(*until), now));

                self.with_timeout(
                    sqlx::query(
                        r#"
                        INSERT INTO rate_limits (id, user_id, endpoint, count, violations, reset_time)
                        VALUES ($1, $2, $3, 0, $4, $5)
                        ON CONFLICT (id) DO UPDATE
                        SET violations = EXCLUDED.violations,
                            reset_time = EXCLUDED.reset_time,
                            updated_at = NOW()
                        "#,
                    )
                    .bind(key.state_key())
                    .bind(&key.identity)
                    .bind(&key.endpoint)
                    .bind(violations as i64)
                    .bind(expires_at)
                    .execute(self.pool()),
                )
                .await?;

                Ok((violations, blocked_until))
            }
        }
    }

    /// 设置封禁（只在没有有效封禁时写入，不延长已有封禁）
    async fn set_block(&self, key: &WindowKey, until: i64, now: i64) -> Result<(), StoreError> {
        self.with_timeout(
            sqlx::query(
                r#"
                UPDATE rate_limits
                SET blocked_until = $2, updated_at = NOW()
                WHERE id = $1 AND (blocked_until IS NULL OR blocked_until <= $3)
                "#,
            )
            .bind(key.state_key())
            .bind(to_datetime(until))
            .bind(to_datetime(now))
            .execute(self.pool()),
        )
        .await?;
        Ok(())
    }

    async fn peek(&self, key: &WindowKey, now: i64) -> Result<CounterSnapshot, StoreError> {
        let count = self.read_count(key, now).await?;
        let state = self.read_state(key).await?;

        Ok(CounterSnapshot {
            count,
            violations: state.map_or(0, |s| s.live_violations(now)),
            blocked_until: state.and_then(|s| s.blocked_until()),
        })
    }

    async fn increment(
        &self,
        key: &WindowKey,
        policy: &Policy,
        now: i64,
    ) -> Result<CounterSnapshot, StoreError> {
        let count = self.increment_count(key, now).await?;
        let state = self.read_state(key).await?;

        let violations = state.map_or(0, |s| s.live_violations(now));
        let blocked_until = state
            .and_then(|s| s.blocked_until())
            .filter(|until| is_block_active(Some(*until), now));

        if blocked_until.is_none() && within_limit(count, policy) {
            return Ok(CounterSnapshot {
                count,
                violations,
                blocked_until: None,
            });
        }

        let (violations, current_block) = self.increment_violations(key, policy, now).await?;
        let active_block = blocked_until.or(current_block);
        let outcome = ViolationTracker::evaluate(
            violations.saturating_sub(1),
            false,
            policy,
            now,
            active_block,
        );

        if let (true, Some(until)) = (outcome.newly_blocked, outcome.blocked_until) {
            self.set_block(key, until, now).await?;
            warn!(
                "🚫 临时封禁: scope={}, violations={}, until={}",
                key.scope_key(),
                violations,
                until
            );
            crate::infra::metrics::record_block(&key.endpoint);
        }

        Ok(CounterSnapshot {
            count,
            violations,
            blocked_until: outcome.blocked_until,
        })
    }
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn check(
        &self,
        key: &WindowKey,
        policy: &Policy,
        mode: CheckMode,
        now: i64,
    ) -> Result<CounterSnapshot, StoreError> {
        match mode {
            CheckMode::Peek => self.peek(key, now).await,
            CheckMode::Increment => self.increment(key, policy, now).await,
        }
    }

    async fn reset(&self, identity: &str, endpoint: &str) -> Result<u64, StoreError> {
        let prefix = format!("{}:", scope_key(identity, endpoint));
        let result = self
            .with_timeout(
                sqlx::query("DELETE FROM rate_limits WHERE starts_with(id, $1)")
                    .bind(prefix)
                    .execute(self.pool()),
            )
            .await?;
        Ok(result.rows_affected())
    }

    async fn sweep(&self, now: i64) -> Result<u64, StoreError> {
        let deleted: i64 = self
            .with_timeout(
                sqlx::query_scalar("SELECT cleanup_expired_rate_limits($1)")
                    .bind(to_datetime(now))
                    .fetch_one(self.pool()),
            )
            .await?;
        Ok(deleted.max(0) as u64)
    }

    fn record_pool_metrics(&self) {
        let size = self.pool().size();
        let idle = self.pool().num_idle() as u32;
        crate::infra::metrics::record_db_pool(size.saturating_sub(idle), idle);
    }
}

fn to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_row_expiry() {
        let row = StateRow {
            violations: 4,
            reset_time: to_datetime(1_000),
            blocked_until: Some(to_datetime(900)),
        };
        assert_eq!(row.live_violations(999), 4);
        assert_eq!(row.live_violations(1_000), 0);
        assert_eq!(row.blocked_until(), Some(900));
    }
}
