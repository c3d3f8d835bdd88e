/// 进程内计数（第三层）
///
/// 只在单个进程内正确。多实例部署时每个实例各自计数，实际放行量可达
/// `实例数 × limit`，只能作为 Redis 和关系库都不可用时的最后兜底。
///
/// 过期条目在下次访问时被覆盖，`sweep_local` 负责定期回收。
use async_trait::async_trait;
use dashmap::DashMap;

use super::{within_limit, CheckMode, CounterSnapshot, CounterStore, StoreError};
use crate::security::policy::Policy;
use crate::security::violation::ViolationTracker;
use crate::security::window::{scope_key, WindowKey};

#[derive(Debug, Clone, Copy)]
struct LocalCounter {
    count: u64,
    expires_at: i64,
}

#[derive(Debug, Clone, Copy)]
struct LocalState {
    violations: u64,
    violations_expire_at: i64,
    blocked_until: Option<i64>,
}

impl LocalState {
    fn live_violations(&self, now: i64) -> u64 {
        if self.violations_expire_at > now {
            self.violations
        } else {
            0
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.violations_expire_at <= now && self.blocked_until.map_or(true, |until| until <= now)
    }
}

#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, LocalCounter>,
    states: DashMap<String, LocalState>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 条目总数
    pub fn len(&self) -> usize {
        self.counters.len() + self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 永不失败的检查（分层存储的最后一层直接调用）
    pub fn check_local(
        &self,
        key: &WindowKey,
        policy: &Policy,
        mode: CheckMode,
        now: i64,
    ) -> CounterSnapshot {
        match mode {
            CheckMode::Peek => self.peek(key, now),
            CheckMode::Increment => self.increment(key, policy, now),
        }
    }

    fn peek(&self, key: &WindowKey, now: i64) -> CounterSnapshot {
        let count = self
            .counters
            .get(&key.counter_key())
            .filter(|c| c.expires_at > now)
            .map_or(0, |c| c.count);

        let (violations, blocked_until) = self
            .states
            .get(&key.state_key())
            .map_or((0, None), |s| (s.live_violations(now), s.blocked_until));

        CounterSnapshot {
            count,
            violations,
            blocked_until,
        }
    }

    fn increment(&self, key: &WindowKey, policy: &Policy, now: i64) -> CounterSnapshot {
        let count = {
            let mut entry = self
                .counters
                .entry(key.counter_key())
                .or_insert(LocalCounter {
                    count: 0,
                    expires_at: key.reset_at(),
                });
            if entry.expires_at <= now {
                *entry = LocalCounter {
                    count: 0,
                    expires_at: key.reset_at(),
                };
            }
            entry.count += 1;
            entry.count
        };

        let mut state = self.states.entry(key.state_key()).or_insert(LocalState {
            violations: 0,
            violations_expire_at: now,
            blocked_until: None,
        });

        let prior = state.live_violations(now);
        let blocked = state.blocked_until.filter(|until| *until > now);
        let allowed = blocked.is_none() && within_limit(count, policy);
        let outcome = ViolationTracker::evaluate(prior, allowed, policy, now, blocked);

        if !allowed {
            state.violations = outcome.violations;
            state.violations_expire_at = ViolationTracker::violations_expire_at(policy, now);
        }
        state.blocked_until = outcome.blocked_until;

        CounterSnapshot {
            count,
            violations: outcome.violations,
            blocked_until: outcome.blocked_until,
        }
    }

    /// 删除 `(identity, endpoint)` 的全部条目
    ///
    /// 删除数在 `retain` 内逐条统计，并发插入的无关条目不影响结果
    pub fn reset_local(&self, identity: &str, endpoint: &str) -> u64 {
        let prefix = format!("{}:", scope_key(identity, endpoint));
        let mut removed = 0u64;
        self.counters.retain(|k, _| {
            let keep = !k.starts_with(&prefix);
            removed += u64::from(!keep);
            keep
        });
        self.states.retain(|k, _| {
            let keep = !k.starts_with(&prefix);
            removed += u64::from(!keep);
            keep
        });
        removed
    }

    /// 回收过期条目
    pub fn sweep_local(&self, now: i64) -> u64 {
        let mut removed = 0u64;
        self.counters.retain(|_, c| {
            let keep = c.expires_at > now;
            removed += u64::from(!keep);
            keep
        });
        self.states.retain(|_, s| {
            let keep = !s.is_expired(now);
            removed += u64::from(!keep);
            keep
        });
        removed
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(
        &self,
        key: &WindowKey,
        policy: &Policy,
        mode: CheckMode,
        now: i64,
    ) -> Result<CounterSnapshot, StoreError> {
        Ok(self.check_local(key, policy, mode, now))
    }

    async fn reset(&self, identity: &str, endpoint: &str) -> Result<u64, StoreError> {
        Ok(self.reset_local(identity, endpoint))
    }

    async fn sweep(&self, now: i64) -> Result<u64, StoreError> {
        Ok(self.sweep_local(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: Policy = Policy::new(2, 60, 1, 300);

    fn key(now: i64) -> WindowKey {
        WindowKey::new("anon:abc", "chat:anonymous", None, POLICY.window, now)
    }

    #[test]
    fn test_increment_and_deny() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.check_local(&key(0), &POLICY, CheckMode::Increment, 0).count, 1);
        assert_eq!(store.check_local(&key(1), &POLICY, CheckMode::Increment, 1).count, 2);

        let third = store.check_local(&key(2), &POLICY, CheckMode::Increment, 2);
        assert_eq!(third.count, 3);
        assert_eq!(third.violations, 1);
        assert!(!third.is_blocked(2));

        // 第二次违规超过 max_violations=1，进入封禁
        let fourth = store.check_local(&key(3), &POLICY, CheckMode::Increment, 3);
        assert_eq!(fourth.violations, 2);
        assert_eq!(fourth.blocked_until, Some(303));
    }

    #[test]
    fn test_peek_does_not_mutate() {
        let store = MemoryCounterStore::new();
        store.check_local(&key(0), &POLICY, CheckMode::Increment, 0);
        for _ in 0..5 {
            let peek = store.check_local(&key(0), &POLICY, CheckMode::Peek, 0);
            assert_eq!(peek.count, 1);
        }
        assert_eq!(store.check_local(&key(0), &POLICY, CheckMode::Increment, 0).count, 2);
    }

    #[test]
    fn test_stale_entry_is_overwritten() {
        let store = MemoryCounterStore::new();
        let k = key(0);
        store.check_local(&k, &POLICY, CheckMode::Increment, 0);
        // 同一个 key，时间已经超过窗口（时钟回拨之类的情况）
        assert_eq!(store.check_local(&k, &POLICY, CheckMode::Increment, 61).count, 1);
    }

    #[test]
    fn test_sweep_and_reset() {
        let store = MemoryCounterStore::new();
        store.check_local(&key(0), &POLICY, CheckMode::Increment, 0);
        assert_eq!(store.len(), 2);

        assert_eq!(store.sweep_local(10), 1); // 状态条目（无违规）已过期
        assert_eq!(store.reset_local("anon:abc", "chat:anonymous"), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_reset_during_concurrent_inserts() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let store = Arc::new(MemoryCounterStore::new());
        let stop = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    let mut i = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let identity = format!("anon:writer{}-{}", t, i);
                        let k = WindowKey::new(&identity, "chat:anonymous", None, POLICY.window, 0);
                        store.check_local(&k, &POLICY, CheckMode::Increment, 0);
                        i += 1;
                    }
                })
            })
            .collect();

        for _ in 0..2_000 {
            assert_eq!(store.reset_local("user:none", "chat:free"), 0);
        }

        stop.store(true, Ordering::Relaxed);
        for writer in writers {
            writer.join().unwrap();
        }

        let k = WindowKey::new("user:7", "chat:free", None, POLICY.window, 0);
        store.check_local(&k, &POLICY, CheckMode::Increment, 0);
        assert_eq!(store.reset_local("user:7", "chat:free"), 2);
    }
}
