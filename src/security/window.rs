/// 固定窗口计数键
///
/// `rl:{identity}:{endpoint}[:{sub_resource}]:{floor(now / window)}`
///
/// 同一时间桶内的请求共享一个 key，下一个时间桶从 0 开始。窗口边界附近最多可以
/// 突发 2×limit 个请求，这是固定窗口的已知代价。
use std::sync::atomic::{AtomicI64, Ordering};

/// 所有计数键的前缀
pub const KEY_PREFIX: &str = "rl";

/// 时钟（Unix 秒）
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// 手动推进的时钟（测试用）
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// `(identity, endpoint)` 的公共前缀，违规计数、封禁状态和管理重置都以它为单位
pub fn scope_key(identity: &str, endpoint: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, identity, endpoint)
}

/// 一次检查对应的计数键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKey {
    pub identity: String,
    pub endpoint: String,
    pub sub_resource: Option<String>,
    /// 窗口长度（秒）
    pub window: u64,
    /// 时间桶编号
    pub bucket: i64,
}

impl WindowKey {
    pub fn new(
        identity: impl Into<String>,
        endpoint: impl Into<String>,
        sub_resource: Option<String>,
        window: u64,
        now: i64,
    ) -> Self {
        let window = window.clamp(1, i64::MAX as u64);
        Self {
            identity: identity.into(),
            endpoint: endpoint.into(),
            sub_resource: sub_resource.filter(|s| !s.is_empty()),
            window,
            bucket: now.div_euclid(window as i64),
        }
    }

    /// 计数键
    pub fn counter_key(&self) -> String {
        match &self.sub_resource {
            Some(sub) => format!("{}:{}:{}", self.scope_key(), sub, self.bucket),
            None => format!("{}:{}", self.scope_key(), self.bucket),
        }
    }

    pub fn scope_key(&self) -> String {
        scope_key(&self.identity, &self.endpoint)
    }

    /// 违规计数键（不随时间桶变化）
    pub fn violations_key(&self) -> String {
        format!("{}:violations", self.scope_key())
    }

    /// 封禁键
    pub fn block_key(&self) -> String {
        format!("{}:blocked", self.scope_key())
    }

    /// 违规/封禁状态合并存储时使用的键（关系库、本地表）
    pub fn state_key(&self) -> String {
        format!("{}:state", self.scope_key())
    }

    /// 当前时间桶结束的 Unix 秒
    pub fn reset_at(&self) -> i64 {
        self.bucket
            .saturating_add(1)
            .saturating_mul(self.window as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_layout() {
        let key = WindowKey::new("user:1", "chat:paid", Some("luna".into()), 60, 125);
        assert_eq!(key.bucket, 2);
        assert_eq!(key.counter_key(), "rl:user:1:chat:paid:luna:2");
        assert_eq!(key.scope_key(), "rl:user:1:chat:paid");
        assert_eq!(key.reset_at(), 180);
    }

    #[test]
    fn test_same_bucket_shares_key() {
        let a = WindowKey::new("anon:abc", "chat:anonymous", None, 86_400, 86_400 * 3 + 10);
        let b = WindowKey::new("anon:abc", "chat:anonymous", None, 86_400, 86_400 * 4 - 1);
        let c = WindowKey::new("anon:abc", "chat:anonymous", None, 86_400, 86_400 * 4);
        assert_eq!(a.counter_key(), b.counter_key());
        assert_ne!(b.counter_key(), c.counter_key());
    }

    #[test]
    fn test_empty_sub_resource_is_dropped() {
        let key = WindowKey::new("user:1", "general:authenticated", Some(String::new()), 60, 0);
        assert_eq!(key.counter_key(), "rl:user:1:general:authenticated:0");
    }

    #[test]
    fn test_oversized_window_does_not_overflow() {
        let key = WindowKey::new("user:1", "chat:paid", None, u64::MAX, 1_000);
        assert_eq!(key.bucket, 0);
        assert_eq!(key.reset_at(), i64::MAX);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
