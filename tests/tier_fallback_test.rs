//! 分层存储降级测试

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use privchat_admission::security::store::{MemoryCounterStore, StoreError};
use privchat_admission::security::{
    AdmissionController, CheckMode, CheckOptions, CounterSnapshot, CounterStore, EndpointCategory,
    FallbackConfigProvider, Identifier, ManualClock, Policy, RequestMeta, StaticConfigProvider,
    TieredCounterStore, WindowKey,
};

/// 永远不可用的存储层（模拟 Redis 宕机）
#[derive(Default)]
struct DownStore {
    attempts: AtomicU64,
}

#[async_trait]
impl CounterStore for DownStore {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn check(
        &self,
        _key: &WindowKey,
        _policy: &Policy,
        _mode: CheckMode,
        _now: i64,
    ) -> Result<CounterSnapshot, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn reset(&self, _identity: &str, _endpoint: &str) -> Result<u64, StoreError> {
        Err(StoreError::Timeout(200))
    }
}

/// 可用的第二层（内部用进程内存储模拟）
#[derive(Default)]
struct SecondaryStore {
    inner: MemoryCounterStore,
}

#[async_trait]
impl CounterStore for SecondaryStore {
    fn name(&self) -> &'static str {
        "secondary"
    }

    async fn check(
        &self,
        key: &WindowKey,
        policy: &Policy,
        mode: CheckMode,
        now: i64,
    ) -> Result<CounterSnapshot, StoreError> {
        Ok(self.inner.check_local(key, policy, mode, now))
    }

    async fn reset(&self, identity: &str, endpoint: &str) -> Result<u64, StoreError> {
        Ok(self.inner.reset_local(identity, endpoint))
    }
}

fn controller(store: TieredCounterStore, clock: Arc<ManualClock>) -> AdmissionController {
    AdmissionController::new(
        FallbackConfigProvider::static_only(StaticConfigProvider::default()),
        Identifier::default(),
        store,
        clock,
    )
}

fn request() -> RequestMeta {
    RequestMeta::new(Method::POST, HeaderMap::new(), "203.0.113.77".parse().ok())
}

#[tokio::test]
async fn test_failing_tier_routes_to_next() {
    let down = Arc::new(DownStore::default());
    let secondary = Arc::new(SecondaryStore::default());
    let store = TieredCounterStore::new(
        vec![down.clone(), secondary.clone()],
        Arc::new(MemoryCounterStore::new()),
    );
    assert_eq!(store.tier_names(), vec!["down", "secondary", "memory"]);

    let clock = Arc::new(ManualClock::new(0));
    let controller = controller(store, clock);
    let options = CheckOptions::new(EndpointCategory::Chat);

    let decision = controller.check(&request(), &options).await;
    assert!(decision.allowed);
    assert_eq!(decision.store, "secondary");
    assert_eq!(down.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(secondary.inner.len(), 2);
    assert!(controller.store().local().is_empty());
}

#[tokio::test]
async fn test_degraded_sequence_matches_local_only() {
    let degraded = controller(
        TieredCounterStore::new(
            vec![Arc::new(DownStore::default()), Arc::new(SecondaryStore::default())],
            Arc::new(MemoryCounterStore::new()),
        ),
        Arc::new(ManualClock::new(0)),
    );
    let local = controller(TieredCounterStore::local_only(), Arc::new(ManualClock::new(0)));
    let options = CheckOptions::new(EndpointCategory::Media);

    for _ in 0..8 {
        let a = degraded.check(&request(), &options).await;
        let b = local.check(&request(), &options).await;
        assert_eq!(a.allowed, b.allowed);
        assert_eq!(a.count, b.count);
        assert_eq!(a.violations, b.violations);
        assert_eq!(a.is_blocked, b.is_blocked);
        assert_eq!(a.reset_time, b.reset_time);
    }
}

#[tokio::test]
async fn test_all_remote_tiers_down_uses_memory() {
    let store = TieredCounterStore::new(
        vec![Arc::new(DownStore::default()), Arc::new(DownStore::default())],
        Arc::new(MemoryCounterStore::new()),
    );
    let controller = controller(store, Arc::new(ManualClock::new(0)));
    let options = CheckOptions::new(EndpointCategory::General);

    let first = controller.check(&request(), &options).await;
    let second = controller.check(&request(), &options).await;
    assert!(first.allowed);
    assert_eq!(first.store, "memory");
    assert_eq!(second.count, 2);
}

#[tokio::test]
async fn test_reset_survives_failing_tier() {
    let secondary = Arc::new(SecondaryStore::default());
    let store = TieredCounterStore::new(
        vec![Arc::new(DownStore::default()), secondary.clone()],
        Arc::new(MemoryCounterStore::new()),
    );
    let controller = controller(store, Arc::new(ManualClock::new(0)));
    let options = CheckOptions::new(EndpointCategory::Chat);

    controller.check(&request(), &options).await;
    let identity = controller.identify(&request(), None);
    assert_eq!(controller.reset(&identity, "chat:anonymous").await, 2);
    assert!(secondary.inner.is_empty());

    let fresh = controller.check(&request(), &options).await;
    assert_eq!(fresh.count, 1);
}
