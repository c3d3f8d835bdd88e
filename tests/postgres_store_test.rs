//! 关系库计数层集成测试
//!
//! 需要可写的 PostgreSQL：
//! `DATABASE_URL=postgres://... cargo test --test postgres_store_test -- --ignored`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use privchat_admission::config::DatabaseConfig;
use privchat_admission::infra::Database;
use privchat_admission::security::store::{MemoryCounterStore, PostgresCounterStore};
use privchat_admission::security::{
    AdmissionController, CheckOptions, EndpointCategory, FallbackConfigProvider, Identifier,
    ManualClock, Policy, RejectionCode, RequestMeta, StaticConfigProvider, TieredCounterStore,
};

async fn postgres_controller(clock: Arc<ManualClock>) -> Option<AdmissionController> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let db = Database::new(&DatabaseConfig::with_url(url)).await.ok()?;
    sqlx::raw_sql(include_str!("../migrations/001_rate_limits.sql"))
        .execute(db.pool())
        .await
        .ok()?;

    let store = TieredCounterStore::new(
        vec![Arc::new(PostgresCounterStore::new(db, Duration::from_secs(5)))],
        Arc::new(MemoryCounterStore::new()),
    );
    let overrides = HashMap::from([("chat:free".to_string(), Policy::new(2, 60, 1, 300))]);
    Some(AdmissionController::new(
        FallbackConfigProvider::static_only(StaticConfigProvider::new(overrides)),
        Identifier::default(),
        store,
        clock,
    ))
}

fn unique_caller() -> String {
    format!("pg-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
#[ignore]
async fn test_postgres_limit_and_block_sequence() {
    let start = chrono::Utc::now().timestamp() / 60 * 60;
    let clock = Arc::new(ManualClock::new(start));
    let Some(controller) = postgres_controller(clock).await else {
        eprintln!("DATABASE_URL 未设置或不可用，跳过");
        return;
    };

    let caller = unique_caller();
    let request = RequestMeta::new(Method::POST, HeaderMap::new(), "198.51.100.60".parse().ok());
    let options = CheckOptions::new(EndpointCategory::Chat).caller(caller.clone());

    for expected in 1..=2 {
        let decision = controller.check(&request, &options).await;
        assert_eq!(decision.store, "postgres");
        assert!(decision.allowed);
        assert_eq!(decision.count, expected);
    }

    let over = controller.check(&request, &options).await;
    assert_eq!(over.store, "postgres");
    assert!(!over.allowed);
    assert!(!over.is_blocked);
    assert_eq!(over.count, 3);
    assert_eq!(over.violations, 1);

    let blocked = controller.check(&request, &options).await;
    assert!(blocked.is_blocked);
    assert_eq!(blocked.block_reason, Some(RejectionCode::TemporarilyBlocked));
    assert_eq!(blocked.violations, 2);
    assert_eq!(blocked.reset_time, start + 300);

    let peek = controller.peek(&request, &options).await;
    assert!(peek.is_blocked);
    assert_eq!(peek.count, 4);

    let identity = format!("user:{}", caller);
    assert!(controller.reset(&identity, "chat:free").await > 0);
    let fresh = controller.check(&request, &options).await;
    assert!(fresh.allowed);
    assert_eq!(fresh.count, 1);

    controller.reset(&identity, "chat:free").await;
}
