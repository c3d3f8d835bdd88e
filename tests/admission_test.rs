//! 准入控制器行为测试（进程内存储 + 手动时钟）

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, Method};
use privchat_admission::security::{
    AdmissionController, CheckOptions, EndpointCategory, FallbackConfigProvider, Identifier,
    ManualClock, Policy, RejectionCode, RequestMeta, StaticConfigProvider, Tier,
    TieredCounterStore,
};

const DAY: i64 = 86_400;

fn controller_with(clock: Arc<ManualClock>, overrides: HashMap<String, Policy>) -> AdmissionController {
    AdmissionController::new(
        FallbackConfigProvider::static_only(StaticConfigProvider::new(overrides)),
        Identifier::default(),
        TieredCounterStore::local_only(),
        clock,
    )
}

fn controller(clock: Arc<ManualClock>) -> AdmissionController {
    controller_with(clock, HashMap::new())
}

fn anonymous(token: &'static str) -> RequestMeta {
    let mut headers = HeaderMap::new();
    headers.insert("x-anonymous-id", HeaderValue::from_static(token));
    RequestMeta::new(Method::POST, headers, None)
}

fn from_ip(ip: &'static str) -> RequestMeta {
    RequestMeta::new(Method::POST, HeaderMap::new(), ip.parse().ok())
}

fn strict_chat() -> HashMap<String, Policy> {
    HashMap::from([("chat:free".to_string(), Policy::new(2, 60, 1, 300))])
}

#[tokio::test]
async fn test_anonymous_daily_chat_quota() {
    let clock = Arc::new(ManualClock::new(DAY * 20_000 + 3_600));
    let controller = controller(clock.clone());
    let request = anonymous("visitor-abc");
    let options = CheckOptions::new(EndpointCategory::Chat);

    for expected in 1..=5 {
        let decision = controller.check(&request, &options).await;
        assert!(decision.allowed, "request {} should be allowed", expected);
        assert_eq!(decision.count, expected);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.endpoint, "chat:anonymous");
        clock.advance(60);
    }

    let sixth = controller.check(&request, &options).await;
    assert!(!sixth.allowed);
    assert_eq!(sixth.count, 6);
    assert_eq!(sixth.limit, 5);
    assert_eq!(sixth.block_reason, Some(RejectionCode::RateLimitExceeded));
    assert_eq!(sixth.violations, 1);
}

#[tokio::test]
async fn test_limit_plus_one_is_denied() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller(clock);
    let request = from_ip("198.51.100.7");
    let options = CheckOptions::new(EndpointCategory::Payment).qualifier("checkout");

    for _ in 0..5 {
        assert!(controller.check(&request, &options).await.allowed);
    }
    let denied = controller.check(&request, &options).await;
    assert!(!denied.allowed);
    assert_eq!(denied.count, 6);
}

#[tokio::test]
async fn test_window_rollover_restarts_count() {
    let clock = Arc::new(ManualClock::new(DAY * 19_000));
    let controller = controller(clock.clone());
    let request = anonymous("visitor-rollover");
    let options = CheckOptions::new(EndpointCategory::Chat);

    for _ in 0..6 {
        controller.check(&request, &options).await;
    }
    assert!(!controller.peek(&request, &options).await.allowed);

    clock.advance(DAY);
    let next = controller.check(&request, &options).await;
    assert!(next.allowed);
    assert_eq!(next.count, 1);
}

#[tokio::test]
async fn test_violations_only_count_denials() {
    let clock = Arc::new(ManualClock::new(0));
    let overrides = HashMap::from([("chat:free".to_string(), Policy::new(3, 60, 10, 300))]);
    let controller = controller_with(clock, overrides);
    let request = from_ip("203.0.113.5");
    let options = CheckOptions::new(EndpointCategory::Chat).caller("100");

    for _ in 0..3 {
        let decision = controller.check(&request, &options).await;
        assert!(decision.allowed);
        assert_eq!(decision.violations, 0);
    }
    for expected in 1..=4 {
        let decision = controller.check(&request, &options).await;
        assert!(!decision.allowed);
        assert_eq!(decision.violations, expected);
    }
}

#[tokio::test]
async fn test_block_lasts_for_block_duration() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller_with(clock.clone(), strict_chat());
    let request = from_ip("203.0.113.9");
    let options = CheckOptions::new(EndpointCategory::Chat).caller("200");

    assert!(controller.check(&request, &options).await.allowed);
    assert!(controller.check(&request, &options).await.allowed);

    let first_denial = controller.check(&request, &options).await;
    assert!(!first_denial.allowed);
    assert!(!first_denial.is_blocked);

    // violations = 2 > max_violations = 1
    let blocked = controller.check(&request, &options).await;
    assert!(blocked.is_blocked);
    assert_eq!(blocked.block_reason, Some(RejectionCode::TemporarilyBlocked));
    assert_eq!(blocked.reset_time, 300);
    assert_eq!(blocked.remaining, 300);

    // 新窗口仍在封禁中，封禁不会被延长
    clock.set(120);
    let still_blocked = controller.check(&request, &options).await;
    assert!(!still_blocked.allowed);
    assert!(still_blocked.is_blocked);
    assert_eq!(still_blocked.reset_time, 300);
    assert_eq!(still_blocked.remaining, 180);

    clock.set(300);
    let released = controller.check(&request, &options).await;
    assert!(released.allowed);
    assert!(!released.is_blocked);
    assert_eq!(released.count, 1);
}

#[tokio::test]
async fn test_peek_is_read_only() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller_with(clock, strict_chat());
    let request = from_ip("192.0.2.44");
    let options = CheckOptions::new(EndpointCategory::Chat).caller("300");

    for _ in 0..3 {
        controller.check(&request, &options).await;
    }

    for _ in 0..10 {
        let peek = controller.peek(&request, &options).await;
        assert_eq!(peek.count, 3);
        assert_eq!(peek.violations, 1);
        assert!(!peek.is_blocked);
    }

    let next = controller.check(&request, &options).await;
    assert_eq!(next.count, 4);
    assert_eq!(next.violations, 2);
}

#[tokio::test]
async fn test_peek_reports_whether_next_request_fits() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller_with(clock, strict_chat());
    let request = from_ip("192.0.2.45");
    let options = CheckOptions::new(EndpointCategory::Chat).caller("301");

    assert!(controller.peek(&request, &options).await.allowed);
    controller.check(&request, &options).await;
    assert!(controller.peek(&request, &options).await.allowed);
    controller.check(&request, &options).await;
    assert!(!controller.peek(&request, &options).await.allowed);
}

#[tokio::test]
async fn test_reset_clears_history() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller_with(clock, strict_chat());
    let request = from_ip("192.0.2.50");
    let options = CheckOptions::new(EndpointCategory::Chat).caller("400");

    for _ in 0..4 {
        controller.check(&request, &options).await;
    }
    assert!(controller.peek(&request, &options).await.is_blocked);

    assert!(controller.reset("user:400", "chat:free").await > 0);

    let fresh = controller.check(&request, &options).await;
    assert!(fresh.allowed);
    assert_eq!(fresh.count, 1);
    assert_eq!(fresh.violations, 0);
}

#[tokio::test]
async fn test_reset_does_not_touch_other_endpoints() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller(clock);
    let request = from_ip("192.0.2.51");
    let chat = CheckOptions::new(EndpointCategory::Chat).caller("401");
    let general = CheckOptions::new(EndpointCategory::General).caller("401");

    controller.check(&request, &chat).await;
    controller.check(&request, &general).await;

    controller.reset("user:401", "chat:free").await;
    assert_eq!(controller.peek(&request, &chat).await.count, 0);
    assert_eq!(controller.peek(&request, &general).await.count, 1);
}

#[tokio::test]
async fn test_forgive_anonymous_after_login() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller(clock);
    let request = anonymous("device-7f3a9c21");
    let chat = CheckOptions::new(EndpointCategory::Chat);

    for _ in 0..6 {
        controller.check(&request, &chat).await;
    }
    assert!(!controller.peek(&request, &chat).await.allowed);

    assert!(controller.forgive_anonymous("device-7f3a9c21", &[]).await > 0);
    let after = controller.check(&request, &chat).await;
    assert!(after.allowed);
    assert_eq!(after.count, 1);
}

#[tokio::test]
async fn test_sub_resources_count_separately() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller(clock);
    let request = anonymous("visitor-characters");

    let luna = CheckOptions::new(EndpointCategory::Chat).sub_resource("luna");
    let nova = CheckOptions::new(EndpointCategory::Chat).sub_resource("nova");

    for _ in 0..5 {
        assert!(controller.check(&request, &luna).await.allowed);
    }
    assert!(!controller.check(&request, &luna).await.allowed);

    let other = controller.check(&request, &nova).await;
    assert!(other.allowed);
    assert_eq!(other.count, 1);
}

#[tokio::test]
async fn test_identities_are_isolated() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller(clock);
    let options = CheckOptions::new(EndpointCategory::Chat);

    for _ in 0..6 {
        controller.check(&from_ip("198.51.100.1"), &options).await;
    }
    let other = controller.check(&from_ip("198.51.100.2"), &options).await;
    assert!(other.allowed);
    assert_eq!(other.count, 1);
}

#[tokio::test]
async fn test_unknown_endpoint_uses_default_policy() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller(clock);
    let options = CheckOptions::new(EndpointCategory::Media).qualifier("unlisted");

    let decision = controller.check(&from_ip("198.51.100.3"), &options).await;
    assert!(decision.allowed);
    assert_eq!(decision.endpoint, "media:unlisted");
    assert_eq!(decision.limit, 100);
    assert_eq!(decision.window, 60);
}

#[tokio::test]
async fn test_oversized_override_falls_back_to_builtin() {
    let clock = Arc::new(ManualClock::new(0));
    let overrides = HashMap::from([("chat:paid".to_string(), Policy::new(1, 60, 0, u64::MAX))]);
    let controller = controller_with(clock, overrides);
    let request = from_ip("198.51.100.90");
    let options = CheckOptions::new(EndpointCategory::Chat).caller("500").tier(Tier::Paid);

    let decision = controller.check(&request, &options).await;
    assert!(decision.allowed);
    assert_eq!(decision.endpoint, "chat:paid");
    assert_eq!(decision.limit, 1_000);
}

#[tokio::test]
async fn test_reserved_prefix_token_is_not_trusted() {
    let clock = Arc::new(ManualClock::new(0));
    let controller = controller(clock);
    let options = CheckOptions::new(EndpointCategory::Chat);

    let mut headers = HeaderMap::new();
    headers.insert("x-anonymous-id", HeaderValue::from_static("user:1"));
    let forged = RequestMeta::new(Method::POST, headers, "198.51.100.91".parse().ok());

    assert_ne!(controller.identify(&forged, None), "user:1");
    assert_eq!(controller.check(&forged, &options).await.endpoint, "chat:anonymous");
}
