/// 准入控制模块
///
/// 为所有对外接口提供统一的限流、违规累计和临时封禁：
/// - 策略解析（远程动态配置 → 内置策略表 → 兜底策略）
/// - 调用方身份推导（用户 ID → 匿名令牌 → 网络来源哈希）
/// - 固定窗口计数（Redis → PostgreSQL → 进程内，逐层降级）
/// - 违规累计与临时封禁
/// - 支付接口风控前置检查
///
/// 基础设施故障时放行（fail open），超限与风控命中时拒绝（fail closed）。
pub mod config_provider;
pub mod decision;
pub mod fraud;
pub mod identity;
pub mod policy;
pub mod rate_limiter;
pub mod store;
pub mod violation;
pub mod window;

pub use config_provider::{
    ConfigProvider, FallbackConfigProvider, RemoteConfigProvider, StaticConfigProvider,
};
pub use decision::{AdmissionDecision, Rejection, RejectionCode};
pub use fraud::{RiskAssessment, RiskAssessor, RiskSignal};
pub use identity::{Identifier, RequestMeta};
pub use policy::{EndpointCategory, Policy, Tier};
pub use rate_limiter::{AdmissionController, CheckOptions};
pub use store::{CheckMode, CounterSnapshot, CounterStore, TieredCounterStore};
pub use violation::ViolationTracker;
pub use window::{Clock, ManualClock, SystemClock, WindowKey};
