/// 限流策略
///
/// 每个 endpoint key（`{category}:{tier}`）对应一组固定窗口参数：
/// - requests: 窗口内允许的请求数
/// - window: 窗口长度（秒）
/// - max_violations: 允许的最大违规次数，超过后进入临时封禁
/// - block_duration: 封禁时长（秒），同时也是违规计数的衰减周期
use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// 兜底策略 key（找不到任何配置时使用）
pub const DEFAULT_POLICY_KEY: &str = "general:authenticated";

/// 窗口与封禁时长的上限（10 年）
pub const MAX_POLICY_SECS: u64 = 10 * 365 * 86_400;

/// 单个 endpoint 的限流策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub requests: u64,
    pub window: u64,
    pub max_violations: u64,
    pub block_duration: u64,
}

impl Policy {
    pub const fn new(requests: u64, window: u64, max_violations: u64, block_duration: u64) -> Self {
        Self {
            requests,
            window,
            max_violations,
            block_duration,
        }
    }

    /// 窗口与封禁时长必须落在 `1..=MAX_POLICY_SECS`，0 会导致除零
    pub fn is_valid(&self) -> bool {
        (1..=MAX_POLICY_SECS).contains(&self.window)
            && (1..=MAX_POLICY_SECS).contains(&self.block_duration)
    }
}

/// Endpoint 类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointCategory {
    General,
    Chat,
    Media,
    Auth,
    Admin,
    Payment,
}

impl EndpointCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::General => "general",
            EndpointCategory::Chat => "chat",
            EndpointCategory::Media => "media",
            EndpointCategory::Auth => "auth",
            EndpointCategory::Admin => "admin",
            EndpointCategory::Payment => "payment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "general" => Some(EndpointCategory::General),
            "chat" => Some(EndpointCategory::Chat),
            "media" => Some(EndpointCategory::Media),
            "auth" => Some(EndpointCategory::Auth),
            "admin" => Some(EndpointCategory::Admin),
            "payment" => Some(EndpointCategory::Payment),
            _ => None,
        }
    }

    /// 是否按用户权益（anonymous / free / paid）区分策略
    ///
    /// admin / payment / auth 的第二段是具体操作（如 `payment:checkout`），而不是权益等级
    pub fn is_tiered(&self) -> bool {
        matches!(
            self,
            EndpointCategory::General | EndpointCategory::Chat | EndpointCategory::Media
        )
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户权益等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Free,
    Paid,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Free => "free",
            Tier::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" | "anon" | "guest" => Some(Tier::Anonymous),
            "free" | "authenticated" => Some(Tier::Free),
            "paid" | "premium" | "pro" => Some(Tier::Paid),
            _ => None,
        }
    }

    /// 根据权益推导等级：未登录为 anonymous，已登录按是否付费区分
    pub fn from_entitlement(authenticated: bool, paid: bool) -> Self {
        match (authenticated, paid) {
            (false, _) => Tier::Anonymous,
            (true, false) => Tier::Free,
            (true, true) => Tier::Paid,
        }
    }

    /// general 类别下已登录用户共享 `general:authenticated`
    fn general_qualifier(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Free | Tier::Paid => "authenticated",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 拼接 endpoint key：`{category}:{qualifier}`
pub fn endpoint_key(category: EndpointCategory, qualifier: &str) -> String {
    format!("{}:{}", category.as_str(), qualifier)
}

/// 按用户等级拼接 endpoint key
pub fn tiered_endpoint_key(category: EndpointCategory, tier: Tier) -> String {
    match category {
        EndpointCategory::General => endpoint_key(category, tier.general_qualifier()),
        _ => endpoint_key(category, tier.as_str()),
    }
}

lazy_static! {
    /// 内置策略表
    ///
    /// 远程动态配置不可用或没有对应条目时使用
    pub static ref BUILTIN_POLICIES: HashMap<&'static str, Policy> = {
        let mut m = HashMap::new();

        // ==================== 通用接口 ====================
        m.insert("general:anonymous", Policy::new(30, 60, 5, 300));
        m.insert("general:authenticated", Policy::new(100, 60, 10, 300));

        // ==================== 聊天（按天计费的回复额度） ====================
        m.insert("chat:anonymous", Policy::new(5, 86_400, 3, 3_600));
        m.insert("chat:free", Policy::new(50, 86_400, 5, 3_600));
        m.insert("chat:paid", Policy::new(1_000, 86_400, 10, 1_800));

        // ==================== 媒体生成 ====================
        m.insert("media:anonymous", Policy::new(2, 86_400, 2, 3_600));
        m.insert("media:free", Policy::new(10, 86_400, 3, 3_600));
        m.insert("media:paid", Policy::new(200, 86_400, 10, 1_800));

        // ==================== 认证 ====================
        m.insert("auth:login", Policy::new(10, 900, 5, 1_800));
        m.insert("auth:register", Policy::new(5, 3_600, 3, 3_600));

        // ==================== 管理接口 ====================
        m.insert("admin:general", Policy::new(60, 60, 5, 900));
        m.insert("admin:sensitive", Policy::new(10, 60, 3, 3_600));

        // ==================== 支付 ====================
        m.insert("payment:checkout", Policy::new(5, 300, 3, 3_600));
        m.insert("payment:general", Policy::new(20, 60, 5, 1_800));
        m.insert("payment:webhook", Policy::new(100, 60, 20, 300));

        m
    };
}

/// 兜底策略（最宽松的已登录通用策略）
pub fn default_policy() -> Policy {
    BUILTIN_POLICIES
        .get(DEFAULT_POLICY_KEY)
        .copied()
        .unwrap_or(Policy::new(100, 60, 10, 300))
}
