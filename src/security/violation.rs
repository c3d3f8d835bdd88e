/// 违规计数与临时封禁
///
/// 纯函数，三层存储都用它来决定"拒绝之后该写什么"：
/// - 每次拒绝违规数 +1，放行不变
/// - 违规数超过 max_violations 时设置 block_duration 秒的封禁
/// - 已有的有效封禁不会被延长，到期即解除
use crate::security::policy::Policy;

/// 违规评估结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationOutcome {
    pub violations: u64,
    pub blocked_until: Option<i64>,
    /// 本次评估是否新设置了封禁
    pub newly_blocked: bool,
}

pub struct ViolationTracker;

impl ViolationTracker {
    /// 评估一次检查后的违规状态
    pub fn evaluate(
        prior_violations: u64,
        allowed: bool,
        policy: &Policy,
        now: i64,
        active_block: Option<i64>,
    ) -> ViolationOutcome {
        let active_block = active_block.filter(|until| is_block_active(Some(*until), now));

        if allowed {
            return ViolationOutcome {
                violations: prior_violations,
                blocked_until: active_block,
                newly_blocked: false,
            };
        }

        let violations = prior_violations.saturating_add(1);
        if active_block.is_none() && Self::should_block(violations, policy) {
            return ViolationOutcome {
                violations,
                blocked_until: Some(Self::violations_expire_at(policy, now)),
                newly_blocked: true,
            };
        }

        ViolationOutcome {
            violations,
            blocked_until: active_block,
            newly_blocked: false,
        }
    }

    pub fn should_block(violations: u64, policy: &Policy) -> bool {
        violations > policy.max_violations
    }

    /// 违规计数的过期时间（每次违规后刷新）
    pub fn violations_expire_at(policy: &Policy, now: i64) -> i64 {
        now.saturating_add(i64::try_from(policy.block_duration).unwrap_or(i64::MAX))
    }
}

/// 封禁是否仍然有效
pub fn is_block_active(blocked_until: Option<i64>, now: i64) -> bool {
    matches!(blocked_until, Some(until) if until > now)
}
