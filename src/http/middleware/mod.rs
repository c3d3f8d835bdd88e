//! 准入中间件
//!
//! 所有适配器共用同一套响应约定：
//! - 放行：继续处理，响应附带 `X-RateLimit-*` 头
//! - 拒绝：429（超限 / 封禁）、401 / 403（前置检查），JSON `{error, code, ...}`
//!
//! 适配器：
//! - `general_rate_limit`   通用接口，按权益等级
//! - `chat_rate_limit`      聊天接口，按权益等级 + 角色（`X-Character-Id`）分别计数
//! - `admin_rate_limit`     管理接口，白名单放行 → 角色检查 → 计数
//! - `payment_rate_limit`   支付接口，风控前置检查 → 严格计数

pub mod admin;
pub mod auth;
pub mod payment;
pub mod rate_limit;

pub use admin::{admin_rate_limit, admin_sensitive_rate_limit};
pub use auth::{caller_context, gateway_context, request_meta, CallerContext};
pub use payment::payment_rate_limit;
pub use rate_limit::{admit, chat_rate_limit, general_rate_limit, SUB_RESOURCE_HEADER};
