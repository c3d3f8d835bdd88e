pub mod cli;
pub mod config;
pub mod error;
pub mod http; // HTTP 准入服务
pub mod infra;
pub mod logging;
pub mod security; // 准入控制

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use security::{
    AdmissionController, AdmissionDecision, CheckOptions, EndpointCategory, Policy, RequestMeta,
    Tier,
};
