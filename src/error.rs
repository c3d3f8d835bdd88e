use std::fmt;
use std::error::Error as StdError;
use serde::{Serialize, Deserialize};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response, Json},
};

/// 服务器错误类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerError {
    /// 未授权
    Unauthorized(String),
    /// 禁止访问
    Forbidden(String),
    /// 错误请求
    BadRequest(String),
    /// 缓存错误（Redis）
    Cache(String),
    /// 网络错误
    Network(String),
    /// 配置错误
    Configuration(String),
    /// 超时错误
    Timeout(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ServerError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ServerError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ServerError::Cache(msg) => write!(f, "Cache error: {}", msg),
            ServerError::Network(msg) => write!(f, "Network error: {}", msg),
            ServerError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ServerError::Timeout(msg) => write!(f, "Timeout error: {}", msg),
        }
    }
}

impl StdError for ServerError {}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status_code = match &self {
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error_response = ErrorResponse::new(&self);
        (status_code, Json(error_response)).into_response()
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(err: reqwest::Error) -> Self {
        ServerError::Network(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ServerError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 认证错误
    Authentication = 1001,
    /// 禁止访问
    Forbidden = 1002,
    /// 错误请求
    BadRequest = 1003,
    /// 网络错误
    Network = 2001,
    /// 配置错误
    Configuration = 2003,
    /// 缓存错误
    Cache = 2004,
    /// 超时错误
    Timeout = 3002,
}

impl From<&ServerError> for ErrorCode {
    fn from(error: &ServerError) -> Self {
        match error {
            ServerError::Unauthorized(_) => ErrorCode::Authentication,
            ServerError::Forbidden(_) => ErrorCode::Forbidden,
            ServerError::BadRequest(_) => ErrorCode::BadRequest,
            ServerError::Cache(_) => ErrorCode::Cache,
            ServerError::Network(_) => ErrorCode::Network,
            ServerError::Configuration(_) => ErrorCode::Configuration,
            ServerError::Timeout(_) => ErrorCode::Timeout,
        }
    }
}

/// 错误响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// 错误代码
    pub code: ErrorCode,
    /// 错误消息
    pub message: String,
    /// 时间戳
    pub timestamp: u64,
}

impl ErrorResponse {
    /// 创建错误响应
    pub fn new(error: &ServerError) -> Self {
        Self {
            code: ErrorCode::from(error),
            message: error.to_string(),
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }
}
