/// 调用方身份推导
///
/// 同一个调用方在整个策略窗口内必须映射到同一个身份，否则计数会被悄悄清零。
/// 优先级：
/// 1. 已认证用户：`user:{id}`
/// 2. 匿名用户携带的稳定匿名令牌（原样使用）
/// 3. 网络来源哈希：`anon:{sha256(ip)[..16]}`
///
/// 浏览器指纹之类每次加载都会变化的信号不参与推导。
use std::net::IpAddr;

use axum::http::{HeaderMap, Method};
use sha2::{Digest, Sha256};

/// 匿名令牌请求头
pub const ANONYMOUS_TOKEN_HEADER: &str = "x-anonymous-id";

/// 匿名令牌长度范围
const ANONYMOUS_TOKEN_MIN_LEN: usize = 8;
const ANONYMOUS_TOKEN_MAX_LEN: usize = 128;

/// 网络来源哈希截断长度（hex 字符）
const ORIGIN_HASH_LEN: usize = 16;

/// 限流所需的请求元数据（与具体 HTTP 框架解耦）
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub headers: HeaderMap,
    /// TCP 对端地址
    pub peer_addr: Option<IpAddr>,
}

impl RequestMeta {
    pub fn new(method: Method, headers: HeaderMap, peer_addr: Option<IpAddr>) -> Self {
        Self {
            method,
            headers,
            peer_addr,
        }
    }

    /// 读取字符串请求头（非 UTF-8 视为不存在）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// 按代理链解析客户端地址
    ///
    /// 只有 TCP 对端在 `trusted_proxies` 中时才读取转发头：X-Forwarded-For 从右往左
    /// 跳过可信代理，取第一个不可信地址；没有 X-Forwarded-For 时再看 X-Real-IP、
    /// CF-Connecting-IP。其余情况一律使用对端地址，客户端自带的转发头不起作用。
    pub fn client_addr(&self, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
        let peer = self.peer_addr?;
        if !trusted_proxies.contains(&peer) {
            return Some(peer);
        }

        if let Some(forwarded) = self.header("x-forwarded-for") {
            let mut leftmost = None;
            for entry in forwarded.rsplit(',') {
                let Ok(addr) = entry.trim().parse::<IpAddr>() else {
                    break;
                };
                if !trusted_proxies.contains(&addr) {
                    return Some(addr);
                }
                leftmost = Some(addr);
            }
            return Some(leftmost.unwrap_or(peer));
        }

        ["x-real-ip", "cf-connecting-ip"]
            .iter()
            .find_map(|name| self.header(name).and_then(|v| v.trim().parse().ok()))
            .or(Some(peer))
    }
}

/// 身份推导器
#[derive(Debug, Clone, Default)]
pub struct Identifier {
    /// 可信反向代理；为空时不读取任何转发头
    trusted_proxies: Vec<IpAddr>,
}

impl Identifier {
    /// `trust_proxy` 关闭时忽略 `trusted_proxies`
    pub fn new(trust_proxy: bool, trusted_proxies: Vec<IpAddr>) -> Self {
        Self {
            trusted_proxies: if trust_proxy { trusted_proxies } else { Vec::new() },
        }
    }

    /// 推导调用方身份
    pub fn identify(&self, request: &RequestMeta, user_id: Option<&str>) -> String {
        if let Some(id) = user_id.map(str::trim).filter(|id| !id.is_empty()) {
            return format!("user:{}", id);
        }

        if let Some(token) = request
            .header(ANONYMOUS_TOKEN_HEADER)
            .map(str::trim)
            .filter(|t| is_valid_anonymous_token(t))
        {
            return token.to_string();
        }

        let origin = self
            .network_origin(request)
            .unwrap_or_else(|| "unknown".to_string());
        format!("anon:{}", hash_origin(&origin))
    }

    /// 网络来源（供管理接口白名单使用）
    pub fn network_origin(&self, request: &RequestMeta) -> Option<String> {
        request
            .client_addr(&self.trusted_proxies)
            .map(|addr| addr.to_string())
    }
}

/// 服务端生成的身份前缀，匿名令牌不能使用
const RESERVED_PREFIXES: [&str; 3] = ["user:", "anon:", "rl:"];

/// 匿名令牌校验：长度受限、仅允许 `[A-Za-z0-9_-:.]`，且不能占用服务端身份前缀
fn is_valid_anonymous_token(token: &str) -> bool {
    (ANONYMOUS_TOKEN_MIN_LEN..=ANONYMOUS_TOKEN_MAX_LEN).contains(&token.len())
        && !RESERVED_PREFIXES.iter().any(|p| token.starts_with(p))
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'))
}

fn hash_origin(origin: &str) -> String {
    let digest = Sha256::digest(origin.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(ORIGIN_HASH_LEN);
    hex
}
