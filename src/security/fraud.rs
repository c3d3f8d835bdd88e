/// 支付接口风控前置检查
///
/// 根据请求元数据计算启发式风险分（0-100）：
/// - User-Agent 缺失 / 过短
/// - 自动化工具特征（User-Agent、X-Requested-With、From）
/// - 写操作缺少 Referer
/// - Origin 不在允许列表中
///
/// 风险分 ≥ block_threshold 时直接 403，不进入计数；
/// ≥ review_threshold 时只记录告警，仍按支付策略严格计数。
use axum::http::Method;
use lazy_static::lazy_static;
use serde::Serialize;

use crate::config::PaymentConfig;
use crate::security::identity::RequestMeta;

/// 各项信号的分值
const SCORE_MISSING_USER_AGENT: u32 = 50;
const SCORE_SHORT_USER_AGENT: u32 = 25;
const SCORE_BOT_PATTERN: u32 = 30;
const SCORE_MISSING_REFERER: u32 = 15;
const SCORE_FOREIGN_ORIGIN: u32 = 25;

/// 正常浏览器 User-Agent 的最短长度
const MIN_USER_AGENT_LEN: usize = 20;

/// 分数上限
const MAX_SCORE: u32 = 100;

lazy_static! {
    /// 自动化工具特征（小写匹配）
    static ref BOT_PATTERNS: Vec<&'static str> = vec![
        "bot", "crawler", "spider", "scraper", "curl", "wget",
        "python-requests", "python-urllib", "aiohttp", "httpclient",
        "go-http-client", "java/", "okhttp", "libwww", "headless",
        "phantomjs", "selenium", "puppeteer", "playwright",
    ];
}

/// 参与特征匹配的请求头
const BOT_SIGNAL_HEADERS: [&str; 3] = ["user-agent", "x-requested-with", "from"];

/// 风险信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSignal {
    MissingUserAgent,
    ShortUserAgent,
    BotPattern,
    MissingReferer,
    ForeignOrigin,
}

/// 风险评估结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub signals: Vec<RiskSignal>,
}

impl RiskAssessment {
    pub fn has(&self, signal: RiskSignal) -> bool {
        self.signals.contains(&signal)
    }
}

/// 风险评估器
#[derive(Debug, Clone)]
pub struct RiskAssessor {
    allowed_origins: Vec<String>,
    block_threshold: u32,
    review_threshold: u32,
}

impl RiskAssessor {
    pub fn new(config: &PaymentConfig) -> Self {
        Self {
            allowed_origins: config
                .allowed_origins
                .iter()
                .map(|o| o.trim_end_matches('/').to_ascii_lowercase())
                .collect(),
            block_threshold: config.block_threshold,
            review_threshold: config.review_threshold,
        }
    }

    pub fn assess(&self, request: &RequestMeta) -> RiskAssessment {
        let mut signals = Vec::new();

        match request.header("user-agent").map(str::trim) {
            None | Some("") => signals.push(RiskSignal::MissingUserAgent),
            Some(ua) if ua.len() < MIN_USER_AGENT_LEN => signals.push(RiskSignal::ShortUserAgent),
            Some(_) => {}
        }

        let bot_like = BOT_SIGNAL_HEADERS.iter().any(|name| {
            request
                .header(name)
                .map(|value| {
                    let value = value.to_ascii_lowercase();
                    BOT_PATTERNS.iter().any(|p| value.contains(p))
                })
                .unwrap_or(false)
        });
        if bot_like {
            signals.push(RiskSignal::BotPattern);
        }

        if is_state_changing(&request.method)
            && request.header("referer").map_or(true, |r| r.trim().is_empty())
        {
            signals.push(RiskSignal::MissingReferer);
        }

        if let Some(origin) = request.header("origin") {
            if !self.allowed_origins.is_empty() && !self.is_allowed_origin(origin) {
                signals.push(RiskSignal::ForeignOrigin);
            }
        }

        let score = signals
            .iter()
            .map(|s| match s {
                RiskSignal::MissingUserAgent => SCORE_MISSING_USER_AGENT,
                RiskSignal::ShortUserAgent => SCORE_SHORT_USER_AGENT,
                RiskSignal::BotPattern => SCORE_BOT_PATTERN,
                RiskSignal::MissingReferer => SCORE_MISSING_REFERER,
                RiskSignal::ForeignOrigin => SCORE_FOREIGN_ORIGIN,
            })
            .sum::<u32>()
            .min(MAX_SCORE);

        RiskAssessment { score, signals }
    }

    pub fn should_block(&self, assessment: &RiskAssessment) -> bool {
        assessment.score >= self.block_threshold
    }

    pub fn needs_review(&self, assessment: &RiskAssessment) -> bool {
        assessment.score >= self.review_threshold && !self.should_block(assessment)
    }

    fn is_allowed_origin(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/').to_ascii_lowercase();
        self.allowed_origins.iter().any(|o| *o == origin)
    }
}

fn is_state_changing(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}
