//! Prometheus 指标：准入检查量、存储层降级、风控拦截、连接池状态等
//!
//! 通过 `init()` 安装全局 Recorder，通过 HTTP GET `/metrics` 暴露抓取端点。
//! 未初始化时所有 record_* 调用都是空操作。

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const COUNTER_ADMISSION_TOTAL: &str = "privchat_admission_checks_total";
const COUNTER_BLOCKS_TOTAL: &str = "privchat_admission_blocks_total";
const COUNTER_TIER_FAILURES: &str = "privchat_admission_tier_failures_total";
const HISTOGRAM_STORE_DURATION: &str = "privchat_admission_store_duration_seconds";
const COUNTER_POLICY_FALLBACK: &str = "privchat_admission_policy_fallback_total";
const COUNTER_SECURITY_BLOCKS: &str = "privchat_admission_security_blocks_total";
const COUNTER_SWEPT_ROWS: &str = "privchat_admission_swept_total";
const GAUGE_REDIS_POOL_ACTIVE: &str = "privchat_redis_pool_active";
const GAUGE_REDIS_POOL_IDLE: &str = "privchat_redis_pool_idle";
const GAUGE_DB_POOL_ACTIVE: &str = "privchat_db_pool_active";
const GAUGE_DB_POOL_IDLE: &str = "privchat_db_pool_idle";
const GAUGE_LOCAL_ENTRIES: &str = "privchat_admission_local_entries";

/// 初始化 Prometheus 指标（安装全局 Recorder，返回 Handle 用于 HTTP 暴露）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 是否已初始化（可供 /metrics 使用）
pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

/// 渲染当前指标为 Prometheus 文本格式，供 GET /metrics 使用。
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 记录一次准入检查：endpoint + 结果（allowed / denied / blocked）+ 命中的存储层
pub fn record_admission(endpoint: &str, outcome: &'static str, tier: &'static str) {
    metrics::counter!(
        COUNTER_ADMISSION_TOTAL,
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome,
        "tier" => tier
    )
    .increment(1);
}

/// 新设置一次临时封禁
pub fn record_block(endpoint: &str) {
    metrics::counter!(COUNTER_BLOCKS_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

/// 某一层存储失败（触发降级）
pub fn record_tier_failure(tier: &'static str) {
    metrics::counter!(COUNTER_TIER_FAILURES, "tier" => tier).increment(1);
}

/// 存储层耗时
pub fn record_store_duration(tier: &'static str, duration_secs: f64) {
    metrics::histogram!(HISTOGRAM_STORE_DURATION, "tier" => tier).record(duration_secs);
}

/// 策略来源失败，回退到内置表
pub fn record_policy_fallback(source: &'static str) {
    metrics::counter!(COUNTER_POLICY_FALLBACK, "source" => source).increment(1);
}

/// 风控前置检查拦截
pub fn record_security_block(endpoint: &str) {
    metrics::counter!(COUNTER_SECURITY_BLOCKS, "endpoint" => endpoint.to_string()).increment(1);
}

/// 过期记录清理数量
pub fn record_swept(tier: &'static str, count: u64) {
    metrics::counter!(COUNTER_SWEPT_ROWS, "tier" => tier).increment(count);
}

/// 更新 Redis 连接池状态（Gauge）。
pub fn record_redis_pool(active: u32, idle: u32) {
    metrics::gauge!(GAUGE_REDIS_POOL_ACTIVE).set(active as f64);
    metrics::gauge!(GAUGE_REDIS_POOL_IDLE).set(idle as f64);
}

/// 更新数据库连接池状态（Gauge）。
pub fn record_db_pool(active: u32, idle: u32) {
    metrics::gauge!(GAUGE_DB_POOL_ACTIVE).set(active as f64);
    metrics::gauge!(GAUGE_DB_POOL_IDLE).set(idle as f64);
}

/// 进程内计数表条目数（Gauge）。
pub fn record_local_entries(count: usize) {
    metrics::gauge!(GAUGE_LOCAL_ENTRIES).set(count as f64);
}
