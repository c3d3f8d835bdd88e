//! 过期计数清理 Worker
//!
//! 定期删除关系库中已过期的计数 / 状态行，回收进程内计数表，并刷新连接池指标。
//! Redis 依赖 TTL 自动过期，不需要清理。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::security::rate_limiter::AdmissionController;

pub struct SweepWorker {
    controller: Arc<AdmissionController>,
    interval: Duration,
    is_running: RwLock<bool>,
}

impl SweepWorker {
    pub fn new(controller: Arc<AdmissionController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
            is_running: RwLock::new(false),
        }
    }

    /// 在后台启动清理循环
    pub async fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                warn!("清理 Worker 已在运行");
                return None;
            }
            *running = true;
        }

        info!("🧹 过期计数清理 Worker 已启动 (interval={}s)", self.interval.as_secs());

        let worker = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(worker.interval);
            // 第一次 tick 立即返回，跳过启动时的清理
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !*worker.is_running.read().await {
                    break;
                }
                worker.run_once().await;
            }
            info!("清理 Worker 已停止");
        }))
    }

    /// 执行一轮清理，返回删除条目数
    pub async fn run_once(&self) -> u64 {
        let removed = self.controller.sweep().await;
        if removed > 0 {
            info!("🧹 已清理过期计数: {}", removed);
        } else {
            debug!("没有需要清理的过期计数");
        }
        removed
    }

    pub async fn stop(&self) {
        *self.is_running.write().await = false;
    }
}
