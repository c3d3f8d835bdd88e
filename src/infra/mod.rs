// Infrastructure layer - 基础设施层
// 负责外部存储连接、指标上报和后台清理任务

pub mod database;
pub mod metrics;
pub mod redis;
pub mod sweep_worker;

// 数据库连接管理
pub use database::Database;

// Redis 连接池客户端
pub use redis::RedisClient;

// 过期计数清理
pub use sweep_worker::SweepWorker;
