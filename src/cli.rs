use clap::{Parser, Subcommand};

impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// PrivChat Admission - 多租户准入控制与分级限流服务
#[derive(Parser, Debug, Default)]
#[command(name = "privchat-admission")]
#[command(version)]
#[command(about = "PrivChat 平台的准入控制与分级限流服务", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", help = "指定配置文件路径")]
    pub config_file: Option<String>,

    /// 服务器监听地址
    #[arg(long, value_name = "ADDRESS", help = "HTTP 监听地址")]
    pub host: Option<String>,

    /// HTTP 端口
    #[arg(long, value_name = "PORT", help = "HTTP 监听端口")]
    pub port: Option<u16>,

    /// 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error"
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", help = "日志格式: pretty, json, compact")]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, value_name = "PATH", help = "日志输出文件路径")]
    pub log_file: Option<String>,

    /// 数据库连接 URL
    #[arg(long, value_name = "URL", help = "PostgreSQL 连接字符串（第二层计数）")]
    pub database_url: Option<String>,

    /// Redis 连接 URL
    #[arg(long, value_name = "URL", help = "Redis 连接字符串（第一层计数）")]
    pub redis_url: Option<String>,

    /// 远程动态限流配置地址
    #[arg(long, value_name = "URL", help = "远程动态限流配置基础 URL")]
    pub remote_config_url: Option<String>,

    /// 启用监控指标
    #[arg(long, help = "启用 Prometheus 监控指标（/metrics）")]
    pub enable_metrics: bool,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, action = clap::ArgAction::Count, help = "详细输出级别")]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', help = "静默模式（不输出日志）")]
    pub quiet: bool,

    /// 开发模式（等同于 --log-level debug --log-format pretty）
    #[arg(long, help = "启用开发模式")]
    pub dev: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 执行数据库迁移（创建 rate_limits 表和存储过程）
    Migrate,
    /// 生成默认配置文件
    GenerateConfig {
        /// 输出文件路径
        #[arg(value_name = "PATH", default_value = "config.toml")]
        path: String,
    },
    /// 验证配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(value_name = "PATH", default_value = "config.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置，敏感信息已隐藏）
    ShowConfig,
    /// 重置某个身份在某个 endpoint 上的计数、违规和封禁
    Reset {
        /// 身份（如 user:42、anon:1f2e3d4c5b6a7980）
        #[arg(value_name = "IDENTITY")]
        identity: String,
        /// endpoint key（如 chat:free）
        #[arg(value_name = "ENDPOINT")]
        endpoint: String,
    },
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if self.dev {
            return Some("debug".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        if self.dev {
            return Some("pretty".to_string());
        }
        self.log_format.clone()
    }
}
