//! 日志系统模块
//!
//! 基于 `tracing` 的结构化日志。控制台输出始终开启，
//! 文件输出按天滚动，由 `[logging]` 配置段控制。
//!
//! ```no_run
//! use d3d12_sandbox::core::{config::LogLevel, log};
//!
//! log::init_logger(LogLevel::Info, false, None).ok();
//! tracing::info!(width = 1280, height = 720, "Window created");
//! ```

use std::path::Path;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

use super::config::LogLevel;
use super::error::{Result, SandboxError};

const DEFAULT_LOG_FILE: &str = "sandbox.log";

/// 初始化日志系统
///
/// 进程内只能成功调用一次，重复调用返回 `SandboxError::Log`。
/// `RUST_LOG` 环境变量存在时优先于配置中的级别。
///
/// # 参数
///
/// * `level` - 日志级别
/// * `file_output` - 是否输出到文件
/// * `log_file_path` - 日志文件路径（默认 "sandbox.log"）
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true);

    let result = if file_output {
        let log_path = log_file_path.unwrap_or(DEFAULT_LOG_FILE);
        let path = Path::new(log_path);
        let directory = path.parent().unwrap_or(Path::new("."));
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(DEFAULT_LOG_FILE);

        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
    };

    result.map_err(|e| SandboxError::Log(e.to_string()))
}

impl LogLevel {
    /// EnvFilter 使用的指令字符串
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// GPU 子系统日志（设备、队列、资源）
#[macro_export]
macro_rules! gpu_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "sandbox::gpu", $($arg)*)
    };
}

/// GPU 子系统警告
#[macro_export]
macro_rules! gpu_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "sandbox::gpu", $($arg)*)
    };
}

/// 应用层日志
#[macro_export]
macro_rules! app_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "sandbox::app", $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }
}
