//! 配置管理模块
//!
//! 从 TOML 文件加载沙盒配置，命令行参数可以覆盖其中的部分字段。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [window]
//! width = 1280
//! height = 720
//! title = "D3D12 Sandbox"
//! resizable = true
//!
//! [graphics]
//! backend = "dx12"    # 或 "headless"
//! vsync = true
//! use_bundles = false
//! frame_limit = 0     # 0 表示不限制
//!
//! [logging]
//! level = "info"      # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, Result};

/// 沙盒配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 窗口配置
    #[serde(default)]
    pub window: WindowConfig,

    /// 图形配置
    #[serde(default)]
    pub graphics: GraphicsConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 窗口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// 窗口宽度
    #[serde(default = "default_width")]
    pub width: u32,

    /// 窗口高度
    #[serde(default = "default_height")]
    pub height: u32,

    /// 窗口标题
    #[serde(default = "default_title")]
    pub title: String,

    /// 是否可调整大小
    #[serde(default = "default_resizable")]
    pub resizable: bool,
}

/// 图形配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// 设备实现选择
    #[serde(default = "default_backend")]
    pub backend: GraphicsBackend,

    /// 垂直同步
    #[serde(default = "default_vsync")]
    pub vsync: bool,

    /// 每个模型的绘制命令是否预录制为 bundle
    #[serde(default)]
    pub use_bundles: bool,

    /// 渲染帧数上限，0 表示一直运行到窗口关闭
    #[serde(default)]
    pub frame_limit: u64,
}

/// 设备实现类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackend {
    /// DirectX 12 设备（仅 Windows）
    Dx12,
    /// 无窗口的软件校验设备
    Headless,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_title() -> String { "D3D12 Sandbox".to_string() }
fn default_resizable() -> bool { true }
fn default_vsync() -> bool { true }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_file() -> String { "sandbox.log".to_string() }

fn default_backend() -> GraphicsBackend {
    if cfg!(windows) {
        GraphicsBackend::Dx12
    } else {
        GraphicsBackend::Headless
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            title: default_title(),
            resizable: default_resizable(),
        }
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            vsync: default_vsync(),
            use_bundles: false,
            frame_limit: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml(&contents)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在或解析失败则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(error = %e, "Using default config");
                Self::default()
            }
        }
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--dx12` / `--headless`: 选择设备实现
    /// - `--width <value>` / `--height <value>`: 窗口尺寸
    /// - `--frames <value>`: 渲染帧数上限
    /// - `--bundles`: 使用 bundle 录制模型绘制
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--dx12") {
            self.graphics.backend = GraphicsBackend::Dx12;
        }
        if args.iter().any(|a| a == "--headless") {
            self.graphics.backend = GraphicsBackend::Headless;
        }
        if args.iter().any(|a| a == "--bundles") {
            self.graphics.use_bundles = true;
        }

        if let Some(width) = parse_value(&args, "--width") {
            self.window.width = width;
        }
        if let Some(height) = parse_value(&args, "--height") {
            self.window.height = height;
        }
        if let Some(frames) = parse_value(&args, "--frames") {
            self.graphics.frame_limit = frames;
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::InvalidValue {
                field: "window.width/height".to_string(),
                reason: "Window dimensions must be greater than 0".to_string(),
            }
            .into());
        }

        if self.graphics.backend == GraphicsBackend::Dx12 && !cfg!(windows) {
            return Err(ConfigError::InvalidValue {
                field: "graphics.backend".to_string(),
                reason: "DirectX 12 is only available on Windows".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    let idx = args.iter().position(|a| a == flag)?;
    args.get(idx + 1)?.parse().ok()
}

impl GraphicsBackend {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            GraphicsBackend::Dx12 => "DirectX 12",
            GraphicsBackend::Headless => "Headless",
        }
    }
}
