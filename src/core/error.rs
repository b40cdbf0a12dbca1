//! 错误处理模块
//!
//! 定义了沙盒中使用的统一错误类型。
//!
//! # 设计原则
//!
//! - 按子系统划分错误（配置、图形、网格、纹理）
//! - 为每种错误类型提供清晰的上下文信息
//! - 支持错误链（error source）

use std::fmt;
use std::path::PathBuf;

/// 沙盒统一的 Result 类型
pub type Result<T> = std::result::Result<T, SandboxError>;

/// 沙盒的错误类型
#[derive(Debug)]
pub enum SandboxError {
    /// 配置错误
    Config(ConfigError),

    /// 图形 API 错误
    Graphics(GraphicsError),

    /// 网格加载错误
    MeshLoading(MeshLoadError),

    /// 纹理加载错误
    Texture(TextureError),

    /// IO 错误
    Io(std::io::Error),

    /// 日志系统错误
    Log(String),

    /// 初始化错误
    Initialization(String),

    /// 运行时错误
    Runtime(String),
}

/// 配置相关的错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),

    /// 配置文件解析失败
    ParseError(String),

    /// 配置值无效
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
#[derive(Debug)]
pub enum GraphicsError {
    /// 设备创建失败
    DeviceCreation(String),

    /// 交换链错误
    SwapchainError(String),

    /// 着色器编译失败
    ShaderCompilation(String),

    /// 资源创建失败
    ResourceCreation(String),

    /// 渲染命令执行失败
    CommandExecution(String),

    /// 围栏等待失败
    Synchronization(String),

    /// 命令或资源状态违反 D3D12 规则
    Validation(String),
}

/// 网格加载相关的错误
#[derive(Debug)]
pub enum MeshLoadError {
    /// 文件不存在
    FileNotFound(PathBuf),

    /// 不支持的文件格式
    UnsupportedFormat(String),

    /// 解析失败
    ParseError(String),

    /// 几何数据无效
    InvalidGeometry(String),
}

/// 纹理加载相关的错误
#[derive(Debug)]
pub enum TextureError {
    /// 文件不存在
    FileNotFound(PathBuf),

    /// 不支持的像素格式
    UnsupportedFormat(String),

    /// 文件内容损坏或截断
    Corrupt(String),

    /// image 库解码失败
    Decode(String),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Config(e) => write!(f, "Configuration error: {}", e),
            SandboxError::Graphics(e) => write!(f, "Graphics error: {}", e),
            SandboxError::MeshLoading(e) => write!(f, "Mesh loading error: {}", e),
            SandboxError::Texture(e) => write!(f, "Texture error: {}", e),
            SandboxError::Io(e) => write!(f, "IO error: {}", e),
            SandboxError::Log(msg) => write!(f, "Log error: {}", msg),
            SandboxError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
            SandboxError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsError::DeviceCreation(msg) => write!(f, "Device creation failed: {}", msg),
            GraphicsError::SwapchainError(msg) => write!(f, "Swapchain error: {}", msg),
            GraphicsError::ShaderCompilation(msg) => write!(f, "Shader compilation failed: {}", msg),
            GraphicsError::ResourceCreation(msg) => write!(f, "Resource creation failed: {}", msg),
            GraphicsError::CommandExecution(msg) => write!(f, "Command execution failed: {}", msg),
            GraphicsError::Synchronization(msg) => write!(f, "Synchronization failed: {}", msg),
            GraphicsError::Validation(msg) => write!(f, "Validation failed: {}", msg),
        }
    }
}

impl fmt::Display for MeshLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshLoadError::FileNotFound(path) => write!(f, "Mesh file not found: {}", path.display()),
            MeshLoadError::UnsupportedFormat(msg) => write!(f, "Unsupported mesh format: {}", msg),
            MeshLoadError::ParseError(msg) => write!(f, "Failed to parse mesh: {}", msg),
            MeshLoadError::InvalidGeometry(msg) => write!(f, "Invalid geometry data: {}", msg),
        }
    }
}

impl fmt::Display for TextureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureError::FileNotFound(path) => write!(f, "Texture file not found: {}", path.display()),
            TextureError::UnsupportedFormat(msg) => write!(f, "Unsupported texture format: {}", msg),
            TextureError::Corrupt(msg) => write!(f, "Corrupt texture file: {}", msg),
            TextureError::Decode(msg) => write!(f, "Failed to decode texture: {}", msg),
        }
    }
}

impl std::error::Error for SandboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SandboxError::Io(e) => Some(e),
            SandboxError::Config(e) => Some(e),
            SandboxError::Graphics(e) => Some(e),
            SandboxError::MeshLoading(e) => Some(e),
            SandboxError::Texture(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for GraphicsError {}
impl std::error::Error for MeshLoadError {}
impl std::error::Error for TextureError {}

// 实现 From trait 以便于错误转换
impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Io(err)
    }
}

impl From<ConfigError> for SandboxError {
    fn from(err: ConfigError) -> Self {
        SandboxError::Config(err)
    }
}

impl From<GraphicsError> for SandboxError {
    fn from(err: GraphicsError) -> Self {
        SandboxError::Graphics(err)
    }
}

impl From<MeshLoadError> for SandboxError {
    fn from(err: MeshLoadError) -> Self {
        SandboxError::MeshLoading(err)
    }
}

impl From<TextureError> for SandboxError {
    fn from(err: TextureError) -> Self {
        SandboxError::Texture(err)
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for SandboxError {
    fn from(err: windows::core::Error) -> Self {
        SandboxError::Graphics(GraphicsError::CommandExecution(err.to_string()))
    }
}

impl SandboxError {
    /// 构造校验错误的便捷方法
    pub fn validation(msg: impl Into<String>) -> Self {
        SandboxError::Graphics(GraphicsError::Validation(msg.into()))
    }
}
