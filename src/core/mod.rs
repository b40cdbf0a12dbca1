//! 核心功能模块
//!
//! 与图形 API 无关的基础设施：数学、日志、配置、场景配置和错误处理。
//!
//! - `math`：nalgebra 类型别名与 D3D 风格矩阵
//! - `log`：基于 tracing 的日志初始化
//! - `config`：`config.toml` 与命令行覆盖
//! - `scene`：`scene.toml` 场景描述
//! - `error`：统一错误类型

pub mod config;
pub mod error;
pub mod log;
pub mod math;
pub mod scene;

pub use config::Config;
pub use error::{Result, SandboxError};
pub use math::{Matrix4, Vector3, Vector4};
pub use scene::SceneConfig;
