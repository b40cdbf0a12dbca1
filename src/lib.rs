//! D3D12 Sandbox
//!
//! 一个最小的 Direct3D 12 渲染沙盒：把 FBX 模型和 DDS / 图片纹理上传到
//! GPU，用同一份几何数据绘制多个模型实例。
//!
//! # 模块结构
//!
//! - `core`: 配置、日志、错误处理、数学、场景描述
//! - `geometry`: 顶点、网格，FBX 与纹理加载器
//! - `renderer`: 资源、描述符、命令列表、围栏、子资源上传和帧循环
//! - `component`: 模型实例与变换
//! - `gfx`: 设备实现（DirectX 12 与无头校验设备）
//!
//! # 使用示例
//!
//! ```no_run
//! use d3d12_sandbox::core::{Config, SceneConfig};
//! use d3d12_sandbox::gfx::HeadlessBackend;
//! use d3d12_sandbox::renderer::{device::Device, Renderer};
//!
//! let config = Config::default();
//! let scene = SceneConfig::default();
//! let device = Device::new(Box::new(HeadlessBackend::new(1280, 720)));
//! let mut renderer = Renderer::new(device, &config, &scene)?;
//! renderer.render_frame()?;
//! # Ok::<(), d3d12_sandbox::core::SandboxError>(())
//! ```

pub mod component;
pub mod core;
pub mod geometry;
pub mod gfx;
pub mod renderer;
