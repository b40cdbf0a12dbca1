//! 设备实现
//!
//! - `headless`：CPU 上执行命令并校验 D3D12 状态规则，测试与无窗口运行使用
//! - `dx12`：Windows 上的 DirectX 12 实现
//!
//! 两者都实现 `renderer::device::GpuBackend`，上层只持有 `Device`。

pub mod headless;

#[cfg(target_os = "windows")]
pub mod dx12;

pub use headless::HeadlessBackend;

#[cfg(target_os = "windows")]
pub use dx12::Dx12Backend;
