//! DirectX 12 设备实现
//!
//! - `context`：设备、命令队列、交换链、围栏
//! - `descriptor`：ID3D12DescriptorHeap 与句柄计算
//! - `pipeline`：根签名、HLSL 运行时编译、PSO
//! - `backend`：`GpuBackend` 实现，把录制的命令翻译成 ID3D12GraphicsCommandList

pub mod backend;
pub mod context;
pub mod descriptor;
pub mod pipeline;

pub use backend::Dx12Backend;
pub use context::Dx12Context;
