//! DirectX 12 上下文
//!
//! # 初始化流程
//!
//! 1. 启用调试层（Debug 模式）
//! 2. 创建 DXGI 工厂
//! 3. 创建 D3D12 设备
//! 4. 创建直接命令队列
//! 5. 创建交换链（FLIP_DISCARD，两个缓冲）
//! 6. 创建围栏和围栏事件

use tracing::{debug, info, warn};
use windows::{
    core::Interface, Win32::Foundation::{CloseHandle, HANDLE, HWND}, Win32::Graphics::Direct3D::*,
    Win32::Graphics::Direct3D12::*, Win32::Graphics::Dxgi::Common::*, Win32::Graphics::Dxgi::*,
    Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE},
};
use raw_window_handle::{HasWindowHandle, RawWindowHandle};
use winit::window::Window;

use crate::core::error::{GraphicsError, Result};

/// 交换链缓冲数
pub const SWAP_CHAIN_BUFFER_COUNT: u32 = 2;

/// 交换链缓冲格式，翻转模型不允许 SRGB 缓冲，SRGB 只用在 RTV 上
pub const SWAP_CHAIN_BUFFER_FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM;

/// D3D12 设备、直接队列、交换链与围栏
pub struct Dx12Context {
    pub device: ID3D12Device,
    pub command_queue: ID3D12CommandQueue,
    pub swap_chain: IDXGISwapChain3,
    pub fence: ID3D12Fence,
    fence_event: HANDLE,
    pub width: u32,
    pub height: u32,
}

impl Dx12Context {
    /// 在窗口上创建设备和交换链
    pub fn new(window: &Window) -> Result<Self> {
        let size = window.inner_size();
        let (width, height) = (size.width.max(1), size.height.max(1));
        let hwnd = window_hwnd(window)?;

        unsafe {
            #[cfg(debug_assertions)]
            {
                let mut debug: Option<ID3D12Debug> = None;
                match D3D12GetDebugInterface(&mut debug) {
                    Ok(()) => {
                        if let Some(debug) = debug {
                            debug.EnableDebugLayer();
                            debug!("DX12 Debug Layer enabled");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to enable DX12 Debug Layer"),
                }
            }

            let factory_flags = if cfg!(debug_assertions) {
                DXGI_CREATE_FACTORY_DEBUG
            } else {
                DXGI_CREATE_FACTORY_FLAGS(0)
            };
            let factory: IDXGIFactory4 = CreateDXGIFactory2(factory_flags)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create DXGI factory: {}", e)))?;

            let mut device: Option<ID3D12Device> = None;
            D3D12CreateDevice(None, D3D_FEATURE_LEVEL_11_0, &mut device)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create D3D12 device: {}", e)))?;
            let device = device
                .ok_or_else(|| GraphicsError::DeviceCreation("D3D12CreateDevice returned no device".to_string()))?;

            let queue_desc = D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                ..Default::default()
            };
            let command_queue: ID3D12CommandQueue = device
                .CreateCommandQueue(&queue_desc)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create command queue: {}", e)))?;

            let swap_chain_desc = DXGI_SWAP_CHAIN_DESC1 {
                Width: width,
                Height: height,
                Format: SWAP_CHAIN_BUFFER_FORMAT,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    ..Default::default()
                },
                BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                BufferCount: SWAP_CHAIN_BUFFER_COUNT,
                SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                ..Default::default()
            };
            let swap_chain: IDXGISwapChain1 = factory
                .CreateSwapChainForHwnd(&command_queue, hwnd, &swap_chain_desc, None, None)
                .map_err(|e| GraphicsError::SwapchainError(format!("Failed to create swap chain: {}", e)))?;
            let swap_chain: IDXGISwapChain3 = swap_chain
                .cast()
                .map_err(|e| GraphicsError::SwapchainError(format!("IDXGISwapChain3 unavailable: {}", e)))?;
            info!(width, height, buffers = SWAP_CHAIN_BUFFER_COUNT, "Swap chain created");

            let fence: ID3D12Fence = device
                .CreateFence(0, D3D12_FENCE_FLAG_NONE)
                .map_err(|e| GraphicsError::Synchronization(format!("Failed to create fence: {}", e)))?;
            let fence_event = CreateEventA(None, false, false, None)
                .map_err(|e| GraphicsError::Synchronization(format!("Failed to create fence event: {}", e)))?;

            debug!("DX12 context initialized");
            Ok(Self {
                device,
                command_queue,
                swap_chain,
                fence,
                fence_event,
                width,
                height,
            })
        }
    }

    /// 在队列上 Signal
    pub fn signal(&self, value: u64) -> Result<()> {
        unsafe {
            self.command_queue
                .Signal(&self.fence, value)
                .map_err(|e| GraphicsError::Synchronization(format!("Signal({}) failed: {}", value, e)).into())
        }
    }

    pub fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    /// 阻塞到围栏达到 `value`
    pub fn wait_for_value(&self, value: u64) -> Result<()> {
        unsafe {
            if self.fence.GetCompletedValue() < value {
                self.fence
                    .SetEventOnCompletion(value, self.fence_event)
                    .map_err(|e| GraphicsError::Synchronization(format!("SetEventOnCompletion failed: {}", e)))?;
                WaitForSingleObject(self.fence_event, INFINITE);
            }
        }
        Ok(())
    }

    /// 交换链的全部缓冲
    pub fn back_buffers(&self) -> Result<Vec<ID3D12Resource>> {
        (0..SWAP_CHAIN_BUFFER_COUNT)
            .map(|i| unsafe {
                self.swap_chain
                    .GetBuffer(i)
                    .map_err(|e| GraphicsError::SwapchainError(format!("GetBuffer({}) failed: {}", i, e)).into())
            })
            .collect()
    }

    pub fn current_back_buffer_index(&self) -> usize {
        unsafe { self.swap_chain.GetCurrentBackBufferIndex() as usize }
    }

    pub fn present(&self, vsync: bool) -> Result<()> {
        let interval = if vsync { 1 } else { 0 };
        unsafe {
            self.swap_chain
                .Present(interval, DXGI_PRESENT(0))
                .ok()
                .map_err(|e| GraphicsError::SwapchainError(format!("Present failed: {}", e)).into())
        }
    }

    /// 调整缓冲尺寸，调用前必须释放全部缓冲引用
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        unsafe {
            self.swap_chain
                .ResizeBuffers(
                    SWAP_CHAIN_BUFFER_COUNT,
                    width,
                    height,
                    SWAP_CHAIN_BUFFER_FORMAT,
                    DXGI_SWAP_CHAIN_FLAG(0),
                )
                .map_err(|e| GraphicsError::SwapchainError(format!("ResizeBuffers failed: {}", e)))?;
        }
        self.width = width;
        self.height = height;
        Ok(())
    }
}

impl Drop for Dx12Context {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.fence_event);
        }
    }
}

fn window_hwnd(window: &Window) -> Result<HWND> {
    let handle = window
        .window_handle()
        .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to get window handle: {}", e)))?;
    match handle.as_raw() {
        RawWindowHandle::Win32(win32) => Ok(HWND(win32.hwnd.get() as *mut core::ffi::c_void)),
        _ => Err(GraphicsError::DeviceCreation("Expected a Win32 window handle".to_string()).into()),
    }
}
