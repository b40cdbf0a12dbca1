//! GPU 设备接口
//!
//! `GpuBackend` 是沙盒对 GPU 的全部需求：提交资源、描述符、命令分配器、
//! 命令执行、围栏和交换链。`gfx::dx12` 用 D3D12 实现它，`gfx::headless`
//! 在 CPU 上执行命令并校验 D3D12 的状态规则。
//!
//! 上层代码只持有 `Device`，一个单线程共享句柄。

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use super::command::{Command, SubmitType};
use super::descriptor::{DescriptorHandle, DescriptorHeapKind, ViewDesc};
use super::pipeline::PipelineDesc;
use super::resource::{ClearValue, Format, HeapType, Resource, ResourceDesc, ResourceState};
use crate::core::error::Result;

/// 资源句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u64);

/// 命令分配器句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorHandle(pub u64);

/// 描述符堆句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHeapHandle(pub u64);

/// 管线状态（含根签名）句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

/// 已录制的 bundle 句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleHandle(pub u64);

/// 一次 ExecuteCommandLists 中的一个命令列表
pub struct SubmittedList<'a> {
    pub allocator: AllocatorHandle,
    pub pipeline: Option<PipelineHandle>,
    pub commands: &'a [Command],
}

/// 设备统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub executed_lists: u64,
    pub draw_calls: u64,
    pub presents: u64,
    pub live_resources: u64,
}

/// GPU 后端接口
pub trait GpuBackend {
    /// 后端名称，用于日志
    fn name(&self) -> &'static str;

    /// 创建提交资源（资源 + 隐式堆）
    fn create_committed_resource(
        &mut self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> Result<ResourceHandle>;

    fn release_resource(&mut self, resource: ResourceHandle) -> Result<()>;

    /// Map / memcpy / Unmap
    fn write_buffer(&mut self, resource: ResourceHandle, offset: u64, data: &[u8]) -> Result<()>;

    fn read_buffer(&mut self, resource: ResourceHandle, offset: u64, size: u64) -> Result<Vec<u8>>;

    fn create_descriptor_heap(&mut self, kind: DescriptorHeapKind, capacity: u32) -> Result<DescriptorHeapHandle>;

    fn release_descriptor_heap(&mut self, heap: DescriptorHeapHandle);

    /// 在描述符堆的一个槽位上创建视图
    fn create_view(&mut self, target: DescriptorHandle, view: &ViewDesc) -> Result<()>;

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle>;

    fn create_command_allocator(&mut self, kind: SubmitType) -> Result<AllocatorHandle>;

    fn reset_command_allocator(&mut self, allocator: AllocatorHandle) -> Result<()>;

    fn release_command_allocator(&mut self, allocator: AllocatorHandle);

    /// 把命令录制成可重放的 bundle
    fn record_bundle(
        &mut self,
        allocator: AllocatorHandle,
        pipeline: Option<PipelineHandle>,
        commands: &[Command],
    ) -> Result<BundleHandle>;

    fn release_bundle(&mut self, bundle: BundleHandle);

    /// 在直接队列上执行一批已关闭的命令列表
    fn execute_command_lists(&mut self, lists: &[SubmittedList<'_>]) -> Result<()>;

    /// 队列执行到此处时把围栏设置为 `value`
    fn signal(&mut self, value: u64) -> Result<()>;

    /// GPU 已完成的围栏值
    fn completed_value(&mut self) -> u64;

    /// 阻塞直到围栏达到 `value`
    fn wait_for_value(&mut self, value: u64) -> Result<()>;

    /// 交换链缓冲，按索引排列
    fn swap_chain_buffers(&self) -> Vec<ResourceHandle>;

    fn swap_chain_format(&self) -> Format;

    fn current_back_buffer_index(&self) -> usize;

    /// 交换链的宽高
    fn surface_size(&self) -> (u32, u32);

    fn present(&mut self, vsync: bool) -> Result<()>;

    /// 调整交换链尺寸，调用前必须已释放所有后备缓冲的视图并等待 GPU 空闲
    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()>;

    fn stats(&self) -> DeviceStats {
        DeviceStats::default()
    }
}

/// 设备句柄
///
/// 每个进程创建一次，克隆开销只是一次引用计数。
#[derive(Clone)]
pub struct Device {
    backend: Rc<RefCell<Box<dyn GpuBackend>>>,
}

impl Device {
    pub fn new(backend: Box<dyn GpuBackend>) -> Self {
        crate::gpu_info!(backend = backend.name(), "GPU device created");
        Self {
            backend: Rc::new(RefCell::new(backend)),
        }
    }

    /// 可变借用后端
    ///
    /// 单线程下借用只在一次调用内持有，不会重入。
    pub fn backend(&self) -> RefMut<'_, Box<dyn GpuBackend>> {
        self.backend.borrow_mut()
    }

    pub fn name(&self) -> &'static str {
        self.backend.borrow().name()
    }

    pub fn stats(&self) -> DeviceStats {
        self.backend.borrow().stats()
    }

    /// 创建提交资源
    pub fn create_committed_resource(
        &self,
        desc: ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> Result<Resource> {
        let handle = self
            .backend()
            .create_committed_resource(&desc, initial_state, clear_value)?;
        tracing::trace!(?handle, dimension = ?desc.dimension, width = desc.width, "Resource created");
        Ok(Resource::new(self.clone(), handle, desc, initial_state))
    }

    /// 创建缓冲区，上传堆缓冲初始状态必须是 GENERIC_READ
    pub fn create_buffer(&self, heap_type: HeapType, size: u64) -> Result<Resource> {
        let state = match heap_type {
            HeapType::Upload => ResourceState::GENERIC_READ,
            HeapType::Readback => ResourceState::COPY_DEST,
            HeapType::Default => ResourceState::COMMON,
        };
        self.create_committed_resource(ResourceDesc::buffer(heap_type, size), state, None)
    }

    /// 析构路径上的释放，后端正被借用时只记录警告
    pub(crate) fn release_resource(&self, handle: ResourceHandle) {
        match self.backend.try_borrow_mut() {
            Ok(mut backend) => {
                if let Err(e) = backend.release_resource(handle) {
                    crate::gpu_warn!(?handle, error = %e, "Resource release failed");
                }
            }
            Err(_) => crate::gpu_warn!(?handle, "Device busy, resource leaked"),
        }
    }

    pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut dyn GpuBackend) -> R) -> Option<R> {
        self.backend
            .try_borrow_mut()
            .ok()
            .map(|mut backend| f(backend.as_mut()))
    }

    /// 两个句柄是否指向同一个设备
    pub fn same_device(&self, other: &Device) -> bool {
        Rc::ptr_eq(&self.backend, &other.backend)
    }
}
