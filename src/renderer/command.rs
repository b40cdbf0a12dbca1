//! 命令录制
//!
//! - `CommandContainer` 持有一个命令分配器，记录最后一次提交的围栏值，
//!   在该值完成之前拒绝重置分配器
//! - `CommandList` 是 Closed / Recording 两态的状态机：`open` 相当于
//!   `Reset(allocator, pso)`，`close` 结束录制。Direct 列表由队列提交，
//!   Bundle 列表在关闭时录制到后端，之后可以被任意次重放
//!
//! 命令先记录成 `Command`，提交时由后端翻译成原生调用。

use std::cell::Cell;
use std::rc::Rc;

use super::descriptor::{DescriptorHandle, ResourceViewHeap};
use super::device::{AllocatorHandle, BundleHandle, DescriptorHeapHandle, Device, PipelineHandle, ResourceHandle};
use super::footprint::PlacedFootprint;
use super::resource::{IndexBufferView, Resource, ResourceState, VertexBufferView};
use super::sync::{CommandQueue, FenceValue};
use crate::core::error::{GraphicsError, Result, SandboxError};

/// 命令列表类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitType {
    /// 直接提交到队列
    Direct,
    /// 由直接列表重放
    Bundle,
}

/// 状态转换屏障（作用于全部子资源）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub resource: ResourceHandle,
    pub before: ResourceState,
    pub after: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// 覆盖整个渲染目标的视口
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
}

/// 录制的命令
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(Vec<TransitionBarrier>),
    CopyBufferRegion {
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        size: u64,
    },
    CopyTextureRegion {
        dst: ResourceHandle,
        dst_subresource: u32,
        src: ResourceHandle,
        src_footprint: PlacedFootprint,
    },
    SetPipeline(PipelineHandle),
    SetDescriptorHeap(DescriptorHeapHandle),
    SetRootDescriptorTable {
        index: u32,
        descriptor: DescriptorHandle,
    },
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    SetRenderTargets {
        rtv: DescriptorHandle,
        dsv: Option<DescriptorHandle>,
    },
    ClearRenderTarget {
        rtv: DescriptorHandle,
        color: [f32; 4],
    },
    ClearDepthStencil {
        dsv: DescriptorHandle,
        depth: f32,
        stencil: u8,
    },
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffer(VertexBufferView),
    SetIndexBuffer(IndexBufferView),
    DrawIndexedInstanced {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    ExecuteBundle(BundleHandle),
}

impl Command {
    /// bundle 中允许出现的命令
    pub fn allowed_in_bundle(&self) -> bool {
        matches!(
            self,
            Command::SetPipeline(_)
                | Command::SetRootDescriptorTable { .. }
                | Command::SetPrimitiveTopology(_)
                | Command::SetVertexBuffer(_)
                | Command::SetIndexBuffer(_)
                | Command::DrawIndexedInstanced { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Barrier(_) => "ResourceBarrier",
            Command::CopyBufferRegion { .. } => "CopyBufferRegion",
            Command::CopyTextureRegion { .. } => "CopyTextureRegion",
            Command::SetPipeline(_) => "SetPipelineState",
            Command::SetDescriptorHeap(_) => "SetDescriptorHeaps",
            Command::SetRootDescriptorTable { .. } => "SetGraphicsRootDescriptorTable",
            Command::SetViewport(_) => "RSSetViewports",
            Command::SetScissorRect(_) => "RSSetScissorRects",
            Command::SetRenderTargets { .. } => "OMSetRenderTargets",
            Command::ClearRenderTarget { .. } => "ClearRenderTargetView",
            Command::ClearDepthStencil { .. } => "ClearDepthStencilView",
            Command::SetPrimitiveTopology(_) => "IASetPrimitiveTopology",
            Command::SetVertexBuffer(_) => "IASetVertexBuffers",
            Command::SetIndexBuffer(_) => "IASetIndexBuffer",
            Command::DrawIndexedInstanced { .. } => "DrawIndexedInstanced",
            Command::ExecuteBundle(_) => "ExecuteBundle",
        }
    }
}

/// 分配器的共享状态，容器和从它创建的列表各持一份
#[derive(Debug, Default)]
struct AllocatorTracker {
    /// 最后一次引用该分配器的提交
    in_flight: Cell<FenceValue>,
    /// 是否有列表正在用该分配器录制
    recording: Cell<bool>,
}

/// 命令容器（命令分配器）
pub struct CommandContainer {
    device: Device,
    allocator: AllocatorHandle,
    submit_type: SubmitType,
    tracker: Rc<AllocatorTracker>,
}

impl CommandContainer {
    pub fn new(device: &Device, submit_type: SubmitType) -> Result<Self> {
        let allocator = device.backend().create_command_allocator(submit_type)?;

        Ok(Self {
            device: device.clone(),
            allocator,
            submit_type,
            tracker: Rc::new(AllocatorTracker::default()),
        })
    }

    pub fn submit_type(&self) -> SubmitType {
        self.submit_type
    }

    /// 从该分配器创建一个处于 Closed 状态的命令列表
    pub fn create_command_list(&self) -> CommandList {
        CommandList {
            device: self.device.clone(),
            allocator: self.allocator,
            submit_type: self.submit_type,
            tracker: Rc::clone(&self.tracker),
            recording: false,
            pipeline: None,
            commands: Vec::new(),
            bundle: None,
        }
    }

    /// 最后一次提交的围栏值
    pub fn in_flight_fence(&self) -> FenceValue {
        self.tracker.in_flight.get()
    }

    /// 重置分配器
    ///
    /// 引用它的命令仍在 GPU 上执行，或者仍有列表在录制时返回错误。
    pub fn clear_state(&self, queue: &CommandQueue) -> Result<()> {
        if self.tracker.recording.get() {
            return Err(SandboxError::validation(
                "command allocator reset while a list is still recording",
            ));
        }

        let pending = self.tracker.in_flight.get();
        if !queue.is_complete(pending) {
            return Err(GraphicsError::Synchronization(format!(
                "command allocator reset while fence {} is in flight (completed {})",
                pending.value(),
                queue.completed_value().value()
            ))
            .into());
        }

        self.device.backend().reset_command_allocator(self.allocator)
    }
}

impl Drop for CommandContainer {
    fn drop(&mut self) {
        let allocator = self.allocator;
        self.device
            .with_backend(|backend| backend.release_command_allocator(allocator));
    }
}

/// 命令列表
pub struct CommandList {
    device: Device,
    allocator: AllocatorHandle,
    submit_type: SubmitType,
    tracker: Rc<AllocatorTracker>,
    recording: bool,
    pipeline: Option<PipelineHandle>,
    commands: Vec<Command>,
    bundle: Option<BundleHandle>,
}

impl CommandList {
    /// 开始录制，`pipeline` 是初始管线状态
    pub fn open(&mut self, pipeline: Option<PipelineHandle>) -> Result<()> {
        if self.recording {
            return Err(SandboxError::validation("command list is already open"));
        }
        if self.tracker.recording.get() {
            return Err(SandboxError::validation(
                "another command list is recording on the same allocator",
            ));
        }

        if let Some(bundle) = self.bundle.take() {
            self.device.backend().release_bundle(bundle);
        }

        self.commands.clear();
        self.pipeline = pipeline;
        self.recording = true;
        self.tracker.recording.set(true);
        Ok(())
    }

    /// 结束录制，bundle 在此时录制到后端
    pub fn close(&mut self) -> Result<()> {
        if !self.recording {
            return Err(SandboxError::validation("command list is not open"));
        }
        self.recording = false;
        self.tracker.recording.set(false);

        if self.submit_type == SubmitType::Bundle {
            let bundle = self
                .device
                .backend()
                .record_bundle(self.allocator, self.pipeline, &self.commands)?;
            self.bundle = Some(bundle);
        }
        Ok(())
    }

    /// 放弃正在录制的命令，列表回到 Closed，不会被提交
    ///
    /// 录制中途出错时使用，之后分配器可以重置。列表未打开时什么也不做。
    pub fn abandon(&mut self) {
        if !self.recording {
            return;
        }
        tracing::debug!(commands = self.commands.len(), "Command list abandoned");
        self.commands.clear();
        self.recording = false;
        self.tracker.recording.set(false);
    }

    pub fn is_open(&self) -> bool {
        self.recording
    }

    pub fn submit_type(&self) -> SubmitType {
        self.submit_type
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn pipeline(&self) -> Option<PipelineHandle> {
        self.pipeline
    }

    /// 关闭后的 bundle 句柄
    pub fn bundle(&self) -> Option<BundleHandle> {
        self.bundle
    }

    pub(crate) fn allocator(&self) -> AllocatorHandle {
        self.allocator
    }

    /// 记录提交的围栏值，分配器在它完成前不能重置
    pub(crate) fn mark_submitted(&self, fence: FenceValue) {
        self.tracker.in_flight.set(fence);
    }

    fn record(&mut self, command: Command) -> Result<()> {
        if !self.recording {
            return Err(SandboxError::validation(format!(
                "{} recorded on a closed command list",
                command.name()
            )));
        }
        if self.submit_type == SubmitType::Bundle && !command.allowed_in_bundle() {
            return Err(SandboxError::validation(format!(
                "{} is not allowed in a bundle",
                command.name()
            )));
        }
        self.commands.push(command);
        Ok(())
    }

    /// 把资源转换到 `after` 状态，before 取自资源当前的录制状态
    pub fn transition(&mut self, resource: &Resource, after: ResourceState) -> Result<()> {
        self.transition_all(&[(resource, after)])
    }

    /// 一次提交多个转换屏障，已处于目标状态的资源被跳过
    ///
    /// 同一资源出现多次时按顺序衔接，后一个屏障的 before 是前一个的 after。
    pub fn transition_all(&mut self, transitions: &[(&Resource, ResourceState)]) -> Result<()> {
        let mut states: Vec<(&Resource, ResourceState)> = Vec::with_capacity(transitions.len());
        let mut barriers = Vec::new();
        for &(resource, after) in transitions {
            let slot = match states.iter().position(|(r, _)| r.handle() == resource.handle()) {
                Some(slot) => slot,
                None => {
                    states.push((resource, resource.state()));
                    states.len() - 1
                }
            };
            let before = states[slot].1;
            if before != after {
                barriers.push(TransitionBarrier {
                    resource: resource.handle(),
                    before,
                    after,
                });
                states[slot].1 = after;
            }
        }

        if barriers.is_empty() {
            return Ok(());
        }
        self.record(Command::Barrier(barriers))?;

        for (resource, state) in states {
            resource.set_state(state);
        }
        Ok(())
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &Resource,
        dst_offset: u64,
        src: &Resource,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let fits = |offset: u64, buffer: &Resource| {
            offset
                .checked_add(size)
                .is_some_and(|end| end <= buffer.size_in_bytes())
        };
        if !fits(dst_offset, dst) || !fits(src_offset, src) {
            return Err(SandboxError::validation(format!(
                "buffer copy of {} bytes out of range (dst {}+{}, src {}+{})",
                size,
                dst.size_in_bytes(),
                dst_offset,
                src.size_in_bytes(),
                src_offset
            )));
        }
        self.record(Command::CopyBufferRegion {
            dst: dst.handle(),
            dst_offset,
            src: src.handle(),
            src_offset,
            size,
        })
    }

    /// 从缓冲的放置布局拷贝到纹理子资源
    pub fn copy_texture_region(
        &mut self,
        dst: &Resource,
        dst_subresource: u32,
        src: &Resource,
        src_footprint: PlacedFootprint,
    ) -> Result<()> {
        if dst_subresource >= dst.desc().subresource_count() {
            return Err(SandboxError::validation(format!(
                "subresource {} out of range",
                dst_subresource
            )));
        }
        self.record(Command::CopyTextureRegion {
            dst: dst.handle(),
            dst_subresource,
            src: src.handle(),
            src_footprint,
        })
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.record(Command::SetPipeline(pipeline))
    }

    pub fn set_descriptor_heap(&mut self, heap: &ResourceViewHeap) -> Result<()> {
        self.record(Command::SetDescriptorHeap(heap.handle()))
    }

    pub fn set_root_descriptor_table(&mut self, index: u32, descriptor: DescriptorHandle) -> Result<()> {
        self.record(Command::SetRootDescriptorTable { index, descriptor })
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.record(Command::SetViewport(viewport))
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) -> Result<()> {
        self.record(Command::SetScissorRect(rect))
    }

    pub fn set_render_targets(&mut self, rtv: DescriptorHandle, dsv: Option<DescriptorHandle>) -> Result<()> {
        self.record(Command::SetRenderTargets { rtv, dsv })
    }

    pub fn clear_render_target(&mut self, rtv: DescriptorHandle, color: [f32; 4]) -> Result<()> {
        self.record(Command::ClearRenderTarget { rtv, color })
    }

    pub fn clear_depth_stencil(&mut self, dsv: DescriptorHandle, depth: f32, stencil: u8) -> Result<()> {
        self.record(Command::ClearDepthStencil { dsv, depth, stencil })
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) -> Result<()> {
        self.record(Command::SetPrimitiveTopology(topology))
    }

    pub fn set_vertex_buffer(&mut self, view: VertexBufferView) -> Result<()> {
        self.record(Command::SetVertexBuffer(view))
    }

    pub fn set_index_buffer(&mut self, view: IndexBufferView) -> Result<()> {
        self.record(Command::SetIndexBuffer(view))
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> Result<()> {
        self.record(Command::DrawIndexedInstanced {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        })
    }

    /// 重放一个已关闭的 bundle
    pub fn execute_bundle(&mut self, bundle: &CommandList) -> Result<()> {
        if self.submit_type != SubmitType::Direct {
            return Err(SandboxError::validation("bundles can only be executed from a direct list"));
        }
        let handle = bundle
            .bundle()
            .ok_or_else(|| SandboxError::validation("bundle has not been closed"))?;
        self.record(Command::ExecuteBundle(handle))
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if self.recording {
            self.tracker.recording.set(false);
        }
        if let Some(bundle) = self.bundle.take() {
            self.device.with_backend(|backend| backend.release_bundle(bundle));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::HeadlessBackend;
    use crate::renderer::resource::HeapType;

    fn setup() -> (Device, CommandQueue) {
        let device = Device::new(Box::new(HeadlessBackend::new(8, 8)));
        let queue = CommandQueue::new(&device);
        (device, queue)
    }

    #[test]
    fn test_open_close_state_machine() {
        let (device, _queue) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();

        assert!(!list.is_open());
        assert!(list.close().is_err());
        assert!(list.set_primitive_topology(PrimitiveTopology::TriangleList).is_err());

        list.open(None).unwrap();
        assert!(list.open(None).is_err());
        list.set_primitive_topology(PrimitiveTopology::TriangleList).unwrap();
        list.close().unwrap();
        assert_eq!(list.commands().len(), 1);

        // 重新打开会清空之前的命令
        list.open(None).unwrap();
        assert!(list.commands().is_empty());
        list.close().unwrap();
    }

    #[test]
    fn test_one_recording_list_per_allocator() {
        let (device, _queue) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut first = container.create_command_list();
        let mut second = container.create_command_list();

        first.open(None).unwrap();
        assert!(second.open(None).is_err());
        first.close().unwrap();
        second.open(None).unwrap();
        second.close().unwrap();
    }

    #[test]
    fn test_transition_tracks_state() {
        let (device, _queue) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        let buffer = device.create_buffer(HeapType::Default, 64).unwrap();

        list.open(None).unwrap();
        list.transition(&buffer, ResourceState::COPY_DEST).unwrap();
        list.transition(&buffer, ResourceState::COPY_DEST).unwrap();
        list.transition(&buffer, ResourceState::GENERIC_READ).unwrap();
        list.close().unwrap();

        assert_eq!(buffer.state(), ResourceState::GENERIC_READ);
        assert_eq!(
            list.commands(),
            &[
                Command::Barrier(vec![TransitionBarrier {
                    resource: buffer.handle(),
                    before: ResourceState::COMMON,
                    after: ResourceState::COPY_DEST,
                }]),
                Command::Barrier(vec![TransitionBarrier {
                    resource: buffer.handle(),
                    before: ResourceState::COPY_DEST,
                    after: ResourceState::GENERIC_READ,
                }]),
            ]
        );
    }

    #[test]
    fn test_bundle_rejects_barriers_and_copies() {
        let (device, _queue) = setup();
        let container = CommandContainer::new(&device, SubmitType::Bundle).unwrap();
        let mut bundle = container.create_command_list();
        let buffer = device.create_buffer(HeapType::Default, 64).unwrap();
        let staging = device.create_buffer(HeapType::Upload, 64).unwrap();

        bundle.open(None).unwrap();
        assert!(bundle.transition(&buffer, ResourceState::COPY_DEST).is_err());
        assert_eq!(buffer.state(), ResourceState::COMMON);
        assert!(bundle.copy_buffer_region(&buffer, 0, &staging, 0, 64).is_err());
        bundle.draw_indexed_instanced(3, 1, 0, 0, 0).unwrap();
        bundle.close().unwrap();
        assert!(bundle.bundle().is_some());
    }

    #[test]
    fn test_execute_bundle_requires_closed_bundle() {
        let (device, _queue) = setup();
        let direct = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let bundles = CommandContainer::new(&device, SubmitType::Bundle).unwrap();
        let mut list = direct.create_command_list();
        let mut bundle = bundles.create_command_list();

        list.open(None).unwrap();
        assert!(list.execute_bundle(&bundle).is_err());

        bundle.open(None).unwrap();
        bundle.close().unwrap();
        list.execute_bundle(&bundle).unwrap();
        list.close().unwrap();
    }

    #[test]
    fn test_copy_range_checked() {
        let (device, _queue) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        let dst = device.create_buffer(HeapType::Default, 64).unwrap();
        let src = device.create_buffer(HeapType::Upload, 32).unwrap();

        list.open(None).unwrap();
        assert!(list.copy_buffer_region(&dst, 0, &src, 0, 64).is_err());
        // 偏移加大小回绕到小值
        assert!(list.copy_buffer_region(&dst, u64::MAX - 7, &src, 0, 16).is_err());
        assert!(list.copy_buffer_region(&dst, 0, &src, u64::MAX, 2).is_err());
        list.copy_buffer_region(&dst, 32, &src, 0, 32).unwrap();
        list.close().unwrap();
        assert_eq!(list.commands().len(), 1);
    }

    #[test]
    fn test_transition_all_chains_repeated_resources() {
        let (device, _queue) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        let buffer = device.create_buffer(HeapType::Default, 64).unwrap();
        let other = device.create_buffer(HeapType::Default, 64).unwrap();

        list.open(None).unwrap();
        list.transition_all(&[
            (&buffer, ResourceState::COPY_DEST),
            (&other, ResourceState::COMMON),
            (&buffer, ResourceState::GENERIC_READ),
        ])
        .unwrap();
        list.close().unwrap();

        assert_eq!(buffer.state(), ResourceState::GENERIC_READ);
        assert_eq!(other.state(), ResourceState::COMMON);
        assert_eq!(
            list.commands(),
            &[Command::Barrier(vec![
                TransitionBarrier {
                    resource: buffer.handle(),
                    before: ResourceState::COMMON,
                    after: ResourceState::COPY_DEST,
                },
                TransitionBarrier {
                    resource: buffer.handle(),
                    before: ResourceState::COPY_DEST,
                    after: ResourceState::GENERIC_READ,
                },
            ])]
        );
    }

    #[test]
    fn test_abandon_releases_the_allocator() {
        let (device, queue) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();

        list.open(None).unwrap();
        list.draw_indexed_instanced(3, 1, 0, 0, 0).unwrap();
        assert!(container.clear_state(&queue).is_err());

        list.abandon();
        assert!(!list.is_open());
        assert!(list.commands().is_empty());
        container.clear_state(&queue).unwrap();

        list.open(None).unwrap();
        list.close().unwrap();
        list.abandon();
        queue.enqueue(&list).unwrap();
    }

    #[test]
    fn test_clear_state_refuses_in_flight_allocator() {
        let (device, queue) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();

        list.open(None).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();

        assert!(container.clear_state(&queue).is_err());
        queue.wait_for_execution().unwrap();
        container.clear_state(&queue).unwrap();
    }
}
