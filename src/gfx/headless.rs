//! 无窗口校验设备
//!
//! 在 CPU 上实现 `GpuBackend`。提交的命令列表先进入队列，直到等待围栏时
//! 才按顺序执行，所以 CPU 与 GPU 的时序和真实队列一样是异步的：
//! 在等待之前释放被引用的资源、重置仍在执行的分配器都会被发现。
//!
//! 执行时校验沙盒依赖的 D3D12 规则：
//!
//! - 屏障的 before 状态必须等于资源在队列时间线上的当前状态
//! - 拷贝目标处于 COPY_DEST，拷贝源可读为 COPY_SOURCE
//! - 绘制时顶点/索引缓冲、根描述符表引用的资源处于可读状态，
//!   渲染目标处于 RENDER_TARGET，索引不越界
//! - Present 时后备缓冲处于 PRESENT
//!
//! 不做光栅化，渲染目标的内容不被模拟。

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::core::error::{GraphicsError, Result, SandboxError};
use crate::renderer::command::{Command, PrimitiveTopology, SubmitType};
use crate::renderer::descriptor::{DescriptorHandle, DescriptorHeapKind, ViewDesc};
use crate::renderer::device::{
    AllocatorHandle, BundleHandle, DescriptorHeapHandle, DeviceStats, GpuBackend, PipelineHandle,
    ResourceHandle, SubmittedList,
};
use crate::renderer::footprint::{
    copyable_footprints, PlacedFootprint, TEXTURE_DATA_PITCH_ALIGNMENT, TEXTURE_DATA_PLACEMENT_ALIGNMENT,
};
use crate::renderer::pipeline::{DescriptorRangeKind, PipelineDesc, RootTable};
use crate::renderer::resource::{
    ClearValue, Format, HeapType, IndexBufferView, ResourceDesc, ResourceFlags, ResourceState,
    VertexBufferView,
};

const SWAP_CHAIN_BUFFER_COUNT: usize = 2;
const SWAP_CHAIN_FORMAT: Format = Format::R8G8B8A8UnormSrgb;

struct ResourceEntry {
    desc: ResourceDesc,
    /// 队列时间线上的状态
    state: ResourceState,
    /// 每个子资源的紧密排列数据，纹理在第一次写入时分配
    subresources: Vec<Vec<u8>>,
}

struct HeapEntry {
    kind: DescriptorHeapKind,
    views: Vec<Option<ViewDesc>>,
}

struct PipelineEntry {
    root_tables: Vec<RootTable>,
}

struct BundleEntry {
    allocator: AllocatorHandle,
    pipeline: Option<PipelineHandle>,
    commands: Vec<Command>,
}

struct SubmittedBatch {
    allocator: AllocatorHandle,
    pipeline: Option<PipelineHandle>,
    commands: Vec<Command>,
}

enum QueueItem {
    Execute(Vec<SubmittedBatch>),
    Signal(u64),
    Present(ResourceHandle),
}

/// 命令执行时的管线状态
#[derive(Clone, Default)]
struct ExecState {
    pipeline: Option<PipelineHandle>,
    heap: Option<DescriptorHeapHandle>,
    root_tables: HashMap<u32, DescriptorHandle>,
    rtv: Option<DescriptorHandle>,
    dsv: Option<DescriptorHandle>,
    viewport: bool,
    scissor: bool,
    topology: Option<PrimitiveTopology>,
    vertex_buffer: Option<VertexBufferView>,
    index_buffer: Option<IndexBufferView>,
}

#[derive(Default)]
struct HeadlessState {
    next_id: u64,
    resources: HashMap<ResourceHandle, ResourceEntry>,
    heaps: HashMap<DescriptorHeapHandle, HeapEntry>,
    pipelines: HashMap<PipelineHandle, PipelineEntry>,
    allocators: HashMap<AllocatorHandle, SubmitType>,
    bundles: HashMap<BundleHandle, BundleEntry>,
    queue: VecDeque<QueueItem>,
    signaled: u64,
    completed: u64,
    swap_chain: Vec<ResourceHandle>,
    back_buffer_index: usize,
    width: u32,
    height: u32,
    stats: DeviceStats,
}

/// 无窗口校验设备
pub struct HeadlessBackend {
    state: Rc<RefCell<HeadlessState>>,
}

/// 测试用的只读视图，与设备共享状态
#[derive(Clone)]
pub struct HeadlessInspector {
    state: Rc<RefCell<HeadlessState>>,
}

impl HeadlessBackend {
    /// 创建设备与 `width` x `height` 的虚拟交换链
    pub fn new(width: u32, height: u32) -> Self {
        let backend = Self {
            state: Rc::new(RefCell::new(HeadlessState::default())),
        };
        backend.state.borrow_mut().create_swap_chain(width, height);
        backend
    }

    pub fn inspector(&self) -> HeadlessInspector {
        HeadlessInspector {
            state: Rc::clone(&self.state),
        }
    }
}

impl HeadlessInspector {
    /// 子资源当前内容（按 GPU 已完成的工作）
    pub fn subresource_bytes(&self, resource: ResourceHandle, subresource: u32) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        state
            .resources
            .get(&resource)?
            .subresources
            .get(subresource as usize)
            .cloned()
    }

    /// 资源在队列时间线上的状态
    pub fn resource_state(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.state.borrow().resources.get(&resource).map(|r| r.state)
    }

    pub fn is_live(&self, resource: ResourceHandle) -> bool {
        self.state.borrow().resources.contains_key(&resource)
    }

    /// 尚未执行的队列项
    pub fn pending_items(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn live_bundles(&self) -> usize {
        self.state.borrow().bundles.len()
    }

    pub fn stats(&self) -> DeviceStats {
        self.state.borrow().stats()
    }
}

fn validation(msg: impl Into<String>) -> SandboxError {
    SandboxError::validation(msg)
}

impl HeadlessState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            live_resources: self.resources.len() as u64,
            ..self.stats
        }
    }

    fn create_swap_chain(&mut self, width: u32, height: u32) {
        let mut desc = ResourceDesc::texture_2d(SWAP_CHAIN_FORMAT, width, height, 1, 1);
        desc.flags = ResourceFlags::ALLOW_RENDER_TARGET;

        self.swap_chain = (0..SWAP_CHAIN_BUFFER_COUNT)
            .map(|_| {
                let handle = ResourceHandle(self.allocate_id());
                self.resources.insert(
                    handle,
                    ResourceEntry {
                        desc: desc.clone(),
                        state: ResourceState::PRESENT,
                        subresources: vec![Vec::new()],
                    },
                );
                handle
            })
            .collect();
        self.back_buffer_index = 0;
        self.width = width;
        self.height = height;
    }

    fn resource(&self, handle: ResourceHandle) -> Result<&ResourceEntry> {
        self.resources
            .get(&handle)
            .ok_or_else(|| validation(format!("resource {} used after release", handle.0)))
    }

    fn resource_mut(&mut self, handle: ResourceHandle) -> Result<&mut ResourceEntry> {
        self.resources
            .get_mut(&handle)
            .ok_or_else(|| validation(format!("resource {} used after release", handle.0)))
    }

    fn view(&self, descriptor: DescriptorHandle) -> Result<ViewDesc> {
        self.heaps
            .get(&descriptor.heap)
            .and_then(|heap| heap.views.get(descriptor.index as usize))
            .copied()
            .flatten()
            .ok_or_else(|| {
                validation(format!(
                    "descriptor {} of heap {} is empty or released",
                    descriptor.index, descriptor.heap.0
                ))
            })
    }

    fn require_state(&self, resource: ResourceHandle, required: ResourceState, usage: &str) -> Result<()> {
        let current = self.resource(resource)?.state;
        let ok = if required.is_empty() {
            current.is_empty()
        } else {
            current.contains(required)
        };
        if !ok {
            return Err(validation(format!(
                "{} requires resource {} in {:?} but it is in {:?}",
                usage, resource.0, required, current
            )));
        }
        Ok(())
    }

    fn allocator_in_flight(&self, allocator: AllocatorHandle) -> bool {
        let uses_allocator = |command: &Command| match command {
            Command::ExecuteBundle(bundle) => self.bundles.get(bundle).map(|b| b.allocator) == Some(allocator),
            _ => false,
        };
        self.queue.iter().any(|item| match item {
            QueueItem::Execute(batches) => batches
                .iter()
                .any(|b| b.allocator == allocator || b.commands.iter().any(uses_allocator)),
            _ => false,
        })
    }

    /// 执行队列直到围栏达到 `value`
    fn drain_until(&mut self, value: u64) -> Result<()> {
        while self.completed < value {
            let Some(item) = self.queue.pop_front() else {
                break;
            };

            let result = match item {
                QueueItem::Execute(batches) => batches
                    .iter()
                    .try_for_each(|batch| self.execute_batch(batch)),
                QueueItem::Signal(v) => {
                    self.completed = v;
                    Ok(())
                }
                QueueItem::Present(back_buffer) => self
                    .require_state(back_buffer, ResourceState::PRESENT, "Present")
                    .map(|_| ()),
            };

            if let Err(e) = result {
                // 设备移除：丢弃剩余工作，避免之后的等待永远阻塞
                self.queue.clear();
                self.completed = self.signaled;
                tracing::error!(error = %e, "Headless device removed");
                return Err(e);
            }
        }
        Ok(())
    }

    fn execute_batch(&mut self, batch: &SubmittedBatch) -> Result<()> {
        let mut exec = ExecState {
            pipeline: batch.pipeline,
            ..ExecState::default()
        };
        for command in &batch.commands {
            self.execute_command(&mut exec, command, false)
                .map_err(|e| validation(format!("{}: {}", command.name(), e)))?;
        }
        Ok(())
    }

    fn execute_command(&mut self, exec: &mut ExecState, command: &Command, in_bundle: bool) -> Result<()> {
        match command {
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    if barrier.before == barrier.after {
                        return Err(validation("before and after states are identical"));
                    }
                    let entry = self.resource_mut(barrier.resource)?;
                    if entry.state != barrier.before {
                        return Err(validation(format!(
                            "before state {:?} does not match current state {:?} of resource {}",
                            barrier.before, entry.state, barrier.resource.0
                        )));
                    }
                    entry.state = barrier.after;
                }
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                self.require_state(*dst, ResourceState::COPY_DEST, "copy destination")?;
                self.require_state(*src, ResourceState::COPY_SOURCE, "copy source")?;

                let src_bytes = self.resource(*src)?.subresources[0]
                    .get(*src_offset as usize..(*src_offset + *size) as usize)
                    .ok_or_else(|| validation("copy source range out of bounds"))?
                    .to_vec();
                let dst_entry = self.resource_mut(*dst)?;
                dst_entry.subresources[0]
                    .get_mut(*dst_offset as usize..(*dst_offset + *size) as usize)
                    .ok_or_else(|| validation("copy destination range out of bounds"))?
                    .copy_from_slice(&src_bytes);
            }
            Command::CopyTextureRegion {
                dst,
                dst_subresource,
                src,
                src_footprint,
            } => {
                self.require_state(*dst, ResourceState::COPY_DEST, "copy destination")?;
                self.require_state(*src, ResourceState::COPY_SOURCE, "copy source")?;
                self.copy_texture(*dst, *dst_subresource, *src, src_footprint)?;
            }
            Command::SetPipeline(pipeline) => {
                if !self.pipelines.contains_key(pipeline) {
                    return Err(validation(format!("unknown pipeline {}", pipeline.0)));
                }
                exec.pipeline = Some(*pipeline);
            }
            Command::SetDescriptorHeap(heap) => {
                let entry = self
                    .heaps
                    .get(heap)
                    .ok_or_else(|| validation(format!("descriptor heap {} released", heap.0)))?;
                if entry.kind != DescriptorHeapKind::CbvSrvUav {
                    return Err(validation("only shader visible heaps can be bound"));
                }
                exec.heap = Some(*heap);
            }
            Command::SetRootDescriptorTable { index, descriptor } => {
                let pipeline = exec
                    .pipeline
                    .ok_or_else(|| validation("no root signature bound"))?;
                let table = self
                    .pipelines
                    .get(&pipeline)
                    .and_then(|p| p.root_tables.get(*index as usize))
                    .copied()
                    .ok_or_else(|| validation(format!("root parameter {} does not exist", index)))?;
                if exec.heap != Some(descriptor.heap) {
                    return Err(validation("descriptor table is not in the bound descriptor heap"));
                }
                let view = self.view(*descriptor)?;
                let matches = matches!(
                    (table.range, view),
                    (DescriptorRangeKind::Cbv, ViewDesc::ConstantBuffer { .. })
                        | (DescriptorRangeKind::Srv, ViewDesc::ShaderResource { .. })
                );
                if !matches {
                    return Err(validation(format!(
                        "root parameter {} expects {:?} but descriptor is {:?}",
                        index, table.range, view
                    )));
                }
                exec.root_tables.insert(*index, *descriptor);
            }
            Command::SetViewport(_) => exec.viewport = true,
            Command::SetScissorRect(_) => exec.scissor = true,
            Command::SetRenderTargets { rtv, dsv } => {
                if !matches!(self.view(*rtv)?, ViewDesc::RenderTarget { .. }) {
                    return Err(validation("render target descriptor is not an RTV"));
                }
                if let Some(dsv) = dsv {
                    if !matches!(self.view(*dsv)?, ViewDesc::DepthStencil { .. }) {
                        return Err(validation("depth stencil descriptor is not a DSV"));
                    }
                }
                exec.rtv = Some(*rtv);
                exec.dsv = *dsv;
            }
            Command::ClearRenderTarget { rtv, .. } => {
                let view = self.view(*rtv)?;
                self.require_state(view.resource(), ResourceState::RENDER_TARGET, "ClearRenderTargetView")?;
            }
            Command::ClearDepthStencil { dsv, .. } => {
                let view = self.view(*dsv)?;
                self.require_state(view.resource(), ResourceState::DEPTH_WRITE, "ClearDepthStencilView")?;
            }
            Command::SetPrimitiveTopology(topology) => exec.topology = Some(*topology),
            Command::SetVertexBuffer(view) => {
                self.resource(view.resource)?;
                exec.vertex_buffer = Some(*view);
            }
            Command::SetIndexBuffer(view) => {
                self.resource(view.resource)?;
                if !matches!(view.format, Format::R16Uint | Format::R32Uint) {
                    return Err(validation(format!("index format {:?} is not R16/R32", view.format)));
                }
                exec.index_buffer = Some(*view);
            }
            Command::DrawIndexedInstanced {
                index_count,
                start_index,
                base_vertex,
                ..
            } => {
                self.validate_draw(exec, *index_count, *start_index, *base_vertex)?;
                self.stats.draw_calls += 1;
            }
            Command::ExecuteBundle(bundle) => {
                if in_bundle {
                    return Err(validation("bundles cannot execute bundles"));
                }
                let (pipeline, commands) = {
                    let entry = self
                        .bundles
                        .get(bundle)
                        .ok_or_else(|| validation(format!("bundle {} released", bundle.0)))?;
                    (entry.pipeline, entry.commands.clone())
                };

                // bundle 继承描述符堆、渲染目标和视口，IA 状态从空开始
                let mut child = ExecState {
                    pipeline: pipeline.or(exec.pipeline),
                    topology: None,
                    vertex_buffer: None,
                    index_buffer: None,
                    ..exec.clone()
                };
                for command in &commands {
                    self.execute_command(&mut child, command, true)?;
                }
                exec.root_tables = child.root_tables;
            }
        }
        Ok(())
    }

    fn copy_texture(
        &mut self,
        dst: ResourceHandle,
        dst_subresource: u32,
        src: ResourceHandle,
        src_footprint: &PlacedFootprint,
    ) -> Result<()> {
        let dst_desc = self.resource(dst)?.desc.clone();
        if dst_desc.is_buffer() {
            return Err(validation("CopyTextureRegion destination is a buffer"));
        }
        if src_footprint.offset % TEXTURE_DATA_PLACEMENT_ALIGNMENT != 0 {
            return Err(validation("placed footprint offset is not 512-byte aligned"));
        }
        if src_footprint.footprint.row_pitch as u64 % TEXTURE_DATA_PITCH_ALIGNMENT != 0 {
            return Err(validation("placed footprint row pitch is not 256-byte aligned"));
        }

        let expected = copyable_footprints(&dst_desc, dst_subresource, 1, 0)?;
        let expected_fp = expected.layouts[0].footprint;
        let fp = src_footprint.footprint;
        if (fp.width, fp.height, fp.depth, fp.format)
            != (expected_fp.width, expected_fp.height, expected_fp.depth, expected_fp.format)
        {
            return Err(validation(format!(
                "footprint {:?} does not match subresource {} ({:?})",
                fp, dst_subresource, expected_fp
            )));
        }

        let rows = expected.num_rows[0] as usize;
        let row_size = expected.row_sizes[0] as usize;
        let depth = fp.depth as usize;
        let row_pitch = fp.row_pitch as usize;

        let mut tight = Vec::with_capacity(row_size * rows * depth);
        {
            let src_bytes = &self.resource(src)?.subresources[0];
            for z in 0..depth {
                for y in 0..rows {
                    let start = src_footprint.offset as usize + (z * rows + y) * row_pitch;
                    let row = src_bytes
                        .get(start..start + row_size)
                        .ok_or_else(|| validation("texture copy source out of bounds"))?;
                    tight.extend_from_slice(row);
                }
            }
        }

        let entry = self.resource_mut(dst)?;
        entry.subresources[dst_subresource as usize] = tight;
        Ok(())
    }

    fn validate_draw(&self, exec: &ExecState, index_count: u32, start_index: u32, base_vertex: i32) -> Result<()> {
        let pipeline = exec
            .pipeline
            .and_then(|p| self.pipelines.get(&p))
            .ok_or_else(|| validation("no pipeline bound"))?;
        if exec.topology.is_none() {
            return Err(validation("primitive topology not set"));
        }
        if !exec.viewport || !exec.scissor {
            return Err(validation("viewport or scissor rect not set"));
        }
        let rtv = exec.rtv.ok_or_else(|| validation("no render target bound"))?;
        self.require_state(self.view(rtv)?.resource(), ResourceState::RENDER_TARGET, "draw target")?;
        if let Some(dsv) = exec.dsv {
            self.require_state(self.view(dsv)?.resource(), ResourceState::DEPTH_WRITE, "depth target")?;
        }

        for index in 0..pipeline.root_tables.len() as u32 {
            let descriptor = exec
                .root_tables
                .get(&index)
                .ok_or_else(|| validation(format!("root parameter {} not bound", index)))?;
            match self.view(*descriptor)? {
                ViewDesc::ConstantBuffer { resource, .. } => {
                    self.require_state(resource, ResourceState::VERTEX_AND_CONSTANT_BUFFER, "constant buffer")?
                }
                ViewDesc::ShaderResource { resource, .. } => {
                    self.require_state(resource, ResourceState::PIXEL_SHADER_RESOURCE, "shader resource")?
                }
                _ => {}
            }
        }

        let vb = exec.vertex_buffer.ok_or_else(|| validation("no vertex buffer bound"))?;
        let ib = exec.index_buffer.ok_or_else(|| validation("no index buffer bound"))?;
        self.require_state(vb.resource, ResourceState::VERTEX_AND_CONSTANT_BUFFER, "vertex buffer")?;
        self.require_state(ib.resource, ResourceState::INDEX_BUFFER, "index buffer")?;

        let index_size = ib.format.bytes_per_pixel() as usize;
        let first = start_index as usize * index_size;
        let last = first + index_count as usize * index_size;
        if last > ib.size_in_bytes as usize {
            return Err(validation(format!(
                "{} indices from {} exceed index buffer of {} bytes",
                index_count, start_index, ib.size_in_bytes
            )));
        }

        let vertex_count = (vb.size_in_bytes / vb.stride.max(1)) as i64;
        let index_bytes = &self.resource(ib.resource)?.subresources[0];
        let indices = index_bytes
            .get(first..last)
            .ok_or_else(|| validation("index buffer contents out of range"))?;
        let max_index = if index_size == 2 {
            indices
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as i64)
                .max()
        } else {
            indices
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                .max()
        };
        if let Some(max_index) = max_index {
            if max_index + base_vertex as i64 >= vertex_count {
                return Err(validation(format!(
                    "index {} out of range for {} vertices",
                    max_index + base_vertex as i64,
                    vertex_count
                )));
            }
        }
        Ok(())
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_committed_resource(
        &mut self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        _clear_value: Option<ClearValue>,
    ) -> Result<ResourceHandle> {
        if desc.width == 0 || desc.height == 0 || desc.depth_or_array_size == 0 {
            return Err(GraphicsError::ResourceCreation("resource has a zero dimension".to_string()).into());
        }
        match desc.heap_type {
            HeapType::Upload if !desc.is_buffer() || initial_state != ResourceState::GENERIC_READ => {
                return Err(GraphicsError::ResourceCreation(
                    "upload heap resources must be buffers created in GENERIC_READ".to_string(),
                )
                .into());
            }
            HeapType::Readback if !desc.is_buffer() || initial_state != ResourceState::COPY_DEST => {
                return Err(GraphicsError::ResourceCreation(
                    "readback heap resources must be buffers created in COPY_DEST".to_string(),
                )
                .into());
            }
            _ => {}
        }

        let subresources = if desc.is_buffer() {
            vec![vec![0u8; desc.width as usize]]
        } else {
            vec![Vec::new(); desc.subresource_count() as usize]
        };

        let mut state = self.state.borrow_mut();
        let handle = ResourceHandle(state.allocate_id());
        state.resources.insert(
            handle,
            ResourceEntry {
                desc: desc.clone(),
                state: initial_state,
                subresources,
            },
        );
        Ok(handle)
    }

    fn release_resource(&mut self, resource: ResourceHandle) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.swap_chain.contains(&resource) {
            return Err(validation("swap chain buffers are owned by the swap chain"));
        }
        state
            .resources
            .remove(&resource)
            .map(|_| ())
            .ok_or_else(|| validation(format!("resource {} released twice", resource.0)))
    }

    fn write_buffer(&mut self, resource: ResourceHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let entry = state.resource_mut(resource)?;
        if entry.desc.heap_type != HeapType::Upload {
            return Err(validation("only upload heap buffers can be written by the CPU"));
        }
        let start = offset as usize;
        entry.subresources[0]
            .get_mut(start..start.saturating_add(data.len()))
            .ok_or_else(|| validation("buffer write out of range"))?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, resource: ResourceHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let state = self.state.borrow();
        let entry = state.resource(resource)?;
        if !entry.desc.heap_type.is_cpu_visible() || !entry.desc.is_buffer() {
            return Err(validation("only upload/readback buffers can be read by the CPU"));
        }
        entry.subresources[0]
            .get(offset as usize..offset.saturating_add(size) as usize)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| validation("buffer read out of range"))
    }

    fn create_descriptor_heap(&mut self, kind: DescriptorHeapKind, capacity: u32) -> Result<DescriptorHeapHandle> {
        let mut state = self.state.borrow_mut();
        let handle = DescriptorHeapHandle(state.allocate_id());
        state.heaps.insert(
            handle,
            HeapEntry {
                kind,
                views: vec![None; capacity as usize],
            },
        );
        Ok(handle)
    }

    fn release_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        self.state.borrow_mut().heaps.remove(&heap);
    }

    fn create_view(&mut self, target: DescriptorHandle, view: &ViewDesc) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let resource_desc = state.resource(view.resource())?.desc.clone();

        match view {
            ViewDesc::ConstantBuffer { offset, size, .. } => {
                if offset % 256 != 0 || size % 256 != 0 || offset + *size as u64 > resource_desc.width {
                    return Err(validation("constant buffer view must be 256-byte aligned and in range"));
                }
            }
            ViewDesc::RenderTarget { .. } if !resource_desc.flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) => {
                return Err(validation("resource does not allow render target views"));
            }
            ViewDesc::DepthStencil { .. } if !resource_desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) => {
                return Err(validation("resource does not allow depth stencil views"));
            }
            _ => {}
        }

        let heap = state
            .heaps
            .get_mut(&target.heap)
            .ok_or_else(|| validation(format!("descriptor heap {} released", target.heap.0)))?;
        if heap.kind != view.heap_kind() {
            return Err(validation("view does not belong in this heap type"));
        }
        let slot = heap
            .views
            .get_mut(target.index as usize)
            .ok_or_else(|| validation("descriptor index out of range"))?;
        *slot = Some(*view);
        Ok(())
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        let mut state = self.state.borrow_mut();
        let handle = PipelineHandle(state.allocate_id());
        state.pipelines.insert(
            handle,
            PipelineEntry {
                root_tables: desc.root_tables.clone(),
            },
        );
        Ok(handle)
    }

    fn create_command_allocator(&mut self, kind: SubmitType) -> Result<AllocatorHandle> {
        let mut state = self.state.borrow_mut();
        let handle = AllocatorHandle(state.allocate_id());
        state.allocators.insert(handle, kind);
        Ok(handle)
    }

    fn reset_command_allocator(&mut self, allocator: AllocatorHandle) -> Result<()> {
        let state = self.state.borrow();
        if !state.allocators.contains_key(&allocator) {
            return Err(validation(format!("command allocator {} released", allocator.0)));
        }
        if state.allocator_in_flight(allocator) {
            return Err(validation("command allocator reset while its commands are executing"));
        }
        Ok(())
    }

    fn release_command_allocator(&mut self, allocator: AllocatorHandle) {
        self.state.borrow_mut().allocators.remove(&allocator);
    }

    fn record_bundle(
        &mut self,
        allocator: AllocatorHandle,
        pipeline: Option<PipelineHandle>,
        commands: &[Command],
    ) -> Result<BundleHandle> {
        let mut state = self.state.borrow_mut();
        if state.allocators.get(&allocator) != Some(&SubmitType::Bundle) {
            return Err(validation("bundles must be recorded on a bundle allocator"));
        }
        if let Some(command) = commands.iter().find(|c| !c.allowed_in_bundle()) {
            return Err(validation(format!("{} is not allowed in a bundle", command.name())));
        }
        let handle = BundleHandle(state.allocate_id());
        state.bundles.insert(
            handle,
            BundleEntry {
                allocator,
                pipeline,
                commands: commands.to_vec(),
            },
        );
        Ok(handle)
    }

    fn release_bundle(&mut self, bundle: BundleHandle) {
        self.state.borrow_mut().bundles.remove(&bundle);
    }

    fn execute_command_lists(&mut self, lists: &[SubmittedList<'_>]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let mut batches = Vec::with_capacity(lists.len());
        for list in lists {
            if state.allocators.get(&list.allocator) != Some(&SubmitType::Direct) {
                return Err(validation("only direct command lists can be executed on the queue"));
            }
            batches.push(SubmittedBatch {
                allocator: list.allocator,
                pipeline: list.pipeline,
                commands: list.commands.to_vec(),
            });
        }
        state.stats.executed_lists += lists.len() as u64;
        state.queue.push_back(QueueItem::Execute(batches));
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if value <= state.signaled {
            return Err(GraphicsError::Synchronization(format!(
                "fence value {} is not greater than {}",
                value, state.signaled
            ))
            .into());
        }
        state.signaled = value;
        state.queue.push_back(QueueItem::Signal(value));
        Ok(())
    }

    fn completed_value(&mut self) -> u64 {
        self.state.borrow().completed
    }

    fn wait_for_value(&mut self, value: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if value > state.signaled {
            return Err(GraphicsError::Synchronization(format!(
                "waiting for fence {} that was never signaled",
                value
            ))
            .into());
        }
        state.drain_until(value)
    }

    fn swap_chain_buffers(&self) -> Vec<ResourceHandle> {
        self.state.borrow().swap_chain.clone()
    }

    fn swap_chain_format(&self) -> Format {
        SWAP_CHAIN_FORMAT
    }

    fn current_back_buffer_index(&self) -> usize {
        self.state.borrow().back_buffer_index
    }

    fn surface_size(&self) -> (u32, u32) {
        let state = self.state.borrow();
        (state.width, state.height)
    }

    fn present(&mut self, _vsync: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let back_buffer = state.swap_chain[state.back_buffer_index];
        state.queue.push_back(QueueItem::Present(back_buffer));
        state.back_buffer_index = (state.back_buffer_index + 1) % SWAP_CHAIN_BUFFER_COUNT;
        state.stats.presents += 1;
        Ok(())
    }

    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.queue.is_empty() {
            return Err(GraphicsError::SwapchainError(
                "swap chain resized while GPU work is pending".to_string(),
            )
            .into());
        }
        for handle in std::mem::take(&mut state.swap_chain) {
            state.resources.remove(&handle);
        }
        state.create_swap_chain(width, height);
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        self.state.borrow().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::command::{CommandContainer, ScissorRect, Viewport};
    use crate::renderer::descriptor::ResourceViewHeap;
    use crate::renderer::device::Device;
    use crate::renderer::resource::Resource;
    use crate::renderer::sync::CommandQueue;
    use crate::renderer::upload::UploadContext;

    fn setup() -> (Device, CommandQueue, HeadlessInspector) {
        let backend = HeadlessBackend::new(4, 4);
        let inspector = backend.inspector();
        let device = Device::new(Box::new(backend));
        let queue = CommandQueue::new(&device);
        (device, queue, inspector)
    }

    fn back_buffer(device: &Device) -> Resource {
        let handle = {
            let backend = device.backend();
            backend.swap_chain_buffers()[backend.current_back_buffer_index()]
        };
        let mut desc = ResourceDesc::texture_2d(SWAP_CHAIN_FORMAT, 4, 4, 1, 1);
        desc.flags = ResourceFlags::ALLOW_RENDER_TARGET;
        Resource::swap_chain_buffer(device.clone(), handle, desc)
    }

    #[test]
    fn test_barrier_before_state_mismatch() {
        let (device, queue, _inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        let buffer = device.create_buffer(HeapType::Default, 16).unwrap();

        // 录制时的状态被篡改，执行时 before 状态对不上
        list.open(None).unwrap();
        buffer.set_state(ResourceState::COPY_DEST);
        list.transition(&buffer, ResourceState::GENERIC_READ).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();

        let err = queue.wait_for_execution().unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_copy_requires_copy_dest() {
        let (device, queue, _inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        let dst = device.create_buffer(HeapType::Default, 16).unwrap();
        let src = device.create_buffer(HeapType::Upload, 16).unwrap();

        list.open(None).unwrap();
        list.copy_buffer_region(&dst, 0, &src, 0, 16).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();
        assert!(queue.wait_for_execution().is_err());
    }

    #[test]
    fn test_work_is_deferred_until_wait() {
        let (device, queue, inspector) = setup();
        let mut uploader = UploadContext::new(&device).unwrap();
        let buffer = uploader.create_default_buffer(&[1, 2, 3, 4]).unwrap();
        assert_eq!(inspector.resource_state(buffer.handle()), Some(ResourceState::COMMON));
        assert_eq!(inspector.pending_items(), 0);
        uploader.finish(&queue).unwrap();
        assert_eq!(inspector.pending_items(), 0);
        assert_eq!(inspector.resource_state(buffer.handle()), Some(ResourceState::GENERIC_READ));
    }

    #[test]
    fn test_present_requires_present_state() {
        let (device, queue, _inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        let target = back_buffer(&device);

        list.open(None).unwrap();
        list.transition(&target, ResourceState::RENDER_TARGET).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();
        device.backend().present(false).unwrap();
        queue.flush().unwrap_err();
    }

    #[test]
    fn test_clear_and_present_cycle() {
        let (device, queue, inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let rtv_heap = ResourceViewHeap::new(&device, DescriptorHeapKind::Rtv, 1).unwrap();
        let target = back_buffer(&device);
        let rtv = rtv_heap.create_render_target_view(&target).unwrap();
        let mut list = container.create_command_list();

        list.open(None).unwrap();
        list.transition(&target, ResourceState::RENDER_TARGET).unwrap();
        list.set_render_targets(rtv, None).unwrap();
        list.clear_render_target(rtv, [0.0, 0.0, 0.0, 1.0]).unwrap();
        list.transition(&target, ResourceState::PRESENT).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();
        device.backend().present(false).unwrap();
        queue.flush().unwrap();

        assert_eq!(inspector.stats().presents, 1);
        assert_eq!(device.backend().current_back_buffer_index(), 1);
    }

    #[test]
    fn test_draw_validates_bindings() {
        let (device, queue, _inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let rtv_heap = ResourceViewHeap::new(&device, DescriptorHeapKind::Rtv, 1).unwrap();
        let target = back_buffer(&device);
        let rtv = rtv_heap.create_render_target_view(&target).unwrap();
        let mut list = container.create_command_list();

        list.open(None).unwrap();
        list.transition(&target, ResourceState::RENDER_TARGET).unwrap();
        list.set_render_targets(rtv, None).unwrap();
        list.set_viewport(Viewport::full(4, 4)).unwrap();
        list.set_scissor_rect(ScissorRect::full(4, 4)).unwrap();
        list.draw_indexed_instanced(3, 1, 0, 0, 0).unwrap();
        list.transition(&target, ResourceState::PRESENT).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();

        let err = queue.wait_for_execution().unwrap_err();
        assert!(err.to_string().contains("no pipeline bound"));
        // 设备移除后等待不再阻塞
        queue.flush().unwrap();
    }

    #[test]
    fn test_allocator_reset_while_executing() {
        let (device, queue, _inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        list.open(None).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();

        let allocator = list.allocator();
        assert!(device.backend().reset_command_allocator(allocator).is_err());
        queue.wait_for_execution().unwrap();
        assert!(device.backend().reset_command_allocator(allocator).is_ok());
    }

    #[test]
    fn test_resize_requires_idle_queue() {
        let (device, queue, _inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        list.open(None).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();

        assert!(device.backend().resize_swap_chain(8, 8).is_err());
        queue.wait_for_execution().unwrap();
        device.backend().resize_swap_chain(8, 8).unwrap();
        assert_eq!(device.backend().surface_size(), (8, 8));
    }

    #[test]
    fn test_upload_heap_rules() {
        let (device, _queue, _inspector) = setup();
        let texture = device.create_committed_resource(
            ResourceDesc {
                heap_type: HeapType::Upload,
                ..ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 4, 4, 1, 1)
            },
            ResourceState::GENERIC_READ,
            None,
        );
        assert!(texture.is_err());
    }
}
