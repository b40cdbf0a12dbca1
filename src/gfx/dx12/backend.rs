//! DirectX 12 后端
//!
//! 句柄到 D3D12 对象的映射表。录制好的 `Command` 在执行时翻译成
//! ID3D12GraphicsCommandList 调用；每个直接分配器配一个可复用的命令列表，
//! 提交时用 `Reset(allocator, pso)` 重新打开。

use std::collections::HashMap;
use std::mem::ManuallyDrop;

use tracing::{debug, info, trace};
use windows::core::Interface;
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use winit::window::Window;

use super::context::Dx12Context;
use super::descriptor::Dx12DescriptorHeap;
use super::pipeline::Dx12Pipeline;
use crate::core::error::{GraphicsError, Result};
use crate::renderer::command::{Command, PrimitiveTopology, SubmitType};
use crate::renderer::descriptor::{DescriptorHandle, DescriptorHeapKind, SrvDimension, ViewDesc};
use crate::renderer::device::{
    AllocatorHandle, BundleHandle, DescriptorHeapHandle, DeviceStats, GpuBackend, PipelineHandle, ResourceHandle,
    SubmittedList,
};
use crate::renderer::pipeline::PipelineDesc;
use crate::renderer::resource::{
    ClearValue, Format, HeapType, ResourceDesc, ResourceDimension, ResourceFlags, ResourceState, TextureLayout,
};

/// D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING
const DEFAULT_SHADER_COMPONENT_MAPPING: u32 = 0x1688;

pub(crate) fn dxgi_format(format: Format) -> DXGI_FORMAT {
    DXGI_FORMAT(format.dxgi() as i32)
}

fn resource_states(state: ResourceState) -> D3D12_RESOURCE_STATES {
    D3D12_RESOURCE_STATES(state.bits() as i32)
}

struct Dx12Allocator {
    allocator: ID3D12CommandAllocator,
    kind: SubmitType,
    /// 首次提交时创建，之后复用
    list: Option<ID3D12GraphicsCommandList>,
}

struct Dx12Bundle {
    list: ID3D12GraphicsCommandList,
    draw_calls: u64,
}

pub struct Dx12Backend {
    context: Dx12Context,
    resources: HashMap<ResourceHandle, ID3D12Resource>,
    heaps: HashMap<DescriptorHeapHandle, Dx12DescriptorHeap>,
    pipelines: HashMap<PipelineHandle, Dx12Pipeline>,
    allocators: HashMap<AllocatorHandle, Dx12Allocator>,
    bundles: HashMap<BundleHandle, Dx12Bundle>,
    swap_chain: Vec<ResourceHandle>,
    next_id: u64,
    stats: DeviceStats,
}

impl Dx12Backend {
    pub fn new(window: &Window) -> Result<Self> {
        let context = Dx12Context::new(window)?;
        let mut backend = Self {
            context,
            resources: HashMap::new(),
            heaps: HashMap::new(),
            pipelines: HashMap::new(),
            allocators: HashMap::new(),
            bundles: HashMap::new(),
            swap_chain: Vec::new(),
            next_id: 1,
            stats: DeviceStats::default(),
        };
        backend.register_back_buffers()?;
        info!(width = backend.context.width, height = backend.context.height, "DX12 backend ready");
        Ok(backend)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// 交换链缓冲登记为普通资源，调整尺寸时沿用原句柄
    fn register_back_buffers(&mut self) -> Result<()> {
        let buffers = self.context.back_buffers()?;
        if self.swap_chain.is_empty() {
            self.swap_chain = (0..buffers.len()).map(|_| ResourceHandle(self.next_id())).collect();
        }
        for (handle, buffer) in self.swap_chain.iter().zip(buffers) {
            self.resources.insert(*handle, buffer);
        }
        Ok(())
    }

    fn resource(&self, handle: ResourceHandle) -> Result<&ID3D12Resource> {
        self.resources
            .get(&handle)
            .ok_or_else(|| GraphicsError::Validation(format!("unknown resource {:?}", handle)).into())
    }

    fn heap(&self, handle: DescriptorHeapHandle) -> Result<&Dx12DescriptorHeap> {
        self.heaps
            .get(&handle)
            .ok_or_else(|| GraphicsError::Validation(format!("unknown descriptor heap {:?}", handle)).into())
    }

    fn pipeline(&self, handle: PipelineHandle) -> Result<&Dx12Pipeline> {
        self.pipelines
            .get(&handle)
            .ok_or_else(|| GraphicsError::Validation(format!("unknown pipeline {:?}", handle)).into())
    }

    fn cpu_handle(&self, descriptor: DescriptorHandle) -> Result<D3D12_CPU_DESCRIPTOR_HANDLE> {
        self.heap(descriptor.heap)?.cpu_handle(descriptor.index)
    }

    fn mapped<R>(&self, handle: ResourceHandle, f: impl FnOnce(*mut u8) -> R) -> Result<R> {
        let resource = self.resource(handle)?;
        unsafe {
            let mut data = std::ptr::null_mut();
            resource
                .Map(0, None, Some(&mut data))
                .map_err(|e| GraphicsError::ResourceCreation(format!("Map failed: {}", e)))?;
            let result = f(data as *mut u8);
            resource.Unmap(0, None);
            Ok(result)
        }
    }

    /// 把录制的命令翻译到一个打开的命令列表，返回绘制次数
    fn translate(&self, list: &ID3D12GraphicsCommandList, commands: &[Command]) -> Result<u64> {
        let mut draw_calls = 0;
        unsafe {
            for command in commands {
                match command {
                    Command::Barrier(barriers) => {
                        let barriers = barriers
                            .iter()
                            .map(|b| {
                                Ok(transition_barrier(
                                    self.resource(b.resource)?,
                                    resource_states(b.before),
                                    resource_states(b.after),
                                ))
                            })
                            .collect::<Result<Vec<_>>>()?;
                        list.ResourceBarrier(&barriers);
                    }
                    Command::CopyBufferRegion {
                        dst,
                        dst_offset,
                        src,
                        src_offset,
                        size,
                    } => {
                        list.CopyBufferRegion(self.resource(*dst)?, *dst_offset, self.resource(*src)?, *src_offset, *size);
                    }
                    Command::CopyTextureRegion {
                        dst,
                        dst_subresource,
                        src,
                        src_footprint,
                    } => {
                        let dst_location = D3D12_TEXTURE_COPY_LOCATION {
                            pResource: std::mem::transmute_copy(self.resource(*dst)?),
                            Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                                SubresourceIndex: *dst_subresource,
                            },
                        };
                        let footprint = &src_footprint.footprint;
                        let src_location = D3D12_TEXTURE_COPY_LOCATION {
                            pResource: std::mem::transmute_copy(self.resource(*src)?),
                            Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                                PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                                    Offset: src_footprint.offset,
                                    Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                                        Format: dxgi_format(footprint.format),
                                        Width: footprint.width,
                                        Height: footprint.height,
                                        Depth: footprint.depth,
                                        RowPitch: footprint.row_pitch,
                                    },
                                },
                            },
                        };
                        list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None);
                    }
                    Command::SetPipeline(handle) => {
                        let pipeline = self.pipeline(*handle)?;
                        list.SetPipelineState(&pipeline.state);
                        list.SetGraphicsRootSignature(&pipeline.root_signature);
                    }
                    Command::SetDescriptorHeap(handle) => {
                        list.SetDescriptorHeaps(&[Some(self.heap(*handle)?.heap().clone())]);
                    }
                    Command::SetRootDescriptorTable { index, descriptor } => {
                        let gpu = self.heap(descriptor.heap)?.gpu_handle(descriptor.index)?;
                        list.SetGraphicsRootDescriptorTable(*index, gpu);
                    }
                    Command::SetViewport(viewport) => {
                        list.RSSetViewports(&[D3D12_VIEWPORT {
                            TopLeftX: viewport.x,
                            TopLeftY: viewport.y,
                            Width: viewport.width,
                            Height: viewport.height,
                            MinDepth: viewport.min_depth,
                            MaxDepth: viewport.max_depth,
                        }]);
                    }
                    Command::SetScissorRect(rect) => {
                        list.RSSetScissorRects(&[RECT {
                            left: rect.left,
                            top: rect.top,
                            right: rect.right,
                            bottom: rect.bottom,
                        }]);
                    }
                    Command::SetRenderTargets { rtv, dsv } => {
                        let rtv = self.cpu_handle(*rtv)?;
                        let dsv = dsv.map(|d| self.cpu_handle(d)).transpose()?;
                        list.OMSetRenderTargets(1, Some(&rtv), false, dsv.as_ref().map(|d| d as *const _));
                    }
                    Command::ClearRenderTarget { rtv, color } => {
                        list.ClearRenderTargetView(self.cpu_handle(*rtv)?, color, None);
                    }
                    Command::ClearDepthStencil { dsv, depth, stencil } => {
                        list.ClearDepthStencilView(
                            self.cpu_handle(*dsv)?,
                            D3D12_CLEAR_FLAG_DEPTH | D3D12_CLEAR_FLAG_STENCIL,
                            *depth,
                            *stencil,
                            None,
                        );
                    }
                    Command::SetPrimitiveTopology(topology) => {
                        let topology = match topology {
                            PrimitiveTopology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
                        };
                        list.IASetPrimitiveTopology(topology);
                    }
                    Command::SetVertexBuffer(view) => {
                        list.IASetVertexBuffers(
                            0,
                            Some(&[D3D12_VERTEX_BUFFER_VIEW {
                                BufferLocation: self.resource(view.resource)?.GetGPUVirtualAddress(),
                                SizeInBytes: view.size_in_bytes,
                                StrideInBytes: view.stride,
                            }]),
                        );
                    }
                    Command::SetIndexBuffer(view) => {
                        list.IASetIndexBuffer(Some(&D3D12_INDEX_BUFFER_VIEW {
                            BufferLocation: self.resource(view.resource)?.GetGPUVirtualAddress(),
                            SizeInBytes: view.size_in_bytes,
                            Format: dxgi_format(view.format),
                        }));
                    }
                    Command::DrawIndexedInstanced {
                        index_count,
                        instance_count,
                        start_index,
                        base_vertex,
                        start_instance,
                    } => {
                        list.DrawIndexedInstanced(*index_count, *instance_count, *start_index, *base_vertex, *start_instance);
                        draw_calls += 1;
                    }
                    Command::ExecuteBundle(handle) => {
                        let bundle = self
                            .bundles
                            .get(handle)
                            .ok_or_else(|| GraphicsError::Validation(format!("unknown bundle {:?}", handle)))?;
                        list.ExecuteBundle(&bundle.list);
                        draw_calls += bundle.draw_calls;
                    }
                }
            }
        }
        Ok(draw_calls)
    }

    /// 打开分配器对应的命令列表，首次使用时创建
    fn open_list(&mut self, handle: AllocatorHandle, pipeline: Option<PipelineHandle>) -> Result<ID3D12GraphicsCommandList> {
        let pso = pipeline.map(|p| self.pipeline(p).map(|p| p.state.clone())).transpose()?;
        let device = self.context.device.clone();
        let allocator = self
            .allocators
            .get_mut(&handle)
            .ok_or_else(|| GraphicsError::Validation(format!("unknown allocator {:?}", handle)))?;

        unsafe {
            match &allocator.list {
                Some(list) => {
                    list.Reset(&allocator.allocator, pso.as_ref())
                        .map_err(|e| GraphicsError::CommandExecution(format!("Command list reset failed: {}", e)))?;
                    Ok(list.clone())
                }
                None => {
                    let list: ID3D12GraphicsCommandList = device
                        .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator.allocator, pso.as_ref())
                        .map_err(|e| GraphicsError::CommandExecution(format!("Failed to create command list: {}", e)))?;
                    allocator.list = Some(list.clone());
                    Ok(list)
                }
            }
        }
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // 不增加引用计数，屏障数组生命周期内资源由映射表持有
                pResource: unsafe { std::mem::transmute_copy(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn command_list_type(kind: SubmitType) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        SubmitType::Direct => D3D12_COMMAND_LIST_TYPE_DIRECT,
        SubmitType::Bundle => D3D12_COMMAND_LIST_TYPE_BUNDLE,
    }
}

fn resource_desc(desc: &ResourceDesc) -> D3D12_RESOURCE_DESC {
    let dimension = match desc.dimension {
        ResourceDimension::Buffer => D3D12_RESOURCE_DIMENSION_BUFFER,
        ResourceDimension::Texture1D => D3D12_RESOURCE_DIMENSION_TEXTURE1D,
        ResourceDimension::Texture2D => D3D12_RESOURCE_DIMENSION_TEXTURE2D,
        ResourceDimension::Texture3D => D3D12_RESOURCE_DIMENSION_TEXTURE3D,
    };
    let layout = match desc.layout {
        TextureLayout::Unknown => D3D12_TEXTURE_LAYOUT_UNKNOWN,
        TextureLayout::RowMajor => D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
    };
    let mut flags = D3D12_RESOURCE_FLAG_NONE;
    if desc.flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
    }

    D3D12_RESOURCE_DESC {
        Dimension: dimension,
        Alignment: 0,
        Width: desc.width,
        Height: desc.height,
        DepthOrArraySize: desc.depth_or_array_size,
        MipLevels: desc.mip_levels,
        Format: dxgi_format(desc.format),
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Layout: layout,
        Flags: flags,
    }
}

fn clear_value(value: &ClearValue) -> D3D12_CLEAR_VALUE {
    match *value {
        ClearValue::Color { format, color } => D3D12_CLEAR_VALUE {
            Format: dxgi_format(format),
            Anonymous: D3D12_CLEAR_VALUE_0 { Color: color },
        },
        ClearValue::DepthStencil { format, depth, stencil } => D3D12_CLEAR_VALUE {
            Format: dxgi_format(format),
            Anonymous: D3D12_CLEAR_VALUE_0 {
                DepthStencil: D3D12_DEPTH_STENCIL_VALUE {
                    Depth: depth,
                    Stencil: stencil,
                },
            },
        },
    }
}

fn srv_desc(format: Format, dimension: SrvDimension, mip_levels: u32, array_size: u32) -> D3D12_SHADER_RESOURCE_VIEW_DESC {
    let (view_dimension, anonymous) = match dimension {
        SrvDimension::Texture1D => (
            D3D12_SRV_DIMENSION_TEXTURE1D,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture1D: D3D12_TEX1D_SRV {
                    MipLevels: mip_levels,
                    ..Default::default()
                },
            },
        ),
        SrvDimension::Texture2D => (
            D3D12_SRV_DIMENSION_TEXTURE2D,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_SRV {
                    MipLevels: mip_levels,
                    ..Default::default()
                },
            },
        ),
        SrvDimension::Texture2DArray => (
            D3D12_SRV_DIMENSION_TEXTURE2DARRAY,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2DArray: D3D12_TEX2D_ARRAY_SRV {
                    MipLevels: mip_levels,
                    ArraySize: array_size,
                    ..Default::default()
                },
            },
        ),
        SrvDimension::Texture3D => (
            D3D12_SRV_DIMENSION_TEXTURE3D,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture3D: D3D12_TEX3D_SRV {
                    MipLevels: mip_levels,
                    ..Default::default()
                },
            },
        ),
        SrvDimension::TextureCube => (
            D3D12_SRV_DIMENSION_TEXTURECUBE,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                TextureCube: D3D12_TEXCUBE_SRV {
                    MipLevels: mip_levels,
                    ..Default::default()
                },
            },
        ),
    };

    D3D12_SHADER_RESOURCE_VIEW_DESC {
        Format: dxgi_format(format),
        ViewDimension: view_dimension,
        Shader4ComponentMapping: DEFAULT_SHADER_COMPONENT_MAPPING,
        Anonymous: anonymous,
    }
}

impl GpuBackend for Dx12Backend {
    fn name(&self) -> &'static str {
        "dx12"
    }

    fn create_committed_resource(
        &mut self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear: Option<ClearValue>,
    ) -> Result<ResourceHandle> {
        let heap_props = D3D12_HEAP_PROPERTIES {
            Type: match desc.heap_type {
                HeapType::Default => D3D12_HEAP_TYPE_DEFAULT,
                HeapType::Upload => D3D12_HEAP_TYPE_UPLOAD,
                HeapType::Readback => D3D12_HEAP_TYPE_READBACK,
            },
            ..Default::default()
        };
        let native_desc = resource_desc(desc);
        let clear = clear.as_ref().map(clear_value);

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.context
                .device
                .CreateCommittedResource(
                    &heap_props,
                    D3D12_HEAP_FLAG_NONE,
                    &native_desc,
                    resource_states(initial_state),
                    clear.as_ref().map(|c| c as *const _),
                    &mut resource,
                )
                .map_err(|e| GraphicsError::ResourceCreation(format!("CreateCommittedResource failed: {}", e)))?;
        }
        let resource = resource
            .ok_or_else(|| GraphicsError::ResourceCreation("CreateCommittedResource returned no resource".to_string()))?;

        let handle = ResourceHandle(self.next_id());
        self.resources.insert(handle, resource);
        Ok(handle)
    }

    fn release_resource(&mut self, resource: ResourceHandle) -> Result<()> {
        self.resources
            .remove(&resource)
            .map(|_| ())
            .ok_or_else(|| GraphicsError::Validation(format!("release of unknown resource {:?}", resource)).into())
    }

    fn write_buffer(&mut self, resource: ResourceHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.mapped(resource, |ptr| unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        })
    }

    fn read_buffer(&mut self, resource: ResourceHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.mapped(resource, |ptr| unsafe {
            std::slice::from_raw_parts(ptr.add(offset as usize), size as usize).to_vec()
        })
    }

    fn create_descriptor_heap(&mut self, kind: DescriptorHeapKind, capacity: u32) -> Result<DescriptorHeapHandle> {
        let heap = Dx12DescriptorHeap::new(&self.context.device, kind, capacity)?;
        let handle = DescriptorHeapHandle(self.next_id());
        debug!(kind = kind.name(), capacity, "Descriptor heap created");
        self.heaps.insert(handle, heap);
        Ok(handle)
    }

    fn release_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        self.heaps.remove(&heap);
    }

    fn create_view(&mut self, target: DescriptorHandle, view: &ViewDesc) -> Result<()> {
        let cpu = self.cpu_handle(target)?;
        let resource = self.resource(view.resource())?;
        let device = &self.context.device;

        unsafe {
            match *view {
                ViewDesc::ConstantBuffer { offset, size, .. } => {
                    device.CreateConstantBufferView(
                        Some(&D3D12_CONSTANT_BUFFER_VIEW_DESC {
                            BufferLocation: resource.GetGPUVirtualAddress() + offset,
                            SizeInBytes: size,
                        }),
                        cpu,
                    );
                }
                ViewDesc::ShaderResource {
                    format,
                    dimension,
                    mip_levels,
                    array_size,
                    ..
                } => {
                    let desc = srv_desc(format, dimension, mip_levels, array_size);
                    device.CreateShaderResourceView(resource, Some(&desc), cpu);
                }
                ViewDesc::RenderTarget { format, .. } => {
                    let desc = D3D12_RENDER_TARGET_VIEW_DESC {
                        Format: dxgi_format(format),
                        ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                        Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_RTV::default(),
                        },
                    };
                    device.CreateRenderTargetView(resource, Some(&desc), cpu);
                }
                ViewDesc::DepthStencil { format, .. } => {
                    let desc = D3D12_DEPTH_STENCIL_VIEW_DESC {
                        Format: dxgi_format(format),
                        ViewDimension: D3D12_DSV_DIMENSION_TEXTURE2D,
                        Flags: D3D12_DSV_FLAG_NONE,
                        Anonymous: D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_DSV::default(),
                        },
                    };
                    device.CreateDepthStencilView(resource, Some(&desc), cpu);
                }
            }
        }
        Ok(())
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        let pipeline = Dx12Pipeline::new(&self.context.device, desc)?;
        let handle = PipelineHandle(self.next_id());
        self.pipelines.insert(handle, pipeline);
        Ok(handle)
    }

    fn create_command_allocator(&mut self, kind: SubmitType) -> Result<AllocatorHandle> {
        let allocator: ID3D12CommandAllocator = unsafe {
            self.context
                .device
                .CreateCommandAllocator(command_list_type(kind))
                .map_err(|e| GraphicsError::CommandExecution(format!("Failed to create command allocator: {}", e)))?
        };
        let handle = AllocatorHandle(self.next_id());
        self.allocators.insert(
            handle,
            Dx12Allocator {
                allocator,
                kind,
                list: None,
            },
        );
        Ok(handle)
    }

    fn reset_command_allocator(&mut self, allocator: AllocatorHandle) -> Result<()> {
        let entry = self
            .allocators
            .get(&allocator)
            .ok_or_else(|| GraphicsError::Validation(format!("unknown allocator {:?}", allocator)))?;
        unsafe {
            entry
                .allocator
                .Reset()
                .map_err(|e| GraphicsError::CommandExecution(format!("Command allocator reset failed: {}", e)).into())
        }
    }

    fn release_command_allocator(&mut self, allocator: AllocatorHandle) {
        self.allocators.remove(&allocator);
    }

    fn record_bundle(
        &mut self,
        allocator: AllocatorHandle,
        pipeline: Option<PipelineHandle>,
        commands: &[Command],
    ) -> Result<BundleHandle> {
        let entry = self
            .allocators
            .get(&allocator)
            .ok_or_else(|| GraphicsError::Validation(format!("unknown allocator {:?}", allocator)))?;
        if entry.kind != SubmitType::Bundle {
            return Err(GraphicsError::Validation("bundles need a bundle allocator".to_string()).into());
        }
        let pipeline = pipeline.map(|p| self.pipeline(p)).transpose()?;

        let (list, draw_calls) = unsafe {
            let list: ID3D12GraphicsCommandList = self
                .context
                .device
                .CreateCommandList(
                    0,
                    D3D12_COMMAND_LIST_TYPE_BUNDLE,
                    &entry.allocator,
                    pipeline.map(|p| &p.state),
                )
                .map_err(|e| GraphicsError::CommandExecution(format!("Failed to create bundle: {}", e)))?;
            if let Some(pipeline) = pipeline {
                list.SetGraphicsRootSignature(&pipeline.root_signature);
            }
            let draw_calls = self.translate(&list, commands)?;
            list.Close()
                .map_err(|e| GraphicsError::CommandExecution(format!("Bundle close failed: {}", e)))?;
            (list, draw_calls)
        };

        let handle = BundleHandle(self.next_id());
        self.bundles.insert(handle, Dx12Bundle { list, draw_calls });
        trace!(?handle, commands = commands.len(), "Bundle recorded");
        Ok(handle)
    }

    fn release_bundle(&mut self, bundle: BundleHandle) {
        self.bundles.remove(&bundle);
    }

    fn execute_command_lists(&mut self, lists: &[SubmittedList<'_>]) -> Result<()> {
        let mut native = Vec::with_capacity(lists.len());
        for submitted in lists {
            let list = self.open_list(submitted.allocator, submitted.pipeline)?;
            unsafe {
                if let Some(pipeline) = submitted.pipeline {
                    list.SetGraphicsRootSignature(&self.pipeline(pipeline)?.root_signature);
                }
                let draw_calls = self.translate(&list, submitted.commands)?;
                list.Close()
                    .map_err(|e| GraphicsError::CommandExecution(format!("Command list close failed: {}", e)))?;
                self.stats.draw_calls += draw_calls;
            }
            let list: ID3D12CommandList = list
                .cast()
                .map_err(|e| GraphicsError::CommandExecution(format!("ID3D12CommandList cast failed: {}", e)))?;
            native.push(Some(list));
        }

        unsafe {
            self.context.command_queue.ExecuteCommandLists(&native);
        }
        self.stats.executed_lists += lists.len() as u64;
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        self.context.signal(value)
    }

    fn completed_value(&mut self) -> u64 {
        self.context.completed_value()
    }

    fn wait_for_value(&mut self, value: u64) -> Result<()> {
        self.context.wait_for_value(value)
    }

    fn swap_chain_buffers(&self) -> Vec<ResourceHandle> {
        self.swap_chain.clone()
    }

    fn swap_chain_format(&self) -> Format {
        Format::R8G8B8A8UnormSrgb
    }

    fn current_back_buffer_index(&self) -> usize {
        self.context.current_back_buffer_index()
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.context.width, self.context.height)
    }

    fn present(&mut self, vsync: bool) -> Result<()> {
        self.context.present(vsync)?;
        self.stats.presents += 1;
        Ok(())
    }

    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()> {
        // ResizeBuffers 要求交换链缓冲没有任何外部引用
        for handle in &self.swap_chain {
            self.resources.remove(handle);
        }
        self.context.resize(width, height)?;
        self.register_back_buffers()?;
        info!(width, height, "Swap chain resized");
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            live_resources: self.resources.len().saturating_sub(self.swap_chain.len()) as u64,
            ..self.stats
        }
    }
}
