//! 描述符堆
//!
//! `ResourceViewHeap` 是固定容量的描述符堆，按顺序分配槽位并在槽位上
//! 创建 CBV、SRV、RTV 或 DSV。CBV/SRV/UAV 堆总是着色器可见的。

use std::cell::Cell;

use super::device::{DescriptorHeapHandle, Device, ResourceHandle};
use super::resource::{Format, Resource, ResourceDimension};
use crate::core::error::{GraphicsError, Result};

/// 描述符堆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// CBV / SRV / UAV，着色器可见
    CbvSrvUav,
    /// 渲染目标视图
    Rtv,
    /// 深度模板视图
    Dsv,
}

impl DescriptorHeapKind {
    pub fn name(&self) -> &'static str {
        match self {
            DescriptorHeapKind::CbvSrvUav => "CBV/SRV/UAV",
            DescriptorHeapKind::Rtv => "RTV",
            DescriptorHeapKind::Dsv => "DSV",
        }
    }

    pub fn is_shader_visible(&self) -> bool {
        matches!(self, DescriptorHeapKind::CbvSrvUav)
    }
}

/// SRV 维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SrvDimension {
    Texture1D,
    Texture2D,
    Texture2DArray,
    Texture3D,
    TextureCube,
}

/// 视图描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDesc {
    ConstantBuffer {
        resource: ResourceHandle,
        offset: u64,
        size: u32,
    },
    ShaderResource {
        resource: ResourceHandle,
        format: Format,
        dimension: SrvDimension,
        mip_levels: u32,
        array_size: u32,
    },
    RenderTarget {
        resource: ResourceHandle,
        format: Format,
    },
    DepthStencil {
        resource: ResourceHandle,
        format: Format,
    },
}

impl ViewDesc {
    /// 视图引用的资源
    pub fn resource(&self) -> ResourceHandle {
        match self {
            ViewDesc::ConstantBuffer { resource, .. }
            | ViewDesc::ShaderResource { resource, .. }
            | ViewDesc::RenderTarget { resource, .. }
            | ViewDesc::DepthStencil { resource, .. } => *resource,
        }
    }

    /// 视图可以放在哪类堆中
    pub fn heap_kind(&self) -> DescriptorHeapKind {
        match self {
            ViewDesc::ConstantBuffer { .. } | ViewDesc::ShaderResource { .. } => DescriptorHeapKind::CbvSrvUav,
            ViewDesc::RenderTarget { .. } => DescriptorHeapKind::Rtv,
            ViewDesc::DepthStencil { .. } => DescriptorHeapKind::Dsv,
        }
    }
}

/// 堆中的一个描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    pub heap: DescriptorHeapHandle,
    pub index: u32,
}

/// 资源视图堆
pub struct ResourceViewHeap {
    device: Device,
    handle: DescriptorHeapHandle,
    kind: DescriptorHeapKind,
    capacity: u32,
    next: Cell<u32>,
}

impl ResourceViewHeap {
    pub fn new(device: &Device, kind: DescriptorHeapKind, capacity: u32) -> Result<Self> {
        let handle = device.backend().create_descriptor_heap(kind, capacity)?;
        tracing::debug!(kind = kind.name(), capacity, "Descriptor heap created");

        Ok(Self {
            device: device.clone(),
            handle,
            kind,
            capacity,
            next: Cell::new(0),
        })
    }

    pub fn handle(&self) -> DescriptorHeapHandle {
        self.handle
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 已分配的槽位数
    pub fn len(&self) -> u32 {
        self.next.get()
    }

    pub fn is_empty(&self) -> bool {
        self.next.get() == 0
    }

    /// 回收全部槽位，之前的句柄随之失效
    pub fn reset(&self) {
        self.next.set(0);
    }

    /// 在下一个空闲槽位上创建视图
    pub fn create_view(&self, view: &ViewDesc) -> Result<DescriptorHandle> {
        if view.heap_kind() != self.kind {
            return Err(GraphicsError::ResourceCreation(format!(
                "{:?} cannot be placed in a {} heap",
                view,
                self.kind.name()
            ))
            .into());
        }

        let index = self.next.get();
        if index >= self.capacity {
            return Err(GraphicsError::ResourceCreation(format!(
                "{} heap is full ({} descriptors)",
                self.kind.name(),
                self.capacity
            ))
            .into());
        }

        let target = DescriptorHandle {
            heap: self.handle,
            index,
        };
        self.device.backend().create_view(target, view)?;
        self.next.set(index + 1);
        Ok(target)
    }

    /// 常量缓冲视图
    pub fn create_constant_buffer_view(&self, view: ViewDesc) -> Result<DescriptorHandle> {
        self.create_view(&view)
    }

    /// 纹理的着色资源视图，维度取自资源描述
    pub fn create_shader_resource_view(&self, texture: &Resource, cube: bool) -> Result<DescriptorHandle> {
        let desc = texture.desc();
        let dimension = match desc.dimension {
            ResourceDimension::Texture1D => SrvDimension::Texture1D,
            ResourceDimension::Texture3D => SrvDimension::Texture3D,
            ResourceDimension::Texture2D if cube => SrvDimension::TextureCube,
            ResourceDimension::Texture2D if desc.array_size() > 1 => SrvDimension::Texture2DArray,
            ResourceDimension::Texture2D => SrvDimension::Texture2D,
            ResourceDimension::Buffer => {
                return Err(GraphicsError::ResourceCreation(
                    "buffer shader resource views are not supported".to_string(),
                )
                .into())
            }
        };

        self.create_view(&ViewDesc::ShaderResource {
            resource: texture.handle(),
            format: desc.format,
            dimension,
            mip_levels: desc.mip_levels as u32,
            array_size: desc.array_size(),
        })
    }

    pub fn create_render_target_view(&self, target: &Resource) -> Result<DescriptorHandle> {
        self.create_view(&ViewDesc::RenderTarget {
            resource: target.handle(),
            format: target.desc().format,
        })
    }

    pub fn create_depth_stencil_view(&self, depth: &Resource) -> Result<DescriptorHandle> {
        self.create_view(&ViewDesc::DepthStencil {
            resource: depth.handle(),
            format: depth.desc().format,
        })
    }
}

impl Drop for ResourceViewHeap {
    fn drop(&mut self) {
        let handle = self.handle;
        self.device
            .with_backend(|backend| backend.release_descriptor_heap(handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::HeadlessBackend;
    use crate::renderer::resource::{HeapType, ResourceDesc, ResourceState};

    fn device() -> Device {
        Device::new(Box::new(HeadlessBackend::new(16, 16)))
    }

    #[test]
    fn test_sequential_allocation_and_capacity() {
        let device = device();
        let heap = ResourceViewHeap::new(&device, DescriptorHeapKind::CbvSrvUav, 2).unwrap();
        let buffer = device.create_buffer(HeapType::Upload, 512).unwrap();

        let view = ViewDesc::ConstantBuffer {
            resource: buffer.handle(),
            offset: 0,
            size: 256,
        };
        assert_eq!(heap.create_constant_buffer_view(view).unwrap().index, 0);
        assert_eq!(heap.create_constant_buffer_view(view).unwrap().index, 1);
        assert!(heap.create_constant_buffer_view(view).is_err());
        assert_eq!(heap.len(), 2);

        heap.reset();
        assert!(heap.is_empty());
    }

    #[test]
    fn test_view_kind_must_match_heap() {
        let device = device();
        let heap = ResourceViewHeap::new(&device, DescriptorHeapKind::Rtv, 4).unwrap();
        let texture = device
            .create_committed_resource(
                ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 4, 4, 1, 1),
                ResourceState::COMMON,
                None,
            )
            .unwrap();
        assert!(heap.create_shader_resource_view(&texture, false).is_err());
        assert!(heap.create_render_target_view(&texture).is_ok());
    }

    #[test]
    fn test_srv_dimension_from_desc() {
        let device = device();
        let heap = ResourceViewHeap::new(&device, DescriptorHeapKind::CbvSrvUav, 4).unwrap();
        let array = device
            .create_committed_resource(
                ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 4, 4, 6, 1),
                ResourceState::COMMON,
                None,
            )
            .unwrap();

        heap.create_shader_resource_view(&array, true).unwrap();
        heap.create_shader_resource_view(&array, false).unwrap();
        assert_eq!(heap.len(), 2);
    }
}
