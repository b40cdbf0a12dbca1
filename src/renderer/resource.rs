//! 资源管理模块
//!
//! GPU 资源的描述、状态与所有权。
//!
//! - `ResourceDesc`：提交资源（committed resource）的创建参数
//! - `ResourceState`：与 `D3D12_RESOURCE_STATES` 数值一致的状态位
//! - `Resource`：拥有一个后端分配，记录录制时的当前状态，析构时释放
//! - `ConstantBuffer<T>`：按 256 字节对齐的常量缓冲区

use std::cell::Cell;
use std::marker::PhantomData;

use bitflags::bitflags;
use bytemuck::Pod;

use super::descriptor::ViewDesc;
use super::device::{Device, ResourceHandle};
use crate::core::error::{GraphicsError, Result};

/// 常量缓冲区元素对齐（D3D12_CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT）
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// 向上对齐到 `alignment`（必须是 2 的幂）
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// 资源所在的堆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// GPU 本地内存，CPU 不可访问
    Default,
    /// CPU 写入、GPU 读取
    Upload,
    /// GPU 写入、CPU 读取
    Readback,
}

impl HeapType {
    /// CPU 是否可以映射该堆上的资源
    pub fn is_cpu_visible(&self) -> bool {
        !matches!(self, HeapType::Default)
    }
}

/// 资源维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

/// 纹理内存布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureLayout {
    /// 由驱动决定
    Unknown,
    /// 行主序（缓冲区必须使用）
    RowMajor,
}

bitflags! {
    /// 资源创建标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u32 {
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
    }
}

bitflags! {
    /// 资源状态
    ///
    /// 数值与 `D3D12_RESOURCE_STATES` 一致，可以直接转换为原生状态。
    /// `COMMON` 与 `PRESENT` 都是 0。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const GENERIC_READ = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
        const PRESENT = 0;
    }
}

impl ResourceState {
    /// 只读状态可以同时组合，写状态必须独占
    pub fn is_read_only(&self) -> bool {
        !self.intersects(
            ResourceState::RENDER_TARGET
                | ResourceState::UNORDERED_ACCESS
                | ResourceState::DEPTH_WRITE
                | ResourceState::COPY_DEST,
        )
    }
}

/// 像素格式
///
/// 沙盒用到的 DXGI 格式子集，`dxgi()` 返回对应的 DXGI_FORMAT 数值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    R32G32B32A32Float,
    R32G32B32Float,
    R16G16B16A16Float,
    R32G32Float,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    D32Float,
    R32Uint,
    D24UnormS8Uint,
    R16Uint,
    R8Unorm,
    Bc1Unorm,
    Bc1UnormSrgb,
    Bc2Unorm,
    Bc2UnormSrgb,
    Bc3Unorm,
    Bc3UnormSrgb,
    Bc4Unorm,
    Bc5Unorm,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    Bc7Unorm,
    Bc7UnormSrgb,
}

impl Format {
    const TABLE: [(Format, u32); 24] = [
        (Format::Unknown, 0),
        (Format::R32G32B32A32Float, 2),
        (Format::R32G32B32Float, 6),
        (Format::R16G16B16A16Float, 10),
        (Format::R32G32Float, 16),
        (Format::R8G8B8A8Unorm, 28),
        (Format::R8G8B8A8UnormSrgb, 29),
        (Format::D32Float, 40),
        (Format::R32Uint, 42),
        (Format::D24UnormS8Uint, 45),
        (Format::R16Uint, 57),
        (Format::R8Unorm, 61),
        (Format::Bc1Unorm, 71),
        (Format::Bc1UnormSrgb, 72),
        (Format::Bc2Unorm, 74),
        (Format::Bc2UnormSrgb, 75),
        (Format::Bc3Unorm, 77),
        (Format::Bc3UnormSrgb, 78),
        (Format::Bc4Unorm, 80),
        (Format::Bc5Unorm, 83),
        (Format::B8G8R8A8Unorm, 87),
        (Format::B8G8R8A8UnormSrgb, 91),
        (Format::Bc7Unorm, 98),
        (Format::Bc7UnormSrgb, 99),
    ];

    /// DXGI_FORMAT 数值
    pub fn dxgi(&self) -> u32 {
        Self::TABLE
            .iter()
            .find(|(format, _)| format == self)
            .map(|(_, value)| *value)
            .unwrap_or(0)
    }

    /// 从 DXGI_FORMAT 数值转换，不支持的格式返回 `None`
    pub fn from_dxgi(value: u32) -> Option<Format> {
        Self::TABLE
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(format, _)| *format)
    }

    /// 是否为 4x4 块压缩格式
    pub fn is_block_compressed(&self) -> bool {
        self.block_bytes().is_some()
    }

    /// 块压缩格式每个 4x4 块的字节数
    pub fn block_bytes(&self) -> Option<u32> {
        match self {
            Format::Bc1Unorm | Format::Bc1UnormSrgb | Format::Bc4Unorm => Some(8),
            Format::Bc2Unorm
            | Format::Bc2UnormSrgb
            | Format::Bc3Unorm
            | Format::Bc3UnormSrgb
            | Format::Bc5Unorm
            | Format::Bc7Unorm
            | Format::Bc7UnormSrgb => Some(16),
            _ => None,
        }
    }

    /// 非压缩格式每个像素的字节数
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Format::R32G32B32A32Float => 16,
            Format::R32G32B32Float => 12,
            Format::R16G16B16A16Float | Format::R32G32Float => 8,
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8UnormSrgb
            | Format::B8G8R8A8Unorm
            | Format::B8G8R8A8UnormSrgb
            | Format::D32Float
            | Format::R32Uint
            | Format::D24UnormS8Uint => 4,
            Format::R16Uint => 2,
            Format::R8Unorm => 1,
            _ => 0,
        }
    }

    /// 是否为深度模板格式
    pub fn is_depth(&self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint)
    }
}

/// 提交资源的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub heap_type: HeapType,
    pub dimension: ResourceDimension,
    /// 缓冲区为字节数，纹理为像素宽度
    pub width: u64,
    pub height: u32,
    /// 3D 纹理为深度，其余为数组大小
    pub depth_or_array_size: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub layout: TextureLayout,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    /// 缓冲区描述
    pub fn buffer(heap_type: HeapType, size: u64) -> Self {
        Self {
            heap_type,
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: Format::Unknown,
            layout: TextureLayout::RowMajor,
            flags: ResourceFlags::empty(),
        }
    }

    /// 默认堆上的 2D 纹理（或纹理数组）
    pub fn texture_2d(format: Format, width: u32, height: u32, array_size: u16, mip_levels: u16) -> Self {
        Self {
            heap_type: HeapType::Default,
            dimension: ResourceDimension::Texture2D,
            width: width as u64,
            height,
            depth_or_array_size: array_size,
            mip_levels,
            format,
            layout: TextureLayout::Unknown,
            flags: ResourceFlags::empty(),
        }
    }

    /// 默认堆上的 3D 纹理
    pub fn texture_3d(format: Format, width: u32, height: u32, depth: u16, mip_levels: u16) -> Self {
        Self {
            dimension: ResourceDimension::Texture3D,
            depth_or_array_size: depth,
            ..Self::texture_2d(format, width, height, 1, mip_levels)
        }
    }

    /// 深度模板缓冲
    pub fn depth_stencil(format: Format, width: u32, height: u32) -> Self {
        Self {
            flags: ResourceFlags::ALLOW_DEPTH_STENCIL,
            ..Self::texture_2d(format, width, height, 1, 1)
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    /// 数组切片数量，3D 纹理恒为 1
    pub fn array_size(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Texture3D | ResourceDimension::Buffer => 1,
            _ => self.depth_or_array_size as u32,
        }
    }

    /// 子资源总数 = mip 数 × 数组大小
    pub fn subresource_count(&self) -> u32 {
        if self.is_buffer() {
            1
        } else {
            self.mip_levels.max(1) as u32 * self.array_size()
        }
    }
}

/// 渲染目标或深度缓冲的优化清除值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color { format: Format, color: [f32; 4] },
    DepthStencil { format: Format, depth: f32, stencil: u8 },
}

/// 顶点缓冲视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub resource: ResourceHandle,
    pub size_in_bytes: u32,
    pub stride: u32,
}

/// 索引缓冲视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub resource: ResourceHandle,
    pub size_in_bytes: u32,
    pub format: Format,
}

/// GPU 资源
///
/// 拥有后端分配的资源句柄，析构时释放。`state` 是录制命令时
/// 的状态：每条屏障命令都会更新它，下一条屏障以它作为 before 状态。
pub struct Resource {
    device: Device,
    handle: ResourceHandle,
    desc: ResourceDesc,
    state: Cell<ResourceState>,
    owned: bool,
}

impl Resource {
    pub(crate) fn new(device: Device, handle: ResourceHandle, desc: ResourceDesc, state: ResourceState) -> Self {
        Self {
            device,
            handle,
            desc,
            state: Cell::new(state),
            owned: true,
        }
    }

    /// 交换链缓冲由交换链持有，这里只做状态跟踪，析构时不释放
    pub(crate) fn swap_chain_buffer(device: Device, handle: ResourceHandle, desc: ResourceDesc) -> Self {
        Self {
            device,
            handle,
            desc,
            state: Cell::new(ResourceState::PRESENT),
            owned: false,
        }
    }

    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// 录制时的当前状态
    pub fn state(&self) -> ResourceState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        self.state.set(state);
    }

    /// 缓冲区字节数
    pub fn size_in_bytes(&self) -> u64 {
        self.desc.width
    }

    /// 写入 CPU 可见的缓冲区（Map / memcpy / Unmap）
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.desc.heap_type.is_cpu_visible() || !self.desc.is_buffer() {
            return Err(GraphicsError::ResourceCreation(
                "only upload/readback buffers can be mapped".to_string(),
            )
            .into());
        }
        if offset
            .checked_add(data.len() as u64)
            .map_or(true, |end| end > self.desc.width)
        {
            return Err(GraphicsError::ResourceCreation(format!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                self.desc.width
            ))
            .into());
        }
        self.device.backend().write_buffer(self.handle, offset, data)
    }

    /// 写入一组 Pod 值
    pub fn write_pod<T: Pod>(&self, offset: u64, values: &[T]) -> Result<()> {
        self.write(offset, bytemuck::cast_slice(values))
    }

    /// 读取 CPU 可见的缓冲区
    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.device.backend().read_buffer(self.handle, offset, size)
    }

    /// 视图能描述的字节数，超过 4 GiB 的缓冲无法绑定
    fn view_size(&self) -> Result<u32> {
        u32::try_from(self.desc.width).map_err(|_| {
            GraphicsError::ResourceCreation(format!("buffer of {} bytes is too large for a view", self.desc.width)).into()
        })
    }

    /// 顶点缓冲视图
    pub fn vertex_buffer_view(&self, stride: u32) -> Result<VertexBufferView> {
        Ok(VertexBufferView {
            resource: self.handle,
            size_in_bytes: self.view_size()?,
            stride,
        })
    }

    /// 索引缓冲视图，`format` 必须是 R16Uint 或 R32Uint
    pub fn index_buffer_view(&self, format: Format) -> Result<IndexBufferView> {
        Ok(IndexBufferView {
            resource: self.handle,
            size_in_bytes: self.view_size()?,
            format,
        })
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if self.owned {
            self.device.release_resource(self.handle);
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("handle", &self.handle)
            .field("dimension", &self.desc.dimension)
            .field("state", &self.state.get())
            .finish()
    }
}

/// 常量缓冲区
///
/// 上传堆上的 `count` 个 `T`，每个元素按 256 字节对齐。
pub struct ConstantBuffer<T: Pod> {
    resource: Resource,
    element_size: u64,
    count: u32,
    _marker: PhantomData<T>,
}

impl<T: Pod> ConstantBuffer<T> {
    pub fn new(device: &Device, count: u32) -> Result<Self> {
        let element_size = align_up(std::mem::size_of::<T>() as u64, CONSTANT_BUFFER_ALIGNMENT);
        let resource = device.create_committed_resource(
            ResourceDesc::buffer(HeapType::Upload, element_size * count as u64),
            ResourceState::GENERIC_READ,
            None,
        )?;

        Ok(Self {
            resource,
            element_size,
            count,
            _marker: PhantomData,
        })
    }

    /// 对齐后的元素大小
    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// 写入第 `index` 个元素
    pub fn write(&self, index: u32, value: &T) -> Result<()> {
        if index >= self.count {
            return Err(GraphicsError::ResourceCreation(format!(
                "constant buffer index {} out of range ({})",
                index, self.count
            ))
            .into());
        }
        self.resource
            .write(index as u64 * self.element_size, bytemuck::bytes_of(value))
    }

    /// 第 `index` 个元素的 CBV 描述
    pub fn view_desc(&self, index: u32) -> ViewDesc {
        ViewDesc::ConstantBuffer {
            resource: self.resource.handle(),
            offset: index as u64 * self.element_size,
            size: self.element_size as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::HeadlessBackend;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(192, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_generic_read_matches_d3d12() {
        assert_eq!(ResourceState::GENERIC_READ.bits(), 0xAC3);
        assert!(ResourceState::GENERIC_READ.contains(ResourceState::PIXEL_SHADER_RESOURCE));
        assert!(ResourceState::GENERIC_READ.is_read_only());
        assert!(!ResourceState::COPY_DEST.is_read_only());
    }

    #[test]
    fn test_format_table() {
        assert_eq!(Format::R8G8B8A8UnormSrgb.dxgi(), 29);
        assert_eq!(Format::from_dxgi(77), Some(Format::Bc3Unorm));
        assert_eq!(Format::from_dxgi(9999), None);
        assert_eq!(Format::Bc1Unorm.block_bytes(), Some(8));
        assert_eq!(Format::R16Uint.bytes_per_pixel(), 2);
    }

    #[test]
    fn test_subresource_count() {
        assert_eq!(ResourceDesc::buffer(HeapType::Upload, 64).subresource_count(), 1);
        assert_eq!(ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 8, 8, 6, 4).subresource_count(), 24);
        assert_eq!(ResourceDesc::texture_3d(Format::R8G8B8A8Unorm, 8, 8, 8, 4).subresource_count(), 4);
    }

    #[test]
    fn test_constant_buffer_alignment_and_write() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct Constants {
            value: [f32; 4],
        }

        let device = Device::new(Box::new(HeadlessBackend::new(4, 4)));
        let cb = ConstantBuffer::<Constants>::new(&device, 3).unwrap();
        assert_eq!(cb.element_size(), 256);
        assert_eq!(cb.resource().size_in_bytes(), 768);

        cb.write(2, &Constants { value: [1.0, 2.0, 3.0, 4.0] }).unwrap();
        let bytes = cb.resource().read(512, 16).unwrap();
        let read: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(read, [1.0, 2.0, 3.0, 4.0]);

        assert!(cb.write(3, &Constants { value: [0.0; 4] }).is_err());
    }

    #[test]
    fn test_write_range_does_not_wrap() {
        let device = Device::new(Box::new(HeadlessBackend::new(4, 4)));
        let buffer = device.create_buffer(HeapType::Upload, 16).unwrap();
        assert!(buffer.write(u64::MAX - 1, &[0u8; 4]).is_err());
        assert!(buffer.write(13, &[0u8; 4]).is_err());
        buffer.write(12, &[1u8; 4]).unwrap();
    }

    #[test]
    fn test_buffer_views_reject_sizes_over_4gib() {
        let device = Device::new(Box::new(HeadlessBackend::new(4, 4)));
        // 只包装描述，不在后端分配
        let huge = Resource::swap_chain_buffer(
            device.clone(),
            ResourceHandle(u64::MAX),
            ResourceDesc::buffer(HeapType::Default, 5 << 30),
        );
        assert!(huge.vertex_buffer_view(32).is_err());
        assert!(huge.index_buffer_view(Format::R32Uint).is_err());

        let buffer = device.create_buffer(HeapType::Default, 64).unwrap();
        assert_eq!(buffer.vertex_buffer_view(32).unwrap().size_in_bytes, 64);
        assert_eq!(buffer.index_buffer_view(Format::R16Uint).unwrap().size_in_bytes, 64);
    }

    #[test]
    fn test_default_heap_is_not_mappable() {
        let device = Device::new(Box::new(HeadlessBackend::new(4, 4)));
        let buffer = device
            .create_committed_resource(ResourceDesc::buffer(HeapType::Default, 16), ResourceState::COMMON, None)
            .unwrap();
        assert!(buffer.write(0, &[0u8; 4]).is_err());
    }
}
