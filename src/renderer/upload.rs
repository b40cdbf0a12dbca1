//! 子资源上传
//!
//! 默认堆资源的 CPU 数据经由上传堆中转：
//!
//! 1. 计算目标子资源的可拷贝布局，按总大小创建中转缓冲
//! 2. 按布局的行距逐行写入中转缓冲（源数据的行距、切片距可以不同）
//! 3. 目标转换到 COPY_DEST，缓冲用一次 CopyBufferRegion，
//!    纹理对每个子资源用 CopyTextureRegion
//! 4. 目标转换到稳定状态，默认 GENERIC_READ
//!
//! 中转缓冲必须活到 GPU 拷贝完成，`UploadContext` 负责这一点。

use super::command::{CommandContainer, CommandList, SubmitType};
use super::device::Device;
use super::footprint::copyable_footprints;
use super::resource::{HeapType, Resource, ResourceState};
use super::sync::CommandQueue;
use crate::core::error::{Result, SandboxError};

/// 一个子资源的源数据
#[derive(Debug, Clone, Copy)]
pub struct SubresourceData<'a> {
    pub data: &'a [u8],
    /// 相邻两行的字节距离
    pub row_pitch: u64,
    /// 相邻两个深度切片的字节距离
    pub slice_pitch: u64,
}

impl<'a> SubresourceData<'a> {
    /// 紧密排列的单行数据（缓冲区）
    pub fn buffer(data: &'a [u8]) -> Self {
        Self {
            data,
            row_pitch: data.len() as u64,
            slice_pitch: data.len() as u64,
        }
    }
}

/// 逐行拷贝一个子资源
///
/// 每个切片拷贝 `num_rows` 行，每行 `row_size` 字节。
pub fn copy_subresource(
    dest: &mut [u8],
    dest_row_pitch: u64,
    dest_slice_pitch: u64,
    src: &SubresourceData<'_>,
    row_size: u64,
    num_rows: u32,
    num_slices: u32,
) -> Result<()> {
    let row_size = row_size as usize;

    for z in 0..num_slices as u64 {
        for y in 0..num_rows as u64 {
            let dst_start = (z * dest_slice_pitch + y * dest_row_pitch) as usize;
            let src_start = (z * src.slice_pitch + y * src.row_pitch) as usize;

            let dst_row = dest.get_mut(dst_start..dst_start + row_size).ok_or_else(|| {
                SandboxError::validation(format!("staging row {} of slice {} out of range", y, z))
            })?;
            let src_row = src.data.get(src_start..src_start + row_size).ok_or_else(|| {
                SandboxError::validation(format!(
                    "source row {} of slice {} out of range ({} bytes, row pitch {})",
                    y,
                    z,
                    src.data.len(),
                    src.row_pitch
                ))
            })?;
            dst_row.copy_from_slice(src_row);
        }
    }
    Ok(())
}

/// 录制 `dest` 从 `first_subresource` 开始的上传，返回中转缓冲
///
/// 上传后 `dest` 处于 GENERIC_READ。调用方必须保证返回的缓冲活到该命令列表执行完毕。
pub fn update_subresources(
    list: &mut CommandList,
    dest: &Resource,
    first_subresource: u32,
    data: &[SubresourceData<'_>],
) -> Result<Resource> {
    update_subresources_in_state(list, dest, first_subresource, data, ResourceState::GENERIC_READ)
}

/// 同 `update_subresources`，上传后 `dest` 转换到 `after`
pub fn update_subresources_in_state(
    list: &mut CommandList,
    dest: &Resource,
    first_subresource: u32,
    data: &[SubresourceData<'_>],
    after: ResourceState,
) -> Result<Resource> {
    if data.is_empty() {
        return Err(SandboxError::validation("no subresource data to upload"));
    }
    if after == ResourceState::COPY_DEST {
        return Err(SandboxError::validation("upload cannot end in COPY_DEST"));
    }
    let count = u32::try_from(data.len())
        .map_err(|_| SandboxError::validation(format!("{} subresources in one upload", data.len())))?;

    let desc = dest.desc();
    let footprints = copyable_footprints(desc, first_subresource, count, 0)?;

    let staging = dest.device().create_buffer(HeapType::Upload, footprints.total_bytes)?;
    let mut bytes = vec![0u8; footprints.total_bytes as usize];

    for (i, src) in data.iter().enumerate() {
        let layout = &footprints.layouts[i];
        let rows = footprints.num_rows[i];
        let row_pitch = layout.footprint.row_pitch as u64;
        let slice_pitch = row_pitch * rows as u64;

        copy_subresource(
            &mut bytes[layout.offset as usize..],
            row_pitch,
            slice_pitch,
            src,
            footprints.row_sizes[i],
            rows,
            layout.footprint.depth,
        )?;
    }
    staging.write(0, &bytes)?;

    list.transition(dest, ResourceState::COPY_DEST)?;

    if desc.is_buffer() {
        let layout = &footprints.layouts[0];
        list.copy_buffer_region(dest, 0, &staging, layout.offset, layout.footprint.width as u64)?;
    } else {
        for (i, layout) in footprints.layouts.iter().enumerate() {
            list.copy_texture_region(dest, first_subresource + i as u32, &staging, *layout)?;
        }
    }

    list.transition(dest, after)?;

    tracing::trace!(
        resource = ?dest.handle(),
        state = ?after,
        subresources = data.len(),
        bytes = footprints.total_bytes,
        "Subresource upload recorded"
    );
    Ok(staging)
}

/// 批量上传
///
/// 在自己的直接命令列表上录制上传，`finish` 时提交并等待围栏，
/// 然后才释放中转缓冲。
pub struct UploadContext {
    device: Device,
    // 列表先于容器析构
    list: CommandList,
    _container: CommandContainer,
    staging: Vec<Resource>,
    staged_bytes: u64,
}

impl UploadContext {
    pub fn new(device: &Device) -> Result<Self> {
        let container = CommandContainer::new(device, SubmitType::Direct)?;
        let mut list = container.create_command_list();
        list.open(None)?;

        Ok(Self {
            device: device.clone(),
            list,
            _container: container,
            staging: Vec::new(),
            staged_bytes: 0,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// 录制一组子资源的上传，完成后处于 GENERIC_READ
    pub fn upload(&mut self, dest: &Resource, first_subresource: u32, data: &[SubresourceData<'_>]) -> Result<()> {
        self.upload_in_state(dest, first_subresource, data, ResourceState::GENERIC_READ)
    }

    /// 录制一组子资源的上传，完成后处于 `after`
    pub fn upload_in_state(
        &mut self,
        dest: &Resource,
        first_subresource: u32,
        data: &[SubresourceData<'_>],
        after: ResourceState,
    ) -> Result<()> {
        let staging = update_subresources_in_state(&mut self.list, dest, first_subresource, data, after)?;
        self.staged_bytes += staging.size_in_bytes();
        self.staging.push(staging);
        Ok(())
    }

    /// 创建默认堆缓冲区并上传 `data`
    pub fn create_default_buffer(&mut self, data: &[u8]) -> Result<Resource> {
        let buffer = self.device.create_buffer(HeapType::Default, data.len() as u64)?;
        self.upload(&buffer, 0, &[SubresourceData::buffer(data)])?;
        Ok(buffer)
    }

    /// 尚未提交的上传数
    pub fn pending_uploads(&self) -> usize {
        self.staging.len()
    }

    /// 提交、等待完成并释放中转缓冲
    pub fn finish(mut self, queue: &CommandQueue) -> Result<()> {
        self.list.close()?;

        if !self.staging.is_empty() {
            queue.enqueue(&self.list)?;
            queue.wait_for_execution()?;
        }

        tracing::debug!(
            uploads = self.staging.len(),
            bytes = self.staged_bytes,
            "Uploads completed"
        );
        self.staging.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::HeadlessBackend;
    use crate::renderer::command::Command;
    use crate::renderer::resource::{Format, ResourceDesc};

    fn setup() -> (Device, CommandQueue, crate::gfx::headless::HeadlessInspector) {
        let backend = HeadlessBackend::new(8, 8);
        let inspector = backend.inspector();
        let device = Device::new(Box::new(backend));
        let queue = CommandQueue::new(&device);
        (device, queue, inspector)
    }

    #[test]
    fn test_copy_subresource_honors_pitches() {
        // 源：2 行，每行 3 字节有效，行距 4
        let src = [1u8, 2, 3, 0, 4, 5, 6, 0];
        let data = SubresourceData {
            data: &src,
            row_pitch: 4,
            slice_pitch: 8,
        };
        let mut dest = vec![0xFFu8; 16];
        copy_subresource(&mut dest, 8, 16, &data, 3, 2, 1).unwrap();
        assert_eq!(&dest[0..3], &[1, 2, 3]);
        assert_eq!(dest[3], 0xFF);
        assert_eq!(&dest[8..11], &[4, 5, 6]);
    }

    #[test]
    fn test_copy_subresource_bounds() {
        let src = [0u8; 4];
        let data = SubresourceData {
            data: &src,
            row_pitch: 4,
            slice_pitch: 4,
        };
        let mut dest = vec![0u8; 64];
        assert!(copy_subresource(&mut dest, 8, 16, &data, 4, 2, 1).is_err());
    }

    #[test]
    fn test_buffer_upload_records_barriers_and_copy() {
        let (device, queue, _inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        let dest = device.create_buffer(HeapType::Default, 12).unwrap();

        list.open(None).unwrap();
        let bytes: Vec<u8> = (0..12).collect();
        let staging = update_subresources(&mut list, &dest, 0, &[SubresourceData::buffer(&bytes)]).unwrap();
        list.close().unwrap();

        let names: Vec<&str> = list.commands().iter().map(Command::name).collect();
        assert_eq!(names, ["ResourceBarrier", "CopyBufferRegion", "ResourceBarrier"]);
        assert_eq!(dest.state(), ResourceState::GENERIC_READ);
        assert_eq!(staging.read(0, 12).unwrap(), bytes);

        queue.enqueue(&list).unwrap();
        queue.wait_for_execution().unwrap();
    }

    #[test]
    fn test_upload_context_buffer_roundtrip() {
        let (device, queue, inspector) = setup();
        let mut uploader = UploadContext::new(&device).unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let buffer = uploader.create_default_buffer(&data).unwrap();
        assert_eq!(uploader.pending_uploads(), 1);

        let live_before = device.stats().live_resources;
        uploader.finish(&queue).unwrap();

        // 中转缓冲在等待之后释放
        assert_eq!(device.stats().live_resources, live_before - 1);
        assert_eq!(inspector.subresource_bytes(buffer.handle(), 0).unwrap(), data);
        assert_eq!(inspector.resource_state(buffer.handle()), Some(ResourceState::GENERIC_READ));
    }

    #[test]
    fn test_texture_upload_with_padded_source_rows() {
        let (device, queue, inspector) = setup();
        let texture = device
            .create_committed_resource(
                ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 3, 2, 1, 2),
                ResourceState::COMMON,
                None,
            )
            .unwrap();

        // mip0: 3x2，源行距 16（12 字节有效）；mip1: 1x1
        let mut mip0 = vec![0u8; 32];
        for (y, row) in mip0.chunks_mut(16).enumerate() {
            for (x, px) in row[..12].iter_mut().enumerate() {
                *px = (y * 12 + x) as u8;
            }
        }
        let mip1 = [200u8, 201, 202, 203];

        let mut uploader = UploadContext::new(&device).unwrap();
        uploader
            .upload(
                &texture,
                0,
                &[
                    SubresourceData { data: &mip0, row_pitch: 16, slice_pitch: 32 },
                    SubresourceData { data: &mip1, row_pitch: 4, slice_pitch: 4 },
                ],
            )
            .unwrap();
        uploader.finish(&queue).unwrap();

        let expected: Vec<u8> = (0..24).collect();
        assert_eq!(inspector.subresource_bytes(texture.handle(), 0).unwrap(), expected);
        assert_eq!(inspector.subresource_bytes(texture.handle(), 1).unwrap(), mip1.to_vec());
    }

    #[test]
    fn test_releasing_staging_before_wait_is_detected() {
        let (device, queue, _inspector) = setup();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        let dest = device.create_buffer(HeapType::Default, 16).unwrap();

        list.open(None).unwrap();
        let staging = update_subresources(&mut list, &dest, 0, &[SubresourceData::buffer(&[7u8; 16])]).unwrap();
        list.close().unwrap();
        queue.enqueue(&list).unwrap();

        drop(staging);
        assert!(queue.wait_for_execution().is_err());
    }

    #[test]
    fn test_upload_ends_in_requested_state() {
        let (device, queue, inspector) = setup();
        let texture = device
            .create_committed_resource(
                ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 1, 1, 1, 1),
                ResourceState::COMMON,
                None,
            )
            .unwrap();
        let container = CommandContainer::new(&device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();

        list.open(None).unwrap();
        let pixel = [9u8, 8, 7, 6];
        let _staging = update_subresources_in_state(
            &mut list,
            &texture,
            0,
            &[SubresourceData::buffer(&pixel)],
            ResourceState::PIXEL_SHADER_RESOURCE,
        )
        .unwrap();
        assert!(update_subresources_in_state(
            &mut list,
            &texture,
            0,
            &[SubresourceData::buffer(&pixel)],
            ResourceState::COPY_DEST
        )
        .is_err());
        list.close().unwrap();

        // 只有一次进入、一次离开 COPY_DEST 的转换
        let barriers = list.commands().iter().filter(|c| c.name() == "ResourceBarrier").count();
        assert_eq!(barriers, 2);
        assert_eq!(texture.state(), ResourceState::PIXEL_SHADER_RESOURCE);

        queue.enqueue(&list).unwrap();
        queue.wait_for_execution().unwrap();
        assert_eq!(inspector.resource_state(texture.handle()), Some(ResourceState::PIXEL_SHADER_RESOURCE));
        assert_eq!(inspector.subresource_bytes(texture.handle(), 0), Some(pixel.to_vec()));
    }

    #[test]
    fn test_upload_context_custom_state() {
        let (device, queue, inspector) = setup();
        let buffer = device.create_buffer(HeapType::Default, 8).unwrap();
        let mut uploader = UploadContext::new(&device).unwrap();
        uploader
            .upload_in_state(&buffer, 0, &[SubresourceData::buffer(&[1u8; 8])], ResourceState::COPY_SOURCE)
            .unwrap();
        uploader.finish(&queue).unwrap();
        assert_eq!(inspector.resource_state(buffer.handle()), Some(ResourceState::COPY_SOURCE));
    }

    #[test]
    fn test_empty_upload_is_rejected() {
        let (device, _queue, _inspector) = setup();
        let mut uploader = UploadContext::new(&device).unwrap();
        let dest = device.create_buffer(HeapType::Default, 16).unwrap();
        assert!(uploader.upload(&dest, 0, &[]).is_err());
    }
}
