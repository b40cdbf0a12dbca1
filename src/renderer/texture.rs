//! GPU 纹理
//!
//! 默认堆纹理，全部子资源通过 `UploadContext` 一次上传，上传后处于 GENERIC_READ。

use std::path::Path;

use super::descriptor::{DescriptorHandle, ResourceViewHeap};
use super::resource::{Resource, ResourceDesc, ResourceState};
use super::upload::UploadContext;
use crate::core::error::{Result, TextureError};
use crate::geometry::loaders::{load_texture, TextureImage};

/// 上传到默认堆的纹理
pub struct Texture {
    resource: Resource,
    is_cube: bool,
}

impl Texture {
    /// 创建纹理并录制全部子资源的上传
    ///
    /// 数据在 `uploader.finish` 之后才在 GPU 上可用。
    pub fn upload(uploader: &mut UploadContext, image: &TextureImage) -> Result<Self> {
        let to_u16 = |value: u32, what: &str| {
            u16::try_from(value).map_err(|_| TextureError::UnsupportedFormat(format!("{} {} exceeds 65535", what, value)))
        };

        let desc = if image.depth > 1 {
            ResourceDesc::texture_3d(
                image.format,
                image.width,
                image.height,
                to_u16(image.depth, "depth")?,
                to_u16(image.mip_levels, "mip count")?,
            )
        } else {
            ResourceDesc::texture_2d(
                image.format,
                image.width,
                image.height,
                to_u16(image.array_size, "array size")?,
                to_u16(image.mip_levels, "mip count")?,
            )
        };

        let resource = uploader
            .device()
            .create_committed_resource(desc, ResourceState::COMMON, None)?;
        uploader.upload(&resource, 0, &image.subresources()?)?;

        Ok(Self {
            resource,
            is_cube: image.is_cube,
        })
    }

    /// 1x1 纯色纹理，材质没有贴图时使用
    pub fn solid_color(uploader: &mut UploadContext, rgba: [u8; 4]) -> Result<Self> {
        Self::upload(uploader, &TextureImage::solid_color(rgba))
    }

    /// 加载纹理文件并上传
    pub fn from_file(uploader: &mut UploadContext, path: &Path) -> Result<Self> {
        let image = load_texture(path)?;
        Self::upload(uploader, &image)
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn is_cube(&self) -> bool {
        self.is_cube
    }

    /// 在 `heap` 上创建 SRV
    pub fn create_view(&self, heap: &ResourceViewHeap) -> Result<DescriptorHandle> {
        heap.create_shader_resource_view(&self.resource, self.is_cube)
    }
}
