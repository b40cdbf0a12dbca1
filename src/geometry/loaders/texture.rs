/// 纹理文件加载
///
/// DDS 直接按 D3D12 子资源顺序读入；其他格式交给 `image` crate 解码成 RGBA8。
use std::path::Path;

use super::dds;
use crate::core::error::{Result, TextureError};
use crate::renderer::footprint::mip_extent;
use crate::renderer::resource::Format;
use crate::renderer::upload::SubresourceData;

/// 2D 纹理宽高上限
pub const MAX_TEXTURE_DIMENSION: u32 = 16384;
/// 3D 纹理深度上限
pub const MAX_TEXTURE_DEPTH: u32 = 2048;
/// 纹理数组切片上限（立方体贴图按面计）
pub const MAX_ARRAY_SIZE: u32 = 2048;

/// 完整 mip 链的级数
pub fn max_mip_levels(width: u32, height: u32, depth: u32) -> u32 {
    32 - width.max(height).max(depth).max(1).leading_zeros()
}

/// CPU 侧纹理
///
/// `data` 按数组切片优先、mip 其次排列，与 D3D12 子资源编号一致，
/// 每个子资源内部紧密排列。
#[derive(Debug, Clone, PartialEq)]
pub struct TextureImage {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    /// 体积纹理的深度，其他为 1
    pub depth: u32,
    /// 数组大小，立方体贴图为 6
    pub array_size: u32,
    pub mip_levels: u32,
    pub is_cube: bool,
    pub data: Vec<u8>,
}

/// 一个子资源在 `data` 中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceLayout {
    pub offset: usize,
    pub row_pitch: usize,
    pub slice_pitch: usize,
    pub depth: u32,
}

impl SubresourceLayout {
    pub fn size(&self) -> usize {
        self.slice_pitch * self.depth as usize
    }
}

impl TextureImage {
    /// 1x1 纯色 RGBA8 纹理
    pub fn solid_color(rgba: [u8; 4]) -> Self {
        Self {
            format: Format::R8G8B8A8Unorm,
            width: 1,
            height: 1,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            is_cube: false,
            data: rgba.to_vec(),
        }
    }

    pub fn subresource_count(&self) -> Result<u32> {
        self.array_size.checked_mul(self.mip_levels).ok_or_else(|| {
            TextureError::Corrupt(format!(
                "{} slices x {} mips overflows the subresource count",
                self.array_size, self.mip_levels
            ))
            .into()
        })
    }

    /// 检查尺寸、数组大小和 mip 数是否在 D3D12 的范围内
    pub fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| -> Result<()> { Err(TextureError::Corrupt(msg).into()) };

        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return corrupt(format!("zero dimension {}x{}x{}", self.width, self.height, self.depth));
        }
        if self.width > MAX_TEXTURE_DIMENSION || self.height > MAX_TEXTURE_DIMENSION || self.depth > MAX_TEXTURE_DEPTH {
            return corrupt(format!(
                "dimensions {}x{}x{} exceed the device limits",
                self.width, self.height, self.depth
            ));
        }
        if self.array_size == 0 || self.array_size > MAX_ARRAY_SIZE {
            return corrupt(format!("array size {} outside 1..={}", self.array_size, MAX_ARRAY_SIZE));
        }
        let max_mips = max_mip_levels(self.width, self.height, self.depth);
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return corrupt(format!(
                "{} mip levels for a {}x{}x{} texture, at most {} are possible",
                self.mip_levels, self.width, self.height, self.depth, max_mips
            ));
        }
        Ok(())
    }

    /// 紧密排列时一个 mip 的行距与行数
    pub fn surface_pitch(format: Format, width: u32, height: u32) -> Result<(usize, usize)> {
        if let Some(block) = format.block_bytes() {
            let blocks_wide = width.div_ceil(4).max(1) as usize;
            let blocks_high = height.div_ceil(4).max(1) as usize;
            return Ok((blocks_wide * block as usize, blocks_high));
        }
        match format.bytes_per_pixel() {
            0 => Err(TextureError::UnsupportedFormat(format!("{:?}", format)).into()),
            bpp => Ok((width as usize * bpp as usize, height as usize)),
        }
    }

    /// 所有子资源的布局
    pub fn layouts(&self) -> Result<Vec<SubresourceLayout>> {
        self.validate()?;
        let mut layouts = Vec::with_capacity(self.subresource_count()? as usize);
        let mut offset: usize = 0;
        for _slice in 0..self.array_size {
            for mip in 0..self.mip_levels {
                let (row_pitch, rows) = Self::surface_pitch(
                    self.format,
                    mip_extent(self.width, mip),
                    mip_extent(self.height, mip),
                )?;
                let layout = SubresourceLayout {
                    offset,
                    row_pitch,
                    slice_pitch: row_pitch * rows,
                    depth: mip_extent(self.depth, mip),
                };
                offset = offset
                    .checked_add(layout.size())
                    .ok_or_else(|| TextureError::Corrupt("texture size overflows".to_string()))?;
                layouts.push(layout);
            }
        }
        if offset > self.data.len() {
            return Err(TextureError::Corrupt(format!(
                "texture needs {} bytes but only {} are present",
                offset,
                self.data.len()
            ))
            .into());
        }
        Ok(layouts)
    }

    /// 上传用的子资源数据
    pub fn subresources(&self) -> Result<Vec<SubresourceData<'_>>> {
        Ok(self
            .layouts()?
            .into_iter()
            .map(|layout| SubresourceData {
                data: &self.data[layout.offset..layout.offset + layout.size()],
                row_pitch: layout.row_pitch as u64,
                slice_pitch: layout.slice_pitch as u64,
            })
            .collect())
    }
}

/// 按扩展名加载纹理文件
pub fn load_texture(path: &Path) -> Result<TextureImage> {
    if !path.is_file() {
        return Err(TextureError::FileNotFound(path.to_path_buf()).into());
    }

    let is_dds = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("dds"));

    let image = if is_dds {
        dds::parse(&std::fs::read(path)?)?
    } else {
        let decoded = image::open(path)
            .map_err(|e| TextureError::Decode(format!("{}: {}", path.display(), e)))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        TextureImage {
            format: Format::R8G8B8A8Unorm,
            width,
            height,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            is_cube: false,
            data: decoded.into_raw(),
        }
    };

    tracing::debug!(
        path = %path.display(),
        format = ?image.format,
        width = image.width,
        height = image.height,
        mips = image.mip_levels,
        "Texture file loaded"
    );
    Ok(image)
}
