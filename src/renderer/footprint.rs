//! 可拷贝布局计算
//!
//! 与 `ID3D12Device::GetCopyableFootprints` 相同的规则：给定资源描述和一段
//! 子资源范围，算出每个子资源在上传缓冲中的放置位置、行距、行数、
//! 有效行字节数，以及整段数据的总字节数。
//!
//! - 行距按 256 字节对齐（D3D12_TEXTURE_DATA_PITCH_ALIGNMENT）
//! - 纹理子资源偏移按 512 字节对齐（D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT）
//! - 块压缩格式以 4x4 块为一行

use super::resource::{align_up, Format, ResourceDesc, ResourceDimension};
use crate::core::error::{GraphicsError, Result};

pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;
pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;

/// 子资源在缓冲中的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceFootprint {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch: u32,
}

/// 带偏移的子资源布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedFootprint {
    pub offset: u64,
    pub footprint: SubresourceFootprint,
}

/// 一段子资源的完整拷贝布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyableFootprints {
    pub layouts: Vec<PlacedFootprint>,
    /// 每个子资源的行数（块压缩格式为块行数）
    pub num_rows: Vec<u32>,
    /// 每行的有效字节数（不含行距填充）
    pub row_sizes: Vec<u64>,
    pub total_bytes: u64,
}

/// 计算 `[first, first + count)` 子资源的布局
pub fn copyable_footprints(
    desc: &ResourceDesc,
    first_subresource: u32,
    count: u32,
    base_offset: u64,
) -> Result<CopyableFootprints> {
    let total_subresources = desc.subresource_count();
    let end = first_subresource
        .checked_add(count)
        .filter(|&end| count > 0 && end <= total_subresources)
        .ok_or_else(|| {
            GraphicsError::ResourceCreation(format!(
                "subresource range of {} starting at {} outside of {} subresources",
                count, first_subresource, total_subresources
            ))
        })?;

    if desc.dimension == ResourceDimension::Buffer {
        let width = desc.width;
        let narrow = u32::try_from(width).map_err(|_| too_large(width))?;
        return Ok(CopyableFootprints {
            layouts: vec![PlacedFootprint {
                offset: base_offset,
                footprint: SubresourceFootprint {
                    format: Format::Unknown,
                    width: narrow,
                    height: 1,
                    depth: 1,
                    row_pitch: u32::try_from(align_up(width, TEXTURE_DATA_PITCH_ALIGNMENT))
                        .map_err(|_| too_large(width))?,
                },
            }],
            num_rows: vec![1],
            row_sizes: vec![width],
            total_bytes: width,
        });
    }

    let mip_levels = desc.mip_levels.max(1) as u32;
    let mut layouts = Vec::with_capacity(count as usize);
    let mut num_rows = Vec::with_capacity(count as usize);
    let mut row_sizes = Vec::with_capacity(count as usize);
    let mut offset = base_offset;
    let mut total_bytes = 0;

    let base_width = u32::try_from(desc.width).map_err(|_| too_large(desc.width))?;
    for subresource in first_subresource..end {
        let mip = subresource % mip_levels;

        let width = mip_extent(base_width, mip);
        let height = mip_extent(desc.height, mip);
        let depth = if desc.dimension == ResourceDimension::Texture3D {
            mip_extent(desc.depth_or_array_size as u32, mip)
        } else {
            1
        };

        let (row_size, rows, padded_width, padded_height) = match desc.format.block_bytes() {
            Some(block_bytes) => {
                let blocks_wide = width.div_ceil(4);
                let blocks_high = height.div_ceil(4);
                (
                    blocks_wide as u64 * block_bytes as u64,
                    blocks_high,
                    blocks_wide * 4,
                    blocks_high * 4,
                )
            }
            None => (
                width as u64 * desc.format.bytes_per_pixel() as u64,
                height,
                width,
                height,
            ),
        };

        let row_pitch = align_up(row_size, TEXTURE_DATA_PITCH_ALIGNMENT);
        offset = align_up(offset, TEXTURE_DATA_PLACEMENT_ALIGNMENT);

        layouts.push(PlacedFootprint {
            offset,
            footprint: SubresourceFootprint {
                format: desc.format,
                width: padded_width,
                height: padded_height,
                depth,
                row_pitch: u32::try_from(row_pitch).map_err(|_| too_large(row_pitch))?,
            },
        });
        num_rows.push(rows);
        row_sizes.push(row_size);

        let subresource_bytes = row_pitch * (rows as u64 * depth as u64 - 1) + row_size;
        total_bytes = offset + subresource_bytes - base_offset;
        offset += row_pitch * rows as u64 * depth as u64;
    }

    Ok(CopyableFootprints {
        layouts,
        num_rows,
        row_sizes,
        total_bytes,
    })
}

fn too_large(bytes: u64) -> crate::core::error::SandboxError {
    GraphicsError::ResourceCreation(format!("{} bytes do not fit a 32-bit footprint", bytes)).into()
}

/// 第 `mip` 级的尺寸，最小为 1
#[inline]
pub fn mip_extent(extent: u32, mip: u32) -> u32 {
    (extent >> mip).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resource::HeapType;

    #[test]
    fn test_buffer_footprint() {
        let desc = ResourceDesc::buffer(HeapType::Default, 1000);
        let fp = copyable_footprints(&desc, 0, 1, 0).unwrap();
        assert_eq!(fp.total_bytes, 1000);
        assert_eq!(fp.num_rows, vec![1]);
        assert_eq!(fp.row_sizes, vec![1000]);
        assert_eq!(fp.layouts[0].offset, 0);
        assert_eq!(fp.layouts[0].footprint.width, 1000);
        assert_eq!(fp.layouts[0].footprint.row_pitch, 1024);
    }

    #[test]
    fn test_texture_row_pitch_is_aligned() {
        // 100 * 4 = 400 字节每行，对齐到 512
        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 100, 3, 1, 1);
        let fp = copyable_footprints(&desc, 0, 1, 0).unwrap();
        assert_eq!(fp.layouts[0].footprint.row_pitch, 512);
        assert_eq!(fp.row_sizes[0], 400);
        assert_eq!(fp.num_rows[0], 3);
        assert_eq!(fp.total_bytes, 512 * 2 + 400);
    }

    #[test]
    fn test_mip_chain_offsets() {
        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 64, 64, 1, 3);
        let fp = copyable_footprints(&desc, 0, 3, 0).unwrap();

        // mip0: 256 字节每行 × 64 行
        assert_eq!(fp.layouts[0].offset, 0);
        assert_eq!(fp.layouts[1].offset, 256 * 64);
        assert_eq!(fp.layouts[1].footprint.width, 32);
        // mip1: 128 字节有效，行距 256，32 行 = 8192，下一偏移对齐到 512
        assert_eq!(fp.layouts[2].offset, 256 * 64 + 256 * 32);
        assert_eq!(fp.layouts[2].footprint.row_pitch, 256);
        assert_eq!(fp.row_sizes[2], 64);
        assert_eq!(fp.total_bytes, 256 * 64 + 256 * 32 + 256 * 15 + 64);
    }

    #[test]
    fn test_array_slice_order() {
        // 子资源 i: mip = i % mips, slice = i / mips
        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 4, 4, 2, 2);
        let fp = copyable_footprints(&desc, 0, 4, 0).unwrap();
        assert_eq!(fp.layouts[0].footprint.width, 4);
        assert_eq!(fp.layouts[1].footprint.width, 2);
        assert_eq!(fp.layouts[2].footprint.width, 4);
        assert_eq!(fp.layouts[3].footprint.width, 2);
        assert!(fp.layouts.iter().all(|l| l.offset % TEXTURE_DATA_PLACEMENT_ALIGNMENT == 0));
    }

    #[test]
    fn test_block_compressed() {
        let desc = ResourceDesc::texture_2d(Format::Bc1Unorm, 10, 6, 1, 1);
        let fp = copyable_footprints(&desc, 0, 1, 0).unwrap();
        // 3 块宽 × 8 字节，2 块行
        assert_eq!(fp.row_sizes[0], 24);
        assert_eq!(fp.num_rows[0], 2);
        assert_eq!(fp.layouts[0].footprint.width, 12);
        assert_eq!(fp.layouts[0].footprint.height, 8);
    }

    #[test]
    fn test_texture_3d_depth_slices() {
        let desc = ResourceDesc::texture_3d(Format::R8G8B8A8Unorm, 4, 4, 4, 1);
        let fp = copyable_footprints(&desc, 0, 1, 0).unwrap();
        assert_eq!(fp.layouts[0].footprint.depth, 4);
        assert_eq!(fp.total_bytes, 256 * (4 * 4 - 1) + 16);
    }

    #[test]
    fn test_partial_range_with_base_offset() {
        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 8, 8, 1, 2);
        let fp = copyable_footprints(&desc, 1, 1, 100).unwrap();
        assert_eq!(fp.layouts[0].offset, 512);
        assert_eq!(fp.layouts[0].footprint.width, 4);
        assert_eq!(fp.total_bytes, 512 - 100 + 256 * 3 + 16);
    }

    #[test]
    fn test_invalid_range() {
        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 8, 8, 1, 1);
        assert!(copyable_footprints(&desc, 0, 0, 0).is_err());
        assert!(copyable_footprints(&desc, 0, 2, 0).is_err());
        assert!(copyable_footprints(&desc, u32::MAX, 2, 0).is_err());
        assert!(copyable_footprints(&desc, 1, u32::MAX, 0).is_err());
    }

    #[test]
    fn test_oversized_widths_are_rejected() {
        let desc = ResourceDesc::buffer(HeapType::Default, (u32::MAX as u64) + 1);
        assert!(copyable_footprints(&desc, 0, 1, 0).is_err());

        let mut texture = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 4, 4, 1, 1);
        texture.width = 1 << 40;
        assert!(copyable_footprints(&texture, 0, 1, 0).is_err());

        // 行距超出 u32
        let wide = ResourceDesc::texture_2d(Format::R32G32B32A32Float, u32::MAX, 1, 1, 1);
        assert!(copyable_footprints(&wide, 0, 1, 0).is_err());
    }
}
