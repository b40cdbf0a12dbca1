//! DDS 解析
//!
//! 支持：
//!
//! - 旧式 FourCC：DXT1/DXT2/DXT3/DXT4/DXT5、ATI1/BC4U、ATI2/BC5U
//! - 32 位 RGBA / BGRA 掩码和 8 位亮度
//! - DX10 扩展头（DXGI 格式、纹理数组、立方体贴图）
//! - mip 链与体积纹理
//!
//! 文件中的像素数据本身就是按数组切片优先、mip 其次排列，直接作为子资源数据。

use super::texture::{TextureImage, MAX_ARRAY_SIZE};
use crate::core::error::{Result, TextureError};
use crate::renderer::resource::Format;

const MAGIC: u32 = 0x2053_4444; // "DDS "
const HEADER_SIZE: usize = 124;
const DX10_HEADER_SIZE: usize = 20;

const DDPF_ALPHAPIXELS: u32 = 0x1;
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;
const DDPF_LUMINANCE: u32 = 0x20000;

const DDSCAPS2_CUBEMAP: u32 = 0x200;
const DDSCAPS2_VOLUME: u32 = 0x20_0000;

const DX10_DIMENSION_TEXTURE3D: u32 = 4;
const DX10_MISC_TEXTURECUBE: u32 = 0x4;

const fn four_cc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

fn corrupt(msg: impl Into<String>) -> crate::core::error::SandboxError {
    TextureError::Corrupt(msg.into()).into()
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| corrupt(format!("DDS header truncated at offset {}", offset)))
}

/// 像素格式块
struct PixelFormat {
    flags: u32,
    four_cc: u32,
    bit_count: u32,
    masks: [u32; 4],
}

impl PixelFormat {
    fn format(&self) -> Result<Format> {
        if self.flags & DDPF_FOURCC != 0 {
            let format = match &self.four_cc.to_le_bytes() {
                b"DXT1" => Format::Bc1Unorm,
                b"DXT2" | b"DXT3" => Format::Bc2Unorm,
                b"DXT4" | b"DXT5" => Format::Bc3Unorm,
                b"ATI1" | b"BC4U" => Format::Bc4Unorm,
                b"ATI2" | b"BC5U" => Format::Bc5Unorm,
                other => {
                    return Err(TextureError::UnsupportedFormat(format!(
                        "DDS FourCC '{}'",
                        String::from_utf8_lossy(other)
                    ))
                    .into())
                }
            };
            return Ok(format);
        }

        let [r, g, b, a] = self.masks;
        let has_alpha = self.flags & DDPF_ALPHAPIXELS != 0;
        match (self.flags & (DDPF_RGB | DDPF_LUMINANCE), self.bit_count) {
            (DDPF_RGB, 32) if (r, g, b) == (0xff, 0xff00, 0xff_0000) && (!has_alpha || a == 0xff00_0000) => {
                Ok(Format::R8G8B8A8Unorm)
            }
            (DDPF_RGB, 32) if (r, g, b) == (0xff_0000, 0xff00, 0xff) && (!has_alpha || a == 0xff00_0000) => {
                Ok(Format::B8G8R8A8Unorm)
            }
            (DDPF_LUMINANCE, 8) if r == 0xff => Ok(Format::R8Unorm),
            _ => Err(TextureError::UnsupportedFormat(format!(
                "DDS pixel format flags {:#x}, {} bits, masks {:#x?}",
                self.flags, self.bit_count, self.masks
            ))
            .into()),
        }
    }
}

/// 解析 DDS 文件
pub fn parse(data: &[u8]) -> Result<TextureImage> {
    if read_u32(data, 0)? != MAGIC {
        return Err(TextureError::UnsupportedFormat("missing DDS magic".to_string()).into());
    }
    let header = 4;
    if read_u32(data, header)? as usize != HEADER_SIZE {
        return Err(corrupt("DDS header size is not 124"));
    }

    let height = read_u32(data, header + 8)?;
    let width = read_u32(data, header + 12)?;
    let depth = read_u32(data, header + 20)?;
    let mip_levels = read_u32(data, header + 24)?.max(1);
    let pixel_format = PixelFormat {
        flags: read_u32(data, header + 76)?,
        four_cc: read_u32(data, header + 80)?,
        bit_count: read_u32(data, header + 84)?,
        masks: [
            read_u32(data, header + 88)?,
            read_u32(data, header + 92)?,
            read_u32(data, header + 96)?,
            read_u32(data, header + 100)?,
        ],
    };
    let caps2 = read_u32(data, header + 108)?;

    if width == 0 || height == 0 {
        return Err(corrupt("DDS has a zero dimension"));
    }

    let mut data_offset = header + HEADER_SIZE;
    let mut image = if pixel_format.flags & DDPF_FOURCC != 0 && pixel_format.four_cc == four_cc(b"DX10") {
        let dxgi = read_u32(data, data_offset)?;
        let dimension = read_u32(data, data_offset + 4)?;
        let misc = read_u32(data, data_offset + 8)?;
        let array_size = read_u32(data, data_offset + 12)?.max(1);
        data_offset += DX10_HEADER_SIZE;

        let format = Format::from_dxgi(dxgi)
            .ok_or_else(|| TextureError::UnsupportedFormat(format!("DXGI format {}", dxgi)))?;
        let is_cube = misc & DX10_MISC_TEXTURECUBE != 0;
        let is_volume = dimension == DX10_DIMENSION_TEXTURE3D;
        let array_size = if is_cube {
            array_size
                .checked_mul(6)
                .filter(|&faces| faces <= MAX_ARRAY_SIZE)
                .ok_or_else(|| corrupt(format!("DDS cube array of {} cubes is too large", array_size)))?
        } else {
            array_size
        };

        TextureImage {
            format,
            width,
            height,
            depth: if is_volume { depth.max(1) } else { 1 },
            array_size,
            mip_levels,
            is_cube,
            data: Vec::new(),
        }
    } else {
        let is_cube = caps2 & DDSCAPS2_CUBEMAP != 0;
        let is_volume = caps2 & DDSCAPS2_VOLUME != 0;
        TextureImage {
            format: pixel_format.format()?,
            width,
            height,
            depth: if is_volume { depth.max(1) } else { 1 },
            array_size: if is_cube { 6 } else { 1 },
            mip_levels,
            is_cube,
            data: Vec::new(),
        }
    };
    image.validate()?;

    let pixels = data
        .get(data_offset..)
        .ok_or_else(|| corrupt("DDS has no pixel data"))?;
    image.data = pixels.to_vec();

    // 校验总大小，多余的尾部数据丢弃
    let needed = image
        .layouts()?
        .last()
        .map(|l| l.offset + l.size())
        .unwrap_or(0);
    image.data.truncate(needed);

    Ok(image)
}

/// 测试用的 DDS 写入器
#[cfg(test)]
pub(crate) fn write_legacy(width: u32, height: u32, mips: u32, four_cc_code: Option<&[u8; 4]>, caps2: u32, pixels: &[u8]) -> Vec<u8> {
    let mut header = vec![0u32; HEADER_SIZE / 4];
    header[0] = HEADER_SIZE as u32;
    header[2] = height;
    header[3] = width;
    header[5] = 1;
    header[6] = mips;
    header[18] = 32;
    match four_cc_code {
        Some(code) => {
            header[19] = DDPF_FOURCC;
            header[20] = four_cc(code);
        }
        None => {
            header[19] = DDPF_RGB | DDPF_ALPHAPIXELS;
            header[21] = 32;
            header[22] = 0xff;
            header[23] = 0xff00;
            header[24] = 0xff_0000;
            header[25] = 0xff00_0000;
        }
    }
    header[27] = caps2;

    let mut out = MAGIC.to_le_bytes().to_vec();
    out.extend(header.iter().flat_map(|v| v.to_le_bytes()));
    out.extend_from_slice(pixels);
    out
}
