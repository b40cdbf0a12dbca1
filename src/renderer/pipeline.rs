//! 管线状态描述
//!
//! 沙盒只有一条固定的 Lambert + 纹理管线：
//! 根参数 0 是顶点着色器可见的 CBV 表，根参数 1 是像素着色器可见的 SRV 表，
//! 外加一个线性过滤、WRAP 寻址的静态采样器。

use std::path::PathBuf;

use super::resource::Format;

/// 描述符表中的范围类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorRangeKind {
    Cbv,
    Srv,
}

/// 着色器可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderVisibility {
    All,
    Vertex,
    Pixel,
}

/// 一个根参数：只含一个描述符的描述符表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootTable {
    pub range: DescriptorRangeKind,
    pub visibility: ShaderVisibility,
}

/// 顶点输入元素
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputElement {
    pub semantic: &'static str,
    pub format: Format,
    pub offset: u32,
}

/// HLSL 源文件与入口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub path: PathBuf,
    pub vs_entry: String,
    pub ps_entry: String,
}

/// 图形管线描述
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub name: String,
    pub shader: ShaderSource,
    pub root_tables: Vec<RootTable>,
    pub input_layout: Vec<InputElement>,
    pub vertex_stride: u32,
    pub rtv_format: Format,
    pub dsv_format: Format,
}

/// 模型常量所在的根参数
pub const ROOT_TRANSFORM_TABLE: u32 = 0;
/// 漫反射纹理所在的根参数
pub const ROOT_TEXTURE_TABLE: u32 = 1;

impl PipelineDesc {
    /// Lambert + 纹理管线
    pub fn lambert(shader_path: impl Into<PathBuf>, rtv_format: Format, dsv_format: Format) -> Self {
        use crate::geometry::Vertex;

        Self {
            name: "lambert".to_string(),
            shader: ShaderSource {
                path: shader_path.into(),
                vs_entry: "VSFunc".to_string(),
                ps_entry: "PSFunc".to_string(),
            },
            root_tables: vec![
                RootTable {
                    range: DescriptorRangeKind::Cbv,
                    visibility: ShaderVisibility::Vertex,
                },
                RootTable {
                    range: DescriptorRangeKind::Srv,
                    visibility: ShaderVisibility::Pixel,
                },
            ],
            input_layout: Vertex::input_layout().to_vec(),
            vertex_stride: std::mem::size_of::<Vertex>() as u32,
            rtv_format,
            dsv_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lambert_root_layout() {
        let desc = PipelineDesc::lambert("assets/shaders/lambert.hlsl", Format::R8G8B8A8UnormSrgb, Format::D24UnormS8Uint);
        assert_eq!(desc.root_tables[ROOT_TRANSFORM_TABLE as usize].range, DescriptorRangeKind::Cbv);
        assert_eq!(desc.root_tables[ROOT_TEXTURE_TABLE as usize].visibility, ShaderVisibility::Pixel);
        assert_eq!(desc.vertex_stride, 32);
        assert_eq!(desc.input_layout.len(), 3);
    }
}
