/// 顶点定义
///
/// Lambert 管线使用的顶点：位置、法线、UV。

use bytemuck::{Pod, Zeroable};

use crate::renderer::pipeline::InputElement;
use crate::renderer::resource::Format;

/// 顶点
///
/// # 内存布局
///
/// - position: 12 bytes (3 * f32)
/// - normal: 12 bytes (3 * f32)
/// - texcoord: 8 bytes (2 * f32)
/// - **总计**: 32 bytes
#[repr(C)]
#[derive(Default, Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texcoord: [f32; 2],
}

const INPUT_LAYOUT: [InputElement; 3] = [
    InputElement {
        semantic: "POSITION",
        format: Format::R32G32B32Float,
        offset: 0,
    },
    InputElement {
        semantic: "NORMAL",
        format: Format::R32G32B32Float,
        offset: 12,
    },
    InputElement {
        semantic: "TEXCOORD",
        format: Format::R32G32Float,
        offset: 24,
    },
];

impl Vertex {
    #[inline]
    pub fn new(position: [f32; 3], normal: [f32; 3], texcoord: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            texcoord,
        }
    }

    /// 对应 HLSL 输入签名的输入布局
    pub fn input_layout() -> &'static [InputElement] {
        &INPUT_LAYOUT
    }
}
