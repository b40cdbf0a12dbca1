/// 网格数据结构模块
///
/// CPU 侧的网格数据容器，存储从文件加载的原始几何数据和材质描述。
/// 不包含 GPU 资源，上传由 `component::model` 完成。

use std::path::PathBuf;

use super::vertex::Vertex;
use crate::core::error::{MeshLoadError, Result};
use crate::renderer::resource::Format;

/// Lambert 材质
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    /// 漫反射颜色
    pub diffuse: [f32; 3],
    /// 漫反射纹理文件
    pub texture: Option<PathBuf>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            diffuse: [0.8, 0.8, 0.8],
            texture: None,
        }
    }
}

/// CPU侧网格数据
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    /// 网格名称（可选）
    pub name: Option<String>,

    /// 顶点数组，每个控制点一个顶点
    pub vertices: Vec<Vertex>,

    /// 三角形列表索引
    pub indices: Vec<u32>,

    pub material: Material,
}

impl MeshData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// 索引格式：顶点数放得进 16 位时用 R16，否则 R32
    pub fn index_format(&self) -> Format {
        if self.vertices.len() <= u16::MAX as usize + 1 {
            Format::R16Uint
        } else {
            Format::R32Uint
        }
    }

    /// 按 `index_format` 打包的索引字节
    pub fn index_bytes(&self) -> Vec<u8> {
        match self.index_format() {
            Format::R16Uint => self
                .indices
                .iter()
                .flat_map(|&i| (i as u16).to_le_bytes())
                .collect(),
            _ => bytemuck::cast_slice(&self.indices).to_vec(),
        }
    }

    /// 验证网格数据的有效性
    ///
    /// 检查：
    /// - 索引数量是3的倍数（每个三角形3个顶点）
    /// - 所有索引都在有效范围内
    pub fn validate(&self) -> Result<()> {
        if self.indices.len() % 3 != 0 {
            return Err(MeshLoadError::InvalidGeometry(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            ))
            .into());
        }

        let vertex_count = self.vertices.len() as u32;
        if let Some((i, &index)) = self.indices.iter().enumerate().find(|(_, &v)| v >= vertex_count) {
            return Err(MeshLoadError::InvalidGeometry(format!(
                "index {} at position {} is out of range ({} vertices)",
                index, i, vertex_count
            ))
            .into());
        }
        Ok(())
    }

    /// 边长为 `size` 的立方体，每个面 4 个顶点
    ///
    /// 模型文件缺失时作为替代几何体。
    pub fn cube(size: f32) -> Self {
        let h = size * 0.5;
        // (法线, 切向 u, 切向 v)
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([0.0, 0.0, -1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, 1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ];

        let mut mesh = MeshData::with_name("cube");
        for (n, u, v) in faces {
            let base = mesh.vertices.len() as u32;
            for (su, sv, uv) in [(-1.0, -1.0, [0.0, 1.0]), (-1.0, 1.0, [0.0, 0.0]), (1.0, 1.0, [1.0, 0.0]), (1.0, -1.0, [1.0, 1.0])] {
                let position = [
                    (n[0] + u[0] * su + v[0] * sv) * h,
                    (n[1] + u[1] * su + v[1] * sv) * h,
                    (n[2] + u[2] * su + v[2] * sv) * h,
                ];
                mesh.vertices.push(Vertex::new(position, n, uv));
            }
            // 左手系顺时针为正面
            mesh.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }
}

/// 一个模型文件中的全部网格
#[derive(Debug, Clone, Default)]
pub struct ModelData {
    pub meshes: Vec<MeshData>,
}

impl ModelData {
    pub fn vertex_count(&self) -> usize {
        self.meshes.iter().map(MeshData::vertex_count).sum()
    }

    pub fn triangle_count(&self) -> usize {
        self.meshes.iter().map(MeshData::triangle_count).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.meshes.is_empty() {
            return Err(MeshLoadError::InvalidGeometry("model contains no meshes".to_string()).into());
        }
        self.meshes.iter().try_for_each(MeshData::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> MeshData {
        let mut mesh = MeshData::with_name("Triangle");
        mesh.vertices = vec![Vertex::default(); 3];
        mesh.indices = vec![0, 1, 2];
        mesh
    }

    #[test]
    fn test_mesh_data_counts() {
        let mesh = triangle();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.index_count(), 3);
        assert_eq!(mesh.triangle_count(), 1);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_indices() {
        let mut mesh = triangle();
        mesh.indices = vec![0, 1];
        assert!(mesh.validate().is_err());

        mesh.indices = vec![0, 1, 5];
        let err = mesh.validate().unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_index_format_switches_to_32_bit() {
        let mut mesh = triangle();
        assert_eq!(mesh.index_format(), Format::R16Uint);
        assert_eq!(mesh.index_bytes(), vec![0, 0, 1, 0, 2, 0]);

        mesh.vertices.resize(70_000, Vertex::default());
        mesh.indices = vec![0, 1, 69_999];
        assert_eq!(mesh.index_format(), Format::R32Uint);
        assert_eq!(mesh.index_bytes().len(), 12);
    }

    #[test]
    fn test_cube_is_valid() {
        let cube = MeshData::cube(2.0);
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.triangle_count(), 12);
        assert!(cube.validate().is_ok());
        assert!(cube
            .vertices
            .iter()
            .all(|v| v.position.iter().all(|c| c.abs() <= 1.0 + f32::EPSILON)));
    }

    #[test]
    fn test_empty_model_is_invalid() {
        assert!(ModelData::default().validate().is_err());
        let model = ModelData { meshes: vec![triangle()] };
        assert_eq!(model.triangle_count(), 1);
    }
}
