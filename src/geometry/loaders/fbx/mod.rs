/// FBX 文件加载器
///
/// 直接解析二进制 FBX 7.x（不依赖 FBX SDK）：
///
/// - `binary`: 节点树与属性解析，支持 zlib 压缩数组
/// - `scene`: 对象连接、法线平均、UV、扇形三角化、Lambert 材质
use std::path::{Path, PathBuf};

use super::MeshLoader;
use crate::core::error::{MeshLoadError, Result};
use crate::geometry::mesh::ModelData;

pub mod binary;
pub mod scene;

/// FBX 格式加载器
pub struct FbxLoader;

impl FbxLoader {
    /// 纹理文件名按原样、相对模型目录、模型目录下的文件名依次查找
    fn resolve_texture(base_dir: &Path, texture: &Path) -> PathBuf {
        let candidates = [
            texture.to_path_buf(),
            base_dir.join(texture),
            texture
                .file_name()
                .map(|name| base_dir.join(name))
                .unwrap_or_else(|| base_dir.join(texture)),
        ];
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .unwrap_or_else(|| base_dir.join(texture))
    }
}

impl MeshLoader for FbxLoader {
    fn load_from_file(path: &Path) -> Result<ModelData> {
        if !path.exists() {
            return Err(MeshLoadError::FileNotFound(path.to_path_buf()).into());
        }

        let data = std::fs::read(path)?;
        let mut model = Self::load_from_memory(&data)?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        for mesh in &mut model.meshes {
            if let Some(texture) = mesh.material.texture.take() {
                mesh.material.texture = Some(Self::resolve_texture(base_dir, &texture));
            }
        }

        tracing::info!(
            path = %path.display(),
            meshes = model.meshes.len(),
            vertices = model.vertex_count(),
            triangles = model.triangle_count(),
            "FBX model loaded"
        );
        Ok(model)
    }

    fn load_from_memory(data: &[u8]) -> Result<ModelData> {
        let document = binary::parse(data)?;
        scene::build_model(&document)
    }

    fn supported_extensions() -> &'static [&'static str] {
        &["fbx"]
    }
}
