/// 模型与纹理加载器
///
/// - **FBX**: 二进制 FBX 7.x，自带解析器
/// - **DDS**: 块压缩 / 未压缩 / DX10 扩展头
/// - 其他图片格式通过 `image` crate 转成 RGBA8
use std::path::Path;

use crate::core::error::{MeshLoadError, Result};
use crate::geometry::mesh::ModelData;

pub mod dds;
pub mod fbx;
pub mod texture;

pub use fbx::FbxLoader;
pub use texture::{load_texture, TextureImage};

/// 网格加载器 trait
///
/// 所有格式的加载器都实现此 trait，返回 CPU 侧的 `ModelData`，不涉及 GPU 资源。
pub trait MeshLoader {
    /// 从文件路径加载
    ///
    /// # 错误
    ///
    /// - 文件不存在或无法读取
    /// - 文件格式错误或损坏
    /// - 数据验证失败
    fn load_from_file(path: &Path) -> Result<ModelData>;

    /// 从内存数据加载
    fn load_from_memory(data: &[u8]) -> Result<ModelData>;

    /// 支持的文件扩展名（小写，不含点号）
    fn supported_extensions() -> &'static [&'static str];
}

/// 根据文件扩展名选择加载器
pub fn load_model(path: &Path) -> Result<ModelData> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .ok_or_else(|| MeshLoadError::UnsupportedFormat(format!("{} has no extension", path.display())))?;

    match extension.as_str() {
        ext if FbxLoader::supported_extensions().contains(&ext) => FbxLoader::load_from_file(path),
        _ => Err(MeshLoadError::UnsupportedFormat(format!("unsupported model format: .{}", extension)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_extensions() {
        assert!(FbxLoader::supported_extensions().contains(&"fbx"));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = load_model(Path::new("model.obj")).unwrap_err();
        assert!(err.to_string().contains(".obj"));
        assert!(load_model(Path::new("model")).is_err());
    }
}
