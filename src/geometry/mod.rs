/// 几何体与纹理加载模块
///
/// # 模块结构
///
/// - `vertex`: 顶点数据结构定义
/// - `mesh`: 网格、材质与模型数据
/// - `loaders`: FBX 模型加载器、DDS / 图片纹理加载器
///
/// # 架构设计
///
/// ```text
/// 文件 (FBX / DDS / PNG)
///     ↓
/// Loader (FbxLoader / load_texture)
///     ↓
/// ModelData / TextureImage (CPU侧数据)
///     ↓
/// component::Model (上传到GPU)
/// ```

pub mod loaders;
pub mod mesh;
pub mod vertex;

pub use mesh::{Material, MeshData, ModelData};
pub use vertex::Vertex;
