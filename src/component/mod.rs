//! 组件模块
//!
//! 模型实例与它的变换。
//!
//! - `Transform`：位置、欧拉角、缩放和缓存的世界矩阵
//! - `Model`：共享 `ModelGeometry` 的模型实例，持有自己的常量缓冲和描述符

mod model;
mod transform;

pub use model::{GpuMesh, Model, ModelGeometry, ModelTransform};
pub use transform::Transform;
