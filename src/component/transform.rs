//! Transform 组件
//!
//! 管理模型实例的位置、旋转和缩放，世界矩阵按需重算

use crate::core::math::{deg_to_rad, Matrix4, Vector3};
use crate::core::scene;

/// Transform 组件
#[derive(Debug, Clone)]
pub struct Transform {
    position: Vector3,

    /// 欧拉角（度数）
    euler_angle: Vector3,

    scale: Vector3,

    /// 世界矩阵缓存
    world_matrix: Matrix4,

    /// 世界矩阵是否需要更新
    world_dirty: bool,
}

impl Transform {
    pub fn new() -> Self {
        Self {
            position: Vector3::zeros(),
            euler_angle: Vector3::zeros(),
            scale: Vector3::new(1.0, 1.0, 1.0),
            world_matrix: Matrix4::identity(),
            world_dirty: true,
        }
    }

    /// 从 `scene.toml` 的实例描述创建
    pub fn from_config(config: &scene::Transform) -> Self {
        let mut transform = Self::new();
        transform.set_position(Vector3::from(config.position));
        transform.set_euler_angle(Vector3::from(config.rotation));
        transform.set_scale(Vector3::from(config.scale));
        transform
    }

    pub fn position(&self) -> Vector3 {
        self.position
    }

    pub fn euler_angle(&self) -> Vector3 {
        self.euler_angle
    }

    pub fn scale(&self) -> Vector3 {
        self.scale
    }

    pub fn set_position(&mut self, position: Vector3) {
        self.position = position;
        self.world_dirty = true;
    }

    /// 设置欧拉角（度数）
    pub fn set_euler_angle(&mut self, euler: Vector3) {
        self.euler_angle = euler;
        self.world_dirty = true;
    }

    pub fn set_scale(&mut self, scale: Vector3) {
        self.scale = scale;
        self.world_dirty = true;
    }

    /// 添加旋转偏移（度数）
    pub fn add_euler_angle(&mut self, offset: Vector3) {
        self.euler_angle += offset;
        self.world_dirty = true;
    }

    /// 获取世界矩阵
    pub fn world_matrix(&mut self) -> Matrix4 {
        if self.world_dirty {
            self.update_world_matrix();
        }
        self.world_matrix
    }

    fn update_world_matrix(&mut self) {
        let pitch = deg_to_rad(self.euler_angle.x);
        let yaw = deg_to_rad(self.euler_angle.y);
        let roll = deg_to_rad(self.euler_angle.z);

        let translation = Matrix4::new_translation(&self.position);
        let rotation = Matrix4::from_axis_angle(&Vector3::z_axis(), roll)
            * Matrix4::from_axis_angle(&Vector3::y_axis(), yaw)
            * Matrix4::from_axis_angle(&Vector3::x_axis(), pitch);
        let scale = Matrix4::new_nonuniform_scaling(&self.scale);

        // 组合：T * R * S
        self.world_matrix = translation * rotation * scale;
        self.world_dirty = false;
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::Vector4;

    #[test]
    fn test_identity_by_default() {
        let mut transform = Transform::default();
        assert_eq!(transform.world_matrix(), Matrix4::identity());
    }

    #[test]
    fn test_trs_order() {
        let mut transform = Transform::new();
        transform.set_scale(Vector3::new(2.0, 2.0, 2.0));
        transform.set_euler_angle(Vector3::new(0.0, 90.0, 0.0));
        transform.set_position(Vector3::new(10.0, 0.0, 0.0));

        // (1,0,0) 缩放到 (2,0,0)，绕 Y 转 90° 到 (0,0,-2)，再平移
        let p = transform.world_matrix() * Vector4::new(1.0, 0.0, 0.0, 1.0);
        assert!((p.x - 10.0).abs() < 1e-5);
        assert!((p.z + 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_cache_invalidated_on_change() {
        let mut transform = Transform::new();
        let before = transform.world_matrix();
        transform.add_euler_angle(Vector3::new(0.0, 45.0, 0.0));
        assert_ne!(transform.world_matrix(), before);
    }

    #[test]
    fn test_from_config() {
        let config = scene::Transform {
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.0, 0.0],
            scale: [1.0, 1.0, 1.0],
        };
        let mut transform = Transform::from_config(&config);
        let m = transform.world_matrix();
        assert_eq!((m[(0, 3)], m[(1, 3)], m[(2, 3)]), (1.0, 2.0, 3.0));
    }
}
