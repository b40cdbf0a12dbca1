//! 数学库
//!
//! 基于 `nalgebra`，只保留沙盒需要的类型和 D3D 风格的矩阵构造。
//!
//! 矩阵使用列向量约定（`clip = proj * view * world * pos`），
//! 以 nalgebra 的列主序直接写入常量缓冲区，HLSL 默认的 column_major
//! 打包读到的就是同一个矩阵，不需要转置。

pub use nalgebra::{Matrix4 as Mat4, Point3, Vector3 as Vec3, Vector4 as Vec4};

pub type Vector3 = Vec3<f32>;
pub type Vector4 = Vec4<f32>;
pub type Matrix4 = Mat4<f32>;

/// 角度转弧度
pub fn deg_to_rad(degrees: f32) -> f32 {
    degrees * std::f32::consts::PI / 180.0
}

/// 左手坐标系的观察矩阵（对应 XMMatrixLookAtLH）
pub fn look_at_lh(eye: &Vector3, target: &Vector3, up: &Vector3) -> Matrix4 {
    let z = (target - eye).normalize();
    let x = up.cross(&z).normalize();
    let y = z.cross(&x);

    Matrix4::new(
        x.x, x.y, x.z, -x.dot(eye),
        y.x, y.y, y.z, -y.dot(eye),
        z.x, z.y, z.z, -z.dot(eye),
        0.0, 0.0, 0.0, 1.0,
    )
}

/// 左手坐标系的透视投影（对应 XMMatrixPerspectiveFovLH），深度范围 [0, 1]
pub fn perspective_fov_lh(fov_y: f32, aspect: f32, near: f32, far: f32) -> Matrix4 {
    let h = 1.0 / (fov_y * 0.5).tan();
    let w = h / aspect;
    let r = far / (far - near);

    Matrix4::new(
        w, 0.0, 0.0, 0.0,
        0.0, h, 0.0, 0.0,
        0.0, 0.0, r, -r * near,
        0.0, 0.0, 1.0, 0.0,
    )
}

/// 绕 Y 轴旋转（弧度）
pub fn rotation_y(angle: f32) -> Matrix4 {
    Matrix4::from_axis_angle(&Vector3::y_axis(), angle)
}
