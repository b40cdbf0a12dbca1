//! 场景配置模块
//!
//! 从 `scene.toml` 读取相机、模型路径、实例变换、动画和清屏颜色。
//!
//! ```toml
//! clear_color = [0.2, 0.2, 0.5, 1.0]
//!
//! [camera]
//! eye = [0.0, 0.0, 5.0]
//! target = [0.0, 0.0, 0.0]
//! fov = 45.0
//!
//! [model]
//! path = "assets/test_a.fbx"
//!
//! [[model.instances]]
//! position = [-1.5, 0.0, 0.0]
//!
//! [[model.instances]]
//! position = [1.5, 0.0, 0.0]
//! scale = [0.5, 0.5, 0.5]
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::{ConfigError, Result, SandboxError};
use crate::core::math::{self, Matrix4, Vector3};

/// 3D 变换数据
///
/// 旋转为欧拉角（度数），顺序 pitch, yaw, roll。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default = "default_position")]
    pub position: [f32; 3],

    #[serde(default = "default_rotation")]
    pub rotation: [f32; 3],

    #[serde(default = "default_scale")]
    pub scale: [f32; 3],
}

fn default_position() -> [f32; 3] {
    [0.0, 0.0, 0.0]
}

fn default_rotation() -> [f32; 3] {
    [0.0, 0.0, 0.0]
}

fn default_scale() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: default_position(),
            rotation: default_rotation(),
            scale: default_scale(),
        }
    }
}

/// 相机配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// 相机位置
    #[serde(default = "default_eye")]
    pub eye: [f32; 3],

    /// 注视点
    #[serde(default)]
    pub target: [f32; 3],

    /// 垂直视野角度（度数）
    #[serde(default = "default_fov")]
    pub fov: f32,

    #[serde(default = "default_near_clip")]
    pub near_clip: f32,

    #[serde(default = "default_far_clip")]
    pub far_clip: f32,
}

fn default_eye() -> [f32; 3] {
    [0.0, 0.0, 5.0]
}

fn default_fov() -> f32 {
    45.0
}

fn default_near_clip() -> f32 {
    1.0
}

fn default_far_clip() -> f32 {
    1000.0
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            eye: default_eye(),
            target: [0.0, 0.0, 0.0],
            fov: default_fov(),
            near_clip: default_near_clip(),
            far_clip: default_far_clip(),
        }
    }
}

impl CameraConfig {
    /// 左手坐标系的视图矩阵，向上方向固定为 +Y
    pub fn view_matrix(&self) -> Matrix4 {
        math::look_at_lh(
            &Vector3::from(self.eye),
            &Vector3::from(self.target),
            &Vector3::y(),
        )
    }

    /// 透视投影矩阵
    pub fn projection_matrix(&self, aspect_ratio: f32) -> Matrix4 {
        math::perspective_fov_lh(math::deg_to_rad(self.fov), aspect_ratio, self.near_clip, self.far_clip)
    }
}

/// 模型配置
///
/// 同一个文件只加载一次，`instances` 中的每一项都是一个共享几何体的模型实例。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 模型文件路径
    pub path: String,

    /// 实例变换列表，为空时放置一个默认实例
    #[serde(default)]
    pub instances: Vec<Transform>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "assets/test_a.fbx".to_string(),
            instances: vec![Transform::default()],
        }
    }
}

impl ModelConfig {
    /// 实际使用的实例变换
    pub fn instance_transforms(&self) -> Vec<Transform> {
        if self.instances.is_empty() {
            vec![Transform::default()]
        } else {
            self.instances.clone()
        }
    }
}

/// 动画配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// 每帧绕 Y 轴增加的角度（弧度）
    #[serde(default = "default_rotation_speed")]
    pub rotation_speed: f32,
}

fn default_rotation_speed() -> f32 {
    0.01
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            rotation_speed: default_rotation_speed(),
        }
    }
}

/// 场景配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub animation: AnimationConfig,

    /// 清屏颜色 RGBA
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],
}

fn default_clear_color() -> [f32; 4] {
    [0.2, 0.2, 0.5, 1.0]
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            model: ModelConfig::default(),
            animation: AnimationConfig::default(),
            clear_color: default_clear_color(),
        }
    }
}

impl SceneConfig {
    /// 从文件加载场景配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(ConfigError::FileNotFound(format!(
                "Failed to read scene config file '{}': {}",
                path.display(),
                e
            )))
        })?;

        toml::from_str(&contents).map_err(|e| {
            SandboxError::Config(ConfigError::ParseError(format!(
                "Failed to parse scene config: {}",
                e
            )))
        })
    }

    /// 从文件加载，如果文件不存在则返回默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::from_file(path) {
                Ok(config) => {
                    tracing::info!("Loaded scene config from: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to load scene config: {}, using defaults", e);
                    Self::default()
                }
            }
        } else {
            tracing::info!("Scene config not found, using defaults");
            Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scene() {
        let scene = SceneConfig::default();
        assert_eq!(scene.camera.fov, 45.0);
        assert_eq!(scene.camera.eye, [0.0, 0.0, 5.0]);
        assert_eq!(scene.clear_color, [0.2, 0.2, 0.5, 1.0]);
        assert_eq!(scene.model.instance_transforms().len(), 1);
    }

    #[test]
    fn test_parse_instances() {
        let text = r#"
            [model]
            path = "assets/box.fbx"

            [[model.instances]]
            position = [-1.5, 0.0, 0.0]

            [[model.instances]]
            position = [1.5, 0.0, 0.0]
            scale = [0.5, 0.5, 0.5]
        "#;
        let scene: SceneConfig = toml::from_str(text).unwrap();
        let instances = scene.model.instance_transforms();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].scale, [0.5, 0.5, 0.5]);
        assert_eq!(instances[0].scale, [1.0, 1.0, 1.0]);
        assert_eq!(scene.animation.rotation_speed, 0.01);
    }

    #[test]
    fn test_empty_instances_fall_back_to_one() {
        let scene: SceneConfig = toml::from_str("[model]\npath = \"a.fbx\"\ninstances = []\n").unwrap();
        assert_eq!(scene.model.instance_transforms(), vec![Transform::default()]);
    }
}
