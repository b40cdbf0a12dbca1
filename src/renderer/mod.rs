//! 渲染器模块
//!
//! 与具体设备实现无关的 D3D12 命令模型，以及按帧驱动它的 `Renderer`。
//! 设备实现在 `gfx` 模块中（`gfx::dx12` 与 `gfx::headless`）。
//!
//! # 架构设计
//!
//! ```text
//! Renderer（每帧录制、提交、Present、等待）
//!     ↓
//! CommandContainer / CommandList / CommandQueue（录制与围栏）
//!     ↓
//! Resource / ResourceViewHeap / UploadContext（资源、视图与上传）
//!     ↓
//! Device → dyn GpuBackend
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::component::{Model, Transform};
use crate::core::error::{GraphicsError, Result};
use crate::core::math::Vector3;
use crate::core::scene::CameraConfig;
use crate::core::{Config, SceneConfig};
use crate::geometry::{MeshData, ModelData};

pub mod command;
pub mod descriptor;
pub mod device;
pub mod footprint;
pub mod pipeline;
pub mod resource;
pub mod sync;
pub mod texture;
pub mod upload;

use command::{CommandContainer, CommandList, PrimitiveTopology, ScissorRect, SubmitType, Viewport};
use descriptor::{DescriptorHandle, DescriptorHeapKind, ResourceViewHeap};
use device::{Device, PipelineHandle};
use pipeline::PipelineDesc;
use resource::{ClearValue, Format, Resource, ResourceDesc, ResourceFlags, ResourceState};
use sync::CommandQueue;
use texture::Texture;
use upload::UploadContext;

/// 深度缓冲格式
pub const DEPTH_FORMAT: Format = Format::D24UnormS8Uint;

/// Lambert 着色器
pub const SHADER_PATH: &str = "assets/shaders/lambert.hlsl";

/// 后备缓冲与深度缓冲，窗口尺寸变化时整体重建
struct RenderTargets {
    back_buffers: Vec<Resource>,
    back_buffer_views: Vec<DescriptorHandle>,
    _depth_buffer: Resource,
    depth_view: DescriptorHandle,
    width: u32,
    height: u32,
}

impl RenderTargets {
    fn create(device: &Device, rtv_heap: &ResourceViewHeap, dsv_heap: &ResourceViewHeap) -> Result<Self> {
        rtv_heap.reset();
        dsv_heap.reset();

        let (handles, format, (width, height)) = {
            let backend = device.backend();
            (backend.swap_chain_buffers(), backend.swap_chain_format(), backend.surface_size())
        };

        let mut desc = ResourceDesc::texture_2d(format, width, height, 1, 1);
        desc.flags = ResourceFlags::ALLOW_RENDER_TARGET;
        let back_buffers: Vec<Resource> = handles
            .into_iter()
            .map(|handle| Resource::swap_chain_buffer(device.clone(), handle, desc.clone()))
            .collect();
        let back_buffer_views = back_buffers
            .iter()
            .map(|buffer| rtv_heap.create_render_target_view(buffer))
            .collect::<Result<Vec<_>>>()?;

        let depth_buffer = device.create_committed_resource(
            ResourceDesc::depth_stencil(DEPTH_FORMAT, width, height),
            ResourceState::DEPTH_WRITE,
            Some(ClearValue::DepthStencil {
                format: DEPTH_FORMAT,
                depth: 1.0,
                stencil: 0,
            }),
        )?;
        let depth_view = dsv_heap.create_depth_stencil_view(&depth_buffer)?;

        debug!(width, height, buffers = back_buffers.len(), "Render targets created");
        Ok(Self {
            back_buffers,
            back_buffer_views,
            _depth_buffer: depth_buffer,
            depth_view,
            width,
            height,
        })
    }
}

/// 帧渲染器
///
/// 单线程：每帧录制一个直接命令列表，提交后 Present 并等待围栏，
/// 帧与帧之间没有重叠，所以常量缓冲和命令分配器都只需要一份。
pub struct Renderer {
    device: Device,
    queue: CommandQueue,
    container: CommandContainer,
    list: CommandList,
    pipeline: PipelineHandle,

    rtv_heap: ResourceViewHeap,
    dsv_heap: ResourceViewHeap,
    cbv_srv_heap: ResourceViewHeap,
    targets: Option<RenderTargets>,

    models: Vec<Model>,
    _fallback_texture: Texture,

    camera: CameraConfig,
    clear_color: [f32; 4],
    rotation_speed: f32,
    vsync: bool,
    use_bundles: bool,
    frame_count: u64,
}

impl Renderer {
    /// 创建渲染器：上传模型和纹理、创建管线与渲染目标
    pub fn new(device: Device, config: &Config, scene: &SceneConfig) -> Result<Self> {
        info!(device = device.name(), "Initializing renderer");

        let queue = CommandQueue::new(&device);
        let container = CommandContainer::new(&device, SubmitType::Direct)?;
        let list = container.create_command_list();

        let buffer_count = device.backend().swap_chain_buffers().len() as u32;
        let rtv_heap = ResourceViewHeap::new(&device, DescriptorHeapKind::Rtv, buffer_count)?;
        let dsv_heap = ResourceViewHeap::new(&device, DescriptorHeapKind::Dsv, 1)?;
        let targets = RenderTargets::create(&device, &rtv_heap, &dsv_heap)?;

        // 几何体和纹理一次上传，等待完成后才会被绘制读取
        let mut uploader = UploadContext::new(&device)?;
        let fallback_texture = Texture::solid_color(&mut uploader, [255, 255, 255, 255])?;
        let mut models = load_models(&mut uploader, scene)?;
        uploader.finish(&queue)?;

        let descriptor_count = models.iter().map(Model::descriptor_count).sum::<u32>();
        let cbv_srv_heap = ResourceViewHeap::new(&device, DescriptorHeapKind::CbvSrvUav, descriptor_count)?;
        for model in &mut models {
            model.setup_buffers(&device, &cbv_srv_heap, &fallback_texture)?;
        }

        let format = device.backend().swap_chain_format();
        let pipeline = device
            .backend()
            .create_pipeline(&PipelineDesc::lambert(shader_path(), format, DEPTH_FORMAT))?;

        if config.graphics.use_bundles {
            for model in &mut models {
                model.record_bundle(&device, pipeline)?;
            }
        }

        info!(
            instances = models.len(),
            descriptors = descriptor_count,
            bundles = config.graphics.use_bundles,
            "Renderer initialized"
        );

        Ok(Self {
            device,
            queue,
            container,
            list,
            pipeline,
            rtv_heap,
            dsv_heap,
            cbv_srv_heap,
            targets: Some(targets),
            models,
            _fallback_texture: fallback_texture,
            camera: scene.camera.clone(),
            clear_color: scene.clear_color,
            rotation_speed: scene.animation.rotation_speed,
            vsync: config.graphics.vsync,
            use_bundles: config.graphics.use_bundles,
            frame_count: 0,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [Model] {
        &mut self.models
    }

    /// 已完成的帧数
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// 当前渲染目标尺寸
    pub fn surface_size(&self) -> (u32, u32) {
        self.targets.as_ref().map(|t| (t.width, t.height)).unwrap_or((0, 0))
    }

    /// 旋转所有实例并写入本帧的常量
    pub fn update(&mut self) -> Result<()> {
        let (width, height) = self.surface_size();
        let aspect = width as f32 / height.max(1) as f32;
        let view = self.camera.view_matrix();
        let proj = self.camera.projection_matrix(aspect);
        let spin = Vector3::new(0.0, self.rotation_speed.to_degrees(), 0.0);

        for model in &mut self.models {
            model.transform_mut().add_euler_angle(spin);
            // 没有常量缓冲的实例在绘制时报错
            if model.has_buffers() {
                model.update_constants(&view, &proj)?;
            }
        }
        Ok(())
    }

    /// 录制并提交一帧，返回时 GPU 已执行完毕
    ///
    /// 录制失败时列表被放弃，后备缓冲的状态回到 PRESENT，下一帧可以正常开始。
    pub fn render_frame(&mut self) -> Result<()> {
        self.update()?;

        // 上一帧已在返回前等待完成
        self.container.clear_state(&self.queue)?;

        let index = self.device.backend().current_back_buffer_index();
        if let Err(e) = self.record_frame(index) {
            self.list.abandon();
            if let Some(back_buffer) = self.targets.as_ref().and_then(|t| t.back_buffers.get(index)) {
                back_buffer.set_state(ResourceState::PRESENT);
            }
            warn!(error = %e, frame = self.frame_count, "Frame recording failed, command list abandoned");
            return Err(e);
        }

        self.queue.enqueue(&self.list)?;
        self.device.backend().present(self.vsync)?;
        self.queue.wait_for_execution()?;

        self.frame_count += 1;
        tracing::trace!(frame = self.frame_count, back_buffer = index, "Frame presented");
        Ok(())
    }

    /// 录制第 `index` 个后备缓冲的一帧，成功时列表已关闭
    fn record_frame(&mut self, index: usize) -> Result<()> {
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| GraphicsError::SwapchainError("render targets not created".to_string()))?;
        let back_buffer = targets
            .back_buffers
            .get(index)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("back buffer {} does not exist", index)))?;
        let rtv = targets.back_buffer_views[index];

        let list = &mut self.list;
        list.open(Some(self.pipeline))?;
        list.set_descriptor_heap(&self.cbv_srv_heap)?;
        list.set_pipeline(self.pipeline)?;
        list.set_viewport(Viewport::full(targets.width, targets.height))?;
        list.set_scissor_rect(ScissorRect::full(targets.width, targets.height))?;

        list.transition(back_buffer, ResourceState::RENDER_TARGET)?;
        list.set_render_targets(rtv, Some(targets.depth_view))?;
        list.clear_render_target(rtv, self.clear_color)?;
        list.clear_depth_stencil(targets.depth_view, 1.0, 0)?;
        list.set_primitive_topology(PrimitiveTopology::TriangleList)?;

        for model in &self.models {
            match model.bundle() {
                Some(bundle) if self.use_bundles => list.execute_bundle(bundle)?,
                _ => model.draw(list)?,
            }
        }

        list.transition(back_buffer, ResourceState::PRESENT)?;
        list.close()
    }

    /// 调整交换链尺寸
    ///
    /// 先等待 GPU 空闲，释放后备缓冲的引用和深度缓冲，再重建。
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            debug!("Window minimized, skipping resize");
            return Ok(());
        }
        if self.surface_size() == (width, height) {
            return Ok(());
        }

        self.queue.flush()?;
        self.targets = None;
        self.device.backend().resize_swap_chain(width, height)?;
        self.targets = Some(RenderTargets::create(&self.device, &self.rtv_heap, &self.dsv_heap)?);

        info!(width, height, "Swap chain resized");
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // 资源释放前 GPU 必须已经不再引用它们
        if let Err(e) = self.queue.flush() {
            tracing::error!(error = %e, "Failed to flush queue on shutdown");
        }
        info!(frames = self.frame_count, "Renderer destroyed");
    }
}

/// 在工作目录或 crate 目录下查找资源文件
fn resolve_asset(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    if path.exists() {
        return Some(path.to_path_buf());
    }
    let fallback = Path::new(env!("CARGO_MANIFEST_DIR")).join(path);
    fallback.exists().then_some(fallback)
}

fn shader_path() -> PathBuf {
    resolve_asset(SHADER_PATH).unwrap_or_else(|| PathBuf::from(SHADER_PATH))
}

/// 加载模型文件并按场景配置创建实例
///
/// 第一个实例持有加载的几何体，其余实例都是它的引用。
/// 模型文件不存在时用立方体代替。
fn load_models(uploader: &mut UploadContext, scene: &SceneConfig) -> Result<Vec<Model>> {
    let owner = match resolve_asset(&scene.model.path) {
        Some(path) => Model::load(uploader, "instance0", &path)?,
        None => {
            warn!(path = %scene.model.path, "Model file not found, using a cube");
            let data = ModelData {
                meshes: vec![MeshData::cube(1.0)],
            };
            Model::from_data(uploader, "instance0", &data)?
        }
    };

    let transforms = scene.model.instance_transforms();
    let mut models = Vec::with_capacity(transforms.len());
    models.push(owner);
    for i in 1..transforms.len() {
        let reference = models[0].create_reference(format!("instance{}", i));
        models.push(reference);
    }
    for (model, transform) in models.iter_mut().zip(&transforms) {
        *model.transform_mut() = Transform::from_config(transform);
    }
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GraphicsBackend;
    use crate::core::scene;
    use crate::gfx::headless::{HeadlessBackend, HeadlessInspector};

    fn scene_with_instances(count: usize) -> SceneConfig {
        let mut scene = SceneConfig::default();
        scene.model.path = "does/not/exist.fbx".to_string();
        scene.model.instances = (0..count)
            .map(|i| scene::Transform {
                position: [i as f32 * 2.0, 0.0, 0.0],
                ..scene::Transform::default()
            })
            .collect();
        scene
    }

    fn renderer(instances: usize, use_bundles: bool) -> (Renderer, HeadlessInspector) {
        let backend = HeadlessBackend::new(64, 32);
        let inspector = backend.inspector();
        let mut config = Config::default();
        config.graphics.backend = GraphicsBackend::Headless;
        config.graphics.use_bundles = use_bundles;

        let renderer = Renderer::new(Device::new(Box::new(backend)), &config, &scene_with_instances(instances)).unwrap();
        (renderer, inspector)
    }

    #[test]
    fn test_instances_share_one_geometry() {
        let (renderer, _inspector) = renderer(3, false);
        let models = renderer.models();
        assert_eq!(models.len(), 3);
        assert!(models[1].shares_geometry_with(&models[0]));
        assert!(models[2].shares_geometry_with(&models[0]));
        assert_eq!(models[0].geometry_users(), 3);
        assert_eq!(models[2].transform().position(), Vector3::new(4.0, 0.0, 0.0));
    }

    #[test]
    fn test_scene_without_instances_draws_one_model() {
        let (renderer, _inspector) = renderer(0, false);
        assert_eq!(renderer.models().len(), 1);
        assert!(renderer.models()[0].has_buffers());
    }

    #[test]
    fn test_frames_draw_every_instance() {
        let (mut renderer, inspector) = renderer(3, false);
        renderer.render_frame().unwrap();
        renderer.render_frame().unwrap();

        let stats = inspector.stats();
        assert_eq!(stats.draw_calls, 6);
        assert_eq!(stats.presents, 2);
        assert_eq!(renderer.frame_count(), 2);
        assert_eq!(inspector.pending_items(), 0);
    }

    #[test]
    fn test_frames_with_bundles() {
        let (mut renderer, inspector) = renderer(2, true);
        assert!(renderer.models().iter().all(|m| m.bundle().is_some()));
        assert_eq!(inspector.live_bundles(), 2);

        renderer.render_frame().unwrap();
        assert_eq!(inspector.stats().draw_calls, 2);
    }

    #[test]
    fn test_back_buffer_returns_to_present() {
        let (mut renderer, inspector) = renderer(1, false);
        renderer.render_frame().unwrap();

        let buffers = renderer.device().backend().swap_chain_buffers();
        for buffer in buffers {
            assert_eq!(inspector.resource_state(buffer), Some(ResourceState::PRESENT));
        }
    }

    #[test]
    fn test_rotation_advances_each_frame() {
        let (mut renderer, _inspector) = renderer(1, false);
        renderer.render_frame().unwrap();
        renderer.render_frame().unwrap();

        let yaw = renderer.models()[0].transform().euler_angle().y;
        assert!((yaw - 2.0 * 0.01f32.to_degrees()).abs() < 1e-4);
    }

    #[test]
    fn test_resize_recreates_targets() {
        let (mut renderer, inspector) = renderer(1, false);
        renderer.render_frame().unwrap();

        renderer.resize(128, 64).unwrap();
        assert_eq!(renderer.surface_size(), (128, 64));
        renderer.render_frame().unwrap();

        // 最小化时保持原尺寸
        renderer.resize(0, 0).unwrap();
        assert_eq!(renderer.surface_size(), (128, 64));
        assert_eq!(inspector.stats().presents, 2);
    }

    #[test]
    fn test_failed_frame_does_not_wedge_the_renderer() {
        let (mut renderer, inspector) = renderer(2, false);
        renderer.render_frame().unwrap();

        // 没有 setup_buffers 的实例无法绘制
        let unprepared = renderer.models()[0].create_reference("unprepared");
        renderer.models.push(unprepared);
        assert!(renderer.render_frame().is_err());
        assert_eq!(renderer.frame_count(), 1);
        assert!(!renderer.list.is_open());
        for buffer in &renderer.targets.as_ref().unwrap().back_buffers {
            assert_eq!(buffer.state(), ResourceState::PRESENT);
        }

        renderer.models.pop();
        renderer.render_frame().unwrap();
        renderer.render_frame().unwrap();
        assert_eq!(renderer.frame_count(), 3);
        assert_eq!(inspector.stats().presents, 3);
        assert_eq!(inspector.stats().draw_calls, 6);
        assert_eq!(inspector.pending_items(), 0);
    }

    #[test]
    fn test_dropping_owner_keeps_references_drawable() {
        let (mut renderer, inspector) = renderer(2, false);
        renderer.models.remove(0);
        renderer.render_frame().unwrap();
        assert_eq!(inspector.stats().draw_calls, 1);
    }
}
