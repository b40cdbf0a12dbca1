//! 模型与模型引用
//!
//! 一个 FBX 文件上传一次得到 `ModelGeometry`（顶点、索引、材质纹理），
//! 之后任意多个 `Model` 实例通过 `Rc` 共享它。每个实例有自己的
//! `Transform`、常量缓冲和描述符；任何实例（包括最初加载的那个）析构时
//! 都不会释放其他实例仍在使用的几何体。

use std::path::Path;
use std::rc::Rc;

use bytemuck::{Pod, Zeroable};

use super::transform::Transform;
use crate::core::error::Result;
use crate::core::math::Matrix4;
use crate::geometry::loaders::load_model;
use crate::geometry::{Material, ModelData, Vertex};
use crate::renderer::command::{CommandContainer, CommandList, PrimitiveTopology, SubmitType};
use crate::renderer::descriptor::{DescriptorHandle, ResourceViewHeap};
use crate::renderer::device::{Device, PipelineHandle};
use crate::renderer::pipeline::{ROOT_TEXTURE_TABLE, ROOT_TRANSFORM_TABLE};
use crate::renderer::resource::{ConstantBuffer, Format, Resource};
use crate::renderer::texture::Texture;
use crate::renderer::upload::UploadContext;

/// 顶点着色器的常量（World / View / Proj）
///
/// 矩阵按 nalgebra 的列主序写入，与 HLSL 默认的 column_major 打包一致。
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ModelTransform {
    pub world: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl ModelTransform {
    pub fn new(world: &Matrix4, view: &Matrix4, proj: &Matrix4) -> Self {
        Self {
            world: (*world).into(),
            view: (*view).into(),
            proj: (*proj).into(),
        }
    }
}

/// GPU 上的一个网格
pub struct GpuMesh {
    name: String,
    vertex_buffer: Resource,
    index_buffer: Resource,
    index_count: u32,
    index_format: Format,
    material: Material,
    texture: Option<Texture>,
}

impl GpuMesh {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn index_format(&self) -> Format {
        self.index_format
    }

    pub fn material(&self) -> &Material {
        &self.material
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    pub fn vertex_buffer(&self) -> &Resource {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &Resource {
        &self.index_buffer
    }
}

/// 多个模型实例共享的几何体
pub struct ModelGeometry {
    meshes: Vec<GpuMesh>,
}

impl ModelGeometry {
    /// 录制全部网格和材质纹理的上传
    ///
    /// 纹理加载失败只记录警告，绘制时改用替代纹理。
    pub fn upload(uploader: &mut UploadContext, data: &ModelData) -> Result<Self> {
        data.validate()?;

        let mut meshes = Vec::with_capacity(data.meshes.len());
        for (i, mesh) in data.meshes.iter().enumerate() {
            let vertex_buffer = uploader.create_default_buffer(bytemuck::cast_slice(&mesh.vertices))?;
            let index_buffer = uploader.create_default_buffer(&mesh.index_bytes())?;

            let texture = match &mesh.material.texture {
                Some(path) => match Texture::from_file(uploader, path) {
                    Ok(texture) => Some(texture),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Material texture unavailable, using fallback");
                        None
                    }
                },
                None => None,
            };

            meshes.push(GpuMesh {
                name: mesh.name.clone().unwrap_or_else(|| format!("mesh{}", i)),
                vertex_buffer,
                index_buffer,
                index_count: mesh.index_count() as u32,
                index_format: mesh.index_format(),
                material: mesh.material.clone(),
                texture,
            });
        }

        Ok(Self { meshes })
    }

    pub fn meshes(&self) -> &[GpuMesh] {
        &self.meshes
    }
}

/// 每帧重放的绘制命令
struct ModelBundle {
    // 列表先于容器析构
    list: CommandList,
    _container: CommandContainer,
}

/// 模型实例
pub struct Model {
    name: String,
    geometry: Rc<ModelGeometry>,
    transform: Transform,
    constants: Option<ConstantBuffer<ModelTransform>>,
    transform_view: Option<DescriptorHandle>,
    texture_views: Vec<DescriptorHandle>,
    bundle: Option<ModelBundle>,
}

impl Model {
    /// 加载模型文件，录制几何体上传
    pub fn load(uploader: &mut UploadContext, name: impl Into<String>, path: &Path) -> Result<Self> {
        let data = load_model(path)?;
        Self::from_data(uploader, name, &data)
    }

    /// 从 CPU 侧模型数据创建
    pub fn from_data(uploader: &mut UploadContext, name: impl Into<String>, data: &ModelData) -> Result<Self> {
        let geometry = ModelGeometry::upload(uploader, data)?;
        let name = name.into();
        tracing::info!(
            model = %name,
            meshes = geometry.meshes.len(),
            vertices = data.vertex_count(),
            "Model geometry uploaded"
        );
        Ok(Self::with_geometry(name, Rc::new(geometry)))
    }

    fn with_geometry(name: String, geometry: Rc<ModelGeometry>) -> Self {
        Self {
            name,
            geometry,
            transform: Transform::new(),
            constants: None,
            transform_view: None,
            texture_views: Vec::new(),
            bundle: None,
        }
    }

    /// 共享几何体的新实例
    ///
    /// 变换为单位变换，常量缓冲和描述符需要再调用 `setup_buffers`。
    pub fn create_reference(&self, name: impl Into<String>) -> Model {
        Self::with_geometry(name.into(), Rc::clone(&self.geometry))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> &ModelGeometry {
        &self.geometry
    }

    /// 是否与 `other` 共享几何体
    pub fn shares_geometry_with(&self, other: &Model) -> bool {
        Rc::ptr_eq(&self.geometry, &other.geometry)
    }

    /// 共享同一几何体的实例数
    pub fn geometry_users(&self) -> usize {
        Rc::strong_count(&self.geometry)
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn transform_mut(&mut self) -> &mut Transform {
        &mut self.transform
    }

    /// 每个实例需要的 CBV/SRV 描述符数
    pub fn descriptor_count(&self) -> u32 {
        1 + self.geometry.meshes.len() as u32
    }

    /// 创建常量缓冲，在 `heap` 上创建 CBV 和每个网格的 SRV
    ///
    /// 没有纹理的网格使用 `fallback`。
    pub fn setup_buffers(&mut self, device: &Device, heap: &ResourceViewHeap, fallback: &Texture) -> Result<()> {
        let constants = ConstantBuffer::<ModelTransform>::new(device, 1)?;
        let transform_view = heap.create_constant_buffer_view(constants.view_desc(0))?;

        let texture_views = self
            .geometry
            .meshes
            .iter()
            .map(|mesh| mesh.texture.as_ref().unwrap_or(fallback).create_view(heap))
            .collect::<Result<Vec<_>>>()?;

        self.constants = Some(constants);
        self.transform_view = Some(transform_view);
        self.texture_views = texture_views;
        // 旧的 bundle 引用旧的描述符
        self.bundle = None;
        Ok(())
    }

    pub fn has_buffers(&self) -> bool {
        self.constants.is_some()
    }

    /// 写入常量
    pub fn set_transform(&self, constants: &ModelTransform) -> Result<()> {
        self.constants
            .as_ref()
            .ok_or_else(|| not_set_up(&self.name))?
            .write(0, constants)
    }

    /// 用自己的世界矩阵和给定的相机矩阵更新常量
    pub fn update_constants(&mut self, view: &Matrix4, proj: &Matrix4) -> Result<()> {
        let world = self.transform.world_matrix();
        self.set_transform(&ModelTransform::new(&world, view, proj))
    }

    /// 设置第 `mesh` 个网格的根描述符表
    pub fn set_root_descriptor_tables(&self, list: &mut CommandList, mesh: usize) -> Result<()> {
        let transform_view = self.transform_view.ok_or_else(|| not_set_up(&self.name))?;
        let texture_view = *self.texture_views.get(mesh).ok_or_else(|| not_set_up(&self.name))?;
        list.set_root_descriptor_table(ROOT_TRANSFORM_TABLE, transform_view)?;
        list.set_root_descriptor_table(ROOT_TEXTURE_TABLE, texture_view)
    }

    /// 录制全部网格的绘制
    pub fn draw(&self, list: &mut CommandList) -> Result<()> {
        for (i, mesh) in self.geometry.meshes.iter().enumerate() {
            self.set_root_descriptor_tables(list, i)?;
            list.set_vertex_buffer(mesh.vertex_buffer.vertex_buffer_view(std::mem::size_of::<Vertex>() as u32)?)?;
            list.set_index_buffer(mesh.index_buffer.index_buffer_view(mesh.index_format)?)?;
            list.draw_indexed_instanced(mesh.index_count, 1, 0, 0, 0)?;
        }
        Ok(())
    }

    /// 把绘制命令录制成 bundle
    pub fn record_bundle(&mut self, device: &Device, pipeline: PipelineHandle) -> Result<()> {
        let container = CommandContainer::new(device, SubmitType::Bundle)?;
        let mut list = container.create_command_list();
        list.open(Some(pipeline))?;
        list.set_primitive_topology(PrimitiveTopology::TriangleList)?;
        self.draw(&mut list)?;
        list.close()?;

        tracing::debug!(model = %self.name, commands = list.commands().len(), "Model bundle recorded");
        self.bundle = Some(ModelBundle {
            list,
            _container: container,
        });
        Ok(())
    }

    /// 录制好的 bundle
    pub fn bundle(&self) -> Option<&CommandList> {
        self.bundle.as_ref().map(|b| &b.list)
    }
}

fn not_set_up(name: &str) -> crate::core::error::SandboxError {
    crate::core::error::SandboxError::validation(format!("model '{}' has no buffers, call setup_buffers first", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MeshData;
    use crate::gfx::headless::{HeadlessBackend, HeadlessInspector};
    use crate::renderer::command::{ScissorRect, Viewport};
    use crate::renderer::descriptor::DescriptorHeapKind;
    use crate::renderer::pipeline::PipelineDesc;
    use crate::renderer::resource::{ResourceDesc, ResourceFlags, ResourceState};
    use crate::renderer::sync::CommandQueue;

    struct Fixture {
        device: Device,
        queue: CommandQueue,
        inspector: HeadlessInspector,
        fallback: Texture,
        model: Model,
    }

    fn fixture() -> Fixture {
        let backend = HeadlessBackend::new(8, 8);
        let inspector = backend.inspector();
        let device = Device::new(Box::new(backend));
        let queue = CommandQueue::new(&device);

        let mut uploader = UploadContext::new(&device).unwrap();
        let fallback = Texture::solid_color(&mut uploader, [255; 4]).unwrap();
        let data = ModelData {
            meshes: vec![MeshData::cube(1.0)],
        };
        let model = Model::from_data(&mut uploader, "owner", &data).unwrap();
        uploader.finish(&queue).unwrap();

        Fixture {
            device,
            queue,
            inspector,
            fallback,
            model,
        }
    }

    /// 录制一帧：清屏、绘制给定模型、提交并等待
    fn render(f: &Fixture, models: &[&Model], heap: &ResourceViewHeap, use_bundles: bool) -> crate::core::error::Result<()> {
        let pipeline = f.device.backend().create_pipeline(&PipelineDesc::lambert(
            "unused.hlsl",
            Format::R8G8B8A8UnormSrgb,
            Format::D24UnormS8Uint,
        ))?;

        let rtv_heap = ResourceViewHeap::new(&f.device, DescriptorHeapKind::Rtv, 1)?;
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8UnormSrgb, 8, 8, 1, 1);
        desc.flags = ResourceFlags::ALLOW_RENDER_TARGET;
        let target = f.device.create_committed_resource(desc, ResourceState::RENDER_TARGET, None)?;
        let rtv = rtv_heap.create_render_target_view(&target)?;

        let container = CommandContainer::new(&f.device, SubmitType::Direct)?;
        let mut list = container.create_command_list();
        list.open(Some(pipeline))?;
        list.set_descriptor_heap(heap)?;
        list.set_viewport(Viewport::full(8, 8))?;
        list.set_scissor_rect(ScissorRect::full(8, 8))?;
        list.set_render_targets(rtv, None)?;
        list.set_primitive_topology(PrimitiveTopology::TriangleList)?;
        for model in models {
            match (use_bundles, model.bundle()) {
                (true, Some(bundle)) => list.execute_bundle(bundle)?,
                _ => model.draw(&mut list)?,
            }
        }
        list.close()?;
        f.queue.enqueue(&list)?;
        f.queue.wait_for_execution()
    }

    #[test]
    fn test_references_share_geometry() {
        let f = fixture();
        let reference = f.model.create_reference("copy");

        assert!(reference.shares_geometry_with(&f.model));
        assert_eq!(f.model.geometry_users(), 2);
        assert!(!reference.has_buffers());
        assert_eq!(reference.descriptor_count(), 2);
    }

    #[test]
    fn test_each_instance_has_its_own_constants() {
        let mut f = fixture();
        let heap = ResourceViewHeap::new(&f.device, DescriptorHeapKind::CbvSrvUav, 4).unwrap();
        let mut reference = f.model.create_reference("copy");
        f.model.setup_buffers(&f.device, &heap, &f.fallback).unwrap();
        reference.setup_buffers(&f.device, &heap, &f.fallback).unwrap();
        assert_eq!(heap.len(), 4);

        let view = Matrix4::identity();
        let proj = Matrix4::identity();
        reference.transform_mut().set_position(crate::core::math::Vector3::new(3.0, 0.0, 0.0));
        f.model.update_constants(&view, &proj).unwrap();
        reference.update_constants(&view, &proj).unwrap();

        let read = |model: &Model| {
            let bytes = model.constants.as_ref().unwrap().resource().read(0, 64).unwrap();
            // 列主序，平移在第 12 个元素
            f32::from_le_bytes([bytes[48], bytes[49], bytes[50], bytes[51]])
        };
        assert_eq!(read(&f.model), 0.0);
        assert_eq!(read(&reference), 3.0);
    }

    #[test]
    fn test_reference_draws_after_owner_is_dropped() {
        let f = fixture();
        let heap = ResourceViewHeap::new(&f.device, DescriptorHeapKind::CbvSrvUav, 2).unwrap();
        let mut reference = f.model.create_reference("survivor");
        reference.setup_buffers(&f.device, &heap, &f.fallback).unwrap();

        let live_before = f.inspector.stats().live_resources;
        let Fixture {
            device,
            queue,
            inspector,
            fallback,
            model,
        } = f;
        drop(model);
        assert_eq!(inspector.stats().live_resources, live_before);

        let f = Fixture {
            device,
            queue,
            inspector,
            fallback,
            model: reference,
        };
        render(&f, &[&f.model], &heap, false).unwrap();
        assert_eq!(f.inspector.stats().draw_calls, 1);
    }

    #[test]
    fn test_geometry_released_with_last_instance() {
        let f = fixture();
        let reference = f.model.create_reference("copy");
        let vb = f.model.geometry().meshes()[0].vertex_buffer().handle();

        let Fixture { inspector, model, .. } = f;
        drop(model);
        assert!(inspector.is_live(vb));
        drop(reference);
        assert!(!inspector.is_live(vb));
    }

    #[test]
    fn test_bundle_replays_draws() {
        let mut f = fixture();
        let heap = ResourceViewHeap::new(&f.device, DescriptorHeapKind::CbvSrvUav, 2).unwrap();
        f.model.setup_buffers(&f.device, &heap, &f.fallback).unwrap();
        let pipeline = f
            .device
            .backend()
            .create_pipeline(&PipelineDesc::lambert("unused.hlsl", Format::R8G8B8A8UnormSrgb, Format::D24UnormS8Uint))
            .unwrap();
        f.model.record_bundle(&f.device, pipeline).unwrap();
        assert!(f.model.bundle().is_some());

        render(&f, &[&f.model, &f.model], &heap, true).unwrap();
        assert_eq!(f.inspector.stats().draw_calls, 2);
    }

    #[test]
    fn test_draw_without_buffers_fails() {
        let f = fixture();
        let container = CommandContainer::new(&f.device, SubmitType::Direct).unwrap();
        let mut list = container.create_command_list();
        list.open(None).unwrap();
        assert!(f.model.draw(&mut list).is_err());
        assert!(f.model.set_transform(&ModelTransform::zeroed()).is_err());
    }

    #[test]
    fn test_model_transform_layout() {
        assert_eq!(std::mem::size_of::<ModelTransform>(), 192);
        let world = Matrix4::new_translation(&crate::core::math::Vector3::new(1.0, 2.0, 3.0));
        let constants = ModelTransform::new(&world, &Matrix4::identity(), &Matrix4::identity());
        assert_eq!(constants.world[3], [1.0, 2.0, 3.0, 1.0]);
    }
}
