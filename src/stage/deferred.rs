//! Two-subpass deferred renderer.
//!
//! | attachment | format        | written by  | read by                  |
//! |------------|---------------|-------------|--------------------------|
//! | 0 albedo   | RGBA8         | geometry    | lighting (input)         |
//! | 1 normal   | RGBA16F       | geometry    | lighting (input)         |
//! | 2 depth    | D32           | geometry    | lighting (input), caller |
//! | 3 output   | RGBA16F       | lighting    | caller                   |
//!
//! Lighting draws one full-screen triangle per light with additive blending.

use ash::vk;

use super::{
    bind_set, create_target, draw_meshes, CameraFrame, RenderStage, StageContext, COLOR_FORMAT,
    DEPTH_FORMAT,
};
use crate::config::RendererKind;
use crate::gpu::{
    AttachmentDesc, AttachmentView, BlendMode, ClearValue, DescriptorResource, DescriptorWrite,
    FramebufferHandle, GpuDevice, ImageHandle, RenderPassDesc, RenderPassHandle, SubpassDesc,
    VertexLayout,
};
use crate::pipeline::{
    DescriptorSet, PipelineBuilder, RenderPipeline, SetKind, ShaderPass, UniformLayout,
};
use crate::recording::CommandEncoder;
use crate::scene::Camera;
use crate::Result;

const ALBEDO_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const NORMAL_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

struct GBufferTargets {
    albedo: ImageHandle,
    normal: ImageHandle,
    depth: ImageHandle,
    output: ImageHandle,
    framebuffer: FramebufferHandle,
}

impl GBufferTargets {
    fn create(
        device: &dyn GpuDevice,
        render_pass: RenderPassHandle,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut images: Vec<ImageHandle> = Vec::with_capacity(4);
        let specs = [
            (
                ALBEDO_FORMAT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT,
                "gbuffer albedo",
            ),
            (
                NORMAL_FORMAT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT,
                "gbuffer normal",
            ),
            (
                DEPTH_FORMAT,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::ImageUsageFlags::INPUT_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED,
                "deferred depth",
            ),
            (
                COLOR_FORMAT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                "deferred output",
            ),
        ];
        for (format, usage, label) in specs {
            match create_target(device, extent, format, usage, label) {
                Ok(image) => images.push(image),
                Err(err) => {
                    images.into_iter().for_each(|image| device.destroy_image(image));
                    return Err(err);
                }
            }
        }

        let views: Vec<_> = images
            .iter()
            .map(|&image| AttachmentView { image, layer: 0 })
            .collect();
        let framebuffer = match device.create_framebuffer(render_pass, &views, extent) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                images.into_iter().for_each(|image| device.destroy_image(image));
                return Err(err);
            }
        };

        Ok(Self {
            albedo: images[0],
            normal: images[1],
            depth: images[2],
            output: images[3],
            framebuffer,
        })
    }

    fn write_inputs(&self, set: &DescriptorSet) -> Result<()> {
        let writes: Vec<_> = [self.albedo, self.normal, self.depth]
            .into_iter()
            .enumerate()
            .map(|(binding, image)| DescriptorWrite {
                binding: binding as u32,
                resource: DescriptorResource::InputAttachment { image },
            })
            .collect();
        set.write(&writes)
    }

    fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_framebuffer(self.framebuffer);
        for image in [self.albedo, self.normal, self.depth, self.output] {
            device.destroy_image(image);
        }
    }
}

pub struct DeferredStage {
    ctx: StageContext,
    render_pass: RenderPassHandle,
    geometry: RenderPipeline,
    lighting: RenderPipeline,
    targets: GBufferTargets,
    gbuffer_set: DescriptorSet,
    extent: vk::Extent2D,
    polygon_mode: vk::PolygonMode,
}

impl DeferredStage {
    pub fn init(ctx: &StageContext, camera: &Camera) -> Result<Self> {
        let device = ctx.device.clone();
        let render_pass = device.create_render_pass(&render_pass_desc())?;
        match Self::build(ctx, camera, render_pass) {
            Ok(stage) => Ok(stage),
            Err(err) => {
                device.destroy_render_pass(render_pass);
                Err(err)
            }
        }
    }

    fn build(ctx: &StageContext, camera: &Camera, render_pass: RenderPassHandle) -> Result<Self> {
        let geometry = PipelineBuilder::new("deferred geometry")
            .with_color_attachment(ALBEDO_FORMAT, BlendMode::Opaque)
            .with_color_attachment(NORMAL_FORMAT, BlendMode::Opaque)
            .with_depth_attachment(DEPTH_FORMAT, true)
            .with_shaders(ctx.shaders.graphics_stages(ShaderPass::DeferredGeometry)?)
            .with_descriptor_set(SetKind::Camera)
            .with_descriptor_set(SetKind::Mesh)
            .with_vertex_layout(VertexLayout::position_normal_uv())
            .with_cull_mode(vk::CullModeFlags::BACK)
            .build()?;
        let light_push = ctx
            .shaders
            .push_constants(ShaderPass::DeferredLighting)
            .cloned()
            .unwrap_or_else(UniformLayout::light_push);
        let lighting = PipelineBuilder::new("deferred lighting")
            .with_color_attachment(COLOR_FORMAT, BlendMode::Additive)
            .with_input_attachment(0)
            .with_input_attachment(1)
            .with_input_attachment(2)
            .with_shaders(ctx.shaders.graphics_stages(ShaderPass::DeferredLighting)?)
            .with_descriptor_set(SetKind::Camera)
            .with_descriptor_set(SetKind::GBuffer)
            .with_descriptor_set(SetKind::Shadow)
            .with_push_constants(vk::ShaderStageFlags::FRAGMENT, &light_push)
            .build()?;

        let mut geometry =
            RenderPipeline::init(ctx.device.clone(), geometry, &ctx.layouts, render_pass, 0)?;
        let mut lighting =
            RenderPipeline::init(ctx.device.clone(), lighting, &ctx.layouts, render_pass, 1)?;
        geometry.update(camera.extent, camera.polygon_mode)?;
        lighting.update(camera.extent, vk::PolygonMode::FILL)?;

        let targets = GBufferTargets::create(ctx.device.as_ref(), render_pass, camera.extent)?;
        let gbuffer_set = ctx
            .allocator
            .allocate_set(ctx.layouts.get(SetKind::GBuffer)?)
            .and_then(|set| targets.write_inputs(&set).map(|_| set));
        let gbuffer_set = match gbuffer_set {
            Ok(set) => set,
            Err(err) => {
                targets.destroy(ctx.device.as_ref());
                return Err(err);
            }
        };

        log::debug!(
            "Deferred stage ready ({}x{})",
            camera.extent.width,
            camera.extent.height
        );
        Ok(Self {
            ctx: ctx.clone(),
            render_pass,
            geometry,
            lighting,
            targets,
            gbuffer_set,
            extent: camera.extent,
            polygon_mode: camera.polygon_mode,
        })
    }
}

fn render_pass_desc() -> RenderPassDesc {
    let transient = |format| AttachmentDesc {
        format,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    };
    RenderPassDesc {
        attachments: vec![
            transient(ALBEDO_FORMAT),
            transient(NORMAL_FORMAT),
            AttachmentDesc {
                format: DEPTH_FORMAT,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            },
            AttachmentDesc {
                format: COLOR_FORMAT,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        ],
        subpasses: vec![
            SubpassDesc {
                color: vec![0, 1],
                depth: Some(2),
                inputs: Vec::new(),
            },
            SubpassDesc {
                color: vec![3],
                depth: None,
                inputs: vec![0, 1, 2],
            },
        ],
    }
}

impl RenderStage for DeferredStage {
    fn kind(&self) -> RendererKind {
        RendererKind::Deferred
    }

    fn rebuild(&mut self, extent: vk::Extent2D, polygon_mode: vk::PolygonMode) -> Result<()> {
        if extent != self.extent {
            let targets =
                GBufferTargets::create(self.ctx.device.as_ref(), self.render_pass, extent)?;
            self.ctx.device.wait_idle()?;
            let old = std::mem::replace(&mut self.targets, targets);
            old.destroy(self.ctx.device.as_ref());
            self.targets.write_inputs(&self.gbuffer_set)?;
            self.lighting.update(extent, vk::PolygonMode::FILL)?;
        }
        self.geometry.update(extent, polygon_mode)?;
        self.extent = extent;
        self.polygon_mode = polygon_mode;
        Ok(())
    }

    fn record(&self, encoder: &mut CommandEncoder, frame: &CameraFrame) -> Result<()> {
        encoder.begin_render_pass(
            self.render_pass,
            self.targets.framebuffer,
            self.extent,
            &[
                ClearValue::Color([0.0; 4]),
                ClearValue::Color([0.0; 4]),
                ClearValue::Depth(1.0),
                ClearValue::Color([0.0; 4]),
            ],
        )?;
        encoder.set_viewport(self.extent)?;

        encoder.bind_pipeline(self.geometry.handle()?)?;
        bind_set(encoder, &self.geometry, SetKind::Camera, frame.camera_set)?;
        draw_meshes(encoder, &self.geometry, &frame.draws)?;

        encoder.next_subpass()?;
        encoder.bind_pipeline(self.lighting.handle()?)?;
        bind_set(encoder, &self.lighting, SetKind::Camera, frame.camera_set)?;
        bind_set(encoder, &self.lighting, SetKind::GBuffer, self.gbuffer_set.handle())?;
        for light in &frame.lights {
            bind_set(encoder, &self.lighting, SetKind::Shadow, light.shadow_set)?;
            encoder.push_constants(
                self.lighting.layout(),
                vk::ShaderStageFlags::FRAGMENT,
                &light.push,
            )?;
            encoder.draw(3)?;
        }
        encoder.end_render_pass()
    }

    fn render_image(&self) -> ImageHandle {
        self.targets.output
    }

    fn depth_render_image(&self) -> ImageHandle {
        self.targets.depth
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn polygon_mode(&self) -> vk::PolygonMode {
        self.polygon_mode
    }
}

impl Drop for DeferredStage {
    fn drop(&mut self) {
        self.targets.destroy(self.ctx.device.as_ref());
        self.ctx.device.destroy_render_pass(self.render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DescriptorPoolConfig, RendererConfig};
    use crate::frame::FrameSlot;
    use crate::gpu::{Command, DescriptorSetHandle, HeadlessDevice, ObjectKind, ShaderModuleHandle};
    use crate::pipeline::{DescriptorAllocator, ShaderCatalog, SharedLayouts};
    use crate::stage::{GpuLightPush, LightDraw, MeshDraw};
    use crate::scene::Light;
    use glam::Vec3;
    use std::sync::Arc;

    fn context(device: Arc<HeadlessDevice>) -> StageContext {
        StageContext {
            device: device.clone(),
            layouts: Arc::new(SharedLayouts::new(device.clone()).unwrap()),
            allocator: DescriptorAllocator::new(device, &DescriptorPoolConfig::default()).unwrap(),
            shaders: Arc::new(ShaderCatalog::with_module_for_all_passes(
                ShaderModuleHandle(1),
            )),
            config: Arc::new(RendererConfig::default()),
        }
    }

    fn camera(width: u32) -> Camera {
        Camera::perspective(
            1.0,
            vk::Extent2D {
                width,
                height: 256,
            },
            0.1,
            100.0,
        )
    }

    #[test]
    fn records_geometry_then_lighting() {
        let device = Arc::new(HeadlessDevice::new());
        let stage = DeferredStage::init(&context(device.clone()), &camera(256)).unwrap();
        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cb).unwrap();

        let frame = CameraFrame {
            slot: FrameSlot::new(0).unwrap(),
            camera_set: DescriptorSetHandle(100),
            draws: vec![MeshDraw {
                vertex_buffer: crate::gpu::BufferHandle(5),
                index_buffer: crate::gpu::BufferHandle(6),
                index_count: 36,
                mesh_set: DescriptorSetHandle(101),
            }],
            lights: vec![LightDraw {
                push: GpuLightPush::from_light(&Light::directional(Vec3::NEG_Y), true),
                shadow_set: DescriptorSetHandle(102),
            }],
            unshadowed_set: DescriptorSetHandle(103),
        };
        let mut encoder = CommandEncoder::new(device.clone(), cb);
        stage.record(&mut encoder, &frame).unwrap();
        assert_eq!(encoder.draw_count(), 2);

        let commands = device.commands(cb);
        let subpass = commands
            .iter()
            .position(|c| *c == Command::NextSubpass)
            .unwrap();
        assert!(matches!(commands[subpass - 1], Command::DrawIndexed { index_count: 36, .. }));
        assert!(matches!(commands.last(), Some(Command::EndRenderPass)));
        // Shadow set is registered third in the lighting pipeline.
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::BindDescriptorSets { first_set: 2, sets, .. } if sets == &vec![DescriptorSetHandle(102)]
        )));
    }

    #[test]
    fn resize_recreates_targets_after_idle() {
        let device = Arc::new(HeadlessDevice::new());
        let mut stage = DeferredStage::init(&context(device.clone()), &camera(256)).unwrap();
        let old_output = stage.render_image();
        let images = device.live_objects(ObjectKind::Image);

        stage
            .rebuild(
                vk::Extent2D {
                    width: 512,
                    height: 256,
                },
                vk::PolygonMode::FILL,
            )
            .unwrap();
        assert!(device.wait_idle_count() >= 1);
        assert_ne!(stage.render_image(), old_output);
        assert_eq!(device.live_objects(ObjectKind::Image), images);
        assert_eq!(
            device.image_desc(stage.depth_render_image()).unwrap().extent.width,
            512
        );
    }

    #[test]
    fn drop_releases_everything() {
        let device = Arc::new(HeadlessDevice::new());
        let ctx = context(device.clone());
        drop(DeferredStage::init(&ctx, &camera(64)).unwrap());
        assert_eq!(device.live_objects(ObjectKind::Image), 0);
        assert_eq!(device.live_objects(ObjectKind::Pipeline), 0);
        assert_eq!(device.live_objects(ObjectKind::RenderPass), 0);
        assert_eq!(ctx.allocator.allocated_sets(), 0);
    }
}
