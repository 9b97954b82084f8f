use ash::vk;
use bytemuck::Zeroable;

use super::{
    bind_set, create_target, draw_meshes, CameraFrame, GpuLightPush, RenderStage, StageContext,
    COLOR_FORMAT, DEPTH_FORMAT,
};
use crate::config::RendererKind;
use crate::gpu::{
    AttachmentDesc, AttachmentView, BlendMode, ClearValue, FramebufferHandle, GpuDevice,
    ImageHandle, RenderPassDesc, RenderPassHandle, SubpassDesc, VertexLayout,
};
use crate::pipeline::{PipelineBuilder, RenderPipeline, SetKind, ShaderPass, UniformLayout};
use crate::recording::CommandEncoder;
use crate::scene::Camera;
use crate::Result;

struct ForwardTargets {
    output: ImageHandle,
    depth: ImageHandle,
    framebuffer: FramebufferHandle,
}

impl ForwardTargets {
    fn create(
        device: &dyn GpuDevice,
        render_pass: RenderPassHandle,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let output = create_target(
            device,
            extent,
            COLOR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            "forward output",
        )?;
        let depth = match create_target(
            device,
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            "forward depth",
        ) {
            Ok(depth) => depth,
            Err(err) => {
                device.destroy_image(output);
                return Err(err);
            }
        };
        let views = [
            AttachmentView {
                image: output,
                layer: 0,
            },
            AttachmentView {
                image: depth,
                layer: 0,
            },
        ];
        match device.create_framebuffer(render_pass, &views, extent) {
            Ok(framebuffer) => Ok(Self {
                output,
                depth,
                framebuffer,
            }),
            Err(err) => {
                device.destroy_image(output);
                device.destroy_image(depth);
                Err(err)
            }
        }
    }

    fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_framebuffer(self.framebuffer);
        device.destroy_image(self.output);
        device.destroy_image(self.depth);
    }
}

/// Single-subpass renderer: every visible mesh is drawn once per light, blended
/// additively. With no lights, one unlit pass binds the placeholder shadow set.
pub struct ForwardStage {
    ctx: StageContext,
    render_pass: RenderPassHandle,
    pipeline: RenderPipeline,
    targets: ForwardTargets,
    extent: vk::Extent2D,
    polygon_mode: vk::PolygonMode,
}

impl ForwardStage {
    pub fn init(ctx: &StageContext, camera: &Camera) -> Result<Self> {
        let render_pass = ctx.device.create_render_pass(&RenderPassDesc {
            attachments: vec![
                AttachmentDesc {
                    format: COLOR_FORMAT,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
                AttachmentDesc {
                    format: DEPTH_FORMAT,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    final_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                },
            ],
            subpasses: vec![SubpassDesc {
                color: vec![0],
                depth: Some(1),
                inputs: Vec::new(),
            }],
        })?;

        match Self::build(ctx, camera, render_pass) {
            Ok(stage) => Ok(stage),
            Err(err) => {
                ctx.device.destroy_render_pass(render_pass);
                Err(err)
            }
        }
    }

    fn build(ctx: &StageContext, camera: &Camera, render_pass: RenderPassHandle) -> Result<Self> {
        let light_push = ctx
            .shaders
            .push_constants(ShaderPass::Forward)
            .cloned()
            .unwrap_or_else(UniformLayout::light_push);
        // Later light passes redraw the same depth, hence LESS_OR_EQUAL.
        let blueprint = PipelineBuilder::new("forward")
            .with_color_attachment(COLOR_FORMAT, BlendMode::Additive)
            .with_depth_attachment(DEPTH_FORMAT, true)
            .with_depth_compare(vk::CompareOp::LESS_OR_EQUAL)
            .with_shaders(ctx.shaders.graphics_stages(ShaderPass::Forward)?)
            .with_descriptor_set(SetKind::Camera)
            .with_descriptor_set(SetKind::Mesh)
            .with_descriptor_set(SetKind::Shadow)
            .with_vertex_layout(VertexLayout::position_normal_uv())
            .with_push_constants(vk::ShaderStageFlags::FRAGMENT, &light_push)
            .with_cull_mode(vk::CullModeFlags::BACK)
            .build()?;
        let mut pipeline =
            RenderPipeline::init(ctx.device.clone(), blueprint, &ctx.layouts, render_pass, 0)?;
        pipeline.update(camera.extent, camera.polygon_mode)?;
        let targets = ForwardTargets::create(ctx.device.as_ref(), render_pass, camera.extent)?;

        log::debug!(
            "Forward stage ready ({}x{})",
            camera.extent.width,
            camera.extent.height
        );
        Ok(Self {
            ctx: ctx.clone(),
            render_pass,
            pipeline,
            targets,
            extent: camera.extent,
            polygon_mode: camera.polygon_mode,
        })
    }
}

impl RenderStage for ForwardStage {
    fn kind(&self) -> RendererKind {
        RendererKind::Forward
    }

    fn rebuild(&mut self, extent: vk::Extent2D, polygon_mode: vk::PolygonMode) -> Result<()> {
        if extent != self.extent {
            let targets =
                ForwardTargets::create(self.ctx.device.as_ref(), self.render_pass, extent)?;
            self.ctx.device.wait_idle()?;
            let old = std::mem::replace(&mut self.targets, targets);
            old.destroy(self.ctx.device.as_ref());
        }
        self.pipeline.update(extent, polygon_mode)?;
        self.extent = extent;
        self.polygon_mode = polygon_mode;
        Ok(())
    }

    fn record(&self, encoder: &mut CommandEncoder, frame: &CameraFrame) -> Result<()> {
        encoder.begin_render_pass(
            self.render_pass,
            self.targets.framebuffer,
            self.extent,
            &[ClearValue::Color([0.0; 4]), ClearValue::Depth(1.0)],
        )?;
        encoder.set_viewport(self.extent)?;
        encoder.bind_pipeline(self.pipeline.handle()?)?;
        bind_set(encoder, &self.pipeline, SetKind::Camera, frame.camera_set)?;

        if frame.lights.is_empty() {
            bind_set(encoder, &self.pipeline, SetKind::Shadow, frame.unshadowed_set)?;
            encoder.push_constants(
                self.pipeline.layout(),
                vk::ShaderStageFlags::FRAGMENT,
                &GpuLightPush::zeroed(),
            )?;
            draw_meshes(encoder, &self.pipeline, &frame.draws)?;
        }
        for light in &frame.lights {
            bind_set(encoder, &self.pipeline, SetKind::Shadow, light.shadow_set)?;
            encoder.push_constants(
                self.pipeline.layout(),
                vk::ShaderStageFlags::FRAGMENT,
                &light.push,
            )?;
            draw_meshes(encoder, &self.pipeline, &frame.draws)?;
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

impl Drop for ForwardStage {
    fn drop(&mut self) {
        self.targets.destroy(self.ctx.device.as_ref());
        self.ctx.device.destroy_render_pass(self.render_pass);
    }
}
