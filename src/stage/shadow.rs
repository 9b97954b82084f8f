use ash::vk;
use glam::Mat4;
use std::sync::Arc;

use super::{draw_meshes, MeshDraw, StageContext};
use crate::frame::FrameSlot;
use crate::gpu::{
    AttachmentDesc, ClearValue, FramebufferHandle, GpuDevice, RenderPassDesc, RenderPassHandle,
    SubpassDesc, VertexLayout,
};
use crate::pipeline::{PipelineBuilder, RenderPipeline, SetKind, ShaderPass, UniformLayout};
use crate::recording::CommandEncoder;
use crate::shadow::SHADOW_MAP_FORMAT;
use crate::{RenderError, Result};

/// Inputs of one (light, camera) shadow job, captured by value.
#[derive(Debug, Clone)]
pub struct ShadowFrame {
    pub slot: FrameSlot,
    /// One per shadow map layer.
    pub framebuffers: Vec<FramebufferHandle>,
    pub extent: vk::Extent2D,
    /// Light-space transform per layer, same order as `framebuffers`.
    pub light_space: Vec<Mat4>,
    pub draws: Vec<MeshDraw>,
}

/// Depth-only pass shared by every shadow map of one light.
pub struct ShadowStage {
    device: Arc<dyn GpuDevice>,
    render_pass: RenderPassHandle,
    pipeline: RenderPipeline,
}

impl ShadowStage {
    pub fn init(ctx: &StageContext) -> Result<Self> {
        let render_pass = ctx.device.create_render_pass(&RenderPassDesc {
            attachments: vec![AttachmentDesc {
                format: SHADOW_MAP_FORMAT,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            }],
            subpasses: vec![SubpassDesc {
                color: Vec::new(),
                depth: Some(0),
                inputs: Vec::new(),
            }],
        })?;

        match Self::build_pipeline(ctx, render_pass) {
            Ok(pipeline) => Ok(Self {
                device: ctx.device.clone(),
                render_pass,
                pipeline,
            }),
            Err(err) => {
                ctx.device.destroy_render_pass(render_pass);
                Err(err)
            }
        }
    }

    fn build_pipeline(ctx: &StageContext, render_pass: RenderPassHandle) -> Result<RenderPipeline> {
        let shadow = &ctx.config.shadow;
        let push = ctx
            .shaders
            .push_constants(ShaderPass::Shadow)
            .cloned()
            .unwrap_or_else(UniformLayout::shadow_push);

        let mut builder = PipelineBuilder::new("shadow")
            .with_depth_attachment(SHADOW_MAP_FORMAT, true)
            .with_shaders(ctx.shaders.graphics_stages(ShaderPass::Shadow)?)
            .with_descriptor_set(SetKind::Mesh)
            .with_vertex_layout(VertexLayout::position_normal_uv())
            .with_push_constants(vk::ShaderStageFlags::VERTEX, &push)
            .with_cull_mode(vk::CullModeFlags::FRONT);
        if ctx.device.features().depth_bias_clamp {
            builder = builder.with_depth_bias(shadow.depth_bias);
        } else {
            log::warn!("depth_bias_clamp unavailable, shadow pipeline built without depth bias");
        }

        let mut pipeline =
            RenderPipeline::init(ctx.device.clone(), builder.build()?, &ctx.layouts, render_pass, 0)?;
        pipeline.update(
            vk::Extent2D {
                width: shadow.resolution,
                height: shadow.resolution,
            },
            vk::PolygonMode::FILL,
        )?;
        Ok(pipeline)
    }

    pub fn render_pass(&self) -> RenderPassHandle {
        self.render_pass
    }

    pub fn pipeline(&self) -> &RenderPipeline {
        &self.pipeline
    }

    /// Renders every layer of one shadow map: one render pass per cascade or face.
    pub fn record(&self, encoder: &mut CommandEncoder, frame: &ShadowFrame) -> Result<()> {
        if frame.framebuffers.len() != frame.light_space.len() {
            return Err(RenderError::InvalidConfig(format!(
                "{} shadow framebuffers for {} views",
                frame.framebuffers.len(),
                frame.light_space.len()
            )));
        }
        let pipeline = self.pipeline.handle()?;
        for (framebuffer, light_space) in frame.framebuffers.iter().zip(&frame.light_space) {
            encoder.begin_render_pass(
                self.render_pass,
                *framebuffer,
                frame.extent,
                &[ClearValue::Depth(1.0)],
            )?;
            encoder.set_viewport(frame.extent)?;
            encoder.bind_pipeline(pipeline)?;
            encoder.push_constants(
                self.pipeline.layout(),
                vk::ShaderStageFlags::VERTEX,
                &light_space.to_cols_array(),
            )?;
            draw_meshes(encoder, &self.pipeline, &frame.draws)?;
            encoder.end_render_pass()?;
        }
        Ok(())
    }
}

impl Drop for ShadowStage {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DescriptorPoolConfig, RendererConfig};
    use crate::gpu::{
        BufferHandle, Command, DescriptorSetHandle, DeviceFeatures, HeadlessDevice,
        ShaderModuleHandle,
    };
    use crate::pipeline::{DescriptorAllocator, ShaderCatalog, SharedLayouts};

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

    #[test]
    fn one_pass_per_layer() {
        let device = Arc::new(HeadlessDevice::new());
        let stage = ShadowStage::init(&context(device.clone())).unwrap();
        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cb).unwrap();

        let frame = ShadowFrame {
            slot: FrameSlot::new(0).unwrap(),
            framebuffers: vec![FramebufferHandle(1), FramebufferHandle(2)],
            extent: vk::Extent2D {
                width: 512,
                height: 512,
            },
            light_space: vec![Mat4::IDENTITY; 2],
            draws: vec![MeshDraw {
                vertex_buffer: BufferHandle(3),
                index_buffer: BufferHandle(4),
                index_count: 12,
                mesh_set: DescriptorSetHandle(5),
            }],
        };
        let mut encoder = CommandEncoder::new(device.clone(), cb);
        stage.record(&mut encoder, &frame).unwrap();
        assert_eq!(encoder.draw_count(), 2);
        let passes = device
            .commands(cb)
            .iter()
            .filter(|c| matches!(c, Command::BeginRenderPass { .. }))
            .count();
        assert_eq!(passes, 2);
    }

    #[test]
    fn mismatched_layers_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let stage = ShadowStage::init(&context(device.clone())).unwrap();
        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cb).unwrap();
        let frame = ShadowFrame {
            slot: FrameSlot::new(0).unwrap(),
            framebuffers: vec![FramebufferHandle(1)],
            extent: vk::Extent2D {
                width: 4,
                height: 4,
            },
            light_space: Vec::new(),
            draws: Vec::new(),
        };
        let mut encoder = CommandEncoder::new(device.clone(), cb);
        assert!(stage.record(&mut encoder, &frame).is_err());
    }

    #[test]
    fn bias_dropped_without_clamp_feature() {
        let device = Arc::new(HeadlessDevice::new().with_features(DeviceFeatures {
            fill_mode_non_solid: true,
            depth_bias_clamp: false,
        }));
        let stage = ShadowStage::init(&context(device.clone())).unwrap();
        let depth = stage.pipeline().blueprint().depth.unwrap();
        assert!(depth.bias.is_none());
        assert!(depth.write);
    }
}
