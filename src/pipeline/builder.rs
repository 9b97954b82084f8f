use ash::vk;
use std::sync::Arc;

use super::layout::{SetKind, SharedLayouts};
use super::uniform::UniformLayout;
use crate::gpu::{
    BlendMode, ColorTarget, DepthState, GpuDevice, GraphicsPipelineDesc, PipelineHandle,
    PipelineLayoutHandle, PushConstantRange, RenderPassHandle, ShaderStageDesc, VertexLayout,
};
use crate::{RenderError, Result};

/// Vulkan guarantees at least this many push-constant bytes.
const MAX_PUSH_CONSTANT_BYTES: u32 = 128;

/// Declarative pipeline description, validated by [`PipelineBuilder::build`].
#[derive(Debug, Clone)]
pub struct PipelineBlueprint {
    pub label: String,
    pub color_targets: Vec<ColorTarget>,
    pub depth: Option<DepthState>,
    /// Indices of render-pass attachments read as input attachments.
    pub input_attachments: Vec<u32>,
    pub stages: Vec<ShaderStageDesc>,
    /// Set kinds in registration order; set `n` in shaders is `descriptor_sets[n]`.
    pub descriptor_sets: Vec<SetKind>,
    pub vertex_layout: VertexLayout,
    pub push_constants: Option<PushConstantRange>,
    pub cull_mode: vk::CullModeFlags,
}

pub struct PipelineBuilder {
    label: String,
    color_targets: Vec<ColorTarget>,
    depth: Option<DepthState>,
    input_attachments: Vec<u32>,
    stages: Vec<ShaderStageDesc>,
    descriptor_sets: Vec<SetKind>,
    vertex_layout: VertexLayout,
    push_constants: Option<(vk::ShaderStageFlags, UniformLayout)>,
    cull_mode: vk::CullModeFlags,
}

impl PipelineBuilder {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            color_targets: Vec::new(),
            depth: None,
            input_attachments: Vec::new(),
            stages: Vec::new(),
            descriptor_sets: Vec::new(),
            vertex_layout: VertexLayout::empty(),
            push_constants: None,
            cull_mode: vk::CullModeFlags::NONE,
        }
    }

    pub fn with_color_attachment(mut self, format: vk::Format, blend: BlendMode) -> Self {
        self.color_targets.push(ColorTarget { format, blend });
        self
    }

    /// Depth test with `LESS`; `write` toggles depth writes.
    pub fn with_depth_attachment(mut self, format: vk::Format, write: bool) -> Self {
        self.depth = Some(DepthState {
            format,
            test: true,
            write,
            compare: vk::CompareOp::LESS,
            bias: None,
        });
        self
    }

    pub fn with_depth_compare(mut self, compare: vk::CompareOp) -> Self {
        if let Some(depth) = self.depth.as_mut() {
            depth.compare = compare;
        }
        self
    }

    pub fn with_depth_bias(mut self, bias: f32) -> Self {
        if let Some(depth) = self.depth.as_mut() {
            depth.bias = Some(bias);
        }
        self
    }

    pub fn with_input_attachment(mut self, attachment: u32) -> Self {
        self.input_attachments.push(attachment);
        self
    }

    pub fn with_shader(mut self, stage: ShaderStageDesc) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_shaders(mut self, stages: impl IntoIterator<Item = ShaderStageDesc>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Registers the next descriptor set. Registration order is the set index.
    pub fn with_descriptor_set(mut self, kind: SetKind) -> Self {
        self.descriptor_sets.push(kind);
        self
    }

    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    pub fn with_push_constants(mut self, stages: vk::ShaderStageFlags, layout: &UniformLayout) -> Self {
        self.push_constants = Some((stages, layout.clone()));
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn build(self) -> Result<PipelineBlueprint> {
        if self.stages.is_empty() {
            return Err(RenderError::InvalidConfig(format!(
                "Pipeline '{}' has no shader stages",
                self.label
            )));
        }
        for (index, kind) in self.descriptor_sets.iter().enumerate() {
            if self.descriptor_sets[..index].contains(kind) {
                return Err(RenderError::InvalidConfig(format!(
                    "Pipeline '{}' registers {kind:?} twice",
                    self.label
                )));
            }
        }
        if self.color_targets.is_empty() && self.depth.is_none() {
            return Err(RenderError::InvalidConfig(format!(
                "Pipeline '{}' writes no attachments",
                self.label
            )));
        }

        let push_constants = match self.push_constants {
            Some((stages, layout)) if !layout.is_empty() => {
                let size = layout.size();
                if size > MAX_PUSH_CONSTANT_BYTES {
                    return Err(RenderError::InvalidConfig(format!(
                        "Pipeline '{}' pushes {size} bytes (max {MAX_PUSH_CONSTANT_BYTES})",
                        self.label
                    )));
                }
                Some(PushConstantRange {
                    stages,
                    offset: 0,
                    size,
                })
            }
            _ => None,
        };

        Ok(PipelineBlueprint {
            label: self.label,
            color_targets: self.color_targets,
            depth: self.depth,
            input_attachments: self.input_attachments,
            stages: self.stages,
            descriptor_sets: self.descriptor_sets,
            vertex_layout: self.vertex_layout,
            push_constants,
            cull_mode: self.cull_mode,
        })
    }
}

/// A blueprint bound to a render pass/subpass, with a rebuildable pipeline object.
pub struct RenderPipeline {
    device: Arc<dyn GpuDevice>,
    blueprint: PipelineBlueprint,
    layout: PipelineLayoutHandle,
    render_pass: RenderPassHandle,
    subpass: u32,
    pipeline: Option<PipelineHandle>,
    extent: vk::Extent2D,
    polygon_mode: vk::PolygonMode,
}

impl RenderPipeline {
    /// Creates the pipeline layout. The pipeline object itself is built by [`update`](Self::update).
    pub fn init(
        device: Arc<dyn GpuDevice>,
        blueprint: PipelineBlueprint,
        layouts: &SharedLayouts,
        render_pass: RenderPassHandle,
        subpass: u32,
    ) -> Result<Self> {
        let attachment_formats = blueprint
            .color_targets
            .iter()
            .map(|target| (target.format, vk::ImageUsageFlags::COLOR_ATTACHMENT))
            .chain(blueprint.depth.iter().map(|depth| {
                (depth.format, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            }));
        for (format, usage) in attachment_formats {
            if !device.supports_format(format, usage) {
                log::error!(
                    "Pipeline '{}' needs {format:?} as {usage:?}, unsupported on {}",
                    blueprint.label,
                    device.name()
                );
                return Err(RenderError::UnsupportedFormat(format));
            }
        }

        let set_layouts = blueprint
            .descriptor_sets
            .iter()
            .map(|&kind| layouts.get(kind).map(|layout| layout.handle))
            .collect::<Result<Vec<_>>>()?;
        let push_constants: Vec<_> = blueprint.push_constants.into_iter().collect();
        let layout = device.create_pipeline_layout(&set_layouts, &push_constants)?;

        Ok(Self {
            device,
            blueprint,
            layout,
            render_pass,
            subpass,
            pipeline: None,
            extent: vk::Extent2D::default(),
            polygon_mode: vk::PolygonMode::FILL,
        })
    }

    /// Builds or rebuilds the pipeline for a new extent/polygon mode.
    ///
    /// Replacing an existing pipeline waits for the device to go idle first, since
    /// in-flight command buffers may still reference it.
    pub fn update(&mut self, extent: vk::Extent2D, polygon_mode: vk::PolygonMode) -> Result<()> {
        if polygon_mode != vk::PolygonMode::FILL && !self.device.features().fill_mode_non_solid {
            log::error!(
                "Pipeline '{}' requested {polygon_mode:?} without fill_mode_non_solid",
                self.blueprint.label
            );
            return Err(RenderError::MissingFeature("fill_mode_non_solid"));
        }
        if self.pipeline.is_some() && self.extent == extent && self.polygon_mode == polygon_mode {
            return Ok(());
        }

        if let Some(old) = self.pipeline.take() {
            self.device.wait_idle()?;
            self.device.destroy_pipeline(old);
        }

        let desc = GraphicsPipelineDesc {
            label: &self.blueprint.label,
            layout: self.layout,
            render_pass: self.render_pass,
            subpass: self.subpass,
            extent,
            polygon_mode,
            cull_mode: self.blueprint.cull_mode,
            stages: &self.blueprint.stages,
            vertex_layout: &self.blueprint.vertex_layout,
            color_targets: &self.blueprint.color_targets,
            depth: self.blueprint.depth,
        };
        self.pipeline = Some(self.device.create_graphics_pipeline(&desc)?);
        self.extent = extent;
        self.polygon_mode = polygon_mode;
        log::debug!(
            "Built pipeline '{}' ({}x{}, {polygon_mode:?})",
            self.blueprint.label,
            extent.width,
            extent.height
        );
        Ok(())
    }

    pub fn handle(&self) -> Result<PipelineHandle> {
        self.pipeline.ok_or_else(|| {
            RenderError::ResourceNotFound(format!("pipeline '{}' not built", self.blueprint.label))
        })
    }

    pub fn layout(&self) -> PipelineLayoutHandle {
        self.layout
    }

    pub fn subpass(&self) -> u32 {
        self.subpass
    }

    pub fn set_index(&self, kind: SetKind) -> Option<u32> {
        self.blueprint
            .descriptor_sets
            .iter()
            .position(|&registered| registered == kind)
            .map(|index| index as u32)
    }

    pub fn push_constants(&self) -> Option<PushConstantRange> {
        self.blueprint.push_constants
    }

    pub fn blueprint(&self) -> &PipelineBlueprint {
        &self.blueprint
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn polygon_mode(&self) -> vk::PolygonMode {
        self.polygon_mode
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            self.device.destroy_pipeline(pipeline);
        }
        self.device.destroy_pipeline_layout(self.layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{
        AttachmentDesc, DeviceFeatures, HeadlessDevice, ObjectKind, RenderPassDesc,
        ShaderModuleHandle, SubpassDesc,
    };

    fn stage(stage: vk::ShaderStageFlags) -> ShaderStageDesc {
        ShaderStageDesc {
            stage,
            module: ShaderModuleHandle(1),
            entry_point: "main".to_string(),
        }
    }

    fn blueprint() -> PipelineBlueprint {
        PipelineBuilder::new("test")
            .with_color_attachment(vk::Format::R8G8B8A8_UNORM, BlendMode::Opaque)
            .with_shader(stage(vk::ShaderStageFlags::VERTEX))
            .with_shader(stage(vk::ShaderStageFlags::FRAGMENT))
            .with_descriptor_set(SetKind::Camera)
            .with_descriptor_set(SetKind::Shadow)
            .with_push_constants(vk::ShaderStageFlags::FRAGMENT, &UniformLayout::light_push())
            .build()
            .unwrap()
    }

    fn render_pass(device: &HeadlessDevice) -> RenderPassHandle {
        device
            .create_render_pass(&RenderPassDesc {
                attachments: vec![AttachmentDesc {
                    format: vk::Format::R8G8B8A8_UNORM,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }],
                subpasses: vec![SubpassDesc {
                    color: vec![0],
                    ..Default::default()
                }],
            })
            .unwrap()
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn set_indices_follow_registration_order() {
        let bp = blueprint();
        assert_eq!(bp.descriptor_sets, vec![SetKind::Camera, SetKind::Shadow]);
        assert_eq!(bp.push_constants.map(|range| range.size), Some(48));
    }

    #[test]
    fn duplicate_sets_are_rejected() {
        let result = PipelineBuilder::new("dup")
            .with_color_attachment(vk::Format::R8G8B8A8_UNORM, BlendMode::Opaque)
            .with_shader(stage(vk::ShaderStageFlags::VERTEX))
            .with_descriptor_set(SetKind::Mesh)
            .with_descriptor_set(SetKind::Mesh)
            .build();
        assert!(matches!(result, Err(RenderError::InvalidConfig(_))));
    }

    #[test]
    fn rebuild_waits_for_idle() {
        let device = Arc::new(HeadlessDevice::new());
        let layouts = SharedLayouts::new(device.clone()).unwrap();
        let rp = render_pass(&device);
        let mut pipeline =
            RenderPipeline::init(device.clone(), blueprint(), &layouts, rp, 0).unwrap();
        assert_eq!(pipeline.set_index(SetKind::Shadow), Some(1));
        assert!(pipeline.handle().is_err());

        pipeline.update(extent(64, 64), vk::PolygonMode::FILL).unwrap();
        assert_eq!(device.wait_idle_count(), 0);
        pipeline.update(extent(64, 64), vk::PolygonMode::FILL).unwrap();
        assert_eq!(device.wait_idle_count(), 0);

        pipeline.update(extent(128, 64), vk::PolygonMode::FILL).unwrap();
        assert_eq!(device.wait_idle_count(), 1);
        let record = device.pipeline_record(pipeline.handle().unwrap()).unwrap();
        assert_eq!(record.extent, extent(128, 64));
        assert_eq!(device.live_objects(ObjectKind::Pipeline), 1);
    }

    #[test]
    fn wireframe_needs_feature() {
        let device = Arc::new(HeadlessDevice::new().with_features(DeviceFeatures {
            fill_mode_non_solid: false,
            depth_bias_clamp: true,
        }));
        let layouts = SharedLayouts::new(device.clone()).unwrap();
        let rp = render_pass(&device);
        let mut pipeline =
            RenderPipeline::init(device.clone(), blueprint(), &layouts, rp, 0).unwrap();
        let err = pipeline
            .update(extent(64, 64), vk::PolygonMode::LINE)
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingFeature(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn unsupported_attachment_format() {
        let device =
            Arc::new(HeadlessDevice::new().with_unsupported_format(vk::Format::R8G8B8A8_UNORM));
        let layouts = SharedLayouts::new(device.clone()).unwrap();
        let rp = render_pass(&device);
        let result = RenderPipeline::init(device.clone(), blueprint(), &layouts, rp, 0);
        assert!(matches!(result, Err(RenderError::UnsupportedFormat(_))));
    }
}
