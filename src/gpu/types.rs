//! Opaque device handles and the plain-data descriptions passed across the device seam.

use ash::vk;

macro_rules! gpu_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                pub fn is_null(self) -> bool {
                    self.0 == 0
                }

                pub fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

gpu_handle!(
    /// GPU buffer (vertex, index or uniform).
    BufferHandle,
    /// GPU image; may have several array layers.
    ImageHandle,
    /// Compiled shader module, produced by the shader collaborator.
    ShaderModuleHandle,
    DescriptorSetLayoutHandle,
    DescriptorPoolHandle,
    DescriptorSetHandle,
    PipelineLayoutHandle,
    RenderPassHandle,
    FramebufferHandle,
    PipelineHandle,
    CommandPoolHandle,
    CommandBufferHandle,
);

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub label: &'static str,
}

impl BufferDesc {
    pub fn uniform(size: u64, label: &'static str) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            label,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub label: &'static str,
}

/// Device capabilities the orchestrator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// Required for `vk::PolygonMode::LINE` / `POINT`.
    pub fill_mode_non_solid: bool,
    /// Required for the shadow pipeline's depth bias clamp.
    pub depth_bias_clamp: bool,
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        Self {
            fill_mode_non_solid: true,
            depth_bias_clamp: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub sizes: Vec<(vk::DescriptorType, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    UniformBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    /// Combined image + shared sampler, all layers.
    SampledImage { image: ImageHandle },
    InputAttachment { image: ImageHandle },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub final_layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubpassDesc {
    pub color: Vec<u32>,
    pub depth: Option<u32>,
    pub inputs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
}

/// One layer of an image used as a framebuffer attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentView {
    pub image: ImageHandle,
    pub layer: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// No vertex input (full-screen triangles generated in the shader).
    pub fn empty() -> Self {
        Self {
            stride: 0,
            attributes: Vec::new(),
        }
    }

    /// position (vec3) + normal (vec3) + uv (vec2), interleaved.
    pub fn position_normal_uv() -> Self {
        Self {
            stride: 32,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: 24,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageDesc {
    pub stage: vk::ShaderStageFlags,
    pub module: ShaderModuleHandle,
    pub entry_point: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    Alpha,
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTarget {
    pub format: vk::Format,
    pub blend: BlendMode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthState {
    pub format: vk::Format,
    pub test: bool,
    pub write: bool,
    pub compare: vk::CompareOp,
    /// Constant depth bias, shadow pipelines only.
    pub bias: Option<f32>,
}

/// Everything needed to create one graphics pipeline object.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc<'a> {
    pub label: &'a str,
    pub layout: PipelineLayoutHandle,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub extent: vk::Extent2D,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub stages: &'a [ShaderStageDesc],
    pub vertex_layout: &'a VertexLayout,
    pub color_targets: &'a [ColorTarget],
    pub depth: Option<DepthState>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

/// A single recorded GPU command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: vk::Extent2D,
        clear_values: Vec<ClearValue>,
    },
    NextSubpass,
    EndRenderPass,
    BindPipeline(PipelineHandle),
    BindDescriptorSets {
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: Vec<DescriptorSetHandle>,
    },
    PushConstants {
        layout: PipelineLayoutHandle,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    BindVertexBuffer(BufferHandle),
    BindIndexBuffer(BufferHandle),
    SetViewport(vk::Extent2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
}

impl Command {
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }
}
