//! Renderer stages: the per-camera geometry/lighting pass and the per-light shadow pass.
//!
//! A camera picks its [`RendererKind`] once, when it is registered; the scheduler holds
//! the stage behind `dyn RenderStage` and never switches it afterwards.

pub mod deferred;
pub mod forward;
pub mod shadow;

pub use deferred::DeferredStage;
pub use forward::ForwardStage;
pub use shadow::{ShadowFrame, ShadowStage};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

use crate::config::{RendererConfig, RendererKind};
use crate::frame::FrameSlot;
use crate::gpu::{
    BufferHandle, DescriptorSetHandle, GpuDevice, ImageDesc, ImageHandle,
};
use crate::pipeline::{DescriptorAllocator, RenderPipeline, SetKind, ShaderCatalog, SharedLayouts};
use crate::recording::CommandEncoder;
use crate::scene::{Camera, Light, LightKind, Mesh};
use crate::{RenderError, Result};

pub(crate) const COLOR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub(crate) const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Everything a stage needs to create its GPU objects.
#[derive(Clone)]
pub struct StageContext {
    pub device: Arc<dyn GpuDevice>,
    pub layouts: Arc<SharedLayouts>,
    pub allocator: DescriptorAllocator,
    pub shaders: Arc<ShaderCatalog>,
    pub config: Arc<RendererConfig>,
}

/// Camera pass interface shared by every renderer flavour.
pub trait RenderStage: Send + Sync {
    fn kind(&self) -> RendererKind;

    /// Recreates extent- or polygon-mode-dependent state. Blocks on the device before
    /// destroying anything an in-flight frame could still reference.
    fn rebuild(&mut self, extent: vk::Extent2D, polygon_mode: vk::PolygonMode) -> Result<()>;

    /// Encodes the whole camera pass. Called from a recording worker.
    fn record(&self, encoder: &mut CommandEncoder, frame: &CameraFrame) -> Result<()>;

    fn render_image(&self) -> ImageHandle;

    fn depth_render_image(&self) -> ImageHandle;

    fn extent(&self) -> vk::Extent2D;

    fn polygon_mode(&self) -> vk::PolygonMode;
}

pub fn create_camera_stage(
    kind: RendererKind,
    ctx: &StageContext,
    camera: &Camera,
) -> Result<Box<dyn RenderStage>> {
    Ok(match kind {
        RendererKind::Deferred => Box::new(DeferredStage::init(ctx, camera)?),
        RendererKind::Forward => Box::new(ForwardStage::init(ctx, camera)?),
    })
}

/// One visible mesh, resolved to the descriptor set of the frame being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshDraw {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub mesh_set: DescriptorSetHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct LightDraw {
    pub push: GpuLightPush,
    /// Shadow set of the owning (light, camera) link, or the placeholder.
    pub shadow_set: DescriptorSetHandle,
}

/// Per-frame inputs of a camera job, captured by value.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub slot: FrameSlot,
    pub camera_set: DescriptorSetHandle,
    pub draws: Vec<MeshDraw>,
    pub lights: Vec<LightDraw>,
    pub unshadowed_set: DescriptorSetHandle,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuCameraData {
    pub view: [f32; 16],
    pub projection: [f32; 16],
    pub view_projection: [f32; 16],
    pub position: [f32; 4],
    /// near, far, width, height
    pub clip: [f32; 4],
}

impl GpuCameraData {
    pub fn from_camera(camera: &Camera) -> Self {
        Self {
            view: camera.view.to_cols_array(),
            projection: camera.projection.to_cols_array(),
            view_projection: camera.view_projection().to_cols_array(),
            position: camera.position().extend(1.0).to_array(),
            clip: [
                camera.near,
                camera.far,
                camera.extent.width as f32,
                camera.extent.height as f32,
            ],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuMeshData {
    pub model: [f32; 16],
    pub base_color: [f32; 4],
    /// metallic, roughness, emissive, unused
    pub material: [f32; 4],
}

impl GpuMeshData {
    pub fn from_mesh(mesh: &Mesh) -> Self {
        let material = mesh.material();
        Self {
            model: mesh.transform().to_cols_array(),
            base_color: material.base_color.to_array(),
            material: [material.metallic, material.roughness, material.emissive, 0.0],
        }
    }
}

/// Per-light push constants of the lighting passes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuLightPush {
    /// xyz, w = 0 for a direction, 1 for a position
    pub position_or_direction: [f32; 4],
    /// rgb, intensity
    pub color: [f32; 4],
    /// range, shadowed, unused, unused
    pub params: [f32; 4],
}

impl GpuLightPush {
    pub fn from_light(light: &Light, shadowed: bool) -> Self {
        let (position_or_direction, range) = match light.kind {
            LightKind::Directional { direction } => (direction.extend(0.0), 0.0),
            LightKind::Point { position, range } => (position.extend(1.0), range),
        };
        Self {
            position_or_direction: position_or_direction.to_array(),
            color: light.color.extend(light.intensity).to_array(),
            params: [range, if shadowed { 1.0 } else { 0.0 }, 0.0, 0.0],
        }
    }
}

/// Binds `set` at the index `pipeline` registered `kind` under.
pub(crate) fn bind_set(
    encoder: &mut CommandEncoder,
    pipeline: &RenderPipeline,
    kind: SetKind,
    set: DescriptorSetHandle,
) -> Result<()> {
    let index = pipeline.set_index(kind).ok_or_else(|| {
        RenderError::InvalidConfig(format!(
            "pipeline '{}' has no {kind:?} set",
            pipeline.blueprint().label
        ))
    })?;
    encoder.bind_descriptor_sets(pipeline.layout(), index, &[set])
}

pub(crate) fn draw_meshes(
    encoder: &mut CommandEncoder,
    pipeline: &RenderPipeline,
    draws: &[MeshDraw],
) -> Result<()> {
    for draw in draws {
        bind_set(encoder, pipeline, SetKind::Mesh, draw.mesh_set)?;
        encoder.bind_vertex_buffer(draw.vertex_buffer)?;
        encoder.bind_index_buffer(draw.index_buffer)?;
        encoder.draw_indexed(draw.index_count)?;
    }
    Ok(())
}

pub(crate) fn create_target(
    device: &dyn GpuDevice,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    label: &'static str,
) -> Result<ImageHandle> {
    if !device.supports_format(format, usage) {
        log::error!("{label} needs {format:?}, unsupported on {}", device.name());
        return Err(RenderError::UnsupportedFormat(format));
    }
    device.create_image(&ImageDesc {
        extent,
        format,
        layers: 1,
        usage,
        label,
    })
}
