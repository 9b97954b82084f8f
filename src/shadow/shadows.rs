use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

use super::cascade::ShadowView;
use crate::config::{ShadowConfig, CASCADE_COUNT, CUBE_FACES, MAX_SHADOW_VIEWS};
use crate::frame::{FrameResourceRing, FrameSlot, UniformRing};
use crate::gpu::{
    AttachmentView, DescriptorResource, DescriptorSetHandle, DescriptorWrite, FramebufferHandle,
    GpuDevice, ImageDesc, ImageHandle, RenderPassHandle,
};
use crate::pipeline::{DescriptorAllocator, DescriptorSet, SetKind, SharedLayouts};
use crate::{RenderError, Result};

pub const SHADOW_MAP_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Which shadow path a [`Shadows`] object renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowKind {
    /// One layer per cascade, directional lights.
    Cascaded,
    /// One layer per cube face, point lights.
    Cube,
    /// 1×1 placeholder bound for lights without shadows.
    Unshadowed,
}

impl ShadowKind {
    pub fn layer_count(self) -> u32 {
        match self {
            Self::Cascaded => CASCADE_COUNT as u32,
            Self::Cube => CUBE_FACES as u32,
            Self::Unshadowed => 1,
        }
    }

    fn shader_id(self) -> f32 {
        match self {
            Self::Unshadowed => 0.0,
            Self::Cascaded => 1.0,
            Self::Cube => 2.0,
        }
    }
}

/// Shadow uniform block, uploaded into the ring slot of the frame that computed it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuShadowData {
    /// Light-space view-projection per layer.
    pub transforms: [[f32; 16]; MAX_SHADOW_VIEWS],
    /// View-depth split per layer; unused entries are zero.
    pub splits: [f32; 8],
    /// x: view count, y: kind (0 none, 1 cascaded, 2 cube), z: depth bias, w: map resolution
    pub params: [f32; 4],
}

impl GpuShadowData {
    pub fn new(kind: ShadowKind, views: &[ShadowView], depth_bias: f32, resolution: u32) -> Self {
        let mut data = Self::zeroed();
        let count = views.len().min(MAX_SHADOW_VIEWS);
        for (i, view) in views.iter().take(count).enumerate() {
            data.transforms[i] = view.light_space.to_cols_array();
            data.splits[i] = view.split_depth;
        }
        data.params = [count as f32, kind.shader_id(), depth_bias, resolution as f32];
        data
    }
}

/// Shadow maps and cascade data for one (light, camera) pair.
///
/// Views are only valid after [`update`](Self::update) has run once. The depth image
/// has one layer per view and one framebuffer per layer.
pub struct Shadows {
    device: Arc<dyn GpuDevice>,
    kind: ShadowKind,
    image: ImageHandle,
    resolution: u32,
    depth_bias: f32,
    framebuffers: Vec<FramebufferHandle>,
    uniforms: UniformRing<GpuShadowData>,
    sets: FrameResourceRing<DescriptorSet>,
    views: Vec<ShadowView>,
    valid: bool,
    updated_slot: Option<FrameSlot>,
}

impl Shadows {
    pub fn init(
        device: Arc<dyn GpuDevice>,
        layouts: &SharedLayouts,
        allocator: &DescriptorAllocator,
        render_pass: RenderPassHandle,
        kind: ShadowKind,
        config: &ShadowConfig,
    ) -> Result<Self> {
        if kind == ShadowKind::Unshadowed {
            return Err(RenderError::InvalidConfig(
                "use Shadows::unshadowed for the placeholder".to_string(),
            ));
        }
        let mut shadows = Self::create(device, layouts, allocator, kind, config.resolution)?;
        shadows.depth_bias = config.depth_bias;

        let extent = shadows.extent();
        for layer in 0..kind.layer_count() {
            let framebuffer = shadows.device.create_framebuffer(
                render_pass,
                &[AttachmentView {
                    image: shadows.image,
                    layer,
                }],
                extent,
            )?;
            shadows.framebuffers.push(framebuffer);
        }
        log::debug!(
            "Shadows created ({kind:?}, {} layers, {}px)",
            kind.layer_count(),
            config.resolution
        );
        Ok(shadows)
    }

    /// Placeholder bound by lighting passes for lights that cast no shadows.
    /// Valid immediately, with zeroed data in every slot.
    pub fn unshadowed(
        device: Arc<dyn GpuDevice>,
        layouts: &SharedLayouts,
        allocator: &DescriptorAllocator,
    ) -> Result<Self> {
        let mut shadows = Self::create(device, layouts, allocator, ShadowKind::Unshadowed, 1)?;
        let empty = GpuShadowData::new(ShadowKind::Unshadowed, &[], 0.0, 1);
        for slot in FrameSlot::all() {
            shadows.uniforms.write(slot, &empty)?;
        }
        shadows.valid = true;
        Ok(shadows)
    }

    fn create(
        device: Arc<dyn GpuDevice>,
        layouts: &SharedLayouts,
        allocator: &DescriptorAllocator,
        kind: ShadowKind,
        resolution: u32,
    ) -> Result<Self> {
        let usage = vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED;
        if !device.supports_format(SHADOW_MAP_FORMAT, usage) {
            log::error!("Shadow map format {SHADOW_MAP_FORMAT:?} unsupported on {}", device.name());
            return Err(RenderError::UnsupportedFormat(SHADOW_MAP_FORMAT));
        }

        let uniforms = UniformRing::<GpuShadowData>::new(device.clone(), "shadow uniforms")?;
        let image = device.create_image(&ImageDesc {
            extent: vk::Extent2D {
                width: resolution,
                height: resolution,
            },
            format: SHADOW_MAP_FORMAT,
            layers: kind.layer_count(),
            usage,
            label: "shadow map",
        })?;

        let layout = layouts.get(SetKind::Shadow)?;
        let sets = FrameResourceRing::try_new(|slot| {
            let set = allocator.allocate_set(layout)?;
            set.write(&[
                DescriptorWrite {
                    binding: 0,
                    resource: uniforms.descriptor(slot),
                },
                DescriptorWrite {
                    binding: 1,
                    resource: DescriptorResource::SampledImage { image },
                },
            ])?;
            Ok(set)
        });
        let sets = match sets {
            Ok(sets) => sets,
            Err(err) => {
                device.destroy_image(image);
                return Err(err);
            }
        };

        Ok(Self {
            device,
            kind,
            image,
            resolution,
            depth_bias: 0.0,
            framebuffers: Vec::new(),
            uniforms,
            sets,
            views: Vec::new(),
            valid: false,
            updated_slot: None,
        })
    }

    /// Stores freshly computed views and uploads them into `slot` only.
    pub fn update(&mut self, slot: FrameSlot, views: Vec<ShadowView>) -> Result<()> {
        let data = GpuShadowData::new(self.kind, &views, self.depth_bias, self.resolution);
        self.uniforms.write(slot, &data)?;
        self.views = views;
        self.valid = true;
        self.updated_slot = Some(slot);
        Ok(())
    }

    /// Current views; empty until the first update.
    pub fn cascades(&self) -> &[ShadowView] {
        &self.views
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn kind(&self) -> ShadowKind {
        self.kind
    }

    pub fn updated_slot(&self) -> Option<FrameSlot> {
        self.updated_slot
    }

    pub fn image(&self) -> ImageHandle {
        self.image
    }

    pub fn framebuffers(&self) -> &[FramebufferHandle] {
        &self.framebuffers
    }

    pub fn layer_count(&self) -> u32 {
        self.kind.layer_count()
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.resolution,
            height: self.resolution,
        }
    }

    pub fn descriptor_set(&self, slot: FrameSlot) -> DescriptorSetHandle {
        self.sets.bind(slot).handle()
    }
}

impl Drop for Shadows {
    fn drop(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(framebuffer);
        }
        self.device.destroy_image(self.image);
    }
}
