//! Global configuration constants and runtime settings for the frame orchestrator.

use serde::{Deserialize, Serialize};

use crate::{RenderError, Result};

/// Number of per-frame copies kept for every CPU-written, GPU-read resource.
/// Must stay >= the real queue depth of the presentation layer.
pub const FRAMES_IN_FLIGHT: usize = 3;

/// Number of cascades computed for directional light shadows.
pub const CASCADE_COUNT: usize = 4;

/// Number of faces rendered for point light shadows.
pub const CUBE_FACES: usize = 6;

/// Upper bound on shadow views stored per (light, camera) pair.
pub const MAX_SHADOW_VIEWS: usize = 6;

/// Command buffers rotated by each recording worker.
pub const COMMAND_RING_SIZE: usize = 2;

/// Blend between logarithmic (1.0) and uniform (0.0) cascade splits.
pub const DEFAULT_SPLIT_LAMBDA: f32 = 0.95;

/// Cascade sphere radii are rounded up to multiples of `1 / CASCADE_RADIUS_GRANULARITY`.
pub const CASCADE_RADIUS_GRANULARITY: f32 = 16.0;

/// Smallest radius a cascade bounding sphere may have.
pub const MIN_CASCADE_RADIUS: f32 = 1.0e-3;

/// Camera renderer-stage flavour, picked when the camera is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RendererKind {
    /// G-buffer subpass followed by a lighting subpass reading input attachments.
    #[default]
    Deferred,
    /// Single subpass, one additive draw per light.
    Forward,
}

/// Shadow rendering settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Shadow map resolution (square, per cascade layer).
    pub resolution: u32,
    /// Lambda for split calculation (0 = uniform, 1 = logarithmic).
    pub split_lambda: f32,
    /// Constant depth bias applied by the shadow pipeline.
    pub depth_bias: f32,
    /// Near plane used for point light cube faces.
    pub point_near: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            resolution: 2048,
            split_lambda: DEFAULT_SPLIT_LAMBDA,
            depth_bias: 1.25,
            point_near: 0.05,
        }
    }
}

/// Descriptor pool capacity. Pools never grow, so size them generously.
///
/// Every registered object holds one set per frame slot for its whole life:
/// - mesh: `FRAMES_IN_FLIGHT` sets of one uniform buffer;
/// - camera: the same, plus one set of 3 input attachments for a deferred camera;
/// - shadow link and the unshadowed placeholder: `FRAMES_IN_FLIGHT` sets of one
///   uniform buffer and one sampled image.
///
/// The default pool holds roughly 300 meshes; use [`DescriptorPoolConfig::for_scene`]
/// for larger scenes. Running out fails the registration with `DescriptorPoolExhausted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorPoolConfig {
    pub max_sets: u32,
    pub uniform_buffers: u32,
    pub sampled_images: u32,
    pub input_attachments: u32,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: 1024,
            uniform_buffers: 1024,
            sampled_images: 512,
            input_attachments: 128,
        }
    }
}

impl DescriptorPoolConfig {
    const HEADROOM: u32 = 16;

    /// Pool that fits `cameras` (all deferred), each linked to `shadowed_lights`, and
    /// `meshes`, plus a little headroom.
    pub fn for_scene(cameras: u32, shadowed_lights: u32, meshes: u32) -> Self {
        let slots = FRAMES_IN_FLIGHT as u32;
        let links = cameras * shadowed_lights + 1;
        let uniform_buffers = slots * (meshes + cameras + links) + Self::HEADROOM;
        let sampled_images = slots * links + Self::HEADROOM;
        Self {
            max_sets: uniform_buffers + cameras,
            uniform_buffers,
            sampled_images,
            input_attachments: cameras * 3 + Self::HEADROOM,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    pub shadow: ShadowConfig,
    pub descriptors: DescriptorPoolConfig,
    /// Stage used for cameras that do not request one explicitly.
    pub default_renderer: RendererKind,
    /// CPU budget for update → wait_record, in milliseconds.
    pub frame_budget_ms: f32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            shadow: ShadowConfig::default(),
            descriptors: DescriptorPoolConfig::default(),
            default_renderer: RendererKind::Deferred,
            frame_budget_ms: 16.6,
        }
    }
}

impl RendererConfig {
    /// High quality preset
    pub fn high_quality() -> Self {
        Self {
            shadow: ShadowConfig {
                resolution: 4096,
                depth_bias: 0.75,
                ..ShadowConfig::default()
            },
            ..Self::default()
        }
    }

    /// Performance preset
    pub fn performance() -> Self {
        Self {
            shadow: ShadowConfig {
                resolution: 1024,
                split_lambda: 0.8,
                depth_bias: 2.0,
                ..ShadowConfig::default()
            },
            default_renderer: RendererKind::Forward,
            frame_budget_ms: 8.3,
            ..Self::default()
        }
    }

    /// Rejects values that would only fail later on the device.
    pub fn validate(&self) -> Result<()> {
        if self.shadow.resolution == 0 {
            return Err(RenderError::InvalidConfig(
                "shadow resolution must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.shadow.split_lambda) {
            return Err(RenderError::InvalidConfig(format!(
                "split lambda {} outside [0, 1]",
                self.shadow.split_lambda
            )));
        }
        if self.shadow.point_near <= 0.0 {
            return Err(RenderError::InvalidConfig(
                "point light near plane must be positive".to_string(),
            ));
        }
        if self.descriptors.max_sets == 0 {
            return Err(RenderError::InvalidConfig(
                "descriptor pool needs at least one set".to_string(),
            ));
        }
        Ok(())
    }
}
