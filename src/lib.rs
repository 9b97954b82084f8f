//! Frame Orchestrator – multi-camera GPU frame scheduling for Rust.
//!
//! The crate turns a plain [`scene::Scene`] into per-frame GPU command buffers:
//! it owns per-camera and per-light GPU bundles, rings every per-frame resource over
//! `FRAMES_IN_FLIGHT` slots, computes cascaded shadow maps and records every camera
//! and shadow pass on its own worker thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use frame_orchestrator::prelude::*;
//!
//! # fn main() -> frame_orchestrator::Result<()> {
//! let device = Arc::new(HeadlessDevice::new());
//! let shaders = ShaderCatalog::with_module_for_all_passes(ShaderModuleHandle(1));
//! let mut scene = Scene::new();
//! let camera = scene.add_camera(Camera::perspective(
//!     1.0,
//!     ash::vk::Extent2D { width: 1280, height: 720 },
//!     0.1,
//!     200.0,
//! ));
//!
//! let mut frames = FrameScheduler::new(device, RendererConfig::default(), shaders)?;
//! frames.add_camera(&scene, camera)?;
//! frames.update(&scene)?;
//! frames.record(&scene)?;
//! frames.wait_record()?;
//! let _batch = frames.command_buffers()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod pipeline;
pub mod recording;
pub mod scene;
pub mod scheduler;
pub mod shadow;
pub mod stage;
pub mod utils;

pub use glam::{Mat4, Vec3, Vec4};

pub use config::{RendererConfig, RendererKind, ShadowConfig};
pub use error::{ErrorSeverity, RenderError, Result};
pub use scheduler::{FramePhase, FrameScheduler, FrameStats};

/// Everything needed to drive a frame loop.
pub mod prelude {
    pub use crate::config::{DescriptorPoolConfig, RendererConfig, RendererKind, ShadowConfig};
    pub use crate::error::{ErrorSeverity, RenderError, Result};
    pub use crate::gpu::{GpuDevice, HeadlessDevice, ShaderModuleHandle};
    pub use crate::pipeline::{ShaderCatalog, ShaderPass};
    pub use crate::scene::{
        BoundingSphere, Camera, CameraId, Light, LightId, LightKind, Mesh, MeshId, Scene,
    };
    pub use crate::scheduler::{FramePhase, FrameScheduler, FrameStats};
    pub use crate::shadow::CascadeShadowComputer;
    pub use glam::{Mat4, Vec3, Vec4};
}
