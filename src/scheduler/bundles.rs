//! GPU-side bundles the scheduler keeps next to the scene's plain objects.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::FRAMES_IN_FLIGHT;
use crate::frame::{FrameResourceRing, FrameSlot, UniformRing};
use crate::gpu::{DescriptorSetHandle, DescriptorWrite};
use crate::pipeline::{DescriptorSet, SetKind};
use crate::recording::RecordingWorker;
use crate::scene::{CameraId, LightId, Mesh};
use crate::shadow::Shadows;
use crate::stage::{GpuCameraData, GpuMeshData, RenderStage, ShadowStage, StageContext};
use crate::Result;

crate::arena_key!(
    /// Scheduler-owned id of a camera bundle.
    CameraBundleId
);
crate::arena_key!(
    /// Scheduler-owned id of a light bundle.
    LightBundleId
);

/// Uniform ring plus one descriptor set per slot pointing at that slot's copy.
pub(crate) struct UniformBinding<T: bytemuck::Pod> {
    pub uniforms: UniformRing<T>,
    pub sets: FrameResourceRing<DescriptorSet>,
}

impl<T: bytemuck::Pod> UniformBinding<T> {
    pub fn new(ctx: &StageContext, kind: SetKind, label: &'static str) -> Result<Self> {
        let uniforms = UniformRing::<T>::new(ctx.device.clone(), label)?;
        let layout = ctx.layouts.get(kind)?;
        let sets = FrameResourceRing::try_new(|slot| {
            let set = ctx.allocator.allocate_set(layout)?;
            set.write(&[DescriptorWrite {
                binding: 0,
                resource: uniforms.descriptor(slot),
            }])?;
            Ok(set)
        })?;
        Ok(Self { uniforms, sets })
    }

    pub fn write(&self, slot: FrameSlot, value: &T) -> Result<()> {
        self.uniforms.write(slot, value)
    }

    pub fn set(&self, slot: FrameSlot) -> DescriptorSetHandle {
        self.sets.bind(slot).handle()
    }
}

pub(crate) struct CameraBundle {
    pub camera: CameraId,
    pub stage: Arc<RwLock<Box<dyn RenderStage>>>,
    pub worker: RecordingWorker,
    pub binding: UniformBinding<GpuCameraData>,
    /// Camera whose shadow links this one uses; itself unless it has a live fallback.
    pub shadow_owner: CameraBundleId,
}

/// Shadow map and recording worker of one (light, owner camera) pair.
pub(crate) struct ShadowLink {
    pub shadows: Shadows,
    pub worker: RecordingWorker,
}

pub(crate) struct LightBundle {
    pub light: LightId,
    pub stage: Arc<ShadowStage>,
    /// Keyed by owner camera; dependents resolve through their owner.
    pub links: std::collections::BTreeMap<CameraBundleId, ShadowLink>,
}

pub(crate) struct MeshBundle {
    pub binding: UniformBinding<GpuMeshData>,
    /// Mesh revision last written into each slot.
    uploaded: [Option<u64>; FRAMES_IN_FLIGHT],
    pub reported_empty: bool,
}

impl MeshBundle {
    pub fn new(ctx: &StageContext) -> Result<Self> {
        Ok(Self {
            binding: UniformBinding::new(ctx, SetKind::Mesh, "mesh uniforms")?,
            uploaded: [None; FRAMES_IN_FLIGHT],
            reported_empty: false,
        })
    }

    /// Writes the mesh into `slot` if that slot holds an older revision.
    /// Returns whether an upload happened.
    pub fn sync(&mut self, slot: FrameSlot, mesh: &Mesh) -> Result<bool> {
        if self.uploaded[slot.index()] == Some(mesh.revision()) {
            return Ok(false);
        }
        self.binding.write(slot, &GpuMeshData::from_mesh(mesh))?;
        self.uploaded[slot.index()] = Some(mesh.revision());
        Ok(true)
    }
}
