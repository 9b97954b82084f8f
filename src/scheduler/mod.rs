//! The frame orchestrator.
//!
//! # Per-frame flow
//! 1. [`FrameScheduler::update`] drains queued mesh removals, advances the ring slot,
//!    rebuilds camera stages whose extent or polygon mode changed, reconciles shadow
//!    links, recomputes shadow views and uploads changed uniforms into the new slot.
//! 2. [`FrameScheduler::record`] walks cameras in a stable order (shadow owners first)
//!    and, per camera, submits every shadow job before the camera's own job.
//! 3. [`FrameScheduler::wait_record`] joins every worker in submission order.
//! 4. The caller submits [`FrameScheduler::command_buffers`] as one batch, in order.
//!
//! # Workers
//! Each camera owns one [`RecordingWorker`]. Each (light, owner camera) pair owns a
//! [`Shadows`] object and another worker, where a camera is its own owner unless it
//! names a registered shadow fallback. The live worker count is therefore
//! `cameras × (1 + shadow-casting lights)` for owner cameras and `1` for dependents.

mod bundles;
mod stats;

pub use bundles::{CameraBundleId, LightBundleId};
pub use stats::FrameStats;

use glam::Vec3;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use bundles::{CameraBundle, LightBundle, MeshBundle, ShadowLink, UniformBinding};
use crate::config::RendererConfig;
use crate::frame::{FrameCounter, FrameSlot, RemovalQueue};
use crate::gpu::{CommandBufferHandle, GpuDevice, ImageHandle};
use crate::pipeline::{DescriptorAllocator, SetKind, ShaderCatalog, SharedLayouts};
use crate::recording::RecordingWorker;
use crate::scene::{Camera, CameraId, Frustum, Light, LightId, LightKind, MeshId, Scene};
use crate::shadow::{
    point_light_views, CascadeInput, CascadeShadowComputer, ShadowKind, ShadowView, Shadows,
};
use crate::stage::{
    create_camera_stage, CameraFrame, GpuCameraData, GpuLightPush, LightDraw, MeshDraw,
    ShadowFrame, ShadowStage, StageContext,
};
use crate::utils::{warn_if_frame_budget_exceeded, Arena, ScopedTimer};
use crate::{RenderError, Result};

/// Where the scheduler is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Updated,
    Recording,
    Recorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAdd {
    Camera(CameraId),
    Light(LightId),
    Mesh(MeshId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerRef {
    Shadow(LightBundleId, CameraBundleId),
    Camera(CameraBundleId),
}

#[derive(Debug, Clone, Copy)]
enum ShadowTask {
    Cascade { input: CascadeInput, direction: Vec3 },
    Cube { position: Vec3, range: f32 },
}

struct ShadowJob {
    light: LightBundleId,
    camera: CameraBundleId,
    task: ShadowTask,
    views: Vec<ShadowView>,
}

impl ShadowJob {
    fn compute(&mut self, computer: &CascadeShadowComputer, point_near: f32) {
        self.views = match self.task {
            ShadowTask::Cascade { input, direction } => computer.compute(&input, direction),
            ShadowTask::Cube { position, range } => point_light_views(position, range, point_near),
        };
    }
}

fn shadow_kind(light: &Light) -> ShadowKind {
    match light.kind {
        LightKind::Directional { .. } => ShadowKind::Cascaded,
        LightKind::Point { .. } => ShadowKind::Cube,
    }
}

pub struct FrameScheduler {
    ctx: StageContext,
    cascades: CascadeShadowComputer,
    counter: FrameCounter,
    parallel_enabled: bool,
    initialized: bool,
    pending: Vec<PendingAdd>,
    cameras: Arena<CameraBundleId, CameraBundle>,
    camera_index: HashMap<CameraId, CameraBundleId>,
    lights: Arena<LightBundleId, LightBundle>,
    light_index: HashMap<LightId, LightBundleId>,
    meshes: BTreeMap<MeshId, MeshBundle>,
    removals: RemovalQueue<MeshId>,
    unshadowed: Shadows,
    phase: FramePhase,
    submitted: Vec<WorkerRef>,
    command_buffers: Vec<CommandBufferHandle>,
    stats: FrameStats,
    frame_start: Option<Instant>,
}

impl FrameScheduler {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        config: RendererConfig,
        shaders: ShaderCatalog,
    ) -> Result<Self> {
        config.validate()?;
        let layouts = Arc::new(SharedLayouts::new(device.clone())?);
        let allocator = DescriptorAllocator::new(device.clone(), &config.descriptors)?;
        let unshadowed = Shadows::unshadowed(device.clone(), &layouts, &allocator)?;
        log::info!(
            "FrameScheduler created on {} ({} frames in flight, {:?} by default)",
            device.name(),
            crate::config::FRAMES_IN_FLIGHT,
            config.default_renderer
        );

        Ok(Self {
            cascades: CascadeShadowComputer::new(config.shadow.split_lambda),
            ctx: StageContext {
                device,
                layouts,
                allocator,
                shaders: Arc::new(shaders),
                config: Arc::new(config),
            },
            counter: FrameCounter::new(),
            parallel_enabled: cfg!(feature = "parallel"),
            initialized: false,
            pending: Vec::new(),
            cameras: Arena::new(),
            camera_index: HashMap::new(),
            lights: Arena::new(),
            light_index: HashMap::new(),
            meshes: BTreeMap::new(),
            removals: RemovalQueue::new("meshes"),
            unshadowed,
            phase: FramePhase::Idle,
            submitted: Vec::new(),
            command_buffers: Vec::new(),
            stats: FrameStats::default(),
            frame_start: None,
        })
    }

    /// Computes shadow views on the rayon pool. No effect without the `parallel` feature.
    pub fn set_parallel_enabled(&mut self, enabled: bool) {
        self.parallel_enabled = enabled && cfg!(feature = "parallel");
    }

    pub fn parallel_enabled(&self) -> bool {
        self.parallel_enabled
    }

    pub fn config(&self) -> &RendererConfig {
        &self.ctx.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Creates every bundle registered so far. Called by the first `update` if needed.
    pub fn init(&mut self, scene: &Scene) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        for add in &pending {
            match *add {
                PendingAdd::Camera(id) => self.create_camera(scene, id)?,
                PendingAdd::Light(id) => self.create_light(scene, id)?,
                PendingAdd::Mesh(id) => self.create_mesh(scene, id)?,
            }
        }
        self.initialized = true;
        self.reconcile_links(scene)?;
        log::info!(
            "FrameScheduler initialized: {} cameras, {} lights, {} meshes, {} workers",
            self.camera_count(),
            self.light_count(),
            self.mesh_count(),
            self.worker_count()
        );
        Ok(())
    }

    pub fn add_camera(&mut self, scene: &Scene, id: CameraId) -> Result<()> {
        self.ensure_not_recording("add_camera")?;
        if scene.camera(id).is_none() {
            return Err(RenderError::ResourceNotFound(format!("{id} not in scene")));
        }
        if self.camera_index.contains_key(&id) || self.pending.contains(&PendingAdd::Camera(id)) {
            return Err(RenderError::InvalidConfig(format!("{id} already registered")));
        }
        if !self.initialized {
            self.pending.push(PendingAdd::Camera(id));
            return Ok(());
        }
        self.create_camera(scene, id)?;
        self.reconcile_links(scene)
    }

    pub fn add_light(&mut self, scene: &Scene, id: LightId) -> Result<()> {
        self.ensure_not_recording("add_light")?;
        if scene.light(id).is_none() {
            return Err(RenderError::ResourceNotFound(format!("{id} not in scene")));
        }
        if self.light_index.contains_key(&id) || self.pending.contains(&PendingAdd::Light(id)) {
            return Err(RenderError::InvalidConfig(format!("{id} already registered")));
        }
        if !self.initialized {
            self.pending.push(PendingAdd::Light(id));
            return Ok(());
        }
        self.create_light(scene, id)?;
        self.reconcile_links(scene)
    }

    pub fn add_mesh(&mut self, scene: &Scene, id: MeshId) -> Result<()> {
        self.ensure_not_recording("add_mesh")?;
        if scene.mesh(id).is_none() {
            return Err(RenderError::ResourceNotFound(format!("{id} not in scene")));
        }
        if self.meshes.contains_key(&id) || self.pending.contains(&PendingAdd::Mesh(id)) {
            return Err(RenderError::InvalidConfig(format!("{id} already registered")));
        }
        if !self.initialized {
            self.pending.push(PendingAdd::Mesh(id));
            return Ok(());
        }
        self.create_mesh(scene, id)
    }

    /// Destroys the camera's bundle and its shadow links after a device-idle barrier.
    /// Dependents of the camera fall back to their own shadow links.
    pub fn remove_camera(&mut self, scene: &Scene, id: CameraId) -> Result<()> {
        self.ensure_not_recording("remove_camera")?;
        if self.remove_pending(PendingAdd::Camera(id)) {
            return Ok(());
        }
        let bundle_id = self
            .camera_index
            .get(&id)
            .copied()
            .ok_or_else(|| RenderError::ResourceNotFound(format!("{id} not registered")))?;

        self.ctx.device.wait_idle()?;
        self.camera_index.remove(&id);
        let bundle = self.cameras.remove(bundle_id);
        let mut links = Vec::new();
        for (_, light) in self.lights.iter_mut() {
            links.extend(light.links.remove(&bundle_id));
        }
        drop(links);
        drop(bundle);
        self.command_buffers.clear();
        log::debug!("Removed camera {id}");

        if self.initialized {
            self.reconcile_links(scene)?;
        }
        Ok(())
    }

    pub fn remove_light(&mut self, id: LightId) -> Result<()> {
        self.ensure_not_recording("remove_light")?;
        if self.remove_pending(PendingAdd::Light(id)) {
            return Ok(());
        }
        let bundle_id = self
            .light_index
            .get(&id)
            .copied()
            .ok_or_else(|| RenderError::ResourceNotFound(format!("{id} not registered")))?;

        self.ctx.device.wait_idle()?;
        self.light_index.remove(&id);
        drop(self.lights.remove(bundle_id));
        self.command_buffers.clear();
        log::debug!("Removed light {id}");
        Ok(())
    }

    /// Queues the mesh for destruction at the start of the next `update`.
    ///
    /// Allowed in any phase: command buffers already recorded this frame keep their
    /// references valid until then.
    pub fn remove_mesh(&mut self, id: MeshId) -> Result<()> {
        if self.remove_pending(PendingAdd::Mesh(id)) {
            return Ok(());
        }
        if !self.meshes.contains_key(&id) {
            return Err(RenderError::ResourceNotFound(format!("{id} not registered")));
        }
        if self.removals.contains(&id) {
            return Err(RenderError::InvalidConfig(format!("{id} already queued for removal")));
        }
        self.removals.push(id);
        Ok(())
    }

    pub fn update(&mut self, scene: &Scene) -> Result<FrameStats> {
        let _timer = ScopedTimer::new("FrameScheduler::update");
        self.ensure_not_recording("update")?;
        // A failed update leaves the slot half written.
        self.phase = FramePhase::Idle;
        if !self.initialized {
            self.init(scene)?;
        }
        self.frame_start = Some(Instant::now());
        let mut stats = FrameStats::default();

        if !self.removals.is_empty() {
            self.ctx.device.wait_idle()?;
            let meshes = &mut self.meshes;
            let mut removed = 0u32;
            self.removals.drain_pending(|id| {
                if meshes.remove(&id).is_some() {
                    removed += 1;
                    log::debug!("Removed mesh {id}");
                }
            });
            stats.meshes_removed = removed;
            self.command_buffers.clear();
        }

        let slot = self.counter.advance();
        self.command_buffers.clear();
        stats.frame = self.counter.frame();
        stats.slot = slot.index();

        for (_, bundle) in self.cameras.iter() {
            let camera = scene.camera(bundle.camera).ok_or_else(|| {
                RenderError::ResourceNotFound(format!("{} left the scene", bundle.camera))
            })?;
            let stale = {
                let stage = bundle.stage.read();
                stage.extent() != camera.extent || stage.polygon_mode() != camera.polygon_mode
            };
            if stale {
                log::debug!(
                    "Rebuilding stage of {} ({}x{}, {:?})",
                    bundle.camera,
                    camera.extent.width,
                    camera.extent.height,
                    camera.polygon_mode
                );
                bundle
                    .stage
                    .write()
                    .rebuild(camera.extent, camera.polygon_mode)?;
            }
            bundle
                .binding
                .write(slot, &GpuCameraData::from_camera(camera))?;
            stats.uniform_uploads += 1;
        }

        self.reconcile_links(scene)?;

        let mut jobs = self.shadow_jobs(scene);
        let computer = self.cascades;
        let point_near = self.ctx.config.shadow.point_near;
        if self.parallel_enabled {
            #[cfg(feature = "parallel")]
            jobs.par_iter_mut()
                .for_each(|job| job.compute(&computer, point_near));
        } else {
            jobs.iter_mut()
                .for_each(|job| job.compute(&computer, point_near));
        }
        for job in jobs {
            let link = self
                .lights
                .get_mut(job.light)
                .and_then(|light| light.links.get_mut(&job.camera));
            if let Some(link) = link {
                link.shadows.update(slot, job.views)?;
                stats.cascade_updates += 1;
                stats.uniform_uploads += 1;
            }
        }

        for (id, bundle) in self.meshes.iter_mut() {
            let Some(mesh) = scene.mesh(*id) else {
                log::debug!("Mesh {id} not in scene, skipped");
                continue;
            };
            if bundle.sync(slot, mesh)? {
                stats.uniform_uploads += 1;
            }
            if mesh.is_drawable() {
                bundle.reported_empty = false;
            } else if !bundle.reported_empty {
                log::warn!("Mesh {id} has no indices, skipping it");
                bundle.reported_empty = true;
            }
        }

        self.phase = FramePhase::Updated;
        self.stats = stats.clone();
        log::trace!("{}", stats.format());
        Ok(stats)
    }

    /// Submits every shadow and camera job for the slot written by the last `update`.
    pub fn record(&mut self, scene: &Scene) -> Result<FrameStats> {
        let _timer = ScopedTimer::new("FrameScheduler::record");
        if self.phase != FramePhase::Updated {
            return Err(RenderError::FrameOutOfOrder(format!(
                "record called in phase {:?}, expected Updated",
                self.phase
            )));
        }
        let slot = self.counter.current();
        match self.submit_all(scene, slot) {
            Ok(()) => {
                self.phase = FramePhase::Recording;
                Ok(self.stats.clone())
            }
            Err(err) => {
                log::error!("Recording frame {} failed: {err}", self.stats.frame);
                self.join_submitted();
                self.command_buffers.clear();
                self.phase = FramePhase::Idle;
                Err(err)
            }
        }
    }

    /// Joins every worker given a job by `record`, in submission order.
    pub fn wait_record(&mut self) -> Result<FrameStats> {
        let _timer = ScopedTimer::new("FrameScheduler::wait_record");
        if self.phase != FramePhase::Recording {
            return Err(RenderError::WorkerIdle(format!(
                "wait_record called in phase {:?}, nothing is recording",
                self.phase
            )));
        }

        let mut first_error = None;
        for worker in std::mem::take(&mut self.submitted) {
            let result = match worker {
                WorkerRef::Shadow(light, camera) => self
                    .lights
                    .get_mut(light)
                    .and_then(|bundle| bundle.links.get_mut(&camera))
                    .map(|link| link.worker.wait()),
                WorkerRef::Camera(camera) => {
                    self.cameras.get_mut(camera).map(|bundle| bundle.worker.wait())
                }
            };
            match result {
                Some(Ok(job)) => self.stats.draws_recorded += job.draws,
                Some(Err(err)) => {
                    log::error!("Recording job {worker:?} failed: {err}");
                    first_error.get_or_insert(err);
                }
                None => {
                    first_error.get_or_insert(RenderError::WorkerLost(format!("{worker:?}")));
                }
            }
        }

        self.phase = FramePhase::Recorded;
        if let Some(start) = self.frame_start.take() {
            warn_if_frame_budget_exceeded(start.elapsed(), self.ctx.config.frame_budget_ms);
        }
        match first_error {
            Some(err) => {
                self.command_buffers.clear();
                Err(err)
            }
            None => Ok(self.stats.clone()),
        }
    }

    /// Command buffers recorded this frame, in the order they must be submitted.
    pub fn command_buffers(&self) -> Result<&[CommandBufferHandle]> {
        self.ensure_not_recording("command_buffers")?;
        Ok(&self.command_buffers)
    }

    pub fn render_image(&self, camera: CameraId) -> Result<ImageHandle> {
        self.ensure_not_recording("render_image")?;
        Ok(self.camera_bundle(camera)?.stage.read().render_image())
    }

    pub fn depth_render_image(&self, camera: CameraId) -> Result<ImageHandle> {
        self.ensure_not_recording("depth_render_image")?;
        Ok(self.camera_bundle(camera)?.stage.read().depth_render_image())
    }

    /// Shadow map sampled by `camera` for `light`, resolved through its shadow owner.
    pub fn shadow_map_image(&self, light: LightId, camera: CameraId) -> Result<ImageHandle> {
        let owner = self.camera_bundle(camera)?.shadow_owner;
        let bundle_id = self
            .light_index
            .get(&light)
            .ok_or_else(|| RenderError::ResourceNotFound(format!("{light} not registered")))?;
        self.lights
            .get(*bundle_id)
            .and_then(|bundle| bundle.links.get(&owner))
            .map(|link| link.shadows.image())
            .ok_or_else(|| {
                RenderError::ResourceNotFound(format!("{light} casts no shadows for {camera}"))
            })
    }

    /// Shadow views currently stored for (`light`, `camera`), through the shadow owner.
    pub fn shadow_views(&self, light: LightId, camera: CameraId) -> Option<&[ShadowView]> {
        let owner = self.camera_bundle(camera).ok()?.shadow_owner;
        let bundle_id = self.light_index.get(&light)?;
        self.lights
            .get(*bundle_id)?
            .links
            .get(&owner)
            .map(|link| link.shadows.cascades())
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn frame_slot(&self) -> FrameSlot {
        self.counter.current()
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn light_count(&self) -> usize {
        self.lights.len()
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn pending_mesh_removals(&self) -> usize {
        self.removals.len()
    }

    /// Number of live (light, camera) shadow links.
    pub fn shadows_count(&self) -> usize {
        self.lights.values().map(|light| light.links.len()).sum()
    }

    /// Camera workers plus shadow workers.
    pub fn worker_count(&self) -> usize {
        self.cameras.len() + self.shadows_count()
    }

    fn ensure_not_recording(&self, operation: &str) -> Result<()> {
        if self.phase == FramePhase::Recording {
            log::error!("{operation} called while jobs are recording");
            return Err(RenderError::FrameOutOfOrder(format!(
                "{operation} while recording; call wait_record first"
            )));
        }
        Ok(())
    }

    fn remove_pending(&mut self, add: PendingAdd) -> bool {
        let before = self.pending.len();
        self.pending.retain(|pending| *pending != add);
        before != self.pending.len()
    }

    fn camera_bundle(&self, camera: CameraId) -> Result<&CameraBundle> {
        self.camera_index
            .get(&camera)
            .and_then(|id| self.cameras.get(*id))
            .ok_or_else(|| RenderError::ResourceNotFound(format!("{camera} not registered")))
    }

    fn create_camera(&mut self, scene: &Scene, id: CameraId) -> Result<()> {
        let camera = scene
            .camera(id)
            .ok_or_else(|| RenderError::ResourceNotFound(format!("{id} not in scene")))?;
        let kind = camera.renderer.unwrap_or(self.ctx.config.default_renderer);
        let stage = create_camera_stage(kind, &self.ctx, camera)?;
        let binding = UniformBinding::new(&self.ctx, SetKind::Camera, "camera uniforms")?;
        if let Some(slot) = self.updated_slot() {
            binding.write(slot, &GpuCameraData::from_camera(camera))?;
        }
        let worker = RecordingWorker::new(self.ctx.device.clone(), format!("{id}"))?;

        let bundle_id = self.cameras.insert_with(|bundle_id| CameraBundle {
            camera: id,
            stage: Arc::new(parking_lot::RwLock::new(stage)),
            worker,
            binding,
            shadow_owner: bundle_id,
        });
        self.camera_index.insert(id, bundle_id);
        log::debug!("Camera {id} registered as {bundle_id} ({kind:?})");
        Ok(())
    }

    fn create_light(&mut self, scene: &Scene, id: LightId) -> Result<()> {
        if scene.light(id).is_none() {
            return Err(RenderError::ResourceNotFound(format!("{id} not in scene")));
        }
        let stage = Arc::new(ShadowStage::init(&self.ctx)?);
        let bundle_id = self.lights.insert(LightBundle {
            light: id,
            stage,
            links: BTreeMap::new(),
        });
        self.light_index.insert(id, bundle_id);
        log::debug!("Light {id} registered as {bundle_id}");
        Ok(())
    }

    fn create_mesh(&mut self, scene: &Scene, id: MeshId) -> Result<()> {
        let mesh = scene
            .mesh(id)
            .ok_or_else(|| RenderError::ResourceNotFound(format!("{id} not in scene")))?;
        let mut bundle = MeshBundle::new(&self.ctx)?;
        if let Some(slot) = self.updated_slot() {
            bundle.sync(slot, mesh)?;
        }
        self.meshes.insert(id, bundle);
        Ok(())
    }

    /// The slot the next `record` reads, when `update` already wrote it. Bundles
    /// created in that window upload into it immediately.
    fn updated_slot(&self) -> Option<FrameSlot> {
        (self.phase == FramePhase::Updated).then(|| self.counter.current())
    }

    /// Follows fallback chains to a registered camera without a fallback. Missing or
    /// cyclic fallbacks resolve to the last camera reached, or to the camera itself.
    fn resolve_shadow_owner(&self, scene: &Scene, start: CameraBundleId) -> CameraBundleId {
        let mut current = start;
        let mut visited = vec![start];
        loop {
            let fallback = self
                .cameras
                .get(current)
                .and_then(|bundle| scene.camera(bundle.camera))
                .and_then(|camera: &Camera| camera.shadow_fallback);
            let Some(fallback) = fallback else {
                return current;
            };
            match self.camera_index.get(&fallback) {
                Some(&next) if visited.contains(&next) => {
                    log::warn!("Shadow fallback cycle through {fallback}, camera keeps its own shadows");
                    return start;
                }
                Some(&next) => {
                    visited.push(next);
                    current = next;
                }
                None => return current,
            }
        }
    }

    /// Brings every light's links in line with the current cameras: one link per
    /// (shadow-casting light, owner camera). Stale links are destroyed after a
    /// device-idle barrier.
    fn reconcile_links(&mut self, scene: &Scene) -> Result<()> {
        let owners: Vec<(CameraBundleId, CameraBundleId)> = self
            .cameras
            .ids()
            .into_iter()
            .map(|id| (id, self.resolve_shadow_owner(scene, id)))
            .collect();
        for &(id, owner) in &owners {
            if let Some(bundle) = self.cameras.get_mut(id) {
                if bundle.shadow_owner != owner {
                    log::debug!("{} now takes shadows from {owner}", bundle.camera);
                    bundle.shadow_owner = owner;
                }
            }
        }
        let self_owned: Vec<CameraBundleId> = owners
            .iter()
            .filter(|(id, owner)| id == owner)
            .map(|(id, _)| *id)
            .collect();

        let mut stale = Vec::new();
        let mut missing = Vec::new();
        for (light_id, bundle) in self.lights.iter() {
            let wanted = scene
                .light(bundle.light)
                .filter(|light| light.casts_shadows)
                .map(shadow_kind);
            for (camera_id, link) in &bundle.links {
                if wanted != Some(link.shadows.kind()) || !self_owned.contains(camera_id) {
                    stale.push((light_id, *camera_id));
                }
            }
            if let Some(kind) = wanted {
                for camera_id in &self_owned {
                    let linked = bundle
                        .links
                        .get(camera_id)
                        .is_some_and(|link| link.shadows.kind() == kind);
                    if !linked {
                        missing.push((light_id, *camera_id, kind));
                    }
                }
            }
        }

        if !stale.is_empty() {
            self.ctx.device.wait_idle()?;
            for (light_id, camera_id) in stale {
                if let Some(bundle) = self.lights.get_mut(light_id) {
                    bundle.links.remove(&camera_id);
                    log::debug!("Dropped shadow link {light_id} -> {camera_id}");
                }
            }
            self.command_buffers.clear();
        }

        for (light_id, camera_id, kind) in missing {
            let link = self.create_link(light_id, camera_id, kind)?;
            if let Some(bundle) = self.lights.get_mut(light_id) {
                bundle.links.insert(camera_id, link);
                log::debug!("Created {kind:?} shadow link {light_id} -> {camera_id}");
            }
        }
        Ok(())
    }

    fn create_link(
        &self,
        light: LightBundleId,
        camera: CameraBundleId,
        kind: ShadowKind,
    ) -> Result<ShadowLink> {
        let stage = self
            .lights
            .get(light)
            .map(|bundle| bundle.stage.clone())
            .ok_or_else(|| RenderError::ResourceNotFound(format!("{light}")))?;
        let shadows = Shadows::init(
            self.ctx.device.clone(),
            &self.ctx.layouts,
            &self.ctx.allocator,
            stage.render_pass(),
            kind,
            &self.ctx.config.shadow,
        )?;
        let worker = RecordingWorker::new(self.ctx.device.clone(), format!("{light}/{camera}"))?;
        Ok(ShadowLink { shadows, worker })
    }

    fn shadow_jobs(&self, scene: &Scene) -> Vec<ShadowJob> {
        let mut jobs = Vec::new();
        for (light_id, bundle) in self.lights.iter() {
            let Some(light) = scene.light(bundle.light) else {
                continue;
            };
            for camera_id in bundle.links.keys() {
                let task = match light.kind {
                    LightKind::Directional { direction } => {
                        let Some(camera) = self
                            .cameras
                            .get(*camera_id)
                            .and_then(|camera| scene.camera(camera.camera))
                        else {
                            continue;
                        };
                        ShadowTask::Cascade {
                            input: CascadeInput::from_camera(camera),
                            direction,
                        }
                    }
                    LightKind::Point { position, range } => ShadowTask::Cube { position, range },
                };
                jobs.push(ShadowJob {
                    light: light_id,
                    camera: *camera_id,
                    task,
                    views: Vec::new(),
                });
            }
        }
        jobs
    }

    /// Shadow owners first, then dependents, each in id order.
    fn camera_order(&self) -> Vec<CameraBundleId> {
        let mut ids = self.cameras.ids();
        ids.sort();
        let (mut owners, dependents): (Vec<_>, Vec<_>) = ids.into_iter().partition(|id| {
            self.cameras
                .get(*id)
                .is_some_and(|bundle| bundle.shadow_owner == *id)
        });
        owners.extend(dependents);
        owners
    }

    fn mesh_draws(
        &self,
        scene: &Scene,
        slot: FrameSlot,
        frustum: Option<&Frustum>,
    ) -> (Vec<MeshDraw>, u32) {
        let mut draws = Vec::with_capacity(self.meshes.len());
        let mut culled = 0;
        for (id, bundle) in &self.meshes {
            let Some(mesh) = scene.mesh(*id) else {
                continue;
            };
            if !mesh.is_drawable() {
                continue;
            }
            match frustum {
                Some(frustum) => {
                    let bounds = mesh.world_bounds();
                    if !frustum.intersects_sphere(bounds.center, bounds.radius) {
                        culled += 1;
                        continue;
                    }
                }
                None if !mesh.casts_shadows => continue,
                None => {}
            }
            draws.push(MeshDraw {
                vertex_buffer: mesh.vertex_buffer,
                index_buffer: mesh.index_buffer,
                index_count: mesh.index_count,
                mesh_set: bundle.binding.set(slot),
            });
        }
        (draws, culled)
    }

    fn light_draws(&self, scene: &Scene, owner: CameraBundleId, slot: FrameSlot) -> Vec<LightDraw> {
        self.lights
            .values()
            .filter_map(|bundle| {
                let light = scene.light(bundle.light)?;
                let link = bundle
                    .links
                    .get(&owner)
                    .filter(|link| link.shadows.is_valid());
                Some(LightDraw {
                    push: GpuLightPush::from_light(light, link.is_some()),
                    shadow_set: link
                        .map(|link| link.shadows.descriptor_set(slot))
                        .unwrap_or_else(|| self.unshadowed.descriptor_set(slot)),
                })
            })
            .collect()
    }

    fn submit_all(&mut self, scene: &Scene, slot: FrameSlot) -> Result<()> {
        self.command_buffers.clear();
        let (shadow_draws, _) = self.mesh_draws(scene, slot, None);

        for camera_id in self.camera_order() {
            let (scene_id, owner, stage, camera_set) = {
                let bundle = self
                    .cameras
                    .get(camera_id)
                    .ok_or_else(|| RenderError::ResourceNotFound(format!("{camera_id}")))?;
                (
                    bundle.camera,
                    bundle.shadow_owner,
                    bundle.stage.clone(),
                    bundle.binding.set(slot),
                )
            };
            let camera = scene
                .camera(scene_id)
                .ok_or_else(|| RenderError::ResourceNotFound(format!("{scene_id} left the scene")))?;

            if owner == camera_id {
                for light_id in self.lights.ids() {
                    let Some(bundle) = self.lights.get_mut(light_id) else {
                        continue;
                    };
                    let stage = bundle.stage.clone();
                    let Some(link) = bundle.links.get_mut(&camera_id) else {
                        continue;
                    };
                    if !link.shadows.is_valid() {
                        continue;
                    }
                    let frame = ShadowFrame {
                        slot,
                        framebuffers: link.shadows.framebuffers().to_vec(),
                        extent: link.shadows.extent(),
                        light_space: link
                            .shadows
                            .cascades()
                            .iter()
                            .map(|view| view.light_space)
                            .collect(),
                        draws: shadow_draws.clone(),
                    };
                    let command_buffer = link
                        .worker
                        .submit(Box::new(move |encoder| stage.record(encoder, &frame)))?;
                    self.command_buffers.push(command_buffer);
                    self.submitted.push(WorkerRef::Shadow(light_id, camera_id));
                    self.stats.shadow_jobs += 1;
                }
            }

            let (draws, culled) = self.mesh_draws(scene, slot, Some(&camera.frustum()));
            self.stats.draws_culled += culled;
            let draw_count = draws.len();
            let frame = CameraFrame {
                slot,
                camera_set,
                draws,
                lights: self.light_draws(scene, owner, slot),
                unshadowed_set: self.unshadowed.descriptor_set(slot),
            };
            let bundle = self
                .cameras
                .get_mut(camera_id)
                .ok_or_else(|| RenderError::ResourceNotFound(format!("{camera_id}")))?;
            let command_buffer = bundle
                .worker
                .submit(Box::new(move |encoder| stage.read().record(encoder, &frame)))?;
            self.command_buffers.push(command_buffer);
            self.submitted.push(WorkerRef::Camera(camera_id));
            self.stats.camera_jobs += 1;
            log::trace!("Submitted {scene_id} ({draw_count} draws, {culled} culled)");
        }
        Ok(())
    }

    fn join_submitted(&mut self) {
        for worker in std::mem::take(&mut self.submitted) {
            let result = match worker {
                WorkerRef::Shadow(light, camera) => self
                    .lights
                    .get_mut(light)
                    .and_then(|bundle| bundle.links.get_mut(&camera))
                    .map(|link| link.worker.wait()),
                WorkerRef::Camera(camera) => {
                    self.cameras.get_mut(camera).map(|bundle| bundle.worker.wait())
                }
            };
            if let Some(Err(err)) = result {
                log::warn!("Discarded job {worker:?} failed: {err}");
            }
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if self.phase == FramePhase::Recording {
            self.join_submitted();
        }
        if let Err(err) = self.ctx.device.wait_idle() {
            log::warn!("wait_idle failed during teardown: {err}");
        }
        log::info!("FrameScheduler destroyed after {} frames", self.counter.frame());
    }
}
