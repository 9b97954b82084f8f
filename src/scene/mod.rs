//! Plain scene data consumed (read-only) by the orchestrator.
//!
//! The scene owns cameras, lights and meshes in generational arenas; the orchestrator
//! keeps its own GPU-side bundles keyed by the same ids.

pub mod camera;
pub mod light;
pub mod mesh;

pub use camera::{Camera, Frustum};
pub use light::{Light, LightKind};
pub use mesh::{BoundingSphere, MaterialParams, Mesh};

use crate::utils::Arena;

crate::arena_key!(
    /// Stable camera id.
    CameraId
);
crate::arena_key!(
    /// Stable light id.
    LightId
);
crate::arena_key!(
    /// Stable mesh id.
    MeshId
);

#[derive(Default)]
pub struct Scene {
    cameras: Arena<CameraId, Camera>,
    lights: Arena<LightId, Light>,
    meshes: Arena<MeshId, Mesh>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_camera(&mut self, camera: Camera) -> CameraId {
        self.cameras.insert(camera)
    }

    pub fn add_light(&mut self, light: Light) -> LightId {
        self.lights.insert(light)
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshId {
        self.meshes.insert(mesh)
    }

    pub fn camera(&self, id: CameraId) -> Option<&Camera> {
        self.cameras.get(id)
    }

    pub fn camera_mut(&mut self, id: CameraId) -> Option<&mut Camera> {
        self.cameras.get_mut(id)
    }

    pub fn light(&self, id: LightId) -> Option<&Light> {
        self.lights.get(id)
    }

    pub fn light_mut(&mut self, id: LightId) -> Option<&mut Light> {
        self.lights.get_mut(id)
    }

    pub fn mesh(&self, id: MeshId) -> Option<&Mesh> {
        self.meshes.get(id)
    }

    pub fn mesh_mut(&mut self, id: MeshId) -> Option<&mut Mesh> {
        self.meshes.get_mut(id)
    }

    pub fn remove_camera(&mut self, id: CameraId) -> Option<Camera> {
        self.cameras.remove(id)
    }

    pub fn remove_light(&mut self, id: LightId) -> Option<Light> {
        self.lights.remove(id)
    }

    pub fn remove_mesh(&mut self, id: MeshId) -> Option<Mesh> {
        self.meshes.remove(id)
    }

    pub fn cameras(&self) -> impl Iterator<Item = (CameraId, &Camera)> + '_ {
        self.cameras.iter()
    }

    pub fn lights(&self) -> impl Iterator<Item = (LightId, &Light)> + '_ {
        self.lights.iter()
    }

    pub fn meshes(&self) -> impl Iterator<Item = (MeshId, &Mesh)> + '_ {
        self.meshes.iter()
    }
}
