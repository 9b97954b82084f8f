use glam::{Mat4, Vec3, Vec4};

use crate::gpu::BufferHandle;

/// Bounding sphere in mesh-local space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

/// Per-mesh material parameters uploaded into the mesh's ring slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialParams {
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub emissive: f32,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            base_color: Vec4::ONE,
            metallic: 0.0,
            roughness: 0.5,
            emissive: 0.0,
        }
    }
}

/// Already-uploaded geometry plus the parameters that feed its uniforms.
///
/// Every mutation bumps `revision`, which is how the orchestrator notices it must
/// re-upload the mesh uniforms.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub bounds: BoundingSphere,
    pub casts_shadows: bool,
    transform: Mat4,
    material: MaterialParams,
    revision: u64,
}

impl Mesh {
    pub fn new(
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
        index_count: u32,
        bounds: BoundingSphere,
    ) -> Self {
        Self {
            vertex_buffer,
            index_buffer,
            index_count,
            bounds,
            casts_shadows: true,
            transform: Mat4::IDENTITY,
            material: MaterialParams::default(),
            revision: 0,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.set_transform(transform);
        self
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
        self.revision += 1;
    }

    pub fn material(&self) -> &MaterialParams {
        &self.material
    }

    pub fn set_material(&mut self, material: MaterialParams) {
        self.material = material;
        self.revision += 1;
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn world_bounds(&self) -> BoundingSphere {
        let (scale, _, _) = self.transform.to_scale_rotation_translation();
        BoundingSphere {
            center: self.transform.transform_point3(self.bounds.center),
            radius: self.bounds.radius * scale.abs().max_element(),
        }
    }

    /// Meshes without indices are skipped at record time.
    pub fn is_drawable(&self) -> bool {
        self.index_count > 0 && !self.vertex_buffer.is_null() && !self.index_buffer.is_null()
    }
}
