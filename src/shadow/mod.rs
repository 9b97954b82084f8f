//! Shadow frustum computation and the per-(light, camera) shadow map resources.

pub mod cascade;
pub mod shadows;

pub use cascade::{
    bounding_sphere, light_space_transform, point_light_views, CascadeInput,
    CascadeShadowComputer, CascadeSphere, ShadowView,
};
pub use shadows::{GpuShadowData, ShadowKind, Shadows, SHADOW_MAP_FORMAT};
