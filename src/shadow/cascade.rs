//! Cascaded shadow map frustums for directional lights, plus the cube-face views
//! used by point lights.
//!
//! # Cascades
//! - split depths blend a logarithmic and a uniform split with `lambda`
//! - each slice of the camera frustum is bounded by a sphere whose radius is
//!   rounded up to a fixed granularity, which keeps texel snapping stable
//! - the light looks at the sphere center from `radius` away along `-direction`
//!   with an orthographic box that fits the sphere exactly

use glam::{Mat4, Vec3, Vec4};

use crate::config::{
    CASCADE_COUNT, CASCADE_RADIUS_GRANULARITY, CUBE_FACES, DEFAULT_SPLIT_LAMBDA,
    MIN_CASCADE_RADIUS,
};
use crate::scene::Camera;

/// One rendered shadow view: a cascade, or a cube face for point lights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowView {
    /// Far end of the cascade in view depth; the light range for cube faces.
    pub split_depth: f32,
    pub light_space: Mat4,
}

/// Camera inputs the cascade fit depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeInput {
    pub near: f32,
    pub far: f32,
    pub inverse_view_projection: Mat4,
}

impl CascadeInput {
    pub fn from_camera(camera: &Camera) -> Self {
        Self {
            near: camera.near,
            far: camera.far,
            inverse_view_projection: camera.inverse_view_projection(),
        }
    }
}

/// Bounding sphere of one frustum slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeSphere {
    pub center: Vec3,
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeShadowComputer {
    cascade_count: usize,
    split_lambda: f32,
}

impl Default for CascadeShadowComputer {
    fn default() -> Self {
        Self::new(DEFAULT_SPLIT_LAMBDA)
    }
}

impl CascadeShadowComputer {
    pub fn new(split_lambda: f32) -> Self {
        Self {
            cascade_count: CASCADE_COUNT,
            split_lambda: split_lambda.clamp(0.0, 1.0),
        }
    }

    pub fn cascade_count(&self) -> usize {
        self.cascade_count
    }

    pub fn split_lambda(&self) -> f32 {
        self.split_lambda
    }

    /// Normalized split positions in `(0, 1]`, one per cascade.
    pub fn split_fractions(&self, near: f32, far: f32) -> Vec<f32> {
        let count = self.cascade_count;
        let range = far - near;
        if !(range > f32::EPSILON) {
            return (1..=count).map(|i| i as f32 / count as f32).collect();
        }
        // Logarithmic splits need a positive near plane.
        let lambda = if near > 0.0 { self.split_lambda } else { 0.0 };

        (1..=count)
            .map(|i| {
                let p = i as f32 / count as f32;
                let log_split = if lambda > 0.0 {
                    near * (far / near).powf(p)
                } else {
                    0.0
                };
                let uniform_split = near + range * p;
                let depth = lambda * (log_split - uniform_split) + uniform_split;
                ((depth - near) / range).clamp(0.0, 1.0)
            })
            .collect()
    }

    /// Split depths in view space, strictly increasing within `[near, far]`.
    pub fn split_depths(&self, near: f32, far: f32) -> Vec<f32> {
        self.split_fractions(near, far)
            .into_iter()
            .map(|fraction| near + fraction * (far - near))
            .collect()
    }

    /// Fits every cascade for a directional light travelling along `direction`.
    pub fn compute(&self, input: &CascadeInput, direction: Vec3) -> Vec<ShadowView> {
        let frustum = frustum_corners(&input.inverse_view_projection);
        let direction = direction.normalize_or(Vec3::NEG_Y);

        let mut previous = 0.0;
        self.split_fractions(input.near, input.far)
            .into_iter()
            .map(|fraction| {
                let corners = slice_corners(&frustum, previous, fraction);
                previous = fraction;
                let sphere = bounding_sphere(&corners);
                ShadowView {
                    split_depth: input.near + fraction * (input.far - input.near),
                    light_space: light_space_transform(&sphere, direction),
                }
            })
            .collect()
    }
}

/// World-space corners of the whole frustum: near quad then far quad.
fn frustum_corners(inverse_view_projection: &Mat4) -> [Vec3; 8] {
    let mut corners = [Vec3::ZERO; 8];
    let ndc = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    for (layer, z) in [0.0f32, 1.0].into_iter().enumerate() {
        for (i, (x, y)) in ndc.iter().enumerate() {
            let world = *inverse_view_projection * Vec4::new(*x, *y, z, 1.0);
            corners[layer * 4 + i] = world.truncate() / world.w;
        }
    }
    corners
}

/// Corners of the slice between two normalized split positions.
fn slice_corners(frustum: &[Vec3; 8], from: f32, to: f32) -> [Vec3; 8] {
    let mut corners = [Vec3::ZERO; 8];
    for i in 0..4 {
        let ray = frustum[i + 4] - frustum[i];
        corners[i] = frustum[i] + ray * from;
        corners[i + 4] = frustum[i] + ray * to;
    }
    corners
}

/// Sphere around `corners` with its radius snapped up to the cascade granularity.
///
/// Degenerate input (collapsed or non-finite corners) clamps to
/// [`MIN_CASCADE_RADIUS`] instead of propagating NaNs.
pub fn bounding_sphere(corners: &[Vec3; 8]) -> CascadeSphere {
    let mut center = corners.iter().copied().sum::<Vec3>() / 8.0;
    if !center.is_finite() {
        log::warn!("Cascade corners are not finite, centering at origin");
        center = Vec3::ZERO;
    }
    let radius = corners
        .iter()
        .map(|corner| (*corner - center).length())
        .fold(0.0f32, f32::max);
    let snapped = (radius * CASCADE_RADIUS_GRANULARITY).ceil() / CASCADE_RADIUS_GRANULARITY;

    let radius = if snapped.is_finite() && snapped >= MIN_CASCADE_RADIUS {
        snapped
    } else {
        log::warn!("Degenerate cascade radius {radius}, clamping to {MIN_CASCADE_RADIUS}");
        MIN_CASCADE_RADIUS
    };
    CascadeSphere { center, radius }
}

/// `ortho * view` for a light looking at `sphere` along `direction`.
pub fn light_space_transform(sphere: &CascadeSphere, direction: Vec3) -> Mat4 {
    let radius = sphere.radius;
    let up = if direction.dot(Vec3::Y).abs() > 0.99 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let eye = sphere.center - direction * radius;
    let view = Mat4::look_at_rh(eye, sphere.center, up);
    let projection = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, radius * 2.0);
    projection * view
}

/// Six 90° views from a point light, in +X, -X, +Y, -Y, +Z, -Z order.
pub fn point_light_views(position: Vec3, range: f32, near: f32) -> Vec<ShadowView> {
    let far = range.max(near + MIN_CASCADE_RADIUS);
    let projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, near, far);
    let faces: [(Vec3, Vec3); CUBE_FACES] = [
        (Vec3::X, Vec3::NEG_Y),
        (Vec3::NEG_X, Vec3::NEG_Y),
        (Vec3::Y, Vec3::Z),
        (Vec3::NEG_Y, Vec3::NEG_Z),
        (Vec3::Z, Vec3::NEG_Y),
        (Vec3::NEG_Z, Vec3::NEG_Y),
    ];
    faces
        .iter()
        .map(|(forward, up)| ShadowView {
            split_depth: far,
            light_space: projection * Mat4::look_at_rh(position, position + *forward, *up),
        })
        .collect()
}
