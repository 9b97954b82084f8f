use ash::vk;
use glam::{Mat4, Vec3, Vec4};

use super::CameraId;
use crate::config::RendererKind;

/// View camera as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
    pub near: f32,
    pub far: f32,
    pub extent: vk::Extent2D,
    pub polygon_mode: vk::PolygonMode,
    /// Camera whose shadow maps this one reuses (e.g. the other eye of a stereo pair).
    pub shadow_fallback: Option<CameraId>,
    /// Stage flavour; `None` picks the configured default when the camera is registered.
    pub renderer: Option<RendererKind>,
}

impl Camera {
    /// Right-handed perspective camera with a [0, 1] depth range.
    pub fn perspective(fov_y_radians: f32, extent: vk::Extent2D, near: f32, far: f32) -> Self {
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::perspective_rh(fov_y_radians, aspect, near, far),
            near,
            far,
            extent,
            polygon_mode: vk::PolygonMode::FILL,
            shadow_fallback: None,
            renderer: None,
        }
    }

    pub fn with_renderer(mut self, renderer: RendererKind) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_shadow_fallback(mut self, fallback: CameraId) -> Self {
        self.shadow_fallback = Some(fallback);
        self
    }

    pub fn look_at(mut self, eye: Vec3, target: Vec3, up: Vec3) -> Self {
        self.view = Mat4::look_at_rh(eye, target, up);
        self
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    pub fn inverse_view_projection(&self) -> Mat4 {
        self.view_projection().inverse()
    }

    pub fn position(&self) -> Vec3 {
        self.view.inverse().w_axis.truncate()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection())
    }
}

/// Six inward-facing planes (`xyz` normal, `w` distance), in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extracts planes from a view-projection with a [0, 1] clip depth.
    pub fn from_view_projection(view_projection: Mat4) -> Self {
        let r0 = view_projection.row(0);
        let r1 = view_projection.row(1);
        let r2 = view_projection.row(2);
        let r3 = view_projection.row(3);
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|plane| {
            let length = plane.truncate().length();
            if length > f32::EPSILON {
                plane / length
            } else {
                plane
            }
        });
        Self { planes }
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> Camera {
        Camera::perspective(
            60f32.to_radians(),
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
            0.1,
            100.0,
        )
        .look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y)
    }

    #[test]
    fn position_recovers_eye() {
        let position = camera().position();
        assert_relative_eq!(position.z, 5.0, epsilon = 1e-4);
        assert_relative_eq!(position.x, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn frustum_culls_behind_camera() {
        let frustum = camera().frustum();
        assert!(frustum.intersects_sphere(Vec3::ZERO, 1.0));
        assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, 20.0), 1.0));
        assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, -200.0), 1.0));
    }
}
