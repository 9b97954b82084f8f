use approx::assert_relative_eq;
use frame_orchestrator::config::{CASCADE_COUNT, CASCADE_RADIUS_GRANULARITY};
use frame_orchestrator::shadow::{
    bounding_sphere, light_space_transform, point_light_views, CascadeInput,
    CascadeShadowComputer, CascadeSphere,
};
use frame_orchestrator::{Mat4, Vec3, Vec4};

fn camera_input(near: f32, far: f32) -> CascadeInput {
    let view = Mat4::look_at_rh(Vec3::new(3.0, 4.0, 12.0), Vec3::ZERO, Vec3::Y);
    let projection = Mat4::perspective_rh(60f32.to_radians(), 4.0 / 3.0, near, far);
    CascadeInput {
        near,
        far,
        inverse_view_projection: (projection * view).inverse(),
    }
}

#[test]
fn splits_increase_and_end_at_far() {
    for lambda in [0.0, 0.5, 0.95, 1.0] {
        let computer = CascadeShadowComputer::new(lambda);
        let depths = computer.split_depths(0.1, 500.0);
        assert_eq!(depths.len(), CASCADE_COUNT);
        for pair in depths.windows(2) {
            assert!(pair[0] < pair[1], "lambda {lambda}: {depths:?}");
        }
        assert!(depths[0] > 0.1);
        assert_relative_eq!(*depths.last().unwrap(), 500.0, max_relative = 1e-4);
    }
}

#[test]
fn higher_lambda_tightens_near_cascades() {
    let uniform = CascadeShadowComputer::new(0.0).split_depths(0.5, 200.0);
    let log = CascadeShadowComputer::new(1.0).split_depths(0.5, 200.0);
    assert!(log[0] < uniform[0]);
    assert_relative_eq!(uniform[0], 0.5 + 199.5 / CASCADE_COUNT as f32, epsilon = 1e-3);
    assert_relative_eq!(log[0], 0.5 * 400f32.powf(0.25), epsilon = 1e-3);
}

#[test]
fn out_of_range_lambda_is_clamped() {
    assert_eq!(CascadeShadowComputer::new(3.0).split_lambda(), 1.0);
    assert_eq!(CascadeShadowComputer::new(-1.0).split_lambda(), 0.0);
}

#[test]
fn every_cascade_encloses_its_slice_center() {
    let input = camera_input(0.1, 80.0);
    let computer = CascadeShadowComputer::default();
    let views = computer.compute(&input, Vec3::new(-0.4, -1.0, 0.3));
    assert_eq!(views.len(), CASCADE_COUNT);

    let mut near_depth = input.near;
    for view in &views {
        // Point on the view axis halfway through the slice.
        let eye = Vec3::new(3.0, 4.0, 12.0);
        let forward = (Vec3::ZERO - eye).normalize();
        let mid = eye + forward * (near_depth + view.split_depth) * 0.5;
        let clip = view.light_space * Vec4::new(mid.x, mid.y, mid.z, 1.0);
        assert!(clip.x.abs() <= 1.0 && clip.y.abs() <= 1.0);
        assert!((0.0..=1.0).contains(&clip.z));
        near_depth = view.split_depth;
    }
}

#[test]
fn radii_snap_to_granularity() {
    let corners = [
        Vec3::new(-1.01, -1.0, -1.0),
        Vec3::new(1.0, -1.0, -1.0),
        Vec3::new(1.0, 1.0, -1.0),
        Vec3::new(-1.0, 1.0, -1.0),
        Vec3::new(-1.0, -1.0, 1.0),
        Vec3::new(1.0, -1.0, 1.0),
        Vec3::new(1.0, 1.0, 1.0),
        Vec3::new(-1.0, 1.0, 1.0),
    ];
    let sphere = bounding_sphere(&corners);
    let steps = sphere.radius * CASCADE_RADIUS_GRANULARITY;
    assert_relative_eq!(steps, steps.round(), epsilon = 1e-4);
    for corner in corners {
        assert!((corner - sphere.center).length() <= sphere.radius + 1e-5);
    }
}

#[test]
fn light_transform_handles_vertical_light() {
    let sphere = CascadeSphere {
        center: Vec3::new(2.0, 0.0, -3.0),
        radius: 4.0,
    };
    let transform = light_space_transform(&sphere, Vec3::NEG_Y);
    assert!(transform.is_finite());
    let center = transform * sphere.center.extend(1.0);
    assert_relative_eq!(center.x, 0.0, epsilon = 1e-5);
    assert_relative_eq!(center.y, 0.0, epsilon = 1e-5);
    assert_relative_eq!(center.z, 0.5, epsilon = 1e-5);
}

#[test]
fn point_faces_cover_all_axes() {
    let position = Vec3::new(1.0, 2.0, 3.0);
    let views = point_light_views(position, 10.0, 0.05);
    assert_eq!(views.len(), 6);
    let axes = [
        Vec3::X,
        Vec3::NEG_X,
        Vec3::Y,
        Vec3::NEG_Y,
        Vec3::Z,
        Vec3::NEG_Z,
    ];
    for (view, axis) in views.iter().zip(axes) {
        let target = position + axis * 5.0;
        let clip = view.light_space * target.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert_relative_eq!(ndc.x, 0.0, epsilon = 1e-4);
        assert_relative_eq!(ndc.y, 0.0, epsilon = 1e-4);
        assert!((0.0..1.0).contains(&ndc.z));
        assert_relative_eq!(view.split_depth, 10.0);
    }
}
