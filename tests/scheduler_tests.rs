use ash::vk;
use frame_orchestrator::gpu::{
    BufferHandle, Command, CommandBufferHandle, DescriptorResource, DescriptorSetHandle,
    HeadlessDevice, ShaderModuleHandle,
};
use frame_orchestrator::prelude::*;
use std::sync::Arc;

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

fn camera() -> Camera {
    Camera::perspective(1.0, extent(320, 240), 0.1, 100.0)
}

fn cube_at(z: f32) -> Mesh {
    Mesh::new(
        BufferHandle(1),
        BufferHandle(2),
        36,
        BoundingSphere {
            center: Vec3::ZERO,
            radius: 1.0,
        },
    )
    .with_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, z)))
}

fn new_scheduler(device: &Arc<HeadlessDevice>) -> FrameScheduler {
    FrameScheduler::new(
        device.clone(),
        RendererConfig::default(),
        ShaderCatalog::with_module_for_all_passes(ShaderModuleHandle(7)),
    )
    .expect("headless scheduler")
}

fn run_frame(frames: &mut FrameScheduler, scene: &Scene) -> FrameStats {
    frames.update(scene).expect("update");
    frames.record(scene).expect("record");
    frames.wait_record().expect("wait_record")
}

fn render_passes(device: &HeadlessDevice, command_buffer: CommandBufferHandle) -> usize {
    device
        .commands(command_buffer)
        .iter()
        .filter(|command| matches!(command, Command::BeginRenderPass { .. }))
        .count()
}

/// The floats behind the uniform buffer `set` was written with.
fn uniform_floats(device: &HeadlessDevice, set: DescriptorSetHandle) -> Vec<f32> {
    let buffer = device
        .descriptor_writes(set)
        .into_iter()
        .find_map(|write| match write.resource {
            DescriptorResource::UniformBuffer { buffer, .. } => Some(buffer),
            _ => None,
        })
        .expect("uniform write");
    let bytes = device.buffer_contents(buffer).expect("buffer");
    bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect()
}

/// Set bound right before the first vertex buffer, i.e. the first mesh's set.
fn first_mesh_set(
    device: &HeadlessDevice,
    command_buffer: CommandBufferHandle,
) -> DescriptorSetHandle {
    let commands = device.commands(command_buffer);
    let vertex = commands
        .iter()
        .position(|command| matches!(command, Command::BindVertexBuffer(_)))
        .expect("mesh drawn");
    commands[..vertex]
        .iter()
        .rev()
        .find_map(|command| match command {
            Command::BindDescriptorSets { sets, .. } => sets.first().copied(),
            _ => None,
        })
        .expect("mesh set bound")
}

fn camera_set(device: &HeadlessDevice, command_buffer: CommandBufferHandle) -> DescriptorSetHandle {
    device
        .commands(command_buffer)
        .into_iter()
        .find_map(|command| match command {
            Command::BindDescriptorSets {
                first_set: 0, sets, ..
            } => sets.first().copied(),
            _ => None,
        })
        .expect("camera set bound")
}

#[test]
fn single_camera_without_lights_records_one_buffer() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let mesh = scene.add_mesh(cube_at(-5.0));

    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();
    frames.add_mesh(&scene, mesh).unwrap();

    let stats = run_frame(&mut frames, &scene);
    assert_eq!(frames.worker_count(), 1);
    assert_eq!(frames.command_buffers().unwrap().len(), 1);
    assert_eq!(stats.camera_jobs, 1);
    assert_eq!(stats.shadow_jobs, 0);
    assert_eq!(stats.draws_recorded, 1);
}

#[test]
fn worker_count_scales_with_cameras_and_shadowed_lights() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cameras: Vec<_> = (0..3).map(|_| scene.add_camera(camera())).collect();
    let lights = [
        scene.add_light(Light::directional(Vec3::new(0.2, -1.0, 0.1))),
        scene.add_light(Light::point(Vec3::new(0.0, 3.0, -4.0), 12.0)),
    ];
    scene.add_light(Light::point(Vec3::ZERO, 4.0).with_shadows(false));

    let mut frames = new_scheduler(&device);
    for cam in &cameras {
        frames.add_camera(&scene, *cam).unwrap();
    }
    for light in scene.lights().map(|(id, _)| id).collect::<Vec<_>>() {
        frames.add_light(&scene, light).unwrap();
    }
    frames.init(&scene).unwrap();

    assert_eq!(frames.worker_count(), 3 * (1 + lights.len()));
    assert_eq!(frames.shadows_count(), 3 * lights.len());

    let stats = run_frame(&mut frames, &scene);
    assert_eq!(stats.total_jobs() as usize, frames.worker_count());
    assert_eq!(
        frames.command_buffers().unwrap().len(),
        frames.worker_count()
    );
}

#[test]
fn frame_slots_cycle_through_the_ring() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();

    let slots: Vec<usize> = (0..7)
        .map(|_| run_frame(&mut frames, &scene).slot)
        .collect();
    assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(frames.stats().frame, 7);
}

#[test]
fn phases_are_enforced() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();

    assert!(matches!(
        frames.record(&scene),
        Err(RenderError::FrameOutOfOrder(_))
    ));
    assert!(matches!(
        frames.wait_record(),
        Err(RenderError::WorkerIdle(_))
    ));

    frames.update(&scene).unwrap();
    frames.record(&scene).unwrap();
    assert_eq!(frames.phase(), FramePhase::Recording);
    assert!(matches!(
        frames.record(&scene),
        Err(RenderError::FrameOutOfOrder(_))
    ));
    assert!(frames.update(&scene).is_err());
    assert!(frames.command_buffers().is_err());
    assert!(frames.render_image(cam).is_err());
    assert!(frames.remove_camera(&scene, cam).is_err());

    frames.wait_record().unwrap();
    assert_eq!(frames.phase(), FramePhase::Recorded);
    assert!(matches!(
        frames.wait_record(),
        Err(RenderError::WorkerIdle(_))
    ));
    assert!(frames.command_buffers().is_ok());
}

#[test]
fn shadow_buffers_precede_their_camera() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let directional = scene.add_light(Light::directional(Vec3::new(0.0, -1.0, -0.3)));
    let point = scene.add_light(Light::point(Vec3::new(0.0, 2.0, -5.0), 10.0));
    scene.add_mesh(cube_at(-5.0));

    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();
    frames.add_light(&scene, directional).unwrap();
    frames.add_light(&scene, point).unwrap();
    let mesh = scene.meshes().next().unwrap().0;
    frames.add_mesh(&scene, mesh).unwrap();

    run_frame(&mut frames, &scene);
    let buffers = frames.command_buffers().unwrap().to_vec();
    assert_eq!(buffers.len(), 3);

    // One pass per cascade, one per cube face, then the camera's single pass.
    assert_eq!(render_passes(&device, buffers[0]), 4);
    assert_eq!(render_passes(&device, buffers[1]), 6);
    assert_eq!(render_passes(&device, buffers[2]), 1);
}

#[test]
fn stereo_fallback_shares_shadow_maps() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let left = scene.add_camera(camera().look_at(Vec3::new(-0.03, 0.0, 0.0), Vec3::NEG_Z, Vec3::Y));
    let right = scene.add_camera(
        camera()
            .look_at(Vec3::new(0.03, 0.0, 0.0), Vec3::NEG_Z, Vec3::Y)
            .with_shadow_fallback(left),
    );
    let sun = scene.add_light(Light::directional(Vec3::new(0.1, -1.0, 0.2)));

    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, right).unwrap();
    frames.add_camera(&scene, left).unwrap();
    frames.add_light(&scene, sun).unwrap();
    run_frame(&mut frames, &scene);

    assert_eq!(frames.shadows_count(), 1);
    assert_eq!(frames.worker_count(), 3);
    assert_eq!(
        frames.shadow_map_image(sun, left).unwrap(),
        frames.shadow_map_image(sun, right).unwrap()
    );
    assert_eq!(frames.stats().shadow_jobs, 1);
    assert_eq!(frames.command_buffers().unwrap().len(), 3);
}

#[test]
fn removing_the_fallback_gives_dependent_its_own_shadows() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let left = scene.add_camera(camera());
    let right = scene.add_camera(camera().with_shadow_fallback(left));
    let sun = scene.add_light(Light::directional(Vec3::NEG_Y));

    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, left).unwrap();
    frames.add_camera(&scene, right).unwrap();
    frames.add_light(&scene, sun).unwrap();
    run_frame(&mut frames, &scene);
    assert_eq!(frames.shadows_count(), 1);

    frames.remove_camera(&scene, left).unwrap();
    scene.remove_camera(left);
    assert_eq!(frames.shadows_count(), 1);
    assert!(frames.shadow_map_image(sun, right).is_ok());

    let stats = run_frame(&mut frames, &scene);
    assert_eq!(stats.shadow_jobs, 1);
    assert_eq!(frames.worker_count(), 2);
}

#[test]
fn mesh_removal_is_deferred_to_next_update() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let a = scene.add_mesh(cube_at(-5.0));
    let b = scene.add_mesh(cube_at(-8.0));

    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();
    frames.add_mesh(&scene, a).unwrap();
    frames.add_mesh(&scene, b).unwrap();

    frames.update(&scene).unwrap();
    frames.record(&scene).unwrap();
    frames.remove_mesh(a).unwrap();
    assert!(matches!(
        frames.remove_mesh(a),
        Err(RenderError::InvalidConfig(_))
    ));
    assert_eq!(frames.mesh_count(), 2);
    assert_eq!(frames.pending_mesh_removals(), 1);

    let stats = frames.wait_record().unwrap();
    assert_eq!(stats.draws_recorded, 2);
    assert_eq!(frames.mesh_count(), 2);

    let stats = run_frame(&mut frames, &scene);
    assert_eq!(stats.meshes_removed, 1);
    assert_eq!(stats.draws_recorded, 1);
    assert_eq!(frames.mesh_count(), 1);
    assert!(frames.remove_mesh(a).is_err());
}

#[test]
fn mesh_added_after_update_draws_its_own_transform() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let mesh = scene.add_mesh(cube_at(-6.0));
    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();
    run_frame(&mut frames, &scene);

    frames.update(&scene).unwrap();
    frames.add_mesh(&scene, mesh).unwrap();
    frames.record(&scene).unwrap();
    assert!(matches!(
        frames.add_mesh(&scene, mesh),
        Err(RenderError::FrameOutOfOrder(_))
    ));
    let stats = frames.wait_record().unwrap();
    assert_eq!(stats.draws_recorded, 1);

    let buffers = frames.command_buffers().unwrap();
    let set = first_mesh_set(&device, *buffers.last().unwrap());
    let model = uniform_floats(&device, set);
    assert_eq!(&model[12..15], &[0.0, 0.0, -6.0]);
}

#[test]
fn camera_added_after_update_draws_its_own_view() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let first = scene.add_camera(camera());
    let second =
        scene.add_camera(camera().look_at(Vec3::new(4.0, 0.0, 0.0), Vec3::ZERO, Vec3::Y));
    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, first).unwrap();
    run_frame(&mut frames, &scene);

    frames.update(&scene).unwrap();
    frames.add_camera(&scene, second).unwrap();
    frames.record(&scene).unwrap();
    frames.wait_record().unwrap();

    let buffers = frames.command_buffers().unwrap();
    assert_eq!(buffers.len(), 2);
    let view = uniform_floats(&device, camera_set(&device, buffers[1]));
    let expected = scene.camera(second).unwrap().view.to_cols_array();
    assert_eq!(&view[..16], &expected[..]);
}

#[test]
fn failed_update_cannot_be_recorded() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();

    frames.update(&scene).unwrap();
    scene.remove_camera(cam);
    assert!(matches!(
        frames.update(&scene),
        Err(RenderError::ResourceNotFound(_))
    ));
    assert_eq!(frames.phase(), FramePhase::Idle);
    assert!(matches!(
        frames.record(&scene),
        Err(RenderError::FrameOutOfOrder(_))
    ));
}

#[test]
fn scene_sized_pool_fits_large_scenes() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cams: Vec<_> = (0..2).map(|_| scene.add_camera(camera())).collect();
    let sun = scene.add_light(Light::directional(Vec3::new(0.0, -1.0, -0.2)));
    let meshes: Vec<_> = (0..600)
        .map(|i| scene.add_mesh(cube_at(-2.0 - i as f32 * 0.1)))
        .collect();

    let mut config = RendererConfig::default();
    config.descriptors = DescriptorPoolConfig::for_scene(2, 1, 600);
    let mut frames = FrameScheduler::new(
        device.clone(),
        config,
        ShaderCatalog::with_module_for_all_passes(ShaderModuleHandle(7)),
    )
    .unwrap();
    for cam in &cams {
        frames.add_camera(&scene, *cam).unwrap();
    }
    frames.add_light(&scene, sun).unwrap();
    for mesh in &meshes {
        frames.add_mesh(&scene, *mesh).unwrap();
    }
    run_frame(&mut frames, &scene);
    assert_eq!(frames.mesh_count(), 600);
    assert_eq!(frames.worker_count(), 4);
}

#[test]
fn meshes_outside_the_frustum_are_culled() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let visible = scene.add_mesh(cube_at(-5.0));
    let behind = scene.add_mesh(cube_at(20.0));

    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();
    frames.add_mesh(&scene, visible).unwrap();
    frames.add_mesh(&scene, behind).unwrap();

    let stats = run_frame(&mut frames, &scene);
    assert_eq!(stats.draws_culled, 1);
    assert_eq!(stats.draws_recorded, 1);
}

#[test]
fn resize_rebuilds_the_camera_targets() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, cam).unwrap();
    run_frame(&mut frames, &scene);
    let before = frames.render_image(cam).unwrap();

    scene.camera_mut(cam).unwrap().extent = extent(640, 480);
    run_frame(&mut frames, &scene);
    let after = frames.render_image(cam).unwrap();
    assert_ne!(before, after);
    let desc = device.image_desc(after).unwrap();
    assert_eq!(desc.extent, extent(640, 480));
    assert!(device.image_desc(before).is_none());
}

#[test]
fn forward_and_deferred_cameras_coexist() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let deferred = scene.add_camera(camera());
    let forward = scene.add_camera(camera().with_renderer(RendererKind::Forward));
    let sun = scene.add_light(Light::directional(Vec3::NEG_Y));
    let mesh = scene.add_mesh(cube_at(-4.0));

    let mut frames = new_scheduler(&device);
    frames.add_camera(&scene, deferred).unwrap();
    frames.add_camera(&scene, forward).unwrap();
    frames.add_light(&scene, sun).unwrap();
    frames.add_mesh(&scene, mesh).unwrap();

    let stats = run_frame(&mut frames, &scene);
    assert_eq!(stats.camera_jobs, 2);
    assert_eq!(stats.shadow_jobs, 2);
    assert_ne!(
        frames.depth_render_image(deferred).unwrap(),
        frames.depth_render_image(forward).unwrap()
    );
}

#[test]
fn dropping_the_scheduler_releases_gpu_objects() {
    use frame_orchestrator::gpu::ObjectKind;

    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(camera());
    let sun = scene.add_light(Light::directional(Vec3::NEG_Y));
    {
        let mut frames = new_scheduler(&device);
        frames.add_camera(&scene, cam).unwrap();
        frames.add_light(&scene, sun).unwrap();
        run_frame(&mut frames, &scene);
        frames.update(&scene).unwrap();
        frames.record(&scene).unwrap();
    }
    for kind in [
        ObjectKind::Image,
        ObjectKind::Framebuffer,
        ObjectKind::RenderPass,
        ObjectKind::CommandPool,
        ObjectKind::Pipeline,
    ] {
        assert_eq!(device.live_objects(kind), 0, "{kind:?} leaked");
    }
}
