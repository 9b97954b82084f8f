use ash::vk;
use frame_orchestrator::gpu::{BufferHandle, HeadlessDevice, ObjectKind, ShaderModuleHandle};
use frame_orchestrator::prelude::*;
use std::sync::Arc;

fn main() -> Result<()> {
    let device = Arc::new(HeadlessDevice::new());
    let shaders = ShaderCatalog::with_module_for_all_passes(ShaderModuleHandle(1));
    let mut frames = FrameScheduler::new(device.clone(), RendererConfig::default(), shaders)?;

    let extent = vk::Extent2D {
        width: 1280,
        height: 720,
    };
    let mut scene = Scene::new();
    let left = scene.add_camera(
        Camera::perspective(1.2, extent, 0.1, 150.0).look_at(
            Vec3::new(-0.032, 1.7, 6.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::Y,
        ),
    );
    let right = scene.add_camera(
        Camera::perspective(1.2, extent, 0.1, 150.0)
            .look_at(Vec3::new(0.032, 1.7, 6.0), Vec3::new(0.0, 1.0, 0.0), Vec3::Y)
            .with_renderer(RendererKind::Forward)
            .with_shadow_fallback(left),
    );
    let sun = scene.add_light(
        Light::directional(Vec3::new(0.4, -1.0, -0.3)).with_color(Vec3::new(1.0, 0.95, 0.9), 3.0),
    );
    let lamp = scene.add_light(Light::point(Vec3::new(2.0, 2.5, 0.0), 8.0));

    let mut meshes = Vec::new();
    for i in 0..16 {
        let position = Vec3::new((i % 4) as f32 * 2.0 - 3.0, 0.5, (i / 4) as f32 * -2.0);
        let mesh = Mesh::new(
            BufferHandle(100 + i),
            BufferHandle(200 + i),
            36,
            BoundingSphere {
                center: Vec3::ZERO,
                radius: 0.87,
            },
        )
        .with_transform(Mat4::from_translation(position));
        meshes.push(scene.add_mesh(mesh));
    }

    frames.add_camera(&scene, left)?;
    frames.add_camera(&scene, right)?;
    frames.add_light(&scene, sun)?;
    frames.add_light(&scene, lamp)?;
    for mesh in &meshes {
        frames.add_mesh(&scene, *mesh)?;
    }

    for frame in 0..6 {
        if frame == 3 {
            // Dropped mid-frame below; destroyed by the next update.
            frames.update(&scene)?;
            frames.record(&scene)?;
            frames.remove_mesh(meshes[0])?;
            scene.remove_mesh(meshes[0]);
            frames.wait_record()?;
        } else {
            if let Some(mesh) = scene.mesh_mut(meshes[1]) {
                mesh.set_transform(Mat4::from_translation(Vec3::new(frame as f32, 0.5, 0.0)));
            }
            frames.update(&scene)?;
            frames.record(&scene)?;
            frames.wait_record()?;
        }
        let batch = frames.command_buffers()?;
        println!("{} -> {} command buffers", frames.stats().format(), batch.len());
    }

    println!(
        "{} workers, {} shadow maps, sun map shared: {}",
        frames.worker_count(),
        frames.shadows_count(),
        frames.shadow_map_image(sun, left)? == frames.shadow_map_image(sun, right)?
    );
    drop(frames);
    println!(
        "live after shutdown: {} images, {} pools",
        device.live_objects(ObjectKind::Image),
        device.live_objects(ObjectKind::CommandPool)
    );
    Ok(())
}
