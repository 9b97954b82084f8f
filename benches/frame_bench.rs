use ash::vk;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use frame_orchestrator::gpu::{BufferHandle, HeadlessDevice, ShaderModuleHandle};
use frame_orchestrator::prelude::*;
use frame_orchestrator::shadow::CascadeInput;
use std::hint::black_box;
use std::sync::Arc;

fn camera() -> Camera {
    Camera::perspective(
        1.0,
        vk::Extent2D {
            width: 1280,
            height: 720,
        },
        0.1,
        300.0,
    )
    .look_at(Vec3::new(0.0, 8.0, 20.0), Vec3::ZERO, Vec3::Y)
}

fn prepare(cameras: usize, mesh_count: usize) -> (Scene, FrameScheduler) {
    let mut scene = Scene::new();
    let device = Arc::new(HeadlessDevice::new());
    let mut config = RendererConfig::performance();
    config.descriptors = DescriptorPoolConfig::for_scene(cameras as u32, 1, mesh_count as u32);
    let mut frames = FrameScheduler::new(
        device,
        config,
        ShaderCatalog::with_module_for_all_passes(ShaderModuleHandle(1)),
    )
    .expect("scheduler");

    for _ in 0..cameras {
        let id = scene.add_camera(camera());
        frames.add_camera(&scene, id).expect("camera");
    }
    let sun = scene.add_light(Light::directional(Vec3::new(0.3, -1.0, 0.2)));
    frames.add_light(&scene, sun).expect("light");
    for i in 0..mesh_count {
        let x = (i % 32) as f32 * 2.0 - 32.0;
        let z = (i / 32) as f32 * -2.0;
        let mesh = Mesh::new(
            BufferHandle(1),
            BufferHandle(2),
            36,
            BoundingSphere {
                center: Vec3::ZERO,
                radius: 0.9,
            },
        )
        .with_transform(Mat4::from_translation(Vec3::new(x, 0.0, z)));
        let id = scene.add_mesh(mesh);
        frames.add_mesh(&scene, id).expect("mesh");
    }
    (scene, frames)
}

fn bench_cascades(c: &mut Criterion) {
    let computer = CascadeShadowComputer::default();
    let input = CascadeInput::from_camera(&camera());
    c.bench_function("cascade_compute", |b| {
        b.iter(|| computer.compute(black_box(&input), black_box(Vec3::new(0.3, -1.0, 0.2))))
    });
}

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");
    for &meshes in &[64usize, 512, 2048] {
        group.bench_with_input(BenchmarkId::new("one_camera", meshes), &meshes, |b, &meshes| {
            let (scene, mut frames) = prepare(1, meshes);
            b.iter(|| {
                frames.update(&scene).expect("update");
                frames.record(&scene).expect("record");
                black_box(frames.wait_record().expect("wait"));
            })
        });
        group.bench_with_input(BenchmarkId::new("four_cameras", meshes), &meshes, |b, &meshes| {
            let (scene, mut frames) = prepare(4, meshes);
            b.iter(|| {
                frames.update(&scene).expect("update");
                frames.record(&scene).expect("record");
                black_box(frames.wait_record().expect("wait"));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cascades, bench_frame);
criterion_main!(benches);
