use ash::vk;
use frame_orchestrator::config::FRAMES_IN_FLIGHT;
use frame_orchestrator::frame::{FrameCounter, FrameSlot, RemovalQueue};
use frame_orchestrator::gpu::{
    BufferHandle, Command, DescriptorResource, DescriptorSetHandle, HeadlessDevice,
    ShaderModuleHandle,
};
use frame_orchestrator::prelude::*;
use std::sync::Arc;

#[test]
fn counter_wraps_after_frames_in_flight() {
    let mut counter = FrameCounter::new();
    assert_eq!(counter.current().index(), FRAMES_IN_FLIGHT - 1);
    let slots: Vec<usize> = (0..FRAMES_IN_FLIGHT * 2)
        .map(|_| counter.advance().index())
        .collect();
    assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
    assert_eq!(counter.frame(), (FRAMES_IN_FLIGHT * 2) as u64);
    assert!(FrameSlot::new(FRAMES_IN_FLIGHT).is_none());
}

#[test]
fn removals_queued_while_draining_wait_a_frame() {
    let queue = RemovalQueue::new("test");
    queue.push(1u32);
    queue.push(2);

    let mut removed = Vec::new();
    let drained = queue.drain_pending(|key| {
        removed.push(key);
        if key == 1 {
            queue.push(10);
        }
    });
    assert_eq!(drained, 2);
    assert_eq!(removed, vec![1, 2]);
    assert_eq!(queue.len(), 1);

    queue.drain_pending(|key| removed.push(key));
    assert_eq!(removed, vec![1, 2, 10]);
    assert!(queue.is_empty());
}

fn camera_set(device: &HeadlessDevice, frames: &FrameScheduler) -> DescriptorSetHandle {
    let buffers = frames.command_buffers().unwrap();
    device
        .commands(buffers[0])
        .into_iter()
        .find_map(|command| match command {
            Command::BindDescriptorSets {
                first_set: 0, sets, ..
            } => sets.first().copied(),
            _ => None,
        })
        .expect("camera set bound")
}

fn uniform_buffer(device: &HeadlessDevice, set: DescriptorSetHandle) -> BufferHandle {
    device
        .descriptor_writes(set)
        .into_iter()
        .find_map(|write| match write.resource {
            DescriptorResource::UniformBuffer { buffer, .. } => Some(buffer),
            _ => None,
        })
        .expect("uniform write")
}

fn view_x_translation(device: &HeadlessDevice, buffer: BufferHandle) -> f32 {
    let bytes = device.buffer_contents(buffer).unwrap();
    let view: [f32; 16] = bytemuck::pod_read_unaligned(&bytes[..64]);
    view[12]
}

#[test]
fn camera_uniforms_stay_untouched_while_in_flight() {
    let device = Arc::new(HeadlessDevice::new());
    let mut scene = Scene::new();
    let cam = scene.add_camera(Camera::perspective(
        1.0,
        vk::Extent2D {
            width: 32,
            height: 32,
        },
        0.1,
        50.0,
    ));
    let mut frames = FrameScheduler::new(
        device.clone(),
        RendererConfig::default(),
        ShaderCatalog::with_module_for_all_passes(ShaderModuleHandle(1)),
    )
    .unwrap();
    frames.add_camera(&scene, cam).unwrap();

    let mut history = Vec::new();
    for frame in 0..(FRAMES_IN_FLIGHT * 2) {
        scene.camera_mut(cam).unwrap().view = Mat4::from_translation(Vec3::X * frame as f32);
        frames.update(&scene).unwrap();
        frames.record(&scene).unwrap();
        frames.wait_record().unwrap();

        let set = camera_set(&device, &frames);
        let buffer = uniform_buffer(&device, set);
        history.push((set, buffer));

        // Every frame still in flight sees the value it was recorded with.
        let in_flight = history.len().min(FRAMES_IN_FLIGHT);
        for (age, (_, buffer)) in history.iter().rev().take(in_flight).enumerate() {
            let expected = (frame - age) as f32;
            assert_eq!(view_x_translation(&device, *buffer), expected);
        }
    }

    for (frame, (set, _)) in history.iter().enumerate() {
        let same_slot = history[frame % FRAMES_IN_FLIGHT].0;
        assert_eq!(*set, same_slot);
    }
    let distinct: std::collections::HashSet<_> = history.iter().map(|(set, _)| *set).collect();
    assert_eq!(distinct.len(), FRAMES_IN_FLIGHT);
}
