#![cfg(feature = "vulkan")]

use ash::vk;
use frame_orchestrator::gpu::{AshDevice, BufferDesc, GpuDevice, ImageDesc};
use frame_orchestrator::RenderError;

/// `None` on machines without a Vulkan loader or GPU.
fn device() -> Option<AshDevice> {
    match AshDevice::new() {
        Ok(device) => Some(device),
        Err(RenderError::DeviceInitFailed(reason)) => {
            eprintln!("skipping, no Vulkan device: {reason}");
            None
        }
        Err(other) => panic!("unexpected init error: {other}"),
    }
}

#[test]
fn buffers_start_zeroed_and_read_back_writes() {
    let Some(device) = device() else {
        return;
    };
    let buffer = device
        .create_buffer(&BufferDesc::uniform(64, "smoke uniforms"))
        .unwrap();
    assert_eq!(device.read_buffer(buffer, 0, 64).unwrap(), vec![0u8; 64]);

    let data: Vec<u8> = (0..16u8).collect();
    device.write_buffer(buffer, 16, &data).unwrap();
    assert_eq!(device.read_buffer(buffer, 16, 16).unwrap(), data);
    assert_eq!(device.read_buffer(buffer, 0, 16).unwrap(), vec![0u8; 16]);

    assert!(device.write_buffer(buffer, 60, &data).is_err());
    assert!(device.read_buffer(buffer, 60, 16).is_err());
    device.destroy_buffer(buffer);
    assert!(matches!(
        device.read_buffer(buffer, 0, 4),
        Err(RenderError::ResourceNotFound(_))
    ));
}

#[test]
fn layered_depth_images_are_created_and_destroyed() {
    let Some(device) = device() else {
        return;
    };
    let usage = vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED;
    if !device.supports_format(vk::Format::D32_SFLOAT, usage) {
        return;
    }
    let image = device
        .create_image(&ImageDesc {
            extent: vk::Extent2D {
                width: 256,
                height: 256,
            },
            format: vk::Format::D32_SFLOAT,
            layers: 4,
            usage,
            label: "smoke shadow map",
        })
        .unwrap();
    device.wait_idle().unwrap();
    device.destroy_image(image);
}
