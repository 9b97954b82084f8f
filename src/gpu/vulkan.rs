use ash::vk::{self, Handle};
use ash::{Device, Entry, Instance};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use vk_mem::Alloc;

use super::types::*;
use super::GpuDevice;
use crate::{RenderError, Result};

struct BufferEntry {
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: u64,
}

struct ImageEntry {
    image: vk::Image,
    allocation: vk_mem::Allocation,
    format: vk::Format,
    /// One 2D view per array layer, used as framebuffer attachments.
    layer_views: Vec<vk::ImageView>,
    /// View over all layers, used for sampling.
    sample_view: vk::ImageView,
}

#[derive(Default)]
struct Resources {
    buffers: HashMap<BufferHandle, BufferEntry>,
    images: HashMap<ImageHandle, ImageEntry>,
}

/// Vulkan implementation of [`GpuDevice`] without a presentation surface.
///
/// Buffers live in host-visible memory (`write_buffer` maps them directly). Every image
/// gets one view per layer for framebuffers and one array view for sampling through a
/// single shared sampler.
pub struct AshDevice {
    _entry: Entry,
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    device: Device,
    queue: vk::Queue,
    queue_family: u32,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    sampler: vk::Sampler,
    name: String,
    features: DeviceFeatures,
    resources: Mutex<Resources>,
    queue_lock: Mutex<()>,
}

impl AshDevice {
    /// Creates an instance, picks the first GPU with a graphics queue and opens a device.
    pub fn new() -> Result<Self> {
        unsafe {
            let entry = Entry::load().map_err(|e| {
                RenderError::DeviceInitFailed(format!("Failed to load Vulkan entry: {e:?}"))
            })?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"Frame Orchestrator")
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"Frame Orchestrator")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_2);
            let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
            let instance = entry.create_instance(&create_info, None).map_err(|e| {
                RenderError::DeviceInitFailed(format!("Failed to create Vulkan instance: {e:?}"))
            })?;

            let physical_devices = instance.enumerate_physical_devices().map_err(|e| {
                RenderError::DeviceInitFailed(format!("Failed to enumerate devices: {e:?}"))
            })?;

            let selected = physical_devices.iter().find_map(|&candidate| {
                instance
                    .get_physical_device_queue_family_properties(candidate)
                    .iter()
                    .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                    .map(|family| (candidate, family as u32))
            });
            let Some((physical_device, queue_family)) = selected else {
                instance.destroy_instance(None);
                return Err(RenderError::DeviceInitFailed(
                    "No GPU found with a graphics queue".to_string(),
                ));
            };

            let properties = instance.get_physical_device_properties(physical_device);
            let name = CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned();
            let supported = instance.get_physical_device_features(physical_device);
            let features = DeviceFeatures {
                fill_mode_non_solid: supported.fill_mode_non_solid == vk::TRUE,
                depth_bias_clamp: supported.depth_bias_clamp == vk::TRUE,
            };
            log::info!("Selected GPU: {name} ({features:?})");

            let queue_priorities = [1.0f32];
            let queue_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family)
                .queue_priorities(&queue_priorities)];
            let enabled = vk::PhysicalDeviceFeatures::default()
                .fill_mode_non_solid(features.fill_mode_non_solid)
                .depth_bias_clamp(features.depth_bias_clamp);
            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_features(&enabled);
            let device = match instance.create_device(physical_device, &device_info, None) {
                Ok(device) => device,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(RenderError::DeviceInitFailed(format!(
                        "Failed to create device: {e:?}"
                    )));
                }
            };
            let queue = device.get_device_queue(queue_family, 0);

            let allocator = match vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
                &instance,
                &device,
                physical_device,
            )) {
                Ok(allocator) => allocator,
                Err(e) => {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                    return Err(RenderError::DeviceInitFailed(format!(
                        "VMA init failed: {e:?}"
                    )));
                }
            };
            log::info!("VMA allocator created");

            let sampler_info = vk::SamplerCreateInfo::default()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .max_lod(1.0);
            let sampler = device.create_sampler(&sampler_info, None)?;

            Ok(Self {
                _entry: entry,
                instance,
                physical_device,
                device,
                queue,
                queue_family,
                allocator: ManuallyDrop::new(allocator),
                sampler,
                name,
                features,
                resources: Mutex::new(Resources::default()),
                queue_lock: Mutex::new(()),
            })
        }
    }

    /// Submits command buffers to the graphics queue in the given order.
    pub fn submit(&self, command_buffers: &[CommandBufferHandle], fence: vk::Fence) -> Result<()> {
        let buffers: Vec<vk::CommandBuffer> = command_buffers
            .iter()
            .map(|cb| vk::CommandBuffer::from_raw(cb.raw()))
            .collect();
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);
        let _guard = self.queue_lock.lock();
        unsafe {
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&submit), fence)?;
        }
        Ok(())
    }

    pub fn raw_device(&self) -> &Device {
        &self.device
    }

    /// Copies `len` bytes at `offset` out of a host-visible buffer.
    pub fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut resources = self.resources.lock();
        let entry = resources
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RenderError::ResourceNotFound(format!("buffer {buffer:?}")))?;
        if offset + len as u64 > entry.size {
            return Err(RenderError::VulkanError(format!(
                "Read of {len} bytes at {offset} overflows buffer of {} bytes",
                entry.size
            )));
        }
        let mut out = vec![0u8; len];
        self.map_entry(entry, |ptr| unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), len);
        })?;
        Ok(out)
    }

    fn map_entry(&self, entry: &mut BufferEntry, access: impl FnOnce(*mut u8)) -> Result<()> {
        unsafe {
            let ptr = self.allocator.map_memory(&mut entry.allocation)?;
            access(ptr);
            self.allocator.unmap_memory(&mut entry.allocation);
        }
        Ok(())
    }

    fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
        if is_depth_format(format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    fn create_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        view_type: vk::ImageViewType,
        base_layer: u32,
        layer_count: u32,
    ) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: Self::aspect_for(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: base_layer,
                layer_count,
            });
        Ok(unsafe { self.device.create_image_view(&info, None)? })
    }
}

fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
    )
}

fn blend_state(blend: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let (enable, src, dst) = match blend {
        BlendMode::Opaque => (vk::FALSE, vk::BlendFactor::ONE, vk::BlendFactor::ZERO),
        BlendMode::Alpha => (
            vk::TRUE,
            vk::BlendFactor::SRC_ALPHA,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        ),
        BlendMode::Additive => (vk::TRUE, vk::BlendFactor::ONE, vk::BlendFactor::ONE),
    };
    vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: enable,
        src_color_blend_factor: src,
        dst_color_blend_factor: dst,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
    }
}

fn clear_value(value: &ClearValue) -> vk::ClearValue {
    match *value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::Depth(depth) => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
        },
    }
}

enum WriteInfo {
    Buffer([vk::DescriptorBufferInfo; 1]),
    Image([vk::DescriptorImageInfo; 1]),
}

impl GpuDevice for AshDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> DeviceFeatures {
        self.features
    }

    fn supports_format(&self, format: vk::Format, usage: vk::ImageUsageFlags) -> bool {
        let properties = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        let tiling = properties.optimal_tiling_features;
        let mut required = vk::FormatFeatureFlags::empty();
        if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
            required |= vk::FormatFeatureFlags::COLOR_ATTACHMENT;
        }
        if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            required |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if usage.contains(vk::ImageUsageFlags::SAMPLED) {
            required |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
        }
        !tiling.is_empty() && tiling.contains(required)
    }

    fn wait_idle(&self) -> Result<()> {
        let _guard = self.queue_lock.lock();
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_shader_module(&self, spirv: &[u32]) -> Result<ShaderModuleHandle> {
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let module = unsafe {
            self.device
                .create_shader_module(&info, None)
                .map_err(|e| {
                    RenderError::VulkanError(format!("Failed to create shader module: {e}"))
                })?
        };
        Ok(ShaderModuleHandle(module.as_raw()))
    }

    fn destroy_shader_module(&self, module: ShaderModuleHandle) {
        unsafe {
            self.device
                .destroy_shader_module(vk::ShaderModule::from_raw(module.raw()), None);
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let (buffer, allocation) = unsafe {
            self.allocator
                .create_buffer(
                    &vk::BufferCreateInfo::default()
                        .size(desc.size)
                        .usage(desc.usage)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    &vk_mem::AllocationCreateInfo {
                        usage: vk_mem::MemoryUsage::AutoPreferHost,
                        flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                        ..Default::default()
                    },
                )
                .map_err(|e| {
                    RenderError::VulkanError(format!(
                        "Buffer '{}' creation failed: {e:?}",
                        desc.label
                    ))
                })?
        };
        let mut entry = BufferEntry {
            buffer,
            allocation,
            size: desc.size,
        };
        // Host memory comes back uninitialized; slots not yet uploaded must read as zero.
        if let Err(e) = self.map_entry(&mut entry, |ptr| unsafe {
            std::ptr::write_bytes(ptr, 0, desc.size as usize)
        }) {
            unsafe {
                self.allocator
                    .destroy_buffer(entry.buffer, &mut entry.allocation);
            }
            return Err(e);
        }
        let handle = BufferHandle(buffer.as_raw());
        self.resources.lock().buffers.insert(handle, entry);
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut resources = self.resources.lock();
        let entry = resources
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RenderError::ResourceNotFound(format!("buffer {buffer:?}")))?;
        if offset + data.len() as u64 > entry.size {
            return Err(RenderError::VulkanError(format!(
                "Write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                entry.size
            )));
        }
        self.map_entry(entry, |ptr| unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        })
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(mut entry) = self.resources.lock().buffers.remove(&buffer) {
            unsafe {
                self.allocator
                    .destroy_buffer(entry.buffer, &mut entry.allocation);
            }
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle> {
        if !self.supports_format(desc.format, desc.usage) {
            log::error!("Image '{}' uses unsupported format {:?}", desc.label, desc.format);
            return Err(RenderError::UnsupportedFormat(desc.format));
        }
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let (image, allocation) = unsafe {
            self.allocator
                .create_image(
                    &info,
                    &vk_mem::AllocationCreateInfo {
                        usage: vk_mem::MemoryUsage::AutoPreferDevice,
                        ..Default::default()
                    },
                )
                .map_err(|e| {
                    RenderError::VulkanError(format!(
                        "Image '{}' creation failed: {e:?}",
                        desc.label
                    ))
                })?
        };

        let layer_views = (0..desc.layers)
            .map(|layer| self.create_view(image, desc.format, vk::ImageViewType::TYPE_2D, layer, 1))
            .collect::<Result<Vec<_>>>()?;
        let sample_type = if desc.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let sample_view = self.create_view(image, desc.format, sample_type, 0, desc.layers)?;

        let handle = ImageHandle(image.as_raw());
        self.resources.lock().images.insert(
            handle,
            ImageEntry {
                image,
                allocation,
                format: desc.format,
                layer_views,
                sample_view,
            },
        );
        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        if let Some(mut entry) = self.resources.lock().images.remove(&image) {
            unsafe {
                for view in entry.layer_views.drain(..) {
                    self.device.destroy_image_view(view, None);
                }
                self.device.destroy_image_view(entry.sample_view, None);
                self.allocator.destroy_image(entry.image, &mut entry.allocation);
            }
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle> {
        let vk_bindings: Vec<_> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None)? };
        Ok(DescriptorSetLayoutHandle(layout.as_raw()))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        unsafe {
            self.device.destroy_descriptor_set_layout(
                vk::DescriptorSetLayout::from_raw(layout.raw()),
                None,
            );
        }
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<DescriptorPoolHandle> {
        let sizes: Vec<_> = desc
            .sizes
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(desc.max_sets)
            .pool_sizes(&sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&info, None)? };
        Ok(DescriptorPoolHandle(pool.as_raw()))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        unsafe {
            self.device
                .destroy_descriptor_pool(vk::DescriptorPool::from_raw(pool.raw()), None);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        let layouts = [vk::DescriptorSetLayout::from_raw(layout.raw())];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk::DescriptorPool::from_raw(pool.raw()))
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.first()
            .map(|set| DescriptorSetHandle(set.as_raw()))
            .ok_or_else(|| RenderError::VulkanError("No descriptor set returned".to_string()))
    }

    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle) {
        unsafe {
            let _ = self.device.free_descriptor_sets(
                vk::DescriptorPool::from_raw(pool.raw()),
                &[vk::DescriptorSet::from_raw(set.raw())],
            );
        }
    }

    fn write_descriptor_set(
        &self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> Result<()> {
        let resources = self.resources.lock();
        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let info = match write.resource {
                DescriptorResource::UniformBuffer {
                    buffer,
                    offset,
                    range,
                } => WriteInfo::Buffer([vk::DescriptorBufferInfo {
                    buffer: vk::Buffer::from_raw(buffer.raw()),
                    offset,
                    range,
                }]),
                DescriptorResource::SampledImage { image } => {
                    let entry = resources.images.get(&image).ok_or_else(|| {
                        RenderError::ResourceNotFound(format!("image {image:?}"))
                    })?;
                    let layout = if is_depth_format(entry.format) {
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                    } else {
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    };
                    WriteInfo::Image([vk::DescriptorImageInfo {
                        sampler: self.sampler,
                        image_view: entry.sample_view,
                        image_layout: layout,
                    }])
                }
                DescriptorResource::InputAttachment { image } => {
                    let entry = resources.images.get(&image).ok_or_else(|| {
                        RenderError::ResourceNotFound(format!("image {image:?}"))
                    })?;
                    let view = entry.layer_views.first().copied().ok_or_else(|| {
                        RenderError::ResourceNotFound(format!("view of image {image:?}"))
                    })?;
                    WriteInfo::Image([vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }])
                }
            };
            infos.push(info);
        }

        let dst_set = vk::DescriptorSet::from_raw(set.raw());
        let vk_writes: Vec<_> = writes
            .iter()
            .zip(infos.iter())
            .map(|(write, info)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(dst_set)
                    .dst_binding(write.binding);
                match (write.resource, info) {
                    (DescriptorResource::UniformBuffer { .. }, WriteInfo::Buffer(buffer)) => base
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(buffer),
                    (DescriptorResource::InputAttachment { .. }, WriteInfo::Image(image)) => base
                        .descriptor_type(vk::DescriptorType::INPUT_ATTACHMENT)
                        .image_info(image),
                    (_, WriteInfo::Image(image)) => base
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(image),
                    (_, WriteInfo::Buffer(buffer)) => base
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(buffer),
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutHandle> {
        let layouts: Vec<_> = set_layouts
            .iter()
            .map(|layout| vk::DescriptorSetLayout::from_raw(layout.raw()))
            .collect();
        let ranges: Vec<_> = push_constants
            .iter()
            .map(|range| vk::PushConstantRange {
                stage_flags: range.stages,
                offset: range.offset,
                size: range.size,
            })
            .collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&layouts)
            .push_constant_ranges(&ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&info, None)? };
        Ok(PipelineLayoutHandle(layout.as_raw()))
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        unsafe {
            self.device
                .destroy_pipeline_layout(vk::PipelineLayout::from_raw(layout.raw()), None);
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassHandle> {
        if desc.subpasses.is_empty() {
            return Err(RenderError::VulkanError(
                "Render pass needs at least one subpass".to_string(),
            ));
        }
        let attachments: Vec<_> = desc
            .attachments
            .iter()
            .map(|attachment| vk::AttachmentDescription {
                format: attachment.format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: attachment.load_op,
                store_op: attachment.store_op,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: attachment.final_layout,
                ..Default::default()
            })
            .collect();

        let reference = |attachment: u32, layout: vk::ImageLayout| vk::AttachmentReference {
            attachment,
            layout,
        };
        let refs: Vec<_> = desc
            .subpasses
            .iter()
            .map(|subpass| {
                let color: Vec<_> = subpass
                    .color
                    .iter()
                    .map(|&i| reference(i, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                    .collect();
                let inputs: Vec<_> = subpass
                    .inputs
                    .iter()
                    .map(|&i| reference(i, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
                    .collect();
                let depth = subpass
                    .depth
                    .map(|i| reference(i, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL));
                (color, inputs, depth)
            })
            .collect();
        let subpasses: Vec<_> = refs
            .iter()
            .map(|(color, inputs, depth)| {
                let mut subpass = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(color)
                    .input_attachments(inputs);
                if let Some(depth) = depth {
                    subpass = subpass.depth_stencil_attachment(depth);
                }
                subpass
            })
            .collect();

        let writes = vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        let output_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let last = subpasses.len() as u32 - 1;
        let mut dependencies = vec![vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::SHADER_READ,
            dst_stage_mask: output_stages | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            dst_access_mask: writes,
            dependency_flags: vk::DependencyFlags::empty(),
        }];
        for index in 1..=last {
            dependencies.push(vk::SubpassDependency {
                src_subpass: index - 1,
                dst_subpass: index,
                src_stage_mask: output_stages,
                src_access_mask: writes,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                dst_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            });
        }
        // Shadow maps and camera outputs are sampled by later passes.
        dependencies.push(vk::SubpassDependency {
            src_subpass: last,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: output_stages,
            src_access_mask: writes,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            dependency_flags: vk::DependencyFlags::empty(),
        });

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { self.device.create_render_pass(&info, None)? };
        Ok(RenderPassHandle(render_pass.as_raw()))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        unsafe {
            self.device
                .destroy_render_pass(vk::RenderPass::from_raw(render_pass.raw()), None);
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: RenderPassHandle,
        attachments: &[AttachmentView],
        extent: vk::Extent2D,
    ) -> Result<FramebufferHandle> {
        let views = {
            let resources = self.resources.lock();
            attachments
                .iter()
                .map(|attachment| {
                    resources
                        .images
                        .get(&attachment.image)
                        .and_then(|entry| entry.layer_views.get(attachment.layer as usize))
                        .copied()
                        .ok_or_else(|| {
                            RenderError::ResourceNotFound(format!(
                                "layer {} of image {:?}",
                                attachment.layer, attachment.image
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?
        };
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(vk::RenderPass::from_raw(render_pass.raw()))
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&info, None)? };
        Ok(FramebufferHandle(framebuffer.as_raw()))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        unsafe {
            self.device
                .destroy_framebuffer(vk::Framebuffer::from_raw(framebuffer.raw()), None);
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineHandle> {
        if desc.stages.is_empty() {
            return Err(RenderError::VulkanError(
                "At least one shader stage must be provided".to_string(),
            ));
        }
        let entry_points = desc
            .stages
            .iter()
            .map(|stage| {
                CString::new(stage.entry_point.as_str()).map_err(|_| {
                    RenderError::InvalidConfig(format!(
                        "Entry point '{}' contains a NUL byte",
                        stage.entry_point
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let stage_infos: Vec<_> = desc
            .stages
            .iter()
            .zip(entry_points.iter())
            .map(|(stage, name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .module(vk::ShaderModule::from_raw(stage.module.raw()))
                    .stage(stage.stage)
                    .name(name)
            })
            .collect();

        let bindings: Vec<_> = if desc.vertex_layout.stride == 0 {
            Vec::new()
        } else {
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: desc.vertex_layout.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }]
        };
        let attributes: Vec<_> = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: 0,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: desc.extent.width as f32,
            height: desc.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: desc.extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let mut rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        if let Some(bias) = desc.depth.and_then(|depth| depth.bias) {
            rasterization = rasterization
                .depth_bias_enable(true)
                .depth_bias_constant_factor(bias)
                .depth_bias_slope_factor(1.75);
        }

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let blend_attachments: Vec<_> = desc
            .color_targets
            .iter()
            .map(|target| blend_state(target.blend))
            .collect();
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let depth_stencil = desc.depth.map(|depth| {
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(depth.test)
                .depth_write_enable(depth.write)
                .depth_compare_op(depth.compare)
                .depth_bounds_test_enable(false)
                .stencil_test_enable(false)
                .min_depth_bounds(0.0)
                .max_depth_bounds(1.0)
        });

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(vk::PipelineLayout::from_raw(desc.layout.raw()))
            .render_pass(vk::RenderPass::from_raw(desc.render_pass.raw()))
            .subpass(desc.subpass)
            .base_pipeline_index(-1);
        if let Some(ref depth_stencil) = depth_stencil {
            pipeline_info = pipeline_info.depth_stencil_state(depth_stencil);
        }

        let pipeline = unsafe {
            match self.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            ) {
                Ok(pipelines) => pipelines[0],
                Err((_, e)) => {
                    return Err(RenderError::VulkanError(format!(
                        "Failed to create graphics pipeline '{}': {e}",
                        desc.label
                    )))
                }
            }
        };
        Ok(PipelineHandle(pipeline.as_raw()))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        unsafe {
            self.device
                .destroy_pipeline(vk::Pipeline::from_raw(pipeline.raw()), None);
        }
    }

    fn create_command_pool(&self) -> Result<CommandPoolHandle> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family);
        let pool = unsafe { self.device.create_command_pool(&info, None)? };
        Ok(CommandPoolHandle(pool.as_raw()))
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk::CommandPool::from_raw(pool.raw()))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        Ok(buffers
            .into_iter()
            .map(|cb| CommandBufferHandle(cb.as_raw()))
            .collect())
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        unsafe {
            self.device
                .destroy_command_pool(vk::CommandPool::from_raw(pool.raw()), None);
        }
    }

    fn begin_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        let cb = vk::CommandBuffer::from_raw(command_buffer.raw());
        unsafe {
            self.device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())?;
            let info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cb, &info)?;
        }
        Ok(())
    }

    fn encode(&self, command_buffer: CommandBufferHandle, command: &Command) -> Result<()> {
        let cb = vk::CommandBuffer::from_raw(command_buffer.raw());
        unsafe {
            match command {
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_values,
                } => {
                    let clears: Vec<_> = clear_values.iter().map(clear_value).collect();
                    let info = vk::RenderPassBeginInfo::default()
                        .render_pass(vk::RenderPass::from_raw(render_pass.raw()))
                        .framebuffer(vk::Framebuffer::from_raw(framebuffer.raw()))
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: *extent,
                        })
                        .clear_values(&clears);
                    self.device
                        .cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE);
                }
                Command::NextSubpass => {
                    self.device.cmd_next_subpass(cb, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => self.device.cmd_end_render_pass(cb),
                Command::BindPipeline(pipeline) => self.device.cmd_bind_pipeline(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    vk::Pipeline::from_raw(pipeline.raw()),
                ),
                Command::BindDescriptorSets {
                    layout,
                    first_set,
                    sets,
                } => {
                    let sets: Vec<_> = sets
                        .iter()
                        .map(|set| vk::DescriptorSet::from_raw(set.raw()))
                        .collect();
                    self.device.cmd_bind_descriptor_sets(
                        cb,
                        vk::PipelineBindPoint::GRAPHICS,
                        vk::PipelineLayout::from_raw(layout.raw()),
                        *first_set,
                        &sets,
                        &[],
                    );
                }
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => self.device.cmd_push_constants(
                    cb,
                    vk::PipelineLayout::from_raw(layout.raw()),
                    *stages,
                    *offset,
                    data,
                ),
                Command::BindVertexBuffer(buffer) => self.device.cmd_bind_vertex_buffers(
                    cb,
                    0,
                    &[vk::Buffer::from_raw(buffer.raw())],
                    &[0],
                ),
                Command::BindIndexBuffer(buffer) => self.device.cmd_bind_index_buffer(
                    cb,
                    vk::Buffer::from_raw(buffer.raw()),
                    0,
                    vk::IndexType::UINT32,
                ),
                Command::SetViewport(extent) => {
                    let viewport = vk::Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: extent.width as f32,
                        height: extent.height as f32,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    };
                    let scissor = vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: *extent,
                    };
                    self.device.cmd_set_viewport(cb, 0, &[viewport]);
                    self.device.cmd_set_scissor(cb, 0, &[scissor]);
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                } => self
                    .device
                    .cmd_draw(cb, *vertex_count, *instance_count, 0, 0),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                } => self
                    .device
                    .cmd_draw_indexed(cb, *index_count, *instance_count, 0, 0, 0),
            }
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        unsafe {
            self.device
                .end_command_buffer(vk::CommandBuffer::from_raw(command_buffer.raw()))?;
        }
        Ok(())
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            let mut resources = self.resources.lock();
            for (_, mut entry) in resources.buffers.drain() {
                self.allocator
                    .destroy_buffer(entry.buffer, &mut entry.allocation);
            }
            for (_, mut entry) in resources.images.drain() {
                for view in entry.layer_views.drain(..) {
                    self.device.destroy_image_view(view, None);
                }
                self.device.destroy_image_view(entry.sample_view, None);
                self.allocator.destroy_image(entry.image, &mut entry.allocation);
            }
            drop(resources);
            self.device.destroy_sampler(self.sampler, None);
            ManuallyDrop::drop(&mut self.allocator);
            log::info!("VMA allocator destroyed");
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
            log::info!("Vulkan device destroyed");
        }
    }
}
