//! Device seam between the orchestrator and a concrete graphics API.
//!
//! Everything above this module talks to a `dyn GpuDevice` through opaque handles.
//! [`HeadlessDevice`] keeps all state in memory and is what tests and benches run
//! against; [`AshDevice`] (feature `vulkan`) drives a real Vulkan device.

mod headless;
pub mod types;
#[cfg(feature = "vulkan")]
mod vulkan;

pub use headless::{HeadlessDevice, ObjectKind, PipelineRecord};
pub use types::*;
#[cfg(feature = "vulkan")]
pub use vulkan::AshDevice;

use ash::vk;

use crate::Result;

/// Trait implemented by graphics backends the orchestrator can drive.
///
/// Object creation and destruction happen on the scheduler thread. `begin_command_buffer`,
/// `encode` and `end_command_buffer` are called from recording workers, each on a command
/// buffer from its own pool, so implementations must tolerate concurrent recording into
/// distinct command buffers.
pub trait GpuDevice: Send + Sync {
    fn name(&self) -> &str;

    fn features(&self) -> DeviceFeatures;

    fn supports_format(&self, format: vk::Format, usage: vk::ImageUsageFlags) -> bool;

    /// Blocks until the device has no outstanding work. Never call from a recording job.
    fn wait_idle(&self) -> Result<()>;

    fn create_shader_module(&self, spirv: &[u32]) -> Result<ShaderModuleHandle>;
    fn destroy_shader_module(&self, module: ShaderModuleHandle);

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle>;
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle>;
    fn destroy_image(&self, image: ImageHandle);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<DescriptorPoolHandle>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle>;
    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle);
    fn write_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite])
        -> Result<()>;

    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutHandle>;
    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle);

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassHandle>;
    fn destroy_render_pass(&self, render_pass: RenderPassHandle);

    fn create_framebuffer(
        &self,
        render_pass: RenderPassHandle,
        attachments: &[AttachmentView],
        extent: vk::Extent2D,
    ) -> Result<FramebufferHandle>;
    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn create_command_pool(&self) -> Result<CommandPoolHandle>;
    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>>;
    /// Frees the pool and every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: CommandPoolHandle);

    /// Resets `command_buffer` and starts recording into it.
    fn begin_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()>;
    fn encode(&self, command_buffer: CommandBufferHandle, command: &Command) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()>;
}
