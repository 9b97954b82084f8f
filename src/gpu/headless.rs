use ash::vk;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::types::*;
use super::GpuDevice;
use crate::{RenderError, Result};

/// Object categories tracked by [`HeadlessDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ShaderModule,
    Buffer,
    Image,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    PipelineLayout,
    RenderPass,
    Framebuffer,
    Pipeline,
    CommandPool,
    CommandBuffer,
}

/// What a pipeline was created with, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRecord {
    pub label: String,
    pub layout: PipelineLayoutHandle,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub extent: vk::Extent2D,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub color_targets: Vec<ColorTarget>,
}

#[derive(Default)]
struct CommandBufferState {
    pool: CommandPoolHandle,
    recording: bool,
    commands: Vec<Command>,
}

struct PoolState {
    max_sets: u32,
    sets: HashSet<DescriptorSetHandle>,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    live: HashMap<ObjectKind, usize>,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    images: HashMap<ImageHandle, ImageDesc>,
    pipelines: HashMap<PipelineHandle, PipelineRecord>,
    framebuffers: HashMap<FramebufferHandle, Vec<AttachmentView>>,
    render_passes: HashMap<RenderPassHandle, RenderPassDesc>,
    descriptor_pools: HashMap<DescriptorPoolHandle, PoolState>,
    descriptor_writes: HashMap<DescriptorSetHandle, Vec<DescriptorWrite>>,
    command_pools: HashMap<CommandPoolHandle, Vec<CommandBufferHandle>>,
    command_buffers: HashMap<CommandBufferHandle, CommandBufferState>,
    wait_idle_calls: usize,
}

impl HeadlessState {
    fn mint(&mut self, kind: ObjectKind) -> u64 {
        self.next_handle += 1;
        *self.live.entry(kind).or_default() += 1;
        self.next_handle
    }

    fn release(&mut self, kind: ObjectKind) {
        if let Some(count) = self.live.get_mut(&kind) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Device that executes nothing and remembers everything.
///
/// Command buffers keep the full list of [`Command`]s encoded into them so tests can
/// check ordering and bindings; buffers keep their bytes; object lifetimes are counted.
pub struct HeadlessDevice {
    features: DeviceFeatures,
    unsupported_formats: HashSet<vk::Format>,
    state: Mutex<HeadlessState>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            features: DeviceFeatures::default(),
            unsupported_formats: HashSet::new(),
            state: Mutex::new(HeadlessState::default()),
        }
    }

    pub fn with_features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_unsupported_format(mut self, format: vk::Format) -> Self {
        self.unsupported_formats.insert(format);
        self
    }

    /// Commands recorded by the last begin/end cycle of `command_buffer`.
    pub fn commands(&self, command_buffer: CommandBufferHandle) -> Vec<Command> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    pub fn is_recording(&self, command_buffer: CommandBufferHandle) -> bool {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .map(|cb| cb.recording)
            .unwrap_or(false)
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    pub fn image_desc(&self, image: ImageHandle) -> Option<ImageDesc> {
        self.state.lock().images.get(&image).cloned()
    }

    pub fn pipeline_record(&self, pipeline: PipelineHandle) -> Option<PipelineRecord> {
        self.state.lock().pipelines.get(&pipeline).cloned()
    }

    pub fn framebuffer_attachments(&self, framebuffer: FramebufferHandle) -> Vec<AttachmentView> {
        self.state
            .lock()
            .framebuffers
            .get(&framebuffer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn descriptor_writes(&self, set: DescriptorSetHandle) -> Vec<DescriptorWrite> {
        self.state
            .lock()
            .descriptor_writes
            .get(&set)
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_objects(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.get(&kind).copied().unwrap_or(0)
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state.lock().wait_idle_calls
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn features(&self) -> DeviceFeatures {
        self.features
    }

    fn supports_format(&self, format: vk::Format, _usage: vk::ImageUsageFlags) -> bool {
        format != vk::Format::UNDEFINED && !self.unsupported_formats.contains(&format)
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.command_buffers.values().any(|cb| cb.recording) {
            return Err(RenderError::VulkanError(
                "wait_idle called while a command buffer is still recording".to_string(),
            ));
        }
        state.wait_idle_calls += 1;
        Ok(())
    }

    fn create_shader_module(&self, spirv: &[u32]) -> Result<ShaderModuleHandle> {
        if spirv.is_empty() {
            return Err(RenderError::VulkanError(
                "Shader module code is empty".to_string(),
            ));
        }
        Ok(ShaderModuleHandle(
            self.state.lock().mint(ObjectKind::ShaderModule),
        ))
    }

    fn destroy_shader_module(&self, _module: ShaderModuleHandle) {
        self.state.lock().release(ObjectKind::ShaderModule);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(RenderError::VulkanError(format!(
                "Buffer '{}' has zero size",
                desc.label
            )));
        }
        let mut state = self.state.lock();
        let handle = BufferHandle(state.mint(ObjectKind::Buffer));
        state.buffers.insert(handle, vec![0; desc.size as usize]);
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RenderError::ResourceNotFound(format!("buffer {buffer:?}")))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(RenderError::VulkanError(format!(
                "Write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_some() {
            state.release(ObjectKind::Buffer);
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle> {
        if !self.supports_format(desc.format, desc.usage) {
            return Err(RenderError::UnsupportedFormat(desc.format));
        }
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.layers == 0 {
            return Err(RenderError::VulkanError(format!(
                "Image '{}' has an empty extent",
                desc.label
            )));
        }
        let mut state = self.state.lock();
        let handle = ImageHandle(state.mint(ObjectKind::Image));
        state.images.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut state = self.state.lock();
        if state.images.remove(&image).is_some() {
            state.release(ObjectKind::Image);
        }
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle> {
        Ok(DescriptorSetLayoutHandle(
            self.state.lock().mint(ObjectKind::DescriptorSetLayout),
        ))
    }

    fn destroy_descriptor_set_layout(&self, _layout: DescriptorSetLayoutHandle) {
        self.state.lock().release(ObjectKind::DescriptorSetLayout);
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<DescriptorPoolHandle> {
        let mut state = self.state.lock();
        let handle = DescriptorPoolHandle(state.mint(ObjectKind::DescriptorPool));
        state.descriptor_pools.insert(
            handle,
            PoolState {
                max_sets: desc.max_sets,
                sets: HashSet::new(),
            },
        );
        Ok(handle)
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state.lock();
        if let Some(pool_state) = state.descriptor_pools.remove(&pool) {
            state.release(ObjectKind::DescriptorPool);
            for set in pool_state.sets {
                state.descriptor_writes.remove(&set);
                state.release(ObjectKind::DescriptorSet);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        _layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        let mut state = self.state.lock();
        let full = match state.descriptor_pools.get(&pool) {
            Some(pool_state) => pool_state.sets.len() as u32 >= pool_state.max_sets,
            None => {
                return Err(RenderError::ResourceNotFound(format!(
                    "descriptor pool {pool:?}"
                )))
            }
        };
        if full {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY.into());
        }
        let handle = DescriptorSetHandle(state.mint(ObjectKind::DescriptorSet));
        if let Some(pool_state) = state.descriptor_pools.get_mut(&pool) {
            pool_state.sets.insert(handle);
        }
        Ok(handle)
    }

    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle) {
        let mut state = self.state.lock();
        let removed = state
            .descriptor_pools
            .get_mut(&pool)
            .map(|pool_state| pool_state.sets.remove(&set))
            .unwrap_or(false);
        if removed {
            state.descriptor_writes.remove(&set);
            state.release(ObjectKind::DescriptorSet);
        }
    }

    fn write_descriptor_set(
        &self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.descriptor_writes.entry(set).or_default();
        for write in writes {
            entry.retain(|existing| existing.binding != write.binding);
            entry.push(*write);
        }
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[DescriptorSetLayoutHandle],
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutHandle> {
        if push_constants.iter().any(|range| range.size % 4 != 0) {
            return Err(RenderError::VulkanError(
                "Push constant range size must be a multiple of 4".to_string(),
            ));
        }
        Ok(PipelineLayoutHandle(
            self.state.lock().mint(ObjectKind::PipelineLayout),
        ))
    }

    fn destroy_pipeline_layout(&self, _layout: PipelineLayoutHandle) {
        self.state.lock().release(ObjectKind::PipelineLayout);
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassHandle> {
        if desc.subpasses.is_empty() {
            return Err(RenderError::VulkanError(
                "Render pass needs at least one subpass".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let handle = RenderPassHandle(state.mint(ObjectKind::RenderPass));
        state.render_passes.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        let mut state = self.state.lock();
        if state.render_passes.remove(&render_pass).is_some() {
            state.release(ObjectKind::RenderPass);
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: RenderPassHandle,
        attachments: &[AttachmentView],
        _extent: vk::Extent2D,
    ) -> Result<FramebufferHandle> {
        let mut state = self.state.lock();
        let expected = state
            .render_passes
            .get(&render_pass)
            .map(|desc| desc.attachments.len())
            .ok_or_else(|| RenderError::ResourceNotFound(format!("render pass {render_pass:?}")))?;
        if expected != attachments.len() {
            return Err(RenderError::VulkanError(format!(
                "Framebuffer has {} attachments, render pass expects {expected}",
                attachments.len()
            )));
        }
        let handle = FramebufferHandle(state.mint(ObjectKind::Framebuffer));
        state.framebuffers.insert(handle, attachments.to_vec());
        Ok(handle)
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        let mut state = self.state.lock();
        if state.framebuffers.remove(&framebuffer).is_some() {
            state.release(ObjectKind::Framebuffer);
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineHandle> {
        if desc.stages.is_empty() {
            return Err(RenderError::VulkanError(
                "At least one shader stage must be provided".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let subpasses = state
            .render_passes
            .get(&desc.render_pass)
            .map(|pass| pass.subpasses.len() as u32)
            .ok_or_else(|| {
                RenderError::ResourceNotFound(format!("render pass {:?}", desc.render_pass))
            })?;
        if desc.subpass >= subpasses {
            return Err(RenderError::VulkanError(format!(
                "Subpass {} out of range for render pass with {subpasses} subpasses",
                desc.subpass
            )));
        }
        let handle = PipelineHandle(state.mint(ObjectKind::Pipeline));
        state.pipelines.insert(
            handle,
            PipelineRecord {
                label: desc.label.to_string(),
                layout: desc.layout,
                render_pass: desc.render_pass,
                subpass: desc.subpass,
                extent: desc.extent,
                polygon_mode: desc.polygon_mode,
                cull_mode: desc.cull_mode,
                color_targets: desc.color_targets.to_vec(),
            },
        );
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        let mut state = self.state.lock();
        if state.pipelines.remove(&pipeline).is_some() {
            state.release(ObjectKind::Pipeline);
        }
    }

    fn create_command_pool(&self) -> Result<CommandPoolHandle> {
        let mut state = self.state.lock();
        let handle = CommandPoolHandle(state.mint(ObjectKind::CommandPool));
        state.command_pools.insert(handle, Vec::new());
        Ok(handle)
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>> {
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool) {
            return Err(RenderError::ResourceNotFound(format!(
                "command pool {pool:?}"
            )));
        }
        let buffers: Vec<_> = (0..count)
            .map(|_| CommandBufferHandle(state.mint(ObjectKind::CommandBuffer)))
            .collect();
        for &buffer in &buffers {
            state.command_buffers.insert(
                buffer,
                CommandBufferState {
                    pool,
                    ..Default::default()
                },
            );
        }
        if let Some(owned) = state.command_pools.get_mut(&pool) {
            owned.extend_from_slice(&buffers);
        }
        Ok(buffers)
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state.lock();
        if let Some(buffers) = state.command_pools.remove(&pool) {
            state.release(ObjectKind::CommandPool);
            for buffer in buffers {
                if state.command_buffers.remove(&buffer).is_some() {
                    state.release(ObjectKind::CommandBuffer);
                }
            }
        }
    }

    fn begin_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        let cb = state.command_buffers.get_mut(&command_buffer).ok_or_else(|| {
            RenderError::ResourceNotFound(format!("command buffer {command_buffer:?}"))
        })?;
        if cb.recording {
            return Err(RenderError::VulkanError(format!(
                "Command buffer {command_buffer:?} is already recording"
            )));
        }
        cb.recording = true;
        cb.commands.clear();
        Ok(())
    }

    fn encode(&self, command_buffer: CommandBufferHandle, command: &Command) -> Result<()> {
        let mut state = self.state.lock();
        let cb = state.command_buffers.get_mut(&command_buffer).ok_or_else(|| {
            RenderError::ResourceNotFound(format!("command buffer {command_buffer:?}"))
        })?;
        if !cb.recording {
            return Err(RenderError::VulkanError(format!(
                "Command buffer {command_buffer:?} (pool {:?}) is not recording",
                cb.pool
            )));
        }
        cb.commands.push(command.clone());
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        let cb = state.command_buffers.get_mut(&command_buffer).ok_or_else(|| {
            RenderError::ResourceNotFound(format!("command buffer {command_buffer:?}"))
        })?;
        if !cb.recording {
            return Err(RenderError::VulkanError(format!(
                "Command buffer {command_buffer:?} ended without begin"
            )));
        }
        cb.recording = false;
        Ok(())
    }
}
