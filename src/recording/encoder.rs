use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use crate::gpu::{
    BufferHandle, ClearValue, Command, CommandBufferHandle, DescriptorSetHandle, FramebufferHandle,
    GpuDevice, PipelineHandle, PipelineLayoutHandle, RenderPassHandle,
};
use crate::Result;

/// Typed front end over [`GpuDevice::encode`] for one command buffer.
///
/// Handed to recording jobs by their worker; the buffer is already begun and is ended
/// by the worker once the job returns.
pub struct CommandEncoder {
    device: Arc<dyn GpuDevice>,
    command_buffer: CommandBufferHandle,
    draws: u32,
}

impl CommandEncoder {
    pub fn new(device: Arc<dyn GpuDevice>, command_buffer: CommandBufferHandle) -> Self {
        Self {
            device,
            command_buffer,
            draws: 0,
        }
    }

    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.command_buffer
    }

    /// Draw calls encoded so far.
    pub fn draw_count(&self) -> u32 {
        self.draws
    }

    pub fn encode(&mut self, command: Command) -> Result<()> {
        if command.is_draw() {
            self.draws += 1;
        }
        self.device.encode(self.command_buffer, &command)
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: vk::Extent2D,
        clear_values: &[ClearValue],
    ) -> Result<()> {
        self.encode(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
            clear_values: clear_values.to_vec(),
        })
    }

    pub fn next_subpass(&mut self) -> Result<()> {
        self.encode(Command::NextSubpass)
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        self.encode(Command::EndRenderPass)
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.encode(Command::BindPipeline(pipeline))
    }

    pub fn bind_descriptor_sets(
        &mut self,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) -> Result<()> {
        self.encode(Command::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        })
    }

    pub fn push_constants<T: Pod>(
        &mut self,
        layout: PipelineLayoutHandle,
        stages: vk::ShaderStageFlags,
        value: &T,
    ) -> Result<()> {
        self.encode(Command::PushConstants {
            layout,
            stages,
            offset: 0,
            data: bytemuck::bytes_of(value).to_vec(),
        })
    }

    pub fn bind_vertex_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.encode(Command::BindVertexBuffer(buffer))
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.encode(Command::BindIndexBuffer(buffer))
    }

    /// Full-extent viewport and scissor.
    pub fn set_viewport(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.encode(Command::SetViewport(extent))
    }

    pub fn draw(&mut self, vertex_count: u32) -> Result<()> {
        self.encode(Command::Draw {
            vertex_count,
            instance_count: 1,
        })
    }

    pub fn draw_indexed(&mut self, index_count: u32) -> Result<()> {
        self.encode(Command::DrawIndexed {
            index_count,
            instance_count: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn draws_are_counted() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cb).unwrap();

        let mut encoder = CommandEncoder::new(device.clone(), cb);
        encoder.set_viewport(vk::Extent2D { width: 4, height: 4 }).unwrap();
        encoder.draw(3).unwrap();
        encoder.draw_indexed(36).unwrap();
        assert_eq!(encoder.draw_count(), 2);
        assert_eq!(device.commands(cb).len(), 3);
    }

    #[test]
    fn push_constants_carry_bytes() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = device.create_command_pool().unwrap();
        let cb = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cb).unwrap();

        let mut encoder = CommandEncoder::new(device.clone(), cb);
        encoder
            .push_constants(
                PipelineLayoutHandle(1),
                vk::ShaderStageFlags::VERTEX,
                &[1.0f32; 16],
            )
            .unwrap();
        match &device.commands(cb)[0] {
            Command::PushConstants { data, .. } => assert_eq!(data.len(), 64),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
