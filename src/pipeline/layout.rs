use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use crate::gpu::{DescriptorBinding, DescriptorSetLayoutHandle, GpuDevice};
use crate::{RenderError, Result};

/// Descriptor-set shapes shared by every pipeline.
///
/// Pipelines address sets by the order they were registered with
/// [`PipelineBuilder::with_descriptor_set`](super::PipelineBuilder::with_descriptor_set),
/// and shaders must declare `set = n` in that same order:
///
/// | kind      | bindings                                                  |
/// |-----------|-----------------------------------------------------------|
/// | `Camera`  | 0: camera uniforms                                        |
/// | `Mesh`    | 0: mesh uniforms                                          |
/// | `Shadow`  | 0: shadow uniforms, 1: shadow map (combined sampler)      |
/// | `GBuffer` | 0: albedo, 1: normal, 2: depth (input attachments)        |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SetKind {
    Camera,
    Mesh,
    Shadow,
    GBuffer,
}

impl SetKind {
    pub const ALL: [SetKind; 4] = [Self::Camera, Self::Mesh, Self::Shadow, Self::GBuffer];

    fn bindings(self) -> DescriptorSetLayoutBuilder {
        let all_graphics = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        match self {
            Self::Camera | Self::Mesh => DescriptorSetLayoutBuilder::new().add_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                all_graphics,
                1,
            ),
            Self::Shadow => DescriptorSetLayoutBuilder::new()
                .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, all_graphics, 1)
                .add_binding(
                    1,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    vk::ShaderStageFlags::FRAGMENT,
                    1,
                ),
            Self::GBuffer => (0..3).fold(DescriptorSetLayoutBuilder::new(), |builder, binding| {
                builder.add_binding(
                    binding,
                    vk::DescriptorType::INPUT_ATTACHMENT,
                    vk::ShaderStageFlags::FRAGMENT,
                    1,
                )
            }),
        }
    }
}

/// A created layout plus the bindings it was created from.
#[derive(Debug, Clone)]
pub struct SetLayout {
    pub kind: SetKind,
    pub handle: DescriptorSetLayoutHandle,
    pub bindings: Vec<DescriptorBinding>,
}

impl SetLayout {
    /// Number of descriptors of each type one set of this layout consumes.
    pub fn descriptor_counts(&self) -> HashMap<vk::DescriptorType, u32> {
        let mut counts = HashMap::new();
        for binding in &self.bindings {
            *counts.entry(binding.descriptor_type).or_insert(0) += binding.count;
        }
        counts
    }
}

#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            descriptor_type,
            stages,
            count,
        });
        self
    }

    pub fn build(self, device: &dyn GpuDevice, kind: SetKind) -> Result<SetLayout> {
        let handle = device.create_descriptor_set_layout(&self.bindings)?;
        Ok(SetLayout {
            kind,
            handle,
            bindings: self.bindings,
        })
    }
}

/// One layout per [`SetKind`], created once and shared by every stage.
pub struct SharedLayouts {
    device: Arc<dyn GpuDevice>,
    layouts: HashMap<SetKind, SetLayout>,
}

impl SharedLayouts {
    pub fn new(device: Arc<dyn GpuDevice>) -> Result<Self> {
        let mut layouts = HashMap::new();
        for kind in SetKind::ALL {
            match kind.bindings().build(device.as_ref(), kind) {
                Ok(layout) => {
                    layouts.insert(kind, layout);
                }
                Err(err) => {
                    for layout in layouts.values() {
                        device.destroy_descriptor_set_layout(layout.handle);
                    }
                    return Err(err);
                }
            }
        }
        log::debug!("Created {} shared descriptor set layouts", layouts.len());
        Ok(Self { device, layouts })
    }

    pub fn get(&self, kind: SetKind) -> Result<&SetLayout> {
        self.layouts
            .get(&kind)
            .ok_or_else(|| RenderError::ResourceNotFound(format!("set layout {kind:?}")))
    }
}

impl Drop for SharedLayouts {
    fn drop(&mut self) {
        for layout in self.layouts.values() {
            self.device.destroy_descriptor_set_layout(layout.handle);
        }
    }
}
