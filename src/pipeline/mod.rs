//! Declarative pipeline descriptions, descriptor-set layouts and allocation, and the
//! shader/uniform tables handed over by the shader compiler.

pub mod builder;
pub mod descriptor;
pub mod layout;
pub mod shader;
pub mod uniform;

pub use builder::{PipelineBlueprint, PipelineBuilder, RenderPipeline};
pub use descriptor::{DescriptorAllocator, DescriptorSet};
pub use layout::{DescriptorSetLayoutBuilder, SetKind, SetLayout, SharedLayouts};
pub use shader::{ShaderCatalog, ShaderPass};
pub use uniform::{UniformField, UniformLayout};
