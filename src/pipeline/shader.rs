use ash::vk;
use std::collections::HashMap;

use super::uniform::UniformLayout;
use crate::gpu::{ShaderModuleHandle, ShaderStageDesc};
use crate::{RenderError, Result};

/// Passes that need compiled shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderPass {
    DeferredGeometry,
    DeferredLighting,
    Forward,
    Shadow,
}

impl ShaderPass {
    pub const ALL: [ShaderPass; 4] = [
        Self::DeferredGeometry,
        Self::DeferredLighting,
        Self::Forward,
        Self::Shadow,
    ];
}

#[derive(Debug, Clone)]
struct ShaderEntry {
    module: ShaderModuleHandle,
    entry_point: String,
}

/// Compiled shader modules and push-constant tables, keyed by pass and stage.
///
/// Filled in by the shader compiler; the orchestrator only looks modules up.
#[derive(Debug, Clone, Default)]
pub struct ShaderCatalog {
    modules: HashMap<(ShaderPass, vk::ShaderStageFlags), ShaderEntry>,
    push_constants: HashMap<ShaderPass, UniformLayout>,
}

impl ShaderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module` for the vertex and fragment stage of every pass, with the
    /// default push-constant tables. Handy for headless runs.
    pub fn with_module_for_all_passes(module: ShaderModuleHandle) -> Self {
        let mut catalog = Self::new();
        for pass in ShaderPass::ALL {
            catalog.register(pass, vk::ShaderStageFlags::VERTEX, module, "main");
            catalog.register(pass, vk::ShaderStageFlags::FRAGMENT, module, "main");
        }
        catalog.set_push_constants(ShaderPass::Shadow, UniformLayout::shadow_push());
        catalog.set_push_constants(ShaderPass::DeferredLighting, UniformLayout::light_push());
        catalog.set_push_constants(ShaderPass::Forward, UniformLayout::light_push());
        catalog
    }

    pub fn register(
        &mut self,
        pass: ShaderPass,
        stage: vk::ShaderStageFlags,
        module: ShaderModuleHandle,
        entry_point: &str,
    ) {
        self.modules.insert(
            (pass, stage),
            ShaderEntry {
                module,
                entry_point: entry_point.to_string(),
            },
        );
    }

    pub fn set_push_constants(&mut self, pass: ShaderPass, layout: UniformLayout) {
        self.push_constants.insert(pass, layout);
    }

    pub fn stage(&self, pass: ShaderPass, stage: vk::ShaderStageFlags) -> Result<ShaderStageDesc> {
        self.modules
            .get(&(pass, stage))
            .map(|entry| ShaderStageDesc {
                stage,
                module: entry.module,
                entry_point: entry.entry_point.clone(),
            })
            .ok_or_else(|| {
                log::error!("No shader registered for {pass:?} {stage:?}");
                RenderError::MissingShader(format!("{pass:?} {stage:?}"))
            })
    }

    /// Vertex + fragment stages for `pass`.
    pub fn graphics_stages(&self, pass: ShaderPass) -> Result<Vec<ShaderStageDesc>> {
        Ok(vec![
            self.stage(pass, vk::ShaderStageFlags::VERTEX)?,
            self.stage(pass, vk::ShaderStageFlags::FRAGMENT)?,
        ])
    }

    pub fn push_constants(&self, pass: ShaderPass) -> Option<&UniformLayout> {
        self.push_constants.get(&pass)
    }
}
