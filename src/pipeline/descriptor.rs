use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::layout::SetLayout;
use crate::config::DescriptorPoolConfig;
use crate::gpu::{
    DescriptorPoolDesc, DescriptorPoolHandle, DescriptorSetHandle, DescriptorWrite, GpuDevice,
};
use crate::{RenderError, Result};

#[derive(Debug, Default, Clone)]
struct PoolUsage {
    sets: u32,
    descriptors: HashMap<vk::DescriptorType, u32>,
}

struct PoolShared {
    device: Arc<dyn GpuDevice>,
    pool: DescriptorPoolHandle,
    max_sets: u32,
    capacity: HashMap<vk::DescriptorType, u32>,
    usage: Mutex<PoolUsage>,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
        log::info!("[DescriptorAllocator] Pool destroyed");
    }
}

/// Hands out descriptor sets from one fixed-size pool.
///
/// The pool never grows: running out is a configuration error, reported and returned
/// as [`RenderError::DescriptorPoolExhausted`]. Cloning shares the same pool.
#[derive(Clone)]
pub struct DescriptorAllocator {
    shared: Arc<PoolShared>,
}

impl DescriptorAllocator {
    pub fn new(device: Arc<dyn GpuDevice>, config: &DescriptorPoolConfig) -> Result<Self> {
        let capacity: HashMap<_, _> = [
            (vk::DescriptorType::UNIFORM_BUFFER, config.uniform_buffers),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                config.sampled_images,
            ),
            (vk::DescriptorType::INPUT_ATTACHMENT, config.input_attachments),
        ]
        .into_iter()
        .collect();

        let pool = device.create_descriptor_pool(&DescriptorPoolDesc {
            max_sets: config.max_sets,
            sizes: capacity.iter().map(|(&ty, &count)| (ty, count)).collect(),
        })?;
        log::info!(
            "[DescriptorAllocator] Pool created ({} sets, {} uniform, {} sampled, {} input)",
            config.max_sets,
            config.uniform_buffers,
            config.sampled_images,
            config.input_attachments
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                device,
                pool,
                max_sets: config.max_sets,
                capacity,
                usage: Mutex::new(PoolUsage::default()),
            }),
        })
    }

    pub fn allocate_set(&self, layout: &SetLayout) -> Result<DescriptorSet> {
        let counts = layout.descriptor_counts();
        {
            let mut usage = self.shared.usage.lock();
            if usage.sets >= self.shared.max_sets {
                let msg = format!(
                    "{:?} set needs a slot but all {} sets are in use",
                    layout.kind, self.shared.max_sets
                );
                log::error!("[DescriptorAllocator] {msg}");
                return Err(RenderError::DescriptorPoolExhausted(msg));
            }
            for (ty, &needed) in &counts {
                let used = usage.descriptors.get(ty).copied().unwrap_or(0);
                let capacity = self.shared.capacity.get(ty).copied().unwrap_or(0);
                if used + needed > capacity {
                    let msg = format!(
                        "{:?} set needs {needed} {ty:?} descriptors, {} of {capacity} left",
                        layout.kind,
                        capacity.saturating_sub(used)
                    );
                    log::error!("[DescriptorAllocator] {msg}");
                    return Err(RenderError::DescriptorPoolExhausted(msg));
                }
            }
            usage.sets += 1;
            for (&ty, &needed) in &counts {
                *usage.descriptors.entry(ty).or_insert(0) += needed;
            }
        }

        match self
            .shared
            .device
            .allocate_descriptor_set(self.shared.pool, layout.handle)
        {
            Ok(handle) => Ok(DescriptorSet {
                shared: Arc::clone(&self.shared),
                handle,
                counts,
            }),
            Err(err) => {
                release(&self.shared, &counts);
                log::error!("[DescriptorAllocator] Device allocation failed: {err}");
                Err(err)
            }
        }
    }

    pub fn allocated_sets(&self) -> u32 {
        self.shared.usage.lock().sets
    }

    pub fn remaining_sets(&self) -> u32 {
        self.shared.max_sets - self.allocated_sets()
    }
}

fn release(shared: &PoolShared, counts: &HashMap<vk::DescriptorType, u32>) {
    let mut usage = shared.usage.lock();
    usage.sets = usage.sets.saturating_sub(1);
    for (ty, count) in counts {
        if let Some(used) = usage.descriptors.get_mut(ty) {
            *used = used.saturating_sub(*count);
        }
    }
}

/// A descriptor set that returns itself to its pool when dropped.
pub struct DescriptorSet {
    shared: Arc<PoolShared>,
    handle: DescriptorSetHandle,
    counts: HashMap<vk::DescriptorType, u32>,
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DescriptorSet").field(&self.handle).finish()
    }
}

impl DescriptorSet {
    pub fn handle(&self) -> DescriptorSetHandle {
        self.handle
    }

    pub fn write(&self, writes: &[DescriptorWrite]) -> Result<()> {
        self.shared.device.write_descriptor_set(self.handle, writes)
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        self.shared
            .device
            .free_descriptor_set(self.shared.pool, self.handle);
        release(&self.shared, &self.counts);
    }
}
