use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::Arc;

use super::FrameSlot;
use crate::config::FRAMES_IN_FLIGHT;
use crate::gpu::{BufferDesc, BufferHandle, DescriptorResource, GpuDevice};
use crate::Result;

/// One copy of `T` per frame in flight.
///
/// The scheduler writes the copy for the current slot during `update`; recording jobs
/// only read the copy selected with [`bind`](Self::bind). A slot written in frame F is
/// not handed to a new recording until frame F + `FRAMES_IN_FLIGHT`.
#[derive(Debug)]
pub struct FrameResourceRing<T> {
    slots: Vec<T>,
}

impl<T> FrameResourceRing<T> {
    pub fn new(mut make: impl FnMut(FrameSlot) -> T) -> Self {
        Self {
            slots: FrameSlot::all().map(&mut make).collect(),
        }
    }

    pub fn try_new(make: impl FnMut(FrameSlot) -> Result<T>) -> Result<Self> {
        Ok(Self {
            slots: FrameSlot::all().map(make).collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn bind(&self, slot: FrameSlot) -> &T {
        &self.slots[slot.index()]
    }

    pub fn get_mut(&mut self, slot: FrameSlot) -> &mut T {
        &mut self.slots[slot.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (FrameSlot, &T)> + '_ {
        FrameSlot::all().zip(self.slots.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (FrameSlot, &mut T)> + '_ {
        FrameSlot::all().zip(self.slots.iter_mut())
    }

    pub fn len(&self) -> usize {
        FRAMES_IN_FLIGHT
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Ring of uniform buffers, each sized for one `T`.
pub struct UniformRing<T: Pod> {
    device: Arc<dyn GpuDevice>,
    buffers: FrameResourceRing<BufferHandle>,
    _marker: PhantomData<T>,
}

impl<T: Pod> UniformRing<T> {
    pub fn new(device: Arc<dyn GpuDevice>, label: &'static str) -> Result<Self> {
        let desc = BufferDesc::uniform(std::mem::size_of::<T>() as u64, label);
        let mut created = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in FrameSlot::all() {
            match device.create_buffer(&desc) {
                Ok(buffer) => created.push(buffer),
                Err(err) => {
                    for buffer in created {
                        device.destroy_buffer(buffer);
                    }
                    return Err(err);
                }
            }
        }
        let mut created = created.into_iter();
        let buffers = FrameResourceRing::new(|_| created.next().unwrap_or(BufferHandle::NULL));
        Ok(Self {
            device,
            buffers,
            _marker: PhantomData,
        })
    }

    /// Uploads `value` into the copy for `slot` only.
    pub fn write(&self, slot: FrameSlot, value: &T) -> Result<()> {
        self.device
            .write_buffer(*self.buffers.bind(slot), 0, bytemuck::bytes_of(value))
    }

    pub fn bind(&self, slot: FrameSlot) -> BufferHandle {
        *self.buffers.bind(slot)
    }

    pub fn descriptor(&self, slot: FrameSlot) -> DescriptorResource {
        DescriptorResource::UniformBuffer {
            buffer: self.bind(slot),
            offset: 0,
            range: std::mem::size_of::<T>() as u64,
        }
    }
}

impl<T: Pod> Drop for UniformRing<T> {
    fn drop(&mut self) {
        for (_, buffer) in self.buffers.iter() {
            self.device.destroy_buffer(*buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeadlessDevice, ObjectKind};

    #[test]
    fn ring_holds_one_copy_per_slot() {
        let ring = FrameResourceRing::new(|slot| slot.index() * 10);
        let values: Vec<_> = ring.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 10, 20]);
    }

    #[test]
    fn uniform_write_touches_only_its_slot() {
        let device = Arc::new(HeadlessDevice::new());
        let ring: UniformRing<[f32; 4]> = UniformRing::new(device.clone(), "test").unwrap();
        let slot1 = FrameSlot::new(1).unwrap();
        ring.write(slot1, &[1.0, 2.0, 3.0, 4.0]).unwrap();

        for slot in FrameSlot::all() {
            let bytes = device.buffer_contents(ring.bind(slot)).unwrap();
            let values: [f32; 4] = bytemuck::pod_read_unaligned(&bytes);
            if slot == slot1 {
                assert_eq!(values, [1.0, 2.0, 3.0, 4.0]);
            } else {
                assert_eq!(values, [0.0; 4]);
            }
        }
    }

    #[test]
    fn uniform_ring_frees_buffers() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let _ring: UniformRing<[f32; 4]> = UniformRing::new(device.clone(), "test").unwrap();
            assert_eq!(device.live_objects(ObjectKind::Buffer), FRAMES_IN_FLIGHT);
        }
        assert_eq!(device.live_objects(ObjectKind::Buffer), 0);
    }
}
