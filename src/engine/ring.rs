// Frame resource ring
//
// One slot per back buffer: the command allocator recorded into while that
// buffer is the render target, the back buffer itself, and the fence value
// that must be reached before either may be touched again.
//
// Slots are indexed by the swap chain's current back-buffer index, which the
// presentation layer picks. Never assume it equals frame_count % N.

use std::time::Duration;

use super::fence::{FenceSynchronizer, WaitStatus};
use crate::gpu::{Backend, CommandAllocator, CommandList, GpuDevice, GpuError, GpuResult};

pub struct FrameSlot<B: Backend> {
    allocator: B::CommandAllocator,
    back_buffer: Option<B::Resource>,
    /// Fence value of the last frame submitted from this slot
    fence_checkpoint: u64,
}

impl<B: Backend> FrameSlot<B> {
    pub fn allocator(&self) -> &B::CommandAllocator {
        &self.allocator
    }

    pub fn back_buffer(&self) -> Option<&B::Resource> {
        self.back_buffer.as_ref()
    }

    pub fn fence_checkpoint(&self) -> u64 {
        self.fence_checkpoint
    }
}

pub struct FrameRing<B: Backend> {
    slots: Vec<FrameSlot<B>>,
}

impl<B: Backend> FrameRing<B> {
    pub fn new(device: &B::Device, slot_count: usize) -> GpuResult<Self> {
        let slots = (0..slot_count)
            .map(|_| {
                Ok(FrameSlot {
                    allocator: device.create_command_allocator()?,
                    back_buffer: None,
                    fence_checkpoint: 0,
                })
            })
            .collect::<GpuResult<Vec<_>>>()?;

        log::debug!("Created frame ring with {} slots", slot_count);
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot for the back-buffer index reported by the swap chain.
    pub fn acquire(&self, index: usize) -> GpuResult<&FrameSlot<B>> {
        self.slots.get(index).ok_or_else(|| out_of_range(index, self.slots.len()))
    }

    fn acquire_mut(&mut self, index: usize) -> GpuResult<&mut FrameSlot<B>> {
        let len = self.slots.len();
        self.slots.get_mut(index).ok_or_else(|| out_of_range(index, len))
    }

    /// Waits for the slot's checkpoint, then resets its allocator and re-opens
    /// `list` on it. This is the only place an allocator is ever reset.
    ///
    /// On `TimedOut` nothing has been reset.
    pub fn prepare(
        &mut self,
        index: usize,
        fence: &mut FenceSynchronizer<B>,
        list: &mut B::CommandList,
        timeout: Option<Duration>,
    ) -> GpuResult<WaitStatus> {
        let slot = self.acquire(index)?;

        if fence.wait(slot.fence_checkpoint, timeout)? == WaitStatus::TimedOut {
            return Ok(WaitStatus::TimedOut);
        }

        slot.allocator.reset()?;
        list.reset(&slot.allocator)?;
        Ok(WaitStatus::Ready)
    }

    /// Records the fence value signaled for the frame just submitted from `index`.
    pub fn commit(&mut self, index: usize, value: u64) -> GpuResult<()> {
        let slot = self.acquire_mut(index)?;
        debug_assert!(value >= slot.fence_checkpoint, "fence checkpoints must not go backwards");
        slot.fence_checkpoint = value;
        Ok(())
    }

    pub fn attach_back_buffer(&mut self, index: usize, resource: B::Resource) -> GpuResult<()> {
        self.acquire_mut(index)?.back_buffer = Some(resource);
        Ok(())
    }

    /// Drops every back-buffer reference held by the ring.
    pub fn release_back_buffers(&mut self) {
        for slot in &mut self.slots {
            slot.back_buffer = None;
        }
    }

    /// Gives every slot the checkpoint of slot `from`.
    pub fn carry_checkpoints(&mut self, from: usize) -> GpuResult<()> {
        let checkpoint = self.acquire(from)?.fence_checkpoint;
        for slot in &mut self.slots {
            slot.fence_checkpoint = checkpoint;
        }
        Ok(())
    }
}

fn out_of_range(index: usize, len: usize) -> GpuError {
    GpuError::InvalidCall(format!("back-buffer index {} outside frame ring of {}", index, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{Headless, HeadlessConfig, HeadlessDevice};
    use crate::gpu::CommandQueue;

    #[test]
    fn acquire_rejects_index_outside_ring() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let ring = FrameRing::<Headless>::new(&device, 3).unwrap();
        assert!(ring.acquire(2).is_ok());
        assert!(matches!(ring.acquire(3), Err(GpuError::InvalidCall(_))));
    }

    #[test]
    fn prepare_never_resets_before_checkpoint_is_reached() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let queue = device.create_command_queue().unwrap();
        let mut fence = FenceSynchronizer::<Headless>::new(&device).unwrap();
        let mut ring = FrameRing::<Headless>::new(&device, 3).unwrap();
        let mut list = device.create_command_list(ring.acquire(0).unwrap().allocator()).unwrap();

        // Submit work from slot 0 while the GPU is held back.
        queue.pause();
        assert!(ring.prepare(0, &mut fence, &mut list, None).unwrap().is_ready());
        list.close().unwrap();
        queue.execute(&list).unwrap();
        let value = fence.signal(&queue).unwrap();
        ring.commit(0, value).unwrap();

        let resets_before = ring.acquire(0).unwrap().allocator().reset_count();
        let status = ring
            .prepare(0, &mut fence, &mut list, Some(Duration::from_millis(15)))
            .unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
        assert_eq!(ring.acquire(0).unwrap().allocator().reset_count(), resets_before);

        queue.resume();
        assert!(ring.prepare(0, &mut fence, &mut list, None).unwrap().is_ready());
        assert!(fence.completed_value().unwrap() >= value);
        assert_eq!(ring.acquire(0).unwrap().allocator().reset_count(), resets_before + 1);
    }

    #[test]
    fn delayed_completion_never_races_a_reset() {
        let device = HeadlessDevice::new(HeadlessConfig {
            gpu_latency: Duration::from_millis(3),
            ..HeadlessConfig::default()
        });
        let queue = device.create_command_queue().unwrap();
        let mut fence = FenceSynchronizer::<Headless>::new(&device).unwrap();
        let mut ring = FrameRing::<Headless>::new(&device, 3).unwrap();
        let mut list = device.create_command_list(ring.acquire(0).unwrap().allocator()).unwrap();

        // The headless allocator refuses a reset while its lists are in flight,
        // so any premature reuse surfaces as an error here.
        for frame in 0..12usize {
            let index = (frame * 2) % 3;
            ring.prepare(index, &mut fence, &mut list, None).unwrap();
            list.close().unwrap();
            queue.execute(&list).unwrap();
            let value = fence.signal(&queue).unwrap();
            ring.commit(index, value).unwrap();
        }

        fence.flush(&queue).unwrap();
    }

    #[test]
    fn carry_checkpoints_copies_the_current_slot() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut ring = FrameRing::<Headless>::new(&device, 3).unwrap();
        ring.commit(0, 4).unwrap();
        ring.commit(1, 5).unwrap();
        ring.commit(2, 6).unwrap();

        ring.carry_checkpoints(1).unwrap();
        for index in 0..3 {
            assert_eq!(ring.acquire(index).unwrap().fence_checkpoint(), 5);
        }
    }
}
