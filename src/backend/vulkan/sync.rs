// Synchronization primitives
//
// The engine's fence is a timeline semaphore: one monotonically increasing
// u64 the queue signals and the CPU waits on, replacing per-frame VkFences.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::VulkanDevice;
use crate::gpu::{GpuFence, GpuResult};

pub struct VulkanFence {
    semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl VulkanFence {
    pub(super) fn new(device: Arc<VulkanDevice>, initial_value: u64) -> GpuResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }?;
        Ok(Self { semaphore, device })
    }

    /// Empty submission that sets the semaphore to `value` once everything
    /// submitted before it has finished.
    pub(super) fn enqueue_signal(&self, queue: vk::Queue, value: u64) -> GpuResult<()> {
        let signal_values = [value];
        let signal_semaphores = [self.semaphore];

        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
        }?;
        Ok(())
    }
}

impl GpuFence for VulkanFence {
    fn completed_value(&self) -> GpuResult<u64> {
        Ok(unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }?)
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> GpuResult<bool> {
        let timeout_ns = timeout
            .map(|t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(u64::MAX);

        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
