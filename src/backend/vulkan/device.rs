// Vulkan Device - logical device and the graphics queue
//
// Responsibilities:
// - Logical device with timeline semaphores and dynamic rendering enabled
// - Factory for every object the frame engine asks for
// - Queue submission, chained to the swap chain's acquire/present semaphores

use ash::extensions::khr;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

use super::command::{VulkanAllocator, VulkanCommandList, VulkanRtvHeap};
use super::instance::{VulkanInstance, VulkanSurface};
use super::swapchain::{VulkanBuffer, VulkanSwapChain};
use super::sync::VulkanFence;
use super::Vulkan;
use crate::gpu::{
    CommandQueue, CpuDescriptorHandle, GpuDevice, GpuError, GpuResult, SwapChainDesc,
};

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue_family: u32,
    pub properties: vk::PhysicalDeviceProperties,

    // Dropped after the logical device
    pub(super) instance: VulkanInstance,
}

/// Step 5 of provisioning: create the logical device on the chosen adapter.
pub(super) fn create(
    instance: VulkanInstance,
    physical_device: vk::PhysicalDevice,
) -> GpuResult<Arc<VulkanDevice>> {
    let graphics_queue_family = instance
        .find_queue_family(physical_device)
        .ok_or(GpuError::NoSuitableAdapter)?;

    let queue_priorities = [1.0];
    let queue_create_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(&queue_priorities)
        .build();

    let extensions = [khr::Swapchain::name().as_ptr()];

    // Timeline semaphores back the fence, dynamic rendering backs the clear
    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
        .timeline_semaphore(true)
        .build();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .dynamic_rendering(true)
        .build();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extensions)
        .push_next(&mut features12)
        .push_next(&mut features13);

    let device = unsafe {
        instance
            .instance
            .create_device(physical_device, &create_info, None)
    }?;

    let properties = unsafe {
        instance
            .instance
            .get_physical_device_properties(physical_device)
    };

    log::info!(
        "Selected GPU: {}",
        unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
    );
    log::info!(
        "API Version: {}.{}.{}",
        vk::api_version_major(properties.api_version),
        vk::api_version_minor(properties.api_version),
        vk::api_version_patch(properties.api_version)
    );
    if instance.debug_layer_enabled() {
        log::info!("Validation layer active");
    }

    Ok(Arc::new(VulkanDevice {
        device,
        physical_device,
        graphics_queue_family,
        properties,
        instance,
    }))
}

impl VulkanDevice {
    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    pub(super) fn surface_loader(&self) -> &khr::Surface {
        &self.instance.surface_loader
    }

    pub(super) fn ash_instance(&self) -> &ash::Instance {
        &self.instance.instance
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::warn!("wait_idle during teardown failed: {}", e);
        }
        unsafe {
            self.device.destroy_device(None);
        }
        // `instance` drops next: debug messenger, then the instance itself
    }
}

impl GpuDevice<Vulkan> for Arc<VulkanDevice> {
    fn create_command_queue(&self) -> GpuResult<VulkanQueue> {
        let queue = unsafe { self.device.get_device_queue(self.graphics_queue_family, 0) };
        Ok(VulkanQueue {
            device: self.clone(),
            queue,
            link: Arc::new(Mutex::new(PresentLink::default())),
        })
    }

    fn create_fence(&self, initial_value: u64) -> GpuResult<VulkanFence> {
        VulkanFence::new(self.clone(), initial_value)
    }

    fn create_command_allocator(&self) -> GpuResult<VulkanAllocator> {
        VulkanAllocator::new(self.clone())
    }

    fn create_command_list(&self, allocator: &VulkanAllocator) -> GpuResult<VulkanCommandList> {
        Ok(VulkanCommandList::new(self.clone(), allocator))
    }

    fn create_rtv_heap(&self, descriptor_count: usize) -> GpuResult<VulkanRtvHeap> {
        Ok(VulkanRtvHeap::new(self.clone(), descriptor_count))
    }

    /// Views live in a plain array, one slot per handle step
    fn rtv_descriptor_increment(&self) -> usize {
        1
    }

    fn create_render_target_view(
        &self,
        resource: &VulkanBuffer,
        heap: &mut VulkanRtvHeap,
        handle: CpuDescriptorHandle,
    ) -> GpuResult<()> {
        heap.write(handle, resource)
    }

    fn create_swap_chain(
        &self,
        queue: &VulkanQueue,
        surface: VulkanSurface,
        desc: &SwapChainDesc,
    ) -> GpuResult<VulkanSwapChain> {
        VulkanSwapChain::new(self.clone(), queue, surface, desc)
    }
}

// =============================================================================
// QUEUE
// =============================================================================

/// Semaphores that tie the next submission to the acquired swap chain image.
#[derive(Debug, Default)]
pub(super) struct PresentLink {
    /// Signaled by the acquire, waited on by the next submission
    pub acquire: Option<vk::Semaphore>,
    /// Signaled by the next submission
    pub render_finished: Option<vk::Semaphore>,
    /// Signaled by a submission, waited on by the present
    pub pending_present: Option<vk::Semaphore>,
}

pub struct VulkanQueue {
    pub(super) device: Arc<VulkanDevice>,
    pub(super) queue: vk::Queue,
    pub(super) link: Arc<Mutex<PresentLink>>,
}

impl CommandQueue<Vulkan> for VulkanQueue {
    fn execute(&self, list: &VulkanCommandList) -> GpuResult<()> {
        if list.is_open() {
            return Err(GpuError::InvalidCall("executing a command list that is still open".into()));
        }

        let mut link = self.link.lock();
        let acquire = link.acquire.take();
        let render_finished = link.render_finished.take();

        let stage_mask = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let (wait_semaphores, wait_stages): (&[vk::Semaphore], &[vk::PipelineStageFlags]) = match &acquire {
            Some(semaphore) => (std::slice::from_ref(semaphore), &stage_mask),
            None => (&[], &[]),
        };
        let signal_semaphores: &[vk::Semaphore] = match &render_finished {
            Some(semaphore) => std::slice::from_ref(semaphore),
            None => &[],
        };
        let command_buffers = [list.command_buffer()];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
        }?;

        if render_finished.is_some() {
            link.pending_present = render_finished;
        }
        Ok(())
    }

    fn signal(&self, fence: &VulkanFence, value: u64) -> GpuResult<()> {
        fence.enqueue_signal(self.queue, value)
    }
}
