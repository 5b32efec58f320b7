// Command recording
//
// An allocator is a command pool with one primary command buffer. The engine's
// single command list re-binds to whichever allocator the frame slot owns, so
// resetting the pool frees exactly that slot's commands.

use ash::vk;
use std::sync::Arc;

use super::swapchain::VulkanBuffer;
use super::{Vulkan, VulkanDevice};
use crate::gpu::{
    CommandAllocator, CommandList, CpuDescriptorHandle, DescriptorHeap, GpuError, GpuResult,
    ResourceState,
};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub struct VulkanAllocator {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    device: Arc<VulkanDevice>,
}

impl VulkanAllocator {
    pub(super) fn new(device: Arc<VulkanDevice>) -> GpuResult<Self> {
        // TRANSIENT: recorded once per frame, reset as a whole
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        Ok(Self {
            pool,
            command_buffer,
            device,
        })
    }
}

impl CommandAllocator for VulkanAllocator {
    fn reset(&self) -> GpuResult<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
        }?;
        Ok(())
    }
}

impl Drop for VulkanAllocator {
    fn drop(&mut self) {
        // Also frees the command buffer
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

// =============================================================================
// COMMAND LIST
// =============================================================================

pub struct VulkanCommandList {
    device: Arc<VulkanDevice>,
    command_buffer: vk::CommandBuffer,
    open: bool,
}

impl VulkanCommandList {
    pub(super) fn new(device: Arc<VulkanDevice>, allocator: &VulkanAllocator) -> Self {
        Self {
            device,
            command_buffer: allocator.command_buffer,
            open: false,
        }
    }

    pub(super) fn is_open(&self) -> bool {
        self.open
    }

    pub(super) fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

impl CommandList<Vulkan> for VulkanCommandList {
    fn reset(&mut self, allocator: &VulkanAllocator) -> GpuResult<()> {
        if self.open {
            return Err(GpuError::InvalidCall("command list reset while still recording".into()));
        }

        self.command_buffer = allocator.command_buffer;
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .device
                .begin_command_buffer(self.command_buffer, &begin_info)
        }?;
        self.open = true;
        Ok(())
    }

    fn transition(&mut self, resource: &VulkanBuffer, before: ResourceState, after: ResourceState) {
        let (old_layout, src_stage, src_access) = match before {
            // The previous contents are never read, let the driver discard them
            ResourceState::Present => (
                vk::ImageLayout::UNDEFINED,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::empty(),
            ),
            ResourceState::RenderTarget => (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
        };
        let (new_layout, dst_stage, dst_access) = match after {
            ResourceState::Present => (
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
            ResourceState::RenderTarget => (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(resource.image())
            .subresource_range(COLOR_RANGE)
            .build();

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn clear_render_target(&mut self, heap: &VulkanRtvHeap, rtv: CpuDescriptorHandle, color: [f32; 4]) {
        let Some((view, extent)) = heap.view(rtv) else {
            log::error!("Clear through empty render target view {}", rtv.0);
            return;
        };

        let attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            })
            .build();

        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&attachment));

        unsafe {
            self.device
                .device
                .cmd_begin_rendering(self.command_buffer, &rendering_info);
            self.device.device.cmd_end_rendering(self.command_buffer);
        }
    }

    fn close(&mut self) -> GpuResult<()> {
        if !self.open {
            return Err(GpuError::InvalidCall("closing a command list that is not open".into()));
        }
        self.open = false;
        unsafe { self.device.device.end_command_buffer(self.command_buffer) }?;
        Ok(())
    }
}

// =============================================================================
// RENDER TARGET VIEWS
// =============================================================================

/// Image views indexed by handle, with the extent each one renders at.
pub struct VulkanRtvHeap {
    device: Arc<VulkanDevice>,
    views: Vec<Option<(vk::ImageView, vk::Extent2D)>>,
}

impl VulkanRtvHeap {
    pub(super) fn new(device: Arc<VulkanDevice>, descriptor_count: usize) -> Self {
        Self {
            device,
            views: vec![None; descriptor_count],
        }
    }

    /// Replaces the view at `handle` with a fresh view of `resource`.
    pub(super) fn write(&mut self, handle: CpuDescriptorHandle, resource: &VulkanBuffer) -> GpuResult<()> {
        let slot = self
            .views
            .get_mut(handle.0)
            .ok_or_else(|| GpuError::InvalidCall(format!("descriptor {} past end of heap", handle.0)))?;

        let create_info = vk::ImageViewCreateInfo::builder()
            .image(resource.image())
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(resource.format())
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(COLOR_RANGE);
        let view = unsafe { self.device.device.create_image_view(&create_info, None) }?;

        if let Some((old, _)) = slot.replace((view, resource.extent())) {
            unsafe { self.device.device.destroy_image_view(old, None) };
        }
        Ok(())
    }

    fn view(&self, handle: CpuDescriptorHandle) -> Option<(vk::ImageView, vk::Extent2D)> {
        self.views.get(handle.0).copied().flatten()
    }
}

impl DescriptorHeap for VulkanRtvHeap {
    fn cpu_handle_start(&self) -> CpuDescriptorHandle {
        CpuDescriptorHandle(0)
    }

    fn descriptor_count(&self) -> usize {
        self.views.len()
    }

    /// Destroys the views but keeps the slots, so `write` can fill them again.
    fn release_views(&mut self) {
        for slot in self.views.iter_mut() {
            if let Some((view, _)) = slot.take() {
                unsafe { self.device.device.destroy_image_view(view, None) };
            }
        }
    }
}

impl Drop for VulkanRtvHeap {
    fn drop(&mut self) {
        self.release_views();
    }
}
