// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Images are acquired lazily: the first `current_back_buffer_index` after a
// present acquires the next image and arms the queue's present link, so the
// next submission waits for the image and signals the present.

use ash::extensions::khr;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use super::device::{PresentLink, VulkanQueue};
use super::instance::VulkanSurface;
use super::{Vulkan, VulkanDevice};
use crate::gpu::{GpuError, GpuResult, PresentRequest, SwapChain, SwapChainDesc};

/// Swap chain image handle. Views are created by the RTV heap.
#[derive(Debug, Clone, Copy)]
pub struct VulkanBuffer {
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl VulkanBuffer {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

pub struct VulkanSwapChain {
    swapchain: vk::SwapchainKHR,
    swapchain_loader: khr::Swapchain,
    surface: vk::SurfaceKHR,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    requested_count: u32,

    present_mode: vk::PresentModeKHR,
    /// Mode the last present asked for; differs from `present_mode` until rebuilt
    wanted_mode: vk::PresentModeKHR,
    available_modes: Vec<vk::PresentModeKHR>,
    needs_rebuild: bool,

    // One more acquire semaphore than images, so a semaphore is never reused
    // while its previous acquire might still be pending
    acquire_semaphores: Vec<vk::Semaphore>,
    next_acquire: usize,
    render_finished: Vec<vk::Semaphore>,
    acquired: Option<u32>,

    queue: vk::Queue,
    link: Arc<Mutex<PresentLink>>,
    device: Arc<VulkanDevice>,
}

impl VulkanSwapChain {
    pub(super) fn new(
        device: Arc<VulkanDevice>,
        queue: &VulkanQueue,
        surface: VulkanSurface,
        desc: &SwapChainDesc,
    ) -> GpuResult<Self> {
        let surface = surface.surface;
        let surface_loader = device.surface_loader();

        // Query supported formats
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }?;
        // Choose surface format (prefer SRGB)
        let format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or_else(|| GpuError::Surface("no surface formats".into()))?;

        // Query supported present modes
        let available_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(device.physical_device, surface)
        }?;
        let tearing_supported = available_modes.contains(&vk::PresentModeKHR::IMMEDIATE);
        let present_mode = choose_present_mode(
            &available_modes,
            PresentRequest::new(desc.vsync, tearing_supported),
        );

        let swapchain_loader = khr::Swapchain::new(device.ash_instance(), &device.device);

        let mut chain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            surface,
            images: Vec::new(),
            format,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            requested_count: desc.buffer_count as u32,
            present_mode,
            wanted_mode: present_mode,
            available_modes,
            needs_rebuild: false,
            acquire_semaphores: Vec::new(),
            next_acquire: 0,
            render_finished: Vec::new(),
            acquired: None,
            queue: queue.queue,
            link: queue.link.clone(),
            device,
        };
        chain.create(desc.width, desc.height)?;
        Ok(chain)
    }

    /// Creates (or re-creates, retiring the old one) the swapchain at this size.
    fn create(&mut self, width: u32, height: u32) -> GpuResult<()> {
        let device = self.device.clone();

        // Query surface capabilities
        let caps = unsafe {
            device
                .surface_loader()
                .get_physical_device_surface_capabilities(device.physical_device, self.surface)
        }?;

        // Choose extent
        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let mut image_count = self.requested_count.max(caps.min_image_count);
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.wanted_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?;
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;
        self.images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?;
        self.extent = extent;
        self.present_mode = self.wanted_mode;
        self.needs_rebuild = false;
        self.acquired = None;

        self.recreate_semaphores()?;

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            self.present_mode
        );
        Ok(())
    }

    fn recreate_semaphores(&mut self) -> GpuResult<()> {
        self.destroy_semaphores();

        let info = vk::SemaphoreCreateInfo::builder();
        for _ in 0..=self.images.len() {
            let semaphore = unsafe { self.device.device.create_semaphore(&info, None) }?;
            self.acquire_semaphores.push(semaphore);
        }
        for _ in 0..self.images.len() {
            let semaphore = unsafe { self.device.device.create_semaphore(&info, None) }?;
            self.render_finished.push(semaphore);
        }
        self.next_acquire = 0;
        Ok(())
    }

    fn destroy_semaphores(&mut self) {
        unsafe {
            for semaphore in self.acquire_semaphores.drain(..).chain(self.render_finished.drain(..)) {
                self.device.device.destroy_semaphore(semaphore, None);
            }
        }
    }

    /// An acquired image whose semaphore no submission consumed yet would
    /// leave the semaphore signaled forever. Wait on it with an empty submit.
    fn consume_pending_acquire(&mut self) -> GpuResult<()> {
        let mut link = self.link.lock();
        link.render_finished = None;
        link.pending_present = None;
        let Some(semaphore) = link.acquire.take() else {
            return Ok(());
        };

        let wait_semaphores = [semaphore];
        let wait_stages = [vk::PipelineStageFlags::TOP_OF_PIPE];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        unsafe {
            self.device
                .device
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
        }?;
        Ok(())
    }
}

impl SwapChain<Vulkan> for VulkanSwapChain {
    fn buffer_count(&self) -> usize {
        self.images.len()
    }

    fn current_back_buffer_index(&mut self) -> GpuResult<usize> {
        if let Some(index) = self.acquired {
            return Ok(index as usize);
        }

        let semaphore = self.acquire_semaphores[self.next_acquire];
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        let index = match result {
            Ok((index, suboptimal)) => {
                // Suboptimal means swapchain still works but should be recreated
                if suboptimal {
                    self.needs_rebuild = true;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(GpuError::OutOfDate),
            Err(e) => return Err(e.into()),
        };

        self.next_acquire = (self.next_acquire + 1) % self.acquire_semaphores.len();
        self.acquired = Some(index);

        let mut link = self.link.lock();
        link.acquire = Some(semaphore);
        link.render_finished = Some(self.render_finished[index as usize]);
        Ok(index as usize)
    }

    fn get_buffer(&self, index: usize) -> GpuResult<VulkanBuffer> {
        let image = *self
            .images
            .get(index)
            .ok_or_else(|| GpuError::InvalidCall(format!("no swapchain image {}", index)))?;
        Ok(VulkanBuffer {
            image,
            format: self.format.format,
            extent: self.extent,
        })
    }

    fn resize_buffers(&mut self, width: u32, height: u32) -> GpuResult<()> {
        self.consume_pending_acquire()?;
        self.device.wait_idle()?;
        self.create(width, height)
    }

    fn present(&mut self, request: PresentRequest) -> GpuResult<()> {
        if request.allow_tearing && !self.tearing_supported() {
            return Err(GpuError::InvalidCall("tearing present without IMMEDIATE mode".into()));
        }
        let index = self
            .acquired
            .ok_or_else(|| GpuError::InvalidCall("present without an acquired image".into()))?;
        let wait = self
            .link
            .lock()
            .pending_present
            .take()
            .ok_or_else(|| GpuError::InvalidCall("present before the frame was submitted".into()))?;

        // Present mode is baked into the swapchain, a change needs a rebuild
        self.wanted_mode = choose_present_mode(&self.available_modes, request);
        if self.wanted_mode != self.present_mode {
            self.needs_rebuild = true;
        }

        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let image_indices = [index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(self.queue, &present_info) };
        self.acquired = None;

        match result {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_rebuild = true;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn tearing_supported(&self) -> bool {
        self.available_modes.contains(&vk::PresentModeKHR::IMMEDIATE)
    }

    fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }
}

impl Drop for VulkanSwapChain {
    fn drop(&mut self) {
        if let Err(e) = self.consume_pending_acquire().and_then(|_| self.device.wait_idle()) {
            log::warn!("Swapchain teardown wait failed: {}", e);
        }
        self.destroy_semaphores();
        unsafe {
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            self.device.surface_loader().destroy_surface(self.surface, None);
        }
    }
}

/// FIFO for vsync (always supported), IMMEDIATE when tearing is allowed,
/// MAILBOX for uncapped presents without tearing.
fn choose_present_mode(available: &[vk::PresentModeKHR], request: PresentRequest) -> vk::PresentModeKHR {
    let wanted = if request.sync_interval > 0 {
        vk::PresentModeKHR::FIFO
    } else if request.allow_tearing {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::MAILBOX
    };

    if available.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO
    }
}
