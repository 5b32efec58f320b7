// Vulkan Instance - loader, surface and adapter enumeration
//
// Responsibilities:
// - Instance creation with the surface extensions the window needs
// - Validation layer + debug messenger (routed into `log`)
// - Surface creation from raw window handles
// - Adapter enumeration and the trial device probe

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::device::{self, VulkanDevice};
use super::Vulkan;
use crate::gpu::{AdapterInfo, AdapterSource, GpuError, GpuResult, Instance};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Owns the loader and the instance. Moves into the device it creates.
pub struct VulkanInstance {
    // Field order matters for drop: the messenger goes before the instance
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub(super) surface_loader: khr::Surface,
    pub(super) instance: ash::Instance,
    pub(super) entry: Entry,

    validation: bool,
    /// Surface the probe checks presentation support against
    surface: Option<vk::SurfaceKHR>,
}

/// Window surface handed to the swap chain, which takes ownership.
pub struct VulkanSurface {
    pub(super) surface: vk::SurfaceKHR,
}

/// Physical device handle as enumerated.
#[derive(Debug, Clone, Copy)]
pub struct VulkanAdapter {
    pub(super) physical_device: vk::PhysicalDevice,
}

impl VulkanInstance {
    /// Create the instance with the surface extensions required by `display`.
    ///
    /// `validation` enables the Khronos validation layer and the debug-utils
    /// extension. The messenger itself is installed by `enable_debug_layer`.
    pub fn new(app_name: &str, display: RawDisplayHandle, validation: bool) -> GpuResult<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }?;

        // Step 2: Pick extensions and layers
        let mut extensions = vec![khr::Surface::name().as_ptr()];
        extensions.push(surface_extension(display)?);

        let validation = validation && Self::validation_layer_available(&entry)?;
        let layer_names: Vec<*const c_char> = if validation {
            extensions.push(DebugUtils::name().as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Step 3: Create instance
        let app_name_cstr = CString::new(app_name)
            .map_err(|_| GpuError::InvalidCall("application name contains a NUL byte".into()))?;
        let engine_name = c"frame-ring";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;
        let surface_loader = khr::Surface::new(&entry, &instance);

        Ok(Self {
            debug_utils: None,
            surface_loader,
            instance,
            entry,
            validation,
            surface: None,
        })
    }

    fn validation_layer_available(entry: &Entry) -> GpuResult<bool> {
        let layers = entry.enumerate_instance_layer_properties()?;
        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if !found {
            log::warn!("Validation layer requested but not installed, continuing without it");
        }
        Ok(found)
    }

    /// Create a surface for a window. Adapters that cannot present to it
    /// fail the probe from here on.
    pub fn create_surface(
        &mut self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> GpuResult<VulkanSurface> {
        let surface = unsafe { self.create_platform_surface(display, window) }?;
        self.surface = Some(surface);
        Ok(VulkanSurface { surface })
    }

    unsafe fn create_platform_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> GpuResult<vk::SurfaceKHR> {
        match (display, window) {
            #[cfg(target_os = "windows")]
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(hwnd);
                let loader = khr::Win32Surface::new(&self.entry, &self.instance);
                Ok(loader.create_win32_surface(&create_info, None)?)
            }

            #[cfg(target_os = "linux")]
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let dpy = display
                    .display
                    .ok_or_else(|| GpuError::Surface("Xlib display handle is missing".into()))?;
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.as_ptr() as *mut vk::Display)
                    .window(handle.window);
                let loader = khr::XlibSurface::new(&self.entry, &self.instance);
                Ok(loader.create_xlib_surface(&create_info, None)?)
            }

            #[cfg(target_os = "linux")]
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr())
                    .surface(handle.surface.as_ptr());
                let loader = khr::WaylandSurface::new(&self.entry, &self.instance);
                Ok(loader.create_wayland_surface(&create_info, None)?)
            }

            _ => Err(GpuError::Surface("unsupported window handle type".into())),
        }
    }

    fn adapter_info(&self, physical_device: vk::PhysicalDevice) -> AdapterInfo {
        let props = unsafe { self.instance.get_physical_device_properties(physical_device) };
        let memory = unsafe { self.instance.get_physical_device_memory_properties(physical_device) };

        // Dedicated memory = every device-local heap
        let dedicated_video_memory = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        AdapterInfo {
            name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            dedicated_video_memory,
            is_software: props.device_type == vk::PhysicalDeviceType::CPU,
        }
    }

    /// Graphics queue family that can also present to the surface, if any.
    pub(super) fn find_queue_family(&self, physical_device: vk::PhysicalDevice) -> Option<u32> {
        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(physical_device)
        };

        families
            .iter()
            .enumerate()
            .filter(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i as u32)
            .find(|&family| match self.surface {
                Some(surface) => unsafe {
                    self.surface_loader
                        .get_physical_device_surface_support(physical_device, family, surface)
                        .unwrap_or(false)
                },
                None => true,
            })
    }

    fn supports_required_features(&self, physical_device: vk::PhysicalDevice) -> bool {
        let props = unsafe { self.instance.get_physical_device_properties(physical_device) };
        if props.api_version < vk::API_VERSION_1_3 {
            return false;
        }

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut features12)
                .push_next(&mut features13);
            unsafe {
                self.instance
                    .get_physical_device_features2(physical_device, &mut features2)
            };
        }

        features12.timeline_semaphore == vk::TRUE && features13.dynamic_rendering == vk::TRUE
    }

    pub(super) fn debug_layer_enabled(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// =============================================================================
// ADAPTERS
// =============================================================================

impl AdapterSource for VulkanInstance {
    type Adapter = VulkanAdapter;

    fn enumerate_adapters(&self) -> GpuResult<Vec<(AdapterInfo, VulkanAdapter)>> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }?;
        Ok(devices
            .into_iter()
            .map(|physical_device| (self.adapter_info(physical_device), VulkanAdapter { physical_device }))
            .collect())
    }

    /// A device could be created if the adapter speaks Vulkan 1.3, has the
    /// timeline and dynamic rendering features and a queue that can present.
    fn probe(&self, adapter: &VulkanAdapter) -> bool {
        self.supports_required_features(adapter.physical_device)
            && self.find_queue_family(adapter.physical_device).is_some()
    }
}

impl Instance<Vulkan> for VulkanInstance {
    fn enable_debug_layer(&mut self) -> GpuResult<()> {
        if self.debug_utils.is_some() {
            return Ok(());
        }
        if !self.validation {
            log::warn!("Debug layer requested but validation is not enabled on this instance");
            return Ok(());
        }

        let debug_utils = DebugUtils::new(&self.entry, &self.instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;
        self.debug_utils = Some((debug_utils, messenger));
        log::info!("Vulkan validation messages routed to the log");
        Ok(())
    }

    fn create_device(self, adapter: VulkanAdapter) -> GpuResult<Arc<VulkanDevice>> {
        device::create(self, adapter.physical_device)
    }
}

fn surface_extension(display: RawDisplayHandle) -> GpuResult<*const c_char> {
    match display {
        #[cfg(target_os = "windows")]
        RawDisplayHandle::Windows(_) => Ok(khr::Win32Surface::name().as_ptr()),
        #[cfg(target_os = "linux")]
        RawDisplayHandle::Xlib(_) => Ok(khr::XlibSurface::name().as_ptr()),
        #[cfg(target_os = "linux")]
        RawDisplayHandle::Wayland(_) => Ok(khr::WaylandSurface::name().as_ptr()),
        _ => Err(GpuError::Surface("platform not supported".into())),
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
