// Backend module - implementations of the GPU interface
//
// vulkan:   ash on Vulkan 1.3, used by the windowed application
// headless: software GPU timeline, used by tests and --headless runs

pub mod headless;
pub mod vulkan;

pub use headless::{Headless, HeadlessConfig, HeadlessDevice, HeadlessInstance};
pub use vulkan::{Vulkan, VulkanDevice, VulkanInstance};
