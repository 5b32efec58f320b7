// Vulkan backend
//
// How the engine's objects map onto Vulkan 1.3:
// ┌──────────────────────┬─────────────────────────────────────────────┐
// │  fence               │  timeline semaphore                         │
// │  command allocator   │  transient command pool + 1 command buffer  │
// │  back buffer         │  swapchain image                            │
// │  RTV heap            │  array of image views (increment 1)         │
// │  clear               │  dynamic rendering with LOAD_OP_CLEAR       │
// │  tearing present     │  IMMEDIATE present mode                     │
// └──────────────────────┴─────────────────────────────────────────────┘

mod command;
mod device;
mod instance;
mod swapchain;
mod sync;

use std::sync::Arc;

use crate::gpu::Backend;

pub use command::{VulkanAllocator, VulkanCommandList, VulkanRtvHeap};
pub use device::{VulkanDevice, VulkanQueue};
pub use instance::{VulkanAdapter, VulkanInstance, VulkanSurface};
pub use swapchain::{VulkanBuffer, VulkanSwapChain};
pub use sync::VulkanFence;

pub struct Vulkan;

impl Backend for Vulkan {
    type Device = Arc<VulkanDevice>;
    type Queue = VulkanQueue;
    type Fence = VulkanFence;
    type CommandAllocator = VulkanAllocator;
    type CommandList = VulkanCommandList;
    type Resource = VulkanBuffer;
    type SwapChain = VulkanSwapChain;
    type DescriptorHeap = VulkanRtvHeap;
    type Surface = VulkanSurface;
}
