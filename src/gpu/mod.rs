// GPU interface - what the frame engine needs from a graphics API
//
// The engine never talks to a graphics API directly. It drives these traits,
// and each backend (Vulkan, headless) maps them onto its own objects.
// The shape follows the explicit APIs: one queue, a monotonic fence, N command
// allocators, a swap chain with N back buffers and a fixed RTV heap.

pub mod error;

use std::time::Duration;

pub use error::{GpuError, GpuResult};

/// Ties together the object types of one backend.
pub trait Backend: Sized + 'static {
    type Device: GpuDevice<Self>;
    type Queue: CommandQueue<Self>;
    type Fence: GpuFence;
    type CommandAllocator: CommandAllocator;
    type CommandList: CommandList<Self>;
    /// A back buffer handle. Holding one keeps the buffer referenced.
    type Resource: Clone;
    type SwapChain: SwapChain<Self>;
    type DescriptorHeap: DescriptorHeap;
    /// Whatever the presentation layer needs to create a swap chain.
    type Surface;
}

// =============================================================================
// ADAPTERS
// =============================================================================

/// What the provisioner knows about a candidate adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    /// Dedicated video memory in bytes
    pub dedicated_video_memory: u64,
    /// Software rasterizer (WARP, lavapipe, ...)
    pub is_software: bool,
}

/// Enumerates adapters and probes whether a device could be created on them.
pub trait AdapterSource {
    type Adapter;

    fn enumerate_adapters(&self) -> GpuResult<Vec<(AdapterInfo, Self::Adapter)>>;

    /// Trial device-creation check. Must not leave a device behind.
    fn probe(&self, adapter: &Self::Adapter) -> bool;
}

/// API entry point: owns the loader and turns an adapter into a device.
pub trait Instance<B: Backend>: AdapterSource {
    /// Debug/validation hook, called before device creation.
    fn enable_debug_layer(&mut self) -> GpuResult<()>;

    fn create_device(self, adapter: Self::Adapter) -> GpuResult<B::Device>;
}

// =============================================================================
// DEVICE AND QUEUE
// =============================================================================

pub trait GpuDevice<B: Backend> {
    fn create_command_queue(&self) -> GpuResult<B::Queue>;

    fn create_fence(&self, initial_value: u64) -> GpuResult<B::Fence>;

    fn create_command_allocator(&self) -> GpuResult<B::CommandAllocator>;

    /// Creates a command list bound to `allocator`, returned closed.
    fn create_command_list(&self, allocator: &B::CommandAllocator) -> GpuResult<B::CommandList>;

    fn create_rtv_heap(&self, descriptor_count: usize) -> GpuResult<B::DescriptorHeap>;

    /// Distance between two consecutive RTV descriptors.
    fn rtv_descriptor_increment(&self) -> usize;

    fn create_render_target_view(
        &self,
        resource: &B::Resource,
        heap: &mut B::DescriptorHeap,
        handle: CpuDescriptorHandle,
    ) -> GpuResult<()>;

    /// Creates a swap chain that presents through `queue`.
    fn create_swap_chain(
        &self,
        queue: &B::Queue,
        surface: B::Surface,
        desc: &SwapChainDesc,
    ) -> GpuResult<B::SwapChain>;
}

/// Ordered submission channel. Work executes in submission order.
pub trait CommandQueue<B: Backend> {
    fn execute(&self, list: &B::CommandList) -> GpuResult<()>;

    /// Enqueues "set `fence` to `value`" behind everything already submitted.
    fn signal(&self, fence: &B::Fence, value: u64) -> GpuResult<()>;
}

/// GPU-side view of a monotonic counter.
pub trait GpuFence {
    fn completed_value(&self) -> GpuResult<u64>;

    /// Blocks until the completed value reaches `value`.
    ///
    /// `None` waits without bound. Returns `false` only when the timeout
    /// elapsed first.
    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> GpuResult<bool>;
}

pub trait CommandAllocator {
    /// Frees everything recorded from this allocator. The GPU must be done
    /// with all of it.
    fn reset(&self) -> GpuResult<()>;
}

/// Resource states the frame loop moves a back buffer through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Present,
    RenderTarget,
}

pub trait CommandList<B: Backend> {
    /// Re-opens the list for recording into `allocator`.
    fn reset(&mut self, allocator: &B::CommandAllocator) -> GpuResult<()>;

    fn transition(&mut self, resource: &B::Resource, before: ResourceState, after: ResourceState);

    fn clear_render_target(
        &mut self,
        heap: &B::DescriptorHeap,
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    );

    fn close(&mut self) -> GpuResult<()>;
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Address of a descriptor inside a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle(pub usize);

impl CpuDescriptorHandle {
    /// `self + index * increment`
    pub fn offset(self, index: usize, increment: usize) -> Self {
        Self(self.0 + index * increment)
    }
}

pub trait DescriptorHeap {
    fn cpu_handle_start(&self) -> CpuDescriptorHandle;

    fn descriptor_count(&self) -> usize;

    /// Drops every view so no descriptor keeps a back buffer alive.
    fn release_views(&mut self);
}

// =============================================================================
// SWAP CHAIN
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub buffer_count: usize,
    /// Vsync state the chain should be created for
    pub vsync: bool,
}

/// Sync interval and flags handed to `SwapChain::present`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentRequest {
    pub sync_interval: u32,
    pub allow_tearing: bool,
}

impl PresentRequest {
    /// Tearing is only requested when the driver supports it and vsync is off.
    pub fn new(vsync: bool, tearing_supported: bool) -> Self {
        Self {
            sync_interval: if vsync { 1 } else { 0 },
            allow_tearing: tearing_supported && !vsync,
        }
    }
}

pub trait SwapChain<B: Backend> {
    fn buffer_count(&self) -> usize;

    /// Index of the buffer the next frame renders into. Chosen by the
    /// presentation layer: it need not advance sequentially.
    fn current_back_buffer_index(&mut self) -> GpuResult<usize>;

    fn get_buffer(&self, index: usize) -> GpuResult<B::Resource>;

    /// Resizes the buffers in place, keeping count, format and flags.
    /// Every handle returned by `get_buffer` must have been dropped.
    fn resize_buffers(&mut self, width: u32, height: u32) -> GpuResult<()>;

    fn present(&mut self, request: PresentRequest) -> GpuResult<()>;

    /// Whether the presentation layer allows tearing presents.
    fn tearing_supported(&self) -> bool;

    /// Set when the buffers must be recreated before the next frame
    /// (suboptimal surface, present mode change).
    fn needs_rebuild(&self) -> bool {
        false
    }
}
