// Headless backend - software GPU timeline
//
// Runs the frame engine without a window or a graphics driver. Submissions go
// to a worker thread that completes them in order after a configurable
// latency. The objects validate their use the way a debug layer would:
// resetting an allocator with work in flight, executing an open list, or a
// barrier whose before-state does not match are all errors.

mod swapchain;
mod timeline;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::gpu::{
    AdapterInfo, AdapterSource, Backend, CommandAllocator, CommandList, CommandQueue,
    CpuDescriptorHandle, DescriptorHeap, GpuDevice, GpuError, GpuFence, GpuResult, Instance,
    ResourceState, SwapChainDesc,
};
use crate::sync::CompletionEvent;
use timeline::{AllocatorState, GpuTimeline, Work};

pub use swapchain::{BufferOrder, HeadlessBuffer, HeadlessSurface, HeadlessSwapChain, PRESENT_HISTORY};

/// Arbitrary non-zero start so handle arithmetic is visible in tests
const RTV_HEAP_BASE: usize = 0x1000;

pub struct Headless;

impl Backend for Headless {
    type Device = HeadlessDevice;
    type Queue = HeadlessQueue;
    type Fence = HeadlessFence;
    type CommandAllocator = HeadlessAllocator;
    type CommandList = HeadlessCommandList;
    type Resource = HeadlessBuffer;
    type SwapChain = HeadlessSwapChain;
    type DescriptorHeap = HeadlessRtvHeap;
    type Surface = HeadlessSurface;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessConfig {
    /// Time the timeline spends on each executed command list
    pub gpu_latency: Duration,
    pub tearing_supported: bool,
    pub rtv_increment: usize,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            gpu_latency: Duration::ZERO,
            tearing_supported: true,
            rtv_increment: 32,
        }
    }
}

// =============================================================================
// INSTANCE
// =============================================================================

#[derive(Debug, Clone)]
pub struct HeadlessAdapter {
    pub info: AdapterInfo,
    /// Result of the trial device creation
    pub probe_succeeds: bool,
}

pub struct HeadlessInstance {
    adapters: Vec<HeadlessAdapter>,
    config: HeadlessConfig,
    debug_layer: bool,
}

impl HeadlessInstance {
    /// One hardware-like timeline adapter and one software adapter.
    pub fn new(config: HeadlessConfig) -> Self {
        Self::with_adapters(
            config,
            vec![
                HeadlessAdapter {
                    info: AdapterInfo {
                        name: "Headless Timeline GPU".into(),
                        dedicated_video_memory: 1 << 30,
                        is_software: false,
                    },
                    probe_succeeds: true,
                },
                HeadlessAdapter {
                    info: AdapterInfo {
                        name: "Headless Software Rasterizer".into(),
                        dedicated_video_memory: 0,
                        is_software: true,
                    },
                    probe_succeeds: true,
                },
            ],
        )
    }

    pub fn with_adapters(config: HeadlessConfig, adapters: Vec<HeadlessAdapter>) -> Self {
        Self {
            adapters,
            config,
            debug_layer: false,
        }
    }
}

impl AdapterSource for HeadlessInstance {
    type Adapter = usize;

    fn enumerate_adapters(&self) -> GpuResult<Vec<(AdapterInfo, usize)>> {
        Ok(self
            .adapters
            .iter()
            .enumerate()
            .map(|(i, adapter)| (adapter.info.clone(), i))
            .collect())
    }

    fn probe(&self, adapter: &usize) -> bool {
        self.adapters.get(*adapter).is_some_and(|a| a.probe_succeeds)
    }
}

impl Instance<Headless> for HeadlessInstance {
    fn enable_debug_layer(&mut self) -> GpuResult<()> {
        self.debug_layer = true;
        log::debug!("Headless debug layer enabled");
        Ok(())
    }

    fn create_device(self, adapter: usize) -> GpuResult<HeadlessDevice> {
        let info = self
            .adapters
            .get(adapter)
            .map(|a| a.info.clone())
            .ok_or(GpuError::NoSuitableAdapter)?;

        Ok(HeadlessDevice {
            config: self.config,
            adapter: info,
            debug_layer: self.debug_layer,
        })
    }
}

// =============================================================================
// DEVICE
// =============================================================================

pub struct HeadlessDevice {
    config: HeadlessConfig,
    adapter: AdapterInfo,
    debug_layer: bool,
}

impl HeadlessDevice {
    /// Device on the default timeline adapter, skipping provisioning.
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            adapter: AdapterInfo {
                name: "Headless Timeline GPU".into(),
                dedicated_video_memory: 1 << 30,
                is_software: false,
            },
            debug_layer: false,
        }
    }

    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn debug_layer_enabled(&self) -> bool {
        self.debug_layer
    }
}

impl GpuDevice<Headless> for HeadlessDevice {
    fn create_command_queue(&self) -> GpuResult<HeadlessQueue> {
        Ok(HeadlessQueue {
            timeline: GpuTimeline::spawn()?,
            latency: self.config.gpu_latency,
        })
    }

    fn create_fence(&self, initial_value: u64) -> GpuResult<HeadlessFence> {
        Ok(HeadlessFence {
            completed: Arc::new(CompletionEvent::new(initial_value)),
        })
    }

    fn create_command_allocator(&self) -> GpuResult<HeadlessAllocator> {
        Ok(HeadlessAllocator {
            state: Arc::new(AllocatorState::default()),
        })
    }

    fn create_command_list(&self, allocator: &HeadlessAllocator) -> GpuResult<HeadlessCommandList> {
        Ok(HeadlessCommandList {
            allocator: allocator.state.clone(),
            open: false,
            commands: Vec::new(),
            error: None,
        })
    }

    fn create_rtv_heap(&self, descriptor_count: usize) -> GpuResult<HeadlessRtvHeap> {
        Ok(HeadlessRtvHeap {
            start: RTV_HEAP_BASE,
            increment: self.config.rtv_increment,
            views: vec![None; descriptor_count],
        })
    }

    fn rtv_descriptor_increment(&self) -> usize {
        self.config.rtv_increment
    }

    fn create_render_target_view(
        &self,
        resource: &HeadlessBuffer,
        heap: &mut HeadlessRtvHeap,
        handle: CpuDescriptorHandle,
    ) -> GpuResult<()> {
        let slot = heap.slot(handle)?;
        heap.views[slot] = Some(resource.clone());
        Ok(())
    }

    fn create_swap_chain(
        &self,
        _queue: &HeadlessQueue,
        surface: HeadlessSurface,
        desc: &SwapChainDesc,
    ) -> GpuResult<HeadlessSwapChain> {
        HeadlessSwapChain::new(desc, surface, self.config.tearing_supported)
    }
}

// =============================================================================
// QUEUE AND FENCE
// =============================================================================

pub struct HeadlessQueue {
    timeline: GpuTimeline,
    latency: Duration,
}

impl HeadlessQueue {
    /// Holds all submitted work until `resume`.
    pub fn pause(&self) {
        self.timeline.set_paused(true);
    }

    pub fn resume(&self) {
        self.timeline.set_paused(false);
    }
}

impl CommandQueue<Headless> for HeadlessQueue {
    fn execute(&self, list: &HeadlessCommandList) -> GpuResult<()> {
        if list.open {
            return Err(GpuError::InvalidCall("executing a command list that is still open".into()));
        }
        list.allocator.in_flight.fetch_add(1, Ordering::AcqRel);
        self.timeline.submit(Work::Execute {
            allocator: list.allocator.clone(),
            cost: self.latency,
        })
    }

    fn signal(&self, fence: &HeadlessFence, value: u64) -> GpuResult<()> {
        self.timeline.submit(Work::Signal {
            fence: fence.completed.clone(),
            value,
        })
    }
}

/// Clones share one completion value, like references to the same fence.
#[derive(Clone)]
pub struct HeadlessFence {
    completed: Arc<CompletionEvent<u64>>,
}

impl GpuFence for HeadlessFence {
    fn completed_value(&self) -> GpuResult<u64> {
        Ok(self.completed.read(|v| *v))
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> GpuResult<bool> {
        Ok(self.completed.wait_until(|completed| *completed >= value, timeout))
    }
}

// =============================================================================
// COMMAND RECORDING
// =============================================================================

pub struct HeadlessAllocator {
    state: Arc<AllocatorState>,
}

impl HeadlessAllocator {
    pub fn reset_count(&self) -> u64 {
        self.state.resets.load(Ordering::Acquire)
    }
}

impl CommandAllocator for HeadlessAllocator {
    fn reset(&self) -> GpuResult<()> {
        let in_flight = self.state.in_flight.load(Ordering::Acquire);
        if in_flight > 0 {
            return Err(GpuError::ResourceInUse(format!(
                "command allocator reset with {} submission(s) still executing",
                in_flight
            )));
        }
        self.state.resets.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// A recorded command, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Transition {
        buffer_index: usize,
        before: ResourceState,
        after: ResourceState,
    },
    Clear {
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    },
}

pub struct HeadlessCommandList {
    allocator: Arc<AllocatorState>,
    open: bool,
    commands: Vec<RecordedCommand>,
    /// First validation failure, reported on close
    error: Option<String>,
}

impl HeadlessCommandList {
    pub fn recorded(&self) -> &[RecordedCommand] {
        &self.commands
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }
}

impl CommandList<Headless> for HeadlessCommandList {
    fn reset(&mut self, allocator: &HeadlessAllocator) -> GpuResult<()> {
        if self.open {
            return Err(GpuError::InvalidCall("command list reset while still recording".into()));
        }
        self.allocator = allocator.state.clone();
        self.open = true;
        self.commands.clear();
        self.error = None;
        Ok(())
    }

    fn transition(&mut self, resource: &HeadlessBuffer, before: ResourceState, after: ResourceState) {
        if !self.open {
            self.fail("barrier recorded on a closed command list".into());
            return;
        }
        if resource.state() != before {
            self.fail(format!(
                "barrier on back buffer {} expects {:?} but it is {:?}",
                resource.index(),
                before,
                resource.state()
            ));
            return;
        }
        resource.set_state(after);
        self.commands.push(RecordedCommand::Transition {
            buffer_index: resource.index(),
            before,
            after,
        });
    }

    fn clear_render_target(&mut self, heap: &HeadlessRtvHeap, rtv: CpuDescriptorHandle, color: [f32; 4]) {
        if !self.open {
            self.fail("clear recorded on a closed command list".into());
            return;
        }
        match heap.slot(rtv) {
            Ok(slot) if heap.views[slot].is_some() => {
                self.commands.push(RecordedCommand::Clear { rtv, color });
            }
            _ => self.fail(format!("clear through invalid descriptor {:#x}", rtv.0)),
        }
    }

    fn close(&mut self) -> GpuResult<()> {
        if !self.open {
            return Err(GpuError::InvalidCall("closing a command list that is not open".into()));
        }
        self.open = false;
        match self.error.take() {
            Some(message) => Err(GpuError::InvalidCall(message)),
            None => Ok(()),
        }
    }
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// What a render-target view points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessView {
    pub generation: u64,
    pub buffer_index: usize,
}

/// Each written view holds its back buffer, as a real view keeps the
/// underlying resource alive.
pub struct HeadlessRtvHeap {
    start: usize,
    increment: usize,
    views: Vec<Option<HeadlessBuffer>>,
}

impl HeadlessRtvHeap {
    pub fn view(&self, slot: usize) -> Option<HeadlessView> {
        self.views.get(slot).and_then(Option::as_ref).map(|buffer| HeadlessView {
            generation: buffer.generation(),
            buffer_index: buffer.index(),
        })
    }

    fn slot(&self, handle: CpuDescriptorHandle) -> GpuResult<usize> {
        let slot = handle
            .0
            .checked_sub(self.start)
            .filter(|offset| offset.checked_rem(self.increment) == Some(0))
            .and_then(|offset| offset.checked_div(self.increment))
            .ok_or_else(|| GpuError::InvalidCall(format!("descriptor {:#x} not in heap", handle.0)))?;

        if slot >= self.views.len() {
            return Err(GpuError::InvalidCall(format!("descriptor {:#x} past end of heap", handle.0)));
        }
        Ok(slot)
    }
}

impl DescriptorHeap for HeadlessRtvHeap {
    fn cpu_handle_start(&self) -> CpuDescriptorHandle {
        CpuDescriptorHandle(self.start)
    }

    fn descriptor_count(&self) -> usize {
        self.views.len()
    }

    fn release_views(&mut self) {
        self.views.iter_mut().for_each(|view| *view = None);
    }
}
