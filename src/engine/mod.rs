// =============================================================================
// FRAME ENGINE - CPU/GPU frame synchronization
// =============================================================================
//
// Drives one frame at a time through the swap chain while the GPU executes
// earlier frames asynchronously. The only coordination between the two is
// the fence: a slot's allocator and back buffer are reused only after the
// fence has passed the value signaled for that slot's previous frame.
//
// FRAME FLOW:
// ┌──────────────────────────────────────────────────────────────────────┐
// │  Idle ──prepare slot──> Recording ──close + execute──> Submitted     │
// │    ^                                                      │          │
// │    └──advance index── Presented <──present + signal───────┘          │
// └──────────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod adapter;
pub mod fence;
pub mod ring;
pub mod swapchain;

use std::time::{Duration, Instant};

use crate::gpu::{
    Backend, CommandList, CommandQueue, CpuDescriptorHandle, GpuDevice, GpuError, GpuResult,
    ResourceState,
};

pub use adapter::{provision, select_adapter, ProvisionOptions};
pub use fence::{FenceStats, FenceSynchronizer, WaitStatus};
pub use ring::{FrameRing, FrameSlot};
pub use swapchain::SwapChainManager;

/// Device, queue and fence for one engine instance.
pub struct GpuContext<B: Backend> {
    pub device: B::Device,
    pub queue: B::Queue,
    pub fence: FenceSynchronizer<B>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub width: u32,
    pub height: u32,
    pub buffer_count: usize,
    pub vsync: bool,
    pub clear_color: [f32; 4],
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            buffer_count: 3,
            vsync: true,
            clear_color: [0.4, 0.6, 0.9, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
    Presented,
}

/// What happened during one rendered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    /// Back-buffer index the frame rendered into
    pub index: usize,
    /// Fence value signaled after presenting it
    pub fence_value: u64,
    /// Checkpoint the slot waited for before reuse
    pub waited_for: u64,
    /// Time spent blocked in that wait
    pub stall: Duration,
}

/// Handed to custom recording between the two back-buffer barriers.
pub struct FrameTarget<'a, B: Backend> {
    pub list: &'a mut B::CommandList,
    pub rtv_heap: &'a B::DescriptorHeap,
    pub rtv: CpuDescriptorHandle,
    pub index: usize,
}

pub struct Engine<B: Backend> {
    // Drop order: recording objects first, device last
    command_list: B::CommandList,
    ring: FrameRing<B>,
    swap_chain: SwapChainManager<B>,
    ctx: GpuContext<B>,

    current_index: usize,
    state: FrameState,
    vsync: bool,
    clear_color: [f32; 4],
    frames: u64,
    shut_down: bool,
}

impl<B: Backend> Engine<B> {
    /// Builds queue, fence, swap chain, frame ring and views on `device`.
    pub fn new(device: B::Device, surface: B::Surface, settings: &EngineSettings) -> GpuResult<Self> {
        let queue = device.create_command_queue()?;
        let fence = FenceSynchronizer::new(&device)?;

        let (mut swap_chain, current_index) = SwapChainManager::initialize(
            &device,
            &queue,
            surface,
            settings.width,
            settings.height,
            settings.buffer_count,
            settings.vsync,
        )?;

        // The presentation layer may round the buffer count, size the ring to what it gave us
        let mut ring = FrameRing::new(&device, swap_chain.buffer_count())?;
        let command_list = device.create_command_list(ring.acquire(current_index)?.allocator())?;
        swap_chain.refresh_views(&device, &mut ring)?;

        log::info!("Frame engine initialized with {} frames in flight", ring.len());

        Ok(Self {
            command_list,
            ring,
            swap_chain,
            ctx: GpuContext { device, queue, fence },
            current_index,
            state: FrameState::Idle,
            vsync: settings.vsync,
            clear_color: settings.clear_color,
            frames: 0,
            shut_down: false,
        })
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Renders one frame that clears the back buffer, waiting as long as
    /// needed for the slot to free up.
    pub fn render(&mut self) -> GpuResult<FrameReport> {
        let color = self.clear_color;
        let report = self.render_with(None, |target| {
            target.list.clear_render_target(target.rtv_heap, target.rtv, color);
        })?;
        report.ok_or_else(|| GpuError::DeviceLost("unbounded fence wait returned early".into()))
    }

    /// Like `render`, but gives up with `Ok(None)` if the slot is not free
    /// within `timeout`. Nothing is touched in that case.
    pub fn try_render(&mut self, timeout: Duration) -> GpuResult<Option<FrameReport>> {
        let color = self.clear_color;
        self.render_with(Some(timeout), |target| {
            target.list.clear_render_target(target.rtv_heap, target.rtv, color);
        })
    }

    /// Runs the full frame state machine with `record` supplying the commands.
    pub fn render_with<F>(&mut self, timeout: Option<Duration>, record: F) -> GpuResult<Option<FrameReport>>
    where
        F: FnOnce(FrameTarget<'_, B>),
    {
        // Idle -> Recording
        let index = self.current_index;
        let waited_for = self.ring.acquire(index)?.fence_checkpoint();
        let wait_start = Instant::now();
        let status = self.ring.prepare(index, &mut self.ctx.fence, &mut self.command_list, timeout)?;
        if status == WaitStatus::TimedOut {
            return Ok(None);
        }
        let stall = wait_start.elapsed();
        self.enter(FrameState::Recording)?;

        let back_buffer = self
            .ring
            .acquire(index)?
            .back_buffer()
            .cloned()
            .ok_or_else(|| GpuError::InvalidCall(format!("no back buffer attached to slot {}", index)))?;

        self.command_list
            .transition(&back_buffer, ResourceState::Present, ResourceState::RenderTarget);
        record(FrameTarget {
            list: &mut self.command_list,
            rtv_heap: self.swap_chain.rtv_heap(),
            rtv: self.swap_chain.rtv_handle(index),
            index,
        });

        // Recording -> Submitted
        self.command_list
            .transition(&back_buffer, ResourceState::RenderTarget, ResourceState::Present);
        drop(back_buffer);
        self.command_list.close()?;
        self.ctx.queue.execute(&self.command_list)?;
        self.enter(FrameState::Submitted)?;

        // Submitted -> Presented
        self.swap_chain.present(self.vsync)?;
        let fence_value = self.ctx.fence.signal(&self.ctx.queue)?;
        self.ring.commit(index, fence_value)?;
        self.enter(FrameState::Presented)?;

        // Presented -> Idle
        self.advance()?;
        self.enter(FrameState::Idle)?;
        self.frames += 1;

        log::trace!("Frame {} presented from slot {} at fence value {}", self.frames, index, fence_value);

        Ok(Some(FrameReport {
            index,
            fence_value,
            waited_for,
            stall,
        }))
    }

    /// Moves to the back buffer the presentation layer chose next.
    fn advance(&mut self) -> GpuResult<()> {
        if self.swap_chain.needs_rebuild() {
            self.current_index = self.swap_chain.rebuild(&mut self.ctx, &mut self.ring, self.current_index)?;
            return Ok(());
        }

        match self.swap_chain.current_back_buffer_index() {
            Ok(index) => self.current_index = index,
            Err(GpuError::OutOfDate) => {
                log::debug!("Surface out of date, rebuilding swap chain");
                self.current_index = self.swap_chain.rebuild(&mut self.ctx, &mut self.ring, self.current_index)?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn enter(&mut self, next: FrameState) -> GpuResult<()> {
        let allowed = matches!(
            (self.state, next),
            (FrameState::Idle, FrameState::Recording)
                | (FrameState::Recording, FrameState::Submitted)
                | (FrameState::Submitted, FrameState::Presented)
                | (FrameState::Presented, FrameState::Idle)
        );
        if !allowed {
            return Err(GpuError::InvalidCall(format!("frame state {:?} -> {:?}", self.state, next)));
        }
        self.state = next;
        Ok(())
    }

    // =========================================================================
    // WINDOW EVENTS
    // =========================================================================

    /// Resizes the back buffers. Returns `false` when the size did not change.
    pub fn resize(&mut self, width: u32, height: u32) -> GpuResult<bool> {
        match self.swap_chain.resize(&mut self.ctx, &mut self.ring, self.current_index, width, height)? {
            Some(index) => {
                self.current_index = index;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_vsync(&mut self, enabled: bool) {
        if self.vsync != enabled {
            self.vsync = enabled;
            log::info!("V-sync {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn toggle_vsync(&mut self) -> bool {
        self.set_vsync(!self.vsync);
        self.vsync
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Drains the queue and drops every back-buffer reference. Returns the
    /// final fence statistics.
    pub fn shutdown(mut self) -> GpuResult<FenceStats> {
        self.release()?;
        Ok(*self.ctx.fence.stats())
    }

    fn release(&mut self) -> GpuResult<()> {
        self.shut_down = true;
        self.ctx.fence.flush(&self.ctx.queue)?;
        self.ring.release_back_buffers();
        self.swap_chain.release_views();
        log::info!(
            "Frame engine shut down after {} frames (fence value {})",
            self.frames,
            self.ctx.fence.last_signaled()
        );
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn context(&self) -> &GpuContext<B> {
        &self.ctx
    }

    pub fn ring(&self) -> &FrameRing<B> {
        &self.ring
    }

    pub fn swap_chain(&self) -> &SwapChainManager<B> {
        &self.swap_chain
    }

    pub fn fence_stats(&self) -> &FenceStats {
        self.ctx.fence.stats()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        log::warn!("Frame engine dropped without shutdown, flushing");
        if let Err(e) = self.release() {
            log::error!("Flush during drop failed: {}", e);
        }
    }
}
