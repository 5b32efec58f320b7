// Swap chain lifecycle
//
// Owns the swap chain and the fixed RTV heap (one descriptor per back
// buffer). Back buffers are only ever released after a full queue flush, so
// no pending submission can reference a buffer that is being resized away.

use super::ring::FrameRing;
use super::GpuContext;
use crate::gpu::{
    Backend, CpuDescriptorHandle, DescriptorHeap, GpuDevice, GpuResult, PresentRequest,
    SwapChain, SwapChainDesc,
};

pub struct SwapChainManager<B: Backend> {
    // Views drop before the buffers they point at
    rtv_heap: B::DescriptorHeap,
    swap_chain: B::SwapChain,
    rtv_increment: usize,
    width: u32,
    height: u32,
    tearing_supported: bool,
}

impl<B: Backend> SwapChainManager<B> {
    /// Creates the swap chain on `queue` and returns it with the current
    /// back-buffer index. Views are not written yet: call `refresh_views`.
    pub fn initialize(
        device: &B::Device,
        queue: &B::Queue,
        surface: B::Surface,
        width: u32,
        height: u32,
        buffer_count: usize,
        vsync: bool,
    ) -> GpuResult<(Self, usize)> {
        let (width, height) = clamp_extent(width, height);

        let mut swap_chain = device.create_swap_chain(
            queue,
            surface,
            &SwapChainDesc { width, height, buffer_count, vsync },
        )?;
        let tearing_supported = swap_chain.tearing_supported();
        let current = swap_chain.current_back_buffer_index()?;

        let rtv_heap = device.create_rtv_heap(swap_chain.buffer_count())?;
        let rtv_increment = device.rtv_descriptor_increment();

        log::info!(
            "Swap chain ready: {}x{}, {} buffers, tearing {}",
            width,
            height,
            swap_chain.buffer_count(),
            if tearing_supported { "supported" } else { "unsupported" }
        );

        Ok((
            Self {
                swap_chain,
                rtv_heap,
                rtv_increment,
                width,
                height,
                tearing_supported,
            },
            current,
        ))
    }

    /// Fetches every back buffer, writes its render-target view at
    /// `heap_start + i * increment` and hands the buffer to the ring.
    pub fn refresh_views(&mut self, device: &B::Device, ring: &mut FrameRing<B>) -> GpuResult<()> {
        for index in 0..self.swap_chain.buffer_count() {
            let back_buffer = self.swap_chain.get_buffer(index)?;
            let handle = self.rtv_handle(index);
            device.create_render_target_view(&back_buffer, &mut self.rtv_heap, handle)?;
            ring.attach_back_buffer(index, back_buffer)?;
        }
        Ok(())
    }

    /// Resizes the back buffers. Returns `None` when the size is unchanged,
    /// otherwise the new current back-buffer index.
    pub fn resize(
        &mut self,
        ctx: &mut GpuContext<B>,
        ring: &mut FrameRing<B>,
        current_index: usize,
        width: u32,
        height: u32,
    ) -> GpuResult<Option<usize>> {
        let (width, height) = clamp_extent(width, height);
        if width == self.width && height == self.height {
            return Ok(None);
        }

        log::info!("Resizing swap chain: {}x{} -> {}x{}", self.width, self.height, width, height);
        let current = self.recreate_buffers(ctx, ring, current_index, width, height)?;
        // Only a completed resize counts, so a failed one is retried at the same size
        self.width = width;
        self.height = height;
        Ok(Some(current))
    }

    /// Runs the resize protocol with the current size, for backends that
    /// flagged `needs_rebuild` or reported an out-of-date surface.
    pub fn rebuild(
        &mut self,
        ctx: &mut GpuContext<B>,
        ring: &mut FrameRing<B>,
        current_index: usize,
    ) -> GpuResult<usize> {
        log::info!("Rebuilding swap chain buffers at {}x{}", self.width, self.height);
        self.recreate_buffers(ctx, ring, current_index, self.width, self.height)
    }

    fn recreate_buffers(
        &mut self,
        ctx: &mut GpuContext<B>,
        ring: &mut FrameRing<B>,
        current_index: usize,
        width: u32,
        height: u32,
    ) -> GpuResult<usize> {
        // No submitted work may reference a back buffer past this point
        ctx.fence.flush(&ctx.queue)?;

        ring.release_back_buffers();
        self.rtv_heap.release_views();
        ring.carry_checkpoints(current_index)?;

        self.swap_chain.resize_buffers(width, height)?;
        self.tearing_supported = self.swap_chain.tearing_supported();

        let current = self.swap_chain.current_back_buffer_index()?;
        self.refresh_views(&ctx.device, ring)?;

        log::debug!("Back buffers recreated, current index {}", current);
        Ok(current)
    }

    /// Presents with sync interval 1 under vsync, 0 otherwise. The tearing
    /// flag is only set when supported and vsync is off.
    pub fn present(&mut self, vsync: bool) -> GpuResult<PresentRequest> {
        let request = PresentRequest::new(vsync, self.tearing_supported);
        self.swap_chain.present(request)?;
        Ok(request)
    }

    pub fn current_back_buffer_index(&mut self) -> GpuResult<usize> {
        self.swap_chain.current_back_buffer_index()
    }

    /// Drops every render-target view. Only call after a flush.
    pub fn release_views(&mut self) {
        self.rtv_heap.release_views();
    }

    pub fn rtv_handle(&self, index: usize) -> CpuDescriptorHandle {
        self.rtv_heap.cpu_handle_start().offset(index, self.rtv_increment)
    }

    pub fn rtv_heap(&self) -> &B::DescriptorHeap {
        &self.rtv_heap
    }

    pub fn swap_chain(&self) -> &B::SwapChain {
        &self.swap_chain
    }

    pub fn buffer_count(&self) -> usize {
        self.swap_chain.buffer_count()
    }

    pub fn needs_rebuild(&self) -> bool {
        self.swap_chain.needs_rebuild()
    }

    pub fn tearing_supported(&self) -> bool {
        self.tearing_supported
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// A zero-sized swap chain is a creation error, so clamp to 1x1.
fn clamp_extent(width: u32, height: u32) -> (u32, u32) {
    (width.max(1), height.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{Headless, HeadlessConfig, HeadlessDevice, HeadlessSurface};
    use crate::engine::fence::FenceSynchronizer;

    struct Fixture {
        ctx: GpuContext<Headless>,
        ring: FrameRing<Headless>,
        manager: SwapChainManager<Headless>,
        current: usize,
    }

    fn fixture(tearing_supported: bool) -> Fixture {
        let device = HeadlessDevice::new(HeadlessConfig {
            tearing_supported,
            ..HeadlessConfig::default()
        });
        let queue = device.create_command_queue().unwrap();
        let fence = FenceSynchronizer::new(&device).unwrap();
        let (mut manager, current) = SwapChainManager::<Headless>::initialize(
            &device,
            &queue,
            HeadlessSurface::default(),
            640,
            480,
            3,
            true,
        )
        .unwrap();
        let mut ring = FrameRing::new(&device, manager.buffer_count()).unwrap();
        manager.refresh_views(&device, &mut ring).unwrap();

        Fixture {
            ctx: GpuContext { device, queue, fence },
            ring,
            manager,
            current,
        }
    }

    #[test]
    fn resize_with_same_size_is_a_no_op() {
        let mut f = fixture(false);
        let generation = f.manager.swap_chain().generation();

        let result = f.manager.resize(&mut f.ctx, &mut f.ring, f.current, 640, 480).unwrap();

        assert_eq!(result, None);
        assert_eq!(f.ctx.fence.stats().flushes, 0);
        assert_eq!(f.manager.swap_chain().generation(), generation);
    }

    #[test]
    fn resize_replaces_every_back_buffer_and_view() {
        let mut f = fixture(false);
        let old_generation = f.manager.swap_chain().generation();

        let current = f.manager.resize(&mut f.ctx, &mut f.ring, f.current, 800, 600).unwrap();

        assert!(current.is_some());
        assert_eq!(f.ctx.fence.stats().flushes, 1);
        assert_eq!(f.manager.extent(), (800, 600));

        let generation = f.manager.swap_chain().generation();
        assert_ne!(generation, old_generation);
        for index in 0..3 {
            let view = f.manager.rtv_heap().view(index).expect("descriptor written");
            assert_eq!(view.generation, generation);
            assert_eq!(view.buffer_index, index);

            let buffer = f.ring.acquire(index).unwrap().back_buffer().unwrap();
            assert_eq!(buffer.generation(), generation);
        }
    }

    #[test]
    fn resize_fails_if_a_back_buffer_is_still_referenced() {
        let mut f = fixture(false);
        let leaked = f.ring.acquire(0).unwrap().back_buffer().cloned().unwrap();

        let err = f.manager.resize(&mut f.ctx, &mut f.ring, f.current, 320, 200).unwrap_err();
        assert!(matches!(err, crate::gpu::GpuError::ResourceInUse(_)));
        drop(leaked);
    }

    #[test]
    fn views_are_released_before_the_buffers_are_resized() {
        let mut f = fixture(false);
        let leaked = f.ring.acquire(1).unwrap().back_buffer().cloned().unwrap();

        f.manager.resize(&mut f.ctx, &mut f.ring, f.current, 320, 200).unwrap_err();

        // The heap keeps its slots but no view survives into the resize
        assert_eq!(f.manager.rtv_heap().descriptor_count(), 3);
        for index in 0..3 {
            assert_eq!(f.manager.rtv_heap().view(index), None);
        }
        drop(leaked);
    }

    #[test]
    fn failed_resize_is_retried_at_the_same_size() {
        let mut f = fixture(false);
        let leaked = f.ring.acquire(0).unwrap().back_buffer().cloned().unwrap();
        f.manager.resize(&mut f.ctx, &mut f.ring, f.current, 320, 200).unwrap_err();
        assert_eq!(f.manager.extent(), (640, 480));
        drop(leaked);

        let current = f.manager.resize(&mut f.ctx, &mut f.ring, f.current, 320, 200).unwrap();
        assert!(current.is_some());
        assert_eq!(f.manager.extent(), (320, 200));
        for index in 0..3 {
            assert!(f.ring.acquire(index).unwrap().back_buffer().is_some());
            assert!(f.manager.rtv_heap().view(index).is_some());
        }
    }

    #[test]
    fn zero_dimensions_are_clamped() {
        let mut f = fixture(false);
        f.manager.resize(&mut f.ctx, &mut f.ring, f.current, 0, 0).unwrap();
        assert_eq!(f.manager.extent(), (1, 1));

        // 1x1 again is unchanged
        let flushes = f.ctx.fence.stats().flushes;
        assert_eq!(f.manager.resize(&mut f.ctx, &mut f.ring, f.current, 0, 1).unwrap(), None);
        assert_eq!(f.ctx.fence.stats().flushes, flushes);
    }

    #[test]
    fn rtv_handles_are_spaced_by_the_increment() {
        let f = fixture(false);
        let start = f.manager.rtv_heap().cpu_handle_start();
        let increment = f.ctx.device.rtv_descriptor_increment();
        for index in 0..3 {
            assert_eq!(f.manager.rtv_handle(index).0, start.0 + index * increment);
        }
    }

    #[test]
    fn tearing_flag_requires_support_and_no_vsync() {
        for tearing_supported in [false, true] {
            for vsync in [false, true] {
                let mut f = fixture(tearing_supported);
                let request = f.manager.present(vsync).unwrap();

                assert_eq!(request.sync_interval, if vsync { 1 } else { 0 });
                assert_eq!(request.allow_tearing, tearing_supported && !vsync);
                if request.allow_tearing {
                    assert!(tearing_supported && !vsync);
                }
            }
        }
    }
}
