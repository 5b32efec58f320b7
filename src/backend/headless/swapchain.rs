// Headless swap chain
//
// Keeps N buffers in memory and enforces the rules a real presentation layer
// enforces: no resize while any buffer handle is still held, no tearing flag
// with a non-zero sync interval or without support, and only buffers in the
// PRESENT state may be presented.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::Headless;
use crate::gpu::{GpuError, GpuResult, PresentRequest, ResourceState, SwapChain, SwapChainDesc};

const MIN_BUFFERS: usize = 2;
const MAX_BUFFERS: usize = 16;
const MAX_SYNC_INTERVAL: u32 = 4;
/// Present requests kept for inspection; older ones are dropped
pub const PRESENT_HISTORY: usize = 64;

/// Order in which the presentation layer hands out back buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BufferOrder {
    #[default]
    Sequential,
    /// Cycles through these indices
    Scripted(Vec<usize>),
}

#[derive(Debug, Clone, Default)]
pub struct HeadlessSurface {
    pub order: BufferOrder,
}

#[derive(Debug)]
struct BufferState {
    generation: u64,
    index: usize,
    state: Mutex<ResourceState>,
}

/// Reference-counted back buffer handle.
#[derive(Debug, Clone)]
pub struct HeadlessBuffer(Arc<BufferState>);

impl HeadlessBuffer {
    fn new(generation: u64, index: usize) -> Self {
        Self(Arc::new(BufferState {
            generation,
            index,
            state: Mutex::new(ResourceState::Present),
        }))
    }

    pub fn generation(&self) -> u64 {
        self.0.generation
    }

    pub fn index(&self) -> usize {
        self.0.index
    }

    pub fn state(&self) -> ResourceState {
        *self.0.state.lock()
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        *self.0.state.lock() = state;
    }

    fn references(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

pub struct HeadlessSwapChain {
    buffers: Vec<HeadlessBuffer>,
    generation: u64,
    width: u32,
    height: u32,
    order: BufferOrder,
    cursor: usize,
    tearing_supported: bool,
    presents: VecDeque<PresentRequest>,
    present_count: u64,
}

impl HeadlessSwapChain {
    pub(crate) fn new(desc: &SwapChainDesc, surface: HeadlessSurface, tearing_supported: bool) -> GpuResult<Self> {
        if !(MIN_BUFFERS..=MAX_BUFFERS).contains(&desc.buffer_count) {
            return Err(GpuError::InvalidCall(format!(
                "swap chain buffer count {} outside {}..={}",
                desc.buffer_count, MIN_BUFFERS, MAX_BUFFERS
            )));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::InvalidCall("zero-sized swap chain".into()));
        }
        if let BufferOrder::Scripted(indices) = &surface.order {
            if indices.is_empty() || indices.iter().any(|&i| i >= desc.buffer_count) {
                return Err(GpuError::Surface(format!("invalid scripted buffer order {:?}", indices)));
            }
        }

        let generation = 1;
        Ok(Self {
            buffers: (0..desc.buffer_count).map(|i| HeadlessBuffer::new(generation, i)).collect(),
            generation,
            width: desc.width,
            height: desc.height,
            order: surface.order,
            cursor: 0,
            tearing_supported,
            presents: VecDeque::with_capacity(PRESENT_HISTORY),
            present_count: 0,
        })
    }

    /// Bumped every time the buffers are recreated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The most recent present requests, oldest first.
    pub fn presents(&self) -> impl Iterator<Item = PresentRequest> + '_ {
        self.presents.iter().copied()
    }

    pub fn last_present(&self) -> Option<PresentRequest> {
        self.presents.back().copied()
    }

    /// Every present since creation, including ones no longer in the history.
    pub fn present_count(&self) -> u64 {
        self.present_count
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn index_at(&self, cursor: usize) -> usize {
        match &self.order {
            BufferOrder::Sequential => cursor % self.buffers.len(),
            BufferOrder::Scripted(indices) => indices[cursor % indices.len()],
        }
    }
}

impl SwapChain<Headless> for HeadlessSwapChain {
    fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn current_back_buffer_index(&mut self) -> GpuResult<usize> {
        Ok(self.index_at(self.cursor))
    }

    fn get_buffer(&self, index: usize) -> GpuResult<HeadlessBuffer> {
        self.buffers
            .get(index)
            .cloned()
            .ok_or_else(|| GpuError::InvalidCall(format!("no back buffer {}", index)))
    }

    fn resize_buffers(&mut self, width: u32, height: u32) -> GpuResult<()> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidCall("zero-sized swap chain".into()));
        }
        if let Some(held) = self.buffers.iter().find(|b| b.references() > 1) {
            return Err(GpuError::ResourceInUse(format!(
                "back buffer {} still referenced ({} handles) during resize",
                held.index(),
                held.references() - 1
            )));
        }

        self.generation += 1;
        let count = self.buffers.len();
        self.buffers = (0..count).map(|i| HeadlessBuffer::new(self.generation, i)).collect();
        self.width = width;
        self.height = height;
        self.cursor = 0;
        Ok(())
    }

    fn present(&mut self, request: PresentRequest) -> GpuResult<()> {
        if request.sync_interval > MAX_SYNC_INTERVAL {
            return Err(GpuError::InvalidCall(format!("sync interval {}", request.sync_interval)));
        }
        if request.allow_tearing && (request.sync_interval != 0 || !self.tearing_supported) {
            return Err(GpuError::InvalidCall(
                "tearing present requires sync interval 0 and tearing support".into(),
            ));
        }

        let index = self.index_at(self.cursor);
        if self.buffers[index].state() != ResourceState::Present {
            return Err(GpuError::InvalidCall(format!(
                "back buffer {} presented in {:?} state",
                index,
                self.buffers[index].state()
            )));
        }

        if self.presents.len() == PRESENT_HISTORY {
            self.presents.pop_front();
        }
        self.presents.push_back(request);
        self.present_count += 1;
        self.cursor += 1;
        Ok(())
    }

    fn tearing_supported(&self) -> bool {
        self.tearing_supported
    }
}
