// Software GPU timeline
//
// A worker thread that plays the GPU: it takes submitted work in FIFO order,
// "executes" command lists by sleeping for the configured latency, and moves
// fences forward when it reaches a signal. Pausing holds everything back,
// which lets tests model a GPU that has fallen behind.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::gpu::{GpuError, GpuResult};
use crate::sync::CompletionEvent;

/// Bookkeeping shared between an allocator and the timeline.
#[derive(Debug, Default)]
pub(crate) struct AllocatorState {
    /// Submitted lists recorded from this allocator that have not finished
    pub in_flight: AtomicUsize,
    pub resets: AtomicU64,
}

pub(crate) enum Work {
    Execute {
        allocator: Arc<AllocatorState>,
        cost: Duration,
    },
    Signal {
        fence: Arc<CompletionEvent<u64>>,
        value: u64,
    },
}

#[derive(Default)]
struct Pending {
    work: VecDeque<Work>,
    paused: bool,
    shutdown: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    wake: Condvar,
}

pub(crate) struct GpuTimeline {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl GpuTimeline {
    pub fn spawn() -> GpuResult<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("headless-gpu".into())
                .spawn(move || run(&shared))
                .map_err(|e| GpuError::DeviceLost(format!("failed to start GPU timeline: {}", e)))?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn submit(&self, work: Work) -> GpuResult<()> {
        let mut pending = self.shared.pending.lock();
        if pending.shutdown {
            return Err(GpuError::DeviceLost("GPU timeline has shut down".into()));
        }
        pending.work.push_back(work);
        drop(pending);
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn set_paused(&self, paused: bool) {
        self.shared.pending.lock().paused = paused;
        self.shared.wake.notify_all();
    }
}

impl Drop for GpuTimeline {
    fn drop(&mut self) {
        self.shared.pending.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Headless GPU timeline thread panicked");
            }
        }
    }
}

fn run(shared: &Shared) {
    loop {
        let next = {
            let mut pending = shared.pending.lock();
            loop {
                // Shutdown drains whatever is left, even when paused
                if !pending.paused || pending.shutdown {
                    if let Some(work) = pending.work.pop_front() {
                        break Some(work);
                    }
                    if pending.shutdown {
                        break None;
                    }
                }
                shared.wake.wait(&mut pending);
            }
        };

        match next {
            Some(Work::Execute { allocator, cost }) => {
                if !cost.is_zero() {
                    thread::sleep(cost);
                }
                allocator.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Some(Work::Signal { fence, value }) => {
                fence.update(|completed| *completed = (*completed).max(value));
            }
            None => return,
        }
    }
}
