// Fence synchronizer
//
// Wraps the GPU fence and the CPU-side counter of the last value we asked
// the queue to signal. Signal and wait are separate so the CPU can record
// frame K+1 while the GPU still executes frame K; only `flush` drains the
// queue completely.

use std::time::{Duration, Instant};

use crate::gpu::{Backend, CommandQueue, GpuDevice, GpuFence, GpuResult};

/// Stalls longer than this are logged as contention.
const STALL_WARN_THRESHOLD: Duration = Duration::from_millis(100);

/// Outcome of a fence wait. A timeout is "not ready yet", never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    TimedOut,
}

impl WaitStatus {
    pub fn is_ready(self) -> bool {
        self == WaitStatus::Ready
    }
}

/// Counters for frame-time metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceStats {
    pub signals: u64,
    pub waits: u64,
    /// Waits that actually had to block
    pub blocking_waits: u64,
    pub timeouts: u64,
    pub flushes: u64,
    pub total_stall: Duration,
    pub max_stall: Duration,
}

pub struct FenceSynchronizer<B: Backend> {
    fence: B::Fence,
    /// Last value handed to `signal`
    value: u64,
    stats: FenceStats,
}

impl<B: Backend> FenceSynchronizer<B> {
    pub fn new(device: &B::Device) -> GpuResult<Self> {
        Ok(Self {
            fence: device.create_fence(0)?,
            value: 0,
            stats: FenceStats::default(),
        })
    }

    /// Advances the counter and asks `queue` to signal the new value once
    /// everything submitted before it has finished. Does not block.
    pub fn signal(&mut self, queue: &B::Queue) -> GpuResult<u64> {
        self.value += 1;
        queue.signal(&self.fence, self.value)?;
        self.stats.signals += 1;
        log::trace!("Signaled fence value {}", self.value);
        Ok(self.value)
    }

    /// Blocks until the GPU has reached `value` or `timeout` elapses.
    /// `None` waits forever.
    pub fn wait(&mut self, value: u64, timeout: Option<Duration>) -> GpuResult<WaitStatus> {
        self.stats.waits += 1;

        // Fast path: no wait registration when the GPU is already there
        if self.fence.completed_value()? >= value {
            return Ok(WaitStatus::Ready);
        }

        let start = Instant::now();
        let mut reached = self.fence.wait_for_value(value, timeout)?;
        while !reached && timeout.is_none() {
            reached = self.fence.wait_for_value(value, None)?;
        }
        let stalled = start.elapsed();

        self.stats.blocking_waits += 1;
        self.stats.total_stall += stalled;
        self.stats.max_stall = self.stats.max_stall.max(stalled);

        if stalled >= STALL_WARN_THRESHOLD {
            log::warn!("CPU stalled {:.2}ms waiting for fence value {}", stalled.as_secs_f64() * 1000.0, value);
        }

        if reached {
            Ok(WaitStatus::Ready)
        } else {
            self.stats.timeouts += 1;
            log::trace!("Fence value {} not reached within {:?}", value, timeout);
            Ok(WaitStatus::TimedOut)
        }
    }

    /// Signal, then wait for that value without bound. After this returns
    /// every prior submission on `queue` has completed.
    pub fn flush(&mut self, queue: &B::Queue) -> GpuResult<()> {
        let value = self.signal(queue)?;
        self.wait(value, None)?;
        self.stats.flushes += 1;
        log::debug!("Flushed command queue at fence value {}", value);
        Ok(())
    }

    pub fn completed_value(&self) -> GpuResult<u64> {
        self.fence.completed_value()
    }

    pub fn last_signaled(&self) -> u64 {
        self.value
    }

    pub fn fence(&self) -> &B::Fence {
        &self.fence
    }

    pub fn stats(&self) -> &FenceStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{Headless, HeadlessConfig, HeadlessDevice, HeadlessQueue};

    fn setup(latency: Duration) -> (HeadlessDevice, HeadlessQueue, FenceSynchronizer<Headless>) {
        let device = HeadlessDevice::new(HeadlessConfig {
            gpu_latency: latency,
            ..HeadlessConfig::default()
        });
        let queue = device.create_command_queue().unwrap();
        let fence = FenceSynchronizer::<Headless>::new(&device).unwrap();
        (device, queue, fence)
    }

    #[test]
    fn signal_values_strictly_increase() {
        let (_device, queue, mut fence) = setup(Duration::ZERO);

        let mut previous = 0;
        for _ in 0..50 {
            let value = fence.signal(&queue).unwrap();
            assert!(value > previous);
            assert!(fence.completed_value().unwrap() <= value);
            previous = value;
        }
        assert_eq!(fence.last_signaled(), 50);
        assert_eq!(fence.stats().signals, 50);
    }

    #[test]
    fn completed_never_passes_submitted_while_gpu_is_paused() {
        let (_device, queue, mut fence) = setup(Duration::ZERO);
        queue.pause();

        for _ in 0..5 {
            fence.signal(&queue).unwrap();
        }
        assert_eq!(fence.completed_value().unwrap(), 0);

        queue.resume();
        fence.wait(5, None).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 5);
        assert!(fence.completed_value().unwrap() <= fence.last_signaled());
    }

    #[test]
    fn wait_on_reached_value_does_not_block() {
        let (_device, queue, mut fence) = setup(Duration::ZERO);
        let value = fence.signal(&queue).unwrap();
        fence.wait(value, None).unwrap();

        let before = fence.stats().blocking_waits;
        assert_eq!(fence.wait(value, None).unwrap(), WaitStatus::Ready);
        assert_eq!(fence.wait(0, Some(Duration::ZERO)).unwrap(), WaitStatus::Ready);
        assert_eq!(fence.stats().blocking_waits, before);
    }

    #[test]
    fn bounded_wait_reports_timeout_instead_of_failing() {
        let (_device, queue, mut fence) = setup(Duration::ZERO);
        queue.pause();
        let value = fence.signal(&queue).unwrap();

        let status = fence.wait(value, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
        assert_eq!(fence.stats().timeouts, 1);

        queue.resume();
        assert!(fence.wait(value, None).unwrap().is_ready());
    }

    #[test]
    fn flush_drains_all_prior_work() {
        let (_device, queue, mut fence) = setup(Duration::from_millis(2));
        for _ in 0..3 {
            fence.signal(&queue).unwrap();
        }

        fence.flush(&queue).unwrap();
        assert_eq!(fence.completed_value().unwrap(), fence.last_signaled());
        assert_eq!(fence.stats().flushes, 1);
    }
}
