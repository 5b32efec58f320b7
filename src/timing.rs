// Frame-time and FPS tracking for the window title and the log.

use std::time::{Duration, Instant};

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Averages over one reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSample {
    pub fps: f32,
    /// Duration of the last frame in the window, in milliseconds
    pub frame_time_ms: f32,
}

#[derive(Debug, Clone)]
pub struct FrameTimer {
    last_frame: Instant,
    window_start: Instant,
    frames_in_window: u32,
}

impl FrameTimer {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            last_frame: now,
            window_start: now,
            frames_in_window: 0,
        }
    }

    /// Restart the window, e.g. after a minimize.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn tick(&mut self) -> Option<FpsSample> {
        self.tick_at(Instant::now())
    }

    /// Counts one frame finished at `now`. Returns a sample once at least a
    /// second has passed since the last one.
    pub fn tick_at(&mut self, now: Instant) -> Option<FpsSample> {
        let frame_time = now.saturating_duration_since(self.last_frame);
        self.last_frame = now;
        self.frames_in_window += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < FPS_WINDOW {
            return None;
        }

        let sample = FpsSample {
            fps: self.frames_in_window as f32 / elapsed.as_secs_f32(),
            frame_time_ms: frame_time.as_secs_f32() * 1000.0,
        };
        self.frames_in_window = 0;
        self.window_start = now;
        Some(sample)
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_sample_before_a_full_second() {
        let start = Instant::now();
        let mut timer = FrameTimer::starting_at(start);
        for i in 1..10 {
            assert_eq!(timer.tick_at(start + Duration::from_millis(i * 100)), None);
        }
    }

    #[test]
    fn reports_average_rate_over_the_window() {
        let start = Instant::now();
        let mut timer = FrameTimer::starting_at(start);

        let mut sample = None;
        for i in 1..=60 {
            sample = timer.tick_at(start + Duration::from_micros(i * 16_667));
        }

        let sample = sample.expect("window closed on the 60th frame");
        assert!((sample.fps - 60.0).abs() < 0.1, "fps = {}", sample.fps);
        assert!((sample.frame_time_ms - 16.667).abs() < 0.01);
    }

    #[test]
    fn window_restarts_after_a_sample() {
        let start = Instant::now();
        let mut timer = FrameTimer::starting_at(start);
        assert!(timer.tick_at(start + Duration::from_secs(1)).is_some());
        assert_eq!(timer.tick_at(start + Duration::from_millis(1500)), None);
        let sample = timer.tick_at(start + Duration::from_secs(2)).unwrap();
        assert!((sample.fps - 2.0).abs() < 1e-3);
    }
}
