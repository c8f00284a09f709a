use std::time::{Duration, Instant};

/// Counts rendered frames and reports a rate once per window.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window: Duration,
    started: Option<Instant>,
    frames: u32,
    last: Option<f32>,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl FpsMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            started: None,
            frames: 0,
            last: None,
        }
    }

    /// Records one frame; returns a fresh rate whenever a window closes.
    ///
    /// The very first frame only opens the window; each later frame is
    /// counted in the window it ends.
    pub fn frame(&mut self, now: Instant) -> Option<f32> {
        let Some(started) = self.started else {
            self.started = Some(now);
            return None;
        };
        self.frames += 1;
        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.window {
            return None;
        }
        let fps = self.frames as f32 / elapsed.as_secs_f32();
        self.started = Some(now);
        self.frames = 0;
        self.last = Some(fps);
        Some(fps)
    }

    /// Most recent completed measurement.
    pub fn fps(&self) -> Option<f32> {
        self.last
    }
}
