use tracing::debug;

pub const PREVIEW_FULL_FPS: f32 = 60.0;
pub const PREVIEW_REDUCED_FPS: f32 = 30.0;

/// The display must reach this share of its own target before the preview runs at full rate.
const KEEPING_UP: f32 = 0.95;

/// Chooses the control preview rate from the display's self-reported FPS.
///
/// When the display falls behind its target the GPU is the bottleneck, so
/// the preview steps down to leave it headroom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewThrottle {
    fps: f32,
}

impl Default for PreviewThrottle {
    fn default() -> Self {
        Self {
            fps: PREVIEW_FULL_FPS,
        }
    }
}

impl PreviewThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Feeds one display report; returns the new preview rate if it changed.
    pub fn observe(&mut self, display_fps: f32, display_target: f32) -> Option<f32> {
        let next = if display_target <= 0.0 || display_fps >= KEEPING_UP * display_target {
            PREVIEW_FULL_FPS
        } else {
            PREVIEW_REDUCED_FPS
        };
        if next == self.fps {
            return None;
        }
        debug!(display_fps, display_target, preview_fps = next, "preview throttle changed");
        self.fps = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rate_while_display_keeps_up() {
        let mut throttle = PreviewThrottle::new();
        assert_eq!(throttle.observe(58.0, 60.0), None);
        assert_eq!(throttle.fps(), PREVIEW_FULL_FPS);
    }

    #[test]
    fn steps_down_when_display_falls_behind_and_recovers() {
        let mut throttle = PreviewThrottle::new();
        assert_eq!(throttle.observe(56.9, 60.0), Some(PREVIEW_REDUCED_FPS));
        assert_eq!(throttle.observe(50.0, 60.0), None);
        assert_eq!(throttle.observe(60.0, 60.0), Some(PREVIEW_FULL_FPS));
    }

    #[test]
    fn missing_target_never_throttles() {
        let mut throttle = PreviewThrottle::new();
        assert_eq!(throttle.observe(5.0, 0.0), None);
    }
}
