//! Render tick pacing shared by the control and display surfaces.
//!
//! [`FrameScheduler`] decides per tick whether to render under a frame-rate
//! ceiling, [`RefreshRateEstimator`] derives that ceiling from observed
//! presentation intervals, [`FpsMeter`] turns rendered frames into a rate,
//! and [`PreviewThrottle`] picks the preview rate from what the display
//! reports.

mod meter;
mod pacer;
mod refresh;
mod throttle;

pub use meter::FpsMeter;
pub use pacer::{FrameScheduler, SchedulerState, TickDecision};
pub use refresh::RefreshRateEstimator;
pub use throttle::{PreviewThrottle, PREVIEW_FULL_FPS, PREVIEW_REDUCED_FPS};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("refresh rate must be a positive number of frames per second, got {0}")]
    InvalidRate(f32),
}
