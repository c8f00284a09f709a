use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::SchedulerError;

/// Fraction of the refresh interval a tick must wait before it renders again.
///
/// Slightly below one so jitter in vsync callbacks does not drop every
/// other frame.
const CEILING_FACTOR: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Render now; `elapsed` is the time since the previous rendered tick.
    Render { elapsed: Duration },
    /// Too soon under the ceiling; keep scheduling.
    Skip,
    /// Not started.
    Idle,
}

/// Single-threaded tick gate for one surface.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    state: SchedulerState,
    ceiling: Option<Duration>,
    last_accepted: Option<Instant>,
    rendered: u64,
    skipped: u64,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler {
    /// Idle and uncapped.
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Idle,
            ceiling: None,
            last_accepted: None,
            rendered: 0,
            skipped: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn ceiling(&self) -> Option<Duration> {
        self.ceiling
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Caps rendering just under `hz`; `None` removes the cap.
    pub fn set_target_refresh(&mut self, hz: Option<f32>) -> Result<(), SchedulerError> {
        self.ceiling = match hz {
            None => None,
            Some(hz) if hz.is_finite() && hz > 0.0 => {
                Some(Duration::from_secs_f64(CEILING_FACTOR / f64::from(hz)))
            }
            Some(hz) => return Err(SchedulerError::InvalidRate(hz)),
        };
        debug!(ceiling = ?self.ceiling, "frame ceiling updated");
        Ok(())
    }

    /// Moves to running; the first tick afterwards always renders.
    pub fn start(&mut self) {
        self.state = SchedulerState::Running;
        self.last_accepted = None;
    }

    pub fn stop(&mut self) {
        self.state = SchedulerState::Idle;
    }

    pub fn tick(&mut self, now: Instant) -> TickDecision {
        if self.state == SchedulerState::Idle {
            return TickDecision::Idle;
        }
        let elapsed = match self.last_accepted {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::ZERO,
        };
        if let (Some(ceiling), Some(_)) = (self.ceiling, self.last_accepted) {
            if elapsed < ceiling {
                self.skipped += 1;
                trace!(?elapsed, ?ceiling, "tick skipped under frame ceiling");
                return TickDecision::Skip;
            }
        }
        self.last_accepted = Some(now);
        self.rendered += 1;
        TickDecision::Render { elapsed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn idle_until_started() {
        let mut scheduler = FrameScheduler::new();
        assert_eq!(scheduler.tick(Instant::now()), TickDecision::Idle);
        scheduler.start();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(matches!(
            scheduler.tick(Instant::now()),
            TickDecision::Render { .. }
        ));
    }

    #[test]
    fn ceiling_is_just_under_the_refresh_interval() {
        let mut scheduler = FrameScheduler::new();
        scheduler.set_target_refresh(Some(60.0)).unwrap();
        let ceiling = scheduler.ceiling().unwrap();
        let expected = Duration::from_secs_f64(0.95 / 60.0);
        assert_eq!(ceiling, expected);
        assert!(ceiling < Duration::from_secs_f64(1.0 / 60.0));
    }

    #[test]
    fn ticks_inside_the_ceiling_are_skipped() {
        let mut scheduler = FrameScheduler::new();
        scheduler.set_target_refresh(Some(30.0)).unwrap();
        scheduler.start();
        let start = Instant::now();
        assert!(matches!(scheduler.tick(start), TickDecision::Render { .. }));
        assert_eq!(scheduler.tick(start + ms(16)), TickDecision::Skip);
        assert_eq!(
            scheduler.tick(start + ms(32)),
            TickDecision::Render { elapsed: ms(32) }
        );
        assert_eq!(scheduler.rendered(), 2);
        assert_eq!(scheduler.skipped(), 1);
    }

    #[test]
    fn vsync_jitter_does_not_halve_the_rate() {
        let mut scheduler = FrameScheduler::new();
        scheduler.set_target_refresh(Some(60.0)).unwrap();
        scheduler.start();
        let start = Instant::now();
        scheduler.tick(start);
        // A callback arriving slightly early still renders.
        let early = start + Duration::from_micros(16_300);
        assert!(matches!(scheduler.tick(early), TickDecision::Render { .. }));
    }

    #[test]
    fn uncapped_renders_every_tick() {
        let mut scheduler = FrameScheduler::new();
        scheduler.start();
        let start = Instant::now();
        for step in 0..5 {
            assert!(matches!(
                scheduler.tick(start + ms(step)),
                TickDecision::Render { .. }
            ));
        }
    }

    #[test]
    fn rejects_non_positive_rates() {
        let mut scheduler = FrameScheduler::new();
        assert_eq!(
            scheduler.set_target_refresh(Some(0.0)),
            Err(SchedulerError::InvalidRate(0.0))
        );
        assert!(scheduler.set_target_refresh(Some(f32::NAN)).is_err());
        assert!(scheduler.ceiling().is_none());
    }
}
