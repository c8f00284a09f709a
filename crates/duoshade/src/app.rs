use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use compositor::gpu::{GpuOptions, WgpuContext};
use compositor::{
    CommentDirectiveParser, ContextManager, PngSnapshotSink, PointerState, Preset, PresetScope,
    RenderSurface,
};
use scheduler::{
    FpsMeter, FrameScheduler, PreviewThrottle, RefreshRateEstimator, TickDecision,
};
use stageconfig::{StageConfig, SyncFraming, WindowConfig};
use surface_sync::{
    pair, ControlSession, DisplaySession, Endpoint, FpsSample, Framing, SurfaceRole, SyncError,
    SyncMessage, TimeSync,
};
use tracing::{debug, error, info, warn};
use winit::dpi::{PhysicalPosition, PhysicalSize};
use winit::event::{ElementState, Event, MouseButton, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoopWindowTarget};
use winit::window::{Fullscreen, Window, WindowBuilder, WindowId};

use crate::controls::{message_for, StageDefaults};
use crate::input::{control_action, display_action, Action};
use crate::loader::ThreadedLoader;

/// Upper bound between two sync pumps when neither window is redrawing.
const SYNC_INTERVAL: Duration = Duration::from_millis(4);
const STATS_INTERVAL: Duration = Duration::from_secs(1);
/// Measured refresh changes smaller than this keep the current ceiling.
const RETARGET_THRESHOLD: f32 = 1.0;

/// One window with the surface rendering into it.
struct SurfaceWindow {
    role: SurfaceRole,
    // Declared before `window`: the wgpu surface must be dropped first.
    surface: RenderSurface<WgpuContext>,
    scheduler: FrameScheduler,
    pointer: PointerState,
    window: Arc<Window>,
}

impl SurfaceWindow {
    fn open(
        target: &EventLoopWindowTarget<()>,
        role: SurfaceRole,
        config: &WindowConfig,
        gpu: &GpuOptions,
        loader: ThreadedLoader,
        now: Instant,
    ) -> Result<Self> {
        let title = config
            .title
            .clone()
            .unwrap_or_else(|| format!("duoshade {role}"));
        let mut builder = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(config.width, config.height));
        if config.fullscreen {
            builder = builder.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }
        let window = Arc::new(
            builder
                .build(target)
                .map_err(|err| anyhow!("failed to create {role} window: {err}"))?,
        );

        let size = window.inner_size();
        let canvas = (size.width.max(1), size.height.max(1));
        let manager = match WgpuContext::new(window.as_ref(), canvas, gpu) {
            Ok(context) => {
                info!(%role, adapter = context.adapter_name(), "graphics context ready");
                ContextManager::new(context)
            }
            Err(err) => {
                error!(%role, "graphics context unavailable: {err:#}");
                ContextManager::unavailable(format!("{err:#}"))
            }
        };

        let mut surface = RenderSurface::new(
            manager,
            Box::new(CommentDirectiveParser),
            Box::new(loader),
            now,
        );
        surface.set_aspect(config.aspect_ratio()?);

        let mut scheduler = FrameScheduler::new();
        scheduler.set_target_refresh(config.fps_cap())?;
        scheduler.start();

        Ok(Self {
            role,
            surface,
            scheduler,
            pointer: PointerState::default(),
            window,
        })
    }

    fn id(&self) -> WindowId {
        self.window.id()
    }

    /// Renders if the scheduler accepts this tick; true when a frame was presented.
    fn tick(&mut self, now: Instant) -> bool {
        match self.scheduler.tick(now) {
            TickDecision::Render { .. } => match self.surface.render(now) {
                Ok(_) => true,
                Err(err) => {
                    warn!(role = %self.role, error = %err, "tick skipped");
                    false
                }
            },
            TickDecision::Skip | TickDecision::Idle => false,
        }
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        if let Err(err) = self.surface.resize(size.width, size.height) {
            warn!(role = %self.role, error = %err, "failed to resize surface");
        }
    }

    fn set_cursor(&mut self, position: PhysicalPosition<f64>) {
        let height = self.window.inner_size().height as f32;
        self.pointer.x = position.x as f32;
        self.pointer.y = height - position.y as f32;
        self.surface.set_pointer(self.pointer);
    }

    fn set_button(&mut self, state: ElementState) {
        self.pointer.down = state == ElementState::Pressed;
        self.surface.set_pointer(self.pointer);
    }

    fn toggle_fullscreen(&self) {
        let next = match self.window.fullscreen() {
            Some(_) => None,
            None => Some(Fullscreen::Borderless(None)),
        };
        self.window.set_fullscreen(next);
    }

    fn monitor_refresh(&self) -> Option<f32> {
        let millihertz = self.window.current_monitor()?.refresh_rate_millihertz()?;
        Some(millihertz as f32 / 1000.0)
    }
}

/// Where display frames are written when capturing.
#[derive(Debug, Clone)]
pub struct CaptureTarget {
    pub dir: PathBuf,
    pub every: u64,
}

/// Both surfaces plus the link between them, driven by one event loop.
pub struct StageApp {
    control: SurfaceWindow,
    display: SurfaceWindow,
    control_sync: ControlSession<Endpoint>,
    display_sync: DisplaySession<Endpoint>,
    defaults: StageDefaults,
    throttle: PreviewThrottle,
    preview_cap: Option<f32>,
    last_display_fps: Option<FpsSample>,
    display_meter: FpsMeter,
    refresh: RefreshRateEstimator,
    display_cap: Option<f32>,
    display_target: f32,
    fps_report_interval: Duration,
    time_sync_interval: Duration,
    next_fps_report: Instant,
    next_time_sync: Instant,
    next_stats: Instant,
}

impl StageApp {
    pub fn new(
        target: &EventLoopWindowTarget<()>,
        config: &StageConfig,
        defaults: StageDefaults,
        loaders: (ThreadedLoader, ThreadedLoader),
        capture: Option<CaptureTarget>,
    ) -> Result<Self> {
        let now = Instant::now();
        let (control_loader, display_loader) = loaders;
        let mut control = SurfaceWindow::open(
            target,
            SurfaceRole::Control,
            &config.control,
            &config.gpu,
            control_loader,
            now,
        )?;
        let mut display = SurfaceWindow::open(
            target,
            SurfaceRole::Display,
            &config.display,
            &config.gpu,
            display_loader,
            now,
        )?;

        let throttle = PreviewThrottle::new();
        let preview_cap = config.control.fps_cap();
        control
            .scheduler
            .set_target_refresh(Some(preview_target(preview_cap, throttle.fps())))?;

        let display_cap = config.display.fps_cap();
        let display_target = match display_cap {
            Some(cap) => cap,
            None => {
                let measured = display.monitor_refresh();
                if let Some(hz) = measured {
                    display.scheduler.set_target_refresh(Some(hz))?;
                }
                measured.unwrap_or(0.0)
            }
        };
        info!(
            target_fps = display_target,
            capped = display_cap.is_some(),
            "display pacing"
        );

        if let Some(capture) = capture {
            std::fs::create_dir_all(&capture.dir).with_context(|| {
                format!("failed to create capture directory {}", capture.dir.display())
            })?;
            info!(dir = %capture.dir.display(), every = capture.every, "capturing display frames");
            display
                .surface
                .register_sink(Box::new(PngSnapshotSink::new(capture.dir, capture.every)));
        }

        let framing = match config.sync.framing {
            SyncFraming::Direct => Framing::Direct,
            SyncFraming::Json => Framing::Json,
        };
        let (control_end, display_end) = pair(config.sync.capacity, framing);

        Ok(Self {
            control,
            display,
            control_sync: ControlSession::new(control_end),
            display_sync: DisplaySession::new(display_end),
            defaults,
            throttle,
            preview_cap,
            last_display_fps: None,
            display_meter: FpsMeter::default(),
            refresh: RefreshRateEstimator::default(),
            display_cap,
            display_target,
            fps_report_interval: config.sync.fps_report_interval,
            time_sync_interval: config.sync.time_sync_interval,
            next_fps_report: now + config.sync.fps_report_interval,
            next_time_sync: now + config.sync.time_sync_interval,
            next_stats: now + STATS_INTERVAL,
        })
    }

    /// Applies a state change on the control surface and forwards it to the display.
    pub fn apply(&mut self, message: SyncMessage) {
        let kind = message.kind();
        if let Err(err) = self
            .control_sync
            .apply(&mut self.control.surface, message, Instant::now())
        {
            warn!(message = kind, error = %err, "control surface could not apply update");
        }
    }

    /// Binds a texture to one of the control program's input channels.
    ///
    /// Channel bindings travel to the display with the init snapshot.
    pub fn bind_channel(&mut self, index: usize, reference: String) {
        self.control.surface.set_channel(index, Some(reference));
    }

    /// Fills the shared preset bank before the display connects.
    pub fn preload_global_presets(&mut self, presets: Vec<Preset>) {
        for (index, preset) in presets.into_iter().enumerate() {
            self.control
                .surface
                .store_preset(PresetScope::Global, index, preset);
        }
    }

    pub fn handle_event(&mut self, event: Event<()>, target: &EventLoopWindowTarget<()>) {
        match event {
            Event::WindowEvent { window_id, event } => self.window_event(window_id, event, target),
            Event::AboutToWait => {
                let now = Instant::now();
                if let Err(err) = self.sync(now) {
                    error!("surface link failed: {err}");
                    target.exit();
                    return;
                }
                self.log_stats(now);
                self.control.window.request_redraw();
                self.display.window.request_redraw();
                target.set_control_flow(ControlFlow::WaitUntil(now + SYNC_INTERVAL));
            }
            Event::LoopExiting => {
                info!("shutting down surfaces");
                self.control.surface.shutdown();
                self.display.surface.shutdown();
            }
            _ => {}
        }
    }

    fn window_event(
        &mut self,
        id: WindowId,
        event: WindowEvent,
        target: &EventLoopWindowTarget<()>,
    ) {
        let role = if id == self.control.id() {
            SurfaceRole::Control
        } else if id == self.display.id() {
            SurfaceRole::Display
        } else {
            return;
        };
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => target.exit(),
            WindowEvent::Resized(size) => self.window_mut(role).resize(size),
            WindowEvent::Moved(_) if role == SurfaceRole::Display => {
                // The window may now sit on a monitor with another refresh rate.
                self.refresh.reset();
            }
            WindowEvent::CursorMoved { position, .. } => self.window_mut(role).set_cursor(position),
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => self.window_mut(role).set_button(state),
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed && !event.repeat =>
            {
                let action = match role {
                    SurfaceRole::Control => control_action(&event.logical_key),
                    SurfaceRole::Display => display_action(&event.logical_key),
                };
                if let Some(action) = action {
                    self.perform(role, action, target);
                }
            }
            WindowEvent::RedrawRequested => self.redraw(role, Instant::now()),
            _ => {}
        }
    }

    fn window_mut(&mut self, role: SurfaceRole) -> &mut SurfaceWindow {
        match role {
            SurfaceRole::Control => &mut self.control,
            SurfaceRole::Display => &mut self.display,
        }
    }

    fn perform(&mut self, role: SurfaceRole, action: Action, target: &EventLoopWindowTarget<()>) {
        let now = Instant::now();
        match (role, action) {
            (_, Action::Quit) => target.exit(),
            (SurfaceRole::Display, Action::ToggleFullscreen) => self.display.toggle_fullscreen(),
            (SurfaceRole::Display, Action::RecallPreset(index)) => {
                let recalled = self.display_sync.recall_preset(
                    &mut self.display.surface,
                    PresetScope::Local,
                    index,
                );
                if !recalled {
                    debug!(index, "no preset to recall on the display");
                }
            }
            (SurfaceRole::Display, _) => {}
            (SurfaceRole::Control, Action::RecallPreset(index)) => {
                let recalled = self.control_sync.recall_preset(
                    &mut self.control.surface,
                    PresetScope::Local,
                    index,
                );
                if !recalled {
                    debug!(index, "no preset to recall");
                }
            }
            (SurfaceRole::Control, Action::SavePreset(scope)) => {
                let index = self
                    .control_sync
                    .save_preset(&mut self.control.surface, scope, None);
                info!(?scope, slot = index + 1, "preset saved");
            }
            (SurfaceRole::Control, action) => {
                match message_for(&self.control.surface, action, &self.defaults, now) {
                    Some(message) => self.apply(message),
                    None => debug!(?action, "shortcut has nothing to act on"),
                }
            }
        }
    }

    fn redraw(&mut self, role: SurfaceRole, now: Instant) {
        match role {
            SurfaceRole::Control => {
                self.control.tick(now);
            }
            SurfaceRole::Display => {
                // Nothing is shown until the init snapshot landed.
                if !self.display_sync.is_ready() {
                    return;
                }
                if self.display.tick(now) {
                    self.refresh.record_present(now);
                    self.display_meter.frame(now);
                    self.retarget_display();
                }
            }
        }
    }

    fn retarget_display(&mut self) {
        if self.display_cap.is_some() {
            return;
        }
        let Some(measured) = self.refresh.estimate() else {
            return;
        };
        if (measured - self.display_target).abs() < RETARGET_THRESHOLD {
            return;
        }
        match self.display.scheduler.set_target_refresh(Some(measured)) {
            Ok(()) => {
                info!(refresh_hz = measured, "display refresh measured");
                self.display_target = measured;
            }
            Err(err) => warn!(error = %err, "ignoring measured refresh rate"),
        }
    }

    /// Moves queued messages across the link in both directions.
    fn sync(&mut self, now: Instant) -> Result<(), SyncError> {
        self.control_sync.pump(&mut self.control.surface, now)?;
        self.follow_display_rate();

        if now >= self.next_time_sync {
            self.next_time_sync = now + self.time_sync_interval;
            if self.control_sync.display_online() {
                let clock = self.control.surface.clock();
                self.control_sync.publish(SyncMessage::TimeSync(TimeSync {
                    time: clock.time_at(now),
                    frame: clock.frame(),
                    playing: clock.is_playing(),
                }));
            }
        }

        let sent = self.control_sync.flush()?;
        if sent.deferred > 0 {
            debug!(deferred = sent.deferred, "control lanes full; retrying next tick");
        }

        let report = self.display_sync.pump(&mut self.display.surface, now)?;
        if report.dropped > 0 {
            debug!(
                received = report.received,
                dropped = report.dropped,
                "display skipped superseded updates"
            );
        }

        if now >= self.next_fps_report {
            self.next_fps_report = now + self.fps_report_interval;
            if let Some(fps) = self.display_meter.fps() {
                self.display_sync.report_fps(fps, self.display_target);
            }
        }
        self.display_sync.flush()?;
        Ok(())
    }

    fn follow_display_rate(&mut self) {
        let Some(sample) = self.control_sync.display_fps() else {
            return;
        };
        if self.last_display_fps == Some(sample) {
            return;
        }
        self.last_display_fps = Some(sample);
        if let Some(fps) = self.throttle.observe(sample.fps, sample.target) {
            let target = preview_target(self.preview_cap, fps);
            info!(
                preview_fps = target,
                display_fps = sample.fps,
                display_target = sample.target,
                "preview rate adjusted"
            );
            if let Err(err) = self.control.scheduler.set_target_refresh(Some(target)) {
                warn!(error = %err, "failed to adjust preview rate");
            }
        }
    }

    fn log_stats(&mut self, now: Instant) {
        if now < self.next_stats {
            return;
        }
        self.next_stats = now + STATS_INTERVAL;
        debug!(
            control_rendered = self.control.scheduler.rendered(),
            control_skipped = self.control.scheduler.skipped(),
            display_rendered = self.display.scheduler.rendered(),
            display_skipped = self.display.scheduler.skipped(),
            display_fps = ?self.display_meter.fps(),
            preview_fps = self.throttle.fps(),
            queued = self.control_sync.outbox().pending_len(),
            "render stats"
        );
    }
}

/// The throttle never lifts the preview above an explicit cap.
fn preview_target(cap: Option<f32>, throttle_fps: f32) -> f32 {
    cap.map_or(throttle_fps, |cap| cap.min(throttle_fps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_preview_cap_wins_over_throttle() {
        assert_eq!(preview_target(None, 60.0), 60.0);
        assert_eq!(preview_target(Some(24.0), 60.0), 24.0);
        assert_eq!(preview_target(Some(120.0), 30.0), 30.0);
    }
}
