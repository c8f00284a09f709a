use std::time::Instant;

use chrono::{Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};

/// Number of texture inputs every program may sample.
pub const CHANNEL_COUNT: usize = 4;

/// Opaque identifier of an image uploaded to a graphics context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Pointer position in canvas pixels (bottom-left origin).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointerState {
    pub x: f32,
    pub y: f32,
    pub down: bool,
}

impl PointerState {
    /// ShaderToy-style `iMouse`: xy current, zw click origin (negated when released).
    pub fn as_mouse(&self, click: [f32; 2]) -> [f32; 4] {
        if self.down {
            [self.x, self.y, click[0], click[1]]
        } else {
            [self.x, self.y, -click[0].abs(), -click[1].abs()]
        }
    }
}

/// Per-tick snapshot handed unmodified to every renderer of that tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedFrameState {
    pub time: f64,
    pub time_delta: f32,
    pub frame: u64,
    pub pointer: PointerState,
    /// ShaderToy `iMouse`, see [`PointerState::as_mouse`].
    pub mouse: [f32; 4],
    /// `[year, month, day, seconds_of_day]`.
    pub date: [f32; 4],
    pub channel_textures: [Option<TextureId>; CHANNEL_COUNT],
    pub channel_resolutions: [[f32; 3]; CHANNEL_COUNT],
}

impl SharedFrameState {
    pub fn at(time: f64, frame: u64) -> Self {
        Self {
            time,
            time_delta: 0.0,
            frame,
            pointer: PointerState::default(),
            mouse: [0.0; 4],
            date: [0.0; 4],
            channel_textures: [None; CHANNEL_COUNT],
            channel_resolutions: [[0.0; 3]; CHANNEL_COUNT],
        }
    }
}

/// Texture inputs bound for the next capture.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelInputs {
    pub textures: [Option<TextureId>; CHANNEL_COUNT],
    pub resolutions: [[f32; 3]; CHANNEL_COUNT],
}

/// Surface-local time base.
///
/// `time = base + (now - anchor)` while playing; a paused clock keeps `base`.
/// [`FrameClock::resync`] adopts a remote time base without disturbing the
/// frame counter's monotonic progression.
#[derive(Debug, Clone)]
pub struct FrameClock {
    base: f64,
    anchor: Instant,
    playing: bool,
    frame: u64,
    last_time: Option<f64>,
    click: [f32; 2],
    pointer: PointerState,
}

impl FrameClock {
    pub fn new(now: Instant) -> Self {
        Self {
            base: 0.0,
            anchor: now,
            playing: true,
            frame: 0,
            last_time: None,
            click: [0.0; 2],
            pointer: PointerState::default(),
        }
    }

    pub fn time_at(&self, now: Instant) -> f64 {
        if self.playing {
            self.base + now.saturating_duration_since(self.anchor).as_secs_f64()
        } else {
            self.base
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn set_playing(&mut self, playing: bool, now: Instant) {
        if playing == self.playing {
            return;
        }
        self.base = self.time_at(now);
        self.anchor = now;
        self.playing = playing;
    }

    /// Adopts `time`/`frame` as of `now`.
    pub fn resync(&mut self, time: f64, frame: u64, playing: bool, now: Instant) {
        self.base = time.max(0.0);
        self.anchor = now;
        self.playing = playing;
        self.frame = frame;
        self.last_time = None;
    }

    pub fn set_pointer(&mut self, pointer: PointerState) {
        if pointer.down && !self.pointer.down {
            self.click = [pointer.x, pointer.y];
        }
        self.pointer = pointer;
    }

    pub fn pointer(&self) -> PointerState {
        self.pointer
    }

    pub fn click(&self) -> [f32; 2] {
        self.click
    }

    /// Captures the snapshot for one rendered tick and advances the frame counter.
    pub fn capture(&mut self, now: Instant, inputs: &ChannelInputs) -> SharedFrameState {
        let time = self.time_at(now);
        let time_delta = self
            .last_time
            .map(|last| (time - last).max(0.0) as f32)
            .unwrap_or(0.0);
        self.last_time = Some(time);
        let frame = self.frame;
        self.frame = self.frame.saturating_add(1);
        SharedFrameState {
            time,
            time_delta,
            frame,
            pointer: self.pointer,
            mouse: self.pointer.as_mouse(self.click),
            date: local_date(),
            channel_textures: inputs.textures,
            channel_resolutions: inputs.resolutions,
        }
    }
}

fn local_date() -> [f32; 4] {
    let local_now = Local::now();
    let seconds_since_midnight = local_now.num_seconds_from_midnight() as f32
        + local_now.nanosecond() as f32 / 1_000_000_000.0;
    [
        local_now.year() as f32,
        local_now.month() as f32,
        local_now.day() as f32,
        seconds_since_midnight,
    ]
}
