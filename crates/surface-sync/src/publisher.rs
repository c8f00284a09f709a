use std::time::Instant;

use compositor::{GraphicsContext, PresetScope, RenderError, RenderSurface};
use tracing::{debug, info, warn};

use crate::apply::apply_message;
use crate::conflate::{FlushReport, Outbox};
use crate::error::SyncError;
use crate::link::Transport;
use crate::message::{Channel, PresetSync, SurfaceRole, SyncMessage, PROTOCOL_VERSION};

/// Frame rate last reported by the display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSample {
    pub fps: f32,
    pub target: f32,
}

/// Control-surface end of the protocol.
///
/// Local changes go through [`ControlSession::apply`], which updates the
/// control surface and queues the same message for the display. Queued
/// messages leave once per tick in [`ControlSession::flush`].
pub struct ControlSession<T: Transport> {
    transport: T,
    outbox: Outbox,
    display_online: bool,
    display_fps: Option<FpsSample>,
}

impl<T: Transport> ControlSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            outbox: Outbox::new(SurfaceRole::Control),
            display_online: false,
            display_fps: None,
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn display_online(&self) -> bool {
        self.display_online
    }

    pub fn display_fps(&self) -> Option<FpsSample> {
        self.display_fps
    }

    /// Applies `message` to the control surface and queues it for the display.
    ///
    /// The message is queued even when applying it failed locally, so the
    /// display never falls behind the operator's intent.
    pub fn apply<C: GraphicsContext>(
        &mut self,
        surface: &mut RenderSurface<C>,
        message: SyncMessage,
        now: Instant,
    ) -> Result<(), RenderError> {
        let result = apply_message(surface, message.clone(), now);
        self.outbox.push(message);
        result
    }

    /// Queues a message whose effect is already on the control surface.
    pub fn publish(&mut self, message: SyncMessage) {
        self.outbox.push(message);
    }

    /// Recalls a preset locally and sends its body along; false when missing.
    pub fn recall_preset<C: GraphicsContext>(
        &mut self,
        surface: &mut RenderSurface<C>,
        scope: PresetScope,
        index: usize,
    ) -> bool {
        let Some(params) = surface.recall_preset(scope, index) else {
            return false;
        };
        self.outbox
            .push(SyncMessage::PresetSync(PresetSync { scope, index, params }));
        true
    }

    /// Snapshots the current parameters into a new preset on both surfaces.
    pub fn save_preset<C: GraphicsContext>(
        &mut self,
        surface: &mut RenderSurface<C>,
        scope: PresetScope,
        name: Option<String>,
    ) -> usize {
        let index = surface.snapshot_preset(scope, name);
        if let Some(preset) = surface.presets(scope).get(index).cloned() {
            self.outbox.push(SyncMessage::PresetSave {
                scope,
                index,
                preset,
            });
        }
        index
    }

    /// Deletes a preset on both surfaces; false when `index` is empty.
    pub fn remove_preset<C: GraphicsContext>(
        &mut self,
        surface: &mut RenderSurface<C>,
        scope: PresetScope,
        index: usize,
    ) -> bool {
        let Some(preset) = surface.remove_preset(scope, index) else {
            return false;
        };
        self.outbox.push(SyncMessage::PresetRemove {
            scope,
            index,
            preset,
        });
        true
    }

    /// Handles everything the display sent since the previous tick.
    ///
    /// A display preset recall is applied here but never queued again.
    pub fn pump<C: GraphicsContext>(
        &mut self,
        surface: &mut RenderSurface<C>,
        now: Instant,
    ) -> Result<usize, SyncError> {
        let mut received = 0;
        loop {
            let envelope = match self.transport.try_recv(Channel::Feedback) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(SyncError::ProtocolMismatch(reason)) => {
                    warn!(%reason, "skipping malformed feedback frame");
                    continue;
                }
                Err(err) => return Err(err),
            };
            received += 1;
            if envelope.origin == SurfaceRole::Control {
                debug!(seq = envelope.seq, "dropping reflected control message");
                continue;
            }
            match envelope.message {
                SyncMessage::Hello { protocol } if protocol != PROTOCOL_VERSION => {
                    let err = SyncError::ProtocolMismatch(format!(
                        "display speaks protocol {protocol}, expected {PROTOCOL_VERSION}"
                    ));
                    warn!(error = %err, "ignoring display hello");
                }
                SyncMessage::Hello { .. } => {
                    info!("display online, sending full state");
                    self.display_online = true;
                    self.outbox
                        .push(SyncMessage::Init(Box::new(surface.snapshot(now))));
                }
                SyncMessage::FpsReport { fps, target } => {
                    self.display_fps = Some(FpsSample { fps, target });
                }
                message @ SyncMessage::PresetSync(_) => {
                    debug!("applying preset recalled on the display");
                    if let Err(err) = apply_message(surface, message, now) {
                        warn!(error = %err, "failed to apply display preset");
                    }
                }
                other => warn!(message = other.kind(), "unexpected feedback message"),
            }
        }
        Ok(received)
    }

    pub fn flush(&mut self) -> Result<FlushReport, SyncError> {
        self.outbox.flush(&self.transport)
    }
}
