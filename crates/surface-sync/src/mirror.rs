use std::collections::HashMap;
use std::time::Instant;

use compositor::{GraphicsContext, PresetScope, RenderSurface};
use tracing::{debug, info, warn};

use crate::apply::apply_message;
use crate::conflate::{FlushReport, Outbox};
use crate::error::SyncError;
use crate::link::Transport;
use crate::message::{Channel, Envelope, PresetSync, SurfaceRole, SyncMessage, PROTOCOL_VERSION};

/// Updates parked while the display waits for its first init.
const HELD_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub received: usize,
    pub applied: usize,
    /// Updates older than the init that covers them, or duplicates.
    pub dropped: usize,
}

/// Display-surface end of the protocol.
///
/// Nothing is applied before the first init. Updates that arrive ahead of
/// it are held and replayed afterwards if the init does not already cover
/// them, so the first rendered frame always shows a consistent state.
pub struct DisplaySession<T: Transport> {
    transport: T,
    outbox: Outbox,
    init_seq: Option<u64>,
    last_seq: HashMap<Channel, u64>,
    held: Vec<Envelope>,
}

impl<T: Transport> DisplaySession<T> {
    /// Creates the session and queues the hello that asks for an init.
    pub fn new(transport: T) -> Self {
        let mut session = Self {
            transport,
            outbox: Outbox::new(SurfaceRole::Display),
            init_seq: None,
            last_seq: HashMap::new(),
            held: Vec::new(),
        };
        session.request_init();
        session
    }

    /// Queues a hello; the control surface answers every hello with an init.
    fn request_init(&mut self) {
        self.outbox.push(SyncMessage::Hello {
            protocol: PROTOCOL_VERSION,
        });
    }

    /// True once an init has been applied; render only after this.
    pub fn is_ready(&self) -> bool {
        self.init_seq.is_some()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Applies everything the control surface sent since the previous tick.
    ///
    /// The state lane is drained first, so an init always lands before the
    /// updates that follow it.
    pub fn pump<C: GraphicsContext>(
        &mut self,
        surface: &mut RenderSurface<C>,
        now: Instant,
    ) -> Result<PumpReport, SyncError> {
        let mut report = PumpReport::default();
        for channel in Channel::OUTBOUND {
            loop {
                let envelope = match self.transport.try_recv(channel) {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => break,
                    Err(SyncError::ProtocolMismatch(reason)) => {
                        warn!(channel = channel.name(), %reason, "skipping malformed frame");
                        if channel == Channel::State && self.init_seq.is_none() {
                            self.request_init();
                        }
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                report.received += 1;
                self.receive(surface, channel, envelope, now, &mut report);
            }
        }
        Ok(report)
    }

    fn receive<C: GraphicsContext>(
        &mut self,
        surface: &mut RenderSurface<C>,
        channel: Channel,
        envelope: Envelope,
        now: Instant,
        report: &mut PumpReport,
    ) {
        if envelope.origin == SurfaceRole::Display {
            debug!(seq = envelope.seq, "dropping reflected display message");
            report.dropped += 1;
            return;
        }
        let last = self.last_seq.entry(channel).or_default();
        if envelope.seq <= *last {
            report.dropped += 1;
            return;
        }
        *last = envelope.seq;

        if envelope.message.is_global_barrier() {
            self.apply(surface, envelope.message, now, report);
            self.init_seq = Some(envelope.seq);
            info!(seq = envelope.seq, "display initialized from control state");
            let mut held = std::mem::take(&mut self.held);
            held.sort_by_key(|held| held.seq);
            for parked in held {
                if parked.seq > envelope.seq {
                    self.apply(surface, parked.message, now, report);
                } else {
                    report.dropped += 1;
                }
            }
            return;
        }

        match self.init_seq {
            None => {
                if self.held.len() >= HELD_LIMIT {
                    self.held.remove(0);
                    report.dropped += 1;
                }
                self.held.push(envelope);
            }
            Some(init) if envelope.seq < init => report.dropped += 1,
            Some(_) => self.apply(surface, envelope.message, now, report),
        }
    }

    fn apply<C: GraphicsContext>(
        &mut self,
        surface: &mut RenderSurface<C>,
        message: SyncMessage,
        now: Instant,
        report: &mut PumpReport,
    ) {
        let kind = message.kind();
        match apply_message(surface, message, now) {
            Ok(()) => report.applied += 1,
            Err(err) => warn!(message = kind, error = %err, "synced update left the context unusable"),
        }
    }

    /// Recalls a preset from a local shortcut and reports it to the control surface.
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

    pub fn report_fps(&mut self, fps: f32, target: f32) {
        self.outbox.push(SyncMessage::FpsReport { fps, target });
    }

    pub fn flush(&mut self) -> Result<FlushReport, SyncError> {
        self.outbox.flush(&self.transport)
    }
}
