//! Keeps a display surface mirroring the control surface.
//!
//! The control side applies every change locally through a
//! [`ControlSession`], which queues the same [`SyncMessage`] in a
//! conflating [`Outbox`]. Once per tick the outbox is flushed onto bounded
//! lanes (`state`, `params`, `tiles`, `mixer`); the display drains them in a
//! [`DisplaySession`] and applies each message onto its own
//! `RenderSurface`. The display talks back on the `feedback` lane: a hello
//! that requests the full init, frame-rate reports, and presets recalled
//! from its own shortcuts.
//!
//! Only copied payloads cross the link. Lanes are FIFO but unordered with
//! respect to each other, so every message is idempotent and updates for
//! parameters the receiver does not know are ignored.

mod apply;
pub mod codec;
mod conflate;
mod error;
mod link;
mod message;
mod mirror;
mod publisher;

pub use apply::apply_message;
pub use conflate::{FieldState, FlushReport, Outbox};
pub use error::SyncError;
pub use link::{pair, Endpoint, Framing, SendFailure, Transport};
pub use message::{
    Channel, Envelope, FieldKey, MixerChannelUpdate, PresetSync, ProgramUpdate, SurfaceRole,
    SyncMessage, TimeSync, PROTOCOL_VERSION,
};
pub use mirror::{DisplaySession, PumpReport};
pub use publisher::{ControlSession, FpsSample};
