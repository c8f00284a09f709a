//! Bounded in-process lanes between a control and a display surface.

use std::collections::BTreeMap;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::SyncError;
use crate::message::{Channel, Envelope};

/// How envelopes are carried on a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Envelopes are moved as values.
    #[default]
    Direct,
    /// Envelopes are serialized to JSON text, as they would be between processes.
    Json,
}

/// Outcome of a failed send.
#[derive(Debug)]
pub enum SendFailure {
    /// The lane is at capacity; the envelope is handed back for a later retry.
    Full(Envelope),
    Failed(SyncError),
}

pub trait Transport {
    fn try_send(&self, channel: Channel, envelope: Envelope) -> Result<(), SendFailure>;

    /// `Ok(None)` when the lane is empty.
    fn try_recv(&self, channel: Channel) -> Result<Option<Envelope>, SyncError>;
}

enum Frame {
    Direct(Envelope),
    Json(String),
}

/// One side of a link: writes some lanes and reads the others.
pub struct Endpoint {
    framing: Framing,
    senders: BTreeMap<Channel, Sender<Frame>>,
    receivers: BTreeMap<Channel, Receiver<Frame>>,
}

/// Builds both ends of a link; every lane holds at most `capacity` envelopes.
///
/// The first endpoint belongs to the control surface and writes the
/// outbound lanes; the second belongs to the display and writes feedback.
pub fn pair(capacity: usize, framing: Framing) -> (Endpoint, Endpoint) {
    let capacity = capacity.max(1);
    let mut control = Endpoint::new(framing);
    let mut display = Endpoint::new(framing);
    for channel in Channel::OUTBOUND {
        let (tx, rx) = bounded(capacity);
        control.senders.insert(channel, tx);
        display.receivers.insert(channel, rx);
    }
    let (tx, rx) = bounded(capacity);
    display.senders.insert(Channel::Feedback, tx);
    control.receivers.insert(Channel::Feedback, rx);
    (control, display)
}

impl Endpoint {
    fn new(framing: Framing) -> Self {
        Self {
            framing,
            senders: BTreeMap::new(),
            receivers: BTreeMap::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

impl Transport for Endpoint {
    fn try_send(&self, channel: Channel, envelope: Envelope) -> Result<(), SendFailure> {
        let Some(sender) = self.senders.get(&channel) else {
            return Err(SendFailure::Failed(SyncError::ProtocolMismatch(format!(
                "this endpoint does not write the '{}' channel",
                channel.name()
            ))));
        };
        let frame = match self.framing {
            Framing::Direct => Frame::Direct(envelope),
            Framing::Json => match codec::encode(&envelope) {
                Ok(text) => Frame::Json(text),
                Err(err) => return Err(SendFailure::Failed(err)),
            },
        };
        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(Frame::Direct(envelope))) => Err(SendFailure::Full(envelope)),
            Err(TrySendError::Full(Frame::Json(text))) => match codec::decode(&text) {
                Ok(envelope) => Err(SendFailure::Full(envelope)),
                Err(err) => Err(SendFailure::Failed(err)),
            },
            Err(TrySendError::Disconnected(_)) => {
                Err(SendFailure::Failed(SyncError::Disconnected(channel.name())))
            }
        }
    }

    fn try_recv(&self, channel: Channel) -> Result<Option<Envelope>, SyncError> {
        let Some(receiver) = self.receivers.get(&channel) else {
            return Ok(None);
        };
        match receiver.try_recv() {
            Ok(Frame::Direct(envelope)) => Ok(Some(envelope)),
            Ok(Frame::Json(text)) => codec::decode(&text).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SyncError::Disconnected(channel.name())),
        }
    }
}
