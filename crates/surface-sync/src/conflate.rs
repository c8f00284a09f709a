//! Per-tick coalescing queue in front of a [`Transport`].
//!
//! Each lane holds an ordered list of segments. Conflatable messages land in
//! the trailing field group, where a newer value for the same key replaces
//! the older one in place. Any other message closes the group and acts as a
//! barrier, so everything queued before it is sent first. On flush a group
//! with more than one parameter turns into a single batched update.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use compositor::ParameterSet;
use tracing::{debug, trace};

use crate::error::SyncError;
use crate::link::{SendFailure, Transport};
use crate::message::{Channel, Envelope, FieldKey, SurfaceRole, SyncMessage};

/// Delivery state of one conflatable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldState {
    Idle,
    PendingSend,
    Sent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    /// Entries left queued because their lane was full.
    pub deferred: usize,
}

enum Segment {
    Fields(Vec<(FieldKey, SyncMessage)>),
    Message {
        message: SyncMessage,
        keys: Vec<FieldKey>,
    },
}

impl Segment {
    fn len(&self) -> usize {
        match self {
            Segment::Fields(fields) => fields.len(),
            Segment::Message { .. } => 1,
        }
    }
}

pub struct Outbox {
    origin: SurfaceRole,
    next_seq: u64,
    lanes: BTreeMap<Channel, VecDeque<Segment>>,
    pending: HashMap<FieldKey, usize>,
    sent: HashSet<FieldKey>,
    conflated: u64,
}

impl Outbox {
    pub fn new(origin: SurfaceRole) -> Self {
        Self {
            origin,
            next_seq: 1,
            lanes: BTreeMap::new(),
            pending: HashMap::new(),
            sent: HashSet::new(),
            conflated: 0,
        }
    }

    pub fn origin(&self) -> SurfaceRole {
        self.origin
    }

    /// Queues `message` for the next flush.
    pub fn push(&mut self, message: SyncMessage) {
        let lane = self.lanes.entry(message.channel(self.origin)).or_default();
        let Some(key) = message.field_key() else {
            lane.push_back(Segment::Message {
                message,
                keys: Vec::new(),
            });
            return;
        };
        if let Some(Segment::Fields(fields)) = lane.back_mut() {
            if let Some(entry) = fields.iter_mut().find(|(existing, _)| *existing == key) {
                entry.1 = message;
                self.conflated += 1;
                trace!(?key, "conflated pending field");
                return;
            }
            fields.push((key.clone(), message));
        } else {
            lane.push_back(Segment::Fields(vec![(key.clone(), message)]));
        }
        *self.pending.entry(key).or_default() += 1;
    }

    pub fn field_state(&self, key: &FieldKey) -> FieldState {
        if self.pending.get(key).is_some_and(|count| *count > 0) {
            FieldState::PendingSend
        } else if self.sent.contains(key) {
            FieldState::Sent
        } else {
            FieldState::Idle
        }
    }

    /// Number of queued entries across every lane.
    pub fn pending_len(&self) -> usize {
        self.lanes.values().flatten().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.values().all(VecDeque::is_empty)
    }

    /// Values replaced before they were ever sent.
    pub fn conflated(&self) -> u64 {
        self.conflated
    }

    /// Sends everything that fits, in lane order.
    ///
    /// A full lane keeps its remaining entries for the next flush. While an
    /// init message is waiting, later lanes are held back as well.
    pub fn flush(&mut self, transport: &dyn Transport) -> Result<FlushReport, SyncError> {
        let mut report = FlushReport::default();
        let channels: Vec<Channel> = self.lanes.keys().copied().collect();
        for channel in channels {
            let blocked_on_init = self.flush_lane(transport, channel, &mut report)?;
            if blocked_on_init {
                break;
            }
        }
        report.deferred = self.pending_len();
        if report.sent > 0 || report.deferred > 0 {
            debug!(origin = %self.origin, sent = report.sent, deferred = report.deferred, "flushed sync outbox");
        }
        Ok(report)
    }

    /// Returns true when the lane stopped on a pending init.
    fn flush_lane(
        &mut self,
        transport: &dyn Transport,
        channel: Channel,
        report: &mut FlushReport,
    ) -> Result<bool, SyncError> {
        let Some(mut lane) = self.lanes.remove(&channel) else {
            return Ok(false);
        };
        let mut outcome = Ok(false);
        while let Some(segment) = lane.pop_front() {
            let mut outgoing: VecDeque<(SyncMessage, Vec<FieldKey>)> = match segment {
                Segment::Fields(fields) => coalesce(fields).into(),
                Segment::Message { message, keys } => VecDeque::from([(message, keys)]),
            };
            let mut stopped = false;
            while let Some((message, keys)) = outgoing.pop_front() {
                let envelope = Envelope {
                    seq: self.next_seq,
                    origin: self.origin,
                    message,
                };
                match transport.try_send(channel, envelope) {
                    Ok(()) => {
                        self.next_seq += 1;
                        report.sent += 1;
                        self.mark_sent(keys);
                    }
                    Err(failure) => {
                        let message = match failure {
                            SendFailure::Full(envelope) => {
                                trace!(channel = channel.name(), "sync lane full, retrying next tick");
                                outcome = Ok(envelope.message.is_global_barrier());
                                envelope.message
                            }
                            SendFailure::Failed(err) => {
                                outcome = Err(err);
                                // The envelope is gone; its keys are no longer pending.
                                self.forget(&keys);
                                stopped = true;
                                break;
                            }
                        };
                        outgoing.push_front((message, keys));
                        stopped = true;
                        break;
                    }
                }
            }
            if stopped {
                for (message, keys) in outgoing.into_iter().rev() {
                    lane.push_front(Segment::Message { message, keys });
                }
                break;
            }
        }
        if !lane.is_empty() {
            self.lanes.insert(channel, lane);
        }
        outcome
    }

    fn mark_sent(&mut self, keys: Vec<FieldKey>) {
        self.forget(&keys);
        for key in keys {
            if self.field_state(&key) == FieldState::Idle {
                self.sent.insert(key);
            }
        }
    }

    fn forget(&mut self, keys: &[FieldKey]) {
        for key in keys {
            if let Some(count) = self.pending.get_mut(key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.pending.remove(key);
                }
            }
        }
    }
}

fn coalesce(fields: Vec<(FieldKey, SyncMessage)>) -> Vec<(SyncMessage, Vec<FieldKey>)> {
    let params = fields
        .iter()
        .filter(|(key, _)| matches!(key, FieldKey::Param(_)))
        .count();
    if params < 2 {
        return fields
            .into_iter()
            .map(|(key, message)| (message, vec![key]))
            .collect();
    }

    let mut out = Vec::with_capacity(fields.len() - params + 1);
    let mut batch = ParameterSet::new();
    let mut batch_keys = Vec::with_capacity(params);
    let mut batch_at = None;
    for (key, message) in fields {
        match message {
            SyncMessage::ParamUpdate { name, value } => {
                batch_at.get_or_insert(out.len());
                batch.set(name, value);
                batch_keys.push(key);
            }
            other => out.push((other, vec![key])),
        }
    }
    if let Some(at) = batch_at {
        out.insert(at, (SyncMessage::ParamBatchUpdate(batch), batch_keys));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use compositor::ParamValue;

    use super::*;
    use crate::link::{pair, Framing};

    /// Records sends and refuses once `capacity` is reached.
    struct Recorder {
        capacity: RefCell<usize>,
        sent: RefCell<Vec<(Channel, Envelope)>>,
    }

    impl Recorder {
        fn new(capacity: usize) -> Self {
            Self {
                capacity: RefCell::new(capacity),
                sent: RefCell::new(Vec::new()),
            }
        }

        fn messages(&self) -> Vec<SyncMessage> {
            self.sent
                .borrow()
                .iter()
                .map(|(_, envelope)| envelope.message.clone())
                .collect()
        }
    }

    impl Transport for Recorder {
        fn try_send(&self, channel: Channel, envelope: Envelope) -> Result<(), SendFailure> {
            let mut capacity = self.capacity.borrow_mut();
            if *capacity == 0 {
                return Err(SendFailure::Full(envelope));
            }
            *capacity -= 1;
            self.sent.borrow_mut().push((channel, envelope));
            Ok(())
        }

        fn try_recv(&self, _channel: Channel) -> Result<Option<Envelope>, SyncError> {
            Ok(None)
        }
    }

    fn speed(value: f32) -> SyncMessage {
        SyncMessage::param("speed", value)
    }

    #[test]
    fn last_value_per_key_wins_within_a_tick() {
        let mut outbox = Outbox::new(SurfaceRole::Control);
        outbox.push(speed(1.0));
        outbox.push(speed(1.5));
        outbox.push(speed(2.0));
        assert_eq!(outbox.pending_len(), 1);
        assert_eq!(outbox.conflated(), 2);

        let recorder = Recorder::new(usize::MAX);
        let report = outbox.flush(&recorder).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(recorder.messages(), vec![speed(2.0)]);
    }

    #[test]
    fn several_params_in_one_tick_become_one_batch() {
        let mut outbox = Outbox::new(SurfaceRole::Control);
        outbox.push(speed(2.0));
        outbox.push(SyncMessage::param("tint", [1.0f32, 0.0, 0.0]));
        outbox.push(speed(3.0));

        let recorder = Recorder::new(usize::MAX);
        outbox.flush(&recorder).unwrap();
        let mut expected = ParameterSet::new();
        expected.set("speed", 3.0f32);
        expected.set("tint", [1.0f32, 0.0, 0.0]);
        assert_eq!(recorder.messages(), vec![SyncMessage::ParamBatchUpdate(expected)]);
    }

    #[test]
    fn barrier_keeps_earlier_fields_ahead_of_it() {
        let mut outbox = Outbox::new(SurfaceRole::Control);
        outbox.push(SyncMessage::TileParamUpdate {
            tile_index: 0,
            name: "speed".into(),
            value: ParamValue::Scalar(1.0),
        });
        outbox.push(SyncMessage::TileExit);
        outbox.push(SyncMessage::TileParamUpdate {
            tile_index: 0,
            name: "speed".into(),
            value: ParamValue::Scalar(2.0),
        });

        let recorder = Recorder::new(usize::MAX);
        outbox.flush(&recorder).unwrap();
        let messages = recorder.messages();
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            messages[0],
            SyncMessage::TileParamUpdate { value: ParamValue::Scalar(v), .. } if v == 1.0
        ));
        assert_eq!(messages[1], SyncMessage::TileExit);
        assert!(matches!(
            messages[2],
            SyncMessage::TileParamUpdate { value: ParamValue::Scalar(v), .. } if v == 2.0
        ));
    }

    #[test]
    fn field_state_moves_from_pending_to_sent() {
        let mut outbox = Outbox::new(SurfaceRole::Control);
        let key = FieldKey::Param("speed".into());
        assert_eq!(outbox.field_state(&key), FieldState::Idle);
        outbox.push(speed(1.0));
        assert_eq!(outbox.field_state(&key), FieldState::PendingSend);
        outbox.flush(&Recorder::new(usize::MAX)).unwrap();
        assert_eq!(outbox.field_state(&key), FieldState::Sent);
        outbox.push(speed(1.0));
        assert_eq!(outbox.field_state(&key), FieldState::PendingSend);
    }

    #[test]
    fn full_lane_retries_next_tick_in_order() {
        let mut outbox = Outbox::new(SurfaceRole::Control);
        outbox.push(SyncMessage::Blackout(true));
        outbox.push(SyncMessage::Blackout(false));
        outbox.push(speed(4.0));

        let recorder = Recorder::new(1);
        let report = outbox.flush(&recorder).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.deferred, 2);
        let key = FieldKey::Param("speed".into());
        assert_eq!(outbox.field_state(&key), FieldState::PendingSend);

        *recorder.capacity.borrow_mut() = usize::MAX;
        outbox.flush(&recorder).unwrap();
        assert_eq!(
            recorder.messages(),
            vec![
                SyncMessage::Blackout(true),
                SyncMessage::Blackout(false),
                speed(4.0)
            ]
        );
        assert!(outbox.is_empty());
        assert_eq!(outbox.field_state(&key), FieldState::Sent);
    }

    #[test]
    fn sequence_numbers_only_advance_on_delivery() {
        let mut outbox = Outbox::new(SurfaceRole::Control);
        outbox.push(SyncMessage::Blackout(true));
        outbox.push(SyncMessage::Blackout(false));
        let recorder = Recorder::new(1);
        outbox.flush(&recorder).unwrap();
        *recorder.capacity.borrow_mut() = 1;
        outbox.flush(&recorder).unwrap();
        let seqs: Vec<u64> = recorder.sent.borrow().iter().map(|(_, e)| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn pending_init_holds_back_later_lanes() {
        let mut outbox = Outbox::new(SurfaceRole::Control);
        outbox.push(SyncMessage::Init(Box::default()));
        outbox.push(speed(1.0));

        let (control, display) = pair(1, Framing::Direct);
        control
            .try_send(
                Channel::State,
                Envelope {
                    seq: 0,
                    origin: SurfaceRole::Control,
                    message: SyncMessage::Blackout(false),
                },
            )
            .unwrap();
        let report = outbox.flush(&control).unwrap();
        assert_eq!(report.sent, 0);
        assert!(display.try_recv(Channel::Params).unwrap().is_none());

        display.try_recv(Channel::State).unwrap();
        let report = outbox.flush(&control).unwrap();
        assert_eq!(report.sent, 2);
        let init = display.try_recv(Channel::State).unwrap().unwrap();
        let param = display.try_recv(Channel::Params).unwrap().unwrap();
        assert!(init.seq < param.seq);
    }

    #[test]
    fn display_outbox_writes_feedback_only() {
        let mut outbox = Outbox::new(SurfaceRole::Display);
        outbox.push(SyncMessage::FpsReport {
            fps: 30.0,
            target: 60.0,
        });
        outbox.push(SyncMessage::FpsReport {
            fps: 59.0,
            target: 60.0,
        });
        let recorder = Recorder::new(usize::MAX);
        outbox.flush(&recorder).unwrap();
        let sent = recorder.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Channel::Feedback);
        assert_eq!(
            sent[0].1.message,
            SyncMessage::FpsReport {
                fps: 59.0,
                target: 60.0
            }
        );
    }
}
