//! Payloads exchanged between the control and display surfaces.
//!
//! Every payload is plain data copied out of a surface; nothing here refers
//! to a renderer. Field names are camelCase on the wire.

use std::fmt;

use compositor::{
    AssetRef, BlendMode, ChannelUpdate, MixerConfig, ParamValue, ParameterSet, Preset,
    PresetScope, ProgramKind, ProgramSlot, SurfaceSnapshot, TileLayout, TiledConfig,
};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Decodes an init field by field.
///
/// A malformed field keeps its default instead of rejecting the whole
/// snapshot; parameter maps drop only the entries that do not decode.
fn lenient_snapshot<'de, D>(deserializer: D) -> Result<Box<SurfaceSnapshot>, D::Error>
where
    D: Deserializer<'de>,
{
    let fields = Map::<String, Value>::deserialize(deserializer)?;
    let mut accepted = Map::new();
    for (name, value) in fields {
        let value = if name == "params" {
            retain_valid_params(value)
        } else {
            value
        };
        let single: Map<String, Value> = std::iter::once((name.clone(), value.clone())).collect();
        match SurfaceSnapshot::deserialize(Value::Object(single)) {
            Ok(_) => {
                accepted.insert(name, value);
            }
            Err(err) => warn!(field = %name, error = %err, "defaulting malformed init field"),
        }
    }
    SurfaceSnapshot::deserialize(Value::Object(accepted))
        .map(Box::new)
        .map_err(de::Error::custom)
}

fn retain_valid_params(value: Value) -> Value {
    let Value::Object(entries) = value else {
        return value;
    };
    let kept = entries
        .into_iter()
        .filter(|(name, value)| {
            let valid = ParamValue::deserialize(value).is_ok();
            if !valid {
                warn!(param = %name, "dropping malformed init parameter");
            }
            valid
        })
        .collect();
    Value::Object(kept)
}

/// Bumped whenever a payload changes shape incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceRole {
    Control,
    Display,
}

impl fmt::Display for SurfaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceRole::Control => f.write_str("control"),
            SurfaceRole::Display => f.write_str("display"),
        }
    }
}

/// Independent FIFO lanes; nothing is ordered across lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    State,
    Params,
    Tiles,
    Mixer,
    /// Display to control.
    Feedback,
}

impl Channel {
    /// Lanes written by the control surface, in flush order.
    pub const OUTBOUND: [Channel; 4] = [
        Channel::State,
        Channel::Params,
        Channel::Tiles,
        Channel::Mixer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Channel::State => "state",
            Channel::Params => "params",
            Channel::Tiles => "tiles",
            Channel::Mixer => "mixer",
            Channel::Feedback => "feedback",
        }
    }
}

/// Identity of a conflatable field; later values replace earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKey {
    Time,
    Param(String),
    TileParam(usize, String),
    MixerAlpha(usize),
    FpsReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ProgramKind>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSync {
    pub time: f64,
    #[serde(default)]
    pub frame: u64,
    #[serde(default = "playing_by_default")]
    pub playing: bool,
}

fn playing_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetSync {
    #[serde(default)]
    pub scope: PresetScope,
    pub index: usize,
    #[serde(default)]
    pub params: ParameterSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerChannelUpdate {
    pub channel_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<ProgramSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ParameterSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRef>,
    #[serde(default)]
    pub clear: bool,
}

impl From<MixerChannelUpdate> for ChannelUpdate {
    fn from(update: MixerChannelUpdate) -> Self {
        ChannelUpdate {
            slot: update.slot,
            params: update.params,
            asset: update.asset,
            clear: update.clear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SyncMessage {
    /// Full state for a display that just came online.
    Init(#[serde(deserialize_with = "lenient_snapshot")] Box<SurfaceSnapshot>),
    ProgramUpdate(ProgramUpdate),
    TimeSync(TimeSync),
    ParamUpdate {
        name: String,
        value: ParamValue,
    },
    ParamBatchUpdate(ParameterSet),
    /// Stores a preset body at `index` and recalls it.
    PresetSync(PresetSync),
    #[serde(rename_all = "camelCase")]
    PresetSave {
        #[serde(default)]
        scope: PresetScope,
        index: usize,
        preset: Preset,
    },
    /// Removes `preset` from `index`; a no-op once something else sits there.
    #[serde(rename_all = "camelCase")]
    PresetRemove {
        #[serde(default)]
        scope: PresetScope,
        index: usize,
        preset: Preset,
    },
    Blackout(bool),
    /// `None` leaves asset mode.
    AssetUpdate(Option<AssetRef>),
    TileInit(TiledConfig),
    TileLayoutUpdate(TileLayout),
    #[serde(rename_all = "camelCase")]
    TileAssign {
        tile_index: usize,
        #[serde(default)]
        slot: Option<ProgramSlot>,
        #[serde(default)]
        params: Option<ParameterSet>,
    },
    #[serde(rename_all = "camelCase")]
    TileParamUpdate {
        tile_index: usize,
        name: String,
        value: ParamValue,
    },
    #[serde(rename_all = "camelCase")]
    TileVisibility { tile_index: usize, visible: bool },
    TileExit,
    MixerInit(MixerConfig),
    MixerChannelUpdate(MixerChannelUpdate),
    #[serde(rename_all = "camelCase")]
    MixerAlphaUpdate { channel_index: usize, alpha: f32 },
    #[serde(rename_all = "camelCase")]
    MixerBlendMode { blend_mode: BlendMode },
    MixerExit,
    /// Display is online and wants an [`SyncMessage::Init`].
    Hello { protocol: u32 },
    FpsReport { fps: f32, target: f32 },
}

impl SyncMessage {
    pub fn param(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        SyncMessage::ParamUpdate {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn program(slot: &ProgramSlot) -> Self {
        SyncMessage::ProgramUpdate(ProgramUpdate {
            mode: Some(slot.kind),
            source: slot.source.clone(),
        })
    }

    /// Lane the message travels on when sent by `origin`.
    pub fn channel(&self, origin: SurfaceRole) -> Channel {
        if origin == SurfaceRole::Display {
            return Channel::Feedback;
        }
        match self {
            SyncMessage::ParamUpdate { .. } | SyncMessage::ParamBatchUpdate(_) => Channel::Params,
            SyncMessage::TileInit(_)
            | SyncMessage::TileLayoutUpdate(_)
            | SyncMessage::TileAssign { .. }
            | SyncMessage::TileParamUpdate { .. }
            | SyncMessage::TileVisibility { .. }
            | SyncMessage::TileExit => Channel::Tiles,
            SyncMessage::MixerInit(_)
            | SyncMessage::MixerChannelUpdate(_)
            | SyncMessage::MixerAlphaUpdate { .. }
            | SyncMessage::MixerBlendMode { .. }
            | SyncMessage::MixerExit => Channel::Mixer,
            _ => Channel::State,
        }
    }

    /// `Some` for high-frequency messages that may be coalesced per tick.
    ///
    /// Everything else is a barrier within its lane.
    pub fn field_key(&self) -> Option<FieldKey> {
        match self {
            SyncMessage::TimeSync(_) => Some(FieldKey::Time),
            SyncMessage::ParamUpdate { name, .. } => Some(FieldKey::Param(name.clone())),
            SyncMessage::TileParamUpdate {
                tile_index, name, ..
            } => Some(FieldKey::TileParam(*tile_index, name.clone())),
            SyncMessage::MixerAlphaUpdate { channel_index, .. } => {
                Some(FieldKey::MixerAlpha(*channel_index))
            }
            SyncMessage::FpsReport { .. } => Some(FieldKey::FpsReport),
            _ => None,
        }
    }

    /// Holds back every other lane until it has been sent.
    pub fn is_global_barrier(&self) -> bool {
        matches!(self, SyncMessage::Init(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Init(_) => "init",
            SyncMessage::ProgramUpdate(_) => "programUpdate",
            SyncMessage::TimeSync(_) => "timeSync",
            SyncMessage::ParamUpdate { .. } => "paramUpdate",
            SyncMessage::ParamBatchUpdate(_) => "paramBatchUpdate",
            SyncMessage::PresetSync(_) => "presetSync",
            SyncMessage::PresetSave { .. } => "presetSave",
            SyncMessage::PresetRemove { .. } => "presetRemove",
            SyncMessage::Blackout(_) => "blackout",
            SyncMessage::AssetUpdate(_) => "assetUpdate",
            SyncMessage::TileInit(_) => "tileInit",
            SyncMessage::TileLayoutUpdate(_) => "tileLayoutUpdate",
            SyncMessage::TileAssign { .. } => "tileAssign",
            SyncMessage::TileParamUpdate { .. } => "tileParamUpdate",
            SyncMessage::TileVisibility { .. } => "tileVisibility",
            SyncMessage::TileExit => "tileExit",
            SyncMessage::MixerInit(_) => "mixerInit",
            SyncMessage::MixerChannelUpdate(_) => "mixerChannelUpdate",
            SyncMessage::MixerAlphaUpdate { .. } => "mixerAlphaUpdate",
            SyncMessage::MixerBlendMode { .. } => "mixerBlendMode",
            SyncMessage::MixerExit => "mixerExit",
            SyncMessage::Hello { .. } => "hello",
            SyncMessage::FpsReport { .. } => "fpsReport",
        }
    }
}

/// One message as it travels on a lane.
///
/// `seq` increases across every lane of one sender, so a receiver can tell
/// which updates an [`SyncMessage::Init`] already covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub origin: SurfaceRole,
    pub message: SyncMessage,
}

#[cfg(test)]
mod tests {
    use compositor::CHANNEL_COUNT;

    use super::*;

    #[test]
    fn lanes_follow_message_family() {
        let control = SurfaceRole::Control;
        assert_eq!(SyncMessage::param("speed", 1.0f32).channel(control), Channel::Params);
        assert_eq!(SyncMessage::TileExit.channel(control), Channel::Tiles);
        assert_eq!(SyncMessage::MixerExit.channel(control), Channel::Mixer);
        assert_eq!(SyncMessage::Blackout(true).channel(control), Channel::State);
        assert_eq!(
            SyncMessage::Blackout(true).channel(SurfaceRole::Display),
            Channel::Feedback
        );
    }

    #[test]
    fn only_high_frequency_fields_conflate() {
        assert_eq!(
            SyncMessage::param("tint", [1.0f32, 0.0, 0.0]).field_key(),
            Some(FieldKey::Param("tint".into()))
        );
        let alpha = SyncMessage::MixerAlphaUpdate {
            channel_index: 2,
            alpha: 0.5,
        };
        assert_eq!(alpha.field_key(), Some(FieldKey::MixerAlpha(2)));
        assert_eq!(SyncMessage::Blackout(false).field_key(), None);
        assert_eq!(SyncMessage::ParamBatchUpdate(ParameterSet::new()).field_key(), None);
    }

    #[test]
    fn wire_shape_uses_camel_case_tags() {
        let message = SyncMessage::TileParamUpdate {
            tile_index: 3,
            name: "speed".into(),
            value: ParamValue::Scalar(1.5),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "tileParamUpdate");
        assert_eq!(json["payload"]["tileIndex"], 3);
        assert_eq!(json["payload"]["value"], 1.5);

        let exit = serde_json::to_value(SyncMessage::TileExit).unwrap();
        assert_eq!(exit["type"], "tileExit");
    }

    #[test]
    fn init_accepts_a_short_channel_list() {
        let message: SyncMessage = serde_json::from_str(
            r#"{"type":"init","payload":{"channels":["a.png"],"blackout":true}}"#,
        )
        .unwrap();
        let SyncMessage::Init(snapshot) = message else {
            panic!("expected init");
        };
        assert_eq!(snapshot.channels[0].as_deref(), Some("a.png"));
        assert!(snapshot.channels[1..].iter().all(Option::is_none));
        assert!(snapshot.blackout);
    }

    #[test]
    fn malformed_init_fields_fall_back_to_defaults() {
        let message: SyncMessage = serde_json::from_str(
            r#"{"type":"init","payload":{
                "programSource":"void mainImage() {}",
                "mixerConfig":{"blendMode":"sideways"},
                "params":{"speed":2.0,"tint":"red"},
                "channels":["a.png","b.png","c.png","d.png","e.png"],
                "blackout":true
            }}"#,
        )
        .unwrap();
        let SyncMessage::Init(snapshot) = message else {
            panic!("expected init");
        };
        assert_eq!(snapshot.program_source.as_deref(), Some("void mainImage() {}"));
        assert!(snapshot.mixer_config.is_none());
        assert_eq!(snapshot.params.get("speed"), Some(&ParamValue::Scalar(2.0)));
        assert!(snapshot.params.get("tint").is_none());
        assert_eq!(snapshot.channels[CHANNEL_COUNT - 1].as_deref(), Some("d.png"));
        assert!(snapshot.blackout);
    }
}
