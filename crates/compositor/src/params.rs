//! Parameter sets, definitions, and presets.
//!
//! A [`ParameterSet`] is the unit of state exchanged between surfaces. A
//! renderer only accepts names that its program declares (plus the built-in
//! [`SPEED`]); everything else is ignored without error so that updates
//! racing a program change stay harmless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Built-in playback-rate parameter every program accepts.
pub const SPEED: &str = "speed";

/// Scalar or fixed-length numeric vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(f32),
    Vector(Vec<f32>),
}

impl ParamValue {
    pub fn components(&self) -> &[f32] {
        match self {
            ParamValue::Scalar(value) => std::slice::from_ref(value),
            ParamValue::Vector(values) => values,
        }
    }

    pub fn len(&self) -> usize {
        self.components().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components().is_empty()
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            ParamValue::Scalar(value) => Some(*value),
            ParamValue::Vector(values) if values.len() == 1 => Some(values[0]),
            ParamValue::Vector(_) => None,
        }
    }

    fn clamped(&self, min: Option<f32>, max: Option<f32>) -> Self {
        let clamp = |value: f32| {
            let value = min.map_or(value, |min| value.max(min));
            max.map_or(value, |max| value.min(max))
        };
        match self {
            ParamValue::Scalar(value) => ParamValue::Scalar(clamp(*value)),
            ParamValue::Vector(values) => {
                ParamValue::Vector(values.iter().copied().map(clamp).collect())
            }
        }
    }
}

impl From<f32> for ParamValue {
    fn from(value: f32) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Scalar(value as f32)
    }
}

impl From<Vec<f32>> for ParamValue {
    fn from(values: Vec<f32>) -> Self {
        ParamValue::Vector(values)
    }
}

impl<const N: usize> From<[f32; N]> for ParamValue {
    fn from(values: [f32; N]) -> Self {
        ParamValue::Vector(values.to_vec())
    }
}

/// Ordered name → value mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, ParamValue>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Copies every entry of `other` over this set; later writes win per key.
    pub fn overlay(&mut self, other: &ParameterSet) {
        for (name, value) in other.iter() {
            self.0.insert(name.to_string(), value.clone());
        }
    }

    /// Merges layers in order; entries of later layers win key-by-key.
    pub fn merged<'a>(layers: impl IntoIterator<Item = &'a ParameterSet>) -> ParameterSet {
        let mut merged = ParameterSet::new();
        for layer in layers {
            merged.overlay(layer);
        }
        merged
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

/// Value type declared by a program parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Float,
    Int,
    Bool,
    Vec2,
    Vec3,
    Vec4,
    Color,
}

impl ParamKind {
    pub fn component_count(self) -> usize {
        match self {
            ParamKind::Float | ParamKind::Int | ParamKind::Bool => 1,
            ParamKind::Vec2 => 2,
            ParamKind::Vec3 | ParamKind::Color => 3,
            ParamKind::Vec4 => 4,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "float" => Some(ParamKind::Float),
            "int" => Some(ParamKind::Int),
            "bool" => Some(ParamKind::Bool),
            "vec2" => Some(ParamKind::Vec2),
            "vec3" => Some(ParamKind::Vec3),
            "vec4" => Some(ParamKind::Vec4),
            "color" => Some(ParamKind::Color),
            _ => None,
        }
    }
}

/// Parameter definition extracted from program source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub kind: ParamKind,
    pub default: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_size: Option<usize>,
}

impl ParamDef {
    pub fn scalar(name: impl Into<String>, default: f32) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Float,
            default: ParamValue::Scalar(default),
            min: None,
            max: None,
            array_size: None,
        }
    }

    pub fn vector(name: impl Into<String>, kind: ParamKind, default: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: ParamValue::Vector(default),
            min: None,
            max: None,
            array_size: None,
        }
    }

    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Number of floats a value for this definition must carry.
    pub fn expected_len(&self) -> usize {
        self.kind.component_count() * self.array_size.unwrap_or(1).max(1)
    }

    /// Validates length and clamps to the declared range.
    pub fn accept(&self, value: &ParamValue) -> Option<ParamValue> {
        if value.len() != self.expected_len() {
            return None;
        }
        let value = match (self.expected_len(), value) {
            (1, ParamValue::Vector(values)) => ParamValue::Scalar(values[0]),
            _ => value.clone(),
        };
        Some(value.clamped(self.min, self.max))
    }
}

fn builtin_speed() -> ParamDef {
    ParamDef::scalar(SPEED, 1.0)
}

/// Live parameter values of one program, constrained by its definitions.
#[derive(Debug, Clone, Default)]
pub struct ProgramParams {
    defs: Vec<ParamDef>,
    values: ParameterSet,
}

impl ProgramParams {
    pub fn new(defs: &[ParamDef]) -> Self {
        let mut all = Vec::with_capacity(defs.len() + 1);
        if !defs.iter().any(|def| def.name == SPEED) {
            all.push(builtin_speed());
        }
        all.extend(defs.iter().cloned());
        let mut params = Self {
            defs: all,
            values: ParameterSet::new(),
        };
        params.reset();
        params
    }

    pub fn defs(&self) -> &[ParamDef] {
        &self.defs
    }

    pub fn values(&self) -> &ParameterSet {
        &self.values
    }

    pub fn def(&self, name: &str) -> Option<&ParamDef> {
        self.defs.iter().find(|def| def.name == name)
    }

    /// Restores every value to its declared default.
    pub fn reset(&mut self) {
        self.values = self
            .defs
            .iter()
            .map(|def| (def.name.clone(), def.default.clone()))
            .collect();
    }

    /// Sets one value; returns false when the name is unknown or the shape mismatches.
    pub fn set(&mut self, name: &str, value: &ParamValue) -> bool {
        let Some(accepted) = self.def(name).and_then(|def| def.accept(value)) else {
            return false;
        };
        self.values.set(name, accepted);
        true
    }

    /// Applies every known entry of `params`, returning how many were taken.
    pub fn apply(&mut self, params: &ParameterSet) -> usize {
        params
            .iter()
            .filter(|(name, value)| self.set(name, value))
            .count()
    }

    /// Resets to defaults, then applies `layers` in order.
    pub fn apply_layers<'a>(&mut self, layers: impl IntoIterator<Item = &'a ParameterSet>) {
        self.reset();
        for layer in layers {
            self.apply(layer);
        }
    }

    /// Keeps current values for names that survive a redefinition.
    pub fn redefine(&mut self, defs: &[ParamDef]) {
        let previous = std::mem::take(&mut self.values);
        *self = ProgramParams::new(defs);
        self.apply(&previous);
    }
}

/// Whether a preset belongs to the current program or to the shared bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresetScope {
    #[default]
    Local,
    Global,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub params: ParameterSet,
}

/// Ordered preset list with the most recently recalled index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetBank {
    presets: Vec<Preset>,
    active: Option<usize>,
}

impl PresetBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_presets(presets: Vec<Preset>, active: Option<usize>) -> Self {
        let active = active.filter(|index| *index < presets.len());
        Self { presets, active }
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn get(&self, index: usize) -> Option<&Preset> {
        self.presets.get(index)
    }

    /// Stores a copy of `params` and returns its index.
    pub fn snapshot(&mut self, name: Option<String>, params: &ParameterSet) -> usize {
        self.presets.push(Preset {
            name,
            params: params.clone(),
        });
        self.presets.len() - 1
    }

    /// Replaces the preset at `index` or appends when `index == len()`,
    /// used when a peer sends a preset body. Indices past the end would
    /// leave holes and are refused.
    pub fn store(&mut self, index: usize, params: ParameterSet) -> bool {
        match index.cmp(&self.presets.len()) {
            std::cmp::Ordering::Less => self.presets[index].params = params,
            std::cmp::Ordering::Equal => self.presets.push(Preset { name: None, params }),
            std::cmp::Ordering::Greater => {
                warn!(index, len = self.presets.len(), "ignoring preset beyond the end of the bank");
                return false;
            }
        }
        true
    }

    /// Like [`Self::store`] but also replaces the name.
    pub fn put(&mut self, index: usize, preset: Preset) -> bool {
        if !self.store(index, preset.params) {
            return false;
        }
        self.presets[index].name = preset.name;
        true
    }

    /// Marks `index` active and returns the preset, or `None` when missing.
    pub fn recall(&mut self, index: usize) -> Option<&Preset> {
        let preset = self.presets.get(index)?;
        self.active = Some(index);
        Some(preset)
    }

    pub fn remove(&mut self, index: usize) -> Option<Preset> {
        if index >= self.presets.len() {
            return None;
        }
        let removed = self.presets.remove(index);
        self.active = match self.active {
            Some(active) if active == index => None,
            Some(active) if active > index => Some(active - 1),
            other => other,
        };
        Some(removed)
    }

    /// Removes the preset at `index` only while it still equals `expected`,
    /// so replaying the same removal leaves the bank alone.
    pub fn remove_matching(&mut self, index: usize, expected: &Preset) -> Option<Preset> {
        if self.presets.get(index) != Some(expected) {
            return None;
        }
        self.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tint_program() -> ProgramParams {
        ProgramParams::new(&[ParamDef::vector(
            "tint",
            ParamKind::Color,
            vec![1.0, 1.0, 1.0],
        )])
    }

    #[test]
    fn unknown_names_are_ignored() {
        let mut params = tint_program();
        assert!(!params.set("missing", &ParamValue::Scalar(3.0)));
        assert!(params.values().get("missing").is_none());
    }

    #[test]
    fn mismatched_vector_length_is_rejected() {
        let mut params = tint_program();
        assert!(!params.set("tint", &ParamValue::Vector(vec![1.0, 0.0])));
        assert_eq!(
            params.values().get("tint"),
            Some(&ParamValue::Vector(vec![1.0, 1.0, 1.0]))
        );
    }

    #[test]
    fn range_is_clamped() {
        let mut params = ProgramParams::new(&[ParamDef::scalar("zoom", 1.0).with_range(0.5, 2.0)]);
        assert!(params.set("zoom", &ParamValue::Scalar(9.0)));
        assert_eq!(params.values().get("zoom"), Some(&ParamValue::Scalar(2.0)));
    }

    #[test]
    fn preset_round_trip_restores_exact_values() {
        let mut params = ProgramParams::new(&[
            ParamDef::vector("tint", ParamKind::Color, vec![0.2, 0.2, 0.2]),
            ParamDef::scalar("warp", 0.25),
        ]);
        let preset = Preset {
            name: Some("red".into()),
            params: [
                ("speed", ParamValue::Scalar(2.0)),
                ("tint", ParamValue::Vector(vec![1.0, 0.0, 0.0])),
            ]
            .into_iter()
            .collect(),
        };

        params.apply(&preset.params);

        assert_eq!(params.values().get("speed"), Some(&ParamValue::Scalar(2.0)));
        assert_eq!(
            params.values().get("tint"),
            Some(&ParamValue::Vector(vec![1.0, 0.0, 0.0]))
        );
        assert_eq!(params.values().get("warp"), Some(&ParamValue::Scalar(0.25)));
    }

    #[test]
    fn merged_layers_prefer_later_entries() {
        let defaults: ParameterSet = [("speed", 1.0), ("warp", 0.5)].into_iter().collect();
        let custom: ParameterSet = [("warp", 0.7)].into_iter().collect();
        let tile: ParameterSet = [("speed", 3.0)].into_iter().collect();

        let merged = ParameterSet::merged([&defaults, &custom, &tile]);

        assert_eq!(merged.get("speed"), Some(&ParamValue::Scalar(3.0)));
        assert_eq!(merged.get("warp"), Some(&ParamValue::Scalar(0.7)));
    }

    #[test]
    fn redefine_keeps_surviving_values() {
        let mut params = ProgramParams::new(&[ParamDef::scalar("warp", 0.1)]);
        params.set("warp", &ParamValue::Scalar(0.9));
        params.set(SPEED, &ParamValue::Scalar(4.0));

        params.redefine(&[ParamDef::scalar("glow", 0.3)]);

        assert_eq!(params.values().get(SPEED), Some(&ParamValue::Scalar(4.0)));
        assert!(params.values().get("warp").is_none());
        assert_eq!(params.values().get("glow"), Some(&ParamValue::Scalar(0.3)));
    }

    #[test]
    fn bank_recall_of_missing_index_is_a_no_op() {
        let mut bank = PresetBank::new();
        bank.snapshot(None, &ParameterSet::new());
        assert!(bank.recall(4).is_none());
        assert_eq!(bank.active(), None);
        assert!(bank.recall(0).is_some());
        assert_eq!(bank.active(), Some(0));
    }

    #[test]
    fn bank_refuses_indices_past_the_end() {
        let mut bank = PresetBank::new();
        assert!(!bank.store(usize::MAX, ParameterSet::new()));
        assert!(!bank.store(1_000_000_000, ParameterSet::new()));
        assert!(bank.is_empty());

        assert!(bank.store(0, ParameterSet::new()));
        assert!(bank.put(1, Preset { name: Some("b".into()), params: ParameterSet::new() }));
        assert!(!bank.put(3, Preset::default()));
        assert_eq!(bank.len(), 2);
    }

    #[test]
    fn matching_remove_applies_once() {
        let mut bank = PresetBank::new();
        for name in ["a", "b", "c"] {
            bank.snapshot(Some(name.into()), &ParameterSet::new());
        }
        let first = bank.get(0).cloned().unwrap();

        assert_eq!(bank.remove_matching(0, &first), Some(first.clone()));
        let once = bank.clone();
        assert_eq!(bank.remove_matching(0, &first), None);
        assert_eq!(bank, once);
        assert_eq!(bank.len(), 2);
    }

    #[test]
    fn bank_remove_shifts_active_index() {
        let mut bank = PresetBank::new();
        for _ in 0..3 {
            bank.snapshot(None, &ParameterSet::new());
        }
        bank.recall(2);
        bank.remove(0);
        assert_eq!(bank.active(), Some(1));
    }

    #[test]
    fn values_serialize_as_numbers_or_arrays() {
        let set: ParameterSet = [
            ("speed", ParamValue::Scalar(1.5)),
            ("tint", ParamValue::Vector(vec![1.0, 0.0, 0.0])),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&set).expect("serialize");
        assert_eq!(json, r#"{"speed":1.5,"tint":[1.0,0.0,0.0]}"#);
    }
}
