//! Sensor telemetry decoding
//!
//! A sensor query for packet group 6 answers with a fixed 52-byte block. Each
//! field sits at a documented offset; multi-byte values are big-endian. The
//! decoded values are kept in a [`SensorFrame`] keyed by the names the rest
//! of the crate reads (`bump-left`, `charging-state`, ...).

use crate::codec::pack_i16;
use crate::opcodes::RemoteOpcode;
use crate::{Result, RobotError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Response length for sensor packet group 6
pub const SENSOR_PACKET_LEN: usize = 52;

pub const BUMP_LEFT: &str = "bump-left";
pub const BUMP_RIGHT: &str = "bump-right";
pub const VIRTUAL_WALL: &str = "virtual-wall";
pub const CHARGING_STATE: &str = "charging-state";
pub const CHARGING_SOURCES_AVAILABLE: &str = "charging-sources-available";
pub const VOLTAGE: &str = "voltage";
pub const REMOTE_OPCODE: &str = "remote-opcode";
pub const CLIFF_LEFT_SIGNAL: &str = "cliff-left-signal";
pub const CLIFF_RIGHT_SIGNAL: &str = "cliff-right-signal";

/// Battery charging state reported by the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChargingState {
    NotCharging,
    ReconditioningCharging,
    FullCharging,
    TrickleCharging,
    Waiting,
    ChargingFault,
}

const CHARGING_STATES: [ChargingState; 6] = [
    ChargingState::NotCharging,
    ChargingState::ReconditioningCharging,
    ChargingState::FullCharging,
    ChargingState::TrickleCharging,
    ChargingState::Waiting,
    ChargingState::ChargingFault,
];

impl ChargingState {
    pub fn from_index(index: u8) -> Result<Self> {
        CHARGING_STATES
            .get(index as usize)
            .copied()
            .ok_or(RobotError::InvalidEnumValue { field: CHARGING_STATE, value: index as i32 })
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Full or trickle charging: the battery is taking charge normally
    pub fn is_settled(self) -> bool {
        matches!(self, ChargingState::FullCharging | ChargingState::TrickleCharging)
    }
}

/// A decoded sensor value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    Bool(bool),
    Int(i32),
    Charging(ChargingState),
    Remote(RemoteOpcode),
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Bool(b) => write!(f, "{}", b),
            SensorValue::Int(i) => write!(f, "{}", i),
            SensorValue::Charging(c) => write!(f, "{:?}", c),
            SensorValue::Remote(r) => write!(f, "{}", r),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    /// One bit of a shared byte
    Bit(u8),
    /// Whole byte, non-zero is true
    Flag,
    U8,
    I8,
    U16,
    I16,
    Charging,
    Remote,
}

impl FieldKind {
    fn width(self) -> usize {
        match self {
            FieldKind::U16 | FieldKind::I16 => 2,
            _ => 1,
        }
    }
}

struct FieldSpec {
    key: &'static str,
    offset: usize,
    kind: FieldKind,
}

const fn field(key: &'static str, offset: usize, kind: FieldKind) -> FieldSpec {
    FieldSpec { key, offset, kind }
}

const GROUP_6_LAYOUT: &[FieldSpec] = &[
    field(BUMP_RIGHT, 0, FieldKind::Bit(0x01)),
    field(BUMP_LEFT, 0, FieldKind::Bit(0x02)),
    field("wheel-drop-right", 0, FieldKind::Bit(0x04)),
    field("wheel-drop-left", 0, FieldKind::Bit(0x08)),
    field("wheel-drop-caster", 0, FieldKind::Bit(0x10)),
    field("wall", 1, FieldKind::Flag),
    field("cliff-left", 2, FieldKind::Flag),
    field("cliff-front-left", 3, FieldKind::Flag),
    field("cliff-front-right", 4, FieldKind::Flag),
    field("cliff-right", 5, FieldKind::Flag),
    field(VIRTUAL_WALL, 6, FieldKind::Flag),
    field("overcurrents", 7, FieldKind::U8),
    // 8 and 9 are unused
    field(REMOTE_OPCODE, 10, FieldKind::Remote),
    field("play-button", 11, FieldKind::Bit(0x01)),
    field("advance-button", 11, FieldKind::Bit(0x04)),
    field("distance", 12, FieldKind::I16),
    field("angle", 14, FieldKind::I16),
    field(CHARGING_STATE, 16, FieldKind::Charging),
    field(VOLTAGE, 17, FieldKind::U16),
    field("current", 19, FieldKind::I16),
    field("battery-temperature", 21, FieldKind::I8),
    field("battery-charge", 22, FieldKind::U16),
    field("battery-capacity", 24, FieldKind::U16),
    field("wall-signal", 26, FieldKind::U16),
    field(CLIFF_LEFT_SIGNAL, 28, FieldKind::U16),
    field("cliff-front-left-signal", 30, FieldKind::U16),
    field("cliff-front-right-signal", 32, FieldKind::U16),
    field(CLIFF_RIGHT_SIGNAL, 34, FieldKind::U16),
    field("user-digital-inputs", 36, FieldKind::U8),
    field("user-analog-input", 37, FieldKind::U16),
    field(CHARGING_SOURCES_AVAILABLE, 39, FieldKind::Flag),
    field("internal-charger", 39, FieldKind::Bit(0x01)),
    field("home-base", 39, FieldKind::Bit(0x02)),
    field("oi-mode", 40, FieldKind::U8),
    field("song-number", 41, FieldKind::U8),
    field("song-playing", 42, FieldKind::Flag),
    field("number-of-stream-packets", 43, FieldKind::U8),
    field("requested-velocity", 44, FieldKind::I16),
    field("requested-radius", 46, FieldKind::I16),
    field("requested-right-velocity", 48, FieldKind::I16),
    field("requested-left-velocity", 50, FieldKind::I16),
];

fn layout(key: &str) -> Result<&'static FieldSpec> {
    GROUP_6_LAYOUT
        .iter()
        .find(|spec| spec.key == key)
        .ok_or_else(|| RobotError::UnknownCommand(format!("sensor field '{}'", key)))
}

fn decode_field(spec: &FieldSpec, data: &[u8]) -> Result<SensorValue> {
    let b = &data[spec.offset..spec.offset + spec.kind.width()];
    let value = match spec.kind {
        FieldKind::Bit(mask) => SensorValue::Bool(b[0] & mask != 0),
        FieldKind::Flag => SensorValue::Bool(b[0] != 0),
        FieldKind::U8 => SensorValue::Int(b[0] as i32),
        FieldKind::I8 => SensorValue::Int(b[0] as i8 as i32),
        FieldKind::U16 => SensorValue::Int(u16::from_be_bytes([b[0], b[1]]) as i32),
        FieldKind::I16 => SensorValue::Int(i16::from_be_bytes([b[0], b[1]]) as i32),
        FieldKind::Charging => SensorValue::Charging(ChargingState::from_index(b[0])?),
        FieldKind::Remote => SensorValue::Remote(RemoteOpcode::from_code(b[0])?),
    };
    Ok(value)
}

/// Values decoded from one response, plus any fields that failed translation
#[derive(Debug)]
pub struct DecodedPacket {
    pub values: Vec<(&'static str, SensorValue)>,
    pub invalid: Vec<RobotError>,
}

/// Decode a full group 6 response.
///
/// A wrong length fails the whole packet. An enum field holding a value
/// outside its domain is reported in `invalid` and every other field is
/// still decoded.
pub fn decode_packet(data: &[u8]) -> Result<DecodedPacket> {
    if data.len() != SENSOR_PACKET_LEN {
        return Err(RobotError::IncompleteFrame { expected: SENSOR_PACKET_LEN, received: data.len() });
    }

    let mut values = Vec::with_capacity(GROUP_6_LAYOUT.len());
    let mut invalid = Vec::new();
    for spec in GROUP_6_LAYOUT {
        match decode_field(spec, data) {
            Ok(value) => values.push((spec.key, value)),
            Err(e) => invalid.push(e),
        }
    }
    Ok(DecodedPacket { values, invalid })
}

/// Latest known sensor values.
///
/// Only the transport mutates a frame; everyone else works on a cloned
/// snapshot. Values survive failed reads, so callers should check
/// [`SensorFrame::updated_at`] or [`SensorFrame::is_stale`] when freshness
/// matters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorFrame {
    values: BTreeMap<&'static str, SensorValue>,
    stale: BTreeSet<&'static str>,
    sequence: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl SensorFrame {
    /// Fold a decoded packet into the frame.
    ///
    /// Fields that failed translation keep their previous value and are
    /// marked stale until a later packet decodes them cleanly.
    pub fn merge(&mut self, packet: DecodedPacket) -> Vec<RobotError> {
        self.stale.clear();
        for (key, value) in packet.values {
            self.values.insert(key, value);
        }
        for error in &packet.invalid {
            if let RobotError::InvalidEnumValue { field, .. } = error {
                self.stale.insert(*field);
            }
        }
        self.sequence += 1;
        self.updated_at = Some(Utc::now());
        packet.invalid
    }

    pub fn get(&self, key: &str) -> Option<SensorValue> {
        self.values.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            SensorValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i32> {
        match self.get(key)? {
            SensorValue::Int(i) => Some(i),
            _ => None,
        }
    }

    /// True only if the flag is present and set
    pub fn flag(&self, key: &str) -> bool {
        self.bool(key).unwrap_or(false)
    }

    pub fn charging_state(&self) -> Option<ChargingState> {
        match self.get(CHARGING_STATE)? {
            SensorValue::Charging(c) => Some(c),
            _ => None,
        }
    }

    /// Last IR code, unless the latest packet carried a reserved one
    pub fn remote_opcode(&self) -> Option<RemoteOpcode> {
        if self.is_stale(REMOTE_OPCODE) {
            return None;
        }
        match self.get(REMOTE_OPCODE)? {
            SensorValue::Remote(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_stale(&self, key: &str) -> bool {
        self.stale.contains(key)
    }

    pub fn stale_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stale.iter().copied()
    }

    /// Bumper or virtual wall tripped
    pub fn obstacle_detected(&self) -> bool {
        self.flag(BUMP_LEFT) || self.flag(BUMP_RIGHT) || self.flag(VIRTUAL_WALL)
    }

    pub fn bumped(&self) -> bool {
        self.flag(BUMP_LEFT) || self.flag(BUMP_RIGHT)
    }

    /// Incremented on every successful decode
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, SensorValue)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    /// Same readings, ignoring sequence and timestamp
    pub fn same_readings(&self, other: &SensorFrame) -> bool {
        self.values == other.values && self.stale == other.stale
    }
}

/// Raw group 6 response, used to fake robot replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorPacket([u8; SENSOR_PACKET_LEN]);

impl Default for SensorPacket {
    fn default() -> Self {
        let mut raw = [0u8; SENSOR_PACKET_LEN];
        raw[10] = RemoteOpcode::NoSignal.code();
        Self(raw)
    }
}

impl SensorPacket {
    /// Write a raw value for `key` at its offset and width
    pub fn set(&mut self, key: &str, raw: i32) -> Result<&mut Self> {
        let spec = layout(key)?;
        let at = spec.offset;
        match spec.kind {
            FieldKind::Bit(mask) => {
                if raw != 0 {
                    self.0[at] |= mask;
                } else {
                    self.0[at] &= !mask;
                }
            }
            FieldKind::U16 | FieldKind::I16 => self.0[at..at + 2].copy_from_slice(&pack_i16(raw)),
            _ => self.0[at] = raw as u8,
        }
        Ok(self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_covers_packet() {
        let end = GROUP_6_LAYOUT
            .iter()
            .map(|spec| spec.offset + spec.kind.width())
            .max()
            .unwrap();
        assert_eq!(end, SENSOR_PACKET_LEN);
    }

    #[test]
    fn test_decode_offsets_and_widths() {
        let mut packet = SensorPacket::default();
        packet
            .set(BUMP_LEFT, 1).unwrap()
            .set(VIRTUAL_WALL, 1).unwrap()
            .set(REMOTE_OPCODE, 254).unwrap()
            .set("distance", -120).unwrap()
            .set(CHARGING_STATE, 3).unwrap()
            .set(VOLTAGE, 16200).unwrap()
            .set("current", -1500).unwrap()
            .set("battery-temperature", -5).unwrap()
            .set(CLIFF_RIGHT_SIGNAL, 1100).unwrap()
            .set(CHARGING_SOURCES_AVAILABLE, 2).unwrap()
            .set("requested-left-velocity", -500).unwrap();

        let decoded = decode_packet(packet.as_bytes()).unwrap();
        assert!(decoded.invalid.is_empty());

        let mut frame = SensorFrame::default();
        frame.merge(decoded);
        assert_eq!(frame.bool(BUMP_LEFT), Some(true));
        assert_eq!(frame.bool(BUMP_RIGHT), Some(false));
        assert!(frame.obstacle_detected());
        assert_eq!(frame.remote_opcode(), Some(RemoteOpcode::RedGreenAndForceField));
        assert_eq!(frame.int("distance"), Some(-120));
        assert_eq!(frame.charging_state(), Some(ChargingState::TrickleCharging));
        assert_eq!(frame.int(VOLTAGE), Some(16200));
        assert_eq!(frame.int("current"), Some(-1500));
        assert_eq!(frame.int("battery-temperature"), Some(-5));
        assert_eq!(frame.int(CLIFF_RIGHT_SIGNAL), Some(1100));
        assert!(frame.flag(CHARGING_SOURCES_AVAILABLE));
        assert!(frame.flag("home-base"));
        assert!(!frame.flag("internal-charger"));
        assert_eq!(frame.int("requested-left-velocity"), Some(-500));
        assert_eq!(frame.sequence(), 1);
        assert!(frame.updated_at().is_some());
    }

    #[test]
    fn test_short_packet_rejected() {
        let packet = SensorPacket::default();
        match decode_packet(&packet.as_bytes()[..40]) {
            Err(RobotError::IncompleteFrame { expected, received }) => {
                assert_eq!(expected, 52);
                assert_eq!(received, 40);
            }
            other => panic!("expected IncompleteFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_charging_state_index_lookup() {
        assert_eq!(ChargingState::from_index(0).unwrap(), ChargingState::NotCharging);
        assert_eq!(ChargingState::from_index(5).unwrap(), ChargingState::ChargingFault);
        assert!(matches!(
            ChargingState::from_index(6),
            Err(RobotError::InvalidEnumValue { field: CHARGING_STATE, value: 6 })
        ));
    }

    #[test]
    fn test_invalid_enum_keeps_previous_value() {
        let mut frame = SensorFrame::default();
        let mut packet = SensorPacket::default();
        packet.set(CHARGING_STATE, 2).unwrap().set(VOLTAGE, 15000).unwrap();
        frame.merge(decode_packet(packet.as_bytes()).unwrap());

        packet.set(CHARGING_STATE, 9).unwrap().set(VOLTAGE, 14000).unwrap();
        let invalid = frame.merge(decode_packet(packet.as_bytes()).unwrap());

        assert_eq!(invalid.len(), 1);
        assert!(matches!(invalid[0], RobotError::InvalidEnumValue { field: CHARGING_STATE, value: 9 }));
        assert_eq!(frame.charging_state(), Some(ChargingState::FullCharging));
        assert!(frame.is_stale(CHARGING_STATE));
        assert_eq!(frame.int(VOLTAGE), Some(14000));
        assert_eq!(frame.sequence(), 2);

        packet.set(CHARGING_STATE, 1).unwrap();
        frame.merge(decode_packet(packet.as_bytes()).unwrap());
        assert!(!frame.is_stale(CHARGING_STATE));
        assert_eq!(frame.charging_state(), Some(ChargingState::ReconditioningCharging));
    }

    #[test]
    fn test_stale_remote_opcode_is_not_trusted() {
        let mut frame = SensorFrame::default();
        let mut packet = SensorPacket::default();
        packet.set(REMOTE_OPCODE, 254).unwrap();
        frame.merge(decode_packet(packet.as_bytes()).unwrap());
        assert!(frame.remote_opcode().unwrap().is_dock_aligned());

        packet.set(REMOTE_OPCODE, 250).unwrap();
        frame.merge(decode_packet(packet.as_bytes()).unwrap());
        assert_eq!(frame.remote_opcode(), None);
        assert_eq!(frame.get(REMOTE_OPCODE), Some(SensorValue::Remote(RemoteOpcode::RedGreenAndForceField)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut packet = SensorPacket::default();
        assert!(packet.set("bump-middle", 1).is_err());
    }

    #[test]
    fn test_frame_serializes_to_json() {
        let mut frame = SensorFrame::default();
        frame.merge(decode_packet(SensorPacket::default().as_bytes()).unwrap());
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["values"][REMOTE_OPCODE], "no-signal");
        assert_eq!(json["values"][CHARGING_STATE], "not-charging");
        assert_eq!(json["values"][BUMP_LEFT], false);
        assert_eq!(json["sequence"], 1);
    }
}
