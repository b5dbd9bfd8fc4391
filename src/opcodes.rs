//! Serial command interface opcode tables
//!
//! The numeric values here are the wire contract with the robot firmware and
//! must never be computed. Robot commands live in [`Opcode`]; infrared codes
//! reported by the `remote-opcode` sensor live in [`RemoteOpcode`].

use crate::{Result, RobotError};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Which part of the command table an opcode belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeFamily {
    /// Commands shared by every robot speaking the interface (128-143)
    Base,
    /// Commands only the Create-class robots understand (144-158, soft reset)
    Extended,
}

/// Number of payload bytes that follow an opcode on the wire.
///
/// There is no length prefix or checksum in the protocol, so the receiver
/// frames commands using this shape alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Fixed(usize),
    /// `prefix` bytes, the last of which is an item count N, followed by
    /// N items of `item` bytes each.
    Counted { prefix: usize, item: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Start = 128,
    Baud = 129,
    Control = 130,
    Safe = 131,
    Full = 132,
    Power = 133,
    Spot = 134,
    Cover = 135,
    Demo = 136,
    Drive = 137,
    Motors = 138,
    Leds = 139,
    Song = 140,
    PlaySong = 141,
    Sensors = 142,
    CoverAndSeekDock = 143,
    PwmLowSideDrivers = 144,
    DirectDrive = 145,
    DigitalOutputs = 147,
    Stream = 148,
    QueryList = 149,
    PauseResumeStream = 150,
    SendIr = 151,
    Script = 152,
    PlayScript = 153,
    ShowScript = 154,
    WaitTime = 155,
    WaitDistance = 156,
    WaitAngle = 157,
    WaitEvent = 158,
    /// Undocumented; the firmware reboots and will begin charging afterwards.
    SoftReset = 7,
}

const OPCODE_TABLE: &[(Opcode, &str, PayloadShape)] = &[
    (Opcode::Start, "start", PayloadShape::Fixed(0)),
    (Opcode::Baud, "baud", PayloadShape::Fixed(1)),
    (Opcode::Control, "control", PayloadShape::Fixed(0)),
    (Opcode::Safe, "safe", PayloadShape::Fixed(0)),
    (Opcode::Full, "full", PayloadShape::Fixed(0)),
    (Opcode::Power, "power", PayloadShape::Fixed(0)),
    (Opcode::Spot, "spot", PayloadShape::Fixed(0)),
    (Opcode::Cover, "cover", PayloadShape::Fixed(0)),
    (Opcode::Demo, "demo", PayloadShape::Fixed(1)),
    (Opcode::Drive, "drive", PayloadShape::Fixed(4)),
    (Opcode::Motors, "motors", PayloadShape::Fixed(1)),
    (Opcode::Leds, "leds", PayloadShape::Fixed(3)),
    (Opcode::Song, "song", PayloadShape::Counted { prefix: 2, item: 2 }),
    (Opcode::PlaySong, "play_song", PayloadShape::Fixed(1)),
    (Opcode::Sensors, "sensors", PayloadShape::Fixed(1)),
    (Opcode::CoverAndSeekDock, "cover_and_seek_dock", PayloadShape::Fixed(0)),
    (Opcode::PwmLowSideDrivers, "pwm_low_side_drivers", PayloadShape::Fixed(3)),
    (Opcode::DirectDrive, "direct_drive", PayloadShape::Fixed(4)),
    (Opcode::DigitalOutputs, "digital_outputs", PayloadShape::Fixed(1)),
    (Opcode::Stream, "stream", PayloadShape::Counted { prefix: 1, item: 1 }),
    (Opcode::QueryList, "query_list", PayloadShape::Counted { prefix: 1, item: 1 }),
    (Opcode::PauseResumeStream, "pause_resume_stream", PayloadShape::Fixed(1)),
    (Opcode::SendIr, "send_ir", PayloadShape::Fixed(1)),
    (Opcode::Script, "script", PayloadShape::Counted { prefix: 1, item: 1 }),
    (Opcode::PlayScript, "play_script", PayloadShape::Fixed(0)),
    (Opcode::ShowScript, "show_script", PayloadShape::Fixed(0)),
    (Opcode::WaitTime, "wait_time", PayloadShape::Fixed(1)),
    (Opcode::WaitDistance, "wait_distance", PayloadShape::Fixed(2)),
    (Opcode::WaitAngle, "wait_angle", PayloadShape::Fixed(2)),
    (Opcode::WaitEvent, "wait_event", PayloadShape::Fixed(1)),
    (Opcode::SoftReset, "soft_reset", PayloadShape::Fixed(0)),
];

impl Opcode {
    /// Every known opcode, in table order
    pub fn all() -> impl Iterator<Item = Opcode> {
        OPCODE_TABLE.iter().map(|(op, _, _)| *op)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    fn entry(self) -> &'static (Opcode, &'static str, PayloadShape) {
        // Every variant has exactly one table row; the tests hold this.
        OPCODE_TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .unwrap_or(&OPCODE_TABLE[0])
    }

    pub fn name(self) -> &'static str {
        self.entry().1
    }

    pub fn payload_shape(self) -> PayloadShape {
        self.entry().2
    }

    pub fn family(self) -> OpcodeFamily {
        match self.code() {
            128..=143 => OpcodeFamily::Base,
            _ => OpcodeFamily::Extended,
        }
    }

    /// Look up an opcode by its wire value
    pub fn from_code(code: u8) -> Result<Self> {
        OPCODE_TABLE
            .iter()
            .find(|(op, _, _)| op.code() == code)
            .map(|(op, _, _)| *op)
            .ok_or_else(|| RobotError::UnknownCommand(format!("opcode {}", code)))
    }
}

impl FromStr for Opcode {
    type Err = RobotError;

    fn from_str(name: &str) -> Result<Self> {
        OPCODE_TABLE
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(op, _, _)| *op)
            .ok_or_else(|| RobotError::UnknownCommand(name.to_string()))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Infrared codes seen by the omnidirectional receiver.
///
/// Besides the handheld remote, the dock's buoys and force field broadcast
/// codes 240-254, which is what docking aligns on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOpcode {
    Left,
    Forward,
    Right,
    Spot,
    Max,
    Small,
    Medium,
    Large,
    Stop,
    Power,
    ArcLeft,
    ArcRight,
    Download,
    SeekDock,
    Reserved,
    ForceField,
    GreenBuoy,
    RedBuoyAndForceField,
    RedBuoy,
    RedAndGreenBuoy,
    RedGreenAndForceField,
    NoSignal,
}

const REMOTE_TABLE: &[(RemoteOpcode, u8, &str)] = &[
    (RemoteOpcode::Left, 129, "left"),
    (RemoteOpcode::Forward, 130, "forward"),
    (RemoteOpcode::Right, 131, "right"),
    (RemoteOpcode::Spot, 132, "spot"),
    (RemoteOpcode::Max, 133, "max"),
    (RemoteOpcode::Small, 134, "small"),
    (RemoteOpcode::Medium, 135, "medium"),
    (RemoteOpcode::Large, 136, "large"),
    (RemoteOpcode::Stop, 137, "stop"),
    (RemoteOpcode::Power, 138, "power"),
    (RemoteOpcode::ArcLeft, 139, "arc-left"),
    (RemoteOpcode::ArcRight, 140, "arc-right"),
    // The remote sends stop on two codes
    (RemoteOpcode::Stop, 141, "stop"),
    (RemoteOpcode::Download, 142, "download"),
    (RemoteOpcode::SeekDock, 143, "seek-dock"),
    (RemoteOpcode::Reserved, 240, "reserved"),
    (RemoteOpcode::ForceField, 242, "force-field"),
    (RemoteOpcode::GreenBuoy, 244, "green-buoy"),
    (RemoteOpcode::RedBuoyAndForceField, 246, "red-buoy-and-force-field"),
    (RemoteOpcode::RedBuoy, 248, "red-buoy"),
    (RemoteOpcode::RedAndGreenBuoy, 252, "red-buoy-and-green-buoy"),
    (RemoteOpcode::RedGreenAndForceField, 254, "red-buoy-and-green-buoy-and-force-field"),
    (RemoteOpcode::NoSignal, 255, "no-signal"),
];

impl RemoteOpcode {
    /// Translate the raw IR byte. Reserved codes are an error, never a default.
    pub fn from_code(code: u8) -> Result<Self> {
        REMOTE_TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(op, _, _)| *op)
            .ok_or(RobotError::InvalidEnumValue { field: "remote-opcode", value: code as i32 })
    }

    pub fn code(self) -> u8 {
        REMOTE_TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, c, _)| *c)
            .unwrap_or(255)
    }

    pub fn name(self) -> &'static str {
        REMOTE_TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, _, n)| *n)
            .unwrap_or("no-signal")
    }

    /// Both buoys and the force field at once: the robot is lined up with the dock
    pub fn is_dock_aligned(self) -> bool {
        self == RemoteOpcode::RedGreenAndForceField
    }
}

impl Serialize for RemoteOpcode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl fmt::Display for RemoteOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
