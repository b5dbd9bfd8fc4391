//! Command encoding and framing
//!
//! Turns [`Command`] values into the exact byte sequences the robot expects
//! and back again. Everything here is pure; no I/O happens until the bytes
//! reach [`crate::transport::Transport`].

use crate::opcodes::{Opcode, PayloadShape};
use crate::{Result, RobotError};
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Fastest the drive wheels will go, in mm/s
pub const VELOCITY_MAX: i32 = 500;
pub const VELOCITY_SLOW: i32 = 165;
pub const VELOCITY_QUICK: i32 = 330;
pub const VELOCITY_FAST: i32 = VELOCITY_MAX;

/// Sentinel radius: drive straight
pub const RADIUS_STRAIGHT: i32 = 32768;
/// Sentinel radius: spin clockwise on the spot
pub const RADIUS_TURN_IN_PLACE_CW: i32 = -1;
/// Sentinel radius: spin counter-clockwise on the spot
pub const RADIUS_TURN_IN_PLACE_CCW: i32 = 1;
/// Largest radius the firmware treats as a real turning circle, in mm
pub const RADIUS_MAX: i32 = 2000;

/// Sensor packet group holding every field the decoder understands
pub const SENSOR_GROUP_ALL: u8 = 6;

/// Notes the firmware accepts in one song
pub const MAX_SONG_NOTES: usize = 16;
/// Packet ids a stream or query list can carry behind its count byte
pub const MAX_PACKET_IDS: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDirection {
    Clockwise,
    CounterClockwise,
}

impl TurnDirection {
    pub fn radius(self) -> i32 {
        match self {
            TurnDirection::Clockwise => RADIUS_TURN_IN_PLACE_CW,
            TurnDirection::CounterClockwise => RADIUS_TURN_IN_PLACE_CCW,
        }
    }

    /// Pick a direction with no preference either way
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.gen_bool(0.5) {
            TurnDirection::CounterClockwise
        } else {
            TurnDirection::Clockwise
        }
    }
}

impl FromStr for TurnDirection {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cw" => Ok(TurnDirection::Clockwise),
            "ccw" => Ok(TurnDirection::CounterClockwise),
            other => Err(RobotError::UnknownCommand(format!("turn direction '{}'", other))),
        }
    }
}

/// Mask to 16 bits two's complement, high byte first.
///
/// Out-of-range values wrap rather than being rejected; the robot has always
/// been driven this way and the firmware expects it.
pub fn pack_i16(value: i32) -> [u8; 2] {
    (value as u16).to_be_bytes()
}

fn unpack_i16(bytes: &[u8]) -> i32 {
    i16::from_be_bytes([bytes[0], bytes[1]]) as i32
}

/// Like [`unpack_i16`], except 0x8000 reads back as the straight sentinel
fn unpack_radius(bytes: &[u8]) -> i32 {
    match unpack_i16(bytes) {
        r if r == i16::MIN as i32 => RADIUS_STRAIGHT,
        r => r,
    }
}

fn check_len(opcode: Opcode, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(RobotError::PayloadTooLong { command: opcode.name(), len, max });
    }
    Ok(())
}

/// A single command frame. Built, encoded and dropped on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Baud(u8),
    Control,
    Safe,
    Full,
    Power,
    Spot,
    Cover,
    Demo(u8),
    /// Average wheel velocity (mm/s) and turning radius (mm)
    Drive { velocity: i32, radius: i32 },
    Motors(u8),
    Leds { bits: u8, color: u8, intensity: u8 },
    /// Song slot and (MIDI note, duration in 1/64 s) pairs.
    /// Encoding keeps the first [`MAX_SONG_NOTES`]; build with [`Command::song`].
    Song { number: u8, notes: Vec<(u8, u8)> },
    PlaySong(u8),
    Sensors(u8),
    CoverAndSeekDock,
    PwmLowSideDrivers([u8; 3]),
    /// Independent wheel velocities in mm/s
    DirectDrive { right: i32, left: i32 },
    DigitalOutputs(u8),
    /// Packet ids, of which encoding keeps the first [`MAX_PACKET_IDS`]
    Stream(Vec<u8>),
    QueryList(Vec<u8>),
    PauseResumeStream(bool),
    SendIr(u8),
    WaitTime(u8),
    WaitDistance(i32),
    WaitAngle(i32),
    WaitEvent(u8),
    SoftReset,
}

impl Command {
    pub fn drive(velocity: i32, radius: i32) -> Self {
        Command::Drive { velocity, radius }
    }

    pub fn drive_straight(velocity: i32) -> Self {
        Command::drive(velocity, RADIUS_STRAIGHT)
    }

    pub fn turn_in_place(velocity: i32, direction: TurnDirection) -> Self {
        Command::drive(velocity, direction.radius())
    }

    pub fn stop() -> Self {
        Command::drive(0, 0)
    }

    pub fn song(number: u8, notes: Vec<(u8, u8)>) -> Result<Self> {
        check_len(Opcode::Song, notes.len(), MAX_SONG_NOTES)?;
        Ok(Command::Song { number, notes })
    }

    pub fn stream(packets: Vec<u8>) -> Result<Self> {
        check_len(Opcode::Stream, packets.len(), MAX_PACKET_IDS)?;
        Ok(Command::Stream(packets))
    }

    pub fn query_list(packets: Vec<u8>) -> Result<Self> {
        check_len(Opcode::QueryList, packets.len(), MAX_PACKET_IDS)?;
        Ok(Command::QueryList(packets))
    }

    /// Build a command from its table name and raw payload bytes
    pub fn named(name: &str, payload: &[u8]) -> Result<Self> {
        let opcode: Opcode = name.parse()?;
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(opcode.code());
        frame.extend_from_slice(payload);
        let (command, used) = Command::decode(&frame)?;
        if used != frame.len() {
            return Err(RobotError::UnknownCommand(format!(
                "{} takes {} payload bytes, got {}",
                name,
                used - 1,
                payload.len()
            )));
        }
        Ok(command)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Start => Opcode::Start,
            Command::Baud(_) => Opcode::Baud,
            Command::Control => Opcode::Control,
            Command::Safe => Opcode::Safe,
            Command::Full => Opcode::Full,
            Command::Power => Opcode::Power,
            Command::Spot => Opcode::Spot,
            Command::Cover => Opcode::Cover,
            Command::Demo(_) => Opcode::Demo,
            Command::Drive { .. } => Opcode::Drive,
            Command::Motors(_) => Opcode::Motors,
            Command::Leds { .. } => Opcode::Leds,
            Command::Song { .. } => Opcode::Song,
            Command::PlaySong(_) => Opcode::PlaySong,
            Command::Sensors(_) => Opcode::Sensors,
            Command::CoverAndSeekDock => Opcode::CoverAndSeekDock,
            Command::PwmLowSideDrivers(_) => Opcode::PwmLowSideDrivers,
            Command::DirectDrive { .. } => Opcode::DirectDrive,
            Command::DigitalOutputs(_) => Opcode::DigitalOutputs,
            Command::Stream(_) => Opcode::Stream,
            Command::QueryList(_) => Opcode::QueryList,
            Command::PauseResumeStream(_) => Opcode::PauseResumeStream,
            Command::SendIr(_) => Opcode::SendIr,
            Command::WaitTime(_) => Opcode::WaitTime,
            Command::WaitDistance(_) => Opcode::WaitDistance,
            Command::WaitAngle(_) => Opcode::WaitAngle,
            Command::WaitEvent(_) => Opcode::WaitEvent,
            Command::SoftReset => Opcode::SoftReset,
        }
    }

    /// Serialize to `[opcode, payload...]`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode().code()];
        match self {
            Command::Start
            | Command::Control
            | Command::Safe
            | Command::Full
            | Command::Power
            | Command::Spot
            | Command::Cover
            | Command::CoverAndSeekDock
            | Command::SoftReset => {}
            Command::Baud(b)
            | Command::Demo(b)
            | Command::Motors(b)
            | Command::PlaySong(b)
            | Command::Sensors(b)
            | Command::DigitalOutputs(b)
            | Command::SendIr(b)
            | Command::WaitTime(b)
            | Command::WaitEvent(b) => out.push(*b),
            Command::Drive { velocity, radius } => {
                out.extend_from_slice(&pack_i16(*velocity));
                out.extend_from_slice(&pack_i16(*radius));
            }
            Command::DirectDrive { right, left } => {
                out.extend_from_slice(&pack_i16(*right));
                out.extend_from_slice(&pack_i16(*left));
            }
            Command::Leds { bits, color, intensity } => out.extend_from_slice(&[*bits, *color, *intensity]),
            Command::Song { number, notes } => {
                let notes = &notes[..notes.len().min(MAX_SONG_NOTES)];
                out.push(*number);
                out.push(notes.len() as u8);
                for (note, duration) in notes {
                    out.push(*note);
                    out.push(*duration);
                }
            }
            Command::PwmLowSideDrivers(duty) => out.extend_from_slice(duty),
            Command::Stream(packets) | Command::QueryList(packets) => {
                let packets = &packets[..packets.len().min(MAX_PACKET_IDS)];
                out.push(packets.len() as u8);
                out.extend_from_slice(packets);
            }
            Command::PauseResumeStream(resume) => out.push(u8::from(*resume)),
            Command::WaitDistance(v) | Command::WaitAngle(v) => out.extend_from_slice(&pack_i16(*v)),
        }
        out
    }

    /// Parse one frame from the front of `bytes`, returning it and the number
    /// of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(Command, usize)> {
        let first = *bytes.first().ok_or(RobotError::IncompleteFrame { expected: 1, received: 0 })?;
        let opcode = Opcode::from_code(first)?;

        let len = match opcode.payload_shape() {
            PayloadShape::Fixed(n) => 1 + n,
            PayloadShape::Counted { prefix, item } => {
                if bytes.len() < 1 + prefix {
                    return Err(RobotError::IncompleteFrame { expected: 1 + prefix, received: bytes.len() });
                }
                1 + prefix + bytes[prefix] as usize * item
            }
        };
        if bytes.len() < len {
            return Err(RobotError::IncompleteFrame { expected: len, received: bytes.len() });
        }
        let p = &bytes[1..len];

        let command = match opcode {
            Opcode::Start => Command::Start,
            Opcode::Baud => Command::Baud(p[0]),
            Opcode::Control => Command::Control,
            Opcode::Safe => Command::Safe,
            Opcode::Full => Command::Full,
            Opcode::Power => Command::Power,
            Opcode::Spot => Command::Spot,
            Opcode::Cover => Command::Cover,
            Opcode::Demo => Command::Demo(p[0]),
            Opcode::Drive => Command::Drive { velocity: unpack_i16(&p[0..2]), radius: unpack_radius(&p[2..4]) },
            Opcode::Motors => Command::Motors(p[0]),
            Opcode::Leds => Command::Leds { bits: p[0], color: p[1], intensity: p[2] },
            Opcode::Song => Command::song(p[0], p[2..].chunks_exact(2).map(|c| (c[0], c[1])).collect())?,
            Opcode::PlaySong => Command::PlaySong(p[0]),
            Opcode::Sensors => Command::Sensors(p[0]),
            Opcode::CoverAndSeekDock => Command::CoverAndSeekDock,
            Opcode::PwmLowSideDrivers => Command::PwmLowSideDrivers([p[0], p[1], p[2]]),
            Opcode::DirectDrive => Command::DirectDrive { right: unpack_i16(&p[0..2]), left: unpack_i16(&p[2..4]) },
            Opcode::DigitalOutputs => Command::DigitalOutputs(p[0]),
            Opcode::Stream => Command::Stream(p[1..].to_vec()),
            Opcode::QueryList => Command::QueryList(p[1..].to_vec()),
            Opcode::PauseResumeStream => Command::PauseResumeStream(p[0] != 0),
            Opcode::SendIr => Command::SendIr(p[0]),
            Opcode::WaitTime => Command::WaitTime(p[0]),
            Opcode::WaitDistance => Command::WaitDistance(unpack_i16(p)),
            Opcode::WaitAngle => Command::WaitAngle(unpack_i16(p)),
            Opcode::WaitEvent => Command::WaitEvent(p[0]),
            Opcode::SoftReset => Command::SoftReset,
            Opcode::Script | Opcode::PlayScript | Opcode::ShowScript => {
                return Err(RobotError::UnknownCommand(format!("{} is not supported", opcode.name())));
            }
        };
        Ok((command, len))
    }

    /// Split a raw byte stream back into the commands that produced it
    pub fn decode_stream(mut bytes: &[u8]) -> Result<Vec<Command>> {
        let mut commands = Vec::new();
        while !bytes.is_empty() {
            let (command, used) = Command::decode(bytes)?;
            commands.push(command);
            bytes = &bytes[used..];
        }
        Ok(commands)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Command::Drive { velocity: 0, radius: 0 })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Drive { velocity, radius } => write!(f, "drive(v={}, r={})", velocity, radius),
            other => write!(f, "{}", other.opcode().name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_drive_layout() {
        assert_eq!(Command::drive(-200, 500).encode(), vec![137, 0xFF, 0x38, 0x01, 0xF4]);
        assert_eq!(Command::stop().encode(), vec![137, 0, 0, 0, 0]);
    }

    proptest! {
        #[test]
        fn test_drive_round_trip_keeps_16_bit_pair(velocity in any::<i32>(), radius in any::<i32>()) {
            let encoded = Command::drive(velocity, radius).encode();
            let (decoded, used) = Command::decode(&encoded).unwrap();
            prop_assert_eq!(used, 5);
            match decoded {
                Command::Drive { velocity: v, radius: r } => {
                    prop_assert_eq!(v as u16, velocity as u16);
                    prop_assert_eq!(r as u16, radius as u16);
                }
                other => prop_assert!(false, "decoded {:?}", other),
            }
        }

        #[test]
        fn test_drive_wraps_modulo_65536(velocity in any::<i32>(), radius in any::<i32>()) {
            prop_assert_eq!(
                Command::drive(velocity, radius).encode(),
                Command::drive(velocity.wrapping_add(65536), radius).encode()
            );
            prop_assert_eq!(
                Command::drive(velocity, radius).encode(),
                Command::drive(velocity, radius.wrapping_sub(65536)).encode()
            );
        }

        #[test]
        fn test_sentinel_radius_bytes(velocity in any::<i32>()) {
            let straight = Command::drive_straight(velocity).encode();
            let cw = Command::turn_in_place(velocity, TurnDirection::Clockwise).encode();
            let ccw = Command::turn_in_place(velocity, TurnDirection::CounterClockwise).encode();
            prop_assert_eq!(straight[1..3].to_vec(), pack_i16(velocity).to_vec());
            prop_assert_eq!(straight[3..].to_vec(), vec![0x80, 0x00]);
            prop_assert_eq!(cw[3..].to_vec(), vec![0xFF, 0xFF]);
            prop_assert_eq!(ccw[3..].to_vec(), vec![0x00, 0x01]);
        }
    }

    #[test]
    fn test_counted_payloads_are_bounded() {
        let notes = vec![(60, 8); MAX_SONG_NOTES + 1];
        assert!(matches!(
            Command::song(0, notes.clone()),
            Err(RobotError::PayloadTooLong { len: 17, max: 16, .. })
        ));
        assert!(Command::stream(vec![7; MAX_PACKET_IDS + 1]).is_err());
        assert!(Command::query_list(vec![7; MAX_PACKET_IDS]).is_ok());

        // A hand-built oversize command still frames consistently
        let encoded = Command::Song { number: 0, notes }.encode();
        assert_eq!(encoded[2] as usize, MAX_SONG_NOTES);
        assert_eq!(encoded.len(), 3 + 2 * MAX_SONG_NOTES);
        let encoded = Command::QueryList(vec![7; 300]).encode();
        assert_eq!(encoded[1], u8::MAX);
        assert_eq!(encoded.len(), 2 + MAX_PACKET_IDS);
        assert_eq!(Command::decode(&encoded).unwrap().1, encoded.len());

        let mut too_long = vec![140, 0, 17];
        too_long.extend(vec![60; 34]);
        assert!(matches!(Command::decode(&too_long), Err(RobotError::PayloadTooLong { .. })));
    }

    #[test]
    fn test_out_of_range_values_wrap() {
        assert_eq!(Command::drive(70000, 0).encode(), Command::drive(70000 % 65536, 0).encode());
        assert_eq!(Command::drive(0, -70000).encode(), Command::drive(0, -70000 + 65536).encode());
    }

    #[test]
    fn test_sentinel_radii() {
        for v in [VELOCITY_SLOW, -VELOCITY_FAST] {
            assert_eq!(&Command::drive_straight(v).encode()[3..], &[0x80, 0x00]);
            assert_eq!(&Command::turn_in_place(v, TurnDirection::Clockwise).encode()[3..], &[0xFF, 0xFF]);
            assert_eq!(&Command::turn_in_place(v, TurnDirection::CounterClockwise).encode()[3..], &[0x00, 0x01]);

            let straight = Command::drive_straight(v);
            assert_eq!(Command::decode(&straight.encode()).unwrap().0, straight);
        }
    }

    #[test]
    fn test_variable_length_framing() {
        let song = Command::Song { number: 1, notes: vec![(60, 32), (64, 16)] };
        let stream = Command::QueryList(vec![7, 21, 34]);
        let mut bytes = song.encode();
        bytes.extend(stream.encode());
        bytes.extend(Command::stop().encode());
        bytes.extend(Command::CoverAndSeekDock.encode());

        let commands = Command::decode_stream(&bytes).unwrap();
        assert_eq!(commands, vec![song, stream, Command::stop(), Command::CoverAndSeekDock]);
    }

    #[test]
    fn test_truncated_frame() {
        let encoded = Command::drive(100, 100).encode();
        match Command::decode(&encoded[..3]) {
            Err(RobotError::IncompleteFrame { expected, received }) => {
                assert_eq!(expected, 5);
                assert_eq!(received, 3);
            }
            other => panic!("expected IncompleteFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_named_commands() {
        assert_eq!(Command::named("sensors", &[6]).unwrap(), Command::Sensors(6));
        assert_eq!(Command::named("soft_reset", &[]).unwrap(), Command::SoftReset);
        assert!(matches!(Command::named("warp", &[]), Err(RobotError::UnknownCommand(_))));
        assert!(Command::named("sensors", &[6, 7]).is_err());
    }

    #[test]
    fn test_random_direction_uses_both() {
        let mut rng = StdRng::seed_from_u64(7);
        let picks: Vec<_> = (0..64).map(|_| TurnDirection::random(&mut rng)).collect();
        assert!(picks.contains(&TurnDirection::Clockwise));
        assert!(picks.contains(&TurnDirection::CounterClockwise));
        assert_eq!("ccw".parse::<TurnDirection>().unwrap(), TurnDirection::CounterClockwise);
        assert!("left".parse::<TurnDirection>().is_err());
    }
}
