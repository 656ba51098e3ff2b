//! Message catalogue: every request and response the buses carry, each with
//! a fixed payload size.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dockbus_frame::PhysAddr;
use serde::Serialize;

use crate::error::{Result, StationError};
use crate::module::Module;

/// Status codes carried by `Ack` responses. Zero is success.
pub mod status {
    pub const OK: i32 = 0;
    pub const UNKNOWN_DEVICE: i32 = -2;
    pub const BAD_LENGTH: i32 = -3;
    pub const UNSUPPORTED: i32 = -4;
    pub const BUS_ERROR: i32 = -5;
    pub const TIMEOUT: i32 = -6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum MessageId {
    Ack = 0x00,
    AddrGet = 0x01,
    VersionGet = 0x02,
    StatusGet = 0x03,
    Reset = 0x04,
    PowerSet = 0x10,
    LockSet = 0x11,
    LedSet = 0x12,
    KeyRead = 0x20,
    BuzzerSet = 0x21,
    Event = 0x7F,
}

impl MessageId {
    pub const ALL: [MessageId; 11] = [
        MessageId::Ack,
        MessageId::AddrGet,
        MessageId::VersionGet,
        MessageId::StatusGet,
        MessageId::Reset,
        MessageId::PowerSet,
        MessageId::LockSet,
        MessageId::LedSet,
        MessageId::KeyRead,
        MessageId::BuzzerSet,
        MessageId::Event,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::AddrGet => "addr-get",
            Self::VersionGet => "version-get",
            Self::StatusGet => "status-get",
            Self::Reset => "reset",
            Self::PowerSet => "power-set",
            Self::LockSet => "lock-set",
            Self::LedSet => "led-set",
            Self::KeyRead => "key-read",
            Self::BuzzerSet => "buzzer-set",
            Self::Event => "event",
        }
    }

    /// Request payload size, or `None` for messages only devices send.
    pub fn request_len(self) -> Option<usize> {
        match self {
            Self::Ack | Self::Event => None,
            Self::AddrGet | Self::VersionGet | Self::StatusGet | Self::Reset | Self::KeyRead => {
                Some(0)
            }
            Self::PowerSet => Some(1),
            Self::LockSet | Self::LedSet => Some(3),
            Self::BuzzerSet => Some(4),
        }
    }

    /// Response payload size.
    pub fn response_len(self) -> usize {
        match self {
            Self::Ack => 4,
            Self::AddrGet => PhysAddr::LEN,
            Self::VersionGet => 5,
            Self::StatusGet => 4,
            Self::KeyRead => 9,
            Self::Event => 3,
            Self::Reset | Self::PowerSet | Self::LockSet | Self::LedSet | Self::BuzzerSet => 0,
        }
    }

    /// Whether devices on `module`'s bus understand this request.
    pub fn supported_by(self, module: Module) -> bool {
        match (self, module) {
            (Self::Ack | Self::Event, _) | (_, Module::Callback) => false,
            (Self::PowerSet | Self::LockSet, Module::Kr) => false,
            (Self::KeyRead, Module::Bdp) => false,
            _ => true,
        }
    }
}

impl TryFrom<u8> for MessageId {
    type Error = StationError;

    fn try_from(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_u8() == value)
            .ok_or(StationError::UnknownMessage(value))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageId {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase().replace('_', "-");
        if let Some(id) = Self::ALL.into_iter().find(|id| id.name() == lower) {
            return Ok(id);
        }
        let raw = match lower.strip_prefix("0x") {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => lower.parse::<u8>(),
        };
        match raw {
            Ok(value) => Self::try_from(value),
            Err(_) => Err(StationError::UnknownMessage(0xFF)),
        }
    }
}

/// Requests an application can send to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Broadcast discovery; every device answers with its address.
    AddrGet,
    VersionGet,
    StatusGet,
    Reset,
    PowerSet { on: bool },
    LockSet { locked: bool, hold_s: u16 },
    LedSet { color: u8, blink_ms: u16 },
    KeyRead,
    BuzzerSet { freq_hz: u16, duration_ms: u16 },
}

impl Request {
    pub fn msg_id(&self) -> MessageId {
        match self {
            Self::AddrGet => MessageId::AddrGet,
            Self::VersionGet => MessageId::VersionGet,
            Self::StatusGet => MessageId::StatusGet,
            Self::Reset => MessageId::Reset,
            Self::PowerSet { .. } => MessageId::PowerSet,
            Self::LockSet { .. } => MessageId::LockSet,
            Self::LedSet { .. } => MessageId::LedSet,
            Self::KeyRead => MessageId::KeyRead,
            Self::BuzzerSet { .. } => MessageId::BuzzerSet,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        match *self {
            Self::PowerSet { on } => buf.put_u8(u8::from(on)),
            Self::LockSet { locked, hold_s } => {
                buf.put_u8(u8::from(locked));
                buf.put_u16_le(hold_s);
            }
            Self::LedSet { color, blink_ms } => {
                buf.put_u8(color);
                buf.put_u16_le(blink_ms);
            }
            Self::BuzzerSet {
                freq_hz,
                duration_ms,
            } => {
                buf.put_u16_le(freq_hz);
                buf.put_u16_le(duration_ms);
            }
            Self::AddrGet | Self::VersionGet | Self::StatusGet | Self::Reset | Self::KeyRead => {}
        }
        buf.freeze()
    }

    pub fn decode(msg_id: MessageId, payload: &[u8]) -> Result<Self> {
        let expected = msg_id
            .request_len()
            .ok_or(StationError::UnknownMessage(msg_id.as_u8()))?;
        check_len(msg_id, expected, payload.len())?;

        let mut buf = payload;
        Ok(match msg_id {
            MessageId::AddrGet => Self::AddrGet,
            MessageId::VersionGet => Self::VersionGet,
            MessageId::StatusGet => Self::StatusGet,
            MessageId::Reset => Self::Reset,
            MessageId::KeyRead => Self::KeyRead,
            MessageId::PowerSet => Self::PowerSet {
                on: buf.get_u8() != 0,
            },
            MessageId::LockSet => Self::LockSet {
                locked: buf.get_u8() != 0,
                hold_s: buf.get_u16_le(),
            },
            MessageId::LedSet => Self::LedSet {
                color: buf.get_u8(),
                blink_ms: buf.get_u16_le(),
            },
            MessageId::BuzzerSet => Self::BuzzerSet {
                freq_hz: buf.get_u16_le(),
                duration_ms: buf.get_u16_le(),
            },
            MessageId::Ack | MessageId::Event => {
                return Err(StationError::UnknownMessage(msg_id.as_u8()))
            }
        })
    }
}

/// Responses and unsolicited frames from devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Status-only answer; also how the daemon rejects a request.
    Ack { status: i32 },
    Address(PhysAddr),
    Version { major: u8, minor: u8, patch: u8, build: u16 },
    Status { flags: u8, temperature_c: i8, supply_mv: u16 },
    Key { present: bool, uid: [u8; 8] },
    Event { kind: u8, value: u16 },
    /// Empty confirmation of a command.
    Done(MessageId),
}

impl Response {
    pub fn msg_id(&self) -> MessageId {
        match self {
            Self::Ack { .. } => MessageId::Ack,
            Self::Address(_) => MessageId::AddrGet,
            Self::Version { .. } => MessageId::VersionGet,
            Self::Status { .. } => MessageId::StatusGet,
            Self::Key { .. } => MessageId::KeyRead,
            Self::Event { .. } => MessageId::Event,
            Self::Done(id) => *id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.msg_id().response_len());
        match *self {
            Self::Ack { status } => buf.put_i32_le(status),
            Self::Address(addr) => buf.put_slice(addr.as_bytes()),
            Self::Version {
                major,
                minor,
                patch,
                build,
            } => {
                buf.put_u8(major);
                buf.put_u8(minor);
                buf.put_u8(patch);
                buf.put_u16_le(build);
            }
            Self::Status {
                flags,
                temperature_c,
                supply_mv,
            } => {
                buf.put_u8(flags);
                buf.put_i8(temperature_c);
                buf.put_u16_le(supply_mv);
            }
            Self::Key { present, uid } => {
                buf.put_u8(u8::from(present));
                buf.put_slice(&uid);
            }
            Self::Event { kind, value } => {
                buf.put_u8(kind);
                buf.put_u16_le(value);
            }
            Self::Done(_) => {}
        }
        buf.freeze()
    }

    pub fn decode(msg_id: MessageId, payload: &[u8]) -> Result<Self> {
        check_len(msg_id, msg_id.response_len(), payload.len())?;

        let mut buf = payload;
        Ok(match msg_id {
            MessageId::Ack => Self::Ack {
                status: buf.get_i32_le(),
            },
            MessageId::AddrGet => {
                let mut addr = [0u8; PhysAddr::LEN];
                buf.copy_to_slice(&mut addr);
                Self::Address(PhysAddr(addr))
            }
            MessageId::VersionGet => Self::Version {
                major: buf.get_u8(),
                minor: buf.get_u8(),
                patch: buf.get_u8(),
                build: buf.get_u16_le(),
            },
            MessageId::StatusGet => Self::Status {
                flags: buf.get_u8(),
                temperature_c: buf.get_i8(),
                supply_mv: buf.get_u16_le(),
            },
            MessageId::KeyRead => {
                let present = buf.get_u8() != 0;
                let mut uid = [0u8; 8];
                buf.copy_to_slice(&mut uid);
                Self::Key { present, uid }
            }
            MessageId::Event => Self::Event {
                kind: buf.get_u8(),
                value: buf.get_u16_le(),
            },
            id => Self::Done(id),
        })
    }

    /// Named fields for display.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match *self {
            Self::Ack { status } => vec![("status", status.to_string())],
            Self::Address(addr) => vec![("addr", addr.to_string())],
            Self::Version {
                major,
                minor,
                patch,
                build,
            } => vec![
                ("version", format!("{major}.{minor}.{patch}")),
                ("build", build.to_string()),
            ],
            Self::Status {
                flags,
                temperature_c,
                supply_mv,
            } => vec![
                ("flags", format!("{flags:#04x}")),
                ("temperature_c", temperature_c.to_string()),
                ("supply_mv", supply_mv.to_string()),
            ],
            Self::Key { present, uid } => vec![
                ("present", present.to_string()),
                ("uid", PhysAddr(uid).to_string()),
            ],
            Self::Event { kind, value } => {
                vec![("kind", kind.to_string()), ("value", value.to_string())]
            }
            Self::Done(id) => vec![("done", id.to_string())],
        }
    }
}

fn check_len(msg_id: MessageId, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(StationError::MessageLength {
            msg_id: msg_id.as_u8(),
            expected,
            actual,
        })
    }
}
