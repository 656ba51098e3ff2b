use std::path::PathBuf;
use std::time::Duration;

use dockbus_frame::PhysAddr;

/// Errors that can occur in station operations.
#[derive(Debug, thiserror::Error)]
pub enum StationError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] dockbus_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] dockbus_frame::FrameError),

    /// I/O error outside the framing layer (polling, clocks).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON.
    #[error("invalid config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A configuration value is out of range.
    #[error("invalid config value {section}.{key}: {reason}")]
    ConfigValue {
        section: String,
        key: String,
        reason: String,
    },

    /// No answer arrived before the caller's deadline.
    #[error("no response within {0:?}")]
    CommsTimeout(Duration),

    /// Zero and broadcast addresses never belong to a device.
    #[error("address {0} is reserved")]
    AddrInvalid(PhysAddr),

    /// The address table has no room for another device.
    #[error("address table full ({max} devices)")]
    TableFull { max: usize },

    /// No device with this physical address has been learned.
    #[error("no device with address {0}")]
    NotFound(PhysAddr),

    /// No device with this virtual number has been learned.
    #[error("unknown device {0}")]
    UnknownDevice(u16),

    /// Message id outside the catalogue.
    #[error("unknown message id {0:#04x}")]
    UnknownMessage(u8),

    /// Module id outside BDP/KR/CALLBACK.
    #[error("unknown module id {0}")]
    UnknownModule(u8),

    /// A payload does not have the fixed size of its message kind.
    #[error("message {msg_id:#04x} payload is {actual} bytes, expected {expected}")]
    MessageLength {
        msg_id: u8,
        expected: usize,
        actual: usize,
    },

    /// The daemon or the device answered with a negative status.
    #[error("request rejected with status {status}")]
    Rejected { status: i32 },

    /// The response belongs to a different request kind.
    #[error("expected response to message {expected:#04x}, got {actual:#04x}")]
    MsgIdMismatch { expected: u8, actual: u8 },

    /// The response came from a different device.
    #[error("expected response from device {expected}, got {actual}")]
    DevNumMismatch { expected: u16, actual: u16 },

    /// The control socket closed underneath an exchange.
    #[error("control socket disconnected")]
    SockDisc,

    /// The device line reached end of file.
    #[error("bus {0} closed")]
    BusClosed(String),
}

impl StationError {
    /// Status code carried back to applications in an `Ack`.
    pub fn status(&self) -> i32 {
        use crate::message::status;
        match self {
            Self::Rejected { status } => *status,
            Self::UnknownDevice(_) | Self::NotFound(_) => status::UNKNOWN_DEVICE,
            Self::MessageLength { .. } => status::BAD_LENGTH,
            Self::UnknownMessage(_) | Self::UnknownModule(_) => status::UNSUPPORTED,
            Self::CommsTimeout(_) => status::TIMEOUT,
            _ => status::BUS_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, StationError>;
