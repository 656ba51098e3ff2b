//! Framing for the dockbus device bus and control plane.
//!
//! Device frames travel on a shared half-duplex serial line, so the codec
//! must find frame boundaries in noise:
//! - a 7-byte `0xAA` preamble and a `0xAB` start-of-frame marker
//! - a 24-byte little-endian header whose length field carries its own
//!   bitwise complement
//! - a CRC-16 (polynomial 0xA001) over everything after the CRC field
//!
//! Control-plane messages between applications and the daemon use a fixed
//! 65-byte header followed by the payload; see [`control`].

pub mod addr;
pub mod codec;
pub mod control;
pub mod crc;
pub mod decoder;
pub mod error;
pub mod reader;
pub mod writer;

pub use addr::{AddrParseError, PhysAddr};
pub use codec::{encode_frame, flags, Frame, FrameHeader, HEADER_SIZE, MAX_PAYLOAD, PREAMBLE, SOF};
pub use control::{
    decode_control, encode_control, BusHeader, ControlMessage, ControlReader, ControlWriter,
    CONTROL_HEADER_SIZE, DEV_ALL,
};
pub use decoder::{DecoderConfig, FrameDecoder, RxState, RxStats};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::{FrameWriter, WriteRetry};
