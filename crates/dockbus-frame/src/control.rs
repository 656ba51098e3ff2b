//! Control-plane messages exchanged between applications and the daemon.
//!
//! Every message is a fixed 65-byte little-endian header followed by up to
//! [`MAX_PAYLOAD`] bytes:
//!
//! ```text
//! app_name[32] module_id:u8 dev_num:u16 len:u16 seq:u32 sent_ms:i64 timeout_ms:i64
//! msg_id:u8 flags:u8 blocking:u8 reserved:u8 status:i32   payload[len]
//! ```
//!
//! The trailing eight header bytes are the bus module header; the callback
//! channel reuses the same layout.

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::MAX_PAYLOAD;
use crate::error::{FrameError, Result};

/// Bytes reserved for the application name, NUL padded.
pub const APP_NAME_LEN: usize = 32;

/// Size of the bus module header.
pub const BUS_HEADER_SIZE: usize = 8;

/// Fixed header size of a control message.
pub const CONTROL_HEADER_SIZE: usize = APP_NAME_LEN + 1 + 2 + 2 + 4 + 8 + 8 + BUS_HEADER_SIZE;

/// `dev_num` addressing every device on the bus.
pub const DEV_ALL: u16 = 0xFFFF;

const OFF_LEN: usize = APP_NAME_LEN + 1 + 2;
const READ_CHUNK_SIZE: usize = 2 * 1024;

/// Per-module header carried by bus requests and responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusHeader {
    pub msg_id: u8,
    /// Frame flag bits, see [`crate::flags`].
    pub flags: u8,
    /// The caller is waiting on the socket for the answer.
    pub blocking: bool,
    /// Result code on responses; zero means success.
    pub status: i32,
}

/// One control-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub app_name: String,
    pub module_id: u8,
    /// Virtual device number, or [`DEV_ALL`].
    pub dev_num: u16,
    pub seq: u32,
    /// Sender's wall clock in milliseconds since the Unix epoch.
    pub sent_ms: i64,
    /// How long the sender is willing to wait; zero means not at all.
    pub timeout_ms: i64,
    pub bus: BusHeader,
    pub payload: Bytes,
}

impl ControlMessage {
    pub fn new(
        app_name: impl Into<String>,
        module_id: u8,
        dev_num: u16,
        bus: BusHeader,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            module_id,
            dev_num,
            seq: 0,
            sent_ms: 0,
            timeout_ms: 0,
            bus,
            payload: payload.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dev_num == DEV_ALL
    }

    /// The total wire size of this message (header + payload).
    pub fn wire_size(&self) -> usize {
        CONTROL_HEADER_SIZE + self.payload.len()
    }
}

/// Encode a control message. Names longer than 31 bytes are truncated.
pub fn encode_control(msg: &ControlMessage, dst: &mut BytesMut) -> Result<()> {
    if msg.payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: msg.payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let mut name = [0u8; APP_NAME_LEN];
    let raw = msg.app_name.as_bytes();
    let keep = raw.len().min(APP_NAME_LEN - 1);
    name[..keep].copy_from_slice(&raw[..keep]);

    dst.reserve(msg.wire_size());
    dst.put_slice(&name);
    dst.put_u8(msg.module_id);
    dst.put_u16_le(msg.dev_num);
    dst.put_u16_le(msg.payload.len() as u16);
    dst.put_u32_le(msg.seq);
    dst.put_i64_le(msg.sent_ms);
    dst.put_i64_le(msg.timeout_ms);
    dst.put_u8(msg.bus.msg_id);
    dst.put_u8(msg.bus.flags);
    dst.put_u8(u8::from(msg.bus.blocking));
    dst.put_u8(0);
    dst.put_i32_le(msg.bus.status);
    dst.put_slice(&msg.payload);
    Ok(())
}

/// Decode a control message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer.
pub fn decode_control(src: &mut BytesMut, max_payload: usize) -> Result<Option<ControlMessage>> {
    if src.len() < CONTROL_HEADER_SIZE {
        return Ok(None);
    }

    let payload_len = usize::from(u16::from_le_bytes([src[OFF_LEN], src[OFF_LEN + 1]]));
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    if src.len() < CONTROL_HEADER_SIZE + payload_len {
        return Ok(None);
    }

    let name = src.split_to(APP_NAME_LEN);
    let name_end = name.iter().position(|b| *b == 0).unwrap_or(APP_NAME_LEN);
    let app_name = String::from_utf8_lossy(&name[..name_end]).into_owned();

    let module_id = src.get_u8();
    let dev_num = src.get_u16_le();
    let _len = src.get_u16_le();
    let seq = src.get_u32_le();
    let sent_ms = src.get_i64_le();
    let timeout_ms = src.get_i64_le();
    let msg_id = src.get_u8();
    let flags = src.get_u8();
    let blocking = src.get_u8() != 0;
    let _reserved = src.get_u8();
    let status = src.get_i32_le();
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(ControlMessage {
        app_name,
        module_id,
        dev_num,
        seq,
        sent_ms,
        timeout_ms,
        bus: BusHeader {
            msg_id,
            flags,
            blocking,
            status,
        },
        payload,
    }))
}

/// Reads control messages from a stream.
pub struct ControlReader<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Read> ControlReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached; read
    /// timeouts surface as `FrameError::Io` (see [`FrameError::is_timeout`]).
    pub fn read_message(&mut self) -> Result<ControlMessage> {
        loop {
            if let Some(msg) = self.next_buffered()? {
                return Ok(msg);
            }
            if self.fill()? == 0 {
                return Err(FrameError::ConnectionClosed);
            }
        }
    }

    /// Perform exactly one read into the internal buffer.
    ///
    /// Meant for readiness-driven callers: after the descriptor polled
    /// readable this does not block. Returns the bytes read; 0 means EOF.
    pub fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Decode a message already sitting in the buffer, if there is one.
    pub fn next_buffered(&mut self) -> Result<Option<ControlMessage>> {
        decode_control(&mut self.buf, MAX_PAYLOAD)
    }

    /// Forget partially received bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// Writes control messages to a stream.
pub struct ControlWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> ControlWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(CONTROL_HEADER_SIZE + MAX_PAYLOAD),
        }
    }

    /// Encode and send one message (blocking).
    pub fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        self.buf.clear();
        encode_control(msg, &mut self.buf)?;
        self.inner.write_all(&self.buf).map_err(|err| {
            if matches!(
                err.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::WriteZero
            ) {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(err)
            }
        })?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
