use bytes::{BufMut, Bytes, BytesMut};

use crate::addr::PhysAddr;
use crate::crc;
use crate::error::{FrameError, Result};

/// Synchronization pattern sent before every frame.
pub const PREAMBLE: [u8; 7] = [0xAA; 7];

/// Start-of-frame marker following the preamble.
pub const SOF: u8 = 0xAB;

/// Header: crc (2) + len (2) + len_inv (2) + addr (8) + msg_id (1)
/// + sock_fd (4) + flags (1) + seq (2) + timestamp (2) = 24 bytes.
pub const HEADER_SIZE: usize = 24;

/// Bytes before the header on the wire.
pub const SYNC_SIZE: usize = PREAMBLE.len() + 1;

/// Largest payload a device frame may carry.
pub const MAX_PAYLOAD: usize = 1024;

pub(crate) const OFF_CRC: usize = 0;
pub(crate) const OFF_LEN: usize = 2;
pub(crate) const OFF_LEN_INV: usize = 4;
const OFF_ADDR: usize = 6;
const OFF_MSG_ID: usize = 14;
const OFF_SOCK_FD: usize = 15;
const OFF_FLAGS: usize = 19;
const OFF_SEQ: usize = 20;
const OFF_TIMESTAMP: usize = 22;

/// Header flag bits.
pub mod flags {
    /// The device must not answer.
    pub const NO_ACK: u8 = 0x01;
    /// The frame is addressed to every device.
    pub const BROADCAST: u8 = 0x02;
    /// Devices answer even frames not addressed to them.
    pub const PROMISCUOUS: u8 = 0x04;
}

/// Header fields of a device frame, minus the derived ones
/// (`crc`, `len`, `len_inv`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Source address on receive, destination on transmit.
    pub addr: PhysAddr,
    pub msg_id: u8,
    /// Control-plane socket that originated the request.
    /// 0 marks an unsolicited frame, negative values are invalid.
    pub sock_fd: i32,
    pub flags: u8,
    pub seq: u16,
    /// Sender's millisecond clock, wrapping.
    pub timestamp: u16,
}

impl FrameHeader {
    /// Header for `msg_id` to `addr` with everything else zeroed.
    pub fn new(addr: PhysAddr, msg_id: u8) -> Self {
        Self {
            addr,
            msg_id,
            sock_fd: 0,
            flags: 0,
            seq: 0,
            timestamp: 0,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A validated device frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    /// CRC as transmitted (and verified).
    pub crc: u16,
    pub payload: Bytes,
}

impl Frame {
    /// The total wire size of this frame (sync + header + payload).
    pub fn wire_size(&self) -> usize {
        SYNC_SIZE + HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format. Returns the CRC written.
///
/// Wire format:
/// ```text
/// ┌──────────────┬─────┬─────┬─────┬─────────┬─────────┬────────┬─────────┬───────┬─────┬────┬─────────┐
/// │ 0xAA x7      │ SOF │ crc │ len │ len_inv │ addr[8] │ msg_id │ sock_fd │ flags │ seq │ ts │ payload │
/// │              │0xAB │ LE  │ LE  │   LE    │         │        │  i32 LE │       │ LE  │ LE │         │
/// └──────────────┴─────┴─────┴─────┴─────────┴─────────┴────────┴─────────┴───────┴─────┴────┴─────────┘
/// ```
/// The CRC covers every header byte after the CRC field, then the payload.
pub fn encode_frame(header: &FrameHeader, payload: &[u8], dst: &mut BytesMut) -> Result<u16> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let len = payload.len() as u16;

    dst.reserve(SYNC_SIZE + HEADER_SIZE + payload.len());
    dst.put_slice(&PREAMBLE);
    dst.put_u8(SOF);

    let header_start = dst.len();
    dst.put_u16_le(0); // crc, patched below
    dst.put_u16_le(len);
    dst.put_u16_le(!len);
    dst.put_slice(header.addr.as_bytes());
    dst.put_u8(header.msg_id);
    dst.put_i32_le(header.sock_fd);
    dst.put_u8(header.flags);
    dst.put_u16_le(header.seq);
    dst.put_u16_le(header.timestamp);

    let header_crc = crc::compute(&dst[header_start + OFF_LEN..header_start + HEADER_SIZE]);
    let frame_crc = crc::resume(header_crc, payload);
    dst[header_start..header_start + OFF_LEN].copy_from_slice(&frame_crc.to_le_bytes());

    dst.put_slice(payload);
    Ok(frame_crc)
}

/// Parse the fixed header fields from a complete header buffer.
pub(crate) fn parse_header(buf: &[u8]) -> FrameHeader {
    let mut addr = [0u8; PhysAddr::LEN];
    addr.copy_from_slice(&buf[OFF_ADDR..OFF_ADDR + PhysAddr::LEN]);
    FrameHeader {
        addr: PhysAddr::new(addr),
        msg_id: buf[OFF_MSG_ID],
        sock_fd: i32::from_le_bytes([
            buf[OFF_SOCK_FD],
            buf[OFF_SOCK_FD + 1],
            buf[OFF_SOCK_FD + 2],
            buf[OFF_SOCK_FD + 3],
        ]),
        flags: buf[OFF_FLAGS],
        seq: read_u16_le(buf, OFF_SEQ),
        timestamp: read_u16_le(buf, OFF_TIMESTAMP),
    }
}

pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            addr: PhysAddr::new([1, 2, 3, 4, 5, 6, 7, 8]),
            msg_id: 0x11,
            sock_fd: 9,
            flags: flags::NO_ACK,
            seq: 0x0102,
            timestamp: 0xBEEF,
        }
    }

    #[test]
    fn test_encode_layout() {
        let mut buf = BytesMut::new();
        let crc = encode_frame(&sample_header(), b"\x01\x02\x03", &mut buf).unwrap();

        assert_eq!(buf.len(), SYNC_SIZE + HEADER_SIZE + 3);
        assert_eq!(&buf[..7], &PREAMBLE);
        assert_eq!(buf[7], SOF);

        let header = &buf[SYNC_SIZE..SYNC_SIZE + HEADER_SIZE];
        assert_eq!(read_u16_le(header, OFF_CRC), crc);
        assert_eq!(read_u16_le(header, OFF_LEN), 3);
        assert_eq!(read_u16_le(header, OFF_LEN_INV), !3u16);
        assert_eq!(parse_header(header), sample_header());
        assert_eq!(&buf[SYNC_SIZE + HEADER_SIZE..], b"\x01\x02\x03");
    }

    #[test]
    fn test_crc_covers_header_tail_and_payload() {
        let mut buf = BytesMut::new();
        let crc = encode_frame(&sample_header(), b"payload", &mut buf).unwrap();
        let covered = &buf[SYNC_SIZE + OFF_LEN..];
        assert_eq!(crc::compute(covered), crc);
    }

    #[test]
    fn test_negative_sock_fd_roundtrips_in_header() {
        let mut header = sample_header();
        header.sock_fd = -1;
        let mut buf = BytesMut::new();
        encode_frame(&header, &[], &mut buf).unwrap();
        assert_eq!(parse_header(&buf[SYNC_SIZE..]).sock_fd, -1);
    }

    #[test]
    fn test_payload_too_large() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let result = encode_frame(&sample_header(), &payload, &mut buf);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_max_payload_accepted() {
        let mut buf = BytesMut::new();
        let payload = vec![0x5Au8; MAX_PAYLOAD];
        encode_frame(&sample_header(), &payload, &mut buf).unwrap();
        assert_eq!(buf.len(), SYNC_SIZE + HEADER_SIZE + MAX_PAYLOAD);
    }

    #[test]
    fn test_frame_wire_size() {
        let frame = Frame {
            header: sample_header(),
            crc: 0,
            payload: Bytes::from_static(b"test"),
        };
        assert_eq!(frame.wire_size(), 8 + 24 + 4);
    }

    #[test]
    fn test_flags() {
        let mut header = FrameHeader::new(PhysAddr::BROADCAST, 1);
        header.flags = flags::BROADCAST | flags::PROMISCUOUS;
        assert!(header.has_flag(flags::BROADCAST));
        assert!(header.has_flag(flags::PROMISCUOUS));
        assert!(!header.has_flag(flags::NO_ACK));
    }
}
