use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::codec::{
    parse_header, read_u16_le, Frame, HEADER_SIZE, MAX_PAYLOAD, OFF_CRC, OFF_LEN, OFF_LEN_INV,
    PREAMBLE, SOF,
};
use crate::crc;
use crate::error::{FrameError, Result};

/// Default gap after which a partial frame is abandoned.
pub const DEFAULT_INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(50);

/// Receive cursor of one bus link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Between frames.
    Idle,
    /// Matching the preamble pattern.
    Preamble,
    /// Preamble seen, expecting the start-of-frame marker.
    Sof,
    /// Collecting header and payload bytes.
    Frame,
}

/// Per-link receive counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStats {
    pub frames: u64,
    pub crc_fail: u64,
    pub len_fail: u64,
    pub len_too_long: u64,
    /// Partial frames abandoned because the line went quiet.
    pub timeouts: u64,
}

/// Configuration for the receive state machine.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Maximum accepted payload length.
    pub max_payload: usize,
    /// Longest tolerated silence inside a frame.
    pub inter_byte_timeout: Duration,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
            inter_byte_timeout: DEFAULT_INTER_BYTE_TIMEOUT,
        }
    }
}

/// Byte-at-a-time receive state machine for one bus link.
///
/// Noise before a preamble is skipped silently. Malformed frames surface as
/// [`FrameError::LenFail`], [`FrameError::LenTooLong`] or
/// [`FrameError::CrcFail`]; in every error case the decoder is already back
/// in [`RxState::Idle`] when `push` returns.
#[derive(Debug)]
pub struct FrameDecoder {
    state: RxState,
    buf: Vec<u8>,
    preamble_idx: usize,
    crc: u16,
    frame_len: Option<usize>,
    last_activity: Option<Instant>,
    config: DecoderConfig,
    stats: RxStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_config(DecoderConfig::default())
    }

    pub fn with_config(config: DecoderConfig) -> Self {
        Self {
            state: RxState::Idle,
            buf: Vec::with_capacity(HEADER_SIZE + config.max_payload),
            preamble_idx: 0,
            crc: 0,
            frame_len: None,
            last_activity: None,
            config,
            stats: RxStats::default(),
        }
    }

    /// Feed one received byte, observed at `now`.
    ///
    /// Returns `Ok(Some(frame))` when the byte completes a valid frame and
    /// `Ok(None)` while more bytes are needed.
    pub fn push(&mut self, byte: u8, now: Instant) -> Result<Option<Frame>> {
        if self.state != RxState::Idle {
            if let Some(last) = self.last_activity {
                if now.saturating_duration_since(last) > self.config.inter_byte_timeout {
                    trace!(
                        state = ?self.state,
                        partial = self.buf.len(),
                        "inter-byte timeout, discarding partial frame"
                    );
                    self.stats.timeouts += 1;
                    self.state = RxState::Idle;
                }
            }
        }
        self.last_activity = Some(now);
        self.step(byte)
    }

    fn step(&mut self, byte: u8) -> Result<Option<Frame>> {
        if self.state == RxState::Idle {
            self.reset_cursor();
            self.state = RxState::Preamble;
        }

        match self.state {
            RxState::Preamble => {
                if byte == PREAMBLE[self.preamble_idx] {
                    self.preamble_idx += 1;
                    if self.preamble_idx == PREAMBLE.len() {
                        self.state = RxState::Sof;
                    }
                    return Ok(None);
                }
                let was_matching = self.preamble_idx > 0;
                self.state = RxState::Idle;
                if was_matching {
                    // The breaking byte may itself start a new preamble.
                    return self.step(byte);
                }
                Ok(None)
            }
            RxState::Sof => {
                if byte == SOF {
                    self.state = RxState::Frame;
                    return Ok(None);
                }
                self.state = RxState::Idle;
                self.step(byte)
            }
            RxState::Frame => self.step_frame(byte),
            RxState::Idle => Ok(None),
        }
    }

    fn step_frame(&mut self, byte: u8) -> Result<Option<Frame>> {
        self.buf.push(byte);
        let received = self.buf.len();

        if received > OFF_LEN {
            self.crc = crc::resume(self.crc, &[byte]);
        }

        if received == OFF_LEN_INV + 2 {
            let len = read_u16_le(&self.buf, OFF_LEN);
            let len_inv = read_u16_le(&self.buf, OFF_LEN_INV);
            if len_inv != !len {
                self.stats.len_fail += 1;
                self.state = RxState::Idle;
                return Err(FrameError::LenFail { len, len_inv });
            }
            if usize::from(len) > self.config.max_payload {
                self.stats.len_too_long += 1;
                self.state = RxState::Idle;
                return Err(FrameError::LenTooLong {
                    len: usize::from(len),
                    max: self.config.max_payload,
                });
            }
            self.frame_len = Some(HEADER_SIZE + usize::from(len));
        }

        if self.frame_len != Some(received) {
            return Ok(None);
        }

        self.state = RxState::Idle;
        let expected = read_u16_le(&self.buf, OFF_CRC);
        if expected != self.crc {
            self.stats.crc_fail += 1;
            return Err(FrameError::CrcFail {
                expected,
                computed: self.crc,
            });
        }

        self.stats.frames += 1;
        Ok(Some(Frame {
            header: parse_header(&self.buf[..HEADER_SIZE]),
            crc: expected,
            payload: Bytes::copy_from_slice(&self.buf[HEADER_SIZE..]),
        }))
    }

    fn reset_cursor(&mut self) {
        self.buf.clear();
        self.preamble_idx = 0;
        self.crc = 0;
        self.frame_len = None;
    }

    /// Drop any partial frame and return to [`RxState::Idle`].
    pub fn reset(&mut self) {
        self.reset_cursor();
        self.state = RxState::Idle;
    }

    /// Current receive cursor.
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Bytes of the current frame collected so far (after SOF).
    pub fn partial_len(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> RxStats {
        self.stats
    }

    /// When the last byte arrived, if any.
    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
