/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length field does not match its transmitted complement.
    #[error("length self-check failed (len {len:#06x}, len_inv {len_inv:#06x})")]
    LenFail { len: u16, len_inv: u16 },

    /// The length field announces more payload than the bus allows.
    #[error("frame length too long ({len} bytes, max {max})")]
    LenTooLong { len: usize, max: usize },

    /// The computed CRC disagrees with the transmitted one.
    #[error("crc mismatch (frame {expected:#06x}, computed {computed:#06x})")]
    CrcFail { expected: u16, computed: u16 },

    /// An outgoing payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The line stayed busy through every write retry.
    #[error("device busy after {attempts} write attempts")]
    DeviceBusy { attempts: u32 },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Malformed-frame conditions: the decoder resynchronizes and carries on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LenFail { .. } | Self::LenTooLong { .. } | Self::CrcFail { .. }
        )
    }

    /// True for read timeouts on sockets with a receive deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
