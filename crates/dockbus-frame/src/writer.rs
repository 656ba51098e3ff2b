use std::io::{ErrorKind, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::trace;

use crate::addr::PhysAddr;
use crate::codec::{encode_frame, FrameHeader, HEADER_SIZE, MAX_PAYLOAD, SYNC_SIZE};
use crate::error::{FrameError, Result};

/// Bounded retry policy for a line reporting itself busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRetry {
    /// Busy results tolerated per segment before the send fails.
    pub max_busy_retries: u32,
    /// Pause between attempts.
    pub busy_delay: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            max_busy_retries: 5,
            busy_delay: Duration::from_millis(2),
        }
    }
}

/// Serializes frames onto the bus: preamble, header, payload.
///
/// Stamps each frame with the next sequence number and a wrapping
/// millisecond timestamp.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    seq: u16,
    epoch: Instant,
    retry: WriteRetry,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with the default retry policy.
    pub fn new(inner: T) -> Self {
        Self::with_retry(inner, WriteRetry::default())
    }

    /// Create a new frame writer with an explicit retry policy.
    pub fn with_retry(inner: T, retry: WriteRetry) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(SYNC_SIZE + HEADER_SIZE + MAX_PAYLOAD),
            seq: 0,
            epoch: Instant::now(),
            retry,
        }
    }

    /// Frame and transmit `payload` to `addr`. Returns the header as sent.
    pub fn send(
        &mut self,
        addr: PhysAddr,
        msg_id: u8,
        sock_fd: i32,
        flags: u8,
        payload: &[u8],
    ) -> Result<FrameHeader> {
        self.seq = self.seq.wrapping_add(1);
        let header = FrameHeader {
            addr,
            msg_id,
            sock_fd,
            flags,
            seq: self.seq,
            timestamp: self.epoch.elapsed().as_millis() as u16,
        };

        self.buf.clear();
        encode_frame(&header, payload, &mut self.buf)?;

        let wire = std::mem::take(&mut self.buf);
        let result = self.write_wire(&wire);
        self.buf = wire;
        result?;

        trace!(%addr, msg_id, seq = header.seq, len = payload.len(), "frame sent");
        Ok(header)
    }

    fn write_wire(&mut self, wire: &[u8]) -> Result<()> {
        let (sync, rest) = wire.split_at(SYNC_SIZE);
        let (header, payload) = rest.split_at(HEADER_SIZE);
        self.write_segment(sync)?;
        self.write_segment(header)?;
        self.write_segment(payload)?;
        self.flush()
    }

    fn write_segment(&mut self, segment: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        let mut busy = 0u32;
        while offset < segment.len() {
            match self.inner.write(&segment[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_busy(&err) => {
                    busy += 1;
                    if busy > self.retry.max_busy_retries {
                        return Err(FrameError::DeviceBusy { attempts: busy });
                    }
                    std::thread::sleep(self.retry.busy_delay);
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        let mut busy = 0u32;
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_busy(&err) => {
                    busy += 1;
                    if busy > self.retry.max_busy_retries {
                        return Err(FrameError::DeviceBusy { attempts: busy });
                    }
                    std::thread::sleep(self.retry.busy_delay);
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Sequence number of the most recently sent frame.
    pub fn last_seq(&self) -> u16 {
        self.seq
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn is_busy(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::ResourceBusy)
}
