use std::io::{ErrorKind, Read};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::codec::Frame;
use crate::decoder::{DecoderConfig, FrameDecoder, RxStats};
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 256;

/// Reads validated device frames from any `Read` byte stream.
///
/// Malformed frames are counted and skipped; callers only ever see complete,
/// CRC-checked frames or a fatal I/O condition.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, DecoderConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: DecoderConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            decoder: FrameDecoder::with_config(config),
        }
    }

    /// Read the next valid frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let now = Instant::now();
            while self.buf.has_remaining() {
                let byte = self.buf.get_u8();
                match self.decoder.push(byte, now) {
                    Ok(Some(frame)) => return Ok(frame),
                    Ok(None) => {}
                    Err(err) if err.is_recoverable() => {
                        debug!(error = %err, "dropping malformed frame");
                    }
                    Err(err) => return Err(err),
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Receive counters of the underlying decoder.
    pub fn stats(&self) -> RxStats {
        self.decoder.stats()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}
