use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Read/write timeout of the tty. Reads happen after `poll` reported data,
/// so this only bounds a line that stalls mid-transfer.
const LINE_TIMEOUT: Duration = Duration::from_millis(100);

/// Baud rates accepted by [`BusPort::open`].
pub const SUPPORTED_BAUD_RATES: &[u32] = &[9600, 19200, 38400, 57600, 115200, 230400];

/// The device side of a bus: something bytes are written to and read from.
///
/// On real hardware this is a tty configured for raw 8N1 I/O. The loopback
/// variant feeds every written byte back to the reader, which lets the
/// daemon run without a bus attached. The socket variant carries a simulated
/// bus on the other end of a `UnixStream`.
pub struct BusPort {
    inner: BusPortInner,
    name: String,
}

enum BusPortInner {
    Serial(TTYPort),
    Loopback { tx: UnixStream, rx: UnixStream },
    Socket(UnixStream),
}

impl BusPort {
    /// Open a serial device for raw 8N1 I/O at the given baud rate.
    pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !SUPPORTED_BAUD_RATES.contains(&baud) {
            return Err(TransportError::UnsupportedBaud(baud));
        }

        let mut tty = serialport::new(path.to_string_lossy(), baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(LINE_TIMEOUT)
            .open_native()
            .map_err(|e| open_error(&path, e))?;

        // Stale bytes from before the daemon started are meaningless.
        tty.clear(ClearBuffer::All)
            .map_err(|e| TransportError::Configure {
                path: path.clone(),
                source: e.into(),
            })?;

        info!(?path, baud, "opened serial bus");

        Ok(Self {
            inner: BusPortInner::Serial(tty),
            name: path.display().to_string(),
        })
    }

    /// Create a software loopback: everything written comes back on read.
    pub fn loopback() -> Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        debug!("created loopback bus");
        Ok(Self {
            inner: BusPortInner::Loopback { tx, rx },
            name: "loopback".to_string(),
        })
    }

    /// Wrap one end of a stream whose peer plays the part of the bus.
    pub fn from_unix_stream(stream: UnixStream, name: impl Into<String>) -> Self {
        Self {
            inner: BusPortInner::Socket(stream),
            name: name.into(),
        }
    }

    /// Clone the port (new descriptors for the same line), so one handle can
    /// read while another writes.
    pub fn try_clone(&self) -> Result<Self> {
        let inner = match &self.inner {
            BusPortInner::Serial(tty) => {
                BusPortInner::Serial(tty.try_clone_native().map_err(std::io::Error::from)?)
            }
            BusPortInner::Loopback { tx, rx } => BusPortInner::Loopback {
                tx: tx.try_clone()?,
                rx: rx.try_clone()?,
            },
            BusPortInner::Socket(stream) => BusPortInner::Socket(stream.try_clone()?),
        };
        Ok(Self {
            inner,
            name: self.name.clone(),
        })
    }

    /// Device path or descriptive name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether written bytes are echoed back to this port's reader.
    pub fn is_loopback(&self) -> bool {
        matches!(self.inner, BusPortInner::Loopback { .. })
    }

    /// The path this port was opened from, if it is a real serial device.
    pub fn device_path(&self) -> Option<PathBuf> {
        match self.inner {
            BusPortInner::Serial(_) => Some(PathBuf::from(&self.name)),
            _ => None,
        }
    }
}

impl Read for BusPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            BusPortInner::Serial(tty) => tty.read(buf),
            BusPortInner::Loopback { rx, .. } => rx.read(buf),
            BusPortInner::Socket(stream) => stream.read(buf),
        }
    }
}

impl Write for BusPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            BusPortInner::Serial(tty) => tty.write(buf),
            BusPortInner::Loopback { tx, .. } => tx.write(buf),
            BusPortInner::Socket(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            BusPortInner::Serial(tty) => tty.flush(),
            BusPortInner::Loopback { tx, .. } => tx.flush(),
            BusPortInner::Socket(stream) => stream.flush(),
        }
    }
}

impl AsRawFd for BusPort {
    /// The descriptor to wait on for incoming bytes.
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            BusPortInner::Serial(tty) => tty.as_raw_fd(),
            BusPortInner::Loopback { rx, .. } => rx.as_raw_fd(),
            BusPortInner::Socket(stream) => stream.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for BusPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            BusPortInner::Serial(_) => "serial",
            BusPortInner::Loopback { .. } => "loopback",
            BusPortInner::Socket(_) => "socket",
        };
        f.debug_struct("BusPort")
            .field("type", &kind)
            .field("name", &self.name)
            .finish()
    }
}

/// A device that is missing or inaccessible failed to open; anything else
/// went wrong while putting the line into raw mode.
fn open_error(path: &Path, err: serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::Io(kind) => TransportError::Open {
            path: path.to_path_buf(),
            source: std::io::Error::new(kind, err.description),
        },
        serialport::ErrorKind::NoDevice => TransportError::Open {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, err.description),
        },
        _ => TransportError::Configure {
            path: path.to_path_buf(),
            source: err.into(),
        },
    }
}
