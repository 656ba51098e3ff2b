use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

const DRAIN_CHUNK_SIZE: usize = 512;

/// TCP listener for one control-plane endpoint (a bus module or the
/// callback fan-out).
pub struct ControlListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ControlListener {
    /// Bind and listen on `addr` (`host:port`; port 0 picks a free port).
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(TransportError::LocalAddr)?;

        info!(%local_addr, "listening on control socket");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<ControlStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted control connection");
        Ok(ControlStream {
            stream,
            peer: Some(peer),
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for ControlListener {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.listener.as_raw_fd()
    }
}

/// A connected control-plane stream.
pub struct ControlStream {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl ControlStream {
    /// Connect to a control-plane listener (blocking).
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        debug!(addr, "connected to control socket");
        Ok(Self { stream, peer })
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            peer: self.peer,
        })
    }

    /// Remote address, if the socket still knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Discard whatever is already queued for reading, without blocking.
    ///
    /// Returns the number of bytes thrown away. Replies to abandoned
    /// exchanges land here.
    pub fn drain_stale(&mut self) -> Result<usize> {
        self.stream.set_nonblocking(true)?;
        let drained = self.drain_nonblocking();
        self.stream.set_nonblocking(false)?;
        drained
    }

    fn drain_nonblocking(&mut self) -> Result<usize> {
        let mut chunk = [0u8; DRAIN_CHUNK_SIZE];
        let mut total = 0usize;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(total),
                Ok(n) => total += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(total),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    /// Shut down both directions of the connection.
    pub fn shutdown(&self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(TransportError::Io(err)),
        }
    }
}

impl Read for ControlStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for ControlStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for ControlStream {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }
}

impl std::fmt::Debug for ControlStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlStream")
            .field("type", &"tcp")
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_accept_connect() {
        let listener = ControlListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().to_string();
        assert_eq!(listener.transport_name(), "tcp");

        let handle = std::thread::spawn(move || {
            let mut client = ControlStream::connect(&addr).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        assert!(server.peer_addr().is_some());
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_bind_twice_fails() {
        let first = ControlListener::bind("127.0.0.1:0").unwrap();
        let addr = first.local_addr().to_string();
        let second = ControlListener::bind(&addr);
        assert!(matches!(second, Err(TransportError::Bind { .. })));
    }

    #[test]
    fn test_connect_refused() {
        let addr = {
            let listener = ControlListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().to_string()
        };
        let result = ControlStream::connect(&addr);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn test_drain_stale_discards_queued_bytes() {
        let listener = ControlListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().to_string();
        let mut client = ControlStream::connect(&addr).unwrap();
        let mut server = listener.accept().unwrap();

        server.write_all(b"stale reply").unwrap();
        server.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let drained = client.drain_stale().unwrap();
        assert_eq!(drained, b"stale reply".len());

        // The stream is blocking again and still usable.
        server.write_all(b"fresh").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"fresh");
    }

    #[test]
    fn test_drain_stale_on_empty_socket() {
        let listener = ControlListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().to_string();
        let mut client = ControlStream::connect(&addr).unwrap();
        let _server = listener.accept().unwrap();

        assert_eq!(client.drain_stale().unwrap(), 0);
    }

    #[test]
    fn test_read_timeout_applies() {
        let listener = ControlListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().to_string();
        let mut client = ControlStream::connect(&addr).unwrap();
        let _server = listener.accept().unwrap();

        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut
        ));
    }
}
