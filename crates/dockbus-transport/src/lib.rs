//! Transports for the dockbus station daemon.
//!
//! Two very different links meet in the daemon:
//! - the half-duplex device bus, reached through a serial line (or a
//!   software loopback when no hardware is attached)
//! - the TCP control plane that application processes use to reach the
//!   daemon
//!
//! This is the lowest layer of dockbus. Framing, addressing and routing all
//! build on the [`BusPort`] and [`ControlStream`] types provided here.

pub mod error;
pub mod tcp;

#[cfg(unix)]
pub mod poll;
#[cfg(unix)]
pub mod serial;

pub use error::{Result, TransportError};
pub use tcp::{ControlListener, ControlStream};

#[cfg(unix)]
pub use poll::{wait_readable, Readiness};
#[cfg(unix)]
pub use serial::{BusPort, SUPPORTED_BAUD_RATES};
