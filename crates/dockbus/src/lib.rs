//! Station-control bus daemon for bike-dock points (BDP) and key readers
//! (KR) sharing half-duplex serial buses.
//!
//! # Crate Structure
//!
//! - [`transport`]: serial line, loopback line and TCP control plane
//! - [`frame`]: device frame codec and control-plane messages
//! - [`station`]: address table, dispatcher, client, discovery, callbacks

/// Re-export transport types.
pub mod transport {
    pub use dockbus_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use dockbus_frame::*;
}

/// Re-export station types.
pub mod station {
    pub use dockbus_station::*;
}
