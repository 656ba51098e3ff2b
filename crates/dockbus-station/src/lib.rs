//! Station-side engine of dockbus: address resolution, request dispatch,
//! discovery and callback fan-out.
//!
//! The daemon runs one [`BusServer`] per device bus plus a
//! [`CallbackServer`]. Applications talk to it through [`BusClient`] and
//! [`CallbackListener`]. Everything shared between threads lives in a
//! [`Station`] passed around by `Arc`.

pub mod address;
pub mod callback;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod message;
pub mod module;
pub mod scan;
pub mod server;
pub mod station;

pub use address::{AddressTable, DeviceTarget, Learned, MAX_DEVICES};
pub use callback::{
    CallbackEvent, CallbackHandle, CallbackListener, CallbackPublisher, CallbackServer,
    Subscriptions, DAEMON_APP_NAME,
};
pub use client::{resolve_no_ack, BusClient, CallOptions};
pub use config::{
    BusConfig, CallbackConfig, ClientConfig, ConfigLookup, JsonConfig, ScanConfig, StationConfig,
};
pub use device::{DeviceRecord, DeviceStats, MessageSlot};
pub use error::{Result, StationError};
pub use message::{status, MessageId, Request, Response};
pub use module::Module;
pub use scan::{scan, BusProbe, DiscoveryProbe, ScanOutcome};
pub use server::{loopback_device, BusServer};
pub use station::{LinkStats, Station};
