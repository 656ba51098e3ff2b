use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dockbus_frame::PhysAddr;
use serde::Serialize;
use tracing::warn;

use crate::error::{Result, StationError};
use crate::message::MessageId;
use crate::module::Module;

/// Last exchange of one message kind with one device.
#[derive(Debug, Clone, Default)]
pub struct MessageSlot {
    pub request: Bytes,
    pub response: Bytes,
    pub time_sent: Option<Instant>,
    pub time_received: Option<Instant>,
}

impl MessageSlot {
    /// Round trip of the last answered request.
    pub fn time_response(&self) -> Option<Duration> {
        let sent = self.time_sent?;
        let received = self.time_received?;
        received.checked_duration_since(sent)
    }
}

/// Cumulative traffic counters for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
    /// Responses accepted despite a wrong size (loopback only).
    pub length_mismatches: u64,
}

/// Everything the daemon knows about one discovered device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    index: u16,
    addr: PhysAddr,
    bus: Module,
    slots: BTreeMap<MessageId, MessageSlot>,
    stats: DeviceStats,
}

impl DeviceRecord {
    pub(crate) fn new(index: u16, addr: PhysAddr, bus: Module) -> Self {
        Self {
            index,
            addr,
            bus,
            slots: BTreeMap::new(),
            stats: DeviceStats::default(),
        }
    }

    /// Virtual device number.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    pub fn bus(&self) -> Module {
        self.bus
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    pub fn slot(&self, msg_id: MessageId) -> Option<&MessageSlot> {
        self.slots.get(&msg_id)
    }

    /// Record an outgoing request after checking its size.
    pub fn store_request(&mut self, msg_id: MessageId, payload: &[u8], now: Instant) -> Result<()> {
        let expected = msg_id
            .request_len()
            .ok_or(StationError::UnknownMessage(msg_id.as_u8()))?;
        if payload.len() != expected {
            return Err(StationError::MessageLength {
                msg_id: msg_id.as_u8(),
                expected,
                actual: payload.len(),
            });
        }

        let slot = self.slots.entry(msg_id).or_default();
        slot.request = Bytes::copy_from_slice(payload);
        slot.time_sent = Some(now);
        slot.time_received = None;
        self.stats.tx_frames += 1;
        self.stats.tx_bytes += payload.len() as u64;
        Ok(())
    }

    /// Record an incoming response and return the payload as stored.
    ///
    /// A size mismatch is an error unless `tolerate_mismatch` is set; then
    /// the payload is truncated or zero padded to the declared size.
    pub fn store_response(
        &mut self,
        msg_id: MessageId,
        payload: &[u8],
        now: Instant,
        tolerate_mismatch: bool,
    ) -> Result<Bytes> {
        let expected = msg_id.response_len();
        let stored = if payload.len() == expected {
            Bytes::copy_from_slice(payload)
        } else if tolerate_mismatch {
            warn!(
                addr = %self.addr,
                msg_id = msg_id.as_u8(),
                expected,
                actual = payload.len(),
                "response length mismatch tolerated on loopback"
            );
            self.stats.length_mismatches += 1;
            let mut fixed = BytesMut::zeroed(expected);
            let keep = payload.len().min(expected);
            fixed[..keep].copy_from_slice(&payload[..keep]);
            fixed.freeze()
        } else {
            return Err(StationError::MessageLength {
                msg_id: msg_id.as_u8(),
                expected,
                actual: payload.len(),
            });
        };

        let slot = self.slots.entry(msg_id).or_default();
        slot.response = stored.clone();
        slot.time_received = Some(now);
        self.stats.rx_frames += 1;
        self.stats.rx_bytes += payload.len() as u64;
        Ok(stored)
    }
}
