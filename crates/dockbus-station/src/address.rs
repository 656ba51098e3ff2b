//! Virtual ↔ physical address resolution.
//!
//! Devices choose their own 8-byte bus address. The daemon learns each one
//! during discovery and hands out a small dense index (the "virtual number")
//! that applications use from then on.

use std::fmt;

use dockbus_frame::{PhysAddr, DEV_ALL};
use tracing::debug;

use crate::device::DeviceRecord;
use crate::error::{Result, StationError};
use crate::module::Module;

/// Upper bound on devices across all buses.
pub const MAX_DEVICES: usize = 64;

/// Destination of a request: one device or every device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTarget {
    One(u16),
    All,
}

impl DeviceTarget {
    /// Interpret a control-plane `dev_num`.
    pub fn from_dev_num(dev_num: u16) -> Self {
        if dev_num == DEV_ALL {
            Self::All
        } else {
            Self::One(dev_num)
        }
    }

    pub fn dev_num(self) -> u16 {
        match self {
            Self::One(dev) => dev,
            Self::All => DEV_ALL,
        }
    }

    pub fn is_all(self) -> bool {
        matches!(self, Self::All)
    }

    /// Whether a reply from `dev` answers a request sent to this target.
    pub fn matches(self, dev: u16) -> bool {
        match self {
            Self::One(expected) => expected == dev,
            Self::All => true,
        }
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(dev) => write!(f, "{dev}"),
            Self::All => f.write_str("all"),
        }
    }
}

/// Outcome of [`AddressTable::learn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    /// New device, with its freshly assigned virtual number.
    Added(u16),
    /// The address was already known under this number.
    AlreadyPresent(u16),
}

impl Learned {
    pub fn index(self) -> u16 {
        match self {
            Self::Added(index) | Self::AlreadyPresent(index) => index,
        }
    }
}

/// Learned devices, indexed by virtual number.
#[derive(Debug, Default)]
pub struct AddressTable {
    records: Vec<DeviceRecord>,
    bus_counts: [usize; 2],
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `addr` as a device on `bus`.
    pub fn learn(&mut self, bus: Module, addr: PhysAddr) -> Result<Learned> {
        if addr.is_reserved() {
            return Err(StationError::AddrInvalid(addr));
        }
        if let Some(index) = self.position(addr) {
            return Ok(Learned::AlreadyPresent(index));
        }
        if self.records.len() >= MAX_DEVICES {
            return Err(StationError::TableFull { max: MAX_DEVICES });
        }

        let index = self.records.len() as u16;
        self.records.push(DeviceRecord::new(index, addr, bus));
        if let Some(count) = bus_slot(bus).and_then(|slot| self.bus_counts.get_mut(slot)) {
            *count += 1;
        }
        debug!(%bus, %addr, index, "device learned");
        Ok(Learned::Added(index))
    }

    pub fn physical_to_virtual(&self, addr: PhysAddr) -> Result<u16> {
        if addr.is_reserved() {
            return Err(StationError::AddrInvalid(addr));
        }
        self.position(addr).ok_or(StationError::NotFound(addr))
    }

    /// `All` resolves to the broadcast address.
    pub fn virtual_to_physical(&self, target: DeviceTarget) -> Result<PhysAddr> {
        match target {
            DeviceTarget::All => Ok(PhysAddr::BROADCAST),
            DeviceTarget::One(index) => self
                .records
                .get(usize::from(index))
                .map(DeviceRecord::addr)
                .ok_or(StationError::UnknownDevice(index)),
        }
    }

    /// Forget every device.
    pub fn flush(&mut self) {
        self.records.clear();
        self.bus_counts = [0; 2];
    }

    pub fn record(&self, index: u16) -> Option<&DeviceRecord> {
        self.records.get(usize::from(index))
    }

    pub fn record_mut(&mut self, index: u16) -> Option<&mut DeviceRecord> {
        self.records.get_mut(usize::from(index))
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.iter()
    }

    /// Devices discovered on `bus`.
    pub fn count(&self, bus: Module) -> usize {
        bus_slot(bus)
            .and_then(|slot| self.bus_counts.get(slot).copied())
            .unwrap_or(0)
    }

    /// Devices discovered on every bus.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, addr: PhysAddr) -> Option<u16> {
        self.records
            .iter()
            .position(|rec| rec.addr() == addr)
            .map(|pos| pos as u16)
    }
}

fn bus_slot(bus: Module) -> Option<usize> {
    match bus {
        Module::Bdp => Some(0),
        Module::Kr => Some(1),
        Module::Callback => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> PhysAddr {
        PhysAddr([0x42, 0, 0, 0, 0, 0, 0, last])
    }

    #[test]
    fn learn_assigns_dense_indices() {
        let mut table = AddressTable::new();
        assert_eq!(table.learn(Module::Bdp, addr(1)).unwrap(), Learned::Added(0));
        assert_eq!(table.learn(Module::Kr, addr(2)).unwrap(), Learned::Added(1));
        assert_eq!(table.learn(Module::Bdp, addr(3)).unwrap(), Learned::Added(2));

        assert_eq!(table.len(), 3);
        assert_eq!(table.count(Module::Bdp), 2);
        assert_eq!(table.count(Module::Kr), 1);
        assert_eq!(table.count(Module::Callback), 0);
    }

    #[test]
    fn learn_is_idempotent() {
        let mut table = AddressTable::new();
        table.learn(Module::Bdp, addr(1)).unwrap();
        assert_eq!(
            table.learn(Module::Bdp, addr(1)).unwrap(),
            Learned::AlreadyPresent(0)
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.count(Module::Bdp), 1);
    }

    #[test]
    fn reserved_addresses_never_learned_or_resolved() {
        let mut table = AddressTable::new();
        for reserved in [PhysAddr::ZERO, PhysAddr::BROADCAST] {
            assert!(matches!(
                table.learn(Module::Bdp, reserved),
                Err(StationError::AddrInvalid(_))
            ));
            assert!(matches!(
                table.physical_to_virtual(reserved),
                Err(StationError::AddrInvalid(_))
            ));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn resolves_both_directions() {
        let mut table = AddressTable::new();
        table.learn(Module::Bdp, addr(7)).unwrap();
        table.learn(Module::Bdp, addr(9)).unwrap();

        assert_eq!(table.physical_to_virtual(addr(9)).unwrap(), 1);
        assert_eq!(
            table.virtual_to_physical(DeviceTarget::One(0)).unwrap(),
            addr(7)
        );
        assert_eq!(
            table.virtual_to_physical(DeviceTarget::All).unwrap(),
            PhysAddr::BROADCAST
        );
        assert!(matches!(
            table.physical_to_virtual(addr(8)),
            Err(StationError::NotFound(_))
        ));
        assert!(matches!(
            table.virtual_to_physical(DeviceTarget::One(5)),
            Err(StationError::UnknownDevice(5))
        ));
    }

    #[test]
    fn table_full_stops_adding() {
        let mut table = AddressTable::new();
        for i in 0..MAX_DEVICES {
            let mut bytes = [0x01; 8];
            bytes[7] = i as u8;
            table.learn(Module::Bdp, PhysAddr(bytes)).unwrap();
        }
        let result = table.learn(Module::Bdp, PhysAddr([0x02; 8]));
        assert!(matches!(result, Err(StationError::TableFull { max: 64 })));
        assert_eq!(table.len(), MAX_DEVICES);
    }

    #[test]
    fn flush_clears_everything() {
        let mut table = AddressTable::new();
        table.learn(Module::Bdp, addr(1)).unwrap();
        table.learn(Module::Kr, addr(2)).unwrap();
        table.flush();
        assert!(table.is_empty());
        assert_eq!(table.count(Module::Bdp), 0);
        assert_eq!(table.count(Module::Kr), 0);
        assert_eq!(table.learn(Module::Kr, addr(2)).unwrap(), Learned::Added(0));
    }

    #[test]
    fn target_from_dev_num() {
        assert_eq!(DeviceTarget::from_dev_num(DEV_ALL), DeviceTarget::All);
        assert_eq!(DeviceTarget::from_dev_num(4), DeviceTarget::One(4));
        assert!(DeviceTarget::All.matches(9));
        assert!(!DeviceTarget::One(3).matches(9));
        assert_eq!(DeviceTarget::One(3).to_string(), "3");
    }
}
