use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dockbus_frame::RxStats;

use crate::address::AddressTable;
use crate::module::Module;

/// Dispatcher counters for one bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub rx: RxStats,
    pub tx_frames: u64,
    pub retransmits: u64,
    /// Pending calls dropped after the last retry.
    pub timeouts: u64,
    /// Requests answered by the daemon with a negative status.
    pub rejected: u64,
    /// Frames sent to the callback channel.
    pub published: u64,
}

/// State shared by the bus servers, the scan threads and diagnostics.
///
/// A thread that panics while holding a lock leaves the data usable; the
/// next caller takes the guard from the poison error.
#[derive(Debug, Default)]
pub struct Station {
    table: Mutex<AddressTable>,
    links: Mutex<BTreeMap<Module, LinkStats>>,
}

impl Station {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> MutexGuard<'_, AddressTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Devices discovered on `bus`.
    pub fn count(&self, bus: Module) -> usize {
        self.table().count(bus)
    }

    pub fn flush(&self) {
        self.table().flush();
    }

    pub fn link_stats(&self, bus: Module) -> LinkStats {
        self.links()
            .get(&bus)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn update_link(&self, bus: Module, f: impl FnOnce(&mut LinkStats)) {
        f(self.links().entry(bus).or_default());
    }

    fn links(&self) -> MutexGuard<'_, BTreeMap<Module, LinkStats>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
