//! Broadcast discovery until the population stops growing.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::address::DeviceTarget;
use crate::client::{BusClient, CallOptions};
use crate::config::ScanConfig;
use crate::error::Result;
use crate::message::Request;
use crate::module::Module;
use crate::station::Station;

/// What discovery needs from a bus.
pub trait DiscoveryProbe {
    fn bus(&self) -> Module;

    /// Send one broadcast address request.
    fn broadcast(&self) -> Result<()>;

    /// Devices learned on this bus so far.
    fn discovered(&self) -> usize;
}

/// Probe that goes through the daemon's own endpoint and reads the shared
/// address table.
pub struct BusProbe {
    client: BusClient,
    station: Arc<Station>,
}

impl BusProbe {
    pub fn new(client: BusClient, station: Arc<Station>) -> Self {
        Self { client, station }
    }
}

impl DiscoveryProbe for BusProbe {
    fn bus(&self) -> Module {
        self.client.module()
    }

    fn broadcast(&self) -> Result<()> {
        self.client
            .call(
                DeviceTarget::All,
                &Request::AddrGet,
                &CallOptions::fire_and_forget(),
            )
            .map(|_| ())
    }

    fn discovered(&self) -> usize {
        self.station.count(self.client.module())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub rounds: u32,
    pub discovered: usize,
    /// A round ended without finding anything new.
    pub converged: bool,
}

/// Broadcast discovery rounds until one adds no device.
///
/// An empty bus is not an error: every round runs and the outcome reports
/// zero devices.
pub fn scan(probe: &impl DiscoveryProbe, config: &ScanConfig) -> Result<ScanOutcome> {
    let bus = probe.bus();
    let mut outcome = ScanOutcome {
        rounds: 0,
        discovered: probe.discovered(),
        converged: false,
    };

    for round in 1..=config.max_rounds {
        outcome.rounds = round;
        let before = outcome.discovered;
        probe.broadcast()?;
        outcome.discovered = settle(probe, config);
        debug!(%bus, round, count = outcome.discovered, "scan round settled");

        if outcome.discovered > 0 && outcome.discovered == before {
            outcome.converged = true;
            break;
        }
    }

    if outcome.discovered == 0 {
        warn!(%bus, rounds = outcome.rounds, "no devices found");
    } else {
        info!(%bus, devices = outcome.discovered, rounds = outcome.rounds, "scan complete");
    }
    Ok(outcome)
}

/// Wait until the discovered count has held still for `config.settle`.
fn settle(probe: &impl DiscoveryProbe, config: &ScanConfig) -> usize {
    let start = Instant::now();
    let mut count = probe.discovered();
    let mut stable_since = start;
    loop {
        thread::sleep(config.poll_interval);
        let now = Instant::now();
        let current = probe.discovered();
        if current != count {
            count = current;
            stable_since = now;
        }
        if now.duration_since(stable_since) >= config.settle {
            return count;
        }
        if now.duration_since(start) >= config.round_limit {
            warn!(bus = %probe.bus(), count, "devices still appearing, ending round");
            return count;
        }
    }
}
