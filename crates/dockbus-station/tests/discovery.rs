#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use common::{addr, bus_config, wait_until, Daemon, SimBus, SimDevice};
use dockbus_frame::{encode_frame, FrameHeader, PhysAddr};
use dockbus_station::{
    loopback_device, scan, BusConfig, BusProbe, CallOptions, DeviceTarget, MessageId, Module,
    Request, Response, ScanConfig, Station,
};
use dockbus_transport::BusPort;

fn quick_scan() -> ScanConfig {
    ScanConfig {
        max_rounds: 10,
        poll_interval: Duration::from_millis(10),
        settle: Duration::from_millis(200),
        round_limit: Duration::from_secs(3),
    }
}

#[test]
fn broadcast_discovery_learns_each_device_once() {
    let devices = vec![SimDevice::new(1), SimDevice::new(2), SimDevice::new(3)];
    let (port, _sim) = SimBus::start(devices);
    let daemon = Daemon::start(bus_config(2), port);

    let probe = BusProbe::new(daemon.client(), Arc::clone(&daemon.station));
    let outcome = scan(&probe, &quick_scan()).expect("scan should run");

    assert_eq!(outcome.discovered, 3);
    assert!(outcome.converged);
    assert_eq!(outcome.rounds, 2);

    let table = daemon.station.table();
    assert_eq!(table.len(), 3);
    assert_eq!(table.count(Module::Bdp), 3);
    let mut learned: Vec<PhysAddr> = table.records().map(|r| r.addr()).collect();
    learned.sort();
    learned.dedup();
    assert_eq!(learned, vec![addr(1), addr(2), addr(3)]);
}

#[test]
fn discovery_replies_route_to_callbacks_not_the_scanner() {
    let (port, sim) = SimBus::start(vec![SimDevice::new(7)]);
    let daemon = Daemon::start(bus_config(0), port);

    let probe = BusProbe::new(daemon.client(), Arc::clone(&daemon.station));
    scan(&probe, &quick_scan()).expect("scan should run");

    let broadcasts = sim
        .seen()
        .into_iter()
        .filter(|h| h.msg_id == MessageId::AddrGet.as_u8())
        .collect::<Vec<_>>();
    assert!(!broadcasts.is_empty());
    assert!(broadcasts.iter().all(|h| h.addr.is_broadcast()));
    assert!(broadcasts.iter().all(|h| h.flags & dockbus_frame::flags::NO_ACK == 0));

    let event = daemon
        .events
        .recv_timeout(Duration::from_secs(1))
        .expect("discovery reply should reach callbacks");
    assert_eq!(event.msg_id, MessageId::AddrGet.as_u8());
    assert_eq!(event.dev_num, 0);
}

#[test]
fn empty_bus_scan_warns_and_returns() {
    let (port, _sim) = SimBus::start(Vec::new());
    let daemon = Daemon::start(bus_config(0), port);

    let probe = BusProbe::new(daemon.client(), Arc::clone(&daemon.station));
    let config = ScanConfig {
        max_rounds: 3,
        settle: Duration::from_millis(30),
        ..quick_scan()
    };
    let outcome = scan(&probe, &config).expect("empty scan is not an error");
    assert_eq!(outcome.discovered, 0);
    assert_eq!(outcome.rounds, 3);
    assert!(!outcome.converged);
}

#[test]
fn corrupted_reply_changes_nothing() {
    let (port, sim) = SimBus::start(Vec::new());
    let station = Arc::new(Station::new());
    let daemon = Daemon::start_with(bus_config(0), port, Arc::clone(&station));

    let stranger = addr(0x44);
    let header = FrameHeader::new(stranger, MessageId::AddrGet.as_u8());
    let mut wire = BytesMut::new();
    encode_frame(&header, stranger.as_bytes(), &mut wire).expect("frame should encode");
    let last = wire.len() - 1;
    wire[last] ^= 0xFF;
    sim.write_raw(&wire);

    assert!(wait_until(Duration::from_secs(1), || {
        station.link_stats(Module::Bdp).rx.crc_fail == 1
    }));
    assert!(station.table().is_empty());
    assert_eq!(station.link_stats(Module::Bdp).rx.frames, 0);

    // The line resynchronizes: an intact reply right after is accepted.
    sim.emit(stranger, MessageId::AddrGet, 0, stranger.as_bytes());
    assert!(wait_until(Duration::from_secs(1), || station.count(Module::Bdp) == 1));
    drop(daemon);
}

#[test]
fn loopback_line_discovers_its_stand_in_device() {
    let config = BusConfig {
        loopback: true,
        ..bus_config(0)
    };
    let port = BusPort::loopback().expect("loopback port");
    let daemon = Daemon::start(config, port);

    let discovery = BusProbe::new(daemon.client(), Arc::clone(&daemon.station));
    let outcome = scan(&discovery, &quick_scan()).expect("scan should run");
    assert_eq!(outcome.discovered, 1);
    {
        let table = daemon.station.table();
        let record = table.record(0).expect("device 0 should be learned");
        assert_eq!(record.addr(), loopback_device(Module::Bdp));
    }

    let response = daemon
        .client()
        .call(DeviceTarget::One(0), &Request::StatusGet, &CallOptions::blocking(200))
        .expect("device 0 should answer through the echo");
    assert!(matches!(response, Some(Response::Status { .. })));
}
