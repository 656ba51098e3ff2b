#![cfg(unix)]

mod common;

use std::io::Read;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use common::{addr, bus_config, wait_until, Daemon, SimBus, SimDevice};
use dockbus_frame::{flags, BusHeader, ControlMessage, ControlReader, ControlWriter};
use dockbus_station::{
    status, BusConfig, CallOptions, DeviceTarget, MessageId, Module, Request, Response,
    StationError,
};
use dockbus_transport::{BusPort, ControlStream};

fn learn(daemon: &Daemon, devices: &[u8]) {
    let mut table = daemon.station.table();
    for last in devices {
        table.learn(Module::Bdp, addr(*last)).expect("address should be learnable");
    }
}

#[test]
fn blocking_call_round_trips_through_the_bus() {
    let (port, sim) = SimBus::start(vec![SimDevice::new(1), SimDevice::new(2)]);
    let daemon = Daemon::start(bus_config(2), port);
    learn(&daemon, &[1, 2]);
    let client = daemon.client();

    let response = client
        .call(DeviceTarget::One(1), &Request::StatusGet, &CallOptions::blocking(200))
        .expect("call should succeed");
    assert_eq!(
        response,
        Some(Response::Status {
            flags: 0,
            temperature_c: 21,
            supply_mv: 12_000,
        })
    );

    let seen = sim.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].addr, addr(2));
    assert!(seen[0].sock_fd > 0);

    let table = daemon.station.table();
    let record = table.record(1).expect("device 1 should exist");
    let slot = record.slot(MessageId::StatusGet).expect("slot should be filled");
    assert!(slot.time_response().is_some());
    assert_eq!(record.stats().tx_frames, 1);
    assert_eq!(record.stats().rx_frames, 1);
}

#[test]
fn zero_timeout_blocking_call_sets_no_ack_and_returns() {
    let (port, sim) = SimBus::start(vec![SimDevice::new(1)]);
    let daemon = Daemon::start(bus_config(2), port);
    learn(&daemon, &[1]);
    let client = daemon.client();

    let result = client
        .call(
            DeviceTarget::One(0),
            &Request::LockSet {
                locked: true,
                hold_s: 5,
            },
            &CallOptions::blocking(0),
        )
        .expect("call should succeed");
    assert!(result.is_none());

    assert!(wait_until(Duration::from_secs(1), || !sim.seen().is_empty()));
    assert_ne!(sim.seen()[0].flags & flags::NO_ACK, 0);
}

#[test]
fn unanswered_request_is_retransmitted() {
    let mut shy = SimDevice::new(1);
    shy.ignore_first = 2;
    let (port, sim) = SimBus::start(vec![shy]);
    let daemon = Daemon::start(bus_config(2), port);
    learn(&daemon, &[1]);
    let client = daemon.client();

    let response = client
        .call(
            DeviceTarget::One(0),
            &Request::VersionGet,
            &CallOptions::blocking(80),
        )
        .expect("third attempt should be answered");
    assert!(matches!(response, Some(Response::Version { major: 1, .. })));
    assert_eq!(sim.seen().len(), 3);
    assert_eq!(daemon.station.link_stats(Module::Bdp).retransmits, 2);
}

#[test]
fn silent_device_times_out() {
    let mut mute = SimDevice::new(1);
    mute.mute = true;
    let (port, sim) = SimBus::start(vec![mute]);
    let daemon = Daemon::start(bus_config(1), port);
    learn(&daemon, &[1]);
    let client = daemon.client();

    let err = client
        .call(DeviceTarget::One(0), &Request::StatusGet, &CallOptions::blocking(40))
        .expect_err("mute device cannot answer");
    assert!(matches!(err, StationError::CommsTimeout(_)));
    assert!(wait_until(Duration::from_secs(1), || {
        daemon.station.link_stats(Module::Bdp).timeouts == 1
    }));
    assert_eq!(sim.seen().len(), 2);
}

#[test]
fn second_client_waits_for_the_line() {
    let mut mute = SimDevice::new(1);
    mute.mute = true;
    let (port, sim) = SimBus::start(vec![mute]);
    let daemon = Daemon::start(bus_config(0), port);
    learn(&daemon, &[1]);
    let first = daemon.client();
    let second = daemon.client();

    let a = thread::spawn(move || {
        first.call(DeviceTarget::One(0), &Request::StatusGet, &CallOptions::blocking(300))
    });
    thread::sleep(Duration::from_millis(30));
    let b = thread::spawn(move || {
        second.call(DeviceTarget::One(0), &Request::VersionGet, &CallOptions::blocking(300))
    });

    thread::sleep(Duration::from_millis(100));
    let seen = sim.seen();
    assert_eq!(seen.len(), 1, "second request must wait for the first to expire");
    assert_eq!(seen[0].msg_id, MessageId::StatusGet.as_u8());

    let a = a.join().expect("first caller");
    let b = b.join().expect("second caller");
    assert!(matches!(a, Err(StationError::CommsTimeout(_))));
    assert!(matches!(b, Err(StationError::CommsTimeout(_))));

    assert!(wait_until(Duration::from_secs(1), || sim.seen().len() == 2));
    assert_eq!(sim.seen()[1].msg_id, MessageId::VersionGet.as_u8());
}

#[test]
fn queued_calls_each_get_their_own_answer() {
    let mut slow = SimDevice::new(1);
    slow.reply_delay = Duration::from_millis(80);
    let (port, sim) = SimBus::start(vec![slow]);
    let daemon = Daemon::start(bus_config(0), port);
    learn(&daemon, &[1]);
    let first = daemon.client();
    let second = daemon.client();

    let a = thread::spawn(move || {
        first.call(DeviceTarget::One(0), &Request::StatusGet, &CallOptions::blocking(400))
    });
    thread::sleep(Duration::from_millis(20));
    let b = thread::spawn(move || {
        second.call(DeviceTarget::One(0), &Request::VersionGet, &CallOptions::blocking(400))
    });

    thread::sleep(Duration::from_millis(30));
    assert_eq!(sim.seen().len(), 1);

    let a = a.join().expect("first caller").expect("first call answered");
    let b = b.join().expect("second caller").expect("second call answered");
    assert!(matches!(a, Some(Response::Status { .. })));
    assert!(matches!(b, Some(Response::Version { major: 1, .. })));

    let seen = sim.seen();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0].sock_fd, seen[1].sock_fd);
}

#[test]
fn late_answer_goes_to_callbacks() {
    let mut slow = SimDevice::new(3);
    slow.reply_delay = Duration::from_millis(250);
    let (port, _sim) = SimBus::start(vec![slow]);
    let daemon = Daemon::start(bus_config(0), port);
    learn(&daemon, &[3]);
    let client = daemon.client();

    let err = client
        .call(DeviceTarget::One(0), &Request::StatusGet, &CallOptions::blocking(50))
        .expect_err("client gives up first");
    assert!(matches!(err, StationError::CommsTimeout(_)));

    let event = daemon
        .events
        .recv_timeout(Duration::from_secs(2))
        .expect("late answer should be published");
    assert_eq!(event.module, Module::Bdp);
    assert_eq!(event.dev_num, 0);
    assert_eq!(event.msg_id, MessageId::StatusGet.as_u8());

    // The next call is not confused by the stale answer.
    let response = client
        .call(DeviceTarget::One(0), &Request::Reset, &CallOptions::blocking(400))
        .expect("follow-up call should succeed");
    assert_eq!(response, Some(Response::Done(MessageId::Reset)));
}

#[test]
fn unsolicited_event_reaches_callbacks() {
    let (port, sim) = SimBus::start(vec![SimDevice::new(4)]);
    let daemon = Daemon::start(bus_config(0), port);
    learn(&daemon, &[9, 4]);

    let payload = Response::Event { kind: 2, value: 7 }.encode();
    sim.emit(addr(4), MessageId::Event, 0, &payload);

    let event = daemon
        .events
        .recv_timeout(Duration::from_secs(1))
        .expect("event should be published");
    assert_eq!(event.dev_num, 1);
    assert_eq!(event.msg_id, MessageId::Event.as_u8());
    assert_eq!(event.payload, payload);
}

#[test]
fn frames_with_negative_socket_are_dropped() {
    let (port, sim) = SimBus::start(Vec::new());
    let daemon = Daemon::start(bus_config(0), port);
    learn(&daemon, &[4]);

    let payload = Response::Event { kind: 1, value: 1 }.encode();
    sim.emit(addr(4), MessageId::Event, -3, &payload);
    sim.emit(addr(4), MessageId::Event, 0, &payload);

    let event = daemon
        .events
        .recv_timeout(Duration::from_secs(1))
        .expect("second event should be published");
    assert_eq!(event.msg_id, MessageId::Event.as_u8());
    assert!(daemon.events.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(daemon.station.link_stats(Module::Bdp).published, 1);
}

#[test]
fn unknown_device_is_rejected_by_the_daemon() {
    let (port, sim) = SimBus::start(Vec::new());
    let daemon = Daemon::start(bus_config(0), port);
    let client = daemon.client();

    let err = client
        .call(DeviceTarget::One(12), &Request::StatusGet, &CallOptions::blocking(500))
        .expect_err("no such device");
    assert!(matches!(
        err,
        StationError::Rejected {
            status: status::UNKNOWN_DEVICE
        }
    ));
    assert!(sim.seen().is_empty());

    let err = client
        .call(DeviceTarget::One(0), &Request::KeyRead, &CallOptions::blocking(500))
        .expect_err("key readers live on the other bus");
    assert!(matches!(
        err,
        StationError::Rejected {
            status: status::UNSUPPORTED
        }
    ));
}

#[test]
fn wrong_payload_length_is_rejected_by_the_daemon() {
    let (port, sim) = SimBus::start(vec![SimDevice::new(1)]);
    let daemon = Daemon::start(bus_config(0), port);
    learn(&daemon, &[1]);

    let stream = ControlStream::connect(&daemon.addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(1)))
        .expect("timeout");
    let mut writer = ControlWriter::new(stream.try_clone().expect("clone"));
    let mut reader = ControlReader::new(stream);

    let request = ControlMessage::new(
        "raw",
        Module::Bdp.id(),
        0,
        BusHeader {
            msg_id: MessageId::LockSet.as_u8(),
            flags: 0,
            blocking: true,
            status: 0,
        },
        Bytes::from_static(&[1]),
    );
    writer.send(&request).expect("send");

    let reply = reader.read_message().expect("daemon should answer");
    assert_eq!(reply.bus.msg_id, MessageId::Ack.as_u8());
    assert_eq!(reply.bus.status, status::BAD_LENGTH);
    assert_eq!(
        Response::decode(MessageId::Ack, &reply.payload).expect("ack payload"),
        Response::Ack {
            status: status::BAD_LENGTH
        }
    );
    assert!(sim.seen().is_empty());
    assert_eq!(daemon.station.link_stats(Module::Bdp).rejected, 1);
}

#[test]
fn loopback_echo_answers_with_tolerated_length() {
    let config = BusConfig {
        loopback: true,
        ..bus_config(0)
    };
    let port = BusPort::loopback().expect("loopback port");
    let daemon = Daemon::start(config, port);
    learn(&daemon, &[8]);
    let client = daemon.client();

    let response = client
        .call(
            DeviceTarget::One(0),
            &Request::LockSet {
                locked: true,
                hold_s: 10,
            },
            &CallOptions::blocking(200),
        )
        .expect("echo should come back");
    assert_eq!(response, Some(Response::Done(MessageId::LockSet)));

    let table = daemon.station.table();
    let record = table.record(0).expect("device 0");
    assert_eq!(record.stats().length_mismatches, 1);
}

#[test]
fn disconnecting_client_is_forgotten() {
    let (port, _sim) = SimBus::start(vec![SimDevice::new(1)]);
    let daemon = Daemon::start(bus_config(0), port);
    learn(&daemon, &[1]);

    {
        let mut stream = ControlStream::connect(&daemon.addr).expect("connect");
        stream.shutdown().expect("shutdown");
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf);
    }

    let client = daemon.client();
    let response = client
        .call(DeviceTarget::One(0), &Request::Reset, &CallOptions::blocking(200))
        .expect("server keeps serving");
    assert_eq!(response, Some(Response::Done(MessageId::Reset)));
}
