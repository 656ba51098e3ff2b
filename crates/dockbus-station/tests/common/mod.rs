#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dockbus_frame::{flags, FrameHeader, FrameReader, FrameWriter, PhysAddr};
use dockbus_station::{
    BusClient, BusConfig, BusServer, CallbackEvent, CallbackPublisher, ClientConfig, MessageId,
    Module, Response, Station,
};
use dockbus_transport::BusPort;

pub const DEVICE_TIMEOUT: Duration = Duration::from_millis(60);

pub fn addr(last: u8) -> PhysAddr {
    PhysAddr([0x5A, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, last])
}

pub fn bus_config(retries: u32) -> BusConfig {
    BusConfig {
        listen: "127.0.0.1:0".to_string(),
        device_timeout: DEVICE_TIMEOUT,
        retries,
        ..BusConfig::defaults(Module::Bdp)
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// One simulated device on the bus.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub addr: PhysAddr,
    pub reply_delay: Duration,
    /// Requests swallowed before the device starts answering.
    pub ignore_first: u32,
    pub mute: bool,
}

impl SimDevice {
    pub fn new(last: u8) -> Self {
        Self {
            addr: addr(last),
            reply_delay: Duration::ZERO,
            ignore_first: 0,
            mute: false,
        }
    }

    fn answer(&self, msg_id: u8) -> Option<Bytes> {
        let rsp = match MessageId::try_from(msg_id).ok()? {
            MessageId::AddrGet => Response::Address(self.addr),
            MessageId::StatusGet => Response::Status {
                flags: 0,
                temperature_c: 21,
                supply_mv: 12_000,
            },
            MessageId::VersionGet => Response::Version {
                major: 1,
                minor: 2,
                patch: 3,
                build: 40,
            },
            MessageId::KeyRead => Response::Key {
                present: false,
                uid: [0; 8],
            },
            MessageId::Ack | MessageId::Event => return None,
            other => Response::Done(other),
        };
        Some(rsp.encode())
    }
}

/// The far end of a bus line, answering like a population of devices.
pub struct SimBus {
    writer: Arc<Mutex<FrameWriter<UnixStream>>>,
    seen: Arc<Mutex<Vec<FrameHeader>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimBus {
    pub fn start(devices: Vec<SimDevice>) -> (BusPort, SimBus) {
        let (daemon_end, sim_end) = UnixStream::pair().expect("socket pair should open");
        sim_end
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("read timeout should apply");
        let read_end = sim_end.try_clone().expect("sim end should clone");

        let writer = Arc::new(Mutex::new(FrameWriter::new(sim_end)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let writer = Arc::clone(&writer);
            let seen = Arc::clone(&seen);
            let stop = Arc::clone(&stop);
            thread::spawn(move || simulate(read_end, devices, writer, seen, stop))
        };

        let port = BusPort::from_unix_stream(daemon_end, "sim");
        (
            port,
            SimBus {
                writer,
                seen,
                stop,
                handle: Some(handle),
            },
        )
    }

    /// Frames the devices have heard so far.
    pub fn seen(&self) -> Vec<FrameHeader> {
        self.seen.lock().expect("seen lock").clone()
    }

    /// Send a frame as if `from` had transmitted it.
    pub fn emit(&self, from: PhysAddr, msg_id: MessageId, sock_fd: i32, payload: &[u8]) {
        self.writer
            .lock()
            .expect("writer lock")
            .send(from, msg_id.as_u8(), sock_fd, 0, payload)
            .expect("sim frame should send");
    }

    pub fn write_raw(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().expect("writer lock");
        writer.get_mut().write_all(bytes).expect("raw bytes should send");
    }
}

impl Drop for SimBus {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn simulate(
    read_end: UnixStream,
    devices: Vec<SimDevice>,
    writer: Arc<Mutex<FrameWriter<UnixStream>>>,
    seen: Arc<Mutex<Vec<FrameHeader>>>,
    stop: Arc<AtomicBool>,
) {
    let mut reader = FrameReader::new(read_end);
    let mut ignored: HashMap<PhysAddr, u32> = HashMap::new();

    while !stop.load(Ordering::Relaxed) {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) if err.is_timeout() => continue,
            Err(_) => return,
        };
        seen.lock().expect("seen lock").push(frame.header);
        if frame.header.has_flag(flags::NO_ACK) {
            continue;
        }

        let dest = frame.header.addr;
        for dev in devices.iter().filter(|d| dest.is_broadcast() || d.addr == dest) {
            if dev.mute {
                continue;
            }
            let swallowed = ignored.entry(dev.addr).or_insert(0);
            if *swallowed < dev.ignore_first {
                *swallowed += 1;
                continue;
            }
            let Some(payload) = dev.answer(frame.header.msg_id) else {
                continue;
            };
            thread::sleep(dev.reply_delay);
            let sent = writer.lock().expect("writer lock").send(
                dev.addr,
                frame.header.msg_id,
                frame.header.sock_fd,
                0,
                &payload,
            );
            if sent.is_err() {
                return;
            }
        }
    }
}

/// A bus server on its own thread, with the callback channel exposed.
pub struct Daemon {
    pub station: Arc<Station>,
    pub addr: String,
    pub events: Receiver<CallbackEvent>,
    config: BusConfig,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<dockbus_station::Result<()>>>,
}

impl Daemon {
    pub fn start(config: BusConfig, port: BusPort) -> Self {
        Self::start_with(config, port, Arc::new(Station::new()))
    }

    pub fn start_with(config: BusConfig, port: BusPort, station: Arc<Station>) -> Self {
        let (publisher, events) = CallbackPublisher::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let server = BusServer::with_port(
            config.clone(),
            port,
            Arc::clone(&station),
            publisher,
            Arc::clone(&shutdown),
        )
        .expect("bus server should start");
        let addr = server.local_addr().to_string();
        let handle = server.spawn().expect("bus server thread should spawn");
        Self {
            station,
            addr,
            events,
            config,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn client(&self) -> BusClient {
        let mut config = ClientConfig::for_bus(&self.config, "integration");
        config.addr = self.addr.clone();
        BusClient::connect(config).expect("client should connect")
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
