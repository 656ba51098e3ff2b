//! The per-bus dispatcher.
//!
//! One [`BusServer`] owns a bus line and the TCP endpoint applications use
//! to reach it. A single thread multiplexes the listener, the line and every
//! client socket with `poll(2)`:
//! - client requests are validated and queued; the line carries one
//!   synchronous request at a time, tagged with the client's socket
//!   descriptor, and the next one goes out once it is answered or expires
//! - frames from the line are checked, the sender resolved through the
//!   address table, and the payload routed back to the waiting client or
//!   published on the callback channel
//! - unanswered requests are retransmitted until the retry budget runs out

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dockbus_frame::{
    flags, BusHeader, ControlMessage, ControlReader, ControlWriter, DecoderConfig, Frame,
    FrameDecoder, FrameWriter, PhysAddr, MAX_PAYLOAD,
};
use dockbus_transport::{wait_readable, BusPort, ControlListener, ControlStream};
use tracing::{debug, error, info, warn};

use crate::address::{DeviceTarget, Learned};
use crate::callback::{now_ms, CallbackEvent, CallbackPublisher, DAEMON_APP_NAME};
use crate::config::BusConfig;
use crate::error::{Result, StationError};
use crate::message::{MessageId, Response};
use crate::module::Module;
use crate::station::Station;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const BUS_READ_CHUNK: usize = 256;
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// The request currently holding the line.
#[derive(Debug)]
struct PendingCall {
    /// Client to answer; cleared when it disconnects.
    client: Option<RawFd>,
    /// Socket tag carried in the frame and echoed by the device.
    sock_fd: RawFd,
    app_name: String,
    msg_id: MessageId,
    target: DeviceTarget,
    /// Control-plane sequence number echoed in the reply.
    seq: u32,
    addr: PhysAddr,
    flags: u8,
    payload: Bytes,
    timeout: Duration,
    deadline: Instant,
    retransmits: u32,
}

impl PendingCall {
    fn answered_by(&self, sock_fd: RawFd, msg_id: MessageId, dev: u16) -> bool {
        sock_fd == self.sock_fd
            && (msg_id == self.msg_id || msg_id == MessageId::Ack)
            && self.target.matches(dev)
    }
}

/// An admitted request waiting for the line.
struct Queued {
    fd: RawFd,
    msg: ControlMessage,
    msg_id: MessageId,
    target: DeviceTarget,
    addr: PhysAddr,
    flags: u8,
}

impl Queued {
    fn wants_reply(&self) -> bool {
        self.msg.bus.blocking && self.msg.timeout_ms > 0 && self.flags & flags::NO_ACK == 0
    }
}

/// The device a loopback line pretends to have on `bus`.
///
/// A loopback echoes requests back unchanged, so a broadcast address request
/// would come back from the broadcast address. The echo is answered in this
/// device's name instead, which gives discovery something to learn.
pub fn loopback_device(bus: Module) -> PhysAddr {
    PhysAddr([0x4C, 0x4F, 0x4F, 0x50, 0x00, 0x00, 0x00, bus.id()])
}

struct ClientConn {
    stream: ControlStream,
    reader: ControlReader<ControlStream>,
    writer: ControlWriter<ControlStream>,
    app_name: String,
}

impl ClientConn {
    fn new(stream: ControlStream) -> Result<Self> {
        stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
        Ok(Self {
            reader: ControlReader::new(stream.try_clone()?),
            writer: ControlWriter::new(stream.try_clone()?),
            stream,
            app_name: String::new(),
        })
    }
}

/// Dispatcher for one device bus.
pub struct BusServer {
    config: BusConfig,
    station: Arc<Station>,
    listener: ControlListener,
    port: BusPort,
    tx: FrameWriter<BusPort>,
    decoder: FrameDecoder,
    clients: HashMap<RawFd, ClientConn>,
    queue: VecDeque<Queued>,
    in_flight: Option<PendingCall>,
    callbacks: CallbackPublisher,
    shutdown: Arc<AtomicBool>,
}

impl BusServer {
    /// Open the configured line (or a loopback) and bind the endpoint.
    pub fn open(
        config: BusConfig,
        station: Arc<Station>,
        callbacks: CallbackPublisher,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let port = if config.loopback {
            BusPort::loopback()?
        } else {
            BusPort::open(&config.device, config.baud)?
        };
        Self::with_port(config, port, station, callbacks, shutdown)
    }

    /// Serve an already opened line.
    pub fn with_port(
        config: BusConfig,
        port: BusPort,
        station: Arc<Station>,
        callbacks: CallbackPublisher,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = ControlListener::bind(&config.listen)?;
        let tx = FrameWriter::new(port.try_clone()?);
        let decoder = FrameDecoder::with_config(DecoderConfig {
            max_payload: MAX_PAYLOAD,
            inter_byte_timeout: config.inter_byte_timeout,
        });

        info!(
            bus = %config.module,
            line = port.name(),
            loopback = port.is_loopback(),
            listen = %listener.local_addr(),
            "bus server ready"
        );

        Ok(Self {
            config,
            station,
            listener,
            port,
            tx,
            decoder,
            clients: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: None,
            callbacks,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn module(&self) -> Module {
        self.config.module
    }

    /// Serve until the shutdown flag is raised or the line fails.
    pub fn run(mut self) -> Result<()> {
        let bus = self.config.module;
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.poll_once() {
                error!(%bus, error = %err, "bus server stopped");
                return Err(err);
            }
        }
        let stats = self.station.link_stats(bus);
        info!(
            %bus,
            frames = stats.rx.frames,
            crc_fail = stats.rx.crc_fail,
            tx = stats.tx_frames,
            timeouts = stats.timeouts,
            "bus server stopped"
        );
        Ok(())
    }

    /// Run on a named thread.
    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name(format!("dockbus-{}", self.config.module))
            .spawn(move || self.run())
            .map_err(StationError::Io)
    }

    fn poll_once(&mut self) -> Result<()> {
        let client_fds: Vec<RawFd> = self.clients.keys().copied().collect();
        let mut fds = Vec::with_capacity(client_fds.len() + 2);
        fds.push(self.listener.as_raw_fd());
        fds.push(self.port.as_raw_fd());
        fds.extend_from_slice(&client_fds);

        let ready = wait_readable(&fds, self.poll_timeout(Instant::now()))?;

        if ready.is_ready(0) {
            self.accept_client();
        }
        if ready.is_ready(1) {
            self.read_bus()?;
        }
        for (i, fd) in client_fds.iter().enumerate() {
            if ready.is_ready(i + 2) {
                self.read_client(*fd);
            }
        }

        let now = Instant::now();
        self.expire_pending(now);
        self.pump_queue(now);
        let rx = self.decoder.stats();
        self.station.update_link(self.config.module, |s| s.rx = rx);
        Ok(())
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        self.in_flight
            .as_ref()
            .map(|p| p.deadline.saturating_duration_since(now))
            .map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL))
    }

    fn accept_client(&mut self) {
        let stream = match self.listener.accept() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(bus = %self.config.module, error = %err, "accept failed");
                return;
            }
        };
        let peer = stream.peer_addr();
        match ClientConn::new(stream) {
            Ok(conn) => {
                let fd = conn.stream.as_raw_fd();
                debug!(bus = %self.config.module, ?peer, fd, "client connected");
                self.clients.insert(fd, conn);
            }
            Err(err) => warn!(bus = %self.config.module, error = %err, "client setup failed"),
        }
    }

    fn drop_client(&mut self, fd: RawFd, reason: &str) {
        let Some(conn) = self.clients.remove(&fd) else {
            return;
        };
        debug!(bus = %self.config.module, fd, app = %conn.app_name, reason, "client removed");
        self.queue.retain(|q| q.fd != fd);
        if let Some(pending) = self.in_flight.as_mut() {
            if pending.client == Some(fd) {
                pending.client = None;
            }
        }
    }

    fn read_bus(&mut self) -> Result<()> {
        let mut chunk = [0u8; BUS_READ_CHUNK];
        let n = match self.port.read(&mut chunk) {
            Ok(0) => return Err(StationError::BusClosed(self.port.name().to_string())),
            Ok(n) => n,
            Err(err) if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                return Ok(())
            }
            Err(err) => return Err(StationError::Io(err)),
        };

        let now = Instant::now();
        for &byte in &chunk[..n] {
            match self.decoder.push(byte, now) {
                Ok(Some(frame)) => self.handle_frame(frame, now),
                Ok(None) => {}
                Err(err) if err.is_recoverable() => {
                    warn!(bus = %self.config.module, error = %err, "malformed frame dropped");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        let bus = self.config.module;
        let header = frame.header;
        let msg_id = match MessageId::try_from(header.msg_id) {
            Ok(id) => id,
            Err(err) => {
                warn!(%bus, addr = %header.addr, error = %err, "frame dropped");
                return;
            }
        };

        let loopback = self.port.is_loopback();
        let (sender, payload) =
            if loopback && msg_id == MessageId::AddrGet && header.addr.is_broadcast() {
                let addr = loopback_device(bus);
                (addr, Response::Address(addr).encode())
            } else {
                (header.addr, frame.payload)
            };

        let (dev, payload) = {
            let mut table = self.station.table();
            if msg_id == MessageId::AddrGet {
                match table.learn(bus, sender) {
                    Ok(Learned::Added(index)) => {
                        info!(%bus, addr = %sender, index, "device discovered");
                    }
                    Ok(Learned::AlreadyPresent(_)) => {}
                    Err(err) => {
                        warn!(%bus, addr = %sender, error = %err, "discovery reply ignored");
                    }
                }
            }

            let dev = match table.physical_to_virtual(sender) {
                Ok(dev) => dev,
                Err(err) => {
                    warn!(
                        %bus,
                        msg_id = header.msg_id,
                        error = %err,
                        "frame from unknown sender dropped"
                    );
                    return;
                }
            };
            let Some(record) = table.record_mut(dev) else {
                return;
            };
            match record.store_response(msg_id, &payload, now, loopback) {
                Ok(payload) => (dev, payload),
                Err(err) => {
                    warn!(%bus, dev, error = %err, "response dropped");
                    return;
                }
            }
        };

        let status = if msg_id == MessageId::Ack {
            ack_status(&payload)
        } else {
            0
        };

        match header.sock_fd {
            fd if fd > 0 => match self.take_in_flight(fd, msg_id, dev) {
                Some(PendingCall {
                    client: Some(client),
                    seq,
                    ..
                }) => {
                    let reply = ControlMessage {
                        app_name: DAEMON_APP_NAME.to_string(),
                        module_id: bus.id(),
                        dev_num: dev,
                        seq,
                        sent_ms: now_ms(),
                        timeout_ms: 0,
                        bus: BusHeader {
                            msg_id: msg_id.as_u8(),
                            flags: header.flags,
                            blocking: false,
                            status,
                        },
                        payload,
                    };
                    self.reply(client, &reply);
                }
                _ => self.publish(dev, msg_id, status, payload),
            },
            0 => self.publish(dev, msg_id, status, payload),
            fd => warn!(%bus, sock_fd = fd, "frame with invalid socket dropped"),
        }
    }

    fn take_in_flight(
        &mut self,
        sock_fd: RawFd,
        msg_id: MessageId,
        dev: u16,
    ) -> Option<PendingCall> {
        if !self.in_flight.as_ref()?.answered_by(sock_fd, msg_id, dev) {
            return None;
        }
        self.in_flight.take()
    }

    fn publish(&self, dev: u16, msg_id: MessageId, status: i32, payload: Bytes) {
        debug!(bus = %self.config.module, dev, %msg_id, "publishing to callbacks");
        self.callbacks.publish(CallbackEvent {
            module: self.config.module,
            dev_num: dev,
            msg_id: msg_id.as_u8(),
            status,
            payload,
        });
        self.station
            .update_link(self.config.module, |s| s.published += 1);
    }

    fn reply(&mut self, fd: RawFd, msg: &ControlMessage) {
        let Some(conn) = self.clients.get_mut(&fd) else {
            return;
        };
        if let Err(err) = conn.writer.send(msg) {
            warn!(bus = %self.config.module, fd, error = %err, "reply failed");
            self.drop_client(fd, "write failed");
        }
    }

    fn read_client(&mut self, fd: RawFd) {
        let Some(conn) = self.clients.get_mut(&fd) else {
            return;
        };
        match conn.reader.fill() {
            Ok(0) => {
                self.drop_client(fd, "disconnected");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(bus = %self.config.module, fd, error = %err, "client read failed");
                self.drop_client(fd, "read failed");
                return;
            }
        }

        loop {
            let next = match self.clients.get_mut(&fd) {
                Some(conn) => conn.reader.next_buffered(),
                None => return,
            };
            match next {
                Ok(Some(msg)) => self.handle_request(fd, msg),
                Ok(None) => return,
                Err(err) => {
                    warn!(bus = %self.config.module, fd, error = %err, "undecodable request");
                    self.drop_client(fd, "protocol error");
                    return;
                }
            }
        }
    }

    fn handle_request(&mut self, fd: RawFd, msg: ControlMessage) {
        if let Some(conn) = self.clients.get_mut(&fd) {
            if conn.app_name != msg.app_name {
                conn.app_name.clone_from(&msg.app_name);
            }
        }

        let target = DeviceTarget::from_dev_num(msg.dev_num);
        let (msg_id, addr) = match self.admit(&msg, target) {
            Ok(admitted) => admitted,
            Err(err) => {
                self.reject(fd, &msg, &err);
                return;
            }
        };

        let mut frame_flags = msg.bus.flags;
        if target.is_all() {
            frame_flags |= flags::BROADCAST;
        }
        if self.in_flight.is_some() {
            debug!(
                bus = %self.config.module,
                fd,
                queued = self.queue.len() + 1,
                "line busy, request queued"
            );
        }
        self.queue.push_back(Queued {
            fd,
            msg,
            msg_id,
            target,
            addr,
            flags: frame_flags,
        });
    }

    /// Put queued requests on the line until one of them waits for an answer.
    fn pump_queue(&mut self, now: Instant) {
        while self.in_flight.is_none() {
            let Some(next) = self.queue.pop_front() else {
                return;
            };
            if let Err(err) = self.record_request(&next, now) {
                self.reject(next.fd, &next.msg, &err);
                continue;
            }
            let sent = self.transmit(
                next.addr,
                next.msg_id,
                next.fd,
                next.flags,
                &next.msg.payload,
            );
            if let Err(err) = sent {
                self.reject(next.fd, &next.msg, &err);
                continue;
            }
            if !next.wants_reply() {
                continue;
            }
            let timeout = Duration::from_millis(next.msg.timeout_ms.unsigned_abs());
            self.in_flight = Some(PendingCall {
                client: Some(next.fd),
                sock_fd: next.fd,
                app_name: next.msg.app_name,
                msg_id: next.msg_id,
                target: next.target,
                seq: next.msg.seq,
                addr: next.addr,
                flags: next.flags,
                payload: next.msg.payload,
                timeout,
                deadline: now + timeout,
                retransmits: 0,
            });
        }
    }

    fn record_request(&self, queued: &Queued, now: Instant) -> Result<()> {
        let DeviceTarget::One(dev) = queued.target else {
            return Ok(());
        };
        let mut table = self.station.table();
        let record = table
            .record_mut(dev)
            .ok_or(StationError::UnknownDevice(dev))?;
        record.store_request(queued.msg_id, &queued.msg.payload, now)
    }

    /// Validate a request and resolve its destination.
    fn admit(&self, msg: &ControlMessage, target: DeviceTarget) -> Result<(MessageId, PhysAddr)> {
        let bus = self.config.module;
        if msg.module_id != bus.id() {
            return Err(StationError::UnknownModule(msg.module_id));
        }
        let msg_id = MessageId::try_from(msg.bus.msg_id)?;
        if !msg_id.supported_by(bus) {
            return Err(StationError::UnknownMessage(msg_id.as_u8()));
        }
        let expected = msg_id
            .request_len()
            .ok_or(StationError::UnknownMessage(msg_id.as_u8()))?;
        if msg.payload.len() != expected {
            return Err(StationError::MessageLength {
                msg_id: msg_id.as_u8(),
                expected,
                actual: msg.payload.len(),
            });
        }

        let table = self.station.table();
        let addr = table.virtual_to_physical(target)?;
        if let DeviceTarget::One(dev) = target {
            table
                .record(dev)
                .filter(|rec| rec.bus() == bus)
                .ok_or(StationError::UnknownDevice(dev))?;
        }
        Ok((msg_id, addr))
    }

    fn transmit(
        &mut self,
        addr: PhysAddr,
        msg_id: MessageId,
        fd: RawFd,
        frame_flags: u8,
        payload: &[u8],
    ) -> Result<()> {
        let header = self
            .tx
            .send(addr, msg_id.as_u8(), fd, frame_flags, payload)
            .inspect_err(|err| {
                warn!(bus = %self.config.module, %addr, error = %err, "transmit failed");
            })?;
        debug!(
            bus = %self.config.module,
            %addr,
            %msg_id,
            sock_fd = fd,
            seq = header.seq,
            "request framed"
        );
        self.station
            .update_link(self.config.module, |s| s.tx_frames += 1);
        Ok(())
    }

    /// Answer a request the daemon cannot forward.
    fn reject(&mut self, fd: RawFd, msg: &ControlMessage, err: &StationError) {
        let status = err.status();
        warn!(
            bus = %self.config.module,
            app = %msg.app_name,
            dev = msg.dev_num,
            msg_id = msg.bus.msg_id,
            status,
            error = %err,
            "request rejected"
        );
        self.station
            .update_link(self.config.module, |s| s.rejected += 1);
        let reply = ControlMessage {
            app_name: DAEMON_APP_NAME.to_string(),
            module_id: msg.module_id,
            dev_num: msg.dev_num,
            seq: msg.seq,
            sent_ms: now_ms(),
            timeout_ms: 0,
            bus: BusHeader {
                msg_id: MessageId::Ack.as_u8(),
                flags: 0,
                blocking: false,
                status,
            },
            payload: Response::Ack { status }.encode(),
        };
        self.reply(fd, &reply);
    }

    fn expire_pending(&mut self, now: Instant) {
        let bus = self.config.module;
        let Some(pending) = self.in_flight.as_mut() else {
            return;
        };
        if now < pending.deadline {
            return;
        }

        if pending.retransmits < self.config.retries {
            pending.retransmits += 1;
            pending.deadline = now + pending.timeout;
            let (fd, addr, msg_id, frame_flags) =
                (pending.sock_fd, pending.addr, pending.msg_id, pending.flags);
            let payload = pending.payload.clone();
            debug!(%bus, fd, %addr, %msg_id, "retransmitting");
            self.station.update_link(bus, |s| s.retransmits += 1);
            if self.transmit(addr, msg_id, fd, frame_flags, &payload).is_err() {
                self.in_flight = None;
            }
            return;
        }

        warn!(
            %bus,
            app = %pending.app_name,
            target = %pending.target,
            msg_id = %pending.msg_id,
            attempts = pending.retransmits + 1,
            "device did not answer"
        );
        self.in_flight = None;
        self.station.update_link(bus, |s| s.timeouts += 1);
    }
}

fn ack_status(payload: &[u8]) -> i32 {
    match Response::decode(MessageId::Ack, payload) {
        Ok(Response::Ack { status }) => status,
        _ => 0,
    }
}
