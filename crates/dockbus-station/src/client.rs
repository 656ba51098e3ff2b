use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dockbus_frame::{flags, BusHeader, ControlMessage, ControlReader, ControlWriter, FrameError};
use dockbus_transport::ControlStream;
use tracing::debug;

use crate::address::DeviceTarget;
use crate::callback::now_ms;
use crate::config::ClientConfig;
use crate::error::{Result, StationError};
use crate::message::{MessageId, Request, Response};
use crate::module::Module;

/// How a call waits for its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallOptions {
    /// Wait on the socket for the device's answer.
    pub blocking: bool,
    /// Per-attempt device timeout; zero means do not wait at all.
    pub timeout_ms: i64,
    /// Extra frame flags.
    pub flags: u8,
    /// The application consumes callbacks, so a fire-and-forget request
    /// still wants its answer delivered there.
    pub has_callback: bool,
}

impl CallOptions {
    pub fn blocking(timeout_ms: i64) -> Self {
        Self {
            blocking: true,
            timeout_ms,
            ..Self::default()
        }
    }

    pub fn fire_and_forget() -> Self {
        Self::default()
    }

    pub fn with_callback(mut self) -> Self {
        self.has_callback = true;
        self
    }
}

/// Whether the device should be told not to answer.
///
/// Nobody is waiting when a non-blocking call has no timeout and no callback
/// consumer, or when a blocking call asked for a zero timeout. Broadcast
/// discovery always wants answers: they are how devices get learned.
pub fn resolve_no_ack(opts: &CallOptions, msg_id: MessageId, target: DeviceTarget) -> bool {
    if msg_id == MessageId::AddrGet && target.is_all() {
        return false;
    }
    let immediate = opts.timeout_ms <= 0;
    (!opts.blocking && immediate && !opts.has_callback) || (opts.blocking && immediate)
}

struct ClientConn {
    stream: ControlStream,
    reader: ControlReader<ControlStream>,
    writer: ControlWriter<ControlStream>,
}

/// Application-side handle to one bus endpoint of the daemon.
///
/// Clones share the connection; calls through any clone are serialized.
#[derive(Clone)]
pub struct BusClient {
    config: Arc<ClientConfig>,
    conn: Arc<Mutex<ClientConn>>,
    seq: Arc<AtomicU32>,
}

impl BusClient {
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let stream = ControlStream::connect(&config.addr)?;
        let conn = ClientConn {
            reader: ControlReader::new(stream.try_clone()?),
            writer: ControlWriter::new(stream.try_clone()?),
            stream,
        };
        debug!(
            module = %config.module,
            addr = %config.addr,
            app = %config.app_name,
            "bus client connected"
        );
        Ok(Self {
            config: Arc::new(config),
            conn: Arc::new(Mutex::new(conn)),
            seq: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn module(&self) -> Module {
        self.config.module
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send `request` to `target` and, when `opts` asks for it, wait for the
    /// answer.
    ///
    /// Returns `Ok(None)` when the call does not wait. An `Ack` with a
    /// negative status becomes [`StationError::Rejected`].
    pub fn call(
        &self,
        target: DeviceTarget,
        request: &Request,
        opts: &CallOptions,
    ) -> Result<Option<Response>> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let stale = conn.stream.drain_stale()?;
        conn.reader.clear();
        if stale > 0 {
            debug!(module = %self.config.module, bytes = stale, "discarded stale replies");
        }

        let msg_id = request.msg_id();
        let mut frame_flags = opts.flags & !flags::NO_ACK;
        if resolve_no_ack(opts, msg_id, target) {
            frame_flags |= flags::NO_ACK;
        }

        let device_timeout = if opts.timeout_ms > 0 {
            Duration::from_millis(opts.timeout_ms as u64)
        } else {
            self.config.device_timeout
        };
        let budget = device_timeout * (self.config.retries + 1);

        let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let msg = ControlMessage {
            app_name: self.config.app_name.clone(),
            module_id: self.config.module.id(),
            dev_num: target.dev_num(),
            seq,
            sent_ms: now_ms(),
            timeout_ms: opts.timeout_ms.max(0),
            bus: BusHeader {
                msg_id: msg_id.as_u8(),
                flags: frame_flags,
                blocking: opts.blocking,
                status: 0,
            },
            payload: request.encode(),
        };
        conn.writer.send(&msg).map_err(closed_as_disc)?;

        if !opts.blocking || opts.timeout_ms <= 0 {
            return Ok(None);
        }

        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StationError::CommsTimeout(budget));
            }
            conn.stream.set_read_timeout(Some(remaining))?;

            let reply = match conn.reader.read_message() {
                Ok(reply) => reply,
                Err(err) if err.is_timeout() => return Err(StationError::CommsTimeout(budget)),
                Err(err) => return Err(closed_as_disc(err)),
            };
            if reply.seq != seq {
                debug!(expected = seq, got = reply.seq, "skipping reply to an earlier call");
                continue;
            }
            return validate(target, msg_id, &reply).map(Some);
        }
    }
}

fn validate(target: DeviceTarget, msg_id: MessageId, reply: &ControlMessage) -> Result<Response> {
    if reply.bus.msg_id == MessageId::Ack.as_u8() {
        let status = reply.bus.status;
        if status < 0 {
            return Err(StationError::Rejected { status });
        }
        return Ok(Response::Ack { status });
    }
    if reply.bus.msg_id != msg_id.as_u8() {
        return Err(StationError::MsgIdMismatch {
            expected: msg_id.as_u8(),
            actual: reply.bus.msg_id,
        });
    }
    if let DeviceTarget::One(dev) = target {
        if reply.dev_num != dev {
            return Err(StationError::DevNumMismatch {
                expected: dev,
                actual: reply.dev_num,
            });
        }
    }
    Response::decode(msg_id, &reply.payload)
}

fn closed_as_disc(err: FrameError) -> StationError {
    match err {
        FrameError::ConnectionClosed => StationError::SockDisc,
        other => StationError::Frame(other),
    }
}
