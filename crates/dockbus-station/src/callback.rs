//! Callback fan-out: unsolicited and late device frames, delivered to every
//! subscribed application.
//!
//! Bus servers hand events to a [`CallbackPublisher`]. The daemon's
//! [`CallbackServer`] writes each one to every registered subscriber. On
//! the application side a [`CallbackListener`] receives them and feeds a
//! [`Subscriptions`] table of handlers keyed by `(module, msg_id)`.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dockbus_frame::{BusHeader, ControlMessage, ControlReader, ControlWriter};
use dockbus_transport::{wait_readable, ControlListener, ControlStream};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, StationError};
use crate::module::Module;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const REGISTRATION_TIMEOUT: Duration = Duration::from_millis(500);
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Name the daemon stamps on messages it originates.
pub const DAEMON_APP_NAME: &str = "dockbusd";

/// One frame delivered outside a blocking call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackEvent {
    /// Bus the frame arrived on.
    pub module: Module,
    pub dev_num: u16,
    pub msg_id: u8,
    pub status: i32,
    #[serde(serialize_with = "serialize_hex")]
    pub payload: Bytes,
}

impl CallbackEvent {
    pub fn to_message(&self, seq: u32) -> ControlMessage {
        ControlMessage {
            app_name: DAEMON_APP_NAME.to_string(),
            module_id: self.module.id(),
            dev_num: self.dev_num,
            seq,
            sent_ms: now_ms(),
            timeout_ms: 0,
            bus: BusHeader {
                msg_id: self.msg_id,
                flags: 0,
                blocking: false,
                status: self.status,
            },
            payload: self.payload.clone(),
        }
    }

    pub fn from_message(msg: &ControlMessage) -> Result<Self> {
        let module =
            Module::from_id(msg.module_id).ok_or(StationError::UnknownModule(msg.module_id))?;
        Ok(Self {
            module,
            dev_num: msg.dev_num,
            msg_id: msg.bus.msg_id,
            status: msg.bus.status,
            payload: msg.payload.clone(),
        })
    }
}

fn serialize_hex<S: serde::Serializer>(
    payload: &Bytes,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(payload))
}

/// Milliseconds since the Unix epoch, as carried in `sent_ms`.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Sending half of the callback channel, cloned into every bus server.
#[derive(Debug, Clone)]
pub struct CallbackPublisher {
    tx: Sender<CallbackEvent>,
}

impl CallbackPublisher {
    /// A connected publisher/receiver pair.
    pub fn channel() -> (Self, Receiver<CallbackEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// A publisher whose events go nowhere, for daemons without a callback
    /// endpoint.
    pub fn disabled() -> Self {
        Self::channel().0
    }

    /// Returns whether anyone is still listening.
    pub fn publish(&self, event: CallbackEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::SendError(event)) => {
                trace!(
                    module = %event.module,
                    msg_id = event.msg_id,
                    "no callback receiver, event dropped"
                );
                false
            }
        }
    }
}

struct Subscriber {
    app_name: String,
    stream: ControlStream,
    writer: ControlWriter<ControlStream>,
}

/// A connection that has not said hello yet.
struct Registrant {
    stream: ControlStream,
    reader: ControlReader<ControlStream>,
    since: Instant,
}

/// Daemon endpoint that fans callback events out to subscribers.
pub struct CallbackServer {
    listener: ControlListener,
    events: Receiver<CallbackEvent>,
    subscribers: Vec<Subscriber>,
    registrants: Vec<Registrant>,
    shutdown: Arc<AtomicBool>,
    seq: u32,
}

impl CallbackServer {
    pub fn bind(
        addr: &str,
        events: Receiver<CallbackEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = ControlListener::bind(addr)?;
        Ok(Self {
            listener,
            events,
            subscribers: Vec::new(),
            registrants: Vec::new(),
            shutdown,
            seq: 0,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Serve until the shutdown flag is raised.
    pub fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr(), "callback server running");
        while !self.shutdown.load(Ordering::Relaxed) {
            self.poll_once()?;
        }
        info!(subscribers = self.subscribers.len(), "callback server stopped");
        Ok(())
    }

    /// Run on a named thread.
    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name("dockbus-callback".to_string())
            .spawn(move || self.run())
            .map_err(StationError::Io)
    }

    fn poll_once(&mut self) -> Result<()> {
        let subs = self.subscribers.len();
        let mut fds: Vec<RawFd> = Vec::with_capacity(subs + self.registrants.len() + 1);
        fds.push(self.listener.as_raw_fd());
        fds.extend(self.subscribers.iter().map(|s| s.stream.as_raw_fd()));
        fds.extend(self.registrants.iter().map(|r| r.stream.as_raw_fd()));

        let ready = wait_readable(&fds, POLL_INTERVAL)?;

        // Promoted registrants are appended, past the indices polled below.
        for index in (0..self.registrants.len()).rev() {
            if ready.is_ready(index + 1 + subs) {
                self.read_hello(index);
            }
        }
        self.expire_registrants(Instant::now());

        // Subscribers only ever talk once; readable afterwards means gone.
        for index in (0..subs).rev() {
            if ready.is_ready(index + 1) && !self.still_connected(index) {
                let sub = self.subscribers.swap_remove(index);
                info!(app = %sub.app_name, "callback subscriber disconnected");
            }
        }

        if ready.is_ready(0) {
            match self.listener.accept() {
                Ok(stream) => self.admit(stream),
                Err(err) => warn!(error = %err, "callback accept failed"),
            }
        }

        self.fan_out();
        Ok(())
    }

    fn still_connected(&mut self, index: usize) -> bool {
        let Some(sub) = self.subscribers.get_mut(index) else {
            return false;
        };
        match sub.stream.drain_stale() {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                debug!(app = %sub.app_name, bytes = n, "ignoring subscriber chatter");
                true
            }
        }
    }

    /// Park a fresh connection until its hello arrives.
    fn admit(&mut self, stream: ControlStream) {
        let registrant = stream
            .set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT))
            .and_then(|()| stream.try_clone())
            .map(|clone| Registrant {
                reader: ControlReader::new(clone),
                stream,
                since: Instant::now(),
            });
        match registrant {
            Ok(registrant) => self.registrants.push(registrant),
            Err(err) => warn!(error = %err, "callback connection setup failed"),
        }
    }

    fn read_hello(&mut self, index: usize) {
        let Some(registrant) = self.registrants.get_mut(index) else {
            return;
        };
        match registrant.reader.fill() {
            Ok(0) => {
                debug!("callback connection closed before registering");
                self.registrants.swap_remove(index);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "callback registration rejected");
                self.registrants.swap_remove(index);
                return;
            }
        }
        match registrant.reader.next_buffered() {
            Ok(None) => {}
            Ok(Some(hello)) => {
                let registrant = self.registrants.swap_remove(index);
                match Self::promote(registrant, hello) {
                    Ok(sub) => {
                        info!(app = %sub.app_name, "callback subscriber registered");
                        self.subscribers.push(sub);
                    }
                    Err(err) => warn!(error = %err, "callback registration rejected"),
                }
            }
            Err(err) => {
                warn!(error = %err, "callback registration rejected");
                self.registrants.swap_remove(index);
            }
        }
    }

    fn promote(registrant: Registrant, hello: ControlMessage) -> Result<Subscriber> {
        if hello.module_id != Module::Callback.id() {
            return Err(StationError::UnknownModule(hello.module_id));
        }
        let writer = ControlWriter::new(registrant.stream.try_clone()?);
        Ok(Subscriber {
            app_name: hello.app_name,
            stream: registrant.stream,
            writer,
        })
    }

    fn expire_registrants(&mut self, now: Instant) {
        self.registrants.retain(|r| {
            let waiting = now.saturating_duration_since(r.since);
            if waiting < REGISTRATION_TIMEOUT {
                return true;
            }
            warn!(waited_ms = waiting.as_millis() as u64, "callback registration timed out");
            false
        });
    }

    fn fan_out(&mut self) {
        loop {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            };
            self.seq = self.seq.wrapping_add(1);
            let msg = event.to_message(self.seq);
            self.subscribers.retain_mut(|sub| match sub.writer.send(&msg) {
                Ok(()) => true,
                Err(err) => {
                    warn!(app = %sub.app_name, error = %err, "dropping callback subscriber");
                    false
                }
            });
            trace!(
                module = %event.module,
                dev = event.dev_num,
                msg_id = event.msg_id,
                subscribers = self.subscribers.len(),
                "callback event delivered"
            );
        }
    }
}

/// Boxed callback handler.
pub type Handler = Box<dyn FnMut(&CallbackEvent) + Send>;

/// Handlers keyed by `(module, msg_id)`; `None` matches any message.
#[derive(Default)]
pub struct Subscriptions {
    entries: Vec<(Module, Option<u8>, Handler)>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        module: Module,
        msg_id: Option<u8>,
        handler: impl FnMut(&CallbackEvent) + Send + 'static,
    ) {
        self.entries.push((module, msg_id, Box::new(handler)));
    }

    /// Invoke every matching handler. Returns how many ran.
    pub fn dispatch(&mut self, event: &CallbackEvent) -> usize {
        let mut invoked = 0;
        for (module, msg_id, handler) in &mut self.entries {
            if *module == event.module && msg_id.is_none_or(|id| id == event.msg_id) {
                handler(event);
                invoked += 1;
            }
        }
        invoked
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Application-side connection to the callback endpoint.
pub struct CallbackListener {
    stream: ControlStream,
    reader: ControlReader<ControlStream>,
}

impl CallbackListener {
    /// Connect and register as `app_name`.
    pub fn connect(addr: &str, app_name: &str) -> Result<Self> {
        let stream = ControlStream::connect(addr)?;
        let hello = ControlMessage {
            app_name: app_name.to_string(),
            module_id: Module::Callback.id(),
            dev_num: 0,
            seq: 0,
            sent_ms: now_ms(),
            timeout_ms: 0,
            bus: BusHeader::default(),
            payload: Bytes::new(),
        };
        ControlWriter::new(stream.try_clone()?).send(&hello)?;
        let reader = ControlReader::new(stream.try_clone()?);
        debug!(addr, app = app_name, "registered for callbacks");
        Ok(Self { stream, reader })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Block for the next event.
    pub fn recv(&mut self) -> Result<CallbackEvent> {
        let msg = self.reader.read_message().map_err(|err| match err {
            dockbus_frame::FrameError::ConnectionClosed => StationError::SockDisc,
            other => StationError::Frame(other),
        })?;
        CallbackEvent::from_message(&msg)
    }

    /// Read events on one thread and run `subscriptions` on another.
    pub fn spawn(mut self, mut subscriptions: Subscriptions) -> Result<CallbackHandle> {
        let control = self.stream.try_clone()?;
        let (tx, rx) = mpsc::channel::<CallbackEvent>();

        let reader = thread::Builder::new()
            .name("dockbus-callback-rx".to_string())
            .spawn(move || loop {
                match self.recv() {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            return Ok(());
                        }
                    }
                    Err(StationError::SockDisc) => return Ok(()),
                    Err(StationError::UnknownModule(id)) => {
                        warn!(module_id = id, "ignoring callback event from unknown module");
                    }
                    Err(err) => return Err(err),
                }
            })?;

        let dispatcher = thread::Builder::new()
            .name("dockbus-callback-dispatch".to_string())
            .spawn(move || {
                for event in rx {
                    subscriptions.dispatch(&event);
                }
                subscriptions
            })?;

        Ok(CallbackHandle {
            control,
            reader,
            dispatcher,
        })
    }
}

/// Running callback listener threads.
pub struct CallbackHandle {
    control: ControlStream,
    reader: JoinHandle<Result<()>>,
    dispatcher: JoinHandle<Subscriptions>,
}

impl CallbackHandle {
    /// Disconnect and wait for both threads. Returns the handler table.
    pub fn stop(self) -> Result<Subscriptions> {
        self.control.shutdown()?;
        let read_result = self
            .reader
            .join()
            .unwrap_or_else(|_| Err(StationError::SockDisc));
        let subscriptions = self
            .dispatcher
            .join()
            .map_err(|_| StationError::SockDisc)?;
        read_result.map(|()| subscriptions)
    }
}
