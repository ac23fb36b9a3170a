//! Protocol session: one in-flight command, a continuous event stream.
//!
//! A background read thread drains the device for the whole life of the
//! session. Each decoded `Res` goes to the single pending command through a
//! one-shot channel; each `Evt` goes to an unbounded event channel. Callers
//! never read the transport themselves.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{PrestoError, Result};
use crate::events::{PacketDirection, PrestoObserver, SessionEvent, TracingObserver};
use crate::protocol::constants::{
    ABORT_FEATURE_REPORT, ABORT_PAYLOAD, DEFAULT_POLL_INTERVAL_MS, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_RESPONSE_TIMEOUT_MS, KINGFISHER_PRODUCT_ID, KINGFISHER_VENDOR_ID,
    MAX_INBOUND_MESSAGE_LEN,
};
use crate::protocol::{Command, Event, Message, Response};
use crate::transport::{Deframer, HidTransport, NusbTransport, TransportError, frame_message};

/// Configuration for a Presto session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Select a specific instrument when several are attached.
    pub serial_number: Option<String>,
    /// Time to wait for the response to a command.
    pub response_timeout_ms: u64,
    /// Time without progress after which a partial inbound message is dropped.
    pub read_timeout_ms: u64,
    /// Read poll granularity of the background thread.
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: KINGFISHER_VENDOR_ID,
            product_id: KINGFISHER_PRODUCT_ID,
            serial_number: None,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Blocking iterator over session events; ends when the session closes.
pub type Events<'a> = crossbeam_channel::Iter<'a, Event>;

type Reply = std::result::Result<Response, TransportError>;

/// The one outstanding command.
struct Pending {
    name: String,
    reply: Sender<Reply>,
}

type PendingSlot = Arc<Mutex<Option<Pending>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fail_pending(slot: &PendingSlot, err: impl Fn() -> TransportError) {
    if let Some(pending) = lock(slot).take() {
        debug!(command = %pending.name, "Failing pending command");
        let _ = pending.reply.send(Err(err()));
    }
}

/// Session over one HID transport.
pub struct PrestoSession<T: HidTransport + 'static> {
    transport: Arc<T>,
    config: SessionConfig,
    observer: Arc<dyn PrestoObserver>,
    pending: PendingSlot,
    /// Serializes whole outbound messages; never taken by the read thread.
    write_lock: Mutex<()>,
    events: Receiver<Event>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PrestoSession<NusbTransport> {
    /// Open the device named by `config` and start a session on it.
    pub fn open_device(config: SessionConfig) -> Result<Self> {
        let transport = NusbTransport::open_with_ids(
            config.vendor_id,
            config.product_id,
            config.serial_number.as_deref(),
        )?;
        Self::open(Arc::new(transport), config, Arc::new(TracingObserver))
    }
}

impl<T: HidTransport + 'static> PrestoSession<T> {
    /// Start a session on an opened transport.
    #[instrument(level = "info", skip_all)]
    pub fn open(
        transport: Arc<T>,
        config: SessionConfig,
        observer: Arc<dyn PrestoObserver>,
    ) -> Result<Self> {
        if !transport.is_connected() {
            return Err(TransportError::Disconnected.into());
        }

        let pending: PendingSlot = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = unbounded();

        let reader = Reader {
            transport: Arc::clone(&transport),
            observer: Arc::clone(&observer),
            pending: Arc::clone(&pending),
            events: events_tx,
            running: Arc::clone(&running),
            poll_interval: config.poll_interval(),
            read_timeout: config.read_timeout(),
        };
        let handle = thread::Builder::new()
            .name("presto-reader".into())
            .spawn(move || reader.run())
            .map_err(TransportError::from)?;

        observer.on_event(&SessionEvent::DeviceOpened {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });
        info!(
            response_timeout_ms = config.response_timeout_ms,
            "Session started"
        );

        Ok(Self {
            transport,
            config,
            observer,
            pending,
            write_lock: Mutex::new(()),
            events: events_rx,
            running,
            reader: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn is_command_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its response; `ok="false"` is an error.
    pub fn send_command(&self, command: &Command) -> Result<Response> {
        let response = self.request(command)?;
        Ok(response.into_result()?)
    }

    /// Send a command and wait for its response, whatever its `ok` flag.
    #[instrument(skip(self, command), fields(command = %command.name()))]
    pub fn request(&self, command: &Command) -> Result<Response> {
        let bytes = command.encode()?;
        let (tx, rx) = bounded(1);

        {
            let mut slot = lock(&self.pending);
            if let Some(pending) = slot.as_ref() {
                return Err(PrestoError::usage(format!(
                    "cannot send {} while {} is awaiting its response",
                    command.name(),
                    pending.name
                )));
            }
            *slot = Some(Pending {
                name: command.name().to_string(),
                reply: tx,
            });
        }

        if let Err(e) = self.write_message(&bytes) {
            lock(&self.pending).take();
            return Err(e.into());
        }
        self.observer.on_event(&SessionEvent::CommandSent {
            name: command.name().to_string(),
        });

        let timeout = self.config.response_timeout();
        let response = match rx.recv_timeout(timeout) {
            Ok(reply) => reply?,
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.pending).take();
                warn!(timeout_ms = self.config.response_timeout_ms, "No response");
                return Err(TransportError::timeout(timeout).into());
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(TransportError::Disconnected.into());
            }
        };

        if let Some(warning) = &response.warning {
            self.observer.on_event(&SessionEvent::Warning {
                command: response.name.clone(),
                warning: warning.clone(),
            });
        }
        Ok(response)
    }

    /// Send a command whose completion arrives as events, not as a response.
    #[instrument(skip(self, command), fields(command = %command.name()))]
    pub fn send_only(&self, command: &Command) -> Result<()> {
        if let Some(pending) = lock(&self.pending).as_ref() {
            return Err(PrestoError::usage(format!(
                "cannot send {} while {} is awaiting its response",
                command.name(),
                pending.name
            )));
        }
        let bytes = command.encode()?;
        self.write_message(&bytes)?;
        self.observer.on_event(&SessionEvent::CommandSent {
            name: command.name().to_string(),
        });
        Ok(())
    }

    /// Block until the next event.
    pub fn get_event(&self) -> Result<Event> {
        self.events
            .recv()
            .map_err(|_| TransportError::Disconnected.into())
    }

    /// Wait up to `timeout` for the next event; `None` on timeout.
    pub fn get_event_timeout(&self, timeout: Duration) -> Result<Option<Event>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected.into()),
        }
    }

    /// Events in arrival order.
    pub fn events(&self) -> Events<'_> {
        self.events.iter()
    }

    /// Two-phase abort: feature report on the control pipe, then ESC + LF on
    /// the report stream. Both phases are always attempted.
    ///
    /// A pending command keeps waiting; the instrument answers an abort with
    /// an `Aborted` event.
    #[instrument(skip(self))]
    pub fn abort(&self) -> Result<()> {
        if let Err(e) = self.transport.send_feature_report(&ABORT_FEATURE_REPORT) {
            warn!(error = %e, "Abort feature report failed, sending abort payload anyway");
        }
        self.write_message(&ABORT_PAYLOAD)?;
        self.observer.on_event(&SessionEvent::AbortSent);
        Ok(())
    }

    /// Stop the read thread. A pending command fails with `Disconnected`.
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = lock(&self.reader).take() {
            if handle.join().is_err() {
                warn!("Read thread panicked");
            }
        }
        fail_pending(&self.pending, || TransportError::Disconnected);
        info!("Session closed");
    }

    fn write_message(&self, bytes: &[u8]) -> std::result::Result<(), TransportError> {
        let _guard = lock(&self.write_lock);
        for report in frame_message(bytes) {
            self.transport.write_report(&report)?;
            self.observer.on_event(&SessionEvent::Packet {
                direction: PacketDirection::Tx,
                length: report.len(),
            });
        }
        Ok(())
    }
}

impl<T: HidTransport + 'static> Drop for PrestoSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the read thread.
struct Reader<T: HidTransport> {
    transport: Arc<T>,
    observer: Arc<dyn PrestoObserver>,
    pending: PendingSlot,
    events: Sender<Event>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    read_timeout: Duration,
}

impl<T: HidTransport> Reader<T> {
    fn run(self) {
        let mut deframer = Deframer::new();
        // Lines of a message whose text spans several line feeds.
        let mut carry: Vec<u8> = Vec::new();
        let mut last_progress = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            match self.transport.read_report(self.poll_interval) {
                Ok(report) => {
                    self.observer.on_event(&SessionEvent::Packet {
                        direction: PacketDirection::Rx,
                        length: report.len(),
                    });
                    last_progress = Instant::now();
                    match deframer.push_report(&report) {
                        Ok(lines) => {
                            for line in lines {
                                self.assemble(&mut carry, &line);
                            }
                        }
                        Err(TransportError::MalformedReport {
                            declared,
                            available,
                        }) => {
                            warn!(declared, available, "Dropping malformed report");
                            deframer.reset();
                            carry.clear();
                            fail_pending(&self.pending, || TransportError::MalformedReport {
                                declared,
                                available,
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping unreadable report");
                            deframer.reset();
                            carry.clear();
                        }
                    }
                }
                Err(TransportError::Timeout { .. }) => {
                    let partial = deframer.has_partial() || !carry.is_empty();
                    if partial && last_progress.elapsed() >= self.read_timeout {
                        self.observer.on_event(&SessionEvent::PartialMessageDiscarded {
                            bytes: deframer.pending_len() + carry.len(),
                        });
                        deframer.reset();
                        carry.clear();
                        let timeout = self.read_timeout;
                        fail_pending(&self.pending, || TransportError::timeout(timeout));
                    }
                }
                Err(TransportError::Disconnected) => {
                    self.observer.on_event(&SessionEvent::DeviceDisconnected);
                    break;
                }
                Err(e) => {
                    if !self.transport.is_connected() {
                        self.observer.on_event(&SessionEvent::DeviceDisconnected);
                        break;
                    }
                    warn!(error = %e, "Report read failed");
                    thread::sleep(self.poll_interval);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        fail_pending(&self.pending, || TransportError::Disconnected);
        debug!("Read thread exiting");
    }

    /// Add one line-feed-terminated line and dispatch the message once its
    /// text is complete. A line that opens a new message abandons an
    /// unfinished one.
    fn assemble(&self, carry: &mut Vec<u8>, line: &[u8]) {
        if !carry.is_empty() && starts_message(line) {
            self.decode_failed("unterminated message", carry);
            carry.clear();
        }
        carry.extend_from_slice(line);

        if carry.iter().all(u8::is_ascii_whitespace) {
            carry.clear();
            return;
        }

        match Message::decode(carry) {
            Ok(message) => {
                carry.clear();
                self.dispatch(message);
            }
            Err(e) if e.is_incomplete() && carry.len() <= MAX_INBOUND_MESSAGE_LEN => {
                debug!(buffered = carry.len(), "Message continues on the next line");
            }
            Err(e) => {
                self.decode_failed(&e.to_string(), carry);
                carry.clear();
            }
        }
    }

    fn decode_failed(&self, reason: &str, bytes: &[u8]) {
        self.observer.on_event(&SessionEvent::DecodeFailed {
            message: format!("{}: {}", reason, String::from_utf8_lossy(bytes).trim_end()),
        });
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Response(response) => self.deliver_response(response),
            Message::Event(event) => {
                self.observer
                    .on_event(&SessionEvent::InstrumentEvent(event.clone()));
                // Receiver gone means the session is closing.
                let _ = self.events.send(event);
            }
        }
    }

    /// The next `Res` belongs to the pending command, whatever name it carries.
    fn deliver_response(&self, response: Response) {
        let pending = lock(&self.pending).take();

        match pending {
            Some(pending) => {
                if !response.name.is_empty() && response.name != pending.name {
                    warn!(
                        command = %pending.name,
                        response = %response.name,
                        "Response name differs from the pending command"
                    );
                }
                let response = response.answering(&pending.name);
                self.observer.on_event(&SessionEvent::ResponseReceived {
                    name: response.name.clone(),
                    ok: response.ok,
                });
                let _ = pending.reply.send(Ok(response));
            }
            None => self.observer.on_event(&SessionEvent::OrphanResponse {
                name: response.name,
            }),
        }
    }
}

/// Whether a line begins a new top-level message.
fn starts_message(line: &[u8]) -> bool {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let line = &line[start..];
    const OPENINGS: [&[u8]; 3] = [b"<Res", b"<Evt", b"<?xml"];
    OPENINGS.iter().any(|prefix| line.starts_with(prefix))
}
