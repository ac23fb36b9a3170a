//! High-level instrument controller.
//!
//! `Presto` drives a session and keeps the instrument model in step with it:
//! run state from responses and events, turntable placement from confirmed
//! rotations.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::machine::{BusyPhase, RunState, RunTracker};
use super::turntable::{Location, Slot, TurntableState};
use crate::error::{PrestoError, Result};
use crate::events::{PrestoObserver, SessionEvent, TracingObserver};
use crate::protocol::{
    AckKind, CodecError, Command, Event, InstrumentError, InstrumentInfo, InstrumentStatus,
    ProtocolDuration, ProtocolList, ResponsePayload, StatusReport, TimeLeft,
};
use crate::session::{PrestoSession, SessionConfig};
use crate::transport::{HidTransport, NusbTransport, TransportError};

/// Reply an event is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTarget {
    /// `Acknowledge` for a plate or pause prompt.
    Acknowledge(AckKind),
    /// `ErrorAcknowledge` for an `Error` event.
    ErrorAcknowledge,
}

/// Single-use permission to answer one event.
///
/// Handed out with the event that needs it and consumed by
/// [`Presto::send_acknowledgement`].
#[derive(Debug, PartialEq, Eq)]
pub struct Acknowledgement {
    target: AckTarget,
}

impl Acknowledgement {
    fn new(target: AckTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> AckTarget {
        self.target
    }

    /// Command this acknowledgement sends.
    pub fn command(&self) -> Command {
        match self.target {
            AckTarget::Acknowledge(_) => Command::Acknowledge,
            AckTarget::ErrorAcknowledge => Command::ErrorAcknowledge,
        }
    }
}

/// An event as seen by the controller.
#[derive(Debug)]
pub struct RunEvent {
    pub event: Event,
    /// Present when the instrument waits for the host before continuing.
    pub acknowledgement: Option<Acknowledgement>,
}

impl RunEvent {
    /// Whether the run (or rotation) ended with this event.
    pub fn is_terminal(&self) -> bool {
        self.event.is_terminal()
    }
}

/// Controller for one KingFisher Presto.
pub struct Presto<T: HidTransport + 'static> {
    transport: Arc<T>,
    config: SessionConfig,
    observer: Arc<dyn PrestoObserver>,
    session: Option<PrestoSession<T>>,
    run: RunTracker,
    turntable: TurntableState,
    info: Option<InstrumentInfo>,
    /// Events read while waiting for a rotation, delivered by `next_event`.
    deferred: VecDeque<Event>,
}

impl Presto<NusbTransport> {
    /// Open the device named by `config`.
    pub fn open_device(config: SessionConfig) -> Result<Self> {
        let transport = NusbTransport::open_with_ids(
            config.vendor_id,
            config.product_id,
            config.serial_number.as_deref(),
        )?;
        Ok(Self::new(Arc::new(transport), config, Arc::new(TracingObserver)))
    }
}

impl<T: HidTransport + 'static> Presto<T> {
    pub fn new(transport: Arc<T>, config: SessionConfig, observer: Arc<dyn PrestoObserver>) -> Self {
        Self {
            transport,
            config,
            observer,
            session: None,
            run: RunTracker::new(),
            turntable: TurntableState::Unknown,
            info: None,
            deferred: VecDeque::new(),
        }
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Connect to the instrument and read its status.
    ///
    /// Reuses an open session. The turntable placement is always forgotten,
    /// since the turntable may have been moved while disconnected.
    #[instrument(skip(self))]
    pub fn setup(&mut self, set_time: Option<&str>) -> Result<StatusReport> {
        if !self.is_connected() {
            let session = PrestoSession::open(
                Arc::clone(&self.transport),
                self.config.clone(),
                Arc::clone(&self.observer),
            )?;
            self.session = Some(session);
            self.deferred.clear();
            let change = self.run.reset();
            self.report_run_change(change);
        } else {
            debug!("Session already open, reconnecting");
        }
        self.set_turntable(TurntableState::Unknown);

        let response = self.session()?.send_command(&Command::Connect {
            set_time: set_time.map(str::to_string),
        })?;
        if let ResponsePayload::Connect(info) = response.payload {
            info!(
                instrument = info.instrument.as_deref().unwrap_or("-"),
                version = info.version.as_deref().unwrap_or("-"),
                serial = info.serial.as_deref().unwrap_or("-"),
                "Connected"
            );
            self.info = Some(info);
        }

        self.get_status()
    }

    /// Disconnect, close the session and release the device. Errors are
    /// logged, not returned.
    ///
    /// The transport cannot be reused afterwards; open the device again to
    /// reconnect.
    #[instrument(skip(self))]
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            // The instrument may not answer a Disconnect.
            if let Err(e) = session.send_only(&Command::Disconnect) {
                debug!(error = %e, "Disconnect not sent");
            }
            session.close();
        }
        self.transport.release();
        self.info = None;
        self.deferred.clear();
        self.set_turntable(TurntableState::Unknown);
        let change = self.run.reset();
        self.report_run_change(change);
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(PrestoSession::is_open)
    }

    /// Open session, or a usage error before `setup`.
    pub fn session(&self) -> Result<&PrestoSession<T>> {
        self.session
            .as_ref()
            .filter(|s| s.is_open())
            .ok_or_else(|| PrestoError::usage("not connected; call setup first"))
    }

    pub fn run_state(&self) -> &RunState {
        self.run.state()
    }

    pub fn turntable(&self) -> TurntableState {
        self.turntable
    }

    pub fn instrument_info(&self) -> Option<&InstrumentInfo> {
        self.info.as_ref()
    }

    // ------------------------------------------------------------------
    // Status and protocol execution
    // ------------------------------------------------------------------

    /// Query the instrument status and update the run state from it.
    pub fn get_status(&mut self) -> Result<StatusReport> {
        let response = self.session()?.request(&Command::GetStatus)?;
        let ResponsePayload::Status(report) = response.payload else {
            return Err(CodecError::UnexpectedPayload(response.name).into());
        };
        let change = self.run.apply_status(&report);
        self.report_run_change(change);
        Ok(report)
    }

    /// Start a protocol, or a single tip/step of it.
    #[instrument(skip(self))]
    pub fn start_protocol(
        &mut self,
        protocol: &str,
        tip: Option<&str>,
        step: Option<&str>,
    ) -> Result<()> {
        if let RunState::InError(err) = self.run.state() {
            let reason = err
                .as_ref()
                .map_or_else(|| "unknown error".to_string(), ToString::to_string);
            return Err(PrestoError::usage(format!(
                "instrument is in error ({}); acknowledge the error first",
                reason
            )));
        }

        self.session()?.send_command(&Command::StartProtocol {
            protocol: protocol.to_string(),
            tip: tip.map(str::to_string),
            step: step.map(str::to_string),
        })?;
        let change = self.run.protocol_started();
        self.report_run_change(change);
        Ok(())
    }

    /// Wait for the next event of the run.
    pub fn next_event(&mut self) -> Result<RunEvent> {
        let event = match self.deferred.pop_front() {
            Some(event) => event,
            None => self.session()?.get_event()?,
        };
        Ok(self.process_event(event))
    }

    /// Like [`Presto::next_event`], giving up after `timeout`.
    pub fn next_event_timeout(&mut self, timeout: Duration) -> Result<Option<RunEvent>> {
        let event = match self.deferred.pop_front() {
            Some(event) => Some(event),
            None => self.session()?.get_event_timeout(timeout)?,
        };
        Ok(event.map(|e| self.process_event(e)))
    }

    /// Answer an event with the acknowledgement it was handed out with.
    pub fn send_acknowledgement(&mut self, ack: Acknowledgement) -> Result<()> {
        match ack.target {
            AckTarget::Acknowledge(_) => self.acknowledge(),
            AckTarget::ErrorAcknowledge => self.error_acknowledge(),
        }
    }

    pub fn acknowledge(&mut self) -> Result<()> {
        self.session()?.send_command(&Command::Acknowledge)?;
        let change = self.run.acknowledged();
        self.report_run_change(change);
        Ok(())
    }

    pub fn error_acknowledge(&mut self) -> Result<()> {
        self.session()?.send_command(&Command::ErrorAcknowledge)?;
        let change = self.run.error_acknowledged();
        self.report_run_change(change);
        Ok(())
    }

    /// Ask the instrument to stop the running protocol.
    pub fn stop_protocol(&mut self) -> Result<()> {
        self.session()?.send_command(&Command::Stop)?;
        Ok(())
    }

    /// Out-of-band abort; the run ends with an `Aborted` event.
    pub fn abort(&self) -> Result<()> {
        self.session()?.abort()
    }

    /// Pick up a run already in progress without starting anything.
    ///
    /// An idle instrument yields `Ready` and a faulted one yields its error
    /// (with an acknowledgement), neither reading the event queue. A busy
    /// instrument yields its next event.
    pub fn attach(&mut self) -> Result<RunEvent> {
        let report = self.get_status()?;
        match report.status {
            InstrumentStatus::Idle => Ok(RunEvent {
                event: Event::Ready,
                acknowledgement: None,
            }),
            InstrumentStatus::InError => Ok(RunEvent {
                event: Event::Error(
                    report
                        .error
                        .unwrap_or_else(|| InstrumentError::new(None, None)),
                ),
                acknowledgement: Some(Acknowledgement::new(AckTarget::ErrorAcknowledge)),
            }),
            InstrumentStatus::Busy | InstrumentStatus::Other(_) => self.next_event(),
        }
    }

    fn process_event(&mut self, event: Event) -> RunEvent {
        let change = self.run.apply_event(&event);
        self.report_run_change(change);

        let acknowledgement = match &event {
            Event::Error(_) => Some(Acknowledgement::new(AckTarget::ErrorAcknowledge)),
            other => other
                .ack_kind()
                .map(|kind| Acknowledgement::new(AckTarget::Acknowledge(kind))),
        };
        RunEvent {
            event,
            acknowledgement,
        }
    }

    // ------------------------------------------------------------------
    // Turntable
    // ------------------------------------------------------------------

    /// Move `slot` to `location` and wait for the rotation to finish.
    ///
    /// Placement is only updated on `Ready`. On `Error` the error is
    /// acknowledged and returned with the placement untouched.
    #[instrument(skip(self))]
    pub fn rotate(&mut self, slot: Slot, location: Location) -> Result<()> {
        if self.run.state() == &RunState::Busy(BusyPhase::Running) {
            return Err(PrestoError::usage(
                "cannot rotate the turntable while a protocol is running",
            ));
        }

        self.session()?.send_only(&Command::Rotate {
            nest: slot.number(),
            position: location.rotate_position(),
        })?;

        let timeout = self.config.response_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(event) = self.session()?.get_event_timeout(remaining)? else {
                return Err(TransportError::timeout(timeout).into());
            };

            match event {
                Event::Ready => {
                    self.set_turntable(TurntableState::after_rotation(slot, location));
                    return Ok(());
                }
                Event::Error(err) => {
                    if let Err(e) = self.session()?.send_command(&Command::ErrorAcknowledge) {
                        warn!(error = %e, "ErrorAcknowledge after failed rotation was refused");
                    }
                    return Err(err.with_source("Rotate").into());
                }
                Event::Aborted => {
                    return Err(InstrumentError::new(None, Some("Rotation aborted".into()))
                        .with_source("Rotate")
                        .into());
                }
                other => {
                    debug!(event = %other.name(), "Deferring event received during rotation");
                    self.deferred.push_back(other);
                }
            }
        }
    }

    /// `rotate` with unchecked arguments: `position` is the slot number,
    /// `location` is `"processing"` or `"loading"`.
    pub fn rotate_raw(&mut self, position: u8, location: &str) -> Result<()> {
        let slot = Slot::from_number(position).ok_or_else(|| {
            PrestoError::usage(format!("invalid turntable slot {} (expected 1 or 2)", position))
        })?;
        let location: Location = location.parse().map_err(PrestoError::Usage)?;
        self.rotate(slot, location)
    }

    /// Bring the slot at the loading position to processing.
    pub fn load_plate(&mut self) -> Result<()> {
        let Some(loading) = self.turntable.slot_at(Location::Loading) else {
            return Err(PrestoError::usage(
                "turntable position is unknown; rotate a slot first",
            ));
        };
        self.rotate(loading, Location::Processing)
    }

    // ------------------------------------------------------------------
    // Protocol memory
    // ------------------------------------------------------------------

    pub fn list_protocols(&self) -> Result<ProtocolList> {
        match self.query(&Command::ListProtocols)? {
            ResponsePayload::ProtocolList(list) => Ok(list),
            _ => Err(CodecError::UnexpectedPayload("ListProtocols".into()).into()),
        }
    }

    pub fn get_protocol_duration(&self, protocol: &str) -> Result<ProtocolDuration> {
        let command = Command::GetProtocolDuration {
            protocol: protocol.to_string(),
        };
        match self.query(&command)? {
            ResponsePayload::ProtocolDuration(duration) => Ok(duration),
            _ => Err(CodecError::UnexpectedPayload("GetProtocolDuration".into()).into()),
        }
    }

    /// Time left of the running protocol (or of `protocol`).
    pub fn get_protocol_time_left(&self, protocol: Option<&str>) -> Result<TimeLeft> {
        let command = Command::GetProtocolTimeLeft {
            protocol: protocol.map(str::to_string),
        };
        match self.query(&command)? {
            ResponsePayload::TimeLeft(left) => Ok(left),
            _ => Err(CodecError::UnexpectedPayload("GetProtocolTimeLeft".into()).into()),
        }
    }

    /// Store a protocol file (BDZ bytes) under `protocol`.
    pub fn upload_protocol(&self, protocol: &str, data: &[u8]) -> Result<()> {
        self.query(&Command::upload(protocol, data.to_vec()))?;
        Ok(())
    }

    /// Fetch a stored protocol file.
    pub fn download_protocol(&self, protocol: &str) -> Result<Vec<u8>> {
        let command = Command::DownloadProtocol {
            protocol: protocol.to_string(),
        };
        match self.query(&command)? {
            ResponsePayload::ProtocolData(data) => Ok(data.decode()?),
            _ => Err(CodecError::UnexpectedPayload("DownloadProtocol".into()).into()),
        }
    }

    fn query(&self, command: &Command) -> Result<ResponsePayload> {
        Ok(self.session()?.send_command(command)?.payload)
    }

    fn report_run_change(&self, previous: Option<RunState>) {
        if let Some(from) = previous {
            self.observer.on_event(&SessionEvent::RunStateChanged {
                from,
                to: self.run.state().clone(),
            });
        }
    }

    fn set_turntable(&mut self, next: TurntableState) {
        if self.turntable != next {
            self.turntable = next;
            self.observer.on_event(&SessionEvent::TurntableChanged(next));
        }
    }
}
