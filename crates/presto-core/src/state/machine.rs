//! Run state tracking.
//!
//! `RunTracker` is the only place run state changes. Each transition returns
//! the previous state when it actually changed, so the caller can report it.

use std::fmt;

use crate::protocol::{AckKind, Event, InstrumentError, InstrumentStatus, StatusReport};

/// What a busy instrument is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPhase {
    Running,
    /// Stopped until the host sends `Acknowledge`.
    AwaitingAcknowledge(AckKind),
}

/// Protocol execution state of the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Busy(BusyPhase),
    /// Faulted until `ErrorAcknowledge`; carries the error when it is known.
    InError(Option<InstrumentError>),
}

impl RunState {
    pub fn is_idle(&self) -> bool {
        matches!(self, RunState::Idle)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, RunState::Busy(_))
    }

    pub fn is_in_error(&self) -> bool {
        matches!(self, RunState::InError(_))
    }

    /// Acknowledgement the instrument is waiting for, if any.
    pub fn awaiting(&self) -> Option<AckKind> {
        match self {
            RunState::Busy(BusyPhase::AwaitingAcknowledge(kind)) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Busy(BusyPhase::Running) => write!(f, "Busy"),
            RunState::Busy(BusyPhase::AwaitingAcknowledge(kind)) => {
                write!(f, "Busy (awaiting {} acknowledge)", kind)
            }
            RunState::InError(Some(err)) => write!(f, "In error: {}", err),
            RunState::InError(None) => write!(f, "In error"),
        }
    }
}

/// Owner of the run state.
#[derive(Debug, Default)]
pub struct RunTracker {
    state: RunState,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Apply a `GetStatus` report.
    pub fn apply_status(&mut self, report: &StatusReport) -> Option<RunState> {
        let next = match &report.status {
            InstrumentStatus::Idle => RunState::Idle,
            // Keep a known acknowledge phase; the status text does not carry it.
            InstrumentStatus::Busy if self.state.is_busy() => return None,
            InstrumentStatus::Busy => RunState::Busy(BusyPhase::Running),
            InstrumentStatus::InError => RunState::InError(report.error.clone()),
            InstrumentStatus::Other(_) => return None,
        };
        self.set(next)
    }

    /// A `StartProtocol` was accepted.
    pub fn protocol_started(&mut self) -> Option<RunState> {
        self.set(RunState::Busy(BusyPhase::Running))
    }

    /// Apply an instrument event.
    pub fn apply_event(&mut self, event: &Event) -> Option<RunState> {
        if let Some(kind) = event.ack_kind() {
            return self.set(RunState::Busy(BusyPhase::AwaitingAcknowledge(kind)));
        }
        match event {
            Event::Ready | Event::Aborted => self.set(RunState::Idle),
            Event::Error(err) => self.set(RunState::InError(Some(err.clone()))),
            Event::StepStarted { .. } | Event::ProtocolTimeLeft(_) if !self.state.is_busy() => {
                self.set(RunState::Busy(BusyPhase::Running))
            }
            _ => None,
        }
    }

    /// An `Acknowledge` was accepted.
    pub fn acknowledged(&mut self) -> Option<RunState> {
        match self.state {
            RunState::Busy(BusyPhase::AwaitingAcknowledge(_)) => {
                self.set(RunState::Busy(BusyPhase::Running))
            }
            _ => None,
        }
    }

    /// An `ErrorAcknowledge` was accepted.
    pub fn error_acknowledged(&mut self) -> Option<RunState> {
        match self.state {
            RunState::InError(_) => self.set(RunState::Idle),
            _ => None,
        }
    }

    /// Forget everything (new connection).
    pub fn reset(&mut self) -> Option<RunState> {
        self.set(RunState::Idle)
    }

    fn set(&mut self, next: RunState) -> Option<RunState> {
        if self.state == next {
            return None;
        }
        Some(std::mem::replace(&mut self.state, next))
    }
}
