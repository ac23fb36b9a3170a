//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow session traffic and state
//! changes without reading the event queue itself.

use std::fmt;

use crate::protocol::{Event, InstrumentWarning};
use crate::state::{RunState, TurntableState};

/// USB report direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the session and the controller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session opened on a device.
    DeviceOpened { vid: u16, pid: u16 },
    /// Read thread saw the device go away.
    DeviceDisconnected,
    /// HID report sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
    },
    /// Command written to the device.
    CommandSent { name: String },
    /// Response matched to the pending command.
    ResponseReceived { name: String, ok: bool },
    /// Response with no matching pending command; discarded.
    OrphanResponse { name: String },
    /// Asynchronous instrument event, in arrival order.
    InstrumentEvent(Event),
    /// Warning attached to a response.
    Warning {
        command: String,
        warning: InstrumentWarning,
    },
    /// Inbound message that could not be decoded; discarded.
    DecodeFailed { message: String },
    /// Partial message dropped after the read timeout.
    PartialMessageDiscarded { bytes: usize },
    /// Abort sequence sent.
    AbortSent,
    /// Run state transition.
    RunStateChanged { from: RunState, to: RunState },
    /// Turntable placement changed.
    TurntableChanged(TurntableState),
}

/// Observer trait for receiving session events.
///
/// Called from the session's read thread as well as the caller's thread, so
/// implementations must not block.
pub trait PrestoObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &SessionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl PrestoObserver for NullObserver {
    fn on_event(&self, _event: &SessionEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl PrestoObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::DeviceOpened { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Session opened");
            }
            SessionEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            SessionEvent::Packet { direction, length } => {
                tracing::trace!(dir = %direction, len = length, "HID report");
            }
            SessionEvent::CommandSent { name } => {
                tracing::debug!(command = %name, "Command sent");
            }
            SessionEvent::ResponseReceived { name, ok } => {
                tracing::debug!(command = %name, ok = ok, "Response received");
            }
            SessionEvent::OrphanResponse { name } => {
                tracing::warn!(command = %name, "Discarding response with no pending command");
            }
            SessionEvent::InstrumentEvent(evt) => {
                tracing::info!(event = %evt.name(), "Instrument event");
            }
            SessionEvent::Warning { command, warning } => {
                tracing::warn!(command = %command, code = ?warning.code, "Instrument warning: {}", warning);
            }
            SessionEvent::DecodeFailed { message } => {
                tracing::warn!("Discarding undecodable message: {}", message);
            }
            SessionEvent::PartialMessageDiscarded { bytes } => {
                tracing::warn!(bytes = bytes, "Partial message timed out");
            }
            SessionEvent::AbortSent => {
                tracing::info!("Abort sent");
            }
            SessionEvent::RunStateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Run state changed");
            }
            SessionEvent::TurntableChanged(state) => {
                tracing::info!(turntable = %state, "Turntable changed");
            }
        }
    }
}
