//! USB HID transport abstraction.
//!
//! Defines the `HidTransport` trait for report-level communication,
//! allowing different implementations (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No instrument with VID={vid:04X} PID={pid:04X} is attached")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Cannot open HID device: {0}")]
    OpenFailed(String),

    #[error("Cannot claim HID interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("HID interface has no interrupt IN endpoint")]
    NoInputEndpoint,

    #[error("Output report not sent: {0}")]
    WriteFailed(String),

    #[error("Input report not received: {0}")]
    ReadFailed(String),

    #[error("Feature report not sent: {0}")]
    FeatureReportFailed(String),

    #[error("Malformed report: declared length {declared}, {available} payload bytes available")]
    MalformedReport { declared: usize, available: usize },

    #[error("Device disconnected")]
    Disconnected,

    #[error("No data within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn timeout(timeout: Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Abstract HID transport interface.
///
/// Implementations move whole 64-byte reports. Framing into messages is done
/// by [`crate::transport::framer`], never by the transport itself.
///
/// The session shares one transport between the caller and its read thread,
/// so implementations must tolerate a concurrent `read_report` and
/// `write_report`.
pub trait HidTransport: Send + Sync {
    /// Write one output report (exactly 64 bytes, no report ID prefix).
    fn write_report(&self, report: &[u8]) -> Result<(), TransportError>;

    /// Read one input report.
    ///
    /// Returns `TransportError::Timeout` when nothing arrives within `timeout`.
    fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Send a feature report on the control pipe.
    fn send_feature_report(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// False once the device has gone away.
    fn is_connected(&self) -> bool;

    /// Give the device back to the operating system. Later calls fail with
    /// `Disconnected`.
    fn release(&self) {}

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}
