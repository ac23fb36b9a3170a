//! nusb-based HID transport implementation.
//!
//! Talks to the instrument's HID interface directly through interrupt
//! endpoints, and sends feature reports as HID class `SET_REPORT` requests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nusb::descriptors::TransferType;
use nusb::transfer::{
    Buffer, ControlOut, ControlType, Direction, In, Interrupt, Out, Recipient, TransferError,
};
use nusb::{Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{HidTransport, TransportError};
use crate::protocol::constants::{
    CONTROL_TIMEOUT_MS, HID_INTERFACE, HID_REPORT_TYPE_FEATURE, HID_REPORT_TYPE_OUTPUT,
    HID_SET_REPORT, KINGFISHER_PRODUCT_ID, KINGFISHER_VENDOR_ID, REPORT_SIZE,
};

/// nusb-based HID transport.
///
/// The claimed interface and its endpoints are held until [`release`], after
/// which every call fails with `Disconnected`.
///
/// [`release`]: HidTransport::release
pub struct NusbTransport {
    interface: Mutex<Option<Interface>>,
    in_endpoint: Mutex<Option<Endpoint<Interrupt, In>>>,
    out_endpoint: Mutex<Option<Endpoint<Interrupt, Out>>>,
    /// False on devices that take output reports on the control pipe only.
    has_out_endpoint: bool,
    connected: AtomicBool,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first attached KingFisher Presto.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        Self::open_with_ids(KINGFISHER_VENDOR_ID, KINGFISHER_PRODUCT_ID, None)
    }

    /// Open a device with specific VID/PID, optionally matching a serial number.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(
        vid: u16,
        pid: u16,
        serial_number: Option<&str>,
    ) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(|d| d.vendor_id() == vid && d.product_id() == pid)
            .find(|d| match serial_number {
                Some(wanted) => d.serial_number() == Some(wanted),
                None => true,
            })
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            serial = device_info.serial_number().unwrap_or("-"),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // The OS HID driver usually owns the interface; take it over.
        let interface = device
            .detach_and_claim_interface(HID_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: HID_INTERFACE,
                message: e.to_string(),
            })?;

        let mut in_address: Option<u8> = None;
        let mut out_address: Option<u8> = None;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != HID_INTERFACE {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() != TransferType::Interrupt {
                            continue;
                        }
                        match ep.direction() {
                            Direction::In => in_address = in_address.or(Some(ep.address())),
                            Direction::Out => out_address = out_address.or(Some(ep.address())),
                        }
                    }
                }
            }
        }

        let in_address = in_address.ok_or(TransportError::NoInputEndpoint)?;

        let in_endpoint = interface
            .endpoint::<Interrupt, In>(in_address)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let out_endpoint = match out_address {
            Some(address) => Some(
                interface
                    .endpoint::<Interrupt, Out>(address)
                    .map_err(|e| TransportError::OpenFailed(e.to_string()))?,
            ),
            None => {
                warn!("No interrupt OUT endpoint, output reports go through SET_REPORT");
                None
            }
        };

        info!(
            in_ep = %format!("0x{:02X}", in_address),
            out_ep = %out_address.map_or("control".to_string(), |a| format!("0x{:02X}", a)),
            "Device opened successfully"
        );

        Ok(Self {
            interface: Mutex::new(Some(interface)),
            in_endpoint: Mutex::new(Some(in_endpoint)),
            has_out_endpoint: out_endpoint.is_some(),
            out_endpoint: Mutex::new(out_endpoint),
            connected: AtomicBool::new(true),
            vid,
            pid,
        })
    }

    fn set_report(&self, report_type: u16, data: &[u8]) -> Result<(), TransportError> {
        let interface = self
            .interface
            .lock()
            .map_err(|_| TransportError::WriteFailed("interface lock poisoned".into()))?
            .clone()
            .ok_or(TransportError::Disconnected)?;
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: HID_SET_REPORT,
                    // Report ID 0 in the low byte.
                    value: report_type << 8,
                    index: u16::from(HID_INTERFACE),
                    data,
                },
                Duration::from_millis(CONTROL_TIMEOUT_MS),
            )
            .wait()
            .map_err(|e| match e {
                TransferError::Disconnected => {
                    self.connected.store(false, Ordering::SeqCst);
                    TransportError::Disconnected
                }
                other if report_type == HID_REPORT_TYPE_FEATURE => {
                    TransportError::FeatureReportFailed(other.to_string())
                }
                other => TransportError::WriteFailed(other.to_string()),
            })
    }

    fn map_transfer_error(&self, err: TransferError, write: bool) -> TransportError {
        if matches!(err, TransferError::Disconnected) {
            self.connected.store(false, Ordering::SeqCst);
            return TransportError::Disconnected;
        }
        if write {
            TransportError::WriteFailed(err.to_string())
        } else {
            TransportError::ReadFailed(err.to_string())
        }
    }
}

impl HidTransport for NusbTransport {
    #[instrument(skip(self, report), fields(len = report.len()))]
    fn write_report(&self, report: &[u8]) -> Result<(), TransportError> {
        if !self.has_out_endpoint {
            return self.set_report(HID_REPORT_TYPE_OUTPUT, report);
        }

        let mut guard = self
            .out_endpoint
            .lock()
            .map_err(|_| TransportError::WriteFailed("endpoint lock poisoned".into()))?;
        let ep = guard.as_mut().ok_or(TransportError::Disconnected)?;
        let mut buffer = Buffer::new(REPORT_SIZE);
        buffer.extend_from_slice(report);
        ep.submit(buffer);

        let timeout = Duration::from_millis(CONTROL_TIMEOUT_MS);
        let completion = ep.wait_next_complete(timeout).ok_or_else(|| {
            ep.cancel_all();
            TransportError::timeout(timeout)
        })?;
        completion
            .status
            .map_err(|e| self.map_transfer_error(e, true))?;

        debug!(bytes_written = report.len(), "Report written");
        Ok(())
    }

    fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut guard = self
            .in_endpoint
            .lock()
            .map_err(|_| TransportError::ReadFailed("endpoint lock poisoned".into()))?;
        let ep = guard.as_mut().ok_or(TransportError::Disconnected)?;

        // A transfer left over from a timed-out read is still queued; reuse it.
        if ep.pending() == 0 {
            let buffer = ep.allocate(REPORT_SIZE);
            ep.submit(buffer);
        }

        let completion = ep
            .wait_next_complete(timeout)
            .ok_or_else(|| TransportError::timeout(timeout))?;
        completion
            .status
            .map_err(|e| self.map_transfer_error(e, false))?;

        let len = completion.actual_len.min(completion.buffer.len());
        Ok(completion.buffer[..len].to_vec())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn send_feature_report(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.set_report(HID_REPORT_TYPE_FEATURE, data)?;
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop the endpoints and the interface; the kernel HID driver can then
    /// bind the device again.
    fn release(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut ep) = self.in_endpoint.lock() {
            ep.take();
        }
        if let Ok(mut ep) = self.out_endpoint.lock() {
            ep.take();
        }
        if let Ok(mut interface) = self.interface.lock() {
            if interface.take().is_some() {
                info!("Interface released");
            }
        }
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
