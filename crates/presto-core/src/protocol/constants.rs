//! Protocol constants for the KingFisher Presto HID interface.

// ============================================================================
// Device Identification
// ============================================================================

/// Thermo Fisher Scientific vendor ID used by the Presto.
pub const KINGFISHER_VENDOR_ID: u16 = 0x0AB6;

/// KingFisher Presto product ID.
pub const KINGFISHER_PRODUCT_ID: u16 = 0x02C9;

/// HID interface carrying the command channel.
pub const HID_INTERFACE: u8 = 0;

// ============================================================================
// Report Framing
// ============================================================================

/// Size of every input/output report.
pub const REPORT_SIZE: usize = 64;

/// Payload bytes per report (byte 0 is the length).
pub const MAX_REPORT_PAYLOAD: usize = REPORT_SIZE - 1;

/// Command terminator (ASCII LF).
pub const MESSAGE_TERMINATOR: u8 = b'\n';

/// Largest command text the codec will produce.
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

/// Largest inbound message assembled from several lines before it is dropped.
pub const MAX_INBOUND_MESSAGE_LEN: usize = 4 * 1024 * 1024;

// ============================================================================
// Abort / Flow Control
// ============================================================================

/// Feature report for Abort: first byte nonzero, second zero.
pub const ABORT_FEATURE_REPORT: [u8; 2] = [0x01, 0x00];

/// Abort character (ESC) followed by the terminator, sent through the report stream.
pub const ABORT_PAYLOAD: [u8; 2] = [0x1B, MESSAGE_TERMINATOR];

/// HID class request SET_REPORT.
pub const HID_SET_REPORT: u8 = 0x09;

/// Report type "Feature" in the high byte of wValue.
pub const HID_REPORT_TYPE_FEATURE: u16 = 0x03;

/// Report type "Output" in the high byte of wValue.
pub const HID_REPORT_TYPE_OUTPUT: u16 = 0x02;

// ============================================================================
// Timing
// ============================================================================

/// Time to wait for a `Res` after sending a command.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 30_000;

/// Time without progress after which a partial message is dropped.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;

/// Read poll granularity of the background reader.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Control transfer timeout.
pub const CONTROL_TIMEOUT_MS: u64 = 1_000;

// ============================================================================
// Message Roots
// ============================================================================

pub const ROOT_COMMAND: &str = "Cmd";
pub const ROOT_RESPONSE: &str = "Res";
pub const ROOT_EVENT: &str = "Evt";

// ============================================================================
// Turntable
// ============================================================================

/// `Rotate@position` value for the processing position.
pub const ROTATE_POSITION_PROCESSING: u8 = 1;

/// `Rotate@position` value for the loading position.
pub const ROTATE_POSITION_LOADING: u8 = 2;
