//! Transport layer module.

pub mod framer;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use framer::{Deframer, frame_message, report_payload};
pub use mock::MockTransport;
pub use nusb::NusbTransport;
pub use traits::{HidTransport, TransportError};
