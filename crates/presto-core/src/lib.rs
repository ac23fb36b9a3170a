//! presto-core: KingFisher Presto USB HID client in Rust.
//!
//! This crate talks to a KingFisher Presto magnetic-particle processor over
//! its HID interface, and reads and writes the BindIt `.bdz` protocol files
//! the instrument stores.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: HID report I/O (nusb, mock) and report framing
//! - **Protocol**: XML element codec, typed commands, responses and events
//! - **Session**: Read thread, one in-flight command, event queue, abort
//! - **State**: Run state, turntable placement and the `Presto` controller
//! - **Events**: Observer pattern for UI decoupling
//! - **BDZ**: Protocol-file container codec
//!
//! # Example
//!
//! ```no_run
//! use presto_core::{Presto, SessionConfig};
//!
//! let mut presto = Presto::open_device(SessionConfig::default())?;
//! presto.setup(None)?;
//! presto.start_protocol("Demo", None, None)?;
//! loop {
//!     let run_event = presto.next_event()?;
//!     println!("{}", run_event.event.name());
//!     let terminal = run_event.is_terminal();
//!     if let Some(ack) = run_event.acknowledgement {
//!         presto.send_acknowledgement(ack)?;
//!     }
//!     if terminal {
//!         break;
//!     }
//! }
//! presto.stop();
//! # Ok::<(), presto_core::PrestoError>(())
//! ```

pub mod bdz;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use bdz::{BdzError, BdzFile, BdzHeader, BdzSpacer};
pub use error::{PrestoError, Result};
pub use events::{NullObserver, PacketDirection, PrestoObserver, SessionEvent, TracingObserver};
pub use protocol::{
    AckKind, Command, Event, InstrumentError, InstrumentStatus, Message, Response,
    ResponsePayload,
};
pub use session::{PrestoSession, SessionConfig};
pub use state::{
    AckTarget, Acknowledgement, BusyPhase, Location, Presto, RunEvent, RunState, Slot,
    TurntableState,
};
pub use transport::{HidTransport, MockTransport, NusbTransport, TransportError};
