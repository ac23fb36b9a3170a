//! KingFisher Presto message protocol.
//!
//! Commands, responses and events are single XML elements, one per line.

pub mod command;
pub mod constants;
pub mod element;
pub mod error_codes;
pub mod message;

pub use command::Command;
pub use constants::*;
pub use element::{CodecError, Element};
pub use error_codes::{InstrumentError, InstrumentWarning, error_description, warning_description};
pub use message::{
    AckKind, Event, InstrumentInfo, InstrumentStatus, Message, ProtocolData, ProtocolDuration,
    ProtocolList, Response, ResponsePayload, StatusReport, StepDuration, TimeLeft, TipDuration,
};
