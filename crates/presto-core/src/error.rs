//! Crate-level error type.

use thiserror::Error;

use crate::bdz::BdzError;
use crate::protocol::{CodecError, InstrumentError};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum PrestoError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    /// Caller misuse detected locally; nothing was sent to the instrument.
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Container format error: {0}")]
    Format(#[from] BdzError),
}

impl PrestoError {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        PrestoError::Usage(message.into())
    }

    /// Instrument error code, if this error came from the instrument.
    pub fn instrument_code(&self) -> Option<u32> {
        match self {
            PrestoError::Instrument(err) => err.code,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PrestoError>;
