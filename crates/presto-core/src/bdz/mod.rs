//! BDZ protocol-file container.
//!
//! A BDZ file wraps two gzip-compressed XML documents (protocol properties
//! and exported protocol data) in a fixed header. The codec round-trips the
//! container; it does not interpret the XML.

pub mod container;
pub mod header;
pub mod spacer;

use thiserror::Error;

pub use container::{BdzFile, BdzParts, MEMBER2_TRAILER, read, write};
pub use header::{BDZ_MAGIC, BDZ_VERSION_FLAGS, BdzHeader};
pub use spacer::{BdzSpacer, SPACER_PREFIX};

#[derive(Error, Debug)]
pub enum BdzError {
    #[error("Not a BDZ file: magic {0:02X?}")]
    BadMagic([u8; 4]),

    #[error("Unsupported BDZ version flags {0:02X?}")]
    BadVersion([u8; 8]),

    #[error("BDZ file truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Member {member} failed to decompress: {source}")]
    Decompress {
        member: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("{count} unexpected bytes after member {member}")]
    TrailingBytes { member: u8, count: usize },

    #[error("Member {member} is too large for the header ({len} bytes)")]
    MemberTooLarge { member: u8, len: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
