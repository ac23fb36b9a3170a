//! The 8-byte record between the two compressed members.

use byteorder::{ByteOrder, LittleEndian};

use super::BdzError;

/// First four bytes of every spacer seen so far.
pub const SPACER_PREFIX: [u8; 4] = [0x01, 0x00, 0x00, 0x01];

/// `suffix == block2_len - SPACER_SUFFIX_OFFSET` in every observed file.
/// The meaning of the word is unknown.
pub const SPACER_SUFFIX_OFFSET: usize = 65;

/// Spacer record. Read files keep theirs verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdzSpacer {
    pub prefix: [u8; 4],
    pub suffix: u32,
}

impl Default for BdzSpacer {
    fn default() -> Self {
        Self {
            prefix: SPACER_PREFIX,
            suffix: 0,
        }
    }
}

impl BdzSpacer {
    pub const SIZE: usize = 8;

    pub fn from_bytes(data: &[u8]) -> Result<Self, BdzError> {
        if data.len() < Self::SIZE {
            return Err(BdzError::Truncated {
                needed: Self::SIZE,
                available: data.len(),
            });
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&data[..4]);
        Ok(Self {
            prefix,
            suffix: LittleEndian::read_u32(&data[4..Self::SIZE]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.prefix);
        LittleEndian::write_u32(&mut out[4..], self.suffix);
        out
    }

    /// Spacer following the observed relation for a member 2 of `block2_len`
    /// bytes (trailer included).
    pub fn for_block2_len(block2_len: usize) -> Self {
        let suffix = block2_len.saturating_sub(SPACER_SUFFIX_OFFSET);
        Self {
            prefix: SPACER_PREFIX,
            suffix: u32::try_from(suffix).unwrap_or(u32::MAX),
        }
    }

    /// Whether the suffix follows the observed relation.
    pub fn matches_block2_len(&self, block2_len: usize) -> bool {
        *self == Self::for_block2_len(block2_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spacer_bytes() {
        let spacer = BdzSpacer::for_block2_len(1065);
        assert_eq!(spacer.to_bytes(), [0x01, 0x00, 0x00, 0x01, 0xE8, 0x03, 0x00, 0x00]);
        assert_eq!(BdzSpacer::from_bytes(&spacer.to_bytes()).unwrap(), spacer);
        assert!(spacer.matches_block2_len(1065));
        assert!(!spacer.matches_block2_len(1066));
    }

    #[test]
    fn test_spacer_never_underflows() {
        assert_eq!(BdzSpacer::for_block2_len(10).suffix, 0);
    }

    #[test]
    fn test_spacer_truncated() {
        assert!(matches!(
            BdzSpacer::from_bytes(&[1, 0, 0]),
            Err(BdzError::Truncated { needed: 8, available: 3 })
        ));
    }
}
