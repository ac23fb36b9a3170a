//! BDZ file header (61 bytes).

use std::io::{Cursor, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use super::BdzError;

/// File type magic.
pub const BDZ_MAGIC: [u8; 4] = [0xB6, 0x75, 0x1C, 0xF2];

/// Only format version seen in the field.
pub const BDZ_VERSION_FLAGS: [u8; 8] = [0x01, 0x00, 0x0A, 0x00, 0x01, 0x00, 0x00, 0x00];

const PRODUCT: &[u8; 15] = b"BindIt Software";
const PRODUCT_VERSION: &[u8; 8] = b"4.0.0.45";

/// Reserved block with both size fields zero.
const RESERVED_TEMPLATE: [u8; 18] = [
    0x0B, 0x00, 0x01, 0x00, 0x00, 0x00, // constant
    0x00, 0x00, 0x00, 0x00, // payload size - 2
    0x00, 0x00, 0x00, 0x01, // constant
    0x00, 0x00, // block 1 size
    0x00, 0x00,
];
const RESERVED_PAYLOAD_SIZE: usize = 6;
const RESERVED_BLOCK1_SIZE: usize = 14;

/// Fixed-size header at the start of every BDZ file.
///
/// The reserved block is kept byte for byte; only its two size fields are
/// ever rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BdzHeader {
    pub magic: [u8; 4],
    pub version_flags: [u8; 8],
    /// Length of the product block that follows (2 + 15 + 2 + 8).
    pub product_block_len: u32,
    pub product_len: u16,
    pub product: [u8; 15],
    pub version_len: u16,
    pub version: [u8; 8],
    pub reserved: [u8; 18],
}

impl Default for BdzHeader {
    fn default() -> Self {
        Self {
            magic: BDZ_MAGIC,
            version_flags: BDZ_VERSION_FLAGS,
            product_block_len: 27,
            product_len: PRODUCT.len() as u16,
            product: *PRODUCT,
            version_len: PRODUCT_VERSION.len() as u16,
            version: *PRODUCT_VERSION,
            reserved: RESERVED_TEMPLATE,
        }
    }
}

impl BdzHeader {
    pub const SIZE: usize = 61;

    pub fn from_bytes(data: &[u8]) -> Result<Self, BdzError> {
        if data.len() < Self::SIZE {
            return Err(BdzError::Truncated {
                needed: Self::SIZE,
                available: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if magic != BDZ_MAGIC {
            return Err(BdzError::BadMagic(magic));
        }
        let mut version_flags = [0u8; 8];
        cursor.read_exact(&mut version_flags)?;
        if version_flags != BDZ_VERSION_FLAGS {
            return Err(BdzError::BadVersion(version_flags));
        }

        let product_block_len = cursor.read_u32::<LittleEndian>()?;
        let product_len = cursor.read_u16::<LittleEndian>()?;
        let mut product = [0u8; 15];
        cursor.read_exact(&mut product)?;
        let version_len = cursor.read_u16::<LittleEndian>()?;
        let mut version = [0u8; 8];
        cursor.read_exact(&mut version)?;
        let mut reserved = [0u8; 18];
        cursor.read_exact(&mut reserved)?;

        Ok(Self {
            magic,
            version_flags,
            product_block_len,
            product_len,
            product,
            version_len,
            version,
            reserved,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&self.version_flags);
        buf.extend_from_slice(&self.product_block_len.to_le_bytes());
        buf.extend_from_slice(&self.product_len.to_le_bytes());
        buf.extend_from_slice(&self.product);
        buf.extend_from_slice(&self.version_len.to_le_bytes());
        buf.extend_from_slice(&self.version);
        buf.extend_from_slice(&self.reserved);
        buf
    }

    /// Length of the first compressed member.
    pub fn block1_size(&self) -> u16 {
        LittleEndian::read_u16(&self.reserved[RESERVED_BLOCK1_SIZE..])
    }

    /// `block1 + spacer + block2 - 2`.
    pub fn payload_size_minus_2(&self) -> u32 {
        LittleEndian::read_u32(&self.reserved[RESERVED_PAYLOAD_SIZE..])
    }

    /// Copy with the size fields set for members of the given lengths.
    /// `block2_len` includes the trailer.
    pub fn with_sizes(&self, block1_len: usize, block2_len: usize) -> Result<Self, BdzError> {
        let block1 = u16::try_from(block1_len).map_err(|_| BdzError::MemberTooLarge {
            member: 1,
            len: block1_len,
        })?;
        let payload = (block1_len + super::BdzSpacer::SIZE + block2_len)
            .checked_sub(2)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(BdzError::MemberTooLarge {
                member: 2,
                len: block2_len,
            })?;

        let mut header = self.clone();
        LittleEndian::write_u32(&mut header.reserved[RESERVED_PAYLOAD_SIZE..], payload);
        LittleEndian::write_u16(&mut header.reserved[RESERVED_BLOCK1_SIZE..], block1);
        Ok(header)
    }

    /// Product string, e.g. "BindIt Software".
    pub fn product_name(&self) -> String {
        String::from_utf8_lossy(&self.product).into_owned()
    }

    /// Authoring software version, e.g. "4.0.0.45".
    pub fn product_version(&self) -> String {
        String::from_utf8_lossy(&self.version).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_header_layout() {
        let bytes = BdzHeader::default().to_bytes();
        assert_eq!(bytes.len(), BdzHeader::SIZE);
        assert_eq!(&bytes[0..4], &BDZ_MAGIC);
        assert_eq!(&bytes[12..16], &[27, 0, 0, 0]);
        assert_eq!(&bytes[16..18], &[15, 0]);
        assert_eq!(&bytes[18..33], b"BindIt Software");
        assert_eq!(&bytes[33..35], &[8, 0]);
        assert_eq!(&bytes[35..43], b"4.0.0.45");
        assert_eq!(&bytes[43..49], &[0x0B, 0x00, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = BdzHeader::default().with_sizes(300, 1200).unwrap();
        let parsed = BdzHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.block1_size(), 300);
        assert_eq!(parsed.payload_size_minus_2(), 300 + 8 + 1200 - 2);
        assert_eq!(parsed.product_name(), "BindIt Software");
        assert_eq!(parsed.product_version(), "4.0.0.45");
    }

    #[test]
    fn test_with_sizes_keeps_other_reserved_bytes() {
        let mut header = BdzHeader::default();
        header.reserved[16] = 0xAA;
        let sized = header.with_sizes(10, 20).unwrap();
        assert_eq!(sized.reserved[16], 0xAA);
        assert_eq!(&sized.reserved[10..14], &[0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_block1_too_large() {
        assert!(matches!(
            BdzHeader::default().with_sizes(70_000, 10),
            Err(BdzError::MemberTooLarge { member: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let mut bytes = BdzHeader::default().to_bytes();
        bytes[0] = 0;
        assert!(matches!(BdzHeader::from_bytes(&bytes), Err(BdzError::BadMagic(_))));

        let mut bytes = BdzHeader::default().to_bytes();
        bytes[6] = 0x0B;
        assert!(matches!(BdzHeader::from_bytes(&bytes), Err(BdzError::BadVersion(_))));

        assert!(matches!(
            BdzHeader::from_bytes(&bytes[..20]),
            Err(BdzError::Truncated { needed: 61, available: 20 })
        ));
    }
}
