//! Whole-file BDZ codec.
//!
//! Layout: `[header][gzip member 1][spacer][gzip member 2][trailer]`.
//! Member 1 is the Properties XML, member 2 the ExportedData XML.

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::bufread::GzDecoder;
use flate2::write::DeflateEncoder;
use tracing::{debug, warn};

use super::header::BdzHeader;
use super::spacer::BdzSpacer;
use super::BdzError;

/// Bytes following member 2 in every observed file.
pub const MEMBER2_TRAILER: [u8; 8] = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// gzip header written by the authoring software: deflate, no flags,
/// mtime 0, xfl 4, OS 0.
const GZIP_HEADER: [u8; 10] = [0x1F, 0x8B, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00];

/// Decoded contents of a BDZ file.
pub type BdzParts = (BdzHeader, BdzSpacer, Vec<u8>, Vec<u8>);

/// Decode a BDZ file into header, spacer and both XML members.
pub fn read(data: &[u8]) -> Result<BdzParts, BdzError> {
    let header = BdzHeader::from_bytes(data)?;
    let payload = &data[BdzHeader::SIZE..];

    let block1_len = usize::from(header.block1_size());
    let needed = block1_len + BdzSpacer::SIZE;
    if payload.len() < needed {
        return Err(BdzError::Truncated {
            needed: BdzHeader::SIZE + needed,
            available: data.len(),
        });
    }

    let (xml1, rest) = gunzip(&payload[..block1_len], 1)?;
    if !rest.is_empty() {
        return Err(BdzError::TrailingBytes {
            member: 1,
            count: rest.len(),
        });
    }

    let spacer = BdzSpacer::from_bytes(&payload[block1_len..needed])?;

    let block2 = &payload[needed..];
    let (xml2, rest) = gunzip(block2, 2)?;
    if !rest.is_empty() && rest != MEMBER2_TRAILER {
        return Err(BdzError::TrailingBytes {
            member: 2,
            count: rest.len(),
        });
    }

    let expected = (needed + block2.len()).saturating_sub(2);
    if usize::try_from(header.payload_size_minus_2()).ok() != Some(expected) {
        warn!(
            recorded = header.payload_size_minus_2(),
            actual = expected,
            "BDZ header payload size does not match file"
        );
    }
    if !spacer.matches_block2_len(block2.len()) {
        debug!(suffix = spacer.suffix, block2_len = block2.len(), "Unusual spacer word");
    }

    Ok((header, spacer, xml1, xml2))
}

/// Encode a BDZ file. The header's size fields are recomputed; the spacer is
/// written as given.
pub fn write(
    header: &BdzHeader,
    spacer: &BdzSpacer,
    properties_xml: &[u8],
    exported_data_xml: &[u8],
) -> Result<Vec<u8>, BdzError> {
    let block1 = gzip(properties_xml)?;
    let block2 = member2(exported_data_xml)?;
    assemble(header, spacer, &block1, &block2)
}

fn member2(xml: &[u8]) -> Result<Vec<u8>, BdzError> {
    let mut block = gzip(xml)?;
    block.extend_from_slice(&MEMBER2_TRAILER);
    Ok(block)
}

fn assemble(
    header: &BdzHeader,
    spacer: &BdzSpacer,
    block1: &[u8],
    block2: &[u8],
) -> Result<Vec<u8>, BdzError> {
    let header = header.with_sizes(block1.len(), block2.len())?;
    let mut out =
        Vec::with_capacity(BdzHeader::SIZE + block1.len() + BdzSpacer::SIZE + block2.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(block1);
    out.extend_from_slice(&spacer.to_bytes());
    out.extend_from_slice(block2);
    Ok(out)
}

/// Single gzip member with the fixed header.
fn gzip(data: &[u8]) -> Result<Vec<u8>, BdzError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    let body = encoder.finish()?;

    let mut crc = flate2::Crc::new();
    crc.update(data);

    let mut out = Vec::with_capacity(GZIP_HEADER.len() + body.len() + 8);
    out.extend_from_slice(&GZIP_HEADER);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.sum().to_le_bytes());
    out.extend_from_slice(&crc.amount().to_le_bytes());
    Ok(out)
}

/// Decompress one gzip member; returns the data and the unread remainder.
fn gunzip(member: &[u8], index: u8) -> Result<(Vec<u8>, &[u8]), BdzError> {
    let mut decoder = GzDecoder::new(member);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|source| BdzError::Decompress {
            member: index,
            source,
        })?;
    Ok((out, decoder.into_inner()))
}

/// A BDZ protocol file.
///
/// A file read from bytes serializes back to exactly those bytes until one
/// of its members is replaced. After that, `to_bytes` recompresses both
/// members and derives the spacer word from the new member 2 length.
#[derive(Debug, Clone)]
pub struct BdzFile {
    header: BdzHeader,
    spacer: BdzSpacer,
    properties: Vec<u8>,
    exported_data: Vec<u8>,
    original: Option<Vec<u8>>,
}

impl BdzFile {
    /// New file from its two XML documents.
    pub fn new(header: BdzHeader, properties_xml: Vec<u8>, exported_data_xml: Vec<u8>) -> Self {
        Self {
            header,
            spacer: BdzSpacer::default(),
            properties: properties_xml,
            exported_data: exported_data_xml,
            original: None,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, BdzError> {
        let (header, spacer, properties, exported_data) = read(data)?;
        Ok(Self {
            header,
            spacer,
            properties,
            exported_data,
            original: Some(data.to_vec()),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BdzError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), BdzError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BdzError> {
        if let Some(original) = &self.original {
            return Ok(original.clone());
        }
        let block1 = gzip(&self.properties)?;
        let block2 = member2(&self.exported_data)?;
        let spacer = BdzSpacer {
            prefix: self.spacer.prefix,
            ..BdzSpacer::for_block2_len(block2.len())
        };
        assemble(&self.header, &spacer, &block1, &block2)
    }

    pub fn header(&self) -> &BdzHeader {
        &self.header
    }

    /// Spacer as read from the file (default for new files).
    pub fn spacer(&self) -> &BdzSpacer {
        &self.spacer
    }

    pub fn properties_xml(&self) -> &[u8] {
        &self.properties
    }

    pub fn exported_data_xml(&self) -> &[u8] {
        &self.exported_data
    }

    pub fn set_properties_xml(&mut self, xml: Vec<u8>) {
        self.properties = xml;
        self.original = None;
    }

    pub fn set_exported_data_xml(&mut self, xml: Vec<u8>) {
        self.exported_data = xml;
        self.original = None;
    }

    /// Whether `to_bytes` returns the bytes the file was read from.
    pub fn is_unmodified(&self) -> bool {
        self.original.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PROPERTIES: &[u8] = b"<Properties><Name>Demo</Name><Instrument>KingFisher Presto</Instrument></Properties>";
    const EXPORTED: &[u8] = b"<ExportedData><Protocol name=\"Demo\"><Tip name=\"T1\"><Steps><Mix name=\"Mix1\"/></Steps></Tip></Protocol></ExportedData>";

    /// Deterministic incompressible bytes.
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    /// File laid out like one from another compressor (fast level).
    fn foreign_file() -> Vec<u8> {
        let compress = |data: &[u8]| {
            let mut encoder = flate2::GzBuilder::new()
                .mtime(0)
                .operating_system(0)
                .write(Vec::new(), Compression::fast());
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        };
        let block1 = compress(PROPERTIES);
        let mut block2 = compress(EXPORTED);
        block2.extend_from_slice(&MEMBER2_TRAILER);
        assemble(
            &BdzHeader::default(),
            &BdzSpacer::for_block2_len(block2.len()),
            &block1,
            &block2,
        )
        .unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let spacer = BdzSpacer {
            prefix: [0x01, 0x00, 0x00, 0x01],
            suffix: 0xDEAD_BEEF,
        };
        let bytes = write(&BdzHeader::default(), &spacer, PROPERTIES, EXPORTED).unwrap();
        assert_eq!(&bytes[BdzHeader::SIZE..BdzHeader::SIZE + 10], &GZIP_HEADER);
        assert!(bytes.ends_with(&MEMBER2_TRAILER));

        let (header, read_spacer, xml1, xml2) = read(&bytes).unwrap();
        assert_eq!(read_spacer, spacer);
        assert_eq!(xml1, PROPERTIES);
        assert_eq!(xml2, EXPORTED);

        let block1 = usize::from(header.block1_size());
        assert_eq!(
            header.payload_size_minus_2() as usize,
            bytes.len() - BdzHeader::SIZE - 2
        );
        assert_eq!(&bytes[BdzHeader::SIZE + block1..][..4], &spacer.prefix);
    }

    proptest! {
        #[test]
        fn test_write_read_preserves_members_and_sizes(
            xml1 in prop::collection::vec(any::<u8>(), 0..2000),
            xml2 in prop::collection::vec(any::<u8>(), 0..2000),
            prefix in any::<[u8; 4]>(),
            suffix in any::<u32>(),
        ) {
            let spacer = BdzSpacer { prefix, suffix };
            let bytes = write(&BdzHeader::default(), &spacer, &xml1, &xml2).unwrap();
            let (header, read_spacer, read1, read2) = read(&bytes).unwrap();

            prop_assert_eq!(read_spacer, spacer);
            prop_assert_eq!(read1, xml1);
            prop_assert_eq!(read2, xml2);

            let block1_len = usize::from(header.block1_size());
            let block2_len = bytes.len() - BdzHeader::SIZE - block1_len - BdzSpacer::SIZE;
            prop_assert_eq!(
                header,
                BdzHeader::default().with_sizes(block1_len, block2_len).unwrap()
            );
        }
    }

    #[test]
    fn test_read_write_read_is_stable() {
        let first = write(&BdzHeader::default(), &BdzSpacer::default(), PROPERTIES, EXPORTED).unwrap();
        let parts = read(&first).unwrap();
        let second = write(&parts.0, &parts.1, &parts.2, &parts.3).unwrap();
        assert_eq!(second, first);
        assert_eq!(read(&second).unwrap(), parts);
    }

    #[test]
    fn test_unmodified_file_is_byte_exact() {
        let original = foreign_file();
        let file = BdzFile::from_bytes(&original).unwrap();
        assert!(file.is_unmodified());
        assert_eq!(file.properties_xml(), PROPERTIES);
        assert_eq!(file.to_bytes().unwrap(), original);
    }

    #[test]
    fn test_modified_file_recomputes_spacer() {
        let mut file = BdzFile::from_bytes(&foreign_file()).unwrap();
        file.set_exported_data_xml(b"<ExportedData/>".to_vec());
        assert!(!file.is_unmodified());

        let bytes = file.to_bytes().unwrap();
        let (header, spacer, xml1, xml2) = read(&bytes).unwrap();
        assert_eq!(xml1, PROPERTIES);
        assert_eq!(xml2, b"<ExportedData/>");

        let block2_len = bytes.len() - BdzHeader::SIZE - usize::from(header.block1_size()) - 8;
        assert!(spacer.matches_block2_len(block2_len));
    }

    #[test]
    fn test_new_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.bdz");

        let file = BdzFile::new(BdzHeader::default(), PROPERTIES.to_vec(), EXPORTED.to_vec());
        file.save(&path).unwrap();

        let loaded = BdzFile::load(&path).unwrap();
        assert_eq!(loaded.exported_data_xml(), EXPORTED);
        assert_eq!(loaded.header().product_name(), "BindIt Software");
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = write(&BdzHeader::default(), &BdzSpacer::default(), PROPERTIES, EXPORTED).unwrap();
        bytes.extend_from_slice(b"junk");
        assert!(matches!(
            read(&bytes),
            Err(BdzError::TrailingBytes { member: 2, count: 12 })
        ));
    }

    #[test]
    fn test_rejects_truncated_and_corrupt() {
        let bytes = write(&BdzHeader::default(), &BdzSpacer::default(), PROPERTIES, EXPORTED).unwrap();
        let block1 = usize::from(BdzHeader::from_bytes(&bytes).unwrap().block1_size());

        assert!(matches!(
            read(&bytes[..BdzHeader::SIZE + block1]),
            Err(BdzError::Truncated { .. })
        ));

        let mut corrupt = bytes.clone();
        corrupt[BdzHeader::SIZE + 12] ^= 0xFF;
        corrupt[BdzHeader::SIZE + 13] ^= 0xFF;
        assert!(read(&corrupt).is_err());
    }

    #[test]
    fn test_member_too_large() {
        let result = write(&BdzHeader::default(), &BdzSpacer::default(), &noise(70_000), EXPORTED);
        assert!(matches!(result, Err(BdzError::MemberTooLarge { member: 1, .. })));
    }
}
