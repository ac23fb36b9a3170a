//! Report framing.
//!
//! Every HID report is 64 bytes. Byte 0 holds the number of valid payload
//! bytes that follow; the rest is zero padding.
//!
//! ```text
//! +-----+----------------------+-----------------+
//! | len | payload[0..len]      | 00 .. 00        |
//! +-----+----------------------+-----------------+
//!   1      len (1..=63)          63 - len
//! ```
//!
//! Messages are line-feed terminated text and may span any number of reports.

use bytes::{Buf, BytesMut};

use super::traits::TransportError;
use crate::protocol::constants::{MAX_REPORT_PAYLOAD, MESSAGE_TERMINATOR, REPORT_SIZE};

/// Split a message into output reports, appending the terminator if missing.
pub fn frame_message(message: &[u8]) -> Vec<[u8; REPORT_SIZE]> {
    let mut payload = message.to_vec();
    if payload.last() != Some(&MESSAGE_TERMINATOR) {
        payload.push(MESSAGE_TERMINATOR);
    }

    payload
        .chunks(MAX_REPORT_PAYLOAD)
        .map(|chunk| {
            let mut report = [0u8; REPORT_SIZE];
            report[0] = chunk.len() as u8;
            report[1..=chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

/// Extract the payload of one input report.
///
/// Bytes past the declared length are ignored. A declared length above 63, or
/// above what was actually received, means the stream is corrupt.
pub fn report_payload(report: &[u8]) -> Result<&[u8], TransportError> {
    let Some((&declared, rest)) = report.split_first() else {
        return Ok(&[]);
    };
    let declared = declared as usize;
    if declared > MAX_REPORT_PAYLOAD || declared > rest.len() {
        return Err(TransportError::MalformedReport {
            declared,
            available: rest.len(),
        });
    }
    Ok(&rest[..declared])
}

/// Reassembles input reports into complete messages.
#[derive(Debug, Default)]
pub struct Deframer {
    buffer: BytesMut,
}

impl Deframer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Feed one report; returns every message it completed, terminators included.
    pub fn push_report(&mut self, report: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        let payload = report_payload(report)?;
        Ok(self.push_bytes(payload))
    }

    /// Feed raw payload bytes.
    pub fn push_bytes(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(payload);

        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == MESSAGE_TERMINATOR) {
            messages.push(self.buffer.split_to(pos + 1).to_vec());
        }
        messages
    }

    /// Whether a message has been started but not terminated.
    pub fn has_partial(&self) -> bool {
        self.buffer.has_remaining()
    }

    /// Number of buffered bytes not yet part of a complete message.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any partially accumulated message.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reassemble(reports: &[[u8; REPORT_SIZE]]) -> Vec<Vec<u8>> {
        let mut deframer = Deframer::new();
        let mut out = Vec::new();
        for report in reports {
            out.extend(deframer.push_report(report).unwrap());
        }
        assert!(!deframer.has_partial());
        out
    }

    #[test]
    fn test_short_message_single_report() {
        let reports = frame_message(b"<Cmd name=\"GetStatus\"/>");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0][0], 24);
        assert_eq!(&reports[0][1..25], b"<Cmd name=\"GetStatus\"/>\n");
        assert!(reports[0][25..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_terminator_not_doubled() {
        let reports = frame_message(b"abc\n");
        assert_eq!(reports[0][0], 4);
        assert_eq!(&reports[0][1..5], b"abc\n");
    }

    #[test]
    fn test_exact_multiple_of_payload_size() {
        // 62 bytes + LF = 63, fits one report exactly.
        let msg = vec![b'x'; 62];
        let reports = frame_message(&msg);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0][0], 63);

        // 63 bytes + LF spills the terminator into a second report.
        let msg = vec![b'x'; 63];
        let reports = frame_message(&msg);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1][0], 1);
        assert_eq!(reports[1][1], b'\n');
    }

    #[test]
    fn test_two_messages_boundary_mid_report() {
        let mut stream = b"<Res name=\"Connect\" ok=\"true\"/>\n".to_vec();
        stream.extend_from_slice(b"<Evt name=\"LoadPlate\" plate=\"A\"/>\n");

        // Re-chunk the combined stream so one report carries both the end of
        // the first message and the start of the second.
        let mut deframer = Deframer::new();
        let mut messages = Vec::new();
        for chunk in stream.chunks(20) {
            let mut report = [0u8; REPORT_SIZE];
            report[0] = chunk.len() as u8;
            report[1..=chunk.len()].copy_from_slice(chunk);
            messages.extend(deframer.push_report(&report).unwrap());
        }

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], b"<Res name=\"Connect\" ok=\"true\"/>\n");
        assert_eq!(messages[1], b"<Evt name=\"LoadPlate\" plate=\"A\"/>\n");
    }

    #[test]
    fn test_terminator_alone_in_last_report() {
        let mut deframer = Deframer::new();
        assert!(deframer.push_bytes(b"<Evt name=\"Ready\"/>").is_empty());
        assert!(deframer.has_partial());
        let messages = deframer.push_bytes(b"\n");
        assert_eq!(messages, vec![b"<Evt name=\"Ready\"/>\n".to_vec()]);
        assert!(!deframer.has_partial());
    }

    #[test]
    fn test_oversized_length_is_malformed() {
        let mut report = [0u8; REPORT_SIZE];
        report[0] = 64;
        let mut deframer = Deframer::new();
        let err = deframer.push_report(&report).unwrap_err();
        assert!(matches!(
            err,
            TransportError::MalformedReport { declared: 64, .. }
        ));
    }

    #[test]
    fn test_short_read_is_malformed() {
        let err = report_payload(&[10, b'a', b'b']).unwrap_err();
        assert!(matches!(
            err,
            TransportError::MalformedReport {
                declared: 10,
                available: 2
            }
        ));
    }

    #[test]
    fn test_empty_report_is_skipped() {
        let mut deframer = Deframer::new();
        assert!(deframer.push_report(&[0u8; REPORT_SIZE]).unwrap().is_empty());
        assert!(deframer.push_report(&[]).unwrap().is_empty());
        assert!(!deframer.has_partial());
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut deframer = Deframer::new();
        deframer.push_bytes(b"<Res name=");
        assert_eq!(deframer.pending_len(), 10);
        deframer.reset();
        assert!(!deframer.has_partial());
        let messages = deframer.push_bytes(b"<Evt name=\"Ready\"/>\n");
        assert_eq!(messages, vec![b"<Evt name=\"Ready\"/>\n".to_vec()]);
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(body in proptest::collection::vec(any::<u8>().prop_filter("no LF", |b| *b != b'\n'), 0..10_000)) {
            let reports = frame_message(&body);
            prop_assert!(reports.iter().all(|r| (1..=63).contains(&(r[0] as usize))));
            let messages = reassemble(&reports);
            let mut expected = body.clone();
            expected.push(b'\n');
            prop_assert_eq!(messages, vec![expected]);
        }

        #[test]
        fn prop_two_messages_stay_ordered(
            a in proptest::collection::vec(b'a'..=b'z', 1..500),
            b in proptest::collection::vec(b'A'..=b'Z', 1..500),
        ) {
            let mut reports = frame_message(&a);
            reports.extend(frame_message(&b));
            let messages = reassemble(&reports);
            prop_assert_eq!(messages.len(), 2);
            prop_assert_eq!(&messages[0][..a.len()], &a[..]);
            prop_assert_eq!(&messages[1][..b.len()], &b[..]);
        }
    }
}
