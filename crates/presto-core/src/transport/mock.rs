//! Mock HID transport for testing.
//!
//! Inbound reports are queued on a channel so `read_report` blocks with a real
//! timeout, the way a device read does. Outbound reports are logged and
//! reassembled into messages; an optional responder turns each complete
//! outbound message into scripted replies.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use super::framer::{Deframer, frame_message};
use super::traits::{HidTransport, TransportError};
use crate::protocol::constants::{
    KINGFISHER_PRODUCT_ID, KINGFISHER_VENDOR_ID, MESSAGE_TERMINATOR, REPORT_SIZE,
};

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

/// Mock transport for exercising the session and controller without hardware.
///
/// Clones share all state, so a test can keep a handle after moving the
/// transport into a session.
#[derive(Clone)]
pub struct MockTransport {
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    /// Captured output reports.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Outbound messages reassembled from the output reports.
    outbound: Arc<Mutex<Deframer>>,
    sent: Arc<Mutex<Vec<String>>>,
    feature_log: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_feature_reports: Arc<Mutex<bool>>,
    responder: Arc<Mutex<Option<Responder>>>,
    connected: Arc<Mutex<bool>>,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            write_log: Arc::new(Mutex::new(Vec::new())),
            outbound: Arc::new(Mutex::new(Deframer::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            feature_log: Arc::new(Mutex::new(Vec::new())),
            fail_feature_reports: Arc::new(Mutex::new(false)),
            responder: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(true)),
            vid: KINGFISHER_VENDOR_ID,
            pid: KINGFISHER_PRODUCT_ID,
        }
    }

    /// Queue one raw input report.
    pub fn queue_report(&self, report: &[u8]) {
        let _ = self.inbound_tx.send(report.to_vec());
    }

    /// Queue arbitrary bytes, framed into reports, without adding a terminator.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        for report in frame_message(bytes) {
            self.queue_report(&report);
        }
    }

    /// Queue one inbound message; the terminator is appended when missing.
    pub fn queue_message(&self, text: &str) {
        let mut bytes = text.as_bytes().to_vec();
        if bytes.last() != Some(&MESSAGE_TERMINATOR) {
            bytes.push(MESSAGE_TERMINATOR);
        }
        self.queue_bytes(&bytes);
    }

    /// Install a responder called with every complete outbound message
    /// (terminator stripped). Each returned string is queued as a reply.
    pub fn on_message<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Get all captured output reports.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Outbound messages in send order, terminator stripped.
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Clear captured writes and messages.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
        self.sent.lock().unwrap().clear();
    }

    /// Feature reports sent on the control pipe.
    pub fn feature_reports(&self) -> Vec<Vec<u8>> {
        self.feature_log.lock().unwrap().clone()
    }

    /// Make subsequent feature reports fail.
    pub fn fail_feature_reports(&self, fail: bool) {
        *self.fail_feature_reports.lock().unwrap() = fail;
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    /// Set VID/PID reported by the mock.
    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }

    fn record_outbound(&self, report: &[u8]) {
        let messages = match self.outbound.lock().unwrap().push_report(report) {
            Ok(messages) => messages,
            Err(_) => return,
        };

        for message in messages {
            let text = String::from_utf8_lossy(&message);
            let text = text.trim_end_matches(MESSAGE_TERMINATOR as char).to_string();
            self.sent.lock().unwrap().push(text.clone());

            let replies = match self.responder.lock().unwrap().as_mut() {
                Some(respond) => respond(&text),
                None => Vec::new(),
            };
            for reply in replies {
                self.queue_message(&reply);
            }
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HidTransport for MockTransport {
    fn write_report(&self, report: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        if report.len() != REPORT_SIZE {
            return Err(TransportError::WriteFailed(format!(
                "report must be {} bytes, got {}",
                REPORT_SIZE,
                report.len()
            )));
        }
        self.write_log.lock().unwrap().push(report.to_vec());
        self.record_outbound(report);
        Ok(())
    }

    fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(report) => Ok(report),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        if *self.fail_feature_reports.lock().unwrap() {
            return Err(TransportError::FeatureReportFailed(
                "control transfer stalled".into(),
            ));
        }
        self.feature_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn release(&self) {
        *self.connected.lock().unwrap() = false;
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framer::report_payload;

    #[test]
    fn test_mock_queue_message() {
        let mock = MockTransport::new();
        mock.queue_message("<Evt name=\"Ready\"/>");

        let report = mock.read_report(Duration::from_millis(10)).unwrap();
        assert_eq!(report.len(), REPORT_SIZE);
        assert_eq!(report_payload(&report).unwrap(), b"<Evt name=\"Ready\"/>\n");

        // Queue is empty now
        assert!(matches!(
            mock.read_report(Duration::from_millis(10)),
            Err(TransportError::Timeout { timeout_ms: 10 })
        ));
    }

    #[test]
    fn test_mock_reassembles_outbound() {
        let mock = MockTransport::new();
        let long = format!("<Cmd name=\"X\" pad=\"{}\"/>\n", "a".repeat(100));
        for report in frame_message(long.as_bytes()) {
            mock.write_report(&report).unwrap();
        }
        assert_eq!(mock.get_writes().len(), 2);
        assert_eq!(mock.sent_messages(), vec![long.trim_end().to_string()]);
    }

    #[test]
    fn test_mock_responder() {
        let mock = MockTransport::new();
        mock.on_message(|msg| {
            if msg.contains("GetStatus") {
                vec!["<Res name=\"GetStatus\" ok=\"true\"><Status>Idle</Status></Res>".into()]
            } else {
                Vec::new()
            }
        });

        for report in frame_message(b"<Cmd name=\"GetStatus\"/>\n") {
            mock.write_report(&report).unwrap();
        }
        let report = mock.read_report(Duration::from_millis(10)).unwrap();
        assert!(
            String::from_utf8_lossy(report_payload(&report).unwrap()).starts_with("<Res")
        );
    }

    #[test]
    fn test_mock_feature_reports() {
        let mock = MockTransport::new();
        mock.send_feature_report(&[0x01, 0x00]).unwrap();
        assert_eq!(mock.feature_reports(), vec![vec![0x01, 0x00]]);

        mock.fail_feature_reports(true);
        assert!(mock.send_feature_report(&[0x01, 0x00]).is_err());
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.write_report(&[0u8; REPORT_SIZE]),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            mock.read_report(Duration::from_millis(1)),
            Err(TransportError::Disconnected)
        ));
    }
}
