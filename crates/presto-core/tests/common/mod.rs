//! Scripted instrument shared by the integration scenarios.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use presto_core::{
    MockTransport, NullObserver, Presto, PrestoObserver, SessionConfig, SessionEvent,
};

/// Name attribute of an outbound `<Cmd>`; `"ESC"` for the abort payload.
pub fn command_name(message: &str) -> String {
    if message.starts_with('\u{1b}') {
        return "ESC".to_string();
    }
    message
        .split("name=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap_or_default()
        .to_string()
}

/// Mock instrument answering each command name with a scripted list of messages.
pub struct FakePresto {
    pub mock: MockTransport,
    replies: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl FakePresto {
    pub fn new() -> Self {
        let mock = MockTransport::new();
        let replies: Arc<Mutex<HashMap<String, Vec<String>>>> = Arc::new(Mutex::new(HashMap::new()));

        {
            let mut table = replies.lock().unwrap();
            table.insert(
                "Connect".into(),
                vec![
                    "<Res name=\"Connect\" ok=\"true\"><Instrument>KingFisher Presto</Instrument><Version>1.0.4</Version><Serial>PR-0042</Serial></Res>".into(),
                ],
            );
            table.insert(
                "GetStatus".into(),
                vec!["<Res name=\"GetStatus\" ok=\"true\"><Status>Idle</Status></Res>".into()],
            );
            table.insert("Rotate".into(), vec!["<Evt name=\"Ready\"/>".into()]);
            table.insert("ESC".into(), vec!["<Evt name=\"Aborted\"/>".into()]);
            table.insert("Disconnect".into(), Vec::new());
        }

        let table = Arc::clone(&replies);
        mock.on_message(move |message| {
            let name = command_name(message);
            match table.lock().unwrap().get(&name) {
                Some(scripted) => scripted.clone(),
                None => vec![format!("<Res name=\"{}\" ok=\"true\"/>", name)],
            }
        });

        Self { mock, replies }
    }

    /// Replace the messages sent in answer to `command`.
    pub fn reply(&self, command: &str, messages: &[&str]) {
        self.replies.lock().unwrap().insert(
            command.to_string(),
            messages.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn config() -> SessionConfig {
        SessionConfig {
            response_timeout_ms: 1_000,
            read_timeout_ms: 200,
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    pub fn controller(&self) -> Presto<MockTransport> {
        self.controller_with(Arc::new(NullObserver))
    }

    pub fn controller_with(&self, observer: Arc<dyn PrestoObserver>) -> Presto<MockTransport> {
        Presto::new(Arc::new(self.mock.clone()), Self::config(), observer)
    }

    /// Controller after a successful `setup`, with the sent log cleared.
    pub fn connected(&self) -> Presto<MockTransport> {
        let mut presto = self.controller();
        presto.setup(None).unwrap();
        self.mock.clear_writes();
        presto
    }

    /// Names of the commands sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.mock
            .sent_messages()
            .iter()
            .map(|m| command_name(m))
            .collect()
    }
}

/// Observer recording a short label per event.
#[derive(Default)]
pub struct RecordingObserver {
    pub seen: Mutex<Vec<String>>,
}

impl PrestoObserver for RecordingObserver {
    fn on_event(&self, event: &SessionEvent) {
        let label = match event {
            SessionEvent::RunStateChanged { to, .. } => format!("run:{}", to),
            SessionEvent::TurntableChanged(state) => format!("turntable:{}", state),
            SessionEvent::InstrumentEvent(evt) => format!("event:{}", evt.name()),
            SessionEvent::Warning { warning, .. } => format!("warning:{:?}", warning.code),
            _ => return,
        };
        self.seen.lock().unwrap().push(label);
    }
}
