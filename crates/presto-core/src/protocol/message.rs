//! Typed inbound messages.
//!
//! `<Res>` elements become [`Response`] with a [`ResponsePayload`] chosen by the
//! `name` attribute; `<Evt>` elements become [`Event`]. Names this crate does
//! not know are kept as raw elements so newer firmware does not break decoding.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::constants::{ROOT_EVENT, ROOT_RESPONSE};
use super::element::{CodecError, Element};
use super::error_codes::{InstrumentError, InstrumentWarning};

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Response),
    Event(Event),
}

impl Message {
    /// Decode one framed message (terminator optional).
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::from_element(Element::from_bytes(bytes)?)
    }

    pub fn from_element(element: Element) -> Result<Self, CodecError> {
        match element.name.as_str() {
            ROOT_RESPONSE => Ok(Message::Response(Response::from_element(element))),
            ROOT_EVENT => Ok(Message::Event(Event::from_element(&element))),
            other => Err(CodecError::UnexpectedRoot(other.to_string())),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// A `<Res>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Command name echoed by the instrument (empty if absent).
    pub name: String,
    pub ok: bool,
    pub error: Option<InstrumentError>,
    pub warning: Option<InstrumentWarning>,
    pub payload: ResponsePayload,
    /// Raw element, for fields the typed payload does not cover.
    pub element: Element,
}

impl Response {
    pub fn from_element(element: Element) -> Self {
        let name = element.attr("name").unwrap_or_default().to_string();
        let ok = element
            .attr("ok")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let error = element
            .child("Error")
            .map(|e| parse_instrument_error(e).with_source(name.as_str()));
        let warning = element.child("Warning").map(|w| InstrumentWarning {
            code: parse_code(w),
            text: w.text().map(str::to_string),
        });
        let payload = ResponsePayload::decode(&name, &element);

        Self {
            name,
            ok,
            error,
            warning,
            payload,
            element,
        }
    }

    /// Decode the payload as the answer to `command` when the echoed name is
    /// missing or differs from it.
    pub fn answering(mut self, command: &str) -> Self {
        if self.name != command {
            self.payload = ResponsePayload::decode(command, &self.element);
        }
        self
    }

    /// Turn `ok="false"` into an error.
    pub fn into_result(self) -> Result<Self, InstrumentError> {
        if self.ok {
            return Ok(self);
        }
        Err(self
            .error
            .clone()
            .unwrap_or_else(|| InstrumentError::new(None, None).with_source(self.name.as_str())))
    }
}

/// Typed body of a response, selected by the command name.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Connect(InstrumentInfo),
    Status(StatusReport),
    ProtocolDuration(ProtocolDuration),
    ProtocolList(ProtocolList),
    TimeLeft(TimeLeft),
    ProtocolData(ProtocolData),
    /// Acknowledgement-only responses (`StartProtocol`, `Rotate`, ...).
    Empty,
    /// Response to a command this crate does not model.
    Unknown,
}

impl ResponsePayload {
    fn decode(name: &str, el: &Element) -> Self {
        match name {
            "Connect" => ResponsePayload::Connect(InstrumentInfo {
                instrument: el.child_text("Instrument").map(str::to_string),
                version: el.child_text("Version").map(str::to_string),
                serial: el.child_text("Serial").map(str::to_string),
            }),
            "GetStatus" => ResponsePayload::Status(StatusReport::from_element(el)),
            "GetProtocolDuration" => {
                ResponsePayload::ProtocolDuration(ProtocolDuration::from_element(el))
            }
            "ListProtocols" => ResponsePayload::ProtocolList(ProtocolList {
                names: el
                    .child("Protocols")
                    .map(|p| {
                        p.children_named("Protocol")
                            .filter_map(Element::text)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                memory_used_percent: el
                    .child("MemoryUsed")
                    .and_then(|m| m.attr("value"))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0),
            }),
            "GetProtocolTimeLeft" => ResponsePayload::TimeLeft(TimeLeft::from_element(el)),
            "DownloadProtocol" => ResponsePayload::ProtocolData(ProtocolData {
                encoded: collect_text(el),
            }),
            "StartProtocol" | "Stop" | "Acknowledge" | "ErrorAcknowledge" | "Rotate"
            | "Disconnect" | "UploadProtocol" => ResponsePayload::Empty,
            _ => ResponsePayload::Unknown,
        }
    }
}

/// Identity reported by `Connect`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentInfo {
    pub instrument: Option<String>,
    pub version: Option<String>,
    pub serial: Option<String>,
}

/// Instrument status as reported by `GetStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentStatus {
    Idle,
    Busy,
    InError,
    Other(String),
}

impl InstrumentStatus {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "Idle" => InstrumentStatus::Idle,
            "Busy" => InstrumentStatus::Busy,
            "In error" | "InError" | "Error" => InstrumentStatus::InError,
            other => InstrumentStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for InstrumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentStatus::Idle => write!(f, "Idle"),
            InstrumentStatus::Busy => write!(f, "Busy"),
            InstrumentStatus::InError => write!(f, "In error"),
            InstrumentStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Decoded `GetStatus` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub ok: bool,
    pub status: InstrumentStatus,
    pub error: Option<InstrumentError>,
}

impl StatusReport {
    fn from_element(el: &Element) -> Self {
        Self {
            ok: el.attr("ok").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            // A status response without <Status> only happens when the instrument is faulted.
            status: el
                .child_text("Status")
                .map(InstrumentStatus::parse)
                .unwrap_or(InstrumentStatus::InError),
            error: el.child("Error").map(parse_instrument_error),
        }
    }
}

/// One step of a tip in `GetProtocolDuration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDuration {
    pub name: String,
    /// XML Schema duration, e.g. `PT2M30S`.
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipDuration {
    pub name: String,
    pub duration: Option<String>,
    pub steps: Vec<StepDuration>,
}

/// Decoded `GetProtocolDuration` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolDuration {
    pub total: Option<String>,
    pub tips: Vec<TipDuration>,
}

impl ProtocolDuration {
    fn from_element(el: &Element) -> Self {
        let mut tips = Vec::new();
        collect_tips(el, &mut tips);
        Self {
            total: el.child("Duration").and_then(duration_of),
            tips,
        }
    }
}

fn collect_tips(el: &Element, tips: &mut Vec<TipDuration>) {
    for child in &el.children {
        if child.name == "Tip" {
            tips.push(TipDuration {
                name: child.attr("name").unwrap_or_default().to_string(),
                duration: duration_of(child),
                steps: child
                    .children_named("Step")
                    .map(|s| StepDuration {
                        name: s.attr("name").unwrap_or_default().to_string(),
                        duration: duration_of(s),
                    })
                    .collect(),
            });
        } else {
            collect_tips(child, tips);
        }
    }
}

fn duration_of(el: &Element) -> Option<String> {
    el.attr("duration")
        .or_else(|| el.attr("value"))
        .or_else(|| el.child_text("Duration"))
        .or_else(|| if el.children.is_empty() { el.text() } else { None })
        .map(str::to_string)
}

/// Decoded `ListProtocols` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolList {
    pub names: Vec<String>,
    pub memory_used_percent: u32,
}

/// Time remaining in a run (`GetProtocolTimeLeft` or the `ProtocolTimeLeft` event).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeLeft {
    pub time_left: Option<String>,
    /// Absent for single-step execution.
    pub time_to_pause: Option<String>,
}

impl TimeLeft {
    fn from_element(el: &Element) -> Self {
        let value = |name: &str| {
            el.child(name)
                .and_then(|c| c.attr("value").or_else(|| c.text()))
                .map(str::to_string)
        };
        Self {
            time_left: value("TimeLeft").or_else(|| el.attr("timeLeft").map(str::to_string)),
            time_to_pause: value("TimeToPause")
                .or_else(|| el.attr("timeToPause").map(str::to_string)),
        }
    }
}

/// Base64 protocol file carried by `DownloadProtocol`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolData {
    pub encoded: String,
}

impl ProtocolData {
    pub fn decode(&self) -> Result<Vec<u8>, CodecError> {
        let compact: String = self.encoded.split_whitespace().collect();
        Ok(STANDARD.decode(compact)?)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Events that stop a run until the host sends `Acknowledge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    LoadPlate,
    RemovePlate,
    ChangePlate,
    Pause,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::LoadPlate => write!(f, "LoadPlate"),
            AckKind::RemovePlate => write!(f, "RemovePlate"),
            AckKind::ChangePlate => write!(f, "ChangePlate"),
            AckKind::Pause => write!(f, "Pause"),
        }
    }
}

/// An `<Evt>` element.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Run or rotation finished.
    Ready,
    /// Run stopped by `Abort`.
    Aborted,
    Error(InstrumentError),
    LoadPlate { plate: Option<String> },
    RemovePlate { plate: Option<String> },
    ChangePlate {
        remove: Option<String>,
        load: Option<String>,
    },
    Pause { message: Option<String> },
    StepStarted {
        tip: Option<String>,
        step: Option<String>,
    },
    ProtocolTimeLeft(TimeLeft),
    Unknown(Element),
}

impl Event {
    pub fn from_element(el: &Element) -> Self {
        let plate = |e: &Element| e.attr_or_child_text("plate", "Plate").map(str::to_string);

        match el.attr("name").unwrap_or_default() {
            "Ready" => Event::Ready,
            "Aborted" => Event::Aborted,
            "Error" => Event::Error(
                el.child("Error")
                    .map(parse_instrument_error)
                    .unwrap_or_else(|| InstrumentError::new(None, el.text().map(str::to_string))),
            ),
            "LoadPlate" => Event::LoadPlate { plate: plate(el) },
            "RemovePlate" => Event::RemovePlate { plate: plate(el) },
            "ChangePlate" => {
                let nested = |name: &str| {
                    el.children_named(ROOT_EVENT)
                        .find(|c| c.attr("name") == Some(name))
                        .and_then(plate)
                };
                Event::ChangePlate {
                    remove: nested("RemovePlate"),
                    load: nested("LoadPlate"),
                }
            }
            "Pause" => Event::Pause {
                message: el
                    .attr_or_child_text("message", "Message")
                    .map(str::to_string),
            },
            "StepStarted" => Event::StepStarted {
                tip: el.attr_or_child_text("tip", "Tip").map(str::to_string),
                step: el.attr_or_child_text("step", "Step").map(str::to_string),
            },
            "ProtocolTimeLeft" => Event::ProtocolTimeLeft(TimeLeft::from_element(el)),
            _ => Event::Unknown(el.clone()),
        }
    }

    /// Event name as sent by the instrument.
    pub fn name(&self) -> &str {
        match self {
            Event::Ready => "Ready",
            Event::Aborted => "Aborted",
            Event::Error(_) => "Error",
            Event::LoadPlate { .. } => "LoadPlate",
            Event::RemovePlate { .. } => "RemovePlate",
            Event::ChangePlate { .. } => "ChangePlate",
            Event::Pause { .. } => "Pause",
            Event::StepStarted { .. } => "StepStarted",
            Event::ProtocolTimeLeft(_) => "ProtocolTimeLeft",
            Event::Unknown(el) => el.attr("name").unwrap_or_default(),
        }
    }

    /// Acknowledgement this event waits for, if any.
    pub fn ack_kind(&self) -> Option<AckKind> {
        match self {
            Event::LoadPlate { .. } => Some(AckKind::LoadPlate),
            Event::RemovePlate { .. } => Some(AckKind::RemovePlate),
            Event::ChangePlate { .. } => Some(AckKind::ChangePlate),
            Event::Pause { .. } => Some(AckKind::Pause),
            _ => None,
        }
    }

    /// Whether the event ends a run (or a rotation).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Ready | Event::Aborted | Event::Error(_))
    }
}

fn parse_code(el: &Element) -> Option<u32> {
    el.attr("code").and_then(|c| c.trim().parse().ok())
}

fn parse_instrument_error(el: &Element) -> InstrumentError {
    InstrumentError::new(parse_code(el), el.text().map(str::to_string))
}

fn collect_text(el: &Element) -> String {
    let mut out = el.text.clone().unwrap_or_default();
    for child in &el.children {
        out.push_str(&collect_text(child));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(xml: &str) -> Response {
        match Message::decode(xml.as_bytes()).unwrap() {
            Message::Response(r) => r,
            other => panic!("expected response, got {:?}", other),
        }
    }

    fn event(xml: &str) -> Event {
        match Message::decode(xml.as_bytes()).unwrap() {
            Message::Event(e) => e,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_status_idle() {
        let res = response("<Res name=\"GetStatus\" ok=\"true\"><Status>Idle</Status></Res>\n");
        assert!(res.ok);
        let ResponsePayload::Status(status) = res.payload else {
            panic!("expected status payload");
        };
        assert_eq!(status.status, InstrumentStatus::Idle);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_status_in_error_with_code() {
        let res = response(
            "<Res name=\"GetStatus\" ok=\"false\"><Status>In error</Status><Error code=\"5\">Magnets position error.</Error></Res>",
        );
        let ResponsePayload::Status(status) = &res.payload else {
            panic!("expected status payload");
        };
        assert!(!status.ok);
        assert_eq!(status.status, InstrumentStatus::InError);
        assert_eq!(status.error.as_ref().unwrap().code, Some(5));

        let err = res.into_result().unwrap_err();
        assert_eq!(err.source.as_deref(), Some("GetStatus"));
    }

    #[test]
    fn test_connect_info() {
        let res = response(
            "<Res name=\"Connect\" ok=\"true\"><Instrument>KingFisher Presto</Instrument><Version>1.2.3</Version><Serial>X123</Serial></Res>",
        );
        assert_eq!(
            res.payload,
            ResponsePayload::Connect(InstrumentInfo {
                instrument: Some("KingFisher Presto".into()),
                version: Some("1.2.3".into()),
                serial: Some("X123".into()),
            })
        );
    }

    #[test]
    fn test_warning_parsed() {
        let res = response("<Res name=\"Connect\" ok=\"true\"><Warning code=\"101\"/></Res>");
        let warning = res.warning.unwrap();
        assert_eq!(warning.code, Some(101));
        assert!(warning.description().is_some());
    }

    #[test]
    fn test_list_protocols() {
        let res = response(
            "<Res name=\"ListProtocols\" ok=\"true\"><Protocols><Protocol>A</Protocol><Protocol>B</Protocol></Protocols><MemoryUsed value=\"42\"/></Res>",
        );
        assert_eq!(
            res.payload,
            ResponsePayload::ProtocolList(ProtocolList {
                names: vec!["A".into(), "B".into()],
                memory_used_percent: 42,
            })
        );
    }

    #[test]
    fn test_time_left() {
        let res = response(
            "<Res name=\"GetProtocolTimeLeft\" ok=\"true\"><TimeLeft value=\"PT2M42S\"/><TimeToPause value=\"PT30S\"/></Res>",
        );
        assert_eq!(
            res.payload,
            ResponsePayload::TimeLeft(TimeLeft {
                time_left: Some("PT2M42S".into()),
                time_to_pause: Some("PT30S".into()),
            })
        );
    }

    #[test]
    fn test_protocol_duration() {
        let res = response(
            "<Res name=\"GetProtocolDuration\" ok=\"true\"><Duration value=\"PT10M\"/><Protocol name=\"P\"><Tip name=\"T1\" duration=\"PT10M\"><Step name=\"Mix\" duration=\"PT4M\"/><Step name=\"Dry\"><Duration>PT6M</Duration></Step></Tip></Protocol></Res>",
        );
        let ResponsePayload::ProtocolDuration(d) = res.payload else {
            panic!("expected duration payload");
        };
        assert_eq!(d.total.as_deref(), Some("PT10M"));
        assert_eq!(d.tips.len(), 1);
        assert_eq!(d.tips[0].name, "T1");
        assert_eq!(d.tips[0].steps[0].duration.as_deref(), Some("PT4M"));
        assert_eq!(d.tips[0].steps[1].name, "Dry");
        assert_eq!(d.tips[0].steps[1].duration.as_deref(), Some("PT6M"));
    }

    #[test]
    fn test_download_payload() {
        let res = response(
            "<Res name=\"DownloadProtocol\" ok=\"true\"><![CDATA[\n    aGVs\n    bG8=\n]]></Res>",
        );
        let ResponsePayload::ProtocolData(data) = res.payload else {
            panic!("expected protocol data");
        };
        assert_eq!(data.decode().unwrap(), b"hello");
    }

    #[test]
    fn test_failed_response_without_error_child() {
        let res = response("<Res name=\"Stop\" ok=\"false\"/>");
        let err = res.into_result().unwrap_err();
        assert_eq!(err.code, None);
        assert_eq!(err.source.as_deref(), Some("Stop"));
    }

    #[test]
    fn test_answering_decodes_payload_for_the_sent_command() {
        let res = response("<Res name=\"Status\" ok=\"true\"><Status>Busy</Status></Res>");
        assert_eq!(res.payload, ResponsePayload::Unknown);

        let res = res.answering("GetStatus");
        assert_eq!(res.name, "Status");
        let ResponsePayload::Status(status) = res.payload else {
            panic!("expected status payload");
        };
        assert_eq!(status.status, InstrumentStatus::Busy);
    }

    #[test]
    fn test_plate_events() {
        assert_eq!(
            event("<Evt name=\"LoadPlate\" plate=\"Plate1\"/>"),
            Event::LoadPlate {
                plate: Some("Plate1".into())
            }
        );
        let change = event(
            "<Evt name=\"ChangePlate\"><Evt name=\"RemovePlate\" plate=\"A\"/><Evt name=\"LoadPlate\" plate=\"B\"/></Evt>",
        );
        assert_eq!(
            change,
            Event::ChangePlate {
                remove: Some("A".into()),
                load: Some("B".into())
            }
        );
        assert_eq!(change.ack_kind(), Some(AckKind::ChangePlate));
    }

    #[test]
    fn test_error_event() {
        let evt = event("<Evt name=\"Error\"><Error code=\"6\">Turntable position error.</Error></Evt>");
        let Event::Error(err) = &evt else {
            panic!("expected error event");
        };
        assert_eq!(err.code, Some(6));
        assert!(evt.is_terminal());
        assert_eq!(evt.ack_kind(), None);
    }

    #[test]
    fn test_unknown_event_kept() {
        let evt = event("<Evt name=\"DoorOpened\" side=\"left\"/>");
        assert_eq!(evt.name(), "DoorOpened");
        let Event::Unknown(el) = evt else {
            panic!("expected unknown event");
        };
        assert_eq!(el.attr("side"), Some("left"));
    }

    #[test]
    fn test_unexpected_root() {
        assert!(matches!(
            Message::decode(b"<Cmd name=\"GetStatus\"/>\n"),
            Err(CodecError::UnexpectedRoot(name)) if name == "Cmd"
        ));
    }
}
