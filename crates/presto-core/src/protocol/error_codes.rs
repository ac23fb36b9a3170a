//! Instrument error and warning codes.
//!
//! Codes arrive as `Res/Error@code`, `Evt/Error@code` and `Res/Warning@code`.

use std::fmt;

/// Standard description for an error code, if documented.
pub fn error_description(code: u32) -> Option<&'static str> {
    let desc = match code {
        2 => "Received an unknown command.",
        3 => "Already connected to another port.",
        4 => "Head position error.",
        5 => "Magnets position error.",
        6 => "Turntable position error.",
        7 => "Heater unit position error.",
        8 => "Lock position error.",
        11 => "Invalid command argument.",
        13 => "Protocol memory error.",
        14 => "Protocol memory is full.",
        15 => "No protocols found from the protocols memory.",
        16 => "Protocol was not found from the protocols memory.",
        17 => "Given tip name was not found from the protocol.",
        18 => "Given step name was not found from the given tip of the protocol.",
        19 => "A name of a step to start was not given.",
        20 => "A name of a tip where to start the step was not given.",
        23 => {
            "Protocol name is invalid. Maximum length of the name is 100 bytes e.g. 100 ASCII characters."
        }
        24 => "Invalid protocol file.",
        25 => "Protocol is not executable.",
        27 => "Protocol is too large and can't be loaded.",
        28 => "Instrument is executing, please wait.",
        32 => "No protocol is currently running.",
        33 => "Data transmit to USB port failed (timed out).",
        34 => "Cannot run magnets down without tips.",
        35 => "Magnetic head is missing.",
        38 => "Plate not detected in processing position.",
        124 => "Protocol already running.",
        321 => "Execution failed.",
        _ => return None,
    };
    Some(desc)
}

/// Standard description for a warning code, if documented.
pub fn warning_description(code: u32) -> Option<&'static str> {
    match code {
        101 => Some("Instrument is already connected."),
        _ => None,
    }
}

/// Error reported by the instrument (`ok="false"` or an `Error` event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentError {
    /// Numeric code, when the instrument sent one.
    pub code: Option<u32>,
    /// Free text sent by the instrument.
    pub text: Option<String>,
    /// Command or event name the error belongs to.
    pub source: Option<String>,
}

impl InstrumentError {
    pub fn new(code: Option<u32>, text: Option<String>) -> Self {
        Self {
            code,
            text: text.filter(|t| !t.trim().is_empty()),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Description from the static table.
    pub fn description(&self) -> Option<&'static str> {
        self.code.and_then(error_description)
    }
}

impl fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{}: ", source)?;
        }
        f.write_str(&format_message(self.code, self.text.as_deref(), self.description(), "error"))
    }
}

impl std::error::Error for InstrumentError {}

/// Warning attached to an otherwise successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentWarning {
    pub code: Option<u32>,
    pub text: Option<String>,
}

impl InstrumentWarning {
    pub fn description(&self) -> Option<&'static str> {
        self.code.and_then(warning_description)
    }
}

impl fmt::Display for InstrumentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = self
            .code
            .and_then(|c| warning_description(c).or_else(|| error_description(c)));
        f.write_str(&format_message(self.code, self.text.as_deref(), desc, "warning"))
    }
}

/// Prefer the standard description; append instrument text when it adds something.
fn format_message(
    code: Option<u32>,
    text: Option<&str>,
    desc: Option<&'static str>,
    kind: &str,
) -> String {
    let text = text.map(str::trim).filter(|t| !t.is_empty());
    match (desc, text, code) {
        (Some(desc), Some(text), _) if desc != text => format!("{} ({})", desc, text),
        (Some(desc), _, _) => desc.to_string(),
        (None, Some(text), _) => text.to_string(),
        (None, None, Some(code)) => format!("Unknown {} code {}.", kind, code),
        (None, None, None) => "Command failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_code_has_description() {
        let desc = error_description(5).unwrap();
        assert!(desc.contains("Magnets"));
        assert!(error_description(99_999).is_none());
    }

    #[test]
    fn test_display_prefers_description_and_appends_text() {
        let err = InstrumentError::new(Some(5), Some(" Custom instrument message ".into()));
        assert_eq!(
            err.to_string(),
            "Magnets position error. (Custom instrument message)"
        );

        let same = InstrumentError::new(Some(6), Some("Turntable position error.".into()));
        assert_eq!(same.to_string(), "Turntable position error.");
    }

    #[test]
    fn test_unknown_code_surfaces_raw() {
        let err = InstrumentError::new(Some(12), None);
        assert!(err.description().is_none());
        assert_eq!(err.to_string(), "Unknown error code 12.");
    }

    #[test]
    fn test_blank_text_is_dropped() {
        let err = InstrumentError::new(None, Some("   ".into())).with_source("StartProtocol");
        assert_eq!(err.text, None);
        assert_eq!(err.to_string(), "StartProtocol: Command failed");
    }

    #[test]
    fn test_warning_description() {
        let warning = InstrumentWarning {
            code: Some(101),
            text: None,
        };
        assert_eq!(warning.to_string(), "Instrument is already connected.");
    }
}
