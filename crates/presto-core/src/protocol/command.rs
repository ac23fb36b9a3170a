//! Outbound commands.
//!
//! Each command is a single `<Cmd name="..." .../>` element. Optional
//! arguments that are `None` are omitted from the element.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::constants::{MAX_COMMAND_LEN, MESSAGE_TERMINATOR, ROOT_COMMAND};
use super::element::{CodecError, Element};

/// Commands understood by the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open the logical connection; optionally set the clock (`YYYY-MM-DD hh:mm:ss`).
    Connect { set_time: Option<String> },
    GetStatus,
    GetProtocolDuration { protocol: String },
    ListProtocols,
    GetProtocolTimeLeft { protocol: Option<String> },
    /// Start a whole protocol, or a single tip/step of it.
    StartProtocol {
        protocol: String,
        tip: Option<String>,
        step: Option<String>,
    },
    Stop,
    Acknowledge,
    ErrorAcknowledge,
    /// Move turntable `nest` (slot 1 or 2) to `position` (1 processing, 2 loading).
    Rotate { nest: u8, position: u8 },
    Disconnect,
    /// Store a BindIt protocol file; `crc` is the CRC32 of `data`.
    UploadProtocol {
        protocol: String,
        crc: u32,
        data: Vec<u8>,
    },
    DownloadProtocol { protocol: String },
    /// Any other command name with raw attributes.
    Custom {
        name: String,
        attributes: Vec<(String, String)>,
    },
}

impl Command {
    /// Build an `UploadProtocol` command, computing the CRC32 of the payload.
    pub fn upload(protocol: impl Into<String>, data: Vec<u8>) -> Self {
        let mut crc = flate2::Crc::new();
        crc.update(&data);
        Command::UploadProtocol {
            protocol: protocol.into(),
            crc: crc.sum(),
            data,
        }
    }

    /// Value of the `name` attribute.
    pub fn name(&self) -> &str {
        match self {
            Command::Connect { .. } => "Connect",
            Command::GetStatus => "GetStatus",
            Command::GetProtocolDuration { .. } => "GetProtocolDuration",
            Command::ListProtocols => "ListProtocols",
            Command::GetProtocolTimeLeft { .. } => "GetProtocolTimeLeft",
            Command::StartProtocol { .. } => "StartProtocol",
            Command::Stop => "Stop",
            Command::Acknowledge => "Acknowledge",
            Command::ErrorAcknowledge => "ErrorAcknowledge",
            Command::Rotate { .. } => "Rotate",
            Command::Disconnect => "Disconnect",
            Command::UploadProtocol { .. } => "UploadProtocol",
            Command::DownloadProtocol { .. } => "DownloadProtocol",
            Command::Custom { name, .. } => name.as_str(),
        }
    }

    /// Build the `<Cmd>` element.
    pub fn to_element(&self) -> Element {
        fn opt(el: &mut Element, key: &str, value: &Option<String>) {
            if let Some(v) = value {
                el.set_attr(key, v.as_str());
            }
        }

        let mut el = Element::new(ROOT_COMMAND).with_attr("name", self.name());

        match self {
            Command::Connect { set_time } => opt(&mut el, "setTime", set_time),
            Command::GetProtocolDuration { protocol } | Command::DownloadProtocol { protocol } => {
                el.set_attr("protocol", protocol.as_str());
            }
            Command::GetProtocolTimeLeft { protocol } => opt(&mut el, "protocol", protocol),
            Command::StartProtocol {
                protocol,
                tip,
                step,
            } => {
                el.set_attr("protocol", protocol.as_str());
                opt(&mut el, "tip", tip);
                opt(&mut el, "step", step);
            }
            Command::Rotate { nest, position } => {
                el.set_attr("nest", nest.to_string());
                el.set_attr("position", position.to_string());
            }
            Command::UploadProtocol {
                protocol,
                crc,
                data,
            } => {
                el.set_attr("protocol", protocol.as_str());
                el.set_attr("crc", crc.to_string());
                // One line: a line feed inside the payload would end the message.
                el = el.with_cdata(STANDARD.encode(data));
            }
            Command::Custom { attributes, .. } => {
                for (k, v) in attributes {
                    el.set_attr(k.as_str(), v.as_str());
                }
            }
            Command::GetStatus
            | Command::ListProtocols
            | Command::Stop
            | Command::Acknowledge
            | Command::ErrorAcknowledge
            | Command::Disconnect => {}
        }
        el
    }

    /// Wire text, terminator included.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = self.to_element().to_xml().into_bytes();
        bytes.push(MESSAGE_TERMINATOR);
        if bytes.len() > MAX_COMMAND_LEN {
            return Err(CodecError::TooLarge {
                len: bytes.len(),
                max: MAX_COMMAND_LEN,
            });
        }
        Ok(bytes)
    }
}
