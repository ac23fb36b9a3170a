//! Generic XML element tree used on the wire.
//!
//! Every message is one element: `<Cmd>` outbound, `<Res>` or `<Evt>` inbound.
//! This module only knows about names, attributes, children and text; the
//! typed layer lives in [`super::message`] and [`super::command`].

use std::borrow::Cow;
use std::fmt::Write as _;

use quick_xml::errors::SyntaxError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::reader::Reader;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Message is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Element <{0}> is never closed")]
    Unterminated(String),

    #[error("Message contains no element")]
    NoRoot,

    #[error("Message contains more than one root element")]
    MultipleRoots,

    #[error("Unexpected root element <{0}>")]
    UnexpectedRoot(String),

    #[error("Encoded command is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Response to {0} is missing its payload")]
    UnexpectedPayload(String),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl CodecError {
    /// The text ended inside an element, tag, CDATA section or comment, so
    /// more input may still complete it.
    pub fn is_incomplete(&self) -> bool {
        match self {
            CodecError::Unterminated(_) => true,
            CodecError::Xml(quick_xml::Error::Syntax(e)) => {
                !matches!(e, SyntaxError::InvalidBangMarkup)
            }
            _ => false,
        }
    }
}

/// One XML element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: Option<String>,
    /// Text is (or must be written as) a CDATA section.
    pub cdata: bool,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self.cdata = false;
        self
    }

    pub fn with_cdata(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self.cdata = true;
        self
    }

    /// Set or replace an attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text content, `None` when empty.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Trimmed text of the first child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(Element::text)
    }

    /// Attribute of the element, falling back to the text of a same-named child.
    pub fn attr_or_child_text(&self, name: &str, child: &str) -> Option<&str> {
        self.attr(name).or_else(|| self.child_text(child))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::parse(std::str::from_utf8(bytes)?)
    }

    /// Parse exactly one root element.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event()? {
                XmlEvent::Start(start) => {
                    if root.is_some() {
                        return Err(CodecError::MultipleRoots);
                    }
                    stack.push(element_from_start(&start)?);
                }
                XmlEvent::Empty(start) => {
                    if root.is_some() {
                        return Err(CodecError::MultipleRoots);
                    }
                    let element = element_from_start(&start)?;
                    close_element(&mut stack, &mut root, element);
                }
                XmlEvent::End(_) => {
                    // quick-xml has already checked that the end name matches.
                    let element = stack.pop().ok_or(CodecError::NoRoot)?;
                    close_element(&mut stack, &mut root, element);
                }
                XmlEvent::Text(text) => {
                    let text = text.unescape()?;
                    match stack.last_mut() {
                        Some(current) => append_text(current, &text, false),
                        None if text.trim().is_empty() => {}
                        None => return Err(CodecError::MultipleRoots),
                    }
                }
                XmlEvent::CData(data) => {
                    let data = data.into_inner();
                    let text = std::str::from_utf8(&data)?;
                    if let Some(current) = stack.last_mut() {
                        append_text(current, text, true);
                    }
                }
                XmlEvent::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.first() {
            return Err(CodecError::Unterminated(open.name.clone()));
        }
        root.ok_or(CodecError::NoRoot)
    }

    /// Serialize to XML text (no declaration, no terminator).
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attributes {
            let value = escape_whitespace(&escape(value.as_str())).into_owned();
            let _ = write!(out, " {}=\"{}\"", name, value);
        }

        if self.text.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        if let Some(text) = &self.text {
            if self.cdata {
                out.push_str("<![CDATA[");
                out.push_str(text);
                out.push_str("]]>");
            } else {
                out.push_str(&escape_whitespace(&escape(text.as_str())));
            }
        }
        for child in &self.children {
            child.write_xml(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Line breaks as character references; a raw line feed would end the message.
fn escape_whitespace(text: &str) -> Cow<'_, str> {
    if !text.contains(['\n', '\r', '\t']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, CodecError> {
    let name = std::str::from_utf8(start.name().as_ref())?.to_string();
    let mut element = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn close_element(stack: &mut Vec<Element>, root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => *root = Some(element),
    }
}

fn append_text(element: &mut Element, text: &str, cdata: bool) {
    element.text.get_or_insert_with(String::new).push_str(text);
    element.cdata |= cdata;
}
