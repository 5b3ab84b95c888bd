//! Response body negotiation.
//!
//! Bodies are normalized into a [`serde_json::Value`] whatever the wire
//! format. XML documents are mapped onto the same shape a JSON rendition of
//! the document would have:
//!
//! - the document becomes `{ "<root>": ... }`;
//! - an element holding only text becomes a string (`""` when empty);
//! - attributes become `"_<name>"` keys;
//! - repeated child elements with the same name collapse into an array;
//! - text mixed with attributes or children is stored under `"__text"`.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::BodyParseError;
use crate::util::truncate_body;

const ATTRIBUTE_PREFIX: &str = "_";
const TEXT_KEY: &str = "__text";

/// Decodes a response body according to its `content-type`.
///
/// Never fails: unparseable JSON keeps the raw text, unparseable XML yields
/// `null`.
pub fn decode_body(content_type: Option<&str>, body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }

    let declared_xml = content_type
        .map(|value| value.to_ascii_lowercase().contains("xml"))
        .unwrap_or(false);
    if declared_xml {
        return xml_or_null(body);
    }

    match parse_json(body) {
        Ok(value) => value,
        Err(json_error) if content_type.is_none() => match xml_to_json(body) {
            Ok(value) => value,
            Err(xml_error) => {
                warn!(
                    json_error = %json_error,
                    xml_error = %xml_error,
                    body = %truncate_body(body),
                    "untyped response body is neither json nor xml; keeping raw text"
                );
                raw_text(body)
            }
        },
        Err(json_error) => {
            warn!(
                error = %json_error,
                content_type = content_type.unwrap_or_default(),
                "response body is not json; keeping raw text"
            );
            raw_text(body)
        }
    }
}

fn xml_or_null(body: &[u8]) -> Value {
    match xml_to_json(body) {
        Ok(value) => value,
        Err(error) => {
            warn!(error = %error, body = %truncate_body(body), "failed to parse xml response body");
            Value::Null
        }
    }
}

fn raw_text(body: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(body).into_owned())
}

pub(crate) fn parse_json(body: &[u8]) -> Result<Value, BodyParseError> {
    serde_json::from_slice(body).map_err(|source| BodyParseError::Json { source })
}

#[derive(Debug, Default)]
struct ElementFrame {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<(String, Value)>,
    text: String,
}

impl ElementFrame {
    fn open(start: &BytesStart<'_>) -> Result<Self, BodyParseError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(xml_error)?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Self::default()
        })
    }

    fn close(self) -> (String, Value) {
        let text = self.text.trim().to_owned();
        if self.attributes.is_empty() && self.children.is_empty() {
            return (self.name, Value::String(text));
        }

        let mut object = Map::new();
        for (key, value) in self.attributes {
            object.insert(format!("{ATTRIBUTE_PREFIX}{key}"), Value::String(value));
        }
        for (key, value) in self.children {
            match object.get_mut(&key) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    object.insert(key, value);
                }
            }
        }
        if !text.is_empty() {
            object.insert(TEXT_KEY.to_owned(), Value::String(text));
        }
        (self.name, Value::Object(object))
    }
}

fn xml_error(error: impl std::fmt::Display) -> BodyParseError {
    BodyParseError::Xml {
        message: error.to_string(),
    }
}

/// Converts a single-rooted XML document into its JSON-shaped equivalent.
pub(crate) fn xml_to_json(body: &[u8]) -> Result<Value, BodyParseError> {
    let text = std::str::from_utf8(body).map_err(xml_error)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<ElementFrame> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        let event = reader.read_event().map_err(xml_error)?;
        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(xml_error("multiple root elements"));
                }
                stack.push(ElementFrame::open(&start)?);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err(xml_error("multiple root elements"));
                }
                let element = ElementFrame::open(&start)?.close();
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::End(_) => {
                let Some(frame) = stack.pop() else {
                    return Err(xml_error("unbalanced closing tag"));
                };
                let element = frame.close();
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(content) => {
                let content = content.unescape().map_err(xml_error)?;
                match stack.last_mut() {
                    Some(frame) => frame.text.push_str(&content),
                    None if content.trim().is_empty() => {}
                    None => return Err(xml_error("text outside of the root element")),
                }
            }
            Event::CData(content) => {
                let content = String::from_utf8_lossy(&content.into_inner()).into_owned();
                match stack.last_mut() {
                    Some(frame) => frame.text.push_str(&content),
                    None => return Err(xml_error("cdata outside of the root element")),
                }
            }
            Event::Eof => break,
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
        }
    }

    if !stack.is_empty() {
        return Err(xml_error("document ended inside an open element"));
    }
    let Some((name, value)) = root else {
        return Err(xml_error("document has no root element"));
    };
    let mut document = Map::new();
    document.insert(name, value);
    Ok(Value::Object(document))
}
