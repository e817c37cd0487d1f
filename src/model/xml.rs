//! Textual snapshot format
//!
//! Serializes a Document to the persisted attribute-tagged format and
//! parses it back. The format is fixed: a declaration line, an
//! `<Applications>` root carrying the namespace and schema version, nested
//! `<Application>` elements and self-closed `<Topic>` elements, all data in
//! attributes, UTF-8, two-space indentation.
//!
//! The schema is small and closed, so both directions are hand-rolled
//! rather than pulled from a general XML library.

use thiserror::Error;

use super::document::{Application, Direction, Document, Topic};
use super::ModelError;

/// Leading format-version declaration line.
pub const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

#[derive(Error, Debug)]
pub enum XmlError {
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Malformed XML: {0}")]
    Malformed(String),

    #[error("Unexpected element <{0}>")]
    UnexpectedElement(String),

    #[error("Missing '{attr}' attribute on <{element}>")]
    MissingAttribute { element: String, attr: String },

    #[error(transparent)]
    Model(#[from] ModelError),
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String, XmlError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let mut entity = String::new();
        for e in chars.by_ref() {
            if e == ';' {
                break;
            }
            entity.push(e);
            if entity.len() > 4 {
                return Err(XmlError::Malformed(format!("Bad entity '&{}'", entity)));
            }
        }
        match entity.as_str() {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            other => return Err(XmlError::Malformed(format!("Unknown entity '&{};'", other))),
        }
    }
    Ok(out)
}

/// Serialize a document to the persisted textual format.
pub fn to_xml(doc: &Document) -> String {
    let mut out = String::new();
    out.push_str(XML_DECLARATION);
    out.push('\n');

    let root_attrs = format!(
        "xmlns=\"{}\" version=\"{}\"",
        escape(&doc.xmlns),
        escape(&doc.version)
    );

    if doc.applications.is_empty() {
        out.push_str(&format!("<Applications {} />\n", root_attrs));
        return out;
    }

    out.push_str(&format!("<Applications {}>\n", root_attrs));
    for app in &doc.applications {
        let app_attrs = format!(
            "name=\"{}\" description=\"{}\"",
            escape(&app.name),
            escape(&app.description)
        );
        if app.topics.is_empty() {
            out.push_str(&format!("  <Application {} />\n", app_attrs));
            continue;
        }
        out.push_str(&format!("  <Application {}>\n", app_attrs));
        for topic in &app.topics {
            out.push_str(&format!(
                "    <Topic name=\"{}\" proto=\"{}\" direction=\"{}\" description=\"{}\" />\n",
                escape(&topic.name),
                escape(&topic.proto),
                topic.direction.as_str(),
                escape(&topic.description)
            ));
        }
        out.push_str("  </Application>\n");
    }
    out.push_str("</Applications>\n");
    out
}

/// One parsed tag: name, attributes, and whether it self-closed.
struct Tag {
    name: String,
    attrs: Vec<(String, String)>,
    self_closing: bool,
    closing: bool,
}

impl Tag {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, name: &str) -> Result<String, XmlError> {
        self.attr(name)
            .map(str::to_string)
            .ok_or_else(|| XmlError::MissingAttribute {
                element: self.name.clone(),
                attr: name.to_string(),
            })
    }
}

/// Minimal cursor over the snapshot text, yielding tags in document order.
struct Reader<'a> {
    rest: &'a str,
}

impl<'a> Reader<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn next_tag(&mut self) -> Result<Option<Tag>, XmlError> {
        let start = match self.rest.find('<') {
            Some(i) => i,
            None => {
                if self.rest.trim().is_empty() {
                    return Ok(None);
                }
                return Err(XmlError::Malformed("Trailing content outside tags".into()));
            }
        };
        if !self.rest[..start].trim().is_empty() {
            return Err(XmlError::Malformed("Text content is not part of the format".into()));
        }
        let end = self.rest[start..]
            .find('>')
            .ok_or(XmlError::UnexpectedEof)?
            + start;
        let body = &self.rest[start + 1..end];
        self.rest = &self.rest[end + 1..];

        // Skip the declaration line
        if body.starts_with('?') {
            return self.next_tag();
        }

        let closing = body.starts_with('/');
        let body = body.trim_start_matches('/');
        let self_closing = body.ends_with('/');
        let body = body.trim_end_matches('/').trim();

        let (name, attr_str) = match body.find(char::is_whitespace) {
            Some(i) => (&body[..i], &body[i..]),
            None => (body, ""),
        };
        if name.is_empty() {
            return Err(XmlError::Malformed("Empty tag name".into()));
        }

        Ok(Some(Tag {
            name: name.to_string(),
            attrs: parse_attrs(attr_str)?,
            self_closing,
            closing,
        }))
    }
}

fn parse_attrs(mut s: &str) -> Result<Vec<(String, String)>, XmlError> {
    let mut attrs = Vec::new();
    loop {
        s = s.trim_start();
        if s.is_empty() {
            return Ok(attrs);
        }
        let eq = s
            .find('=')
            .ok_or_else(|| XmlError::Malformed(format!("Attribute without value: '{}'", s)))?;
        let key = s[..eq].trim().to_string();
        s = s[eq + 1..].trim_start();
        if !s.starts_with('"') {
            return Err(XmlError::Malformed(format!("Unquoted attribute value for '{}'", key)));
        }
        let close = s[1..]
            .find('"')
            .ok_or_else(|| XmlError::Malformed(format!("Unterminated value for '{}'", key)))?;
        let raw = &s[1..close + 1];
        attrs.push((key, unescape(raw)?));
        s = &s[close + 2..];
    }
}

/// Parse a snapshot back into a Document. Strict to the persisted schema:
/// anything outside Applications/Application/Topic fails.
pub fn from_xml(input: &str) -> Result<Document, XmlError> {
    let mut reader = Reader::new(input);

    let root = reader.next_tag()?.ok_or(XmlError::UnexpectedEof)?;
    if root.name != "Applications" || root.closing {
        return Err(XmlError::UnexpectedElement(root.name));
    }

    let mut doc = Document::new();
    doc.xmlns = root.require("xmlns")?;
    doc.version = root.require("version")?;

    if root.self_closing {
        return Ok(doc);
    }

    loop {
        let tag = reader.next_tag()?.ok_or(XmlError::UnexpectedEof)?;
        if tag.closing {
            if tag.name == "Applications" {
                return Ok(doc);
            }
            return Err(XmlError::UnexpectedElement(tag.name));
        }
        if tag.name != "Application" {
            return Err(XmlError::UnexpectedElement(tag.name));
        }

        let mut app = Application::new(tag.require("name")?, tag.attr("description").unwrap_or(""));
        if !tag.self_closing {
            loop {
                let child = reader.next_tag()?.ok_or(XmlError::UnexpectedEof)?;
                if child.closing {
                    if child.name == "Application" {
                        break;
                    }
                    return Err(XmlError::UnexpectedElement(child.name));
                }
                if child.name != "Topic" || !child.self_closing {
                    return Err(XmlError::UnexpectedElement(child.name));
                }
                let direction: Direction = child.require("direction")?.parse()?;
                app.topics.push(Topic::new(
                    child.require("name")?,
                    child.require("proto")?,
                    direction,
                    child.attr("description").unwrap_or(""),
                ));
            }
        }
        doc.applications.push(app);
    }
}
