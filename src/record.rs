//! Parsed configuration records and the parser seam that produces them.
//!
//! Records are XML documents. The database only needs a small tree model of them: element
//! names, attributes, text and nested elements. [`RecordParser`] is the seam to the parser, the
//! default [`XmlRecordParser`] is built on `quick-xml`.

use std::{
    fmt::{self, Write as _},
    path::{Path, PathBuf},
};

use nested_enum_utils::common_fields;
use quick_xml::{
    Reader,
    escape::escape,
    events::{BytesStart, Event},
};
use snafu::{Backtrace, ResultExt, Snafu};

/// Attribute used by records to name members of element arrays.
const NAME_ATTRIBUTE: &str = "Name";

/// A failure to turn a file or a string into an [`Element`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum AssembleError {
    #[snafu(display("failed to read {}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("XML parser error at byte {position}"))]
    Xml {
        position: u64,
        source: quick_xml::Error,
    },
    #[snafu(display("{message}"))]
    Structure { message: String },
}

/// Parses record text into an [`Element`] tree.
pub trait RecordParser: fmt::Debug + Send + Sync + 'static {
    /// Parses a whole document held in memory.
    fn parse_str(&self, text: &str) -> Result<Element, AssembleError>;

    /// Parses the record file at `path`.
    fn parse_file(&self, path: &Path) -> Result<Element, AssembleError> {
        let text = std::fs::read_to_string(path).context(IoSnafu { path })?;
        self.parse_str(&text)
    }
}

/// The default [`RecordParser`], backed by `quick-xml`.
///
/// No schema validation is performed.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlRecordParser;

impl RecordParser for XmlRecordParser {
    fn parse_str(&self, text: &str) -> Result<Element, AssembleError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().context(XmlSnafu {
                position: reader.error_position(),
            })?;
            match event {
                Event::Start(start) => {
                    let element = Element::from_start(&start).context(XmlSnafu {
                        position: reader.buffer_position(),
                    })?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let element = Element::from_start(&start).context(XmlSnafu {
                        position: reader.buffer_position(),
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        StructureSnafu {
                            message: "unbalanced closing element",
                        }
                        .build()
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text.unescape().context(XmlSnafu {
                        position: reader.buffer_position(),
                    })?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        snafu::ensure!(
            stack.is_empty(),
            StructureSnafu {
                message: "unexpected end of document",
            }
        );
        root.ok_or_else(|| {
            StructureSnafu {
                message: "document has no root element",
            }
            .build()
        })
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), AssembleError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None => {
            snafu::ensure!(
                root.is_none(),
                StructureSnafu {
                    message: "document has more than one root element",
                }
            );
            *root = Some(element);
            Ok(())
        }
    }
}

/// An element of a parsed record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    /// Creates an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self, quick_xml::Error> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Default::default()
        })
    }

    /// The qualified element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The element name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// Renames the element, keeping its content.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Text content directly inside this element.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Attributes in document order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value of the attribute `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Nested elements in document order.
    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// Appends a nested element.
    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Whether `segment` addresses this element, by local name or by its `Name` attribute.
    fn is_addressed_by(&self, segment: &str) -> bool {
        self.local_name() == segment || self.attribute(NAME_ATTRIBUTE) == Some(segment)
    }

    /// Resolves a slash separated path of nested elements.
    ///
    /// On failure returns the prefix of `path` up to and including the first segment that
    /// matched nothing.
    pub fn child(&self, path: &str) -> Result<&Element, String> {
        let mut current = self;
        let mut walked = Vec::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            walked.push(segment);
            current = current
                .children
                .iter()
                .find(|c| c.is_addressed_by(segment))
                .ok_or_else(|| walked.join("/"))?;
        }
        Ok(current)
    }

    /// Reads a field: an attribute, or else the text of a nested element of that name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.attribute(name).or_else(|| {
            self.children
                .iter()
                .find(|c| c.is_addressed_by(name))
                .map(|c| c.text.as_str())
        })
    }

    /// Names under which nested elements are addressable, without duplicates.
    pub fn child_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for child in &self.children {
            let name = child
                .attribute(NAME_ATTRIBUTE)
                .unwrap_or_else(|| child.local_name());
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Serializes the element and everything below it.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            // writing to a String never fails
            let _ = write!(out, " {key}=\"{}\"", escape(value.as_str()));
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_xml(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}
