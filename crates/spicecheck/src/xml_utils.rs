//! Minimal XML helpers on top of quick-xml
//!
//! Enough to write libvirt network and domain definitions and to read
//! attributes back out of `virsh *-dumpxml` output.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;

use color_eyre::{eyre::eyre, Result};
use quick_xml::events::attributes::Attributes;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

/// Incremental XML document builder
pub struct XmlWriter {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl fmt::Debug for XmlWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmlWriter")
            .field("len", &self.writer.get_ref().get_ref().len())
            .finish_non_exhaustive()
    }
}

fn element<'a>(name: &'a str, attributes: &[(&str, &str)]) -> BytesStart<'a> {
    let mut elem = BytesStart::new(name);
    for &(key, value) in attributes {
        elem.push_attribute((key, value));
    }
    elem
}

impl XmlWriter {
    /// Create an empty document
    pub fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2),
        }
    }

    /// Open `<name attr=...>`
    pub fn start_element(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        self.writer
            .write_event(Event::Start(element(name, attributes)))
            .map_err(|e| eyre!("Failed to write <{name}>: {e}"))
    }

    /// Write `<name attr=.../>`
    pub fn write_empty_element(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        self.writer
            .write_event(Event::Empty(element(name, attributes)))
            .map_err(|e| eyre!("Failed to write <{name}/>: {e}"))
    }

    /// Write escaped text content
    pub fn write_text(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(|e| eyre!("Failed to write text: {e}"))
    }

    /// Write `<name>text</name>`
    pub fn write_text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.start_element(name, &[])?;
        self.write_text(text)?;
        self.end_element(name)
    }

    /// Close `</name>`
    pub fn end_element(&mut self, name: &str) -> Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(|e| eyre!("Failed to write </{name}>: {e}"))
    }

    /// The finished document
    pub fn into_string(self) -> Result<String> {
        let bytes = self.writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| eyre!("Generated XML is not UTF-8: {e}"))
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// One parsed element
#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    /// Element name, including any prefix
    pub name: String,
    /// Attribute values by name
    pub attributes: HashMap<String, String>,
    /// Concatenated text content
    pub text: String,
    /// Child elements in document order
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// First element named `name`, depth first, including `self`
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// Every element named `name`, depth first
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a XmlNode> {
        let mut found = Vec::new();
        self.collect(name, &mut found);
        found
    }

    fn collect<'a>(&'a self, name: &str, found: &mut Vec<&'a XmlNode>) {
        if self.name == name {
            found.push(self);
        }
        for child in &self.children {
            child.collect(name, found);
        }
    }

    /// Value of attribute `name`
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

fn node_from(name: &[u8], attrs: Attributes<'_>) -> XmlNode {
    let attributes = attrs
        .flatten()
        .map(|attr| {
            (
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                String::from_utf8_lossy(&attr.value).into_owned(),
            )
        })
        .collect();
    XmlNode {
        name: String::from_utf8_lossy(name).into_owned(),
        attributes,
        ..Default::default()
    }
}

/// Parse a document into an [`XmlNode`] tree rooted at the document element
pub fn parse_xml_dom(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    let mut attach = |node: XmlNode, stack: &mut Vec<XmlNode>| match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            root.get_or_insert(node);
        }
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(node_from(e.name().as_ref(), e.attributes())),
            Ok(Event::Empty(e)) => {
                let node = node_from(e.name().as_ref(), e.attributes());
                attach(node, &mut stack);
            }
            Ok(Event::End(_)) => {
                if let Some(node) = stack.pop() {
                    attach(node, &mut stack);
                }
            }
            Ok(Event::Text(e)) => {
                if let (Ok(text), Some(current)) = (e.unescape(), stack.last_mut()) {
                    current.text.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(eyre!("Failed to parse XML: {e}")),
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| eyre!("No root element found in XML"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    #[test]
    fn test_writer() {
        let mut writer = XmlWriter::new();
        writer.start_element("graphics", &[("type", "spice"), ("autoport", "yes")]).unwrap();
        writer.write_empty_element("listen", &[("type", "address"), ("address", "0.0.0.0")]).unwrap();
        writer.write_text_element("note", "a < b").unwrap();
        writer.end_element("graphics").unwrap();
        let xml = writer.into_string().unwrap();
        assert!(xml.starts_with(r#"<graphics type="spice" autoport="yes">"#));
        assert!(xml.contains(r#"<listen type="address" address="0.0.0.0"/>"#));
        assert!(xml.contains("<note>a &lt; b</note>"));
        assert!(xml.ends_with("</graphics>"));

        let dom = parse_xml_dom(&xml).unwrap();
        assert_eq!(dom.find("listen").and_then(|n| n.attr("address")), Some("0.0.0.0"));
        assert_eq!(dom.find("note").map(|n| n.text.as_str()), Some("a < b"));
    }

    #[test]
    fn test_writer_debug() {
        let mut writer = XmlWriter::default();
        writer.write_empty_element("model", &[("type", "qxl")]).unwrap();
        let debug = format!("{writer:?}");
        assert!(debug.starts_with("XmlWriter"));
        assert!(debug.contains("len"));
    }

    #[test]
    fn test_parse_network() {
        let xml = indoc! {r#"
            <network>
              <name>spicenet</name>
              <uuid>0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0</uuid>
              <bridge name='virbr9' stp='on' delay='0'/>
              <ip address='192.168.150.1' netmask='255.255.255.0'>
                <dhcp>
                  <range start='192.168.150.2' end='192.168.150.254'/>
                </dhcp>
              </ip>
              <ip family='ipv6' address='fd00:150::1' prefix='64'/>
            </network>
        "#};
        let dom = parse_xml_dom(xml).unwrap();
        assert_eq!(dom.name, "network");
        assert_eq!(dom.find("name").map(|n| n.text.as_str()), Some("spicenet"));
        assert_eq!(dom.find("bridge").and_then(|n| n.attr("name")), Some("virbr9"));
        let ips = dom.find_all("ip");
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0].attr("address"), Some("192.168.150.1"));
        assert_eq!(ips[1].attr("family"), Some("ipv6"));
        assert_eq!(
            dom.find("range").and_then(|n| n.attr("end")),
            Some("192.168.150.254")
        );
        assert!(dom.find("forward").is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_xml_dom("").is_err());
        assert!(parse_xml_dom("<network><name>x</nam></network>").is_err());
    }
}
