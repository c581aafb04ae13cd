//! Ordered XML element tree.
//!
//! The chunker needs element order, attribute order, and namespace prefixes
//! preserved, so the streaming events of `quick-xml` are materialized into a
//! small owned tree. Comments, processing instructions, and the XML
//! declaration are skipped; CDATA is kept as text.

use anyhow::{bail, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

#[derive(Debug, Clone)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct XmlElement {
    /// Full tag name including any namespace prefix.
    pub name: String,
    /// Attributes in document order, prefixes preserved.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    /// True for `<tag/>` forms.
    pub self_closing: bool,
}

impl XmlElement {
    pub fn local_name(&self) -> &str {
        crate::artifacts::local_name(&self.name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(el) => Some(el),
            XmlNode::Text(_) => None,
        })
    }

    /// Number of distinct child element tags.
    pub fn distinct_child_tags(&self) -> usize {
        let mut tags: Vec<&str> = self.child_elements().map(|el| el.name.as_str()).collect();
        tags.sort_unstable();
        tags.dedup();
        tags.len()
    }

    /// Non-whitespace text directly under this element.
    pub fn direct_text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                XmlNode::Text(t) => Some(t.trim()),
                XmlNode::Element(_) => None,
            })
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Parse a document into its root element.
pub fn parse_document(text: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(element_from_start(
                    &String::from_utf8_lossy(e.name().as_ref()),
                    e.attributes(),
                    false,
                )?);
            }
            Ok(Event::Empty(e)) => {
                let element = element_from_start(
                    &String::from_utf8_lossy(e.name().as_ref()),
                    e.attributes(),
                    true,
                )?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| anyhow::anyhow!("unbalanced closing tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                push_text(&mut stack, text);
            }
            Ok(Event::CData(t)) => {
                let text = String::from_utf8_lossy(&t.into_inner()).to_string();
                push_text(&mut stack, text);
            }
            Ok(Event::Comment(_)) | Ok(Event::PI(_)) | Ok(Event::Decl(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => bail!("XML parse error at byte {}: {}", reader.buffer_position(), e),
        }
    }

    if !stack.is_empty() {
        bail!("unexpected end of document inside <{}>", stack.last().unwrap().name);
    }
    root.ok_or_else(|| anyhow::anyhow!("document has no root element"))
}

fn element_from_start(
    name: &str,
    attributes: quick_xml::events::attributes::Attributes<'_>,
    self_closing: bool,
) -> Result<XmlElement> {
    let mut attrs = Vec::new();
    for attr in attributes {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().unwrap_or_default().to_string();
        attrs.push((key, value));
    }
    Ok(XmlElement {
        name: name.to_string(),
        attrs,
        children: Vec::new(),
        self_closing,
    })
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlNode::Element(element));
    } else if root.is_none() {
        *root = Some(element);
    } else {
        bail!("multiple root elements");
    }
    Ok(())
}

fn push_text(stack: &mut [XmlElement], text: String) {
    if text.trim().is_empty() {
        return;
    }
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlNode::Text(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_in_order() {
        let root = parse_document(
            r#"<api name="A" context="/a"><resource methods="GET"><inSequence><log level="full"/></inSequence></resource></api>"#,
        )
        .unwrap();
        assert_eq!(root.name, "api");
        assert_eq!(root.attr("name"), Some("A"));
        let resource = root.child_elements().next().unwrap();
        assert_eq!(resource.name, "resource");
        let in_seq = resource.child_elements().next().unwrap();
        let log = in_seq.child_elements().next().unwrap();
        assert_eq!(log.name, "log");
        assert!(log.self_closing);
    }

    #[test]
    fn keeps_namespace_prefixes() {
        let root =
            parse_document(r#"<wsp:Policy xmlns:wsp="http://x"><wsp:All/></wsp:Policy>"#).unwrap();
        assert_eq!(root.name, "wsp:Policy");
        assert_eq!(root.local_name(), "Policy");
    }

    #[test]
    fn skips_comments_and_pis() {
        let root = parse_document(
            "<?xml version=\"1.0\"?><!-- top --><sequence name=\"s\"><!-- inner --><log/></sequence>",
        )
        .unwrap();
        assert_eq!(root.child_elements().count(), 1);
    }

    #[test]
    fn collects_direct_text() {
        let root = parse_document("<role>assistant</role>").unwrap();
        assert_eq!(root.direct_text(), "assistant");
    }

    #[test]
    fn distinct_child_tags_counts_kinds() {
        let root =
            parse_document("<x><a/><b/><a/><c/></x>").unwrap();
        assert_eq!(root.distinct_child_tags(), 3);
    }

    #[test]
    fn rejects_truncated_document() {
        assert!(parse_document("<api><resource>").is_err());
    }
}
