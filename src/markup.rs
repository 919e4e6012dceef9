//! Tag-level HTML tokenizer and serializer
//!
//! The transform rules work on a flat stream of [`Node`]s rather than on raw
//! text. Tokens that no rule touched serialize back byte-for-byte, so a
//! rewrite only ever changes the tags it actually modified.

use crate::RenderError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Elements whose content is not parsed as markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Captured page markup, either plain text or gzip-compressed bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Markup {
    Plain(String),
    Compressed(Vec<u8>),
}

impl Markup {
    pub fn compress(html: &str) -> Result<Self, RenderError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(html.as_bytes())
            .map_err(|e| RenderError::Compression(e.to_string()))?;
        let bytes = encoder
            .finish()
            .map_err(|e| RenderError::Compression(e.to_string()))?;
        Ok(Markup::Compressed(bytes))
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Markup::Compressed(_))
    }

    /// Plain text of the markup, decompressing when needed.
    pub fn to_plain(&self) -> Result<String, RenderError> {
        match self {
            Markup::Plain(html) => Ok(html.clone()),
            Markup::Compressed(bytes) => decompress(bytes),
        }
    }

    pub fn into_plain(self) -> Result<String, RenderError> {
        match self {
            Markup::Plain(html) => Ok(html),
            Markup::Compressed(bytes) => decompress(&bytes),
        }
    }
}

fn decompress(bytes: &[u8]) -> Result<String, RenderError> {
    let mut html = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut html)
        .map_err(|e| RenderError::Compression(e.to_string()))?;
    Ok(html)
}

impl From<String> for Markup {
    fn from(html: String) -> Self {
        Markup::Plain(html)
    }
}

impl From<&str> for Markup {
    fn from(html: &str) -> Self {
        Markup::Plain(html.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    /// Body of a raw-text element such as `script` or `style`
    RawText(String),
    /// Full comment including delimiters
    Comment(String),
    /// Doctype or other `<!...>` / `<?...>` declaration, verbatim
    Doctype(String),
    Start(StartTag),
    End(EndTag),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn new(name: &str, value: Option<&str>) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            value: value.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartTag {
    name: String,
    attrs: Vec<Attribute>,
    self_closing: bool,
    raw: Option<String>,
}

impl StartTag {
    pub fn new(name: &str, attrs: Vec<Attribute>) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            attrs,
            self_closing: false,
            raw: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }

    pub fn is_self_closing(&self) -> bool {
        self.self_closing
    }

    pub fn is_void(&self) -> bool {
        self.self_closing || VOID_ELEMENTS.contains(&self.name.as_str())
    }

    /// Whether the tag no longer matches its source text.
    pub fn is_modified(&self) -> bool {
        self.raw.is_none()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|a| a.name == name)
    }

    /// Value of the first attribute called `name`; bare attributes read as `""`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_deref().unwrap_or(""))
    }

    pub fn rename(&mut self, name: &str) {
        if self.name != name {
            self.name = name.to_ascii_lowercase();
            self.raw = None;
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|a| a.name != name);
        let removed = self.attrs.len() != before;
        if removed {
            self.raw = None;
        }
        removed
    }

    pub fn prepend_attr(&mut self, name: &str, value: Option<&str>) {
        self.attrs.insert(0, Attribute::new(name, value));
        self.raw = None;
    }

    /// Replace the value of `name`, adding the attribute when missing.
    pub fn set_attr(&mut self, name: &str, value: Option<&str>) {
        match self.attrs.iter_mut().find(|a| a.name == name) {
            Some(attr) if attr.value.as_deref() == value => return,
            Some(attr) => attr.value = value.map(str::to_string),
            None => self.attrs.push(Attribute::new(name, value)),
        }
        self.raw = None;
    }

    /// Apply `f` to every attribute, marking the tag modified if anything changed.
    pub fn retain_attrs<F: FnMut(&mut Attribute) -> bool>(&mut self, mut f: F) {
        let original = self.attrs.clone();
        self.attrs.retain_mut(|a| f(a));
        if self.attrs != original {
            self.raw = None;
        }
    }

    fn write_to(&self, out: &mut String, quoting: Quoting) {
        if quoting == Quoting::Preserve {
            if let Some(raw) = &self.raw {
                out.push_str(raw);
                return;
            }
        }

        out.push('<');
        out.push_str(&self.name);
        let mut last_unquoted = false;
        for attr in &self.attrs {
            out.push(' ');
            out.push_str(&attr.name);
            last_unquoted = false;
            if let Some(value) = &attr.value {
                out.push('=');
                if quoting == Quoting::Minimal && can_unquote(value) {
                    out.push_str(value);
                    last_unquoted = true;
                } else {
                    write_quoted(out, value);
                }
            }
        }

        let void = VOID_ELEMENTS.contains(&self.name.as_str());
        if self.self_closing && !(quoting == Quoting::Minimal && void) {
            if quoting == Quoting::Minimal && !last_unquoted && !self.attrs.is_empty() {
                out.push_str("/>");
            } else {
                out.push_str(" />");
            }
        } else {
            out.push('>');
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndTag {
    name: String,
    raw: Option<String>,
}

impl EndTag {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            raw: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How start tags are written back out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    /// Untouched tags verbatim, modified tags with double quotes
    Preserve,
    /// Every tag rewritten, quotes dropped where the value allows it
    Minimal,
}

fn can_unquote(value: &str) -> bool {
    !value.is_empty()
        && !value.ends_with('/')
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '=' | '<' | '>' | '`'))
}

fn write_quoted(out: &mut String, value: &str) {
    if value.contains('"') {
        if value.contains('\'') {
            out.push('"');
            out.push_str(&value.replace('"', "&quot;"));
            out.push('"');
        } else {
            out.push('\'');
            out.push_str(value);
            out.push('\'');
        }
    } else {
        out.push('"');
        out.push_str(value);
        out.push('"');
    }
}

pub fn parse(html: &str) -> Vec<Node> {
    let bytes = html.as_bytes();
    let mut nodes = Vec::new();
    let mut pos = 0;
    let mut text_start = 0;

    while pos < bytes.len() {
        if bytes[pos] != b'<' {
            pos += 1;
            continue;
        }

        let rest = &html[pos..];
        let Some((node, len)) = parse_tag(rest) else {
            pos += 1;
            continue;
        };

        if text_start < pos {
            nodes.push(Node::Text(html[text_start..pos].to_string()));
        }
        pos += len;

        let raw_text_name = match &node {
            Node::Start(tag)
                if !tag.self_closing && RAW_TEXT_ELEMENTS.contains(&tag.name.as_str()) =>
            {
                Some(tag.name.clone())
            }
            _ => None,
        };
        nodes.push(node);

        if let Some(name) = raw_text_name {
            let closing = format!("</{name}");
            let end = html[pos..]
                .to_ascii_lowercase()
                .find(&closing)
                .map(|i| pos + i)
                .unwrap_or(html.len());
            if end > pos {
                nodes.push(Node::RawText(html[pos..end].to_string()));
            }
            pos = end;
        }
        text_start = pos;
    }

    if text_start < html.len() {
        nodes.push(Node::Text(html[text_start..].to_string()));
    }

    nodes
}

fn parse_tag(rest: &str) -> Option<(Node, usize)> {
    let second = rest.as_bytes().get(1).copied()?;

    if rest.starts_with("<!--") {
        let end = rest[4..].find("-->").map(|i| i + 7).unwrap_or(rest.len());
        return Some((Node::Comment(rest[..end].to_string()), end));
    }

    if second == b'!' || second == b'?' {
        let end = rest.find('>')?;
        return Some((Node::Doctype(rest[..=end].to_string()), end + 1));
    }

    if second == b'/' {
        if !rest.as_bytes().get(2)?.is_ascii_alphabetic() {
            return None;
        }
        let end = rest.find('>')?;
        let name = rest[2..end]
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let tag = EndTag {
            name,
            raw: Some(rest[..=end].to_string()),
        };
        return Some((Node::End(tag), end + 1));
    }

    if second.is_ascii_alphabetic() {
        return parse_start_tag(rest).map(|(tag, len)| (Node::Start(tag), len));
    }

    None
}

fn parse_start_tag(rest: &str) -> Option<(StartTag, usize)> {
    let bytes = rest.as_bytes();
    let len = bytes.len();
    let is_space = |b: u8| b.is_ascii_whitespace();

    let mut i = 1;
    while i < len && !is_space(bytes[i]) && bytes[i] != b'>' && bytes[i] != b'/' {
        i += 1;
    }
    let name = rest[1..i].to_ascii_lowercase();
    let mut attrs = Vec::new();
    let mut self_closing = false;

    loop {
        while i < len && is_space(bytes[i]) {
            i += 1;
        }
        if i >= len {
            return None;
        }
        match bytes[i] {
            b'>' => {
                i += 1;
                break;
            }
            b'/' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    self_closing = true;
                    i += 2;
                    break;
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        let name_start = i;
        while i < len && !is_space(bytes[i]) && !matches!(bytes[i], b'=' | b'>' | b'/') {
            i += 1;
        }
        if i == name_start {
            // stray '=' with no attribute name
            i += 1;
            continue;
        }
        let attr_name = rest[name_start..i].to_ascii_lowercase();

        let mut j = i;
        while j < len && is_space(bytes[j]) {
            j += 1;
        }
        if j < len && bytes[j] == b'=' {
            j += 1;
            while j < len && is_space(bytes[j]) {
                j += 1;
            }
            if j >= len {
                return None;
            }
            let value = if bytes[j] == b'"' || bytes[j] == b'\'' {
                let quote = bytes[j] as char;
                let value_start = j + 1;
                let value_end = rest[value_start..].find(quote)? + value_start;
                i = value_end + 1;
                &rest[value_start..value_end]
            } else {
                let value_start = j;
                while j < len && !is_space(bytes[j]) && bytes[j] != b'>' {
                    j += 1;
                }
                i = j;
                &rest[value_start..j]
            };
            attrs.push(Attribute {
                name: attr_name,
                value: Some(value.to_string()),
            });
        } else {
            attrs.push(Attribute {
                name: attr_name,
                value: None,
            });
        }
    }

    let tag = StartTag {
        name,
        attrs,
        self_closing,
        raw: Some(rest[..i].to_string()),
    };
    Some((tag, i))
}

pub fn serialize(nodes: &[Node], quoting: Quoting) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Text(text) | Node::RawText(text) | Node::Comment(text) | Node::Doctype(text) => {
                out.push_str(text)
            }
            Node::Start(tag) => tag.write_to(&mut out, quoting),
            Node::End(tag) => match (&tag.raw, quoting) {
                (Some(raw), Quoting::Preserve) => out.push_str(raw),
                _ => {
                    out.push_str("</");
                    out.push_str(&tag.name);
                    out.push('>');
                }
            },
        }
    }
    out
}

/// Index of the end tag closing the element opened at `start`.
///
/// Returns `None` for void elements and for elements left unclosed.
pub fn find_element_end(nodes: &[Node], start: usize) -> Option<usize> {
    let Node::Start(open) = &nodes[start] else {
        return None;
    };
    if open.is_void() {
        return None;
    }

    let mut depth = 0usize;
    for (offset, node) in nodes[start + 1..].iter().enumerate() {
        match node {
            Node::Start(tag) if tag.name == open.name && !tag.is_void() => depth += 1,
            Node::End(tag) if tag.name == open.name => {
                if depth == 0 {
                    return Some(start + 1 + offset);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Remove every element whose start tag matches `predicate`, content included.
pub fn remove_elements<F: Fn(&StartTag) -> bool>(nodes: &mut Vec<Node>, predicate: F) -> usize {
    let mut removed = 0;
    let mut i = 0;
    while i < nodes.len() {
        let matches = matches!(&nodes[i], Node::Start(tag) if predicate(tag));
        if !matches {
            i += 1;
            continue;
        }

        let end = match find_element_end(nodes, i) {
            Some(end) => end,
            None if matches!(nodes.get(i + 1), Some(Node::RawText(_))) => i + 1,
            None => i,
        };
        nodes.drain(i..=end);
        removed += 1;
    }
    removed
}

/// Text a reader would see, whitespace-collapsed.
pub fn visible_text(nodes: &[Node]) -> String {
    let mut text = String::new();
    for node in nodes {
        if let Node::Text(t) = node {
            text.push_str(t);
            text.push(' ');
        }
    }
    collapse_whitespace(&text)
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Merge runs of adjacent text nodes, mirroring what a re-parse would produce.
pub fn merge_adjacent_text(nodes: &mut Vec<Node>) {
    let mut merged: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes.drain(..) {
        match (merged.last_mut(), node) {
            (Some(Node::Text(prev)), Node::Text(next)) => prev.push_str(&next),
            (_, Node::Text(next)) if next.is_empty() => {}
            (_, node) => merged.push(node),
        }
    }
    *nodes = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_document() {
        let nodes = parse(r#"<!DOCTYPE html><html lang="en"><body><p class=intro>Hi</p></body></html>"#);

        assert!(matches!(&nodes[0], Node::Doctype(d) if d == "<!DOCTYPE html>"));
        let Node::Start(html) = &nodes[1] else { panic!("expected html start tag") };
        assert_eq!(html.name(), "html");
        assert_eq!(html.attr("lang"), Some("en"));
        let Node::Start(p) = &nodes[3] else { panic!("expected p start tag") };
        assert_eq!(p.attr("class"), Some("intro"));
        assert!(matches!(&nodes[4], Node::Text(t) if t == "Hi"));
        assert!(matches!(&nodes[5], Node::End(e) if e.name() == "p"));
    }

    #[test]
    fn test_untouched_markup_round_trips_verbatim() {
        let html = "<DIV Class='a'  data-x = \"1\">\n  text < 3 &amp; more<!-- note --><br/></DIV>";
        assert_eq!(serialize(&parse(html), Quoting::Preserve), html);
    }

    #[test]
    fn test_raw_text_elements_are_not_tokenized() {
        let nodes = parse("<script>if (a < b) { x = '<div>'; }</script><p>x</p>");
        assert!(matches!(&nodes[1], Node::RawText(t) if t.contains("'<div>'")));
        assert!(matches!(&nodes[2], Node::End(e) if e.name() == "script"));
        assert_eq!(nodes.len(), 6);
    }

    #[test]
    fn test_bare_and_unquoted_attributes() {
        let nodes = parse("<input disabled value=ok type='text'>");
        let Node::Start(tag) = &nodes[0] else { panic!("expected start tag") };
        assert!(tag.has_attr("disabled"));
        assert_eq!(tag.attr("disabled"), Some(""));
        assert_eq!(tag.attr("value"), Some("ok"));
        assert_eq!(tag.attr("type"), Some("text"));
    }

    #[test]
    fn test_modified_tags_are_reserialized() {
        let mut nodes = parse("<img src='a.png' alt=x>");
        if let Node::Start(tag) = &mut nodes[0] {
            assert!(!tag.is_modified());
            tag.remove_attr("src");
            assert!(tag.is_modified());
        }
        assert_eq!(serialize(&nodes, Quoting::Preserve), r#"<img alt="x">"#);
        assert_eq!(serialize(&nodes, Quoting::Minimal), "<img alt=x>");
    }

    #[test]
    fn test_noop_mutations_keep_raw_text() {
        let mut nodes = parse("<a HREF='/x'>y</a>");
        if let Node::Start(tag) = &mut nodes[0] {
            tag.set_attr("href", Some("/x"));
            assert!(!tag.remove_attr("title"));
            assert!(!tag.is_modified());
        }
        assert_eq!(serialize(&nodes, Quoting::Preserve), "<a HREF='/x'>y</a>");
    }

    #[test]
    fn test_find_element_end_handles_nesting() {
        let nodes = parse("<div><div>a</div><img></div>");
        assert_eq!(find_element_end(&nodes, 0), Some(5));
        assert_eq!(find_element_end(&nodes, 1), Some(3));
        assert_eq!(find_element_end(&nodes, 4), None);
    }

    #[test]
    fn test_remove_elements() {
        let mut nodes = parse("<p>a<iframe src=x><b>b</b></iframe>c</p>");
        assert_eq!(remove_elements(&mut nodes, |t| t.name() == "iframe"), 1);
        assert_eq!(serialize(&nodes, Quoting::Preserve), "<p>ac</p>");
    }

    #[test]
    fn test_visible_text() {
        let nodes = parse("<a>\n  Read <b>the</b>\n docs<!-- c --></a>");
        assert_eq!(visible_text(&nodes), "Read the docs");
    }

    #[test]
    fn test_stray_angle_brackets_stay_text() {
        let html = "a < b and c <> d </ e";
        let nodes = parse(html);
        assert_eq!(nodes, vec![Node::Text(html.to_string())]);
    }

    #[test]
    fn test_markup_compression_round_trip() {
        let html = "<html><body>cached</body></html>";
        let compressed = Markup::compress(html).unwrap();
        assert!(compressed.is_compressed());
        assert_eq!(compressed.to_plain().unwrap(), html);
        assert_eq!(Markup::from(html).into_plain().unwrap(), html);
    }

    #[test]
    fn test_corrupt_compressed_markup_is_an_error() {
        let corrupt = Markup::Compressed(vec![1, 2, 3]);
        assert!(matches!(corrupt.to_plain(), Err(RenderError::Compression(_))));
    }
}
