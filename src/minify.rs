//! Markup minification (`compress` transform)

use crate::markup::{self, Markup, Node, Quoting, StartTag};
use crate::{PowerLevel, RenderError, RunMode, TransformSettings};

const BOOLEAN_ATTRIBUTES: &[&str] = &[
    "allowfullscreen", "async", "autofocus", "autoplay", "checked", "controls", "default",
    "defer", "disabled", "formnovalidate", "hidden", "inert", "ismap", "itemscope", "loop",
    "multiple", "muted", "nomodule", "novalidate", "open", "playsinline", "readonly",
    "required", "reversed", "selected",
];

const REMOVABLE_WHEN_EMPTY: &[&str] = &["class", "id", "style", "title", "lang", "dir"];

/// Empty instances of these carry meaning on their own.
const KEEP_WHEN_EMPTY: &[&str] = &[
    "html", "head", "body", "textarea", "script", "iframe", "video", "audio", "object",
    "canvas", "td", "th", "tr", "option", "svg", "i",
];

const INLINE_ELEMENTS: &[&str] = &[
    "a", "abbr", "b", "bdi", "bdo", "button", "cite", "code", "data", "dfn", "em", "i", "img",
    "input", "kbd", "label", "mark", "q", "s", "samp", "select", "small", "span", "strong",
    "sub", "sup", "time", "u", "var",
];

/// Elements whose whitespace is significant.
const PREFORMATTED: &[&str] = &["pre", "textarea"];

pub fn compress(markup: Markup, settings: &TransformSettings) -> Result<String, RenderError> {
    let html = markup.into_plain()?;
    if html.is_empty() || settings.power_level == PowerLevel::One {
        return Ok(html);
    }
    if settings.run_mode == RunMode::Development {
        return Ok(html);
    }
    Ok(minify(&html))
}

pub fn minify(html: &str) -> String {
    let mut nodes = markup::parse(html);

    nodes.retain(|node| !matches!(node, Node::Comment(_)));
    for node in nodes.iter_mut() {
        match node {
            Node::Doctype(doctype) if doctype.to_ascii_lowercase().starts_with("<!doctype") => {
                *doctype = "<!doctype html>".to_string();
            }
            Node::Start(tag) => {
                collapse_boolean_attributes(tag);
                remove_empty_attributes(tag);
            }
            _ => {}
        }
    }

    loop {
        markup::merge_adjacent_text(&mut nodes);
        let collapsed = collapse_text(&mut nodes);
        let emptied = remove_empty_elements(&mut nodes);
        if !collapsed && !emptied {
            break;
        }
    }

    markup::serialize(&nodes, Quoting::Minimal)
}

fn collapse_boolean_attributes(tag: &mut StartTag) {
    tag.retain_attrs(|attr| {
        if BOOLEAN_ATTRIBUTES.contains(&attr.name.as_str()) {
            attr.value = None;
        }
        true
    });
}

fn remove_empty_attributes(tag: &mut StartTag) {
    tag.retain_attrs(|attr| {
        let removable =
            REMOVABLE_WHEN_EMPTY.contains(&attr.name.as_str()) || attr.name.starts_with("on");
        let empty = attr.value.as_deref().map_or(true, |v| v.trim().is_empty());
        !(removable && empty)
    });
}

fn is_inline_boundary(node: Option<&Node>) -> bool {
    match node {
        Some(Node::Start(tag)) => INLINE_ELEMENTS.contains(&tag.name()),
        Some(Node::End(tag)) => INLINE_ELEMENTS.contains(&tag.name()),
        _ => false,
    }
}

/// Collapse whitespace runs in text nodes, trimming next to block boundaries.
fn collapse_text(nodes: &mut Vec<Node>) -> bool {
    let mut changed = false;
    let mut preformatted_depth = 0usize;
    let mut i = 0;

    while i < nodes.len() {
        match &nodes[i] {
            Node::Start(tag) if PREFORMATTED.contains(&tag.name()) && !tag.is_void() => {
                preformatted_depth += 1;
            }
            Node::End(tag) if PREFORMATTED.contains(&tag.name()) => {
                preformatted_depth = preformatted_depth.saturating_sub(1);
            }
            Node::Text(text) if preformatted_depth == 0 => {
                let keep_leading = i > 0 && is_inline_boundary(nodes.get(i - 1));
                let keep_trailing = is_inline_boundary(nodes.get(i + 1));
                let collapsed = collapse_text_run(text, keep_leading, keep_trailing);

                if collapsed != *text {
                    changed = true;
                    if collapsed.is_empty() {
                        nodes.remove(i);
                        continue;
                    }
                    nodes[i] = Node::Text(collapsed);
                }
            }
            _ => {}
        }
        i += 1;
    }

    changed
}

fn collapse_text_run(text: &str, keep_leading: bool, keep_trailing: bool) -> String {
    let words = markup::collapse_whitespace(text);
    if words.is_empty() {
        // whitespace-only text survives only as a separator between inline elements
        return if keep_leading && keep_trailing && !text.is_empty() {
            " ".to_string()
        } else {
            String::new()
        };
    }

    let starts_with_space = text.starts_with(char::is_whitespace);
    let ends_with_space = text.ends_with(char::is_whitespace);
    let mut out = String::with_capacity(words.len() + 2);
    if starts_with_space && keep_leading {
        out.push(' ');
    }
    out.push_str(&words);
    if ends_with_space && keep_trailing {
        out.push(' ');
    }
    out
}

fn remove_empty_elements(nodes: &mut Vec<Node>) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < nodes.len() {
        let empty_pair = match (&nodes[i], &nodes[i + 1]) {
            (Node::Start(open), Node::End(close)) => {
                open.name() == close.name()
                    && !open.is_void()
                    && !KEEP_WHEN_EMPTY.contains(&open.name())
            }
            _ => false,
        };

        if empty_pair {
            nodes.drain(i..i + 2);
            changed = true;
            i = i.saturating_sub(1);
        } else {
            i += 1;
        }
    }
    changed
}
