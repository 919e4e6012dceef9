//! Accessibility, SEO and performance rewrites (`optimize` transform)
//!
//! Rules run in a fixed order over the token stream produced by
//! [`markup::parse`]. The base rules always run; the full set only runs when
//! the caller asks for a full optimization and the power level allows it.

use crate::markup::{self, EndTag, Markup, Node, Quoting, StartTag};
use crate::{PowerLevel, RenderError, TransformSettings};
use std::collections::HashSet;
use tracing::trace;

const TAP_TARGET_STYLE: &str = "display: inline-block;min-width: 48px;min-height: 48px;";

const RESOURCE_HINTS: &[&str] = &["preload", "prefetch", "modulepreload", "preconnect", "dns-prefetch"];

const HEAVY_ELEMENTS: &[&str] = &["iframe", "embed", "object", "video", "audio", "style"];

const FILLER_PHRASES: &[[&str; 2]] = &[
    ["click", "here"],
    ["click", "this"],
    ["learn", "more"],
    ["right", "here"],
];

const FILLER_WORDS: &[&str] = &["go", "here", "this", "start", "more"];

struct Rule {
    name: &'static str,
    apply: fn(&mut Vec<Node>),
}

const BASE_RULES: &[Rule] = &[
    Rule {
        name: "strip-scripts",
        apply: strip_scripts,
    },
    Rule {
        name: "strip-resource-hints",
        apply: strip_resource_hints,
    },
];

const FULL_RULES: &[Rule] = &[
    Rule {
        name: "strip-heavy-elements",
        apply: strip_heavy_elements,
    },
    Rule {
        name: "document-language",
        apply: add_document_language,
    },
    Rule {
        name: "images",
        apply: improve_images,
    },
    Rule {
        name: "interactive-elements",
        apply: improve_interactive_elements,
    },
];

pub fn optimize(
    markup: Markup,
    full_optimize: bool,
    settings: &TransformSettings,
) -> Result<String, RenderError> {
    let html = markup.into_plain()?;
    if html.is_empty() {
        return Ok(html);
    }

    let mut nodes = markup::parse(&html);
    let mut rules: Vec<&Rule> = BASE_RULES.iter().collect();
    if full_optimize && settings.power_level != PowerLevel::One {
        rules.extend(FULL_RULES.iter());
    }

    for rule in rules {
        trace!("Applying rule {}", rule.name);
        (rule.apply)(&mut nodes);
    }

    Ok(markup::serialize(&nodes, Quoting::Preserve))
}

fn strip_scripts(nodes: &mut Vec<Node>) {
    markup::remove_elements(nodes, |tag| {
        tag.name() == "script"
            && !tag
                .attr("type")
                .is_some_and(|t| t.trim().eq_ignore_ascii_case("application/ld+json"))
    });
}

fn strip_resource_hints(nodes: &mut Vec<Node>) {
    markup::remove_elements(nodes, |tag| match tag.name() {
        "noscript" => true,
        "link" => tag.attr("rel").is_some_and(|rel| {
            rel.split_whitespace()
                .any(|token| RESOURCE_HINTS.contains(&token.to_ascii_lowercase().as_str()))
        }),
        _ => false,
    });
}

fn strip_heavy_elements(nodes: &mut Vec<Node>) {
    markup::remove_elements(nodes, |tag| HEAVY_ELEMENTS.contains(&tag.name()));
}

fn add_document_language(nodes: &mut Vec<Node>) {
    for node in nodes.iter_mut() {
        if let Node::Start(tag) = node {
            if tag.name() == "html" {
                if tag.attr("lang").map_or(true, |lang| lang.trim().is_empty()) {
                    tag.set_attr("lang", Some("en"));
                }
                return;
            }
        }
    }
}

fn improve_images(nodes: &mut Vec<Node>) {
    nodes.retain(|node| match node {
        Node::Start(tag) if tag.name() == "img" => {
            tag.attr("alt").is_some_and(|alt| !alt.trim().is_empty())
        }
        _ => true,
    });

    for node in nodes.iter_mut() {
        let Node::Start(tag) = node else { continue };
        if tag.name() != "img" {
            continue;
        }
        if !tag.has_attr("seo-tag") {
            tag.remove_attr("src");
            tag.remove_attr("srcset");
        }
        if !tag.has_attr("height") {
            tag.prepend_attr("height", Some("200"));
        }
        if !tag.has_attr("width") {
            tag.prepend_attr("width", Some("150"));
        }
    }
}

fn improve_interactive_elements(nodes: &mut Vec<Node>) {
    let mut labelled: HashSet<String> = nodes
        .iter()
        .filter_map(|node| match node {
            Node::Start(tag) if tag.name() == "label" => tag.attr("for").map(str::to_string),
            _ => None,
        })
        .filter(|id| !id.is_empty())
        .collect();

    let mut i = 0;
    while i < nodes.len() {
        let name = match &nodes[i] {
            Node::Start(tag) => tag.name().to_string(),
            _ => {
                i += 1;
                continue;
            }
        };
        i = match name.as_str() {
            "a" => improve_anchor(nodes, i),
            "button" => improve_button(nodes, i),
            "input" => improve_input(nodes, i, &mut labelled),
            _ => i + 1,
        };
    }
}

fn start_tag(nodes: &mut [Node], i: usize) -> &mut StartTag {
    match &mut nodes[i] {
        Node::Start(tag) => tag,
        _ => unreachable!("interactive rules only visit start tags"),
    }
}

fn has_usable_href(tag: &StartTag) -> bool {
    tag.attr("href").is_some_and(|href| {
        let href = href.trim();
        !href.is_empty() && href != "#" && !href.to_ascii_lowercase().starts_with("javascript:")
    })
}

fn add_tap_target_style(tag: &mut StartTag) {
    match tag.attr("style") {
        Some(style) if style.contains("min-width: 48px") => {}
        Some(style) => {
            let mut merged = style.trim().to_string();
            if !merged.is_empty() && !merged.ends_with(';') {
                merged.push(';');
            }
            merged.push_str(TAP_TARGET_STYLE);
            tag.set_attr("style", Some(&merged));
        }
        None => tag.set_attr("style", Some(TAP_TARGET_STYLE)),
    }
}

/// Inner range of the element opened at `i`, if it is closed.
fn content_range(nodes: &[Node], i: usize) -> Option<(usize, usize)> {
    markup::find_element_end(nodes, i).map(|end| (i + 1, end))
}

fn element_text(nodes: &[Node], i: usize) -> String {
    content_range(nodes, i)
        .map(|(from, to)| markup::visible_text(&nodes[from..to]))
        .unwrap_or_default()
}

fn improve_anchor(nodes: &mut Vec<Node>, i: usize) -> usize {
    let range = content_range(nodes, i);
    if let Some((from, to)) = range {
        for node in &mut nodes[from..to] {
            if let Node::Text(text) = node {
                if let Some(stripped) = strip_filler_words(text) {
                    *text = stripped;
                }
            }
        }
    }

    if !has_usable_href(start_tag(nodes, i)) {
        let tag = start_tag(nodes, i);
        tag.rename("button");
        tag.remove_attr("href");
        tag.set_attr("type", Some("button"));
        if let Some((_, end)) = range {
            nodes[end] = Node::End(EndTag::new("button"));
        }
        return improve_button(nodes, i);
    }

    if let Some((from, to)) = range {
        let text = markup::visible_text(&nodes[from..to]);
        let has_image = nodes[from..to]
            .iter()
            .any(|node| matches!(node, Node::Start(tag) if tag.name() == "img"));
        if text.is_empty() && !has_image {
            let href = start_tag(nodes, i).attr("href").unwrap_or_default().trim().to_string();
            nodes.insert(to, Node::Text(href));
        }
    }

    let text = element_text(nodes, i);
    let tag = start_tag(nodes, i);
    let redundant_label = tag
        .attr("aria-label")
        .is_some_and(|label| !text.is_empty() && label.trim().eq_ignore_ascii_case(&text));
    if redundant_label {
        tag.remove_attr("aria-label");
    }
    add_tap_target_style(tag);
    i + 1
}

fn improve_button(nodes: &mut Vec<Node>, i: usize) -> usize {
    let text = element_text(nodes, i);
    let tag = start_tag(nodes, i);
    let has_label = tag.attr("aria-label").is_some_and(|label| !label.trim().is_empty());

    if text.is_empty() && !has_label {
        let end = markup::find_element_end(nodes, i).unwrap_or(i);
        nodes.drain(i..=end);
        return i;
    }

    if !tag.has_attr("type") {
        tag.set_attr("type", Some("button"));
    }
    if !tag.has_attr("aria-label") {
        tag.set_attr("aria-label", Some(&text));
    }
    add_tap_target_style(tag);
    i + 1
}

fn improve_input(nodes: &mut Vec<Node>, i: usize, labelled: &mut HashSet<String>) -> usize {
    let tag = start_tag(nodes, i);
    let kind = tag
        .attr("type")
        .map(|t| t.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "text".to_string());

    if kind == "hidden" {
        return i + 1;
    }
    if matches!(kind.as_str(), "button" | "submit")
        && tag.attr("value").map_or(true, |v| v.trim().is_empty())
    {
        nodes.remove(i);
        return i;
    }

    add_tap_target_style(tag);

    let id = tag.attr("id").map(|id| id.trim().to_string()).unwrap_or_default();
    if id.is_empty() || labelled.contains(&id) {
        return i + 1;
    }

    let label = StartTag::new("label", vec![markup::Attribute::new("for", Some(&id))]);
    nodes.insert(i, Node::Start(label));
    nodes.insert(i + 2, Node::End(EndTag::new("label")));
    labelled.insert(id);
    i + 3
}

fn filler_key(word: &str) -> String {
    word.trim_matches(|c: char| matches!(c, '.' | ',' | '!' | '?' | ':' | ';' | '"' | '\'' | '(' | ')'))
        .to_lowercase()
}

/// Remove filler words from link text; `None` when nothing matched.
fn strip_filler_words(text: &str) -> Option<String> {
    let mut words: Vec<&str> = text.split_whitespace().collect();
    let original_len = words.len();

    loop {
        let before = words.len();

        let mut kept = Vec::with_capacity(words.len());
        let mut idx = 0;
        while idx < words.len() {
            let is_phrase = idx + 1 < words.len()
                && FILLER_PHRASES.iter().any(|[first, second]| {
                    filler_key(words[idx]) == *first && filler_key(words[idx + 1]) == *second
                });
            if is_phrase {
                idx += 2;
            } else {
                kept.push(words[idx]);
                idx += 1;
            }
        }
        words = kept;

        words.retain(|word| !FILLER_WORDS.contains(&filler_key(word).as_str()));

        if words.len() == before {
            break;
        }
    }

    if words.len() == original_len {
        return None;
    }

    let leading = text.starts_with(char::is_whitespace);
    let trailing = text.ends_with(char::is_whitespace);
    if words.is_empty() {
        return Some(if leading || trailing { " ".to_string() } else { String::new() });
    }

    let mut out = String::new();
    if leading {
        out.push(' ');
    }
    out.push_str(&words.join(" "));
    if trailing {
        out.push(' ');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunMode;

    const TAP: &str = "display: inline-block;min-width: 48px;min-height: 48px;";

    fn settings(power_level: PowerLevel) -> TransformSettings {
        TransformSettings {
            power_level,
            run_mode: RunMode::Production,
        }
    }

    fn full(html: &str) -> String {
        optimize(Markup::from(html), true, &settings(PowerLevel::Two)).unwrap()
    }

    #[test]
    fn test_strips_scripts_but_keeps_structured_data() {
        let html = r#"<head><script src="/app.js"></script><script type="application/ld+json">{"@type":"Product"}</script><script>var a = "</div>";</script></head>"#;
        let out = optimize(Markup::from(html), false, &settings(PowerLevel::Two)).unwrap();
        assert_eq!(
            out,
            r#"<head><script type="application/ld+json">{"@type":"Product"}</script></head>"#
        );
    }

    #[test]
    fn test_strips_resource_hints_and_noscript() {
        let html = r#"<link rel="preload" href="/a.js"><link rel="stylesheet" href="/a.css"><link rel="dns-prefetch" href="//cdn"><noscript><img src="/pixel.gif"></noscript><p>x</p>"#;
        let out = optimize(Markup::from(html), false, &settings(PowerLevel::Two)).unwrap();
        assert_eq!(out, r#"<link rel="stylesheet" href="/a.css"><p>x</p>"#);
    }

    #[test]
    fn test_power_level_one_only_runs_base_rules() {
        let html = "<html><body><iframe src=/x></iframe><script>x()</script></body></html>";
        let out = optimize(Markup::from(html), true, &settings(PowerLevel::One)).unwrap();
        assert_eq!(out, "<html><body><iframe src=/x></iframe></body></html>");
    }

    #[test]
    fn test_without_full_optimize_only_base_rules_run() {
        let html = "<html><body><video src=/v.mp4></video></body></html>";
        let out = optimize(Markup::from(html), false, &settings(PowerLevel::Three)).unwrap();
        assert_eq!(out, html);
    }

    #[test]
    fn test_strips_heavy_elements() {
        let html = r#"<body><style>p{color:red}</style><iframe src="/ad"><p>fallback</p></iframe><embed src="/f.swf"><object data="/o"></object><audio src="/a.mp3"></audio><p>kept</p></body>"#;
        assert_eq!(full(html), "<body><p>kept</p></body>");
    }

    #[test]
    fn test_adds_document_language() {
        assert_eq!(full("<html><body></body></html>"), r#"<html lang="en"><body></body></html>"#);
        assert_eq!(full("<html lang='de'></html>"), "<html lang='de'></html>");
    }

    #[test]
    fn test_image_rules() {
        let html = r#"<img src="/a.png" alt="Logo"><img src="/b.png"><img src="/c.png" alt=" "><img seo-tag src="/d.png" alt="D" width="10">"#;
        assert_eq!(
            full(html),
            r#"<img width="150" height="200" alt="Logo"><img height="200" seo-tag src="/d.png" alt="D" width="10">"#
        );
    }

    #[test]
    fn test_anchor_without_href_becomes_button() {
        let html = r#"<a onclick="open()">Open menu</a>"#;
        assert_eq!(
            full(html),
            format!(r#"<button onclick="open()" type="button" aria-label="Open menu" style="{TAP}">Open menu</button>"#)
        );
    }

    #[test]
    fn test_converted_anchor_with_only_filler_is_removed() {
        assert_eq!(full(r##"<p><a href="#">click here</a></p>"##), "<p></p>");
    }

    #[test]
    fn test_filler_words_are_stripped_from_links() {
        let html = r#"<a href="/pricing">Click here to see pricing</a>"#;
        assert_eq!(
            full(html),
            format!(r#"<a href="/pricing" style="{TAP}">to see pricing</a>"#)
        );

        let html = r#"<a href="/docs">Learn more about the API</a>"#;
        assert_eq!(
            full(html),
            format!(r#"<a href="/docs" style="{TAP}">about the API</a>"#)
        );
    }

    #[test]
    fn test_empty_link_text_uses_href() {
        assert_eq!(
            full(r#"<a href="/more">more</a>"#),
            format!(r#"<a href="/more" style="{TAP}">/more</a>"#)
        );
    }

    #[test]
    fn test_redundant_aria_label_is_dropped() {
        let html = r#"<a href="/x" aria-label="Pricing">Pricing</a><a href="/y" aria-label="Plans and pricing">Pricing</a>"#;
        assert_eq!(
            full(html),
            format!(
                r#"<a href="/x" style="{TAP}">Pricing</a><a href="/y" aria-label="Plans and pricing" style="{TAP}">Pricing</a>"#
            )
        );
    }

    #[test]
    fn test_existing_style_is_merged_once() {
        assert_eq!(
            full(r#"<a href="/a" style="color: red">Shop</a>"#),
            format!(r#"<a href="/a" style="color: red;{TAP}">Shop</a>"#)
        );
    }

    #[test]
    fn test_button_rules() {
        let html = r#"<button></button><button aria-label="Close"></button><button>Save</button><button type="submit" aria-label="Send">Send it</button>"#;
        assert_eq!(
            full(html),
            format!(
                concat!(
                    r#"<button aria-label="Close" type="button" style="{tap}"></button>"#,
                    r#"<button type="button" aria-label="Save" style="{tap}">Save</button>"#,
                    r#"<button type="submit" aria-label="Send" style="{tap}">Send it</button>"#
                ),
                tap = TAP
            )
        );
    }

    #[test]
    fn test_input_rules() {
        let html = r#"<label for="email">Email</label><input id="email" type="email"><input type="hidden" name="csrf" value="t"><input type="submit"><input type="submit" value="Go"><input id="q" name="q">"#;
        assert_eq!(
            full(html),
            format!(
                concat!(
                    r#"<label for="email">Email</label><input id="email" type="email" style="{tap}">"#,
                    r#"<input type="hidden" name="csrf" value="t">"#,
                    r#"<input type="submit" value="Go" style="{tap}">"#,
                    r#"<label for="q"><input id="q" name="q" style="{tap}"></label>"#
                ),
                tap = TAP
            )
        );
    }

    #[test]
    fn test_untouched_markup_is_preserved() {
        let html = "<!DOCTYPE html>\n<html lang='en'>\n  <body>\n    <p CLASS=intro>Hello</p>\n  </body>\n</html>";
        assert_eq!(full(html), html);
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let html = r##"<!doctype html>
<html>
<head><script>boot()</script><link rel="prefetch" href="/next"></head>
<body>
  <a href="#">Go</a>
  <a href="/start">Start here</a>
  <a>Menu</a>
  <a href="/empty"></a>
  <img src="/hero.jpg" alt="Hero">
  <button>  Buy now </button>
  <form><input id="name"><input type="submit" value="Send"></form>
</body>
</html>"##;
        let once = full(html);
        assert_eq!(full(&once), once);
    }

    #[test]
    fn test_compressing_first_keeps_the_visible_result() {
        let html = r##"<!DOCTYPE html>
<html>
<head>
  <title>Garden chairs</title>
  <!-- analytics -->
  <script src="/app.js"></script>
  <link rel="preload" href="/hero.jpg" as="image">
</head>
<body>
  <h1>  Garden   chairs </h1>
  <p>Weatherproof <em>teak</em> chairs,   built to last.</p>
  <div class="card" id="">
    <img src="/p/1.jpg" alt="Teak chair">
    <img src="/p/2.jpg">
    <a href="/p/1">Click here to see the teak chair</a>
    <button disabled="disabled">  Add to cart </button>
    <span></span>
  </div>
  <form><input id="qty" type="number"><input type="submit" value="Buy"></form>
  <noscript>Enable JavaScript</noscript>
</body>
</html>"##;
        let settings = settings(PowerLevel::Two);

        let direct = optimize(Markup::from(html), true, &settings).unwrap();
        let compressed = crate::minify::compress(Markup::from(html), &settings).unwrap();
        let chained = optimize(Markup::from(compressed.as_str()), true, &settings).unwrap();

        assert!(chained.len() < direct.len());
        assert_eq!(
            markup::visible_text(&markup::parse(&chained)),
            markup::visible_text(&markup::parse(&direct))
        );
        assert!(!chained.contains("<script"));
        assert!(!chained.contains("<noscript"));
        assert!(!chained.contains("/p/2.jpg"));
    }

    #[test]
    fn test_strip_filler_words() {
        assert_eq!(strip_filler_words("Read the guide"), None);
        assert_eq!(strip_filler_words(" click here! "), Some(" ".to_string()));
        assert_eq!(strip_filler_words("Start"), Some(String::new()));
        assert_eq!(strip_filler_words("click go here"), Some("click".to_string()));
    }
}
