//! Lossy projection of a DOM subtree into compact HTML.
//!
//! Executable content, presentation noise, hidden nodes and nodes owned by the
//! injection engine are dropped; structure and semantic attributes are kept.

use crate::core::MARKER_ATTRIBUTE;
use scraper::node::{Element, Node};
use scraper::ElementRef;

const STRIPPED_TAGS: &[&str] = &["script", "style", "svg", "noscript", "iframe"];

const ALLOWED_ATTRIBUTES: &[&str] = &[
    "id",
    "class",
    "name",
    "type",
    "value",
    "placeholder",
    "href",
    "src",
    "action",
    "method",
    "role",
    "aria-label",
    "data-testid",
    "for",
    "title",
    "alt",
];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

pub fn is_allowed_attribute(name: &str) -> bool {
    ALLOWED_ATTRIBUTES.contains(&name) || (name.starts_with("data-") && name != MARKER_ATTRIBUTE)
}

pub fn is_stripped_tag(tag: &str) -> bool {
    STRIPPED_TAGS.contains(&tag)
}

pub fn is_engine_owned(element: &Element) -> bool {
    element.attr(MARKER_ATTRIBUTE).is_some()
}

/// Attribute-level visibility check; computed styles are not available here.
pub fn is_hidden_element(element: &Element) -> bool {
    if element.attr("hidden").is_some() {
        return true;
    }

    if element
        .attr("aria-hidden")
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return true;
    }

    if element.name() == "input"
        && element
            .attr("type")
            .map(|t| t.eq_ignore_ascii_case("hidden"))
            .unwrap_or(false)
    {
        return true;
    }

    if let Some(style) = element.attr("style") {
        let style: String = style
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if style.contains("display:none") || style.contains("visibility:hidden") {
            return true;
        }
    }

    false
}

/// Whether the node and its whole subtree are left out of the projection.
pub fn is_pruned(element: &Element) -> bool {
    is_stripped_tag(element.name()) || is_engine_owned(element) || is_hidden_element(element)
}

pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Serialise `root` (itself included) with pruning applied.
pub fn prune_element(root: ElementRef) -> String {
    let mut out = String::new();
    write_element(root, &mut out);
    out.trim().to_string()
}

/// Serialise only the children of `root`, e.g. the contents of `<body>`.
pub fn prune_children(root: ElementRef) -> String {
    let mut out = String::new();
    write_children(root, &mut out);
    out.trim().to_string()
}

fn write_element(element_ref: ElementRef, out: &mut String) {
    let element = element_ref.value();
    if is_pruned(element) {
        return;
    }

    let tag = element.name();
    out.push('<');
    out.push_str(tag);
    // Attribute order is not stable in the parsed tree; sort for reproducible output.
    let mut attributes: Vec<(&str, &str)> = element
        .attrs()
        .filter(|(name, _)| is_allowed_attribute(name))
        .collect();
    attributes.sort_by_key(|(name, _)| *name);
    for (name, value) in attributes {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_attribute(collapse_whitespace(value).trim()));
        out.push('"');
    }
    out.push('>');

    if VOID_ELEMENTS.contains(&tag) {
        return;
    }

    write_children(element_ref, out);

    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

fn write_children(element_ref: ElementRef, out: &mut String) {
    for child in element_ref.children() {
        match child.value() {
            Node::Element(_) => {
                if let Some(child_ref) = ElementRef::wrap(child) {
                    write_element(child_ref, out);
                }
            }
            Node::Text(text) => {
                let collapsed = collapse_whitespace(text);
                if !collapsed.trim().is_empty() {
                    out.push_str(&escape_text(&collapsed));
                }
            }
            _ => {}
        }
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Cut `text` to at most `max_chars` characters.
///
/// Returns the kept prefix and whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => (&text[..byte_index], true),
        None => (text, false),
    }
}
