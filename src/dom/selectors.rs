use crate::dom::prune::{is_engine_owned, is_pruned};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tags that are good anchors on their own when they occur once.
const SEMANTIC_TAGS: &[&str] = &[
    "main", "nav", "header", "footer", "aside", "article", "section", "form", "search", "h1",
];

const MAX_ARIA_LABEL_LEN: usize = 50;
const MAX_PATH_ANCESTORS: usize = 4;
const MAX_LARGE_BLOCKS: usize = 3;
const LARGE_BLOCK_MIN_DESCENDANTS: usize = 5;

const LANDMARK_REGIONS: &[(&str, &str)] = &[
    ("Main content", r#"main, [role="main"]"#),
    ("Navigation", r#"nav, [role="navigation"]"#),
    ("Header", r#"header, [role="banner"]"#),
    ("Footer", r#"footer, [role="contentinfo"]"#),
    ("Sidebar", r#"aside, [role="complementary"]"#),
    ("Article", "article"),
    ("Search", r#"search, [role="search"], input[type="search"]"#),
];

static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4,}").expect("valid regex"));
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("valid regex"));

/// Build tooling prefixes whose class names change between deploys.
const GENERATED_CLASS_PREFIXES: &[&str] = &["css-", "sc-", "jsx-", "emotion-", "svelte-"];

/// Decides whether an id or class name looks hand-authored (and so stable).
pub trait NameHeuristic: Send + Sync {
    fn is_stable_id(&self, id: &str) -> bool;

    fn is_stable_class(&self, class: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct HandAuthoredNames {
    pub max_id_len: usize,
    pub max_class_len: usize,
}

impl Default for HandAuthoredNames {
    fn default() -> Self {
        Self {
            max_id_len: 40,
            max_class_len: 30,
        }
    }
}

impl HandAuthoredNames {
    fn looks_authored(name: &str, max_len: usize) -> bool {
        name.len() <= max_len && IDENTIFIER.is_match(name) && !DIGIT_RUN.is_match(name)
    }

    /// Segments such as `a1B2c` in `Button_root__a1B2c` come from CSS modules.
    fn has_hash_segment(name: &str) -> bool {
        name.split(['-', '_']).any(|segment| {
            segment.len() >= 5
                && segment.chars().any(|c| c.is_ascii_digit())
                && segment.chars().any(|c| c.is_ascii_alphabetic())
        })
    }
}

impl NameHeuristic for HandAuthoredNames {
    fn is_stable_id(&self, id: &str) -> bool {
        Self::looks_authored(id, self.max_id_len)
    }

    fn is_stable_class(&self, class: &str) -> bool {
        Self::looks_authored(class, self.max_class_len)
            && !Self::has_hash_segment(class)
            && !GENERATED_CLASS_PREFIXES
                .iter()
                .any(|prefix| class.starts_with(prefix))
    }
}

/// A semantically significant region with selectors already verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub label: String,
    pub selectors: Vec<String>,
}

#[derive(Clone)]
pub struct SelectorSynthesizer {
    heuristic: Arc<dyn NameHeuristic>,
}

impl Default for SelectorSynthesizer {
    fn default() -> Self {
        Self::new(Arc::new(HandAuthoredNames::default()))
    }
}

impl SelectorSynthesizer {
    pub fn new(heuristic: Arc<dyn NameHeuristic>) -> Self {
        Self { heuristic }
    }

    pub fn heuristic(&self) -> Arc<dyn NameHeuristic> {
        self.heuristic.clone()
    }

    /// Selectors for `node`, most stable first. Each one resolves to exactly `node`.
    pub fn build_working_selectors(&self, doc: &Html, node: ElementRef) -> Vec<String> {
        let mut verified: Vec<String> = Vec::new();
        for candidate in self.candidates(node) {
            if verified.contains(&candidate) {
                continue;
            }
            if resolves_uniquely(doc, &candidate, node) {
                verified.push(candidate);
            }
        }
        verified
    }

    fn candidates(&self, node: ElementRef) -> Vec<String> {
        let element = node.value();
        let tag = element.name();
        let mut candidates = Vec::new();

        if SEMANTIC_TAGS.contains(&tag) {
            candidates.push(tag.to_string());
        }

        if let Some(role) = non_empty(element.attr("role")) {
            candidates.push(format!("[role={}]", quote_attribute(role)));
        }

        if let Some(id) = non_empty(element.attr("id")) {
            if self.heuristic.is_stable_id(id) {
                candidates.push(format!("#{}", css_escape(id)));
            }
        }

        if let Some(test_id) = non_empty(element.attr("data-testid")) {
            candidates.push(format!("[data-testid={}]", quote_attribute(test_id)));
        }

        for class in element.classes() {
            if self.heuristic.is_stable_class(class) {
                candidates.push(format!("{}.{}", tag, css_escape(class)));
            }
        }

        if let Some(label) = non_empty(element.attr("aria-label")) {
            if label.chars().count() <= MAX_ARIA_LABEL_LEN {
                candidates.push(format!("[aria-label={}]", quote_attribute(label)));
            }
        }

        candidates.push(structural_path(node));
        candidates
    }

    /// Pre-verified anchors for well-known page regions plus the largest
    /// top-level blocks of the body.
    pub fn scan_landmarks(&self, doc: &Html) -> Vec<Landmark> {
        let mut landmarks = Vec::new();
        let mut used = Vec::new();

        for (label, selector_str) in LANDMARK_REGIONS {
            let Ok(selector) = Selector::parse(selector_str) else {
                continue;
            };
            let Some(found) = doc
                .select(&selector)
                .find(|candidate| !is_engine_owned(candidate.value()))
            else {
                continue;
            };
            let selectors = self.build_working_selectors(doc, found);
            if selectors.is_empty() {
                continue;
            }
            used.push(found.id());
            landmarks.push(Landmark {
                label: label.to_string(),
                selectors,
            });
        }

        let Some(body) = body_of(doc) else {
            return landmarks;
        };

        let mut blocks: Vec<(usize, ElementRef)> = body
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|child| !is_pruned(child.value()) && !used.contains(&child.id()))
            .map(|child| (descendant_elements(child), child))
            .filter(|(size, _)| *size >= LARGE_BLOCK_MIN_DESCENDANTS)
            .collect();
        blocks.sort_by(|a, b| b.0.cmp(&a.0));

        for (index, (_, block)) in blocks.into_iter().take(MAX_LARGE_BLOCKS).enumerate() {
            let selectors = self.build_working_selectors(doc, block);
            if selectors.is_empty() {
                continue;
            }
            landmarks.push(Landmark {
                label: format!("Top-level block {} <{}>", index + 1, block.value().name()),
                selectors,
            });
        }

        landmarks
    }
}

/// True when `selector` parses and matches `node` and nothing else.
pub fn resolves_uniquely(doc: &Html, selector: &str, node: ElementRef) -> bool {
    let Ok(parsed) = Selector::parse(selector) else {
        return false;
    };
    let mut matches = doc.select(&parsed);
    match (matches.next(), matches.next()) {
        (Some(only), None) => only.id() == node.id(),
        _ => false,
    }
}

/// `tag:nth-of-type(i)` chain from `node` upward, at most four ancestors deep,
/// anchored at `body` when it is reached.
pub fn structural_path(node: ElementRef) -> String {
    let mut segments = Vec::new();
    let mut current = Some(node);
    let mut level = 0;

    while let Some(element) = current {
        let tag = element.value().name();
        if tag == "body" || tag == "html" {
            segments.push(tag.to_string());
            break;
        }
        if level > MAX_PATH_ANCESTORS {
            break;
        }

        let index = 1 + element
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .filter(|sibling| sibling.value().name() == tag)
            .count();
        segments.push(format!("{tag}:nth-of-type({index})"));

        current = element.parent().and_then(ElementRef::wrap);
        level += 1;
    }

    segments.reverse();
    segments.join(" > ")
}

pub fn body_of(doc: &Html) -> Option<ElementRef<'_>> {
    let selector = Selector::parse("body").ok()?;
    doc.select(&selector).next()
}

fn descendant_elements(element: ElementRef) -> usize {
    element
        .descendants()
        .filter(|node| node.value().is_element())
        .count()
        .saturating_sub(1)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn quote_attribute(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Escape a CSS identifier (id or class name).
pub fn css_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.chars().enumerate() {
        match c {
            'a'..='z' | 'A'..='Z' | '_' | '-' => out.push(c),
            '0'..='9' if i > 0 => out.push(c),
            '0'..='9' => out.push_str(&format!("\\{:x} ", c as u32)),
            _ => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out
}
