use crate::core::config::ContextConfig;
use crate::dom::prune::{collapse_whitespace, is_engine_owned, is_stripped_tag};
use crate::dom::selectors::{css_escape, NameHeuristic};
use scraper::ElementRef;
use std::sync::Arc;

const MAX_CLASSES_SHOWN: usize = 2;

/// Indented skeleton of the live tree: the map the assistant uses to ask for
/// fragments when the simplified HTML was cut short.
pub struct OutlineBuilder {
    max_depth: usize,
    root_children: usize,
    children: usize,
    text_preview: usize,
    heuristic: Arc<dyn NameHeuristic>,
}

impl OutlineBuilder {
    pub fn new(config: &ContextConfig, heuristic: Arc<dyn NameHeuristic>) -> Self {
        Self {
            max_depth: config.outline_depth,
            root_children: config.outline_root_children,
            children: config.outline_children,
            text_preview: config.outline_text_preview,
            heuristic,
        }
    }

    pub fn build(&self, root: ElementRef) -> String {
        let mut lines = Vec::new();
        self.walk(root, 0, &mut lines);
        lines.join("\n")
    }

    fn walk(&self, element: ElementRef, depth: usize, lines: &mut Vec<String>) {
        let children: Vec<ElementRef> = element
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|child| {
                !is_stripped_tag(child.value().name()) && !is_engine_owned(child.value())
            })
            .collect();

        lines.push(self.describe(element, depth, children.len()));

        if depth >= self.max_depth {
            return;
        }

        let cap = if depth <= 1 {
            self.root_children
        } else {
            self.children
        };
        for child in children.iter().take(cap) {
            self.walk(*child, depth + 1, lines);
        }
        if children.len() > cap {
            lines.push(format!(
                "{}… {} more elided",
                "  ".repeat(depth + 1),
                children.len() - cap
            ));
        }
    }

    fn describe(&self, element: ElementRef, depth: usize, child_count: usize) -> String {
        let value = element.value();
        let mut line = format!("{}{}", "  ".repeat(depth), value.name());

        if let Some(id) = value.attr("id").map(str::trim).filter(|id| !id.is_empty()) {
            if self.heuristic.is_stable_id(id) {
                line.push('#');
                line.push_str(&css_escape(id));
            }
        }

        for class in value
            .classes()
            .filter(|class| self.heuristic.is_stable_class(class))
            .take(MAX_CLASSES_SHOWN)
        {
            line.push('.');
            line.push_str(&css_escape(class));
        }

        if let Some(role) = value.attr("role") {
            line.push_str(&format!(" [role={role}]"));
        }

        if child_count > 0 {
            line.push_str(&format!(" ({child_count} children)"));
        } else {
            let text = collapse_whitespace(&element.text().collect::<String>());
            let text = text.trim();
            if !text.is_empty() {
                let preview: String = text.chars().take(self.text_preview).collect();
                let ellipsis = if text.chars().count() > self.text_preview {
                    "…"
                } else {
                    ""
                };
                line.push_str(&format!(" \"{preview}{ellipsis}\""));
            }
        }

        line
    }
}
