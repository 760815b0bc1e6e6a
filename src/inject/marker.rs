//! Learns which marker value generated code promises to leave in the DOM.
//!
//! Only literal assignments are recognised. Code that builds the attribute name
//! at runtime yields `None`, and the engine then falls back to "did not throw".

use crate::core::{ELEMENT_ID_BINDING, MARKER_ATTRIBUTE};
use once_cell::sync::Lazy;
use regex::Regex;

static SET_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"setAttribute\(\s*['"`]{attr}['"`]\s*,\s*(?:['"`]([^'"`]+)['"`]|({binding})\b)"#,
        attr = regex::escape(MARKER_ATTRIBUTE),
        binding = ELEMENT_ID_BINDING
    ))
    .expect("valid regex")
});

static DATASET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"dataset\.remixId\s*=\s*(?:['"`]([^'"`]+)['"`]|({binding})\b)"#,
        binding = ELEMENT_ID_BINDING
    ))
    .expect("valid regex")
});

static INLINE_MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"{attr}=\\?["']([A-Za-z0-9_:-]+|\$\{{{binding}\}})\\?["']"#,
        attr = regex::escape(MARKER_ATTRIBUTE),
        binding = ELEMENT_ID_BINDING
    ))
    .expect("valid regex")
});

/// The marker value the code assigns, resolving `ELEMENT_ID` to `element_id`.
pub fn expected_marker(js: &str, element_id: &str) -> Option<String> {
    for pattern in [&*SET_ATTRIBUTE, &*DATASET] {
        if let Some(captures) = pattern.captures(js) {
            if let Some(literal) = captures.get(1) {
                return Some(literal.as_str().to_string());
            }
            if captures.get(2).is_some() {
                return Some(element_id.to_string());
            }
        }
    }

    INLINE_MARKUP.captures(js).map(|captures| {
        let value = &captures[1];
        if value.starts_with("${") {
            element_id.to_string()
        } else {
            value.to_string()
        }
    })
}

/// Whether the code contains any recognisable marker assignment.
pub fn has_marker_assignment(js: &str) -> bool {
    expected_marker(js, "").is_some()
}
