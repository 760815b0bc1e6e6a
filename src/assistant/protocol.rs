//! The JSON shapes the model answers with, parsed leniently.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// `element` object of a final answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub js: Option<String>,
    #[serde(default)]
    pub css: Option<String>,
    /// Present only when an existing element is being updated.
    #[serde(default)]
    pub element_id: Option<String>,
}

impl ElementPayload {
    pub fn target_id(&self) -> Option<&str> {
        self.element_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    Message {
        message: String,
    },
    Element {
        message: String,
        element: ElementPayload,
    },
    Inspect {
        message: String,
        selectors: Vec<String>,
    },
}

impl ModelResponse {
    pub fn message(&self) -> &str {
        match self {
            ModelResponse::Message { message }
            | ModelResponse::Element { message, .. }
            | ModelResponse::Inspect { message, .. } => message,
        }
    }

    /// Parse model output. Never fails: anything that is not one of the known
    /// shapes becomes a plain message carrying the raw text.
    pub fn parse(text: &str, max_selectors: usize) -> Self {
        let raw = text.trim();
        let unfenced = strip_fences(raw);

        let parsed = serde_json::from_str::<RawResponse>(unfenced).ok().or_else(|| {
            outermost_object(unfenced)
                .and_then(|span| serde_json::from_str::<RawResponse>(span).ok())
        });

        match parsed.and_then(|raw| raw.into_response(max_selectors)) {
            Some(response) => response,
            None => {
                debug!("Model output is not structured, using it as a plain message");
                ModelResponse::Message {
                    message: raw.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    element: Option<ElementPayload>,
    #[serde(default)]
    inspect: Option<Vec<String>>,
}

impl RawResponse {
    fn into_response(self, max_selectors: usize) -> Option<ModelResponse> {
        let message = self.message.unwrap_or_default().trim().to_string();

        if let Some(element) = self.element {
            return Some(ModelResponse::Element { message, element });
        }

        let mut selectors: Vec<String> = Vec::new();
        for selector in self.inspect.unwrap_or_default() {
            let selector = selector.trim().to_string();
            if !selector.is_empty() && !selectors.contains(&selector) {
                selectors.push(selector);
            }
        }
        selectors.truncate(max_selectors);
        if !selectors.is_empty() {
            return Some(ModelResponse::Inspect { message, selectors });
        }

        if message.is_empty() {
            return None;
        }
        Some(ModelResponse::Message { message })
    }
}

/// Body of the first fenced block, or the input unchanged.
fn strip_fences(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // Skip the language tag line.
    let body = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_message() {
        let response = ModelResponse::parse(r#"{"message": "Hello there"}"#, 5);
        assert_eq!(
            response,
            ModelResponse::Message {
                message: "Hello there".into()
            }
        );
    }

    #[test]
    fn fenced_element_payload() {
        let text = "Here you go:\n```json\n{\"message\":\"Added\",\"element\":{\"name\":\"Dark mode\",\"description\":\"toggle\",\"js\":\"run()\",\"css\":\".x{}\"}}\n```\nEnjoy!";
        match ModelResponse::parse(text, 5) {
            ModelResponse::Element { message, element } => {
                assert_eq!(message, "Added");
                assert_eq!(element.name, "Dark mode");
                assert_eq!(element.js.as_deref(), Some("run()"));
                assert_eq!(element.target_id(), None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prose_around_an_unfenced_object() {
        let text = r#"Sure! {"message":"Updated","element":{"name":"b","elementId":"el_1","css":"a{}"}} Let me know."#;
        match ModelResponse::parse(text, 5) {
            ModelResponse::Element { element, .. } => {
                assert_eq!(element.target_id(), Some("el_1"));
                assert_eq!(element.js, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn inspect_requests_are_deduplicated_and_capped() {
        let text = r##"{"message":"Looking","inspect":["#a","#a","#b","#c","#d","#e","#f"]}"##;
        match ModelResponse::parse(text, 5) {
            ModelResponse::Inspect { selectors, .. } => {
                assert_eq!(selectors, ["#a", "#b", "#c", "#d", "#e"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_inspect_list_is_a_message() {
        let response = ModelResponse::parse(r#"{"message":"Nothing to see","inspect":[]}"#, 5);
        assert_eq!(response.message(), "Nothing to see");
        assert!(matches!(response, ModelResponse::Message { .. }));
    }

    #[test]
    fn broken_json_degrades_to_raw_text() {
        let text = r#"{"message": "unterminated"#;
        assert_eq!(
            ModelResponse::parse(text, 5),
            ModelResponse::Message {
                message: text.into()
            }
        );
        assert_eq!(
            ModelResponse::parse("I can't do that.", 5).message(),
            "I can't do that."
        );
    }
}
