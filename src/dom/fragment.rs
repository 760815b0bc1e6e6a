use crate::core::PageTrait;
use crate::dom::prune::{prune_element, truncate_chars};
use crate::errors::Result;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomFragment {
    pub selector: String,
    pub html: String,
    pub tag: String,
    pub child_count: usize,
    /// Pruned length before truncation, in characters.
    pub total_length: usize,
    pub truncated: bool,
}

/// Either a fragment or a failure the assistant can read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FragmentResult {
    Found(DomFragment),
    Failed { selector: String, error: String },
}

impl FragmentResult {
    fn failed(selector: &str, error: impl Into<String>) -> Self {
        FragmentResult::Failed {
            selector: selector.to_string(),
            error: error.into(),
        }
    }

    pub fn fragment(&self) -> Option<&DomFragment> {
        match self {
            FragmentResult::Found(fragment) => Some(fragment),
            FragmentResult::Failed { .. } => None,
        }
    }
}

/// Serves bounded HTML for one selector during inspection rounds.
#[derive(Debug, Clone)]
pub struct FragmentService {
    default_max_length: usize,
}

impl FragmentService {
    pub fn new(default_max_length: usize) -> Self {
        Self { default_max_length }
    }

    pub async fn fragment_from_page<P: PageTrait + ?Sized>(
        &self,
        page: &P,
        selector: &str,
        max_length: Option<usize>,
    ) -> Result<FragmentResult> {
        let html = page.document_html().await?;
        Ok(self.fragment(&html, selector, max_length))
    }

    /// Never fails: bad selectors and misses come back as `FragmentResult::Failed`.
    pub fn fragment(
        &self,
        html: &str,
        selector: &str,
        max_length: Option<usize>,
    ) -> FragmentResult {
        let parsed = match Selector::parse(selector) {
            Ok(parsed) => parsed,
            Err(e) => return FragmentResult::failed(selector, format!("invalid selector: {e:?}")),
        };

        let doc = Html::parse_document(html);
        let Some(element) = doc.select(&parsed).next() else {
            return FragmentResult::failed(selector, "no element matches this selector");
        };

        let max_length = max_length.unwrap_or(self.default_max_length);
        let pruned = prune_element(element);
        let total_length = pruned.chars().count();
        let (kept, truncated) = truncate_chars(&pruned, max_length);
        let html = if truncated {
            format!("{kept}\n<!-- truncated: showing {max_length} of {total_length} characters -->")
        } else {
            kept.to_string()
        };

        FragmentResult::Found(DomFragment {
            selector: selector.to_string(),
            html,
            tag: element.value().name().to_lowercase(),
            child_count: element.children().filter_map(ElementRef::wrap).count(),
            total_length,
            truncated,
        })
    }
}
