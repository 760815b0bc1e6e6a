use crate::core::config::ContextConfig;
use crate::core::PageTrait;
use crate::dom::outline::OutlineBuilder;
use crate::dom::prune::{prune_children, truncate_chars};
use crate::dom::selectors::{body_of, Landmark, SelectorSynthesizer};
use crate::errors::Result;
use scraper::Html;
use serde::{Deserialize, Serialize};

/// Simplified, size-bounded view of a page, built fresh for each chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub simplified_html: String,
    pub landmarks: Vec<Landmark>,
    pub outline: String,
    pub truncated: bool,
    /// Length of the projection before truncation, in characters.
    pub html_length: usize,
}

pub struct PageContextBuilder {
    config: ContextConfig,
    synthesizer: SelectorSynthesizer,
}

impl PageContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self::with_synthesizer(config, SelectorSynthesizer::default())
    }

    pub fn with_synthesizer(config: ContextConfig, synthesizer: SelectorSynthesizer) -> Self {
        Self {
            config,
            synthesizer,
        }
    }

    pub async fn capture_page<P: PageTrait + ?Sized>(&self, page: &P) -> Result<PageContext> {
        let url = page.url().await?;
        let title = page.title().await?;
        let html = page.document_html().await?;
        Ok(self.capture(&html, &url, &title))
    }

    pub fn capture(&self, html: &str, url: &str, title: &str) -> PageContext {
        let doc = Html::parse_document(html);
        let Some(body) = body_of(&doc) else {
            return PageContext {
                url: url.to_string(),
                title: title.to_string(),
                simplified_html: String::new(),
                landmarks: Vec::new(),
                outline: String::new(),
                truncated: false,
                html_length: 0,
            };
        };

        let projected = prune_children(body);
        let html_length = projected.chars().count();
        let (kept, truncated) = truncate_chars(&projected, self.config.max_html_chars);
        let simplified_html = if truncated {
            format!(
                "{kept}\n<!-- truncated: showing {} of {html_length} characters; use the outline to inspect more -->",
                self.config.max_html_chars
            )
        } else {
            kept.to_string()
        };

        let landmarks = self.synthesizer.scan_landmarks(&doc);
        let outline = OutlineBuilder::new(&self.config, self.synthesizer.heuristic()).build(body);

        PageContext {
            url: url.to_string(),
            title: title.to_string(),
            simplified_html,
            landmarks,
            outline,
            truncated,
            html_length,
        }
    }
}
