//! One chat turn: build context, call the model, inspect as needed, then
//! apply and record the answer.

use crate::assistant::client::{ChatMessage, ChatModel};
use crate::assistant::conversation::{ConversationEntry, ConversationLog};
use crate::assistant::elements::{normalize_url, Element, ElementCode, ElementStore, MAX_NAME_CHARS};
use crate::assistant::prompt;
use crate::assistant::protocol::{ElementPayload, ModelResponse};
use crate::assistant::settings::SettingsStore;
use crate::core::config::AssistantConfig;
use crate::core::{KeyValueStore, PageChannel, PageMessage, PageReply, Settings};
use crate::dom::{FragmentResult, PageContext};
use crate::errors::{RemixError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

pub const FALSE_UPDATE_CAVEAT: &str = "Note: the code I returned is identical to what is already saved, so nothing was changed. Try describing the change differently.";

const INSPECTION_EXHAUSTED: &str = "I could not finish looking through the page. Could you point me to the part you mean?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementAction {
    Created,
    Updated,
    /// An update whose code matched the stored code; nothing was touched.
    FalseUpdate,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub message: String,
    pub element: Option<Element>,
    pub action: ElementAction,
    pub inspection_rounds: u32,
}

pub struct Orchestrator<C: PageChannel + ?Sized, S: KeyValueStore + ?Sized> {
    channel: Arc<C>,
    model: Arc<dyn ChatModel>,
    settings: SettingsStore<S>,
    elements: ElementStore<S>,
    conversations: ConversationLog<S>,
    config: AssistantConfig,
}

impl<C, S> Orchestrator<C, S>
where
    C: PageChannel + ?Sized,
    S: KeyValueStore + ?Sized,
{
    pub fn new(
        channel: Arc<C>,
        model: Arc<dyn ChatModel>,
        store: Arc<S>,
        config: AssistantConfig,
    ) -> Self {
        Self {
            channel,
            model,
            settings: SettingsStore::new(store.clone()),
            elements: ElementStore::new(store.clone()),
            conversations: ConversationLog::new(store, config.conversation_cap),
            config,
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.settings = self.settings.with_env_overrides();
        self
    }

    pub fn elements(&self) -> &ElementStore<S> {
        &self.elements
    }

    pub fn conversations(&self) -> &ConversationLog<S> {
        &self.conversations
    }

    /// Run one user turn against the page behind the channel.
    ///
    /// Configuration and page access problems abort before anything is
    /// recorded. A provider failure records the prompt but no reply.
    pub async fn run_turn(&self, user_prompt: &str) -> Result<TurnOutcome> {
        let settings = self.settings.load().await?;
        settings.validate()?;

        let context = self.page_context().await?;
        ensure_customizable(&context.url)?;
        let url = context.url.clone();

        let existing = self.elements.all_for_url(&url).await?;
        let history = self
            .conversations
            .history(&url, self.config.history_turns)
            .await?;
        let mut messages = prompt::build_request(
            self.config.max_inspect_selectors,
            &context,
            &existing,
            &history,
            user_prompt,
        );

        let (response, rounds) = match self.converse(&settings, &mut messages).await {
            Ok(result) => result,
            Err(e) => {
                self.conversations
                    .append(&url, ConversationEntry::user(user_prompt))
                    .await?;
                return Err(e);
            }
        };

        let mut outcome = self.apply(&url, response).await?;
        outcome.inspection_rounds = rounds;

        self.conversations
            .append(&url, ConversationEntry::user(user_prompt))
            .await?;
        self.conversations
            .append(
                &url,
                ConversationEntry::assistant(
                    &outcome.message,
                    matches!(outcome.action, ElementAction::Created | ElementAction::Updated),
                    outcome.action == ElementAction::Updated,
                ),
            )
            .await?;

        info!(
            "Turn finished on {} ({:?}, {} inspection rounds)",
            url, outcome.action, rounds
        );
        Ok(outcome)
    }

    /// Call the model, serving inspection requests until it answers or the
    /// round budget runs out.
    async fn converse(
        &self,
        settings: &Settings,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<(ModelResponse, u32)> {
        let max_rounds = self.config.max_inspection_rounds;
        let mut rounds = 0;

        loop {
            let text = self.model.complete(settings, messages).await?;
            let response = ModelResponse::parse(&text, self.config.max_inspect_selectors);

            let (message, selectors) = match response {
                ModelResponse::Inspect { message, selectors } => (message, selectors),
                other => return Ok((other, rounds)),
            };
            if rounds >= max_rounds {
                debug!("Inspection budget spent, treating the last reply as final");
                let message = if message.is_empty() {
                    INSPECTION_EXHAUSTED.to_string()
                } else {
                    message
                };
                return Ok((ModelResponse::Message { message }, rounds));
            }

            rounds += 1;
            debug!("Inspection round {}: {:?}", rounds, selectors);
            let mut results = Vec::with_capacity(selectors.len());
            for selector in &selectors {
                results.push(self.inspect(selector).await?);
            }
            messages.push(ChatMessage::assistant(text));
            messages.push(ChatMessage::user(prompt::fragments_message(
                &results,
                max_rounds - rounds,
            )));
        }
    }

    async fn inspect(&self, selector: &str) -> Result<FragmentResult> {
        let reply = self
            .send(PageMessage::GetDomFragment {
                selector: selector.to_string(),
                max_length: None,
            })
            .await?;
        Ok(match reply {
            PageReply::DomFragment(result) => result,
            PageReply::Error { message } => FragmentResult::Failed {
                selector: selector.to_string(),
                error: message,
            },
            other => FragmentResult::Failed {
                selector: selector.to_string(),
                error: format!("unexpected reply {other:?}"),
            },
        })
    }

    async fn apply(&self, url: &str, response: ModelResponse) -> Result<TurnOutcome> {
        let (message, payload) = match response {
            ModelResponse::Element { message, element } => (message, element),
            other => {
                return Ok(TurnOutcome {
                    message: other.message().to_string(),
                    element: None,
                    action: ElementAction::None,
                    inspection_rounds: 0,
                })
            }
        };

        if let Some(target) = payload.target_id().map(str::to_string) {
            match self.elements.get(&target).await? {
                Some(existing) => return self.apply_update(message, existing, payload).await,
                None => warn!("Model referenced unknown element {}, creating a new one", target),
            }
        }
        self.apply_create(url, message, payload).await
    }

    async fn apply_update(
        &self,
        message: String,
        existing: Element,
        payload: ElementPayload,
    ) -> Result<TurnOutcome> {
        let code = ElementCode {
            js: payload.js.unwrap_or_else(|| existing.code.js.clone()),
            css: payload.css.unwrap_or_else(|| existing.code.css.clone()),
        };

        if code.same_as(&existing.code) {
            warn!("Update for {} repeats the stored code, ignoring it", existing.id);
            return Ok(TurnOutcome {
                message: with_caveat(&message),
                element: Some(existing),
                action: ElementAction::FalseUpdate,
                inspection_rounds: 0,
            });
        }

        let mut updated = existing;
        updated.replace_code(code);
        if !payload.name.trim().is_empty() {
            updated.name = payload.name.trim().chars().take(MAX_NAME_CHARS).collect();
        }
        if !payload.description.trim().is_empty() {
            updated.description = payload.description.trim().to_string();
        }
        self.elements.upsert(updated.clone()).await?;
        self.reapply(&updated).await;

        Ok(TurnOutcome {
            message: or_default(message, || format!("Updated \"{}\".", updated.name)),
            element: Some(updated),
            action: ElementAction::Updated,
            inspection_rounds: 0,
        })
    }

    async fn apply_create(
        &self,
        url: &str,
        message: String,
        payload: ElementPayload,
    ) -> Result<TurnOutcome> {
        let code = ElementCode {
            js: payload.js.unwrap_or_default(),
            css: payload.css.unwrap_or_default(),
        };
        if code.is_empty() {
            debug!("Element payload without code, answering with the message only");
            return Ok(TurnOutcome {
                message,
                element: None,
                action: ElementAction::None,
                inspection_rounds: 0,
            });
        }

        let element = Element::new(url, &payload.name, &payload.description, code);
        self.elements.upsert(element.clone()).await?;
        self.reapply(&element).await;

        Ok(TurnOutcome {
            message: or_default(message, || format!("Created \"{}\".", element.name)),
            element: Some(element),
            action: ElementAction::Created,
            inspection_rounds: 0,
        })
    }

    /// Put `element` on the live page. A reload lets auto-load rebuild a clean
    /// state; direct injection is the fallback. Failures are only logged.
    async fn reapply(&self, element: &Element) {
        if !element.enabled {
            return;
        }
        match self.send(PageMessage::ExecuteReload).await {
            Ok(PageReply::Done) => return,
            Ok(other) => warn!("Reload was refused ({:?}), injecting in place", other),
            Err(e) => warn!("Reload failed ({}), injecting in place", e),
        }

        if let Err(e) = self
            .send(PageMessage::RemoveElement {
                element_id: element.id.clone(),
            })
            .await
        {
            warn!("Could not remove the old version of {}: {}", element.id, e);
        }
        match self
            .send(PageMessage::InjectElement {
                element_id: element.id.clone(),
                code: element.code.clone(),
            })
            .await
        {
            Ok(PageReply::Done) => {}
            Ok(other) => warn!("Injecting {} was refused: {:?}", element.id, other),
            Err(e) => warn!("Injecting {} failed: {}", element.id, e),
        }
    }

    /// Replace an element's code directly, as from the per-element editor.
    pub async fn edit_element_code(&self, element_id: &str, code: ElementCode) -> Result<Element> {
        let updated = self
            .elements
            .replace_code(element_id, code)
            .await?
            .ok_or_else(|| RemixError::ElementNotFound(element_id.to_string()))?;
        self.reapply(&updated).await;
        Ok(updated)
    }

    /// Per-element code chat: the model only sees this element, and any code
    /// it returns updates it. The exchange is not added to the page's log.
    pub async fn element_chat(&self, element_id: &str, request: &str) -> Result<TurnOutcome> {
        let settings = self.settings.load().await?;
        settings.validate()?;
        let existing = self
            .elements
            .get(element_id)
            .await?
            .ok_or_else(|| RemixError::ElementNotFound(element_id.to_string()))?;

        let mut messages = vec![ChatMessage::system(prompt::system_instructions(0))];
        let described = prompt::existing_elements_message(std::slice::from_ref(&existing));
        if let Some(described) = described {
            messages.push(ChatMessage::system(described));
        }
        messages.push(ChatMessage::user(format!(
            "Change only element {}: {}",
            existing.id, request
        )));

        let text = self.model.complete(&settings, &messages).await?;
        match ModelResponse::parse(&text, 0) {
            ModelResponse::Element {
                message,
                mut element,
            } => {
                element.element_id = Some(existing.id.clone());
                self.apply_update(message, existing, element).await
            }
            other => Ok(TurnOutcome {
                message: other.message().to_string(),
                element: Some(existing),
                action: ElementAction::None,
                inspection_rounds: 0,
            }),
        }
    }

    /// Toggle an element. `current_url` is the page the channel is attached
    /// to; the live page is only touched when the element belongs there.
    pub async fn set_element_enabled(
        &self,
        element_id: &str,
        enabled: bool,
        current_url: &str,
    ) -> Result<Element> {
        let element = self
            .elements
            .set_enabled(element_id, enabled)
            .await?
            .ok_or_else(|| RemixError::ElementNotFound(element_id.to_string()))?;

        if element.url == normalize_url(current_url) {
            let message = if enabled {
                PageMessage::InjectElement {
                    element_id: element.id.clone(),
                    code: element.code.clone(),
                }
            } else {
                PageMessage::RemoveElement {
                    element_id: element.id.clone(),
                }
            };
            if let Err(e) = self.send(message).await {
                warn!("Could not update {} on the live page: {}", element.id, e);
            }
        }
        Ok(element)
    }

    pub async fn delete_element(&self, element_id: &str) -> Result<Element> {
        let removed = self
            .elements
            .delete(element_id)
            .await?
            .ok_or_else(|| RemixError::ElementNotFound(element_id.to_string()))?;
        if let Err(e) = self
            .send(PageMessage::RemoveElement {
                element_id: removed.id.clone(),
            })
            .await
        {
            warn!("Could not remove {} from the live page: {}", removed.id, e);
        }
        Ok(removed)
    }

    pub async fn conversation(&self, url: &str) -> Result<Vec<ConversationEntry>> {
        self.conversations.entries(url).await
    }

    pub async fn clear_conversation(&self, url: &str) -> Result<()> {
        self.conversations.clear(url).await
    }

    async fn page_context(&self) -> Result<PageContext> {
        match self.send(PageMessage::GetPageContext).await? {
            PageReply::PageContext(context) => Ok(context),
            PageReply::Error { message } => Err(RemixError::PageAccess(message)),
            other => Err(RemixError::PageAccess(format!("unexpected reply {other:?}"))),
        }
    }

    /// Send once; if nothing answers, reconnect and try exactly once more.
    async fn send(&self, message: PageMessage) -> Result<PageReply> {
        match self.channel.send(message.clone()).await {
            Err(RemixError::PageUnreachable(reason)) => {
                debug!("Page unreachable ({}), reconnecting", reason);
                self.channel
                    .reconnect()
                    .await
                    .map_err(|e| RemixError::PageAccess(format!("could not reconnect: {e}")))?;
                self.channel.send(message).await.map_err(|e| match e {
                    RemixError::PageUnreachable(reason) => RemixError::PageAccess(reason),
                    other => other,
                })
            }
            other => other,
        }
    }
}

/// Only ordinary web pages can be customized.
fn ensure_customizable(url: &str) -> Result<()> {
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(RemixError::PageAccess(format!(
            "{url} is a browser-internal or unsupported page"
        ))),
    }
}

fn with_caveat(message: &str) -> String {
    if message.trim().is_empty() {
        FALSE_UPDATE_CAVEAT.to_string()
    } else {
        format!("{}\n\n{}", message.trim(), FALSE_UPDATE_CAVEAT)
    }
}

fn or_default(message: String, fallback: impl FnOnce() -> String) -> String {
    if message.trim().is_empty() {
        fallback()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::client::ChatRole;
    use crate::browser::agent::ContentAgent;
    use crate::core::config::RetryConfig;
    use crate::core::{Config, MemoryStore, PageTrait};
    use crate::inject::marker::has_marker_assignment;
    use crate::testing::{FakePage, FlakyChannel, ScriptedModel};
    use serde_json::json;

    const PAGE: &str = r#"<html><head><title>Shop</title></head><body>
        <header id="top"><nav><a href="/">Home</a></nav></header>
        <main id="content"><h1>Products</h1><button class="buy">Buy</button></main>
    </body></html>"#;

    const DARK_MODE: &str = r#"{"message":"Added a dark mode toggle.","element":{"name":"Dark mode toggle","description":"Top-right toggle","js":"const b = document.createElement('button');\nb.setAttribute('data-remix-id', ELEMENT_ID);\nb.textContent = '🌙';\nb.onclick = () => document.documentElement.classList.toggle('remix-dark');\ndocument.body.appendChild(b);","css":"[data-remix-id] { position: fixed; top: 12px; right: 12px; }\n.remix-dark { filter: invert(1); }"}}"#;

    type TestAgent = ContentAgent<FakePage, MemoryStore>;

    struct Harness {
        page: Arc<FakePage>,
        store: Arc<MemoryStore>,
        model: Arc<ScriptedModel>,
        orchestrator: Orchestrator<TestAgent, MemoryStore>,
    }

    fn test_config() -> Config {
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            mutation_debounce_ms: 5,
        };
        Config {
            injection: retry.clone(),
            autoload: retry,
            ..Config::default()
        }
    }

    async fn harness(url: &str, responses: Vec<std::result::Result<String, String>>) -> Harness {
        let page = Arc::new(FakePage::new(url, PAGE));
        let store = Arc::new(MemoryStore::new());
        SettingsStore::new(store.clone())
            .save(&Settings {
                api_key: "sk-test".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let config = test_config();
        let agent = Arc::new(ContentAgent::new(page.clone(), store.clone(), &config));
        let model = Arc::new(ScriptedModel::with_results(responses));
        let orchestrator = Orchestrator::new(agent, model.clone(), store.clone(), config.assistant);
        Harness {
            page,
            store,
            model,
            orchestrator,
        }
    }

    /// Same page and store, different model script.
    fn rebuild(h: &Harness, model: Arc<ScriptedModel>) -> Orchestrator<TestAgent, MemoryStore> {
        Orchestrator::new(
            Arc::new(ContentAgent::new(h.page.clone(), h.store.clone(), &test_config())),
            model,
            h.store.clone(),
            AssistantConfig::default(),
        )
    }

    fn ok(responses: &[&str]) -> Vec<std::result::Result<String, String>> {
        responses.iter().map(|r| Ok(r.to_string())).collect()
    }

    #[tokio::test]
    async fn dark_mode_request_creates_an_enabled_verifiable_element() {
        let h = harness("https://shop.test/products#grid", ok(&[DARK_MODE])).await;
        let outcome = h
            .orchestrator
            .run_turn("Add a dark mode toggle in the top-right corner")
            .await
            .unwrap();

        assert_eq!(outcome.action, ElementAction::Created);
        let element = outcome.element.unwrap();
        assert!(element.enabled);
        assert!(!element.code.js.is_empty());
        assert!(!element.code.css.is_empty());
        assert!(has_marker_assignment(&element.code.js));
        assert_eq!(element.url, "https://shop.test/products");

        let saved = h.orchestrator.elements().get(&element.id).await.unwrap();
        assert_eq!(saved.as_ref(), Some(&element));

        // Applied by reload + auto-load.
        assert_eq!(h.page.reloads(), 1);
        let mut applied = false;
        for _ in 0..50 {
            if h.page.marked_nodes(&element.id) == 1 {
                applied = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(applied);

        let request = &h.model.requests()[0];
        assert!(request[1].content.contains("Main content"));
        assert_eq!(request.last().unwrap().role, ChatRole::User);

        let log = h.orchestrator.conversation("https://shop.test/products").await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[1].has_element);
        assert!(!log[1].is_element_update);
    }

    async fn seed_button_element(h: &Harness) -> Element {
        let element = Element::new(
            "https://shop.test/products",
            "Button style",
            "Restyles the buy button",
            ElementCode {
                js: "document.querySelector('.buy')\n\
                     .setAttribute('data-remix-id', ELEMENT_ID);"
                    .into(),
                css: ".buy { background: red; }".into(),
            },
        );
        h.orchestrator.elements().upsert(element.clone()).await.unwrap();
        element
    }

    #[tokio::test]
    async fn button_color_update_changes_css_and_keeps_js() {
        let h = harness("https://shop.test/products", Vec::new()).await;
        let element = seed_button_element(&h).await;
        let reply = json!({
            "message": "The button is blue now.",
            "element": {
                "elementId": element.id,
                "name": "Button style",
                "css": ".buy { background: blue; }"
            }
        })
        .to_string();
        let model = Arc::new(ScriptedModel::new(vec![reply]));
        let orchestrator = rebuild(&h, model.clone());

        let outcome = orchestrator.run_turn("change the button color to blue").await.unwrap();

        assert_eq!(outcome.action, ElementAction::Updated);
        let updated = outcome.element.unwrap();
        assert_eq!(updated.id, element.id);
        assert_ne!(updated.code.css, element.code.css);
        assert_eq!(updated.code.js, element.code.js);
        assert_eq!(orchestrator.elements().list().await.unwrap().len(), 1);

        let existing_context = &model.requests()[0][2].content;
        assert!(existing_context.contains(&element.id));
        assert!(existing_context.contains(".buy { background: red; }"));

        let log = orchestrator.conversation("https://shop.test/products").await.unwrap();
        assert!(log[1].is_element_update);
    }

    #[tokio::test]
    async fn identical_update_is_a_no_op_with_a_caveat() {
        let h = harness("https://shop.test/products", Vec::new()).await;
        let element = seed_button_element(&h).await;
        let reply = json!({
            "message": "Done!",
            "element": {
                "elementId": element.id,
                "js": format!("  {}\n", element.code.js),
                "css": element.code.css,
            }
        })
        .to_string();
        let orchestrator = rebuild(&h, Arc::new(ScriptedModel::new(vec![reply])));

        let outcome = orchestrator.run_turn("make it pop").await.unwrap();

        assert_eq!(outcome.action, ElementAction::FalseUpdate);
        assert!(outcome.message.contains(FALSE_UPDATE_CAVEAT));
        let stored = orchestrator.elements().get(&element.id).await.unwrap().unwrap();
        assert_eq!(stored, element);
        assert_eq!(h.page.reloads(), 0);
        assert_eq!(h.page.script_runs(), 0);

        let log = orchestrator.conversation("https://shop.test/products").await.unwrap();
        assert!(!log[1].has_element);
    }

    #[tokio::test]
    async fn inspection_rounds_feed_fragments_back() {
        let inspect = r##"{"message":"Let me look.","inspect":["#content","#nope"]}"##;
        let h = harness("https://shop.test/products", ok(&[inspect, DARK_MODE])).await;

        let outcome = h.orchestrator.run_turn("add dark mode").await.unwrap();

        assert_eq!(outcome.inspection_rounds, 1);
        assert_eq!(outcome.action, ElementAction::Created);
        let second = &h.model.requests()[1];
        let fragments = &second.last().unwrap().content;
        assert!(fragments.contains("<h1>Products</h1>"));
        assert!(fragments.contains("no element matches this selector"));
        assert_eq!(second[second.len() - 2].role, ChatRole::Assistant);
    }

    #[tokio::test]
    async fn inspection_stops_after_the_round_budget() {
        let inspect = r#"{"message":"Still looking.","inspect":["main"]}"#;
        let h = harness(
            "https://shop.test/products",
            ok(&[inspect, inspect, inspect, inspect, inspect]),
        )
        .await;

        let outcome = h.orchestrator.run_turn("what is on this page?").await.unwrap();

        assert_eq!(outcome.inspection_rounds, 3);
        assert_eq!(outcome.message, "Still looking.");
        assert_eq!(outcome.action, ElementAction::None);
        assert_eq!(h.model.requests().len(), 4);
    }

    #[tokio::test]
    async fn unparseable_output_becomes_a_message() {
        let h = harness("https://shop.test/products", ok(&["Sorry, I can only chat."])).await;
        let outcome = h.orchestrator.run_turn("hi").await.unwrap();
        assert_eq!(outcome.message, "Sorry, I can only chat.");
        assert!(outcome.element.is_none());
    }

    #[tokio::test]
    async fn provider_errors_record_only_the_prompt() {
        let h = harness(
            "https://shop.test/products",
            vec![Err("Incorrect API key provided".into())],
        )
        .await;

        let result = h.orchestrator.run_turn("add dark mode").await;
        assert!(matches!(result, Err(RemixError::Provider(_))));

        let log = h.orchestrator.conversation("https://shop.test/products").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].role, ChatRole::User);
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_calling_the_model() {
        let h = harness("https://shop.test/products", ok(&[DARK_MODE])).await;
        SettingsStore::new(h.store.clone())
            .save(&Settings::default())
            .await
            .unwrap();

        let result = h.orchestrator.run_turn("add dark mode").await;
        assert!(matches!(result, Err(RemixError::Configuration(_))));
        assert!(h.model.requests().is_empty());
    }

    #[tokio::test]
    async fn internal_pages_are_rejected() {
        let h = harness("chrome://settings", ok(&[DARK_MODE])).await;
        let result = h.orchestrator.run_turn("add dark mode").await;
        assert!(matches!(result, Err(RemixError::PageAccess(_))));
        assert!(h.model.requests().is_empty());
    }

    #[tokio::test]
    async fn unreachable_page_is_retried_once_after_reconnecting() {
        let page = Arc::new(FakePage::new("https://shop.test/products", PAGE));
        let store = Arc::new(MemoryStore::new());
        SettingsStore::new(store.clone())
            .save(&Settings {
                api_key: "sk-test".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let agent = ContentAgent::new(page.clone(), store.clone(), &test_config());

        let flaky = Arc::new(FlakyChannel::new(agent, 1));
        let model = Arc::new(ScriptedModel::new(vec![r#"{"message":"hi"}"#.to_string()]));
        let orchestrator =
            Orchestrator::new(flaky.clone(), model, store.clone(), AssistantConfig::default());
        assert_eq!(orchestrator.run_turn("hello").await.unwrap().message, "hi");
        assert_eq!(flaky.reconnects(), 1);

        let dead = Arc::new(FlakyChannel::new(
            ContentAgent::new(page, store.clone(), &test_config()),
            2,
        ));
        let model = Arc::new(ScriptedModel::new(vec![r#"{"message":"hi"}"#.to_string()]));
        let orchestrator = Orchestrator::new(dead, model, store, AssistantConfig::default());
        assert!(matches!(
            orchestrator.run_turn("hello").await,
            Err(RemixError::PageAccess(_))
        ));
    }

    #[tokio::test]
    async fn reload_failure_falls_back_to_in_place_injection() {
        let h = harness("https://shop.test/products", ok(&[DARK_MODE])).await;
        h.page.fail_reload(true);

        let outcome = h.orchestrator.run_turn("add dark mode").await.unwrap();
        let element = outcome.element.unwrap();

        let mut applied = false;
        for _ in 0..50 {
            if h.page.marked_nodes(&element.id) == 1 {
                applied = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(applied);
        assert_eq!(h.page.styles_for(&element.id), 1);
    }

    #[tokio::test]
    async fn toggling_and_deleting_update_the_live_page() {
        let h = harness("https://shop.test/products", Vec::new()).await;
        let element = seed_button_element(&h).await;
        let url = h.page.url().await.unwrap();

        h.orchestrator
            .set_element_enabled(&element.id, true, &url)
            .await
            .unwrap();
        let mut applied = false;
        for _ in 0..50 {
            if h.page.marked_nodes(&element.id) == 1 {
                applied = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(applied);

        let disabled = h
            .orchestrator
            .set_element_enabled(&element.id, false, &url)
            .await
            .unwrap();
        assert!(!disabled.enabled);
        assert_eq!(h.page.marked_nodes(&element.id), 0);
        assert_eq!(h.page.styles_for(&element.id), 0);

        h.orchestrator.delete_element(&element.id).await.unwrap();
        assert!(h.orchestrator.elements().list().await.unwrap().is_empty());
        assert!(matches!(
            h.orchestrator.delete_element(&element.id).await,
            Err(RemixError::ElementNotFound(_))
        ));
    }

    #[tokio::test]
    async fn element_chat_updates_only_the_named_element() {
        let h = harness("https://shop.test/products", Vec::new()).await;
        let element = seed_button_element(&h).await;
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"message":"Rounded.","element":{"css":".buy { background: red; border-radius: 8px; }"}}"#
                .to_string(),
        ]));
        let orchestrator = rebuild(&h, model);

        let outcome = orchestrator
            .element_chat(&element.id, "round the corners")
            .await
            .unwrap();

        assert_eq!(outcome.action, ElementAction::Updated);
        let updated = outcome.element.unwrap();
        assert!(updated.code.css.contains("border-radius"));
        assert_eq!(updated.code.js, element.code.js);
        assert!(orchestrator
            .conversation("https://shop.test/products")
            .await
            .unwrap()
            .is_empty());
    }
}
