use crate::assistant::elements::ElementStore;
use crate::browser::navigation::{NavigationEvent, NavigationWatcher};
use crate::core::{Config, KeyValueStore, PageChannel, PageMessage, PageReply, PageTrait};
use crate::dom::{FragmentService, PageContextBuilder};
use crate::errors::{RemixError, Result};
use crate::inject::bridge::AssistantBridge;
use crate::inject::InjectionEngine;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ASSISTANT_CALL_POLL: Duration = Duration::from_millis(100);

/// Page side of one tab: answers [`PageMessage`]s, keeps elements applied
/// across navigation and relays `callAssistant` requests.
pub struct ContentAgent<P: PageTrait + ?Sized, S: KeyValueStore + ?Sized> {
    page: Arc<P>,
    engine: InjectionEngine<P>,
    elements: ElementStore<S>,
    context: PageContextBuilder,
    fragments: FragmentService,
    poll_interval: Duration,
    bridge_timeout_ms: u64,
}

impl<P, S> ContentAgent<P, S>
where
    P: PageTrait + ?Sized + 'static,
    S: KeyValueStore + ?Sized + 'static,
{
    pub fn new(page: Arc<P>, store: Arc<S>, config: &Config) -> Self {
        Self {
            engine: InjectionEngine::new(page.clone(), config),
            page,
            elements: ElementStore::new(store),
            context: PageContextBuilder::new(config.context.clone()),
            fragments: FragmentService::new(config.context.fragment_max_chars),
            poll_interval: Duration::from_millis(config.navigation.poll_interval_ms),
            bridge_timeout_ms: config.assistant.bridge_timeout_ms,
        }
    }

    pub fn engine(&self) -> &InjectionEngine<P> {
        &self.engine
    }

    pub fn page(&self) -> &Arc<P> {
        &self.page
    }

    /// Apply every enabled element saved for the current URL.
    pub async fn autoload(&self) -> Result<usize> {
        let url = self.page.url().await?;
        let elements = self.elements.for_url(&url).await?;
        debug!("{} elements saved for {}", elements.len(), url);
        self.engine.autoload(&elements).await?;
        Ok(elements.len())
    }

    /// Old view's retries are cancelled and its nodes purged before the new
    /// view's auto-load starts.
    pub async fn on_navigation(&self, event: &NavigationEvent) -> Result<()> {
        if event.document_replaced {
            info!("Page reloaded at {} after {}ms", event.to, event.dwell_ms);
        } else {
            info!(
                "Page changed from {} to {} after {}ms",
                event.from, event.to, event.dwell_ms
            );
        }
        self.engine.reset_for_navigation().await?;
        self.autoload().await?;
        Ok(())
    }

    pub async fn reload(&self) -> Result<()> {
        self.engine.reset_for_navigation().await?;
        self.page.reload().await?;
        self.autoload().await?;
        Ok(())
    }

    /// Watch for in-place navigation until `cancel` fires.
    pub async fn watch_navigation(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut watcher = NavigationWatcher::new(&*self.page, self.poll_interval).await?;
        while let Some(event) = watcher.next_change(&*self.page, &cancel).await {
            if let Err(e) = self.on_navigation(&event).await {
                warn!("Re-applying elements after navigation failed: {}", e);
            }
        }
        debug!("Navigation watcher stopped");
        Ok(())
    }

    /// Forward `callAssistant` requests raised in the page through `bridge`
    /// and settle their promises with the answer.
    pub async fn relay_assistant_calls(
        self: Arc<Self>,
        bridge: Arc<AssistantBridge>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let abandoned = bridge.pending_count().await;
                    if abandoned > 0 {
                        debug!("Stopping relay with {} unanswered assistant calls", abandoned);
                    }
                    break;
                }
                _ = tokio::time::sleep(ASSISTANT_CALL_POLL) => {}
            }

            let calls = match self.page.take_assistant_calls().await {
                Ok(calls) => calls,
                Err(e) => {
                    debug!("Could not read pending assistant calls: {}", e);
                    continue;
                }
            };

            for call in calls {
                let agent = self.clone();
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    let timeout =
                        Duration::from_millis(call.timeout_ms.unwrap_or(agent.bridge_timeout_ms));
                    let id = call.id;
                    let result = bridge
                        .request(call, timeout)
                        .await
                        .unwrap_or_else(|e| Err(e.to_string()));
                    if let Err(e) = agent.page.settle_assistant_call(id, result).await {
                        warn!("Could not settle callAssistant request {}: {}", id, e);
                    }
                });
            }
        }
    }

    async fn handle(&self, message: PageMessage) -> Result<PageReply> {
        match message {
            PageMessage::GetPageContext => {
                let context = self.context.capture_page(&*self.page).await?;
                Ok(PageReply::PageContext(context))
            }
            PageMessage::GetDomFragment {
                selector,
                max_length,
            } => {
                let result = self
                    .fragments
                    .fragment_from_page(&*self.page, &selector, max_length)
                    .await?;
                Ok(PageReply::DomFragment(result))
            }
            PageMessage::InjectElement { element_id, code } => {
                self.engine.inject(&element_id, &code).await?;
                Ok(PageReply::Done)
            }
            PageMessage::RemoveElement { element_id } => {
                self.engine.remove(&element_id).await?;
                Ok(PageReply::Done)
            }
            PageMessage::ExecuteReload => {
                self.reload().await?;
                Ok(PageReply::Done)
            }
            PageMessage::ExecuteAutoload => {
                self.autoload().await?;
                Ok(PageReply::Done)
            }
            PageMessage::Ping => Ok(PageReply::Pong),
        }
    }
}

#[async_trait]
impl<P, S> PageChannel for ContentAgent<P, S>
where
    P: PageTrait + ?Sized + 'static,
    S: KeyValueStore + ?Sized + 'static,
{
    /// Handler failures come back as `PageReply::Error`; only a dead page is
    /// an `Err`.
    async fn send(&self, message: PageMessage) -> Result<PageReply> {
        match self.handle(message).await {
            Ok(reply) => Ok(reply),
            Err(e @ RemixError::PageUnreachable(_)) => Err(e),
            Err(e) => Ok(PageReply::Error {
                message: e.to_string(),
            }),
        }
    }

    async fn reconnect(&self) -> Result<()> {
        self.page.install_helpers(self.bridge_timeout_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::elements::{Element, ElementCode};
    use crate::core::config::RetryConfig;
    use crate::core::MemoryStore;
    use crate::inject::bridge::Bridge;
    use crate::inject::RetryOutcome;
    use crate::testing::FakePage;

    const PAGE: &str = "<html><head><title>Inbox</title></head>\
                        <body><main id=\"inbox\"><h1>Inbox</h1></main></body></html>";

    fn config() -> Config {
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            mutation_debounce_ms: 5,
        };
        let mut config = Config {
            injection: retry.clone(),
            autoload: retry,
            ..Config::default()
        };
        config.navigation.poll_interval_ms = 10;
        config
    }

    fn element(url: &str) -> Element {
        Element::new(
            url,
            "Badge",
            "",
            ElementCode {
                js: "const b = document.createElement('b');\n\
                     b.setAttribute('data-remix-id', ELEMENT_ID);"
                    .into(),
                css: "b { color: red }".into(),
            },
        )
    }

    #[tokio::test]
    async fn answers_context_and_fragment_requests() {
        let page = Arc::new(FakePage::new("https://mail.test/inbox", PAGE));
        let agent = ContentAgent::new(page, Arc::new(MemoryStore::new()), &config());

        match agent.send(PageMessage::GetPageContext).await.unwrap() {
            PageReply::PageContext(context) => {
                assert_eq!(context.title, "Inbox");
                assert!(context.simplified_html.contains("<h1>Inbox</h1>"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let reply = agent
            .send(PageMessage::GetDomFragment {
                selector: "#missing".into(),
                max_length: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            PageReply::DomFragment(crate::dom::FragmentResult::Failed { .. })
        ));
        assert_eq!(agent.send(PageMessage::Ping).await.unwrap(), PageReply::Pong);
    }

    #[tokio::test]
    async fn load_reapplies_enabled_elements_for_the_normalized_url() {
        let page = Arc::new(FakePage::new("https://mail.test/inbox#unread", PAGE));
        let store = Arc::new(MemoryStore::new());
        let elements = ElementStore::new(store.clone());

        let on = element("https://mail.test/inbox");
        let mut off = element("https://mail.test/inbox");
        off.enabled = false;
        let other = element("https://mail.test/sent");
        for e in [on.clone(), off.clone(), other.clone()] {
            elements.upsert(e).await.unwrap();
        }

        let agent = ContentAgent::new(page.clone(), store, &config());
        assert_eq!(agent.send(PageMessage::ExecuteReload).await.unwrap(), PageReply::Done);
        assert_eq!(
            agent.engine().wait(&on.id).await,
            Some(RetryOutcome::Succeeded { attempts: 1 })
        );

        assert_eq!(page.reloads(), 1);
        assert_eq!(page.marked_nodes(&on.id), 1);
        assert_eq!(page.marked_nodes(&off.id), 0);
        assert_eq!(page.marked_nodes(&other.id), 0);
    }

    #[tokio::test]
    async fn navigation_swaps_the_applied_elements() {
        let page = Arc::new(FakePage::new("https://mail.test/inbox", PAGE));
        let store = Arc::new(MemoryStore::new());
        let elements = ElementStore::new(store.clone());
        let inbox = element("https://mail.test/inbox");
        let sent = element("https://mail.test/sent");
        elements.upsert(inbox.clone()).await.unwrap();
        elements.upsert(sent.clone()).await.unwrap();

        let agent = Arc::new(ContentAgent::new(page.clone(), store, &config()));
        agent.autoload().await.unwrap();
        agent.engine().wait(&inbox.id).await;
        assert_eq!(page.marked_nodes(&inbox.id), 1);

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(agent.clone().watch_navigation(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        page.set_url("https://mail.test/sent");

        let mut applied = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if page.marked_nodes(&sent.id) == 1 {
                applied = true;
                break;
            }
        }
        cancel.cancel();
        watcher.await.unwrap().unwrap();

        assert!(applied);
        assert_eq!(page.marked_nodes(&inbox.id), 0);
        assert_eq!(page.styles_for(&inbox.id), 0);
    }

    #[tokio::test]
    async fn a_reload_of_the_same_url_reapplies_elements() {
        let page = Arc::new(FakePage::new("https://mail.test/inbox", PAGE));
        let store = Arc::new(MemoryStore::new());
        let inbox = element("https://mail.test/inbox");
        ElementStore::new(store.clone())
            .upsert(inbox.clone())
            .await
            .unwrap();

        let agent = Arc::new(ContentAgent::new(page.clone(), store, &config()));
        agent.autoload().await.unwrap();
        agent.engine().wait(&inbox.id).await;
        assert_eq!(page.helper_installs(), 1);

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(agent.clone().watch_navigation(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        page.replace_document();
        assert_eq!(page.marked_nodes(&inbox.id), 0);

        let mut applied = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if page.marked_nodes(&inbox.id) == 1 {
                applied = true;
                break;
            }
        }
        cancel.cancel();
        watcher.await.unwrap().unwrap();

        assert!(applied);
        assert_eq!(page.styles_for(&inbox.id), 1);
        assert_eq!(page.helper_installs(), 2);
    }

    #[tokio::test]
    async fn handler_failures_are_error_replies() {
        let page = Arc::new(FakePage::new("https://mail.test/inbox", PAGE));
        page.fail_reload(true);
        let agent = ContentAgent::new(page, Arc::new(MemoryStore::new()), &config());

        match agent.send(PageMessage::ExecuteReload).await.unwrap() {
            PageReply::Error { message } => assert!(message.contains("reload was blocked")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn assistant_calls_are_relayed_and_settled() {
        let page = Arc::new(FakePage::new("https://mail.test/inbox", PAGE));
        let agent = Arc::new(ContentAgent::new(
            page.clone(),
            Arc::new(MemoryStore::new()),
            &config(),
        ));
        let (bridge, mut endpoint) = Bridge::channel(4);
        let responder = endpoint.responder();
        tokio::spawn(async move {
            while let Some((id, call)) = endpoint.next().await {
                let call: crate::core::AssistantCall = call;
                responder.respond(id, Ok(format!("echo: {}", call.prompt))).await;
            }
        });

        let cancel = CancellationToken::new();
        let relay = tokio::spawn(agent.relay_assistant_calls(Arc::new(bridge), cancel.clone()));
        page.queue_assistant_call(crate::core::AssistantCall {
            id: 3,
            prompt: "summarize".into(),
            system: None,
            timeout_ms: Some(1_000),
        });

        let mut settled = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            settled = page.settled_calls();
            if !settled.is_empty() {
                break;
            }
        }
        cancel.cancel();
        relay.await.unwrap();

        assert_eq!(settled, vec![(3, Ok("echo: summarize".to_string()))]);
    }
}
