//! In-memory doubles for the page and the model, shared by unit tests.

use crate::assistant::client::{ChatMessage, ChatModel};
use crate::core::{
    AssistantCall, PageChannel, PageMessage, PageReply, PageTrait, ScriptOutcome, Settings,
};
use crate::errors::{RemixError, Result};
use crate::inject::marker::expected_marker;
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// How [`FakePage`] reacts to generated code.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptBehavior {
    /// Creates one node carrying the code's marker (or the element id).
    Create,
    /// Throws on every run.
    Throw(String),
    /// Returns normally without creating anything.
    Silent,
    /// Like `Silent` until [`FakePage::render_target`], then like `Create`.
    WaitForTarget,
    /// Creates its node and then throws, for the given number of runs; after
    /// that like `Create`.
    CreateThenThrow(usize),
}

struct FakeState {
    url: String,
    html: String,
    behavior: ScriptBehavior,
    target_rendered: bool,
    nodes: HashMap<String, usize>,
    styles: Vec<(String, String)>,
    script_runs: usize,
    helpers_present: bool,
    helper_installs: usize,
    reloads: usize,
    fail_reload: bool,
    outbox: Vec<AssistantCall>,
    settled: Vec<(u64, std::result::Result<String, String>)>,
}

pub struct FakePage {
    state: Mutex<FakeState>,
    mutations: broadcast::Sender<()>,
    history: broadcast::Sender<()>,
    replaced: broadcast::Sender<()>,
}

impl FakePage {
    pub fn new(url: &str, html: &str) -> Self {
        let (mutations, _) = broadcast::channel(64);
        let (history, _) = broadcast::channel(16);
        let (replaced, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(FakeState {
                url: url.to_string(),
                html: html.to_string(),
                behavior: ScriptBehavior::Create,
                target_rendered: false,
                nodes: HashMap::new(),
                styles: Vec::new(),
                script_runs: 0,
                helpers_present: false,
                helper_installs: 0,
                reloads: 0,
                fail_reload: false,
                outbox: Vec::new(),
                settled: Vec::new(),
            }),
            mutations,
            history,
            replaced,
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake page state poisoned")
    }

    pub fn set_behavior(&self, behavior: ScriptBehavior) {
        self.state().behavior = behavior;
    }

    pub fn set_html(&self, html: &str) {
        self.state().html = html.to_string();
        self.mutate();
    }

    /// In-place navigation: the URL changes and a history event fires.
    pub fn set_url(&self, url: &str) {
        self.state().url = url.to_string();
        let _ = self.history.send(());
    }

    /// A load at the current URL that the engine did not ask for (F5, a form
    /// posting back to itself): the document and everything in it is gone.
    pub fn replace_document(&self) {
        self.clear_document();
        let _ = self.replaced.send(());
    }

    fn clear_document(&self) {
        let mut state = self.state();
        state.nodes.clear();
        state.styles.clear();
        state.helpers_present = false;
        state.target_rendered = false;
    }

    pub fn fail_reload(&self, fail: bool) {
        self.state().fail_reload = fail;
    }

    pub fn mutate(&self) {
        let _ = self.mutations.send(());
    }

    /// The node generated code waits for appears.
    pub fn render_target(&self) {
        self.state().target_rendered = true;
        self.mutate();
    }

    pub fn queue_assistant_call(&self, call: AssistantCall) {
        self.state().outbox.push(call);
    }

    pub fn settled_calls(&self) -> Vec<(u64, std::result::Result<String, String>)> {
        self.state().settled.clone()
    }

    pub fn marked_nodes(&self, marker: &str) -> usize {
        self.state().nodes.get(marker).copied().unwrap_or(0)
    }

    pub fn styles_for(&self, owner: &str) -> usize {
        self.state().styles.iter().filter(|(o, _)| o == owner).count()
    }

    pub fn script_runs(&self) -> usize {
        self.state().script_runs
    }

    /// Live mutation subscriptions; each running retry cycle holds one.
    pub fn mutation_subscribers(&self) -> usize {
        self.mutations.receiver_count()
    }

    pub fn helper_installs(&self) -> usize {
        self.state().helper_installs
    }

    pub fn reloads(&self) -> usize {
        self.state().reloads
    }
}

fn title_of(html: &str) -> String {
    let doc = Html::parse_document(html);
    let Ok(selector) = Selector::parse("title") else {
        return String::new();
    };
    doc.select(&selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl PageTrait for FakePage {
    async fn url(&self) -> Result<String> {
        Ok(self.state().url.clone())
    }

    async fn title(&self) -> Result<String> {
        let html = self.state().html.clone();
        Ok(title_of(&html))
    }

    async fn document_html(&self) -> Result<String> {
        Ok(self.state().html.clone())
    }

    async fn insert_style(&self, owner: &str, css: &str) -> Result<()> {
        self.state().styles.push((owner.to_string(), css.to_string()));
        Ok(())
    }

    /// Guarded per document, like the page-side flag.
    async fn install_helpers(&self, _bridge_timeout_ms: u64) -> Result<()> {
        let mut state = self.state();
        if !state.helpers_present {
            state.helpers_present = true;
            state.helper_installs += 1;
        }
        Ok(())
    }

    async fn run_script(&self, owner: &str, js: &str) -> Result<ScriptOutcome> {
        let (created, error) = {
            let mut guard = self.state();
            let state = &mut *guard;
            state.script_runs += 1;
            let (creates, error) = match &mut state.behavior {
                ScriptBehavior::Throw(message) => (false, Some(message.clone())),
                ScriptBehavior::Silent => (false, None),
                ScriptBehavior::WaitForTarget => (state.target_rendered, None),
                ScriptBehavior::Create => (true, None),
                ScriptBehavior::CreateThenThrow(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    (true, Some("anchor not found".to_string()))
                }
                ScriptBehavior::CreateThenThrow(_) => (true, None),
            };
            if creates {
                let marker = expected_marker(js, owner).unwrap_or_else(|| owner.to_string());
                *state.nodes.entry(marker).or_insert(0) += 1;
            }
            (creates, error)
        };
        if created {
            self.mutate();
        }
        Ok(match error {
            Some(message) => ScriptOutcome::threw(message),
            None => ScriptOutcome::ok(),
        })
    }

    async fn count_marked(&self, marker: &str) -> Result<usize> {
        Ok(self.marked_nodes(marker))
    }

    async fn remove_marked(&self, marker: &str) -> Result<usize> {
        let mut state = self.state();
        let mut removed = state.nodes.remove(marker).unwrap_or(0);
        let before = state.styles.len();
        state.styles.retain(|(owner, _)| owner != marker);
        removed += before - state.styles.len();
        Ok(removed)
    }

    async fn remove_created(&self, marker: &str) -> Result<usize> {
        Ok(self.state().nodes.remove(marker).unwrap_or(0))
    }

    async fn remove_all_marked(&self) -> Result<usize> {
        let mut state = self.state();
        let removed = state.nodes.values().sum::<usize>() + state.styles.len();
        state.nodes.clear();
        state.styles.clear();
        Ok(removed)
    }

    async fn reload(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.fail_reload {
                return Err(RemixError::NavigationFailed("reload was blocked".into()));
            }
            state.reloads += 1;
        }
        self.replace_document();
        Ok(())
    }

    fn mutations(&self) -> broadcast::Receiver<()> {
        self.mutations.subscribe()
    }

    fn history_events(&self) -> broadcast::Receiver<()> {
        self.history.subscribe()
    }

    fn document_replaced(&self) -> broadcast::Receiver<()> {
        self.replaced.subscribe()
    }

    async fn take_assistant_calls(&self) -> Result<Vec<AssistantCall>> {
        Ok(std::mem::take(&mut self.state().outbox))
    }

    async fn settle_assistant_call(
        &self,
        id: u64,
        result: std::result::Result<String, String>,
    ) -> Result<()> {
        self.state().settled.push((id, result));
        Ok(())
    }
}

/// Replays canned model output in order and records every request.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<String>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    /// `Err` entries surface as provider failures.
    pub fn with_results(results: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().expect("requests poisoned").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, _settings: &Settings, messages: &[ChatMessage]) -> Result<String> {
        self.requests
            .lock()
            .expect("requests poisoned")
            .push(messages.to_vec());
        let next = self.responses.lock().expect("responses poisoned").pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(RemixError::Provider(message)),
            None => Err(RemixError::Provider("no scripted response left".into())),
        }
    }
}

/// Channel wrapper whose first `failures` sends find nobody listening.
pub struct FlakyChannel<C> {
    inner: C,
    failures: AtomicUsize,
    reconnects: AtomicUsize,
}

impl<C> FlakyChannel<C> {
    pub fn new(inner: C, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            reconnects: AtomicUsize::new(0),
        }
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<C: PageChannel> PageChannel for FlakyChannel<C> {
    async fn send(&self, message: PageMessage) -> Result<PageReply> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(RemixError::PageUnreachable("no content agent in this tab".into()));
        }
        self.inner.send(message).await
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.reconnect().await
    }
}
