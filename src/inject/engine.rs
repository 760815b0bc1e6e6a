use crate::assistant::elements::{Element, ElementCode};
use crate::core::{Config, PageTrait};
use crate::errors::{RemixError, Result};
use crate::inject::marker::expected_marker;
use crate::inject::retry::{spawn_retry, RetryPolicy, RetryTask};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Script queued for verified execution.
#[derive(Debug, Clone)]
struct PendingScript {
    element_id: String,
    js: String,
    /// Marker the code promises to create, when it could be read from the source.
    marker: Option<String>,
}

impl PendingScript {
    fn new(element_id: &str, js: &str) -> Self {
        Self {
            element_id: element_id.to_string(),
            js: js.to_string(),
            marker: expected_marker(js, element_id),
        }
    }

    /// One attempt: the script must not throw and, when a marker is known,
    /// must leave a node carrying it. Nodes a failed attempt left behind are
    /// removed first; the element's style stays.
    async fn run_once<P: PageTrait + ?Sized>(&self, page: &P, attempt: u32) -> Result<bool> {
        if attempt > 1 {
            let mut leftovers = page.remove_created(&self.element_id).await?;
            if let Some(marker) = self.marker.as_ref().filter(|m| **m != self.element_id) {
                leftovers += page.remove_created(marker).await?;
            }
            if leftovers > 0 {
                debug!(
                    "Removed {} nodes left by a failed attempt of {}",
                    leftovers, self.element_id
                );
            }
        }

        let outcome = page.run_script(&self.element_id, &self.js).await?;
        if let Some(error) = outcome.error {
            return Err(RemixError::JavaScriptFailed(error));
        }
        match &self.marker {
            Some(marker) => Ok(page.count_marked(marker).await? > 0),
            None => Ok(true),
        }
    }
}

/// State scoped to one page lifetime. Replaced wholesale on navigation.
#[derive(Default)]
struct PageSession {
    /// One verified retry cycle per element, whether started by `inject` or
    /// by auto-load.
    tasks: HashMap<String, RetryTask>,
    /// Inferred markers that differ from the element id.
    markers: HashMap<String, String>,
}

/// Owns every node it (or code it runs) tags with the marker attribute, and is
/// the only thing that removes them.
pub struct InjectionEngine<P: PageTrait + ?Sized> {
    page: Arc<P>,
    injection: RetryPolicy,
    autoload: RetryPolicy,
    bridge_timeout_ms: u64,
    session: Mutex<PageSession>,
}

impl<P: PageTrait + ?Sized + 'static> InjectionEngine<P> {
    pub fn new(page: Arc<P>, config: &Config) -> Self {
        Self {
            page,
            injection: RetryPolicy::from(&config.injection),
            autoload: RetryPolicy::from(&config.autoload),
            bridge_timeout_ms: config.assistant.bridge_timeout_ms,
            session: Mutex::new(PageSession::default()),
        }
    }

    pub fn page(&self) -> &Arc<P> {
        &self.page
    }

    /// Apply one element's code. Any earlier version is removed first, so
    /// repeated calls leave a single set of tagged nodes.
    ///
    /// Script failures are retried in the background and never reported here.
    pub async fn inject(&self, element_id: &str, code: &ElementCode) -> Result<()> {
        self.apply(element_id, code, self.injection.clone()).await
    }

    /// Cancel any retry for `element_id` and delete every node it owns.
    ///
    /// An attempt already running is allowed to finish before the nodes are
    /// removed, so nothing it creates survives.
    pub async fn remove(&self, element_id: &str) -> Result<usize> {
        let (task, marker) = {
            let mut session = self.session.lock().await;
            (
                session.tasks.remove(element_id),
                session.markers.remove(element_id),
            )
        };
        if let Some(task) = task {
            task.cancel();
            task.outcome().await;
        }

        let mut removed = self.page.remove_marked(element_id).await?;
        if let Some(marker) = marker {
            removed += self.page.remove_marked(&marker).await?;
        }
        if removed > 0 {
            debug!("Removed {} nodes owned by element {}", removed, element_id);
        }
        Ok(removed)
    }

    /// Re-establish `elements` on a freshly rendered view. Each enabled
    /// element gets its own cycle under the auto-load policy, so removing or
    /// re-injecting one element never disturbs the others.
    pub async fn autoload(&self, elements: &[Element]) -> Result<()> {
        let enabled: Vec<&Element> = elements.iter().filter(|e| e.enabled).collect();
        if enabled.is_empty() {
            return Ok(());
        }
        info!("Auto-loading {} elements", enabled.len());

        for element in enabled {
            self.apply(&element.id, &element.code, self.autoload.clone())
                .await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        element_id: &str,
        code: &ElementCode,
        policy: RetryPolicy,
    ) -> Result<()> {
        self.remove(element_id).await?;

        if !code.css.trim().is_empty() {
            self.page.insert_style(element_id, &code.css).await?;
        }
        if code.js.trim().is_empty() {
            return Ok(());
        }

        // Guarded page-side, so a replaced document always gets them back.
        self.page.install_helpers(self.bridge_timeout_ms).await?;

        let script = PendingScript::new(element_id, &code.js);
        match &script.marker {
            Some(marker) => debug!("Element {} is verified by marker {}", element_id, marker),
            None => debug!(
                "No marker assignment found for element {}; success means no exception",
                element_id
            ),
        }

        let page = self.page.clone();
        let shared = Arc::new(script.clone());
        let task = spawn_retry(
            format!("apply {element_id}"),
            policy,
            move |attempt| {
                let page = page.clone();
                let script = shared.clone();
                async move { script.run_once(&*page, attempt).await }
            },
            |created| *created,
            Some(self.page.mutations()),
        );

        let mut session = self.session.lock().await;
        if let Some(marker) = script.marker.filter(|m| m != element_id) {
            session.markers.insert(element_id.to_string(), marker);
        }
        if let Some(previous) = session.tasks.insert(element_id.to_string(), task) {
            previous.cancel();
        }
        Ok(())
    }

    /// Cancel every in-flight cycle and purge all tagged nodes. Must complete
    /// before the next view's auto-load starts.
    pub async fn reset_for_navigation(&self) -> Result<usize> {
        let previous = {
            let mut session = self.session.lock().await;
            std::mem::take(&mut *session)
        };
        let cancelled = previous.tasks.len();
        for task in previous.tasks.values() {
            task.cancel();
        }
        for (_, task) in previous.tasks {
            task.outcome().await;
        }
        debug!("Cancelled {} retry cycles for the outgoing view", cancelled);

        let removed = self.page.remove_all_marked().await?;
        if removed > 0 {
            debug!("Purged {} injected nodes", removed);
        }
        Ok(removed)
    }

    /// Element ids whose retry cycle is still running.
    pub async fn active_tasks(&self) -> Vec<String> {
        let session = self.session.lock().await;
        let mut ids: Vec<String> = session
            .tasks
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait for the retry cycle of `element_id`, if one was started.
    #[cfg(any(test, feature = "testing"))]
    pub async fn wait(&self, element_id: &str) -> Option<crate::inject::RetryOutcome> {
        let task = self.session.lock().await.tasks.remove(element_id)?;
        let outcome = task.outcome().await;
        if !outcome.is_success() {
            debug!("Element {} did not apply: {:?}", element_id, outcome);
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RetryConfig;
    use crate::inject::RetryOutcome;
    use crate::testing::{FakePage, ScriptBehavior};
    use std::time::Duration;

    const TOGGLE_JS: &str = r#"const b = document.createElement('button');
b.setAttribute('data-remix-id', ELEMENT_ID);
document.body.appendChild(b);"#;

    fn config(max_attempts: u32, base_delay_ms: u64) -> Config {
        let retry = RetryConfig {
            max_attempts,
            base_delay_ms,
            max_delay_ms: base_delay_ms * 4,
            mutation_debounce_ms: 10,
        };
        Config {
            injection: retry.clone(),
            autoload: retry,
            ..Config::default()
        }
    }

    fn code(js: &str, css: &str) -> ElementCode {
        ElementCode {
            js: js.to_string(),
            css: css.to_string(),
        }
    }

    fn engine(page: &Arc<FakePage>, config: Config) -> InjectionEngine<FakePage> {
        InjectionEngine::new(page.clone(), &config)
    }

    #[tokio::test]
    async fn injecting_twice_leaves_one_set_of_nodes() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        let engine = engine(&page, config(3, 5));
        let toggle = code(TOGGLE_JS, "button { color: red; }");

        engine.inject("el_1", &toggle).await.unwrap();
        engine.inject("el_1", &toggle).await.unwrap();
        let outcome = engine.wait("el_1").await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(page.marked_nodes("el_1"), 1);
        assert_eq!(page.styles_for("el_1"), 1);
        assert_eq!(page.helper_installs(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_the_configured_attempts() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::Throw("Cannot read properties of null".into()));
        let engine = engine(&page, config(3, 1));

        engine.inject("el_1", &code(TOGGLE_JS, "")).await.unwrap();
        let outcome = engine.wait("el_1").await.unwrap();

        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 3, .. }));
        assert_eq!(page.script_runs(), 3);
        assert!(engine.active_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn silent_code_without_its_marker_is_a_failure() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::Silent);
        let engine = engine(&page, config(2, 1));

        engine.inject("el_1", &code(TOGGLE_JS, "")).await.unwrap();
        let outcome = engine.wait("el_1").await.unwrap();

        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn code_without_a_marker_succeeds_when_it_does_not_throw() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::Silent);
        let engine = engine(&page, config(5, 1));

        engine
            .inject("el_1", &code("document.title = 'Remixed';", ""))
            .await
            .unwrap();

        assert_eq!(
            engine.wait("el_1").await,
            Some(RetryOutcome::Succeeded { attempts: 1 })
        );
    }

    #[tokio::test]
    async fn dom_changes_retry_before_the_backoff_expires() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::WaitForTarget);
        let engine = engine(&page, config(5, 10_000));

        engine.inject("el_1", &code(TOGGLE_JS, "")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        page.render_target();

        let outcome = tokio::time::timeout(Duration::from_secs(2), engine.wait("el_1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 2 });
        assert_eq!(page.marked_nodes("el_1"), 1);
    }

    #[tokio::test]
    async fn remove_deletes_nodes_under_an_inferred_marker() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        let engine = engine(&page, config(3, 1));
        let js = "const d = document.createElement('div');\n\
                  d.setAttribute('data-remix-id', 'banner');";

        engine.inject("el_9", &code(js, "div { color: blue }")).await.unwrap();
        assert!(engine.wait("el_9").await.unwrap().is_success());
        assert_eq!(page.marked_nodes("banner"), 1);

        engine.remove("el_9").await.unwrap();
        assert_eq!(page.marked_nodes("banner"), 0);
        assert_eq!(page.styles_for("el_9"), 0);
    }

    #[tokio::test]
    async fn navigation_cancels_pending_cycles_and_purges_nodes() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::WaitForTarget);
        let engine = engine(&page, config(10, 10_000));

        engine.inject("el_1", &code(TOGGLE_JS, "a { }")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.active_tasks().await, vec!["el_1".to_string()]);

        engine.reset_for_navigation().await.unwrap();
        let runs = page.script_runs();
        page.render_target();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(page.script_runs(), runs);
        assert_eq!(page.styles_for("el_1"), 0);
        assert!(engine.active_tasks().await.is_empty());
        assert!(engine.wait("el_1").await.is_none());
    }

    #[tokio::test]
    async fn autoload_reestablishes_enabled_elements_only() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        let engine = engine(&page, config(3, 1));

        let mut first = Element::new("https://example.com/", "Toggle", "", code(TOGGLE_JS, "b {}"));
        first.id = "el_a".into();
        let mut second = Element::new("https://example.com/", "Badge", "", code(TOGGLE_JS, ""));
        second.id = "el_b".into();
        second.enabled = false;

        engine.autoload(&[first, second]).await.unwrap();
        let outcome = engine.wait("el_a").await.unwrap();

        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 1 });
        assert!(engine.wait("el_b").await.is_none());
        assert_eq!(page.marked_nodes("el_a"), 1);
        assert_eq!(page.marked_nodes("el_b"), 0);
        assert_eq!(page.styles_for("el_a"), 1);
    }

    fn toggle_element(id: &str) -> Element {
        let mut element = Element::new("https://example.com/", "Toggle", "", code(TOGGLE_JS, ""));
        element.id = id.into();
        element
    }

    #[tokio::test]
    async fn removing_an_element_stops_its_autoload() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::WaitForTarget);
        let engine = engine(&page, config(10, 10_000));

        engine.autoload(&[toggle_element("el_a")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.remove("el_a").await.unwrap();

        page.render_target();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(page.marked_nodes("el_a"), 0);
        assert!(engine.active_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn injecting_over_a_pending_autoload_applies_once() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::WaitForTarget);
        let engine = engine(&page, config(10, 10_000));

        engine.autoload(&[toggle_element("el_a")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.inject("el_a", &code(TOGGLE_JS, "")).await.unwrap();

        page.render_target();
        let outcome = tokio::time::timeout(Duration::from_secs(2), engine.wait("el_a"))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(outcome.is_success());
        assert_eq!(page.marked_nodes("el_a"), 1);
    }

    #[tokio::test]
    async fn a_failed_attempt_leaves_no_partial_nodes_behind() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::CreateThenThrow(2));
        let engine = engine(&page, config(5, 1));

        engine.inject("el_1", &code(TOGGLE_JS, "button { color: red; }")).await.unwrap();
        let outcome = engine.wait("el_1").await.unwrap();

        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 3 });
        assert_eq!(page.marked_nodes("el_1"), 1);
        assert_eq!(page.styles_for("el_1"), 1);
    }

    #[tokio::test]
    async fn finished_cycles_release_their_mutation_subscription() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        let engine = engine(&page, config(2, 1));

        engine.inject("el_ok", &code(TOGGLE_JS, "")).await.unwrap();
        assert!(engine.wait("el_ok").await.unwrap().is_success());
        assert_eq!(page.mutation_subscribers(), 0);

        page.set_behavior(ScriptBehavior::Throw("boom".into()));
        engine.inject("el_bad", &code(TOGGLE_JS, "")).await.unwrap();
        let outcome = engine.wait("el_bad").await.unwrap();
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 2, .. }));
        assert_eq!(page.mutation_subscribers(), 0);
    }

    #[tokio::test]
    async fn removing_a_retrying_element_releases_its_subscription() {
        let page = Arc::new(FakePage::new("https://example.com/", "<html><body></body></html>"));
        page.set_behavior(ScriptBehavior::WaitForTarget);
        let engine = engine(&page, config(10, 10_000));

        engine.inject("el_1", &code(TOGGLE_JS, "")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(page.mutation_subscribers(), 1);

        engine.remove("el_1").await.unwrap();
        assert_eq!(page.mutation_subscribers(), 0);
    }
}
