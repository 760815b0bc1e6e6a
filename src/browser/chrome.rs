use crate::browser::element_monitor::{ElementMonitor, MonitorSnapshot};
use crate::core::config::BrowserConfig;
use crate::core::{AssistantCall, PageTrait, ScriptOutcome};
use crate::errors::{RemixError, Result};
use crate::utils::javascript::PageScripts;
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MONITOR_POLL: Duration = Duration::from_millis(100);

/// Chrome browser implementation
pub struct ChromeBrowser {
    browser: Browser,
}

impl ChromeBrowser {
    pub fn launch(config: &BrowserConfig) -> Result<Self> {
        let window_size_arg = format!(
            "--window-size={},{}",
            config.window_width, config.window_height
        );

        let mut args = vec![
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new(&window_size_arg),
        ];

        // Add custom args
        for arg in &config.args {
            args.push(OsStr::new(arg));
        }

        let launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .args(args)
            .build()
            .map_err(|e| RemixError::LaunchFailed(e.to_string()))?;

        let browser =
            Browser::new(launch_options).map_err(|e| RemixError::LaunchFailed(e.to_string()))?;
        info!("Chrome launched (headless: {})", config.headless);

        Ok(Self { browser })
    }

    /// Open `url` in a new tab and attach to it.
    pub async fn open(&self, url: &str) -> Result<Arc<ChromePage>> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| RemixError::ChromeError(e.to_string()))?;

        tab.navigate_to(url)
            .map_err(|e| RemixError::NavigationFailed(e.to_string()))?;
        tab.wait_until_navigated()
            .map_err(|e| RemixError::NavigationFailed(e.to_string()))?;

        ChromePage::attach(tab).await
    }
}

/// One Chrome tab. Scripts go through the DevTools protocol, which is not
/// subject to the page's content security policy.
pub struct ChromePage {
    tab: Arc<Tab>,
    mutations: broadcast::Sender<()>,
    history: broadcast::Sender<()>,
    replaced: broadcast::Sender<()>,
    monitor_stop: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct RunResult {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl ChromePage {
    pub async fn attach(tab: Arc<Tab>) -> Result<Arc<Self>> {
        let (mutations, _) = broadcast::channel(64);
        let (history, _) = broadcast::channel(16);
        let (replaced, _) = broadcast::channel(16);
        let page = Arc::new(Self {
            tab,
            mutations,
            history,
            replaced,
            monitor_stop: CancellationToken::new(),
        });

        page.evaluate::<Value>(ElementMonitor::install_script()).await?;
        tokio::spawn(Self::monitor_loop(Arc::downgrade(&page)));
        Ok(page)
    }

    /// Evaluate a snippet that returns a JSON string and decode it.
    async fn evaluate<T: DeserializeOwned>(&self, script: &str) -> Result<T> {
        let result = self
            .tab
            .evaluate(script, true)
            .map_err(|e| RemixError::JavaScriptFailed(e.to_string()))?;

        match result.value {
            Some(Value::String(json)) => Ok(serde_json::from_str(&json)?),
            Some(other) => Ok(serde_json::from_value(other)?),
            None => Err(RemixError::PageUnreachable(
                "script returned no value".to_string(),
            )),
        }
    }

    async fn monitor_loop(page: std::sync::Weak<Self>) {
        let mut monitor = ElementMonitor::new();
        loop {
            tokio::time::sleep(MONITOR_POLL).await;
            let Some(page) = page.upgrade() else {
                break;
            };
            if page.monitor_stop.is_cancelled() {
                break;
            }

            let polled = page.evaluate::<MonitorSnapshot>(ElementMonitor::poll_script());
            let snapshot = match polled.await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    // Mid-navigation the document may not answer
                    debug!("Monitor poll failed: {}", e);
                    continue;
                }
            };

            let delta = monitor.observe(snapshot);
            if delta.needs_install {
                if let Err(e) = page.evaluate::<Value>(ElementMonitor::install_script()).await {
                    debug!("Could not reinstall the DOM monitor: {}", e);
                }
            }
            if delta.mutated {
                let _ = page.mutations.send(());
            }
            if delta.navigated {
                let _ = page.history.send(());
            }
            if delta.replaced {
                debug!("Document was replaced");
                let _ = page.replaced.send(());
            }
        }
        debug!("DOM monitor stopped");
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        self.monitor_stop.cancel();
    }
}

#[async_trait]
impl PageTrait for ChromePage {
    async fn url(&self) -> Result<String> {
        Ok(self.tab.get_url())
    }

    async fn title(&self) -> Result<String> {
        self.evaluate(PageScripts::title()).await
    }

    async fn document_html(&self) -> Result<String> {
        self.evaluate(PageScripts::document_html()).await
    }

    async fn insert_style(&self, owner: &str, css: &str) -> Result<()> {
        self.evaluate::<bool>(&PageScripts::insert_style(owner, css))
            .await?;
        Ok(())
    }

    async fn install_helpers(&self, bridge_timeout_ms: u64) -> Result<()> {
        self.evaluate::<Value>(&PageScripts::helpers(bridge_timeout_ms))
            .await?;
        self.evaluate::<Value>(ElementMonitor::install_script()).await?;
        Ok(())
    }

    async fn run_script(&self, owner: &str, js: &str) -> Result<ScriptOutcome> {
        let result: RunResult = self.evaluate(&PageScripts::run(owner, js)).await?;
        if result.ok {
            Ok(ScriptOutcome::ok())
        } else {
            let error = result.error.unwrap_or_else(|| "unknown error".to_string());
            debug!("Script for {} threw: {}", owner, error);
            Ok(ScriptOutcome::threw(error))
        }
    }

    async fn count_marked(&self, marker: &str) -> Result<usize> {
        self.evaluate(&PageScripts::count_marked(marker)).await
    }

    async fn remove_marked(&self, marker: &str) -> Result<usize> {
        self.evaluate(&PageScripts::remove_marked(marker)).await
    }

    async fn remove_created(&self, marker: &str) -> Result<usize> {
        self.evaluate(&PageScripts::remove_created(marker)).await
    }

    async fn remove_all_marked(&self) -> Result<usize> {
        self.evaluate(&PageScripts::remove_all_marked()).await
    }

    async fn reload(&self) -> Result<()> {
        self.tab
            .reload(false, None)
            .map_err(|e| RemixError::NavigationFailed(e.to_string()))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| RemixError::NavigationFailed(e.to_string()))?;
        if let Err(e) = self.evaluate::<Value>(ElementMonitor::install_script()).await {
            warn!("DOM monitor not reinstalled after reload: {}", e);
        }
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
        self.evaluate(PageScripts::take_assistant_calls()).await
    }

    async fn settle_assistant_call(
        &self,
        id: u64,
        result: std::result::Result<String, String>,
    ) -> Result<()> {
        let settled: bool = self
            .evaluate(&PageScripts::settle_assistant_call(id, &result))
            .await?;
        if !settled {
            debug!("callAssistant request {} had already timed out in the page", id);
        }
        Ok(())
    }
}
