use crate::assistant::elements::normalize_url;
use crate::core::PageTrait;
use crate::errors::Result;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Detects in-place navigation. Single-page apps change the URL without a
/// load event, so the URL is polled at a fixed interval and re-checked early
/// on any history API call, `popstate` or `hashchange`. A load that replaces
/// the document counts even when the URL stays the same.
pub struct NavigationWatcher {
    last_url: String,
    poll_interval: Duration,
    history: Option<broadcast::Receiver<()>>,
    replaced: Option<broadcast::Receiver<()>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavigationEvent {
    pub from: String,
    pub to: String,
    /// How long the previous view was shown.
    pub dwell_ms: u64,
    /// The document was reloaded rather than routed in place.
    pub document_replaced: bool,
}

impl NavigationWatcher {
    pub async fn new<P: PageTrait + ?Sized>(page: &P, poll_interval: Duration) -> Result<Self> {
        Ok(Self {
            last_url: page.url().await?,
            poll_interval,
            history: Some(page.history_events()),
            replaced: Some(page.document_replaced()),
        })
    }

    pub fn current_url(&self) -> &str {
        &self.last_url
    }

    /// Wait for the next change of normalized URL or the next document
    /// replacement. Fragment-only changes do not count. Returns `None` once
    /// `cancel` fires.
    pub async fn next_change<P: PageTrait + ?Sized>(
        &mut self,
        page: &P,
        cancel: &CancellationToken,
    ) -> Option<NavigationEvent> {
        let since = Instant::now();
        loop {
            let document_replaced = tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => false,
                _ = signal(&mut self.history) => false,
                fired = signal(&mut self.replaced) => fired,
            };

            let url = match page.url().await {
                Ok(url) => url,
                Err(e) => {
                    debug!("URL poll failed: {}", e);
                    if document_replaced {
                        // Still a new document; report it against the last known URL.
                        return Some(self.event(self.last_url.clone(), since, true));
                    }
                    continue;
                }
            };
            if document_replaced || normalize_url(&url) != normalize_url(&self.last_url) {
                debug!(
                    "Navigation detected: {} -> {} (reload: {})",
                    self.last_url, url, document_replaced
                );
                return Some(self.event(url, since, document_replaced));
            }
            self.last_url = url;
        }
    }

    fn event(&mut self, to: String, since: Instant, document_replaced: bool) -> NavigationEvent {
        let from = std::mem::replace(&mut self.last_url, to.clone());
        if let Some(rx) = self.replaced.as_mut() {
            while rx.try_recv().is_ok() {}
        }
        NavigationEvent {
            from,
            to,
            dwell_ms: since.elapsed().as_millis() as u64,
            document_replaced,
        }
    }
}

/// Resolves `true` on the next signal. Once the sender is gone the receiver
/// is dropped and this never resolves again.
async fn signal(rx: &mut Option<broadcast::Receiver<()>>) -> bool {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match inner.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => true,
        Err(broadcast::error::RecvError::Closed) => {
            *rx = None;
            false
        }
    }
}
