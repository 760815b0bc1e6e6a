//! Correlation-id request/response channel between page code and the
//! privileged side that is allowed to talk to the model.

use crate::assistant::client::ChatModel;
use crate::assistant::settings::SettingsStore;
use crate::core::{AssistantCall, KeyValueStore};
use crate::errors::{RemixError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

type Pending<Resp> = Arc<Mutex<HashMap<u64, oneshot::Sender<Resp>>>>;

/// Caller side. Every request carries a fresh id and must be answered within
/// its timeout; an unanswered request is dropped from the pending table.
pub struct Bridge<Req, Resp> {
    next_id: AtomicU64,
    pending: Pending<Resp>,
    outbound: mpsc::Sender<(u64, Req)>,
}

/// Serving side of a [`Bridge`].
pub struct BridgeEndpoint<Req, Resp> {
    inbound: mpsc::Receiver<(u64, Req)>,
    pending: Pending<Resp>,
}

#[derive(Clone)]
pub struct Responder<Resp> {
    pending: Pending<Resp>,
}

impl<Req, Resp> Bridge<Req, Resp> {
    pub fn channel(capacity: usize) -> (Self, BridgeEndpoint<Req, Resp>) {
        let (outbound, inbound) = mpsc::channel(capacity);
        let pending: Pending<Resp> = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                next_id: AtomicU64::new(1),
                pending: pending.clone(),
                outbound,
            },
            BridgeEndpoint { inbound, pending },
        )
    }

    pub async fn request(&self, payload: Req, timeout: Duration) -> Result<Resp> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound.send((id, payload)).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RemixError::BridgeClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RemixError::BridgeClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RemixError::BridgeTimeout(id))
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl<Req, Resp> BridgeEndpoint<Req, Resp> {
    pub async fn next(&mut self) -> Option<(u64, Req)> {
        self.inbound.recv().await
    }

    pub fn responder(&self) -> Responder<Resp> {
        Responder {
            pending: self.pending.clone(),
        }
    }
}

impl<Resp> Responder<Resp> {
    /// Returns false when the caller already gave up on `id`.
    pub async fn respond(&self, id: u64, response: Resp) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }
}

pub type AssistantReply = std::result::Result<String, String>;
pub type AssistantBridge = Bridge<AssistantCall, AssistantReply>;

/// Answer `callAssistant` requests with the configured model, as long as the
/// user allowed elements to use it.
pub async fn serve_assistant_calls<S>(
    mut endpoint: BridgeEndpoint<AssistantCall, AssistantReply>,
    model: Arc<dyn ChatModel>,
    settings: SettingsStore<S>,
) where
    S: KeyValueStore + 'static,
{
    let responder = endpoint.responder();
    while let Some((id, call)) = endpoint.next().await {
        let model = model.clone();
        let settings = settings.clone();
        let responder = responder.clone();
        tokio::spawn(async move {
            let reply = answer_call(&*model, &settings, &call).await;
            if let Err(e) = &reply {
                debug!("callAssistant request {} failed: {}", id, e);
            }
            if !responder.respond(id, reply).await {
                warn!("callAssistant request {} was abandoned before its answer", id);
            }
        });
    }
}

async fn answer_call<S: KeyValueStore>(
    model: &dyn ChatModel,
    settings: &SettingsStore<S>,
    call: &AssistantCall,
) -> AssistantReply {
    let settings = settings.load().await.map_err(|e| e.to_string())?;
    if !settings.allow_element_llm_access {
        return Err("elements are not allowed to call the assistant; enable it in settings".into());
    }
    settings.validate().map_err(|e| e.to_string())?;

    let mut messages = Vec::new();
    if let Some(system) = call.system.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(crate::assistant::client::ChatMessage::system(system));
    }
    messages.push(crate::assistant::client::ChatMessage::user(&call.prompt));

    model
        .complete(&settings, &messages)
        .await
        .map_err(|e| e.to_string())
}
