// =============================================================================
// Out-of-band notification channel. Explicitly out of scope as a *feature*
// (spec.md §1), but the ambient rule carries it: the strategy layer gets a
// thin, best-effort sender it can call without ever letting a notification
// failure affect a trading decision. No teacher file does this; built fresh
// in the teacher's idiom of a small reqwest-backed struct with one async
// method, logged via `tracing` rather than propagated.
// =============================================================================

use async_trait::async_trait;
use tracing::{debug, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);
}

/// Used when no notifier token is configured. Every call is a logged no-op.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, text: &str) {
        debug!(message = %text, "notifier disabled, dropping message");
    }
}

/// Sends messages to one or more chat ids via a Telegram-bot-style HTTP API.
pub struct HttpNotifier {
    client: reqwest::Client,
    token: String,
    chat_ids: Vec<String>,
}

impl HttpNotifier {
    pub fn new(token: String, chat_ids: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            chat_ids,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        for chat_id in &self.chat_ids {
            let body = serde_json::json!({ "chat_id": chat_id, "text": text });
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(chat_id, "notifier message delivered");
                }
                Ok(resp) => {
                    warn!(chat_id, status = %resp.status(), "notifier delivery failed");
                }
                Err(err) => {
                    warn!(chat_id, error = %err, "notifier request failed");
                }
            }
        }
    }
}

/// Builds a notifier from config: `HttpNotifier` when a token and at least
/// one chat id are configured, `NoopNotifier` otherwise. Never fails --
/// alerting is best-effort and must not block startup.
pub fn build(token: Option<String>, chat_ids: Vec<String>) -> std::sync::Arc<dyn Notifier> {
    match token {
        Some(token) if !chat_ids.is_empty() => std::sync::Arc::new(HttpNotifier::new(token, chat_ids)),
        _ => std::sync::Arc::new(NoopNotifier),
    }
}
