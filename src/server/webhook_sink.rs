use serde_json::Value;

use crate::core::webhook::{DeliverFuture, WebhookSink};

/// Delivers a batch of webhook payloads as a single POST with a JSON
/// array body — the `WebhookBatcher`'s actual network leg.
pub struct HttpWebhookSink {
    client: reqwest::Client,
}

impl HttpWebhookSink {
    pub fn new() -> Self {
        HttpWebhookSink {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpWebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookSink for HttpWebhookSink {
    fn deliver(&self, url: String, payloads: Vec<Value>) -> DeliverFuture {
        let client = self.client.clone();
        Box::pin(async move {
            match client.post(&url).json(&payloads).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    tracing::warn!("webhook: delivery failed, url={}, error={}", url, e);
                    false
                }
            }
        })
    }
}
