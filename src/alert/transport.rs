//! Alert delivery collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{AlertIntent, AlertLedger};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait AlertTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, intent: &AlertIntent) -> Result<(), TransportError>;
}

/// Writes each alert to the log at `warn`.
pub struct LogTransport;

#[async_trait]
impl AlertTransport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, intent: &AlertIntent) -> Result<(), TransportError> {
        warn!(
            alert_id = %intent.id,
            service = %intent.service,
            severity = intent.severity.as_str(),
            entry_id = %intent.entry_id,
            "{}",
            intent.summary()
        );
        Ok(())
    }
}

/// POSTs the alert as JSON to a webhook.
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertTransport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, intent: &AlertIntent) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.url)
            .json(intent)
            .send()
            .await
            .map_err(|e| TransportError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Delivery(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

async fn deliver_one(intent: &AlertIntent, transport: &dyn AlertTransport, ledger: Option<&AlertLedger>) {
    if let Some(ledger) = ledger {
        if let Err(e) = ledger.record(intent).await {
            error!(alert_id = %intent.id, error = %e, "failed to record alert");
        }
    }
    if let Err(e) = transport.deliver(intent).await {
        error!(alert_id = %intent.id, transport = transport.name(), error = %e, "alert delivery failed");
    }
}

/// Drain the outbound alert queue until it closes or `cancel` fires.
/// Each alert is recorded in the ledger (when present) and handed to the
/// transport once; failed deliveries are logged and dropped.
///
/// On cancellation the queue is closed to new alerts and whatever is
/// already buffered is still recorded and delivered before returning.
pub async fn run_delivery(
    mut rx: mpsc::Receiver<AlertIntent>,
    transport: Arc<dyn AlertTransport>,
    ledger: Option<AlertLedger>,
    cancel: CancellationToken,
) {
    info!(transport = transport.name(), "alert delivery started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        match next {
            Some(intent) => deliver_one(&intent, transport.as_ref(), ledger.as_ref()).await,
            None => break,
        }
    }

    rx.close();
    let mut flushed = 0usize;
    while let Some(intent) = rx.recv().await {
        deliver_one(&intent, transport.as_ref(), ledger.as_ref()).await;
        flushed += 1;
    }
    info!(flushed, "alert delivery stopped");
}
