//! Notification delivery.
//!
//! Each configured destination becomes a [`NotifySender`]. The [`Notifier`]
//! sends every batched message of a cycle to every sender and reports what
//! failed; one destination failing never stops delivery to the others.

mod message;
mod telegram;
mod whatsapp;

pub use message::*;
pub use telegram::*;
pub use whatsapp::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::Destination;

/// Errors that can occur when sending notifications.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("destination rejected message (HTTP {status}): {description}")]
    Rejected { status: u16, description: String },

    #[error("destination not configured: {0}")]
    NotConfigured(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// A single delivery channel (one chat, one phone number).
#[async_trait]
pub trait NotifySender: Send + Sync {
    /// Label used in logs and dispatch reports.
    fn name(&self) -> String;

    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub destination: String,
    pub kind: MessageKind,
    pub error: String,
}

/// Outcome of delivering one cycle's messages.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<DispatchFailure>,
}

/// Builds senders from stored destinations and dispatches messages.
///
/// Every send is bounded by `send_timeout`, both on the shared HTTP client
/// and around each [`NotifySender::send`] call.
pub struct Notifier {
    client: reqwest::Client,
    send_timeout: Duration,
    extra: Vec<Arc<dyn NotifySender>>,
}

impl Notifier {
    pub fn new(send_timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(send_timeout).build()?;
        Ok(Self {
            client,
            send_timeout,
            extra: Vec::new(),
        })
    }

    /// Always include `senders` in addition to stored destinations.
    pub fn with_senders(mut self, senders: Vec<Arc<dyn NotifySender>>) -> Self {
        self.extra = senders;
        self
    }

    /// Build the sender for one destination.
    pub fn sender_for(&self, destination: &Destination) -> Result<Arc<dyn NotifySender>, NotifyError> {
        match destination.kind.as_str() {
            "telegram" => Ok(Arc::new(TelegramSender::from_config(
                self.client.clone(),
                &destination.config,
            )?)),
            "whatsapp" => Ok(Arc::new(WhatsAppSender::from_config(
                self.client.clone(),
                &destination.config,
            )?)),
            other => Err(NotifyError::NotConfigured(format!("unknown destination kind: {}", other))),
        }
    }

    /// All senders for this cycle. Misconfigured destinations are skipped.
    pub fn resolve(&self, destinations: &[Destination]) -> Vec<Arc<dyn NotifySender>> {
        let mut senders = self.extra.clone();
        for destination in destinations {
            match self.sender_for(destination) {
                Ok(sender) => senders.push(sender),
                Err(e) => tracing::warn!("Notify: skipping destination {}: {}", destination.id, e),
            }
        }
        senders
    }

    /// Send every message to every sender, sequentially, collecting failures.
    pub async fn dispatch(
        &self,
        senders: &[Arc<dyn NotifySender>],
        messages: &[OutboundMessage],
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        for message in messages {
            for sender in senders {
                report.attempted += 1;
                let name = sender.name();
                let outcome = tokio::time::timeout(self.send_timeout, sender.send(&message.text))
                    .await
                    .unwrap_or(Err(NotifyError::Timeout(self.send_timeout)));
                match outcome {
                    Ok(()) => {
                        report.delivered += 1;
                        tracing::info!(
                            "Notify: sent {} message ({} channels) to {}",
                            message.kind.as_str(),
                            message.channel_count,
                            name
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            "Notify: failed to send {} message to {}: {}",
                            message.kind.as_str(),
                            name,
                            e
                        );
                        report.failures.push(DispatchFailure {
                            destination: name,
                            kind: message.kind,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every message it is asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub(crate) sent: Mutex<Vec<String>>,
    }

    impl RecordingSender {
        pub(crate) fn messages(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotifySender for RecordingSender {
        fn name(&self) -> String {
            "recording".to_string()
        }

        async fn send(&self, text: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Never completes.
    pub(crate) struct HangingSender;

    #[async_trait]
    impl NotifySender for HangingSender {
        fn name(&self) -> String {
            "hanging".to_string()
        }

        async fn send(&self, _text: &str) -> Result<(), NotifyError> {
            std::future::pending().await
        }
    }

    /// Always fails.
    pub(crate) struct FailingSender;

    #[async_trait]
    impl NotifySender for FailingSender {
        fn name(&self) -> String {
            "failing".to_string()
        }

        async fn send(&self, _text: &str) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected {
                status: 500,
                description: "boom".to_string(),
            })
        }
    }
}
