//! Messages posted by the app running inside the preview.

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const INBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreviewMessage {
    AppRendered {
        #[serde(rename = "runId")]
        run_id: String,
    },
    ConsoleError {
        #[serde(rename = "runId")]
        run_id: String,
        message: String,
    },
}

impl PreviewMessage {
    /// Validates an untrusted payload. Anything other than the two known
    /// shapes with a non-empty run id is rejected.
    pub fn parse(raw: &serde_json::Value) -> AppResult<Self> {
        let message: Self = serde_json::from_value(raw.clone())
            .map_err(|error| AppError::Internal(format!("unrecognized preview message: {}", error)))?;
        if message.run_id().trim().is_empty() {
            return Err(AppError::Internal("preview message without runId".to_string()));
        }
        Ok(message)
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::AppRendered { run_id } | Self::ConsoleError { run_id, .. } => run_id,
        }
    }
}

/// Entry point for cross-context messages. Every active run sees every
/// accepted message and filters by its own run id.
#[derive(Debug, Clone)]
pub struct PreviewInbox {
    tx: broadcast::Sender<PreviewMessage>,
}

impl Default for PreviewInbox {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(INBOX_CAPACITY);
        Self { tx }
    }
}

impl PreviewInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, raw: &serde_json::Value) -> AppResult<()> {
        let message = PreviewMessage::parse(raw)?;
        self.post(message);
        Ok(())
    }

    pub fn deliver_str(&self, raw: &str) -> AppResult<()> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|error| AppError::Internal(format!("preview message is not JSON: {}", error)))?;
        self.deliver(&value)
    }

    pub fn post(&self, message: PreviewMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("preview message dropped: no active run");
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PreviewMessage> {
        self.tx.subscribe()
    }
}
