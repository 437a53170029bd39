//! Message transports.
//!
//! The sending stage only sees the [`Dispatcher`] trait; concrete transports
//! differ in handshake and authentication and nothing else.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::{Config, TransportKind};
use crate::model::FailureCategory;

pub mod relay;
pub mod smtp;

pub use relay::HttpRelayDispatcher;
pub use smtp::SmtpDispatcher;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mailbox {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Mailbox {
    pub fn new(email: &str, name: Option<&str>) -> Self {
        Self {
            email: email.to_string(),
            name: name.filter(|n| !n.trim().is_empty()).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub from: Mailbox,
    pub reply_to: Option<String>,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport timed out")]
    Timeout,
    #[error("transport authentication failed: {0}")]
    Auth(String),
    #[error("transport rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Network(String),
    #[error("address rejected by transport: {0}")]
    InvalidAddress(String),
}

impl DispatchError {
    pub fn category(&self) -> FailureCategory {
        match self {
            DispatchError::Timeout => FailureCategory::TransportTimeout,
            DispatchError::Auth(_) => FailureCategory::TransportAuthFailure,
            DispatchError::Rejected { .. } => FailureCategory::TransportRejected,
            DispatchError::Network(_) => FailureCategory::Unknown,
            DispatchError::InvalidAddress(_) => FailureCategory::InvalidRecipient,
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Short label recorded in audit notes (`via=`).
    fn transport(&self) -> &str;

    async fn send(&self, message: &OutgoingMessage) -> Result<(), DispatchError>;
}

/// Logs instead of delivering. Every send succeeds.
#[derive(Debug, Clone, Default)]
pub struct DryRunDispatcher;

#[async_trait]
impl Dispatcher for DryRunDispatcher {
    fn transport(&self) -> &str {
        "dry_run"
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), DispatchError> {
        info!(
            to = %message.to,
            from = %message.from.email,
            subject = %message.subject,
            body_len = message.body.len(),
            "dry run: message not delivered"
        );
        Ok(())
    }
}

/// Build the transport selected in config.
pub fn from_config(cfg: &Config) -> Result<Box<dyn Dispatcher>, DispatchError> {
    match cfg.transport.kind {
        TransportKind::DryRun => Ok(Box::new(DryRunDispatcher)),
        TransportKind::HttpRelay => {
            let key = cfg
                .transport
                .api_key
                .clone()
                .ok_or_else(|| DispatchError::Auth("missing relay API key".into()))?;
            let dispatcher = HttpRelayDispatcher::with_base_url(
                key,
                &cfg.transport.base_url,
                cfg.transport.timeout(),
            )?;
            Ok(Box::new(dispatcher))
        }
        TransportKind::Smtp => Ok(Box::new(SmtpDispatcher::new(
            &cfg.transport.smtp,
            cfg.transport.timeout(),
        )?)),
    }
}
