//! Transactional-email relay over HTTPS.
//!
//! Posts JSON to the Brevo `v3/smtp/email` endpoint and maps HTTP status codes
//! onto [`DispatchError`].

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{DispatchError, Dispatcher, OutgoingMessage};

pub const RELAY_API_BASE: &str = "https://api.brevo.com/";

/// Transactional-email relay reached over HTTPS (Brevo `v3/smtp/email` API).
#[derive(Clone)]
pub struct HttpRelayDispatcher {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for HttpRelayDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRelayDispatcher")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpRelayDispatcher {
    pub fn with_base_url(
        api_key: String,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| DispatchError::Network(format!("invalid relay URL {base_url:?}: {e}")))?;
        let http = Client::builder()
            .user_agent("outreach-pipeline/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request, DispatchError> {
        let endpoint = self
            .base_url
            .join("v3/smtp/email")
            .map_err(|e| DispatchError::Network(format!("invalid relay URL: {e}")))?;
        self.http
            .post(endpoint)
            .header("api-key", &self.api_key)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .map_err(|e| DispatchError::Network(e.to_string()))
    }
}

pub fn build_message_body(message: &OutgoingMessage) -> Value {
    let subject = match message.subject.trim() {
        "" => "(no subject)",
        s => s,
    };
    let mut body = json!({
        "sender": message.from,
        "to": [{ "email": message.to }],
        "subject": subject,
        "textContent": message.body,
    });
    if let Some(reply_to) = message.reply_to.as_deref().filter(|r| !r.is_empty()) {
        body["replyTo"] = json!({ "email": reply_to });
    }
    body
}

/// Classify a non-success relay response.
pub fn classify_status(status: StatusCode, body: String) -> DispatchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DispatchError::Auth(format!("{status}: {body}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => DispatchError::Timeout,
        _ => DispatchError::Rejected {
            status: status.as_u16(),
            body,
        },
    }
}

fn classify_transport(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Network(err.to_string())
    }
}

#[async_trait]
impl Dispatcher for HttpRelayDispatcher {
    fn transport(&self) -> &str {
        "http_relay"
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), DispatchError> {
        let request = self.build_request(&build_message_body(message))?;
        debug!(url = %request.url(), to = %message.to, "relay request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(classify_transport)?;

        let status = res.status();
        if status.is_success() {
            debug!(%status, "relay accepted message");
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        warn!(%status, body = %body, "relay refused message");
        Err(classify_status(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Mailbox;

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            from: Mailbox::new("me@example.com", Some("Me")),
            reply_to: Some("replies@example.com".into()),
            to: "lead@acme.io".into(),
            subject: "Hello Acme".into(),
            body: "Body text".into(),
        }
    }

    #[test]
    fn build_message_body_includes_all_fields() {
        let body = build_message_body(&message());
        assert_eq!(body["sender"]["email"], "me@example.com");
        assert_eq!(body["sender"]["name"], "Me");
        assert_eq!(body["to"][0]["email"], "lead@acme.io");
        assert_eq!(body["subject"], "Hello Acme");
        assert_eq!(body["textContent"], "Body text");
        assert_eq!(body["replyTo"]["email"], "replies@example.com");
    }

    #[test]
    fn build_message_body_omits_optional_fields() {
        let mut msg = message();
        msg.reply_to = None;
        msg.from = Mailbox::new("me@example.com", None);
        msg.subject = "  ".into();
        let body = build_message_body(&msg);
        assert!(body.get("replyTo").is_none());
        assert!(body["sender"].get("name").is_none());
        assert_eq!(body["subject"], "(no subject)");
    }

    #[test]
    fn build_request_sets_headers() {
        let relay = HttpRelayDispatcher::with_base_url(
            "key-123".into(),
            RELAY_API_BASE,
            Duration::from_secs(5),
        )
        .unwrap();
        let request = relay.build_request(&json!({ "sample": true })).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/v3/smtp/email");
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .unwrap()
                .to_string()
        };
        assert_eq!(header("api-key"), "key-123");
        assert_eq!(header("Content-Type"), "application/json");
    }

    #[test]
    fn debug_redacts_key() {
        let relay = HttpRelayDispatcher::with_base_url(
            "secret-key".into(),
            RELAY_API_BASE,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!format!("{relay:?}").contains("secret-key"));
    }

    #[test]
    fn status_codes_are_classified() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            DispatchError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, String::new()),
            DispatchError::Timeout
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad".into()),
            DispatchError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = HttpRelayDispatcher::with_base_url("k".into(), "not a url", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Network(_)));
    }
}
