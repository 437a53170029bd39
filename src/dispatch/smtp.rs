//! SMTP delivery through `lettre`.
//!
//! One connection pool per dispatcher; sessions are secured either with
//! STARTTLS (port 587 relays) or implicit TLS (port 465, e.g. Gmail).

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox as LettreMailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::Error as SmtpError;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{DispatchError, Dispatcher, Mailbox, OutgoingMessage};
use crate::config::{Smtp, SmtpSecurity};

/// Reply codes meaning the server refused our credentials.
const AUTH_FAILURE_CODES: [u16; 3] = [530, 534, 535];

pub struct SmtpDispatcher {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl fmt::Debug for SmtpDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpDispatcher")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl SmtpDispatcher {
    pub fn new(settings: &Smtp, timeout: Duration) -> Result<Self, DispatchError> {
        let user = settings
            .user
            .clone()
            .ok_or_else(|| DispatchError::Auth("missing SMTP user".into()))?;
        let password = settings
            .password
            .clone()
            .ok_or_else(|| DispatchError::Auth("missing SMTP password".into()))?;

        let builder = match settings.security {
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host),
        }
        .map_err(|e| DispatchError::Network(format!("SMTP host {:?}: {e}", settings.host)))?;

        let transport = builder
            .port(settings.port)
            .credentials(Credentials::new(user, password))
            .timeout(Some(timeout))
            .build();
        Ok(Self {
            transport,
            host: settings.host.clone(),
        })
    }
}

fn parse_address(raw: &str) -> Result<Address, DispatchError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| DispatchError::InvalidAddress(format!("{raw:?}: {e}")))
}

/// Plain-text message with the same headers the relay transport sends.
pub fn build_message(message: &OutgoingMessage) -> Result<Message, DispatchError> {
    let Mailbox { email, name } = &message.from;
    let from = LettreMailbox::new(name.clone(), parse_address(email)?);
    let subject = match message.subject.trim() {
        "" => "(no subject)",
        s => s,
    };

    let mut builder = Message::builder()
        .from(from)
        .to(LettreMailbox::new(None, parse_address(&message.to)?))
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(LettreMailbox::new(None, parse_address(reply_to)?));
    }
    builder
        .body(message.body.clone())
        .map_err(|e| DispatchError::Network(format!("building message: {e}")))
}

/// Map a server reply to the transport error taxonomy.
pub fn classify_reply(code: Option<u16>, permanent: bool, detail: String) -> DispatchError {
    match code {
        Some(c) if AUTH_FAILURE_CODES.contains(&c) => DispatchError::Auth(detail),
        Some(c) if permanent => DispatchError::Rejected {
            status: c,
            body: detail,
        },
        _ => DispatchError::Network(detail),
    }
}

fn classify_error(err: &SmtpError) -> DispatchError {
    if err.is_timeout() {
        return DispatchError::Timeout;
    }
    let code = err.status().and_then(|c| c.to_string().parse::<u16>().ok());
    classify_reply(code, err.is_permanent(), err.to_string())
}

#[async_trait]
impl Dispatcher for SmtpDispatcher {
    fn transport(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), DispatchError> {
        let email = build_message(message)?;
        match self.transport.send(email).await {
            Ok(response) => {
                debug!(host = %self.host, code = %response.code(), "accepted");
                Ok(())
            }
            Err(err) => {
                warn!(host = %self.host, error = %err, "SMTP send failed");
                Err(classify_error(&err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailureCategory;

    fn message(to: &str, subject: &str, reply_to: Option<&str>) -> OutgoingMessage {
        OutgoingMessage {
            from: Mailbox::new("me@example.com", Some("Me")),
            reply_to: reply_to.map(str::to_string),
            to: to.into(),
            subject: subject.into(),
            body: "Hello Acme".into(),
        }
    }

    fn rendered(msg: &Message) -> String {
        String::from_utf8(msg.formatted()).unwrap()
    }

    #[test]
    fn message_carries_headers_and_plain_body() {
        let msg = build_message(&message("lead@acme.io", "Hi", Some("replies@example.com")))
            .unwrap();
        let raw = rendered(&msg);
        assert!(raw.contains("From: \"Me\" <me@example.com>") || raw.contains("From: Me <me@example.com>"));
        assert!(raw.contains("To: lead@acme.io"));
        assert!(raw.contains("Reply-To: replies@example.com"));
        assert!(raw.contains("Subject: Hi"));
        assert!(raw.contains("Content-Type: text/plain"));
        assert!(raw.contains("Hello Acme"));
    }

    #[test]
    fn blank_subject_gets_placeholder() {
        let raw = rendered(&build_message(&message("lead@acme.io", "  ", None)).unwrap());
        assert!(raw.contains("Subject: (no subject)"));
        assert!(!raw.contains("Reply-To"));
    }

    #[test]
    fn unparsable_recipient_is_invalid_recipient() {
        let err = build_message(&message("lead@@acme", "Hi", None)).unwrap_err();
        assert_eq!(err.category(), FailureCategory::InvalidRecipient);
    }

    #[test]
    fn replies_map_to_categories() {
        let auth = classify_reply(Some(535), true, "5.7.8 bad credentials".into());
        assert_eq!(auth.category(), FailureCategory::TransportAuthFailure);
        assert_eq!(
            classify_reply(Some(530), true, "auth required".into()).category(),
            FailureCategory::TransportAuthFailure
        );

        let rejected = classify_reply(Some(550), true, "mailbox unavailable".into());
        assert!(matches!(rejected, DispatchError::Rejected { status: 550, .. }));
        assert_eq!(rejected.category(), FailureCategory::TransportRejected);

        assert_eq!(
            classify_reply(Some(451), false, "try later".into()).category(),
            FailureCategory::Unknown
        );
        assert_eq!(
            classify_reply(None, false, "connection reset".into()).category(),
            FailureCategory::Unknown
        );
    }

    #[tokio::test]
    async fn builds_both_security_modes() {
        let mut settings = Smtp {
            user: Some("login".into()),
            password: Some("pw".into()),
            ..Smtp::default()
        };
        let starttls = SmtpDispatcher::new(&settings, Duration::from_secs(5)).unwrap();
        assert_eq!(starttls.transport(), "smtp");

        settings.security = SmtpSecurity::Tls;
        settings.port = 465;
        SmtpDispatcher::new(&settings, Duration::from_secs(5)).unwrap();

        settings.password = None;
        assert!(matches!(
            SmtpDispatcher::new(&settings, Duration::from_secs(5)),
            Err(DispatchError::Auth(_))
        ));
    }
}
