use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of an outreach item. Ordering follows the declaration order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutreachStatus {
    Qualified,
    DraftReady,
    Sent,
}

impl OutreachStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutreachStatus::Qualified => "qualified",
            OutreachStatus::DraftReady => "draft_ready",
            OutreachStatus::Sent => "sent",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "qualified" => Some(OutreachStatus::Qualified),
            "draft_ready" => Some(OutreachStatus::DraftReady),
            "sent" => Some(OutreachStatus::Sent),
            _ => None,
        }
    }

    /// Staying put is allowed (failed sends keep `draft_ready`); going back is not.
    pub fn can_advance_to(&self, next: OutreachStatus) -> bool {
        next >= *self
    }
}

impl fmt::Display for OutreachStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        ItemId(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One row of the outreach queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutreachItem {
    pub id: ItemId,
    pub company_name: String,
    pub contact_email: Option<String>,
    pub status: OutreachStatus,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutreachItem {
    pub fn has_draft(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.email_subject) && filled(&self.email_body)
    }
}

/// Input for seeding a row; creation itself belongs to upstream qualification.
#[derive(Debug, Clone, Default)]
pub struct NewOutreachItem {
    pub company_name: String,
    pub contact_email: Option<String>,
    pub status: Option<OutreachStatus>,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub notes: Option<String>,
}

impl NewOutreachItem {
    pub fn qualified(company_name: &str, contact_email: Option<&str>) -> Self {
        Self {
            company_name: company_name.to_string(),
            contact_email: contact_email.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn draft_ready(contact_email: Option<&str>, subject: &str, body: &str) -> Self {
        Self {
            contact_email: contact_email.map(str::to_string),
            status: Some(OutreachStatus::DraftReady),
            email_subject: Some(subject.to_string()),
            email_body: Some(body.to_string()),
            ..Default::default()
        }
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
}

/// Closed set of reasons a send attempt can fail; recorded verbatim in notes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    InvalidRecipient,
    TransportTimeout,
    TransportAuthFailure,
    TransportRejected,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::InvalidRecipient => "invalid_recipient",
            FailureCategory::TransportTimeout => "transport_timeout",
            FailureCategory::TransportAuthFailure => "transport_auth_failure",
            FailureCategory::TransportRejected => "transport_rejected",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
