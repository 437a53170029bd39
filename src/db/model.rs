//! Query and mutation shapes passed to the queue store.
//!
//! These carry no behaviour of their own; the store implementations interpret
//! them.

use chrono::{DateTime, Utc};

use crate::model::{ItemId, OutreachItem, OutreachStatus};
use crate::notes::NoteFilter;

/// Column a claim orders by, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKey {
    CreatedAt,
    UpdatedAt,
}

impl OrderKey {
    pub fn column(&self) -> &'static str {
        match self {
            OrderKey::CreatedAt => "created_at",
            OrderKey::UpdatedAt => "updated_at",
        }
    }

    pub fn value_of(&self, item: &OutreachItem) -> DateTime<Utc> {
        match self {
            OrderKey::CreatedAt => item.created_at,
            OrderKey::UpdatedAt => item.updated_at,
        }
    }
}

/// Eligibility predicate and bound for a claim.
#[derive(Debug, Clone)]
pub struct ClaimFilter {
    pub status: OutreachStatus,
    pub order: OrderKey,
    pub limit: usize,
    pub note_filter: Option<NoteFilter>,
    /// Only rows with a non-empty subject and body.
    pub require_draft: bool,
    /// Rows already handled earlier in the same pass.
    pub exclude: Vec<ItemId>,
}

impl ClaimFilter {
    pub fn new(status: OutreachStatus, order: OrderKey, limit: usize) -> Self {
        Self {
            status,
            order,
            limit,
            note_filter: None,
            require_draft: false,
            exclude: Vec::new(),
        }
    }

    pub fn matches(&self, item: &OutreachItem) -> bool {
        item.status == self.status
            && (!self.require_draft || item.has_draft())
            && self
                .note_filter
                .as_ref()
                .map_or(true, |f| f.matches(item.notes.as_deref()))
            && !self.exclude.contains(&item.id)
    }
}

/// Field changes for one row. `expected` is the status the row must still
/// have; the store refuses the write otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub expected: OutreachStatus,
    pub status: OutreachStatus,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Already prefixed with its delimiter.
    pub append_note: Option<String>,
}

impl ItemUpdate {
    /// Touch `updated_at` and append a note without moving the status.
    pub fn annotate(status: OutreachStatus, note: String, now: DateTime<Utc>) -> Self {
        Self {
            expected: status,
            status,
            email_subject: None,
            email_body: None,
            sent_at: None,
            updated_at: now,
            append_note: Some(note),
        }
    }

    pub fn advance(from: OutreachStatus, to: OutreachStatus, now: DateTime<Utc>) -> Self {
        Self {
            expected: from,
            status: to,
            email_subject: None,
            email_body: None,
            sent_at: None,
            updated_at: now,
            append_note: None,
        }
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.append_note = Some(note);
        self
    }

    pub fn with_draft(mut self, subject: String, body: String) -> Self {
        self.email_subject = Some(subject);
        self.email_body = Some(body);
        self
    }

    pub fn with_sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.sent_at = Some(at);
        self
    }
}
