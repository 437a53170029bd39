//! Audit notes appended to an outreach item.
//!
//! Notes are a newline-delimited log. Each stage contributes one entry per
//! attempt; the store concatenates entries and never rewrites earlier ones.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

use crate::model::FailureCategory;

/// One structured line of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteEntry {
    Drafted {
        actor: String,
        at: DateTime<Utc>,
    },
    Sent {
        transport: String,
        to: String,
        at: DateTime<Utc>,
    },
    SendFailed {
        transport: String,
        category: FailureCategory,
        at: DateTime<Utc>,
    },
}

impl NoteEntry {
    pub fn drafted(actor: &str, at: DateTime<Utc>) -> Self {
        NoteEntry::Drafted {
            actor: actor.to_string(),
            at,
        }
    }

    pub fn sent(transport: &str, to: &str, at: DateTime<Utc>) -> Self {
        NoteEntry::Sent {
            transport: transport.to_string(),
            to: to.to_string(),
            at,
        }
    }

    pub fn send_failed(transport: &str, category: FailureCategory, at: DateTime<Utc>) -> Self {
        NoteEntry::SendFailed {
            transport: transport.to_string(),
            category,
            at,
        }
    }

    /// Text handed to the store; the leading newline separates it from prior entries.
    pub fn to_appendix(&self) -> String {
        format!("\n{self}")
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl fmt::Display for NoteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoteEntry::Drafted { actor, at } => {
                write!(f, "Draft=ok by={} at={}", actor, ts(at))
            }
            NoteEntry::Sent { transport, to, at } => {
                write!(f, "Send=ok via={} to={} at={}", transport, to, ts(at))
            }
            NoteEntry::SendFailed {
                transport,
                category,
                at,
            } => write!(
                f,
                "Send=fail category={} via={} at={}",
                category,
                transport,
                ts(at)
            ),
        }
    }
}

/// Split a stored notes value into its non-empty entries, oldest first.
pub fn entries(notes: Option<&str>) -> Vec<&str> {
    notes
        .unwrap_or_default()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

/// Append an entry to an existing notes value.
pub fn append(notes: Option<&str>, appendix: &str) -> String {
    let mut out = notes.unwrap_or_default().to_string();
    out.push_str(appendix);
    out
}

/// Case-insensitive substring filter used to pick a sending cohort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteFilter(String);

impl NoteFilter {
    /// Blank input means "no filter", so every row matches.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| NoteFilter(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, notes: Option<&str>) -> bool {
        notes
            .unwrap_or_default()
            .to_lowercase()
            .contains(&self.0.to_lowercase())
    }
}
