//! Email template rendering.
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const COMPANY_PLACEHOLDER: &str = "{company_name}";
pub const UNKNOWN_COMPANY: &str = "(unknown)";
pub const DEFAULT_SUBJECT: &str = "Exploring AI-driven workflow automation";

static SUBJECT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^subject:(.*)$").expect("valid subject regex"));

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct Template {
    text: String,
    default_subject: String,
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            default_subject: DEFAULT_SUBJECT.to_string(),
        }
    }

    pub fn with_default_subject(mut self, subject: impl Into<String>) -> Self {
        self.default_subject = subject.into();
        self
    }

    pub async fn load(path: &Path) -> Result<Self, TemplateError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(text))
    }

    pub fn render(&self, company_name: &str) -> RenderedEmail {
        render(&self.text, company_name, &self.default_subject)
    }
}

/// Substitute the company name and split off an optional `Subject:` first line.
pub fn render(template: &str, company_name: &str, default_subject: &str) -> RenderedEmail {
    let company = match company_name.trim() {
        "" => UNKNOWN_COMPANY,
        name => name,
    };
    let text = template.replace(COMPANY_PLACEHOLDER, company);

    let mut lines = text.lines();
    let first = lines.next().unwrap_or_default();
    match SUBJECT_LINE.captures(first) {
        Some(caps) => {
            let subject = caps
                .get(1)
                .map(|m| m.as_str().trim())
                .filter(|s| !s.is_empty())
                .unwrap_or(default_subject)
                .to_string();
            let body = lines.collect::<Vec<_>>().join("\n").trim_start().to_string();
            RenderedEmail { subject, body }
        }
        None => RenderedEmail {
            subject: default_subject.to_string(),
            body: text,
        },
    }
}
