//! Configuration loader and validator for the outreach workers.
//!
//! Settings come from an optional YAML file, then environment variables
//! override individual fields. The resulting struct is built once at start-up
//! and handed to the stages by reference.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which stage the process is about to run; decides which credentials are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Draft,
    Send,
    Inspect,
}

/// App-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub database: Database,
    pub queue: Queue,
    pub draft: Draft,
    pub transport: Transport,
}

/// PostgreSQL connection settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Database {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            name: "commercial_ai".into(),
            user: "outreach".into(),
            password: None,
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Batch and pacing settings shared by both stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Queue {
    pub batch_size: usize,
    pub send_limit: usize,
    pub throttle_seconds: f64,
    pub note_filter: Option<String>,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            batch_size: 10,
            send_limit: 10,
            throttle_seconds: 25.0,
            note_filter: None,
        }
    }
}

impl Queue {
    /// Pause between dispatches. Values rejected by validation yield zero.
    pub fn throttle(&self) -> Duration {
        Duration::try_from_secs_f64(self.throttle_seconds).unwrap_or(Duration::ZERO)
    }
}

/// Drafting stage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Draft {
    pub template_path: PathBuf,
    pub default_subject: String,
    pub actor: String,
}

impl Default for Draft {
    fn default() -> Self {
        Self {
            template_path: PathBuf::from("templates/outreach.txt"),
            default_subject: crate::render::DEFAULT_SUBJECT.into(),
            actor: "outreach-drafter".into(),
        }
    }
}

/// Delivery backend for the sending stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    HttpRelay,
    Smtp,
    DryRun,
}

impl TransportKind {
    fn parse_kind(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http_relay" | "relay" => Some(TransportKind::HttpRelay),
            "smtp" | "gmail" => Some(TransportKind::Smtp),
            "dry_run" | "dry-run" => Some(TransportKind::DryRun),
            _ => None,
        }
    }
}

/// How the SMTP session is secured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS, usually on port 587.
    StartTls,
    /// TLS from the first byte, usually on port 465.
    Tls,
}

impl SmtpSecurity {
    fn parse_security(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starttls" | "start_tls" => Some(SmtpSecurity::StartTls),
            "tls" | "ssl" | "implicit_tls" => Some(SmtpSecurity::Tls),
            _ => None,
        }
    }
}

pub const GMAIL_SMTP_HOST: &str = "smtp.gmail.com";

/// SMTP server settings, used when `transport.kind` is `smtp`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Smtp {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for Smtp {
    fn default() -> Self {
        Self {
            host: "smtp-relay.brevo.com".into(),
            port: 587,
            security: SmtpSecurity::StartTls,
            user: None,
            password: None,
        }
    }
}

impl std::fmt::Debug for Smtp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Smtp")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Smtp {
    /// Gmail over implicit TLS on port 465.
    fn gmail() -> Self {
        Self {
            host: GMAIL_SMTP_HOST.into(),
            port: 465,
            security: SmtpSecurity::Tls,
            user: None,
            password: None,
        }
    }
}

/// Outgoing mail settings for the sending stage.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Transport {
    pub kind: TransportKind,
    pub base_url: String,
    pub smtp: Smtp,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub from_email: Option<String>,
    pub from_name: String,
    pub reply_to: Option<String>,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            kind: TransportKind::HttpRelay,
            base_url: crate::dispatch::relay::RELAY_API_BASE.into(),
            smtp: Smtp::default(),
            api_key: None,
            timeout_seconds: 45,
            from_email: None,
            from_name: "Outreach".into(),
            reply_to: None,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("smtp", &self.smtp)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("from_email", &self.from_email)
            .field("from_name", &self.from_name)
            .field("reply_to", &self.reply_to)
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_num<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key} must be a number, got {raw:?}")))
}

impl Config {
    /// Override fields from environment-style variables. `lookup` is
    /// `std::env::var(..).ok()` in production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = non_blank(lookup("PGHOST")) {
            self.database.host = v;
        }
        if let Some(v) = non_blank(lookup("PGPORT")) {
            self.database.port = parse_num("PGPORT", &v)?;
        }
        if let Some(v) = non_blank(lookup("PGDATABASE")) {
            self.database.name = v;
        }
        if let Some(v) = non_blank(lookup("PGUSER")) {
            self.database.user = v;
        }
        if let Some(v) = lookup("PGPASSWORD").filter(|s| !s.is_empty()) {
            self.database.password = Some(v);
        }

        if let Some(v) = non_blank(lookup("BATCH_SIZE")) {
            self.queue.batch_size = parse_num("BATCH_SIZE", &v)?;
        }
        if let Some(v) = non_blank(lookup("SEND_LIMIT")) {
            self.queue.send_limit = parse_num("SEND_LIMIT", &v)?;
        }
        if let Some(v) = non_blank(lookup("SEND_SLEEP")) {
            self.queue.throttle_seconds = parse_num("SEND_SLEEP", &v)?;
        }
        if let Some(v) = lookup("SEND_NOTE_FILTER") {
            self.queue.note_filter = non_blank(Some(v));
        }

        if let Some(v) = non_blank(lookup("TEMPLATE_PATH")) {
            self.draft.template_path = PathBuf::from(v);
        }
        if let Some(v) = non_blank(lookup("DRAFT_ACTOR")) {
            self.draft.actor = v;
        }

        if let Some(v) = non_blank(lookup("TRANSPORT")) {
            self.transport.kind = TransportKind::parse_kind(&v)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown TRANSPORT {v:?}")))?;
            if v.eq_ignore_ascii_case("gmail") {
                self.transport.smtp = Smtp::gmail();
            }
        }
        // Gmail app-password credentials double as the sender address.
        if let Some(v) = non_blank(lookup("GMAIL_USER")) {
            self.transport.smtp.user = Some(v.clone());
            self.transport.from_email.get_or_insert(v);
        }
        if let Some(v) = lookup("GMAIL_APP_PASSWORD").filter(|s| !s.is_empty()) {
            self.transport.smtp.password = Some(v);
        }
        if let Some(v) = non_blank(lookup("SMTP_HOST")) {
            self.transport.smtp.host = v;
        }
        if let Some(v) = non_blank(lookup("SMTP_PORT")) {
            self.transport.smtp.port = parse_num("SMTP_PORT", &v)?;
        }
        if let Some(v) = non_blank(lookup("SMTP_SECURITY")) {
            self.transport.smtp.security = SmtpSecurity::parse_security(&v)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown SMTP_SECURITY {v:?}")))?;
        }
        if let Some(v) = non_blank(lookup("SMTP_USER")) {
            self.transport.smtp.user = Some(v);
        }
        if let Some(v) = lookup("SMTP_PASSWORD").filter(|s| !s.is_empty()) {
            self.transport.smtp.password = Some(v);
        }
        if let Some(v) = non_blank(lookup("RELAY_URL")) {
            self.transport.base_url = v;
        }
        if let Some(v) = non_blank(lookup("RELAY_API_KEY")) {
            self.transport.api_key = Some(v);
        }
        if let Some(v) = non_blank(lookup("RELAY_TIMEOUT")) {
            self.transport.timeout_seconds = parse_num("RELAY_TIMEOUT", &v)?;
        }
        if let Some(v) = non_blank(lookup("FROM_EMAIL")) {
            self.transport.from_email = Some(v);
        }
        if let Some(v) = non_blank(lookup("FROM_NAME")) {
            self.transport.from_name = v;
        }
        if let Some(v) = non_blank(lookup("REPLY_TO")) {
            self.transport.reply_to = Some(v);
        }
        Ok(())
    }

    /// Check the settings a given stage needs before any connection is attempted.
    pub fn validate_for(&self, stage: StageKind) -> Result<(), ConfigError> {
        validate(self)?;
        if self.database.password.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Missing("PGPASSWORD"));
        }
        if stage == StageKind::Send {
            match self.transport.kind {
                TransportKind::HttpRelay
                    if self.transport.api_key.as_deref().unwrap_or("").is_empty() =>
                {
                    return Err(ConfigError::Missing("RELAY_API_KEY"));
                }
                TransportKind::Smtp => {
                    let smtp = &self.transport.smtp;
                    if smtp.host.trim().is_empty() {
                        return Err(ConfigError::Missing("SMTP_HOST"));
                    }
                    if smtp.user.as_deref().unwrap_or("").is_empty() {
                        return Err(ConfigError::Missing("SMTP_USER"));
                    }
                    if smtp.password.as_deref().unwrap_or("").is_empty() {
                        return Err(ConfigError::Missing("SMTP_PASSWORD"));
                    }
                }
                _ => {}
            }
            match self.transport.from_email.as_deref() {
                None | Some("") => return Err(ConfigError::Missing("FROM_EMAIL")),
                Some(addr) if !addr.contains('@') => {
                    return Err(ConfigError::Invalid(format!(
                        "FROM_EMAIL {addr:?} is not an address"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Load configuration from an optional YAML file, overlay the process
/// environment and validate the result.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut cfg = match path {
        Some(p) => {
            let content = fs::read_to_string(p)?;
            serde_yaml::from_str(&content)?
        }
        None => Config::default(),
    };
    cfg.apply_env(|k| std::env::var(k).ok())?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Stage-independent sanity checks.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.database.host.trim().is_empty() {
        return Err(ConfigError::Invalid("database.host must be non-empty".into()));
    }
    if cfg.database.name.trim().is_empty() {
        return Err(ConfigError::Invalid("database.name must be non-empty".into()));
    }
    if cfg.queue.batch_size == 0 {
        return Err(ConfigError::Invalid("queue.batch_size must be > 0".into()));
    }
    if cfg.queue.send_limit == 0 {
        return Err(ConfigError::Invalid("queue.send_limit must be > 0".into()));
    }
    if Duration::try_from_secs_f64(cfg.queue.throttle_seconds).is_err() {
        return Err(ConfigError::Invalid(format!(
            "queue.throttle_seconds must be a non-negative number of seconds, got {}",
            cfg.queue.throttle_seconds
        )));
    }
    if cfg.transport.timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "transport.timeout_seconds must be > 0".into(),
        ));
    }
    Ok(())
}

/// Example YAML printed by `outreach-pipeline config-example`.
pub fn example() -> &'static str {
    r#"database:
  host: "127.0.0.1"
  port: 5432
  name: "commercial_ai"
  user: "outreach"
  # password is read from PGPASSWORD

queue:
  batch_size: 10
  send_limit: 10
  throttle_seconds: 25
  note_filter: "google domains (AU mix)"

draft:
  template_path: "templates/outreach.txt"
  default_subject: "Exploring AI-driven workflow automation"
  actor: "outreach-drafter"

transport:
  kind: http_relay
  base_url: "https://api.brevo.com/"
  # used when kind is smtp; password is read from SMTP_PASSWORD
  smtp:
    host: "smtp-relay.brevo.com"
    port: 587
    security: start_tls
    user: "smtp-login@example.com"
  timeout_seconds: 45
  from_email: "sender@example.com"
  from_name: "Outreach"
  reply_to: "replies@example.com"
"#
}
