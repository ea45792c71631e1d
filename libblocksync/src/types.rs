use crate::error::{ErrorKind, SyncError};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::{collections::BTreeSet, fmt, num::NonZeroU32, time::Duration};

pub const DEFAULT_DOMAINS_URL: &str = "https://raw.githubusercontent.com/disposable-email-domains/disposable-email-domains/master/disposable_email_blocklist.conf";

/// A normalized email domain: lowercase, trimmed, no trailing dot and no
/// `*.` wildcard prefix. Always contains at least one `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DisposableDomain(String);

impl DisposableDomain {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let lower = raw.trim().to_lowercase();
        let domain = lower.strip_prefix("*.").unwrap_or(&lower);
        let domain = domain.strip_suffix('.').unwrap_or(domain);

        let invalid = |why: &str| SyncError::InvalidDomain {
            domain: raw.trim().to_string(),
            reason: why.to_string(),
        };

        if domain.is_empty() {
            return Err(invalid("empty"));
        }
        if domain.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        if domain.contains('/') || domain.contains('@') {
            return Err(invalid("not a bare domain"));
        }
        if !domain.contains('.') {
            return Err(invalid("missing a dot"));
        }
        if domain.split('.').any(str::is_empty) {
            return Err(invalid("empty label"));
        }

        Ok(Self(domain.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisposableDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DisposableDomain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for DisposableDomain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Sorted so that every pass over a set is deterministic.
pub type DomainSet = BTreeSet<DisposableDomain>;

/// A parsed source list plus the number of lines that were rejected.
#[derive(Debug, Clone, Default)]
pub struct SourceList {
    pub domains: DomainSet,
    pub skipped: usize,
}

/// A record in the remote email domain blocklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockEntry {
    pub id: String,
    pub domain: DisposableDomain,
    pub created_at: Option<DateTime<Utc>>,
}

/// Extra fields sent along with a newly created block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateOptions {
    /// Require moderator approval for sign-ups instead of rejecting them.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_with_approval: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub to_add: DomainSet,
    pub to_remove: Vec<BlockEntry>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Added,
    WouldAdd,
    AlreadyBlocked,
    Removed,
    WouldRemove,
    AlreadyRemoved,
    Failed,
}

/// What happened to a single domain during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainAction {
    pub domain: DisposableDomain,
    pub action: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

/// The change that was being applied when a domain failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainFailure {
    pub domain: DisposableDomain,
    pub operation: Operation,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub dry_run: bool,
    pub source_domains: usize,
    pub remote_entries: usize,
    pub added: usize,
    pub already_blocked: usize,
    pub removed: usize,
    pub skipped: usize,
    pub errors: Vec<DomainFailure>,
    #[serde(skip)]
    pub actions: Vec<DomainAction>,
}

impl SyncSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failed(&self, operation: Operation) -> usize {
        self.errors.iter().filter(|f| f.operation == operation).count()
    }

    pub(crate) fn record(&mut self, domain: &DisposableDomain, action: ActionKind) {
        self.actions.push(DomainAction {
            domain: domain.clone(),
            action,
            error: None,
        });
    }

    pub(crate) fn record_failure(
        &mut self,
        domain: &DisposableDomain,
        operation: Operation,
        err: &SyncError,
    ) {
        self.actions.push(DomainAction {
            domain: domain.clone(),
            action: ActionKind::Failed,
            error: Some(err.kind()),
        });
        self.errors.push(DomainFailure {
            domain: domain.clone(),
            operation,
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Budget assumed until the server reports its own.
    pub default_limit: u32,
    /// How long an exhausted budget without reset information stays exhausted.
    pub fallback_window: Duration,
    /// Optional steady pacing on top of the header-driven budget.
    pub requests_per_second: Option<NonZeroU32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: 300,
            fallback_window: Duration::from_secs(300),
            requests_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub allow_removal: bool,
    pub create: CreateOptions,
}

#[derive(Clone)]
pub struct SyncConfig {
    pub host: String,
    pub token: String,
    pub source_url: String,
    pub options: SyncOptions,
    pub timeout: Duration,
    pub page_size: u32,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
}

impl SyncConfig {
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
            source_url: DEFAULT_DOMAINS_URL.to_string(),
            options: SyncOptions::default(),
            timeout: Duration::from_secs(30),
            page_size: 200,
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("host", &self.host)
            .field("token", &"<redacted>")
            .field("source_url", &self.source_url)
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .field("page_size", &self.page_size)
            .field("retry", &self.retry)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}
