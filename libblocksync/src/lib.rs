mod blocklist;
mod error;
mod http;
mod mastodon;
pub mod memory;
mod planner;
mod ratelimit;
mod retry;
mod runner;
mod source;
mod types;

pub use blocklist::{fetch_remote_state, list_blocked, BlocklistApi, Page, PageCursor};
pub use error::{ErrorKind, SyncError};
pub use http::create_http_client;
pub use mastodon::{next_link, MastodonClient};
pub use planner::plan;
pub use ratelimit::{parse_rate_headers, RateBudget, RateHeaders, RateLimiter};
pub use retry::RetryPolicy;
pub use runner::Syncer;
pub use source::{fetch_domain_list, parse_domain_list, DomainSource, HttpDomainSource};
pub use types::{
    ActionKind, BlockEntry, CreateOptions, DisposableDomain, DomainAction, DomainFailure,
    DomainSet, Operation, RateLimitConfig, RetryConfig, SourceList, SyncConfig, SyncOptions,
    SyncPlan, SyncSummary, DEFAULT_DOMAINS_URL,
};

/// Syncs the configured source list into the configured Mastodon server.
pub async fn sync(config: &SyncConfig) -> Result<SyncSummary, SyncError> {
    let client = create_http_client(config.timeout)?;
    let source = HttpDomainSource::new(client.clone(), config.source_url.clone());
    let api = MastodonClient::with_client(client, config)?;
    Syncer::new(source, api, config.options.clone()).run().await
}
