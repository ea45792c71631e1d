use crate::{
    blocklist::{BlocklistApi, Page, PageCursor},
    error::SyncError,
    http::create_http_client,
    ratelimit::RateLimiter,
    retry::RetryPolicy,
    types::{BlockEntry, CreateOptions, DisposableDomain, SyncConfig},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{
    header::{HeaderMap, LINK},
    Client, Method, RequestBuilder, Response, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const BLOCKS_PATH: &str = "api/v1/admin/email_domain_blocks";

#[derive(Debug, Deserialize)]
struct RawBlockEntry {
    id: String,
    domain: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl RawBlockEntry {
    fn into_entry(self) -> Result<BlockEntry, SyncError> {
        Ok(BlockEntry {
            domain: DisposableDomain::parse(&self.domain)?,
            id: self.id,
            created_at: self.created_at,
        })
    }
}

#[derive(Serialize)]
struct CreateBody<'a> {
    domain: &'a str,
    #[serde(flatten)]
    options: &'a CreateOptions,
}

/// Mastodon admin API client for email domain blocks.
pub struct MastodonClient {
    client: Client,
    base: Url,
    token: String,
    page_size: u32,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl MastodonClient {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = create_http_client(config.timeout)?;
        Self::with_client(client, config)
    }

    pub fn with_client(client: Client, config: &SyncConfig) -> Result<Self, SyncError> {
        if config.token.trim().is_empty() {
            return Err(SyncError::Config("API token is empty".to_string()));
        }
        Ok(Self {
            client,
            base: parse_base_url(&config.host)?,
            token: config.token.clone(),
            page_size: config.page_size.clamp(1, 200),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn blocks_url(&self) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}{}", self.base.path(), BLOCKS_PATH));
        url
    }

    /// Pagination links carry the bearer token, so they must point back at
    /// the configured server.
    fn cursor_url(&self, next: &str) -> Result<Url, SyncError> {
        let url = Url::parse(next)
            .map_err(|e| SyncError::Remote(format!("invalid pagination link {:?}: {}", next, e)))?;
        let same_origin = url.scheme() == self.base.scheme()
            && url.host_str() == self.base.host_str()
            && url.port_or_known_default() == self.base.port_or_known_default();
        if !same_origin {
            return Err(SyncError::Remote(format!(
                "pagination link {:?} leaves {}",
                next,
                self.base.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.token)
    }

    /// Sends a request built fresh for each attempt, waiting on the rate
    /// limiter first and retrying transient failures.
    ///
    /// Returns every response that is neither an auth failure, a 429 nor a
    /// 5xx; callers interpret the remaining statuses.
    async fn execute<F>(&self, what: &str, build: F) -> Result<Response, SyncError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.before_request().await;

            let response = match build().send().await {
                Ok(response) => response,
                Err(e) => {
                    if !self.retry.should_retry(attempt) {
                        return Err(SyncError::Remote(format!("{}: {}", what, e)));
                    }
                    self.limiter.apply(None);
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, ?delay, "{} failed, retrying: {}", what, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let reported = self.limiter.after_response(response.headers());
            let status = response.status();
            debug!(attempt, status = status.as_u16(), "{}", what);

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SyncError::Auth {
                    status: status.as_u16(),
                });
            }

            let transient = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if !transient {
                return Ok(response);
            }
            if !self.retry.should_retry(attempt) {
                return Err(SyncError::Remote(format!(
                    "{}: HTTP {} after {} attempts",
                    what,
                    status.as_u16(),
                    attempt
                )));
            }

            let reset_after = reported
                .and_then(|r| r.reset_after)
                .filter(|_| status == StatusCode::TOO_MANY_REQUESTS);
            if let Some(reset_after) = reset_after {
                // the next before_request sleeps until the advertised reset
                self.limiter.mark_exhausted();
                warn!(attempt, ?reset_after, "{} rate limited, waiting for reset", what);
            } else {
                let delay = self.retry.backoff(attempt);
                warn!(attempt, ?delay, status = status.as_u16(), "{} failed, retrying", what);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[async_trait]
impl BlocklistApi for MastodonClient {
    async fn list_page(&self, cursor: Option<PageCursor>) -> Result<Page, SyncError> {
        let url = match cursor {
            Some(PageCursor(next)) => self.cursor_url(&next)?,
            None => {
                let mut url = self.blocks_url();
                url.query_pairs_mut()
                    .append_pair("limit", &self.page_size.to_string());
                url
            }
        };

        let response = self
            .execute("list email domain blocks", || self.request(Method::GET, url.clone()))
            .await?;
        let response = expect_success(response, "list email domain blocks").await?;

        let next = next_link(response.headers()).map(PageCursor);
        let raw: Vec<RawBlockEntry> = response
            .json()
            .await
            .map_err(|e| SyncError::Remote(format!("malformed block listing: {}", e)))?;

        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match item.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!("Ignoring remote block entry: {}", e),
            }
        }
        debug!(entries = entries.len(), has_next = next.is_some(), "Fetched block page");

        Ok(Page { entries, next })
    }

    async fn create(
        &self,
        domain: &DisposableDomain,
        options: &CreateOptions,
    ) -> Result<BlockEntry, SyncError> {
        let url = self.blocks_url();
        let body = CreateBody {
            domain: domain.as_str(),
            options,
        };
        let what = format!("block {}", domain);

        let response = self
            .execute(&what, || self.request(Method::POST, url.clone()).json(&body))
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(SyncError::AlreadyExists(domain.to_string()));
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            debug!(%domain, body = body.trim(), "Block rejected with 422");
            // Mastodon answers "Domain has already been taken" for duplicates
            if body.to_ascii_lowercase().contains("taken") {
                return Err(SyncError::AlreadyExists(domain.to_string()));
            }
            return Err(SyncError::Remote(format!(
                "{}: HTTP 422 {}",
                what,
                snippet(&body)
            )));
        }
        let response = expect_success(response, &what).await?;

        let raw: RawBlockEntry = response
            .json()
            .await
            .map_err(|e| SyncError::Remote(format!("malformed block entry: {}", e)))?;
        raw.into_entry()
    }

    async fn delete(&self, entry_id: &str) -> Result<(), SyncError> {
        let mut url = self.blocks_url();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("cannot build URL from {}", self.base)))?
            .push(entry_id);
        let what = format!("unblock entry {}", entry_id);

        let response = self
            .execute(&what, || self.request(Method::DELETE, url.clone()))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(entry_id.to_string()));
        }
        expect_success(response, &what).await?;
        Ok(())
    }
}

async fn expect_success(response: Response, what: &str) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Remote(format!(
        "{}: HTTP {} {}",
        what,
        status.as_u16(),
        snippet(&body)
    )))
}

fn snippet(body: &str) -> String {
    body.trim().chars().take(200).collect()
}

fn parse_base_url(host: &str) -> Result<Url, SyncError> {
    let trimmed = host.trim().trim_end_matches('/');
    let mut url = Url::parse(trimmed)
        .map_err(|e| SyncError::Config(format!("invalid host {:?}: {}", host, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::Config(format!(
            "host must be an http(s) URL, got {:?}",
            host
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    Ok(url)
}

/// Extracts the `rel="next"` target from a `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|link| {
            let mut parts = link.split(';');
            let target = parts.next()?.trim();
            let is_next = parts.any(|param| {
                let param = param.trim();
                param == "rel=\"next\"" || param == "rel=next"
            });
            let target = target.strip_prefix('<')?.strip_suffix('>')?;
            is_next.then(|| target.to_string())
        })
}
