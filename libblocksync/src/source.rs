use crate::{
    error::SyncError,
    types::{DisposableDomain, SourceList},
};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

/// Where the desired set of blocked domains comes from.
#[async_trait]
pub trait DomainSource: Send + Sync {
    async fn fetch(&self) -> Result<SourceList, SyncError>;
}

/// Plaintext list served over HTTP, one domain per line.
pub struct HttpDomainSource {
    client: Client,
    url: String,
}

impl HttpDomainSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DomainSource for HttpDomainSource {
    async fn fetch(&self) -> Result<SourceList, SyncError> {
        fetch_domain_list(&self.client, &self.url).await
    }
}

pub async fn fetch_domain_list(client: &Client, url: &str) -> Result<SourceList, SyncError> {
    info!(url, "Fetching disposable domain list");

    let unavailable = |e: reqwest::Error| SyncError::SourceUnavailable {
        url: url.to_string(),
        reason: e.to_string(),
    };

    let body = client
        .get(url)
        .send()
        .await
        .map_err(unavailable)?
        .error_for_status()
        .map_err(unavailable)?
        .bytes()
        .await
        .map_err(unavailable)?;

    let text = String::from_utf8(body.to_vec())
        .map_err(|e| SyncError::SourceFormat(format!("response is not UTF-8: {}", e)))?;

    let list = parse_domain_list(&text)?;
    info!(
        domains = list.domains.len(),
        skipped = list.skipped,
        "Fetched disposable domain list"
    );
    Ok(list)
}

pub fn parse_domain_list(text: &str) -> Result<SourceList, SyncError> {
    let mut list = SourceList::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match DisposableDomain::parse(line) {
            Ok(domain) => {
                list.domains.insert(domain);
            }
            Err(e) => {
                debug!("Skipping source line: {}", e);
                list.skipped += 1;
            }
        }
    }

    // An empty upstream must never turn into "unblock everything".
    if list.domains.is_empty() {
        return Err(SyncError::SourceFormat(format!(
            "no valid domains found ({} lines skipped)",
            list.skipped
        )));
    }

    Ok(list)
}
