use crate::error::SyncError;
use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("blocksync/", env!("CARGO_PKG_VERSION"));

pub fn create_http_client(timeout: Duration) -> Result<Client, SyncError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .user_agent(USER_AGENT)
        .use_rustls_tls()
        .build()
        .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))
}
