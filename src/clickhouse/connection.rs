// ABOUTME: ClickHouse HTTP connection utilities
// ABOUTME: Builds the HTTP client, maps connection errors and retries the initial ping

use anyhow::{Context, Result};
use std::time::Duration;

use super::ClickHouseEndpoint;
use crate::checkpoint::FailureKind;
use crate::config::EndpointConfig;
use crate::endpoint::DatabaseEndpoint;
use crate::utils;

/// TCP keepalive interval for pooled HTTP connections
///
/// Long batch exports leave connections idle between requests; keepalives stop
/// load balancers from silently dropping them.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the HTTP client used by one endpoint
pub(crate) fn build_http_client(config: &EndpointConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .tcp_keepalive(TCP_KEEPALIVE)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(config.timeout())
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .context("Failed to build HTTP client")
}

/// Turn a transport-level HTTP error into a helpful message
///
/// Every error produced here is tagged `EndpointUnreachable`.
pub(crate) fn describe_request_error(label: &str, err: reqwest::Error) -> anyhow::Error {
    let message = if err.is_connect() {
        format!(
            "Connection refused: Unable to reach {} endpoint.\n\
             Please check:\n\
             - The host and port are correct\n\
             - The ClickHouse server is running with the HTTP interface enabled\n\
             - Firewall rules allow connections\n\
             Error: {}",
            label, err
        )
    } else if err.is_timeout() {
        format!(
            "Request timeout: {} endpoint did not respond in time.\n\
             This could indicate network issues or server overload.\n\
             Error: {}",
            label, err
        )
    } else {
        format!("Request to {} endpoint failed: {}", label, err)
    };
    anyhow::anyhow!(message).context(FailureKind::EndpointUnreachable)
}

/// Explain a ClickHouse error body
pub(crate) fn describe_server_error(label: &str, status: u16, body: &str) -> anyhow::Error {
    let body = body.trim();
    if status == 401 || status == 403 || body.contains("Code: 516.") {
        anyhow::anyhow!(
            "Authentication failed on {} endpoint: invalid user or password.\n\
             Please verify the configured credentials.\n\
             Server said: {}",
            label,
            body
        )
    } else if status >= 500 && body.is_empty() {
        anyhow::anyhow!("{} endpoint returned HTTP {}", label, status)
            .context(FailureKind::EndpointUnreachable)
    } else {
        anyhow::anyhow!("{} endpoint returned HTTP {}: {}", label, status, body)
    }
}

/// Connect to a ClickHouse endpoint and verify it answers
///
/// # Errors
///
/// Returns an error if the URL is malformed or the server does not answer
/// the ping.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use clickhouse_seren_migrator::clickhouse::connect;
/// # use clickhouse_seren_migrator::config::EndpointConfig;
/// # async fn example() -> Result<()> {
/// let endpoint = connect(&EndpointConfig::new("http://localhost:8123"), "source").await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect(config: &EndpointConfig, label: &str) -> Result<ClickHouseEndpoint> {
    utils::validate_endpoint_url(&config.url)?;
    let endpoint = ClickHouseEndpoint::new(config, label)?;
    endpoint.ping().await?;
    tracing::info!("✓ Connected to {} endpoint", label);
    Ok(endpoint)
}

/// Connect with automatic retry for transient failures
///
/// Attempts to connect up to 4 times with exponential backoff (1s, 2s, 4s).
pub async fn connect_with_retry(config: &EndpointConfig, label: &str) -> Result<ClickHouseEndpoint> {
    utils::retry_with_backoff(|| connect(config, label), 3, Duration::from_secs(1))
        .await
        .with_context(|| format!("Failed to connect to {} endpoint after retries", label))
}
