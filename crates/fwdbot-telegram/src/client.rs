//! HTTP client construction.
//!
//! All outbound Telegram calls share one reqwest client per process; when
//! the proxy is enabled every bot (manager and tenants alike) transits it.

use std::time::Duration;

use fwdbot_core::{config::ProxyConfig, Error, Result};

/// The request timeout must exceed the long-poll hold time so get_updates
/// calls are not cut short by the client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(35);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_client(proxy: &ProxyConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT);

    if proxy.enabled {
        let mut p = reqwest::Proxy::all(&proxy.url)
            .map_err(|e| Error::Config(format!("invalid proxy URL {}: {e}", proxy.url)))?;
        if let Some(username) = &proxy.username {
            p = p.basic_auth(username, proxy.password.as_deref().unwrap_or(""));
        }
        builder = builder.proxy(p);
        tracing::info!(proxy_url = %proxy.url, "proxy enabled for outbound Telegram calls");
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}
