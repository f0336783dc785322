//! HTTP fetching with bounded retries and SSRF protection.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, error, warn};
use url::Url;

use runbook_shared::{Result, RunbookError, ScraperConfig};

/// Outcome of one fetch attempt.
enum Attempt {
    Done(Url, String),
    Retry(RunbookError),
    Fail(RunbookError),
}

/// Build the shared HTTP client.
pub(crate) fn build_client(config: &ScraperConfig) -> Result<Client> {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| RunbookError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fetch `url`, retrying transient failures up to `attempts` times in total.
///
/// Returns the final URL after redirects and the response body.
pub(crate) async fn fetch_html(
    client: &Client,
    url: &Url,
    attempts: u32,
    backoff: Duration,
) -> Result<(Url, String)> {
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match fetch_once(client, url).await {
            Attempt::Done(final_url, body) => return Ok((final_url, body)),
            Attempt::Retry(e) if attempt < attempts => {
                warn!(%url, attempt, error = %e, "fetch failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
            }
            Attempt::Retry(e) | Attempt::Fail(e) => {
                error!(%url, attempt, error = %e, "giving up on fetch");
                return Err(e);
            }
        }
    }
}

async fn fetch_once(client: &Client, url: &Url) -> Attempt {
    debug!(%url, "fetching page");

    let response = match client.get(url.as_str()).send().await {
        Ok(response) => response,
        Err(e) => return Attempt::Retry(RunbookError::Network(format!("{url}: {e}"))),
    };

    let status = response.status();
    if !status.is_success() {
        let err = RunbookError::Network(format!("{url}: HTTP {status}"));
        return if is_transient(status) {
            Attempt::Retry(err)
        } else {
            Attempt::Fail(err)
        };
    }

    let final_url = response.url().clone();
    match response.text().await {
        Ok(body) => Attempt::Done(final_url, body),
        Err(e) => Attempt::Retry(RunbookError::Network(format!(
            "{url}: body read failed: {e}"
        ))),
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
