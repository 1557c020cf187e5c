//! Conditional feed fetching.
//!
//! One fetch is a conditional GET (If-None-Match / If-Modified-Since from
//! the source's stored validators) with at most one manually-followed
//! redirect. Cloudflare challenge responses are detected and retried through
//! the proxy pool; sources already known to sit behind Cloudflare skip the
//! direct attempt entirely.

use futures::StreamExt;
use reqwest::{header, redirect, Client, Proxy, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::poll::proxy_pool::ProxyPool;
use crate::storage::Source;

/// Status codes a Cloudflare challenge can arrive with.
const CHALLENGE_STATUSES: [u16; 3] = [403, 429, 503];

/// Body signatures of a Cloudflare challenge page. Deliberately conservative:
/// a plain 403 without any of these stays an HTTP error.
const CHALLENGE_MARKERS: [&str; 4] = [
    "Just a moment",
    "cf-browser-verification",
    "cf-chl",
    "Attention Required! | Cloudflare",
];

/// Errors that can occur during a feed fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the configured deadline
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with a non-2xx status; terminal for this poll
    #[error("HTTP error: status {0}")]
    Http(u16),
    /// Cloudflare challenge detected and no proxies are configured
    #[error("Cloudflare challenge and no proxy candidates available")]
    CloudflareBlocked,
    /// Cloudflare challenge detected and every proxy candidate failed
    #[error("Cloudflare challenge and all proxy candidates failed")]
    ProxyExhausted,
    /// Response body exceeded the configured size cap
    #[error("Response too large")]
    BodyTooLarge,
    /// More than one redirect hop in a single poll
    #[error("Too many redirects")]
    TooManyRedirects,
    /// Redirect without a usable Location header
    #[error("Invalid redirect: {0}")]
    BadRedirect(String),
}

impl FetchError {
    /// The HTTP status to record on the source, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Http(status) => Some(*status),
            _ => None,
        }
    }
}

/// Result of a successful fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 304: the stored validators still hold; nothing to parse.
    NotModified { status: u16 },
    Fetched(FetchedFeed),
}

#[derive(Debug)]
pub struct FetchedFeed {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub body: Vec<u8>,
    /// True when the winning request went through a proxy candidate.
    pub via_proxy: bool,
    /// Final redirect target, when the poll was redirected.
    pub redirected_to: Option<String>,
}

pub struct Fetcher {
    client: Client,
    user_agent: String,
    timeout: Duration,
    max_body_bytes: usize,
}

impl Fetcher {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = Self::builder(&config.user_agent).build()?;
        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Redirects are never followed automatically: the engine records and
    /// follows them itself, one hop per poll.
    fn builder(user_agent: &str) -> reqwest::ClientBuilder {
        Client::builder()
            .user_agent(user_agent)
            .redirect(redirect::Policy::none())
    }

    fn proxied_client(&self, address: &str) -> Result<Client, FetchError> {
        let client = Self::builder(&self.user_agent)
            .proxy(Proxy::all(address)?)
            .build()?;
        Ok(client)
    }

    /// Fetch a source's feed, routing through the proxy pool when Cloudflare
    /// gets in the way.
    pub async fn fetch(
        &self,
        source: &Source,
        proxies: &ProxyPool,
    ) -> Result<FetchOutcome, FetchError> {
        if source.is_cloudflare {
            // Known-blocked host: don't waste the direct attempt
            return self.fetch_via_proxies(source, proxies).await;
        }

        match self.attempt(&self.client, source).await {
            Err(FetchError::CloudflareBlocked) => {
                tracing::info!(
                    source = %source.feed_url,
                    "Cloudflare challenge detected, rotating through proxies"
                );
                self.fetch_via_proxies(source, proxies).await
            }
            other => other,
        }
    }

    async fn fetch_via_proxies(
        &self,
        source: &Source,
        proxies: &ProxyPool,
    ) -> Result<FetchOutcome, FetchError> {
        let candidates = proxies.candidates();
        if candidates.is_empty() {
            return Err(FetchError::CloudflareBlocked);
        }

        for address in candidates {
            let client = match self.proxied_client(&address) {
                Ok(client) => client,
                Err(err) => {
                    tracing::warn!(proxy = %address, error = %err, "Unusable proxy address");
                    proxies.record_failure(&address);
                    continue;
                }
            };

            match self.attempt(&client, source).await {
                Ok(outcome) => {
                    proxies.record_success(&address);
                    return Ok(mark_via_proxy(outcome));
                }
                Err(err) => {
                    tracing::debug!(
                        source = %source.feed_url,
                        proxy = %address,
                        error = %err,
                        "Proxy attempt failed"
                    );
                    proxies.record_failure(&address);
                }
            }
        }

        Err(FetchError::ProxyExhausted)
    }

    /// One conditional GET against the source's feed URL, following at most
    /// one redirect.
    async fn attempt(&self, client: &Client, source: &Source) -> Result<FetchOutcome, FetchError> {
        let mut url = source.feed_url.clone();
        let mut redirected_to: Option<String> = None;

        loop {
            let mut request = client.get(&url);
            if let Some(etag) = source.etag.as_deref() {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = source.last_modified.as_deref() {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
            }

            let response = tokio::time::timeout(self.timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            let status = response.status();
            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::NotModified { status: status.as_u16() });
            }

            if status.is_redirection() {
                if redirected_to.is_some() {
                    return Err(FetchError::TooManyRedirects);
                }
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| FetchError::BadRedirect("missing Location header".into()))?;
                let base =
                    Url::parse(&url).map_err(|e| FetchError::BadRedirect(e.to_string()))?;
                let target = base
                    .join(location)
                    .map_err(|e| FetchError::BadRedirect(e.to_string()))?;
                tracing::debug!(source = %source.feed_url, target = %target, "Following redirect");
                url = target.to_string();
                redirected_to = Some(url.clone());
                continue;
            }

            let status_code = status.as_u16();
            if !status.is_success() {
                if CHALLENGE_STATUSES.contains(&status_code) {
                    let server_is_cloudflare = response
                        .headers()
                        .get(header::SERVER)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_ascii_lowercase().contains("cloudflare"))
                        .unwrap_or(false);
                    let body = self.read_limited(response).await.unwrap_or_default();
                    if server_is_cloudflare || body_has_challenge_marker(&body) {
                        return Err(FetchError::CloudflareBlocked);
                    }
                }
                return Err(FetchError::Http(status_code));
            }

            let etag = header_string(&response, header::ETAG);
            let last_modified = header_string(&response, header::LAST_MODIFIED);
            let body = tokio::time::timeout(self.timeout, self.read_limited(response))
                .await
                .map_err(|_| FetchError::Timeout)??;

            return Ok(FetchOutcome::Fetched(FetchedFeed {
                status: status_code,
                etag,
                last_modified,
                body,
                via_proxy: false,
                redirected_to,
            }));
        }
    }

    /// Read a response body, enforcing the size cap as the stream arrives
    /// rather than after buffering everything.
    async fn read_limited(&self, response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        // Fast path: check Content-Length header
        if let Some(len) = response.content_length() {
            if len as usize > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge);
            }
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FetchError::Network)?;
            if bytes.len().saturating_add(chunk.len()) > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(bytes)
    }
}

fn mark_via_proxy(outcome: FetchOutcome) -> FetchOutcome {
    match outcome {
        FetchOutcome::Fetched(feed) => FetchOutcome::Fetched(FetchedFeed {
            via_proxy: true,
            ..feed
        }),
        not_modified => not_modified,
    }
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn body_has_challenge_marker(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    CHALLENGE_MARKERS.iter().any(|marker| text.contains(marker))
}
