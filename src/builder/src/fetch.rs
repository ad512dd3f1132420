//! Remote ADD sources.
//!
//! A source is remote when it starts with `http://` or `https://`. The
//! fetched body is treated as a single file named after the last path
//! segment of the URL.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use strata_core::config::NetworkConfig;
use strata_core::error::{BuildError, Result};

use crate::digest::sha256_bytes;

/// Permission bits given to files fetched from a URL.
pub const REMOTE_FILE_MODE: u32 = 0o600;

/// Whether an ADD source names a remote URL.
pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// File name a URL is saved under: the last non-empty path segment,
/// ignoring query and fragment.
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let name = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?
        .to_string();
    Some(name)
}

/// Body and identity of a fetched URL.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    pub bytes: Vec<u8>,
    /// SHA-256 of `bytes`
    pub digest: String,
    pub file_name: Option<String>,
}

impl Fetched {
    pub fn new(url: &str, bytes: Vec<u8>) -> Self {
        Self {
            url: url.to_string(),
            digest: sha256_bytes(&bytes),
            file_name: url_file_name(url),
            bytes,
        }
    }
}

/// Retrieves remote ADD sources.
///
/// Failures are reported as [`BuildError::Network`] and are not retried.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched>;
}

/// HTTP GET fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a client from explicit network settings.
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());

        if let Some(ref proxy) = config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|e| {
                BuildError::Config(format!("Invalid proxy URL {}: {}", proxy, e))
            })?;
            builder = builder.proxy(proxy);
        }

        if let Some(secs) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }

        let client = builder
            .build()
            .map_err(|e| BuildError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        tracing::debug!(url, "Fetching remote source");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BuildError::Network {
                url: url.to_string(),
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BuildError::Network {
                url: url.to_string(),
                status: Some(status.as_u16()),
                message: format!("unexpected status {}", status),
            });
        }

        let bytes = response.bytes().await.map_err(|e| BuildError::Network {
            url: url.to_string(),
            status: Some(status.as_u16()),
            message: e.to_string(),
        })?;

        tracing::debug!(url, size = bytes.len(), "Fetched remote source");
        Ok(Fetched::new(url, bytes.to_vec()))
    }
}

/// Fixed URL → body table, for offline builds and tests.
#[derive(Default)]
pub struct StaticFetcher {
    bodies: DashMap<String, Vec<u8>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.bodies.insert(url.into(), body.into());
    }

    pub fn remove(&self, url: &str) {
        self.bodies.remove(url);
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        match self.bodies.get(url) {
            Some(body) => Ok(Fetched::new(url, body.value().clone())),
            None => Err(BuildError::Network {
                url: url.to_string(),
                status: Some(404),
                message: "unexpected status 404 Not Found".to_string(),
            }),
        }
    }
}
