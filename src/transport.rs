//! Transport: a single GET of a JSON document.

use crate::error::ErddapError;
use crate::metrics::TRANSPORT_REQUESTS;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Transport trait.
///
/// Defines the contract for fetching one URL. Implementations do no caching and no
/// deduplication; those are layered on top by [crate::fetcher::Fetcher].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a URL and parse the body as JSON.
    ///
    /// # Arguments
    ///
    /// * `url`: URL to fetch
    /// * `timeout`: Maximum time to wait for the complete response
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Value, ErddapError>;
}

/// HTTP transport.
///
/// Implements [Transport] with a shared [reqwest::Client].
#[derive(Debug)]
pub struct HttpTransport {
    reqwest_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new() -> Self {
        Self {
            reqwest_client: reqwest::Client::new(),
        }
    }

    async fn get(&self, url: &str) -> Result<Value, ErddapError> {
        let response = match self.reqwest_client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                return Err(ErddapError::Network {
                    url: url.to_string(),
                    error: e.to_string(),
                })
            }
        };
        if !response.status().is_success() {
            return Err(ErddapError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let body = response.bytes().await.map_err(|e| ErddapError::Network {
            url: url.to_string(),
            error: e.to_string(),
        })?;
        serde_json::from_slice(&body).map_err(|e| ErddapError::InvalidResponse {
            url: url.to_string(),
            error: e.to_string(),
        })
    }
}

impl Default for HttpTransport {
    /// Create a default HTTP transport.
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Value, ErddapError> {
        let result = match tokio::time::timeout(timeout, self.get(url)).await {
            Ok(result) => result,
            Err(_) => Err(ErddapError::Timeout {
                url: url.to_string(),
            }),
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(ErddapError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        TRANSPORT_REQUESTS.with_label_values(&[outcome]).inc();
        result
    }
}
