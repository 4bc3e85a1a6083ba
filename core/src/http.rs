//! Shared async HTTP client used by `Provider` implementations and by the
//! readiness verifier's HTTP probe.

use anyhow::{anyhow, Context, Result};
use isahc::http::{Error as HttpError, Uri};
use isahc::prelude::{Configurable, Request};
use isahc::{HttpClientBuilder, ResponseExt};
use serde::de::DeserializeOwned;
use std::convert::TryFrom;
use std::time::Duration;

/// A factory type for creating HTTP clients with a shared default timeout.
#[derive(Debug)]
pub struct HttpFactory {
    default_timeout: Duration,
}

impl HttpFactory {
    /// Creates a new HTTP client factory.
    pub fn new(default_timeout: Duration) -> Self {
        HttpFactory { default_timeout }
    }

    /// Creates a new HTTP client with the default configuration.
    pub fn create(&self) -> Result<HttpClient> {
        self.with_config(|builder| builder.timeout(self.default_timeout))
    }

    /// Creates a new HTTP client with the given configuration.
    pub fn with_config(
        &self,
        configure: impl FnOnce(HttpClientBuilder) -> HttpClientBuilder,
    ) -> Result<HttpClient> {
        let inner = configure(isahc::HttpClient::builder()).build()?;
        Ok(HttpClient { inner })
    }
}

impl Default for HttpFactory {
    fn default() -> Self {
        HttpFactory::new(Duration::from_secs(10))
    }
}

/// An HTTP client instance.
#[derive(Debug)]
pub struct HttpClient {
    inner: isahc::HttpClient,
}

impl HttpClient {
    /// Post raw JSON data and return a future that resolves once the HTTP
    /// request has been completed.
    pub async fn post_raw_json_async<U>(&self, url: U, data: impl Into<String>) -> Result<String>
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<HttpError>,
    {
        let http_request = Request::post(url)
            .header("Content-Type", "application/json")
            .body(data.into())?;
        let mut response = self.inner.send_async(http_request).await?;
        let content = response.text()?;

        if response.status().is_success() {
            Ok(content)
        } else {
            Err(anyhow!(
                "HTTP error status {}: '{}'",
                response.status(),
                content.trim()
            ))
        }
    }

    /// Standard HTTP GET request that parses the result as JSON.
    pub async fn get_json_async<U, T>(&self, url: U) -> Result<T>
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<HttpError>,
        T: DeserializeOwned,
    {
        let json = self.inner.get_async(url).await?.text()?;
        serde_json::from_str(&json).with_context(|| format!("failed to parse JSON '{}'", json))
    }

    /// GET that parses a 2xx body as JSON, treats 404 as `Ok(None)`, and
    /// errors on any other status. Used wherever "not found" is a
    /// meaningful outcome rather than a transport failure, e.g. polling an
    /// upstream instance that may have already been destroyed.
    pub async fn get_json_or_not_found_async<U, T>(&self, url: U) -> Result<Option<T>>
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<HttpError>,
        T: DeserializeOwned,
    {
        let mut response = self.inner.get_async(url).await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        let content = response.text()?;
        if !status.is_success() {
            return Err(anyhow!("HTTP error status {}: '{}'", status, content.trim()));
        }
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse JSON '{}'", content))
            .map(Some)
    }

    /// Issues a bare GET and reports whether the instance should be treated
    /// as alive: any 2xx status, or 404 (the readiness endpoint may not
    /// exist yet but the workload process is up and answering).
    pub async fn probe_alive<U>(&self, url: U) -> Result<bool>
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<HttpError>,
    {
        let response = self.inner.get_async(url).await?;
        let status = response.status();
        Ok(status.is_success() || status.as_u16() == 404)
    }

    /// Issues a DELETE, succeeding on any 2xx status or 404 (already gone
    /// counts as destroyed).
    pub async fn delete_async<U>(&self, url: U) -> Result<()>
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<HttpError>,
    {
        let http_request = Request::delete(url).body(())?;
        let response = self.inner.send_async(http_request).await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(anyhow!("HTTP error status {} on DELETE", status))
        }
    }
}
