//! HTTP access to package registries

use crate::error::{Result, VendorError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Downloads a file, optionally authenticating with a bearer token
    async fn fetch_bytes(&self, url: &str, bearer: Option<&str>) -> Result<Vec<u8>>;

    /// Fetches and parses a JSON document
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vendorbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VendorError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str, bearer: Option<&str>) -> Result<reqwest::Response> {
        debug!(url, "Downloading");
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            warn!(url, error = %e, "Download failed");
            VendorError::Fetch(format!("Failed to download {}", url))
        })?;

        classify_status(url, response.status())?;
        Ok(response)
    }
}

fn classify_status(url: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(VendorError::InvalidRepoStructure(format!(
            "The artifact at {} does not exist",
            url
        )));
    }
    Err(VendorError::Fetch(format!(
        "Downloading {} failed with HTTP {}",
        url,
        status.as_u16()
    )))
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str, bearer: Option<&str>) -> Result<Vec<u8>> {
        let response = self.get(url, bearer).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|_| VendorError::Fetch(format!("Failed to read the body of {}", url)))?;
        Ok(bytes.to_vec())
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self.get(url, None).await?;
        response
            .json()
            .await
            .map_err(|_| VendorError::Fetch(format!("Invalid JSON returned by {}", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status("u", StatusCode::OK).is_ok());
        assert!(matches!(
            classify_status("u", StatusCode::NOT_FOUND),
            Err(VendorError::InvalidRepoStructure(_))
        ));
        let err = classify_status("u", StatusCode::BAD_GATEWAY).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_client_builds() {
        assert!(HttpFetcher::new(Duration::from_secs(5)).is_ok());
    }
}
